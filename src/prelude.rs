//! Standard APIs we use everywhere.

pub use std::{
    path::{Path, PathBuf},
    time::Duration,
};

pub use anyhow::{Context as _, Result, anyhow};
pub use serde::{Deserialize, Serialize};
pub use serde_json::Value;
#[allow(unused_imports)]
pub use tracing::{debug, error, info, instrument, trace, warn};
