//! Command-line entry points.

use crate::{
    async_utils::JoinWorker,
    config::PoolOpts,
    engines::{EngineOpts, EngineStatus},
    prelude::*,
    queues::dispatcher::Dispatcher,
};

pub mod ocr;
pub mod serve;

/// Set up our engine and start a worker pool for it.
///
/// If `require_engine` is set, we fail when the engine isn't usable. Otherwise
/// we keep going, and every submission reports the engine as unavailable.
pub async fn start_dispatcher(
    pool_opts: &PoolOpts,
    engine_opts: &EngineOpts,
    require_engine: bool,
) -> Result<(Dispatcher, JoinWorker)> {
    let config = pool_opts.to_config()?;
    let engine = engine_opts.create_engine();
    let status = engine.initialize().await;
    if require_engine && status != EngineStatus::Ready {
        engine
            .check_ready()
            .with_context(|| format!("Cannot use {}", engine.name()))?;
    }
    Dispatcher::start(&config, engine)
}
