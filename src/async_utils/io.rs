//! I/O utilities.
//!
//! We write our batch results as JSONL, either to a file or to standard
//! output.

use futures::{Stream, pin_mut, stream::StreamExt as _};
use tokio::{
    fs::File,
    io::{AsyncWrite, AsyncWriteExt as _, BufWriter},
};

use crate::prelude::*;

/// Create an [`AsyncWrite`] for a file or stdout.
pub async fn create_writer(
    path: Option<&Path>,
) -> Result<Box<dyn AsyncWrite + Unpin + Send + Sync + 'static>> {
    match path {
        Some(path) => {
            let file = File::create(path)
                .await
                .with_context(|| format!("Failed to create file at path: {:?}", path))?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(tokio::io::stdout())),
    }
}

/// Write a stream of serializable records to either standard output or a
/// file, one JSON object per line.
pub async fn write_output<T, S>(path: Option<&Path>, stream: S) -> Result<()>
where
    T: Serialize,
    S: Stream<Item = Result<T>>,
{
    let mut writer = BufWriter::new(create_writer(path).await?);
    pin_mut!(stream);
    while let Some(record) = stream.next().await {
        let record = record?;
        let json = serde_json::to_string(&record)
            .context("Failed to serialize output record as JSON")?;
        writer
            .write_all(json.as_bytes())
            .await
            .context("Failed to write JSON to output")?;
        writer
            .write_all(b"\n")
            .await
            .context("Failed to write newline to output")?;
    }
    writer.flush().await.context("Failed to flush output")?;
    Ok(())
}
