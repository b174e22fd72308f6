//! The `serve` subcommand.

use std::net::{IpAddr, SocketAddr};

use clap::Args;

use crate::{config::PoolOpts, engines::EngineOpts, prelude::*, server};

/// Options for the `serve` subcommand.
#[derive(Args, Clone, Debug)]
pub struct ServeOpts {
    /// The address to listen on.
    #[clap(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: IpAddr,

    /// The port to listen on.
    #[clap(long, env = "PORT", default_value = "9000")]
    pub port: u16,

    #[clap(flatten)]
    pub pool_opts: PoolOpts,

    #[clap(flatten)]
    pub engine_opts: EngineOpts,
}

/// The `serve` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_serve(opts: &ServeOpts) -> Result<()> {
    // A missing engine isn't fatal for the server. We report it on `/health`
    // and to every upload instead.
    let (dispatcher, worker) =
        super::start_dispatcher(&opts.pool_opts, &opts.engine_opts, false).await?;
    info!(
        engine = %dispatcher.engine().name(),
        status = %dispatcher.engine().status(),
        workers = dispatcher.worker_count(),
        queue_capacity = dispatcher.queue_capacity(),
        "OCR pool started"
    );

    let addr = SocketAddr::new(opts.host, opts.port);
    server::serve(addr, dispatcher).await?;

    // The server has dropped its dispatcher, so our workers will finish any
    // queued jobs and exit.
    worker.join().await?;
    info!("Graceful shutdown complete");
    Ok(())
}
