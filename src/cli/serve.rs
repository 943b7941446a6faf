//! `dagrun serve`: run the control server until interrupted

use anyhow::Result;

use crate::runner::Runner;
use crate::server;

pub async fn serve(runner: Runner, port: u16) -> Result<()> {
    server::start_http_server(runner.clone(), port)?;
    println!("dagrun control server on http://127.0.0.1:{port} (ctrl-c to stop)");

    tokio::signal::ctrl_c().await?;
    println!("Shutting down...");
    runner.shutdown().await;
    Ok(())
}
