pub mod bleu;
pub mod build;
pub mod config;
pub mod error;
pub mod evaluators;
pub mod job;
pub mod observer;
pub mod queue;
pub mod reference;
pub mod registry;
pub mod result_store;
pub mod transport;

pub use config::Config;
pub use error::{ServerError, ServerResult};
pub use transport::AppState;

/// Binds and serves the evaluation API on `config.port` until the process is
/// terminated.
pub async fn run_server(config: Config) -> anyhow::Result<()> {
    let port = config.port;
    let state = AppState::new(config)?;
    let app = transport::build_router(state);

    let addr = format!("0.0.0.0:{port}");
    tracing::info!(%addr, "starting crab-server");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
