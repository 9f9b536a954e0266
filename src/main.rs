use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);

    Registry::default().with(env_filter).with(fmt_layer).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let config = crab_server::Config::from_env();
    tracing::info!(?config, "loaded configuration");

    crab_server::run_server(config).await
}
