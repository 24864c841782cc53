mod app;

use desktop_api_client::config::Config;

#[tokio::main]
async fn main() {
    let config = Config::load();
    let filter = config
        .as_ref()
        .map(|config| config.logging.filter.as_str())
        .unwrap_or("info");
    init_logging(filter);

    let result = match config {
        Ok(config) => app::run(config).await,
        Err(err) => Err(err),
    };
    if let Err(err) = result {
        tracing::error!(error = %err, "fatal");
        std::process::exit(1);
    }
}

fn init_logging(fallback: &str) {
    use tracing_subscriber::{fmt, EnvFilter};
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_target(false).init();
}
