use tablesync::config::{ConfigError, ServerConfig, USAGE};
use tracing::Level;

fn usage_and_exit(err: Option<ConfigError>) -> ! {
    if let Some(e) = err {
        eprintln!("error: {e}\n");
    }
    eprintln!("{USAGE}");
    std::process::exit(2);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tablesync=info".into()),
        )
        .with_target(false)
        .with_max_level(Level::DEBUG)
        .init();

    let cfg = match ServerConfig::from_env_and_args() {
        Ok(cfg) => cfg,
        Err(ConfigError::Help) => usage_and_exit(None),
        Err(e) => usage_and_exit(Some(e)),
    };

    tablesync::bridge::run(cfg).await
}
