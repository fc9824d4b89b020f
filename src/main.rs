//! droid-sys command-line entry point

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use droid_sys::commands::Invocation;
use droid_sys::core::BridgeConfig;

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "droid-sys";

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so stdout stays machine readable
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!("{} v{} starting...", APP_NAME, VERSION);

    let args: Vec<String> = std::env::args().skip(1).collect();
    let invocation = Invocation::parse(&args)?;
    let config = load_config().await?;

    invocation.execute(config).await
}

/// Load the configuration file when present, the environment otherwise
async fn load_config() -> Result<BridgeConfig> {
    let path = BridgeConfig::default_path();
    let from_env = BridgeConfig::from_env();

    if !path.exists() {
        return Ok(from_env);
    }

    let mut config = BridgeConfig::load(&path).await?;
    if config.sdk_root.is_none() {
        config.sdk_root = from_env.sdk_root;
    }
    if config.debug_dump.is_none() {
        config.debug_dump = from_env.debug_dump;
    }
    Ok(config)
}
