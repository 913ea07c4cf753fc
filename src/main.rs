use std::path::PathBuf;

use sshbastion::config::{data_dir, ensure_dirs, load_config};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    sshbastion::init_logging();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| data_dir().join("config.json"));

    let config = match load_config(&config_path).await {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load config {:?}: {}", config_path, e);
            std::process::exit(1);
        }
    };
    if let Err(e) = ensure_dirs(&config).await {
        error!("Failed to create data directories: {}", e);
        std::process::exit(1);
    }

    info!("Starting sshbastion {}", env!("CARGO_PKG_VERSION"));
    if let Err(e) = sshbastion::run(config).await {
        error!("sshbastion stopped: {}", e);
        std::process::exit(1);
    }
}
