use anyhow::{Context, Result};

use narval::{cli::config_path_from_args, config::ConfigStore, logging, node};

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = config_path_from_args()?;
    let store = ConfigStore::load_or_default(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    let node_config = narval::config::NodeConfig::resolve(&store.document());
    let _logging_guard = logging::init_tracing(&node_config.logging)?;

    node::run(store, node_config).await
}
