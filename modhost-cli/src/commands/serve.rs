//! modhost serve - run the plugin host until interrupted

use anyhow::Result;
use clap::Args;
use modhost_core::PluginService;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ConfigLoader;

/// Arguments for the serve command
#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Plugin root directory (overrides config)
    #[arg(short, long)]
    pub root: Option<String>,

    /// Watch the plugin root for added, removed and renamed plugins
    #[arg(short, long)]
    pub watch: bool,

    /// Do not reload plugins when their library changes
    #[arg(long)]
    pub no_hot_reload: bool,
}

/// Run the serve command
pub async fn run(args: ServeArgs) -> Result<()> {
    let mut config = ConfigLoader::load()?;
    if let Some(root) = args.root {
        config.plugins.root_dir = root;
    }
    if args.watch {
        config.plugins.monitor_root_dir = true;
    }
    if args.no_hot_reload {
        config.plugins.hot_reload = false;
    }

    let shutdown = CancellationToken::new();
    let service = PluginService::builder(config.plugins_config())
        .registry(super::registry(&config).await)
        .shutdown(shutdown.clone())
        .build();

    service.start().await?;
    service.wait_for_initial_load().await;
    let plugins = service.plugins().len().await;
    info!(
        root = %service.config().root_dir().display(),
        plugins,
        state = %service.state(),
        "Plugin host ready, press Ctrl-C to stop"
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Could not listen for Ctrl-C, stopping");
    }
    shutdown.cancel();
    service.stop().await;
    Ok(())
}
