//! modhost list - load every plugin once and show what it exports

use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use clap::Args;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use modhost_core::{ErrorSink, PluginHostError, PluginService};

use crate::config::ConfigLoader;

#[derive(Debug, Args)]
pub struct ListArgs {
    /// Plugin root directory (overrides config)
    #[arg(short, long)]
    pub root: Option<String>,
}

pub async fn run(args: ListArgs) -> Result<()> {
    let mut config = ConfigLoader::load()?;
    if let Some(root) = args.root {
        config.plugins.root_dir = root;
    }
    config.plugins.monitor_root_dir = false;
    config.plugins.monitor_registry = false;
    config.plugins.hot_reload = false;
    config.executor.max_retries = 0;

    let failures = Arc::new(Mutex::new(Vec::new()));
    let sink: ErrorSink = {
        let failures = failures.clone();
        Arc::new(move |label: &str, error: &PluginHostError| {
            failures
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((label.to_string(), error.to_string()));
        })
    };

    let service = PluginService::builder(config.plugins_config())
        .error_sink(sink)
        .build();
    service.start().await?;
    service.wait_for_initial_load().await;

    let mut handles = service.plugins().handles().await;
    handles.sort_by(|a, b| a.dir().path().cmp(b.dir().path()));

    if handles.is_empty() {
        println!("No plugins loaded from {}", service.config().root_dir().display());
    } else {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL_CONDENSED);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.set_header(vec![
            Cell::new("Plugin").fg(Color::Cyan),
            Cell::new("Version").fg(Color::Cyan),
            Cell::new("Directory").fg(Color::Cyan),
            Cell::new("Exported types").fg(Color::Cyan),
        ]);

        for handle in &handles {
            let Ok(container) = handle.container().await else {
                continue;
            };
            let identity = container.identity();
            let types = container
                .exported_types()
                .iter()
                .map(|info| format!("{} ({})", info.name(), info.contract_name()))
                .collect::<Vec<_>>()
                .join("\n");
            table.add_row(vec![
                Cell::new(&identity.name),
                Cell::new(identity.version.to_string()),
                Cell::new(handle.dir().to_string()),
                Cell::new(types),
            ]);
        }
        println!("{table}");
    }

    let failures = failures
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    for (dir, error) in &failures {
        println!("Failed: {dir}: {error}");
    }

    service.stop().await;
    Ok(())
}
