//! modhost lock - show the feed lock record

use anyhow::Result;
use clap::Args;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use modhost_feed::{FeedConfig, PackageLock};

use crate::config::ConfigLoader;

#[derive(Debug, Args)]
pub struct LockArgs {
    /// Lock file to read (overrides config)
    #[arg(long)]
    pub file: Option<std::path::PathBuf>,
}

pub async fn run(args: LockArgs) -> Result<()> {
    let config = ConfigLoader::load()?;
    let path = args
        .file
        .or_else(|| config.feed.as_ref().map(|feed| feed.lock_file.clone()))
        .unwrap_or_else(|| FeedConfig::default().lock_file);

    let lock = PackageLock::load(&path).await;
    if lock.records().is_empty() {
        println!("No packages recorded in {}", path.display());
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Package").fg(Color::Cyan),
        Cell::new("Version").fg(Color::Cyan),
    ]);
    for record in lock.records() {
        table.add_row(vec![Cell::new(&record.id), Cell::new(&record.version)]);
    }

    println!("{table}");
    println!("Lock file: {}", path.display());
    Ok(())
}
