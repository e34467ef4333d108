//! Inspect command implementation.

use crate::queue::{EngineOptions, QueueEngine, TopicStats};
use crate::storage::{CompactionPolicy, KvStore, LogStore, LogStoreOptions};
use anyhow::{Context, Result};
use clap::Args;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

/// Print topic and line state from a durable storage directory.
#[derive(Args, Debug)]
pub struct InspectArgs {
    /// Storage directory.
    #[arg(short, long, default_value = "data")]
    pub dir: PathBuf,

    /// Only show this topic.
    #[arg(short, long)]
    pub topic: Option<String>,
}

#[derive(Serialize)]
struct Report {
    segments: usize,
    log_bytes: u64,
    live_bytes: u64,
    keys: usize,
    topics: Vec<TopicStats>,
}

/// Run the inspect command. The store is opened without compaction and
/// nothing is written besides torn-tail repair.
pub async fn run_inspect(args: InspectArgs) -> Result<()> {
    if !args.dir.is_dir() {
        anyhow::bail!("storage directory not found: {}", args.dir.display());
    }

    let options = LogStoreOptions {
        compaction: CompactionPolicy::disabled(),
        ..Default::default()
    };
    let store = Arc::new(LogStore::open(args.dir.clone(), options)?);
    let log = store.stats();
    let engine = QueueEngine::open(store.clone() as Arc<dyn KvStore>, EngineOptions::default())?;

    let names = match args.topic {
        Some(topic) => vec![topic],
        None => engine.topics()?,
    };
    let topics = names
        .iter()
        .map(|name| engine.topic_stats(name))
        .collect::<Result<Vec<_>, _>>()?;

    let report = Report {
        segments: log.segments,
        log_bytes: log.log_bytes,
        live_bytes: log.live_bytes,
        keys: log.keys,
        topics,
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("failed to render report")?
    );

    engine.close().await?;
    Ok(())
}
