// src/commands/worker.rs
//! Hidden worker subcommand, spawned once per build by `install`

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use strata::install::{WorkerRequest, worker};
use tracing_subscriber::EnvFilter;

/// Run one build described by the request file at `path`
///
/// The worker's stdout and stderr belong to the parent protocol, so logging
/// goes to the build log instead.
pub fn cmd_build_worker(path: &Path) -> Result<()> {
    let request = WorkerRequest::read_from(path)
        .with_context(|| format!("Failed to read worker request {}", path.display()))?;

    if let Some(parent) = request.log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&request.log_path)?;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(Arc::new(log))
        .with_ansi(false)
        .try_init();

    worker::run(&request)?;
    Ok(())
}
