use crate::output::print_json;
use anyhow::Context;
use pipeline_core::{config::Config, lock::PipelineLock};
use std::path::Path;

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    let lock = PipelineLock::new(config.lock_path(root), config.stale_after());
    let released = lock.release();

    if json {
        print_json(&serde_json::json!({
            "released": released,
            "path": lock.path().display().to_string(),
        }))?;
    } else if released {
        println!("Released lock: {}", lock.path().display());
    } else {
        println!("Lock not held.");
    }
    Ok(())
}
