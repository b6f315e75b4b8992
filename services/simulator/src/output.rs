use anyhow::Context;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tutorsim_core::engine::ConversationRecord;

/// `<output_dir>/<model>/<version>_<yyyymmdd_HHMMSS>.json`
pub fn result_path(output_dir: &Path, model: &str, version: &str, now: DateTime<Utc>) -> PathBuf {
    output_dir
        .join(model)
        .join(format!("{}_{}.json", version, now.format("%Y%m%d_%H%M%S")))
}

/// Writes the batch result as one pretty-printed JSON array.
pub fn write_results(path: &Path, records: &[ConversationRecord]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(records)?;
    std::fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}
