//! Line-delimited log of raw model calls.
//!
//! The log is an explicit collaborator: it is opened once, shared through an
//! `Arc`, appended to by concurrent dispatcher workers, and closed at the end
//! of a run. Appends are serialized behind a mutex and each record is written
//! as a single line, so records from different workers never interleave.

use crate::error::CoreResult;
use crate::llm_client::{ChatMessage, ChatRole};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::Mutex;
use tracing::debug;

/// One record per completed model request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallLogEntry {
    pub timestamp: DateTime<Utc>,
    pub model_name: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub n: u8,
    pub system_prompt: String,
    pub user_prompt: String,
    pub messages: Vec<ChatMessage>,
    pub output: Vec<String>,
}

impl CallLogEntry {
    /// Builds a record, taking the first system message and the last user
    /// message of the context as the headline prompts.
    pub fn new(
        model_name: &str,
        messages: &[ChatMessage],
        output: &[String],
        temperature: f32,
        max_tokens: u32,
        n: u8,
    ) -> Self {
        let system_prompt = messages
            .iter()
            .find(|m| m.role == ChatRole::System)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let user_prompt = messages
            .iter()
            .rev()
            .find(|m| m.role == ChatRole::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        Self {
            timestamp: Utc::now(),
            model_name: model_name.to_string(),
            temperature,
            max_tokens,
            n,
            system_prompt,
            user_prompt,
            messages: messages.to_vec(),
            output: output.to_vec(),
        }
    }
}

/// Resolves the concrete log file for a run.
///
/// A `{timestamp}` placeholder is replaced by the UTC start time; without one
/// the timestamp is appended to the file stem and the extension defaults to
/// `.jsonl`.
pub fn resolve_log_path(template: &Path, now: DateTime<Utc>) -> PathBuf {
    let ts = now.format("%Y%m%d_%H%M%S").to_string();
    let raw = template.to_string_lossy();
    if raw.contains("{timestamp}") {
        return PathBuf::from(raw.replace("{timestamp}", &ts));
    }
    let stem = template
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "llm_calls".to_string());
    let ext = template
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_else(|| "jsonl".to_string());
    template.with_file_name(format!("{}_{}.{}", stem, ts, ext))
}

/// Append-only JSONL call log with an open/append/close lifecycle.
pub struct CallLog {
    path: PathBuf,
    writer: Mutex<Option<BufWriter<File>>>,
    echo: bool,
}

impl CallLog {
    /// Opens (or creates) the log file for appending.
    ///
    /// When `echo` is set every record is also emitted as a `debug` event.
    pub async fn open(path: impl AsRef<Path>, echo: bool) -> CoreResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            writer: Mutex::new(Some(BufWriter::new(file))),
            echo,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one record. Appending after `close` is a no-op.
    pub async fn append(&self, entry: &CallLogEntry) -> CoreResult<()> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        if self.echo {
            debug!(
                model = %entry.model_name,
                temperature = entry.temperature,
                max_tokens = entry.max_tokens,
                n = entry.n,
                system_prompt = %entry.system_prompt,
                user_prompt = %entry.user_prompt,
                output = ?entry.output,
                "LLM call"
            );
        }

        let mut guard = self.writer.lock().await;
        if let Some(writer) = guard.as_mut() {
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await?;
        }
        Ok(())
    }

    /// Flushes and releases the file handle.
    pub async fn close(&self) -> CoreResult<()> {
        let mut guard = self.writer.lock().await;
        if let Some(mut writer) = guard.take() {
            writer.flush().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn entry(i: usize) -> CallLogEntry {
        CallLogEntry::new(
            "gpt-4o-mini",
            &[
                ChatMessage::system("You are a tutor."),
                ChatMessage::user(format!("question {}", i)),
            ],
            &[format!("answer {}", i)],
            0.7,
            300,
            1,
        )
    }

    #[test]
    fn test_entry_picks_system_and_last_user_prompt() {
        let entry = CallLogEntry::new(
            "m",
            &[
                ChatMessage::system("sys"),
                ChatMessage::user("first"),
                ChatMessage::assistant("reply"),
                ChatMessage::user("second"),
            ],
            &["out".to_string()],
            0.0,
            10,
            1,
        );
        assert_eq!(entry.system_prompt, "sys");
        assert_eq!(entry.user_prompt, "second");
        assert_eq!(entry.messages.len(), 4);
    }

    #[test]
    fn test_resolve_log_path() {
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 12, 30, 5).unwrap();
        assert_eq!(
            resolve_log_path(Path::new("logs/llm_calls.jsonl"), now),
            PathBuf::from("logs/llm_calls_20250301_123005.jsonl")
        );
        assert_eq!(
            resolve_log_path(Path::new("logs/run_{timestamp}.log"), now),
            PathBuf::from("logs/run_20250301_123005.log")
        );
        assert_eq!(
            resolve_log_path(Path::new("logs/calls"), now),
            PathBuf::from("logs/calls_20250301_123005.jsonl")
        );
    }

    #[tokio::test]
    async fn test_concurrent_appends_produce_whole_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("calls.jsonl");
        let log = Arc::new(CallLog::open(&path, false).await.unwrap());

        let handles: Vec<_> = (0..32)
            .map(|i| {
                let log = log.clone();
                tokio::spawn(async move { log.append(&entry(i)).await.unwrap() })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }
        log.close().await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 32);
        for line in lines {
            let parsed: CallLogEntry = serde_json::from_str(line).unwrap();
            assert_eq!(parsed.model_name, "gpt-4o-mini");
        }
    }

    #[tokio::test]
    async fn test_append_after_close_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calls.jsonl");
        let log = CallLog::open(&path, false).await.unwrap();
        log.append(&entry(0)).await.unwrap();
        log.close().await.unwrap();
        log.append(&entry(1)).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 1);
    }
}
