//! Append-only prompt logs, framed for operator inspection.

use std::path::PathBuf;

use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

use aigw_common::LogMode;

pub struct PromptLog {
    mode: LogMode,
    input_path: PathBuf,
    output_path: PathBuf,
    write_lock: Mutex<()>,
}

impl PromptLog {
    pub fn new(mode: LogMode, input_path: PathBuf, output_path: PathBuf) -> Self {
        Self {
            mode,
            input_path,
            output_path,
            write_lock: Mutex::new(()),
        }
    }

    pub async fn log_input(&self, text: &str) {
        self.log(true, text).await;
    }

    pub async fn log_output(&self, text: &str) {
        self.log(false, text).await;
    }

    async fn log(&self, input: bool, text: &str) {
        if text.is_empty() {
            return;
        }
        let redacted = aigw_common::redact_text(text);
        let stamp = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_default();
        let label = if input { "INPUT" } else { "OUTPUT" };
        match self.mode {
            LogMode::None => {}
            LogMode::Console => {
                tracing::info!(event = "prompt", kind = label, text = %redacted);
            }
            LogMode::File => {
                let frame = format!("{stamp} [{label}]:\n{redacted}\n---\n");
                let path = if input {
                    &self.input_path
                } else {
                    &self.output_path
                };
                let _guard = self.write_lock.lock().await;
                let result = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await;
                match result {
                    Ok(mut file) => {
                        if let Err(err) = file.write_all(frame.as_bytes()).await {
                            warn!(event = "prompt_log.write_failed", error = %err);
                        }
                    }
                    Err(err) => {
                        warn!(event = "prompt_log.open_failed", path = %path.display(), error = %err);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_mode_appends_framed_entries() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.log");
        let output = dir.path().join("out.log");
        let log = PromptLog::new(LogMode::File, input.clone(), output.clone());

        log.log_input("first prompt").await;
        log.log_input("second prompt").await;
        log.log_output("answer").await;

        let input_text = std::fs::read_to_string(&input).unwrap();
        assert_eq!(input_text.matches("[INPUT]:").count(), 2);
        assert!(input_text.contains("first prompt"));
        assert!(input_text.ends_with("---\n"));

        let output_text = std::fs::read_to_string(&output).unwrap();
        assert!(output_text.contains("[OUTPUT]:\nanswer"));
    }

    #[tokio::test]
    async fn secrets_are_redacted_before_hitting_disk() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.log");
        let log = PromptLog::new(LogMode::File, input.clone(), dir.path().join("out.log"));
        log.log_input("use http://user:pw@proxy for this").await;
        let text = std::fs::read_to_string(&input).unwrap();
        assert!(text.contains("http://***@proxy"));
        assert!(!text.contains("user:pw"));
    }
}
