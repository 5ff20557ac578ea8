//! Local execution of upstream-initiated filesystem operations.
//!
//! Everything is rooted at the configured working directory; paths may not
//! escape it, and `run_command` only works when the operator opted in.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde_json::Value as JsonValue;
use tokio::io::AsyncReadExt;
use tokio::sync::Mutex;

use super::glob::{glob_files, ripgrep};

const GLOB_MAX_RESULTS: usize = 500;
const COMMAND_OUTPUT_CAP: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct FsOpOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FsOpOutcome {
    fn ok(data: JsonValue) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    fn err(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

struct BackgroundProc {
    child: tokio::process::Child,
    stdout: Vec<u8>,
}

pub struct FsOpExecutor {
    working_dir: PathBuf,
    allow_run_command: bool,
    background: Mutex<HashMap<String, BackgroundProc>>,
}

impl FsOpExecutor {
    pub fn new(working_dir: PathBuf, allow_run_command: bool) -> Self {
        Self {
            working_dir,
            allow_run_command,
            background: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a request path inside the working directory; parent-escapes
    /// are rejected before touching the filesystem.
    fn resolve(&self, raw: &str) -> Result<PathBuf, String> {
        let requested = Path::new(raw);
        let joined = if requested.is_absolute() {
            requested.to_path_buf()
        } else {
            self.working_dir.join(requested)
        };
        let mut normalized = PathBuf::new();
        for component in joined.components() {
            match component {
                std::path::Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(format!("path escapes working directory: {raw}"));
                    }
                }
                std::path::Component::CurDir => {}
                other => normalized.push(other),
            }
        }
        if !normalized.starts_with(&self.working_dir) {
            return Err(format!("path escapes working directory: {raw}"));
        }
        Ok(normalized)
    }

    pub async fn execute(&self, operation: &str, params: &JsonValue) -> FsOpOutcome {
        match operation {
            "read" | "read_file" => self.read(params).await,
            "write" | "write_file" | "create_file" => self.write(params).await,
            "delete" | "delete_file" => self.delete(params).await,
            "list" | "list_directory" => self.list(params).await,
            "glob" => self.glob(params),
            "ripgrep" | "grep" => self.grep(params),
            "run_command" => self.run_command(params).await,
            "get_background_output" => self.background_output(params).await,
            "kill_background_process" => self.kill_background(params).await,
            other => FsOpOutcome::err(format!("unsupported fs operation: {other}")),
        }
    }

    async fn read(&self, params: &JsonValue) -> FsOpOutcome {
        let Some(raw) = params["path"].as_str().or_else(|| params["file_path"].as_str()) else {
            return FsOpOutcome::err("read requires a path");
        };
        let path = match self.resolve(raw) {
            Ok(path) => path,
            Err(err) => return FsOpOutcome::err(err),
        };
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => FsOpOutcome::ok(serde_json::json!({ "content": content })),
            Err(err) => FsOpOutcome::err(format!("read {raw}: {err}")),
        }
    }

    async fn write(&self, params: &JsonValue) -> FsOpOutcome {
        let Some(raw) = params["path"].as_str().or_else(|| params["file_path"].as_str()) else {
            return FsOpOutcome::err("write requires a path");
        };
        let content = params["content"].as_str().unwrap_or_default();
        let path = match self.resolve(raw) {
            Ok(path) => path,
            Err(err) => return FsOpOutcome::err(err),
        };
        if let Some(parent) = path.parent()
            && let Err(err) = tokio::fs::create_dir_all(parent).await
        {
            return FsOpOutcome::err(format!("mkdir for {raw}: {err}"));
        }
        match tokio::fs::write(&path, content).await {
            Ok(()) => FsOpOutcome::ok(serde_json::json!({ "bytes": content.len() })),
            Err(err) => FsOpOutcome::err(format!("write {raw}: {err}")),
        }
    }

    async fn delete(&self, params: &JsonValue) -> FsOpOutcome {
        let Some(raw) = params["path"].as_str().or_else(|| params["file_path"].as_str()) else {
            return FsOpOutcome::err("delete requires a path");
        };
        let path = match self.resolve(raw) {
            Ok(path) => path,
            Err(err) => return FsOpOutcome::err(err),
        };
        match tokio::fs::remove_file(&path).await {
            Ok(()) => FsOpOutcome::ok(serde_json::json!({ "deleted": raw })),
            Err(err) => FsOpOutcome::err(format!("delete {raw}: {err}")),
        }
    }

    async fn list(&self, params: &JsonValue) -> FsOpOutcome {
        let raw = params["path"].as_str().unwrap_or(".");
        let path = match self.resolve(raw) {
            Ok(path) => path,
            Err(err) => return FsOpOutcome::err(err),
        };
        let mut entries = Vec::new();
        let mut reader = match tokio::fs::read_dir(&path).await {
            Ok(reader) => reader,
            Err(err) => return FsOpOutcome::err(format!("list {raw}: {err}")),
        };
        while let Ok(Some(entry)) = reader.next_entry().await {
            let name = entry.file_name().to_string_lossy().to_string();
            let is_dir = entry
                .file_type()
                .await
                .map(|kind| kind.is_dir())
                .unwrap_or(false);
            entries.push(serde_json::json!({ "name": name, "dir": is_dir }));
        }
        entries.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
        FsOpOutcome::ok(serde_json::json!({ "entries": entries }))
    }

    fn glob(&self, params: &JsonValue) -> FsOpOutcome {
        let Some(pattern) = params["pattern"].as_str() else {
            return FsOpOutcome::err("glob requires a pattern");
        };
        match glob_files(&self.working_dir, pattern, GLOB_MAX_RESULTS) {
            Ok(files) => FsOpOutcome::ok(serde_json::json!({ "files": files })),
            Err(err) => FsOpOutcome::err(err),
        }
    }

    fn grep(&self, params: &JsonValue) -> FsOpOutcome {
        let Some(pattern) = params["pattern"].as_str().or_else(|| params["query"].as_str()) else {
            return FsOpOutcome::err("ripgrep requires a pattern");
        };
        let file_glob = params["glob"].as_str().or_else(|| params["include"].as_str());
        match ripgrep(&self.working_dir, pattern, file_glob) {
            Ok(hits) => FsOpOutcome::ok(serde_json::json!({ "matches": hits })),
            Err(err) => FsOpOutcome::err(err),
        }
    }

    async fn run_command(&self, params: &JsonValue) -> FsOpOutcome {
        if !self.allow_run_command {
            return FsOpOutcome::err("run_command is disabled by configuration");
        }
        let Some(command) = params["command"].as_str() else {
            return FsOpOutcome::err("run_command requires a command");
        };
        let background = params["background"].as_bool().unwrap_or(false)
            || params["bash_id"].is_string();

        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&self.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if background {
            let Some(bash_id) = params["bash_id"].as_str() else {
                return FsOpOutcome::err("background run_command requires a bash_id");
            };
            match cmd.spawn() {
                Ok(child) => {
                    self.background.lock().await.insert(
                        bash_id.to_string(),
                        BackgroundProc {
                            child,
                            stdout: Vec::new(),
                        },
                    );
                    FsOpOutcome::ok(serde_json::json!({ "bash_id": bash_id, "started": true }))
                }
                Err(err) => FsOpOutcome::err(format!("spawn failed: {err}")),
            }
        } else {
            match cmd.output().await {
                Ok(output) => FsOpOutcome::ok(serde_json::json!({
                    "exit_code": output.status.code(),
                    "stdout": truncate_output(&output.stdout),
                    "stderr": truncate_output(&output.stderr),
                })),
                Err(err) => FsOpOutcome::err(format!("command failed: {err}")),
            }
        }
    }

    async fn background_output(&self, params: &JsonValue) -> FsOpOutcome {
        let Some(bash_id) = params["bash_id"].as_str() else {
            return FsOpOutcome::err("get_background_output requires a bash_id");
        };
        let mut table = self.background.lock().await;
        let Some(proc) = table.get_mut(bash_id) else {
            return FsOpOutcome::err(format!("unknown bash_id {bash_id}"));
        };
        if let Some(stdout) = proc.child.stdout.as_mut() {
            let mut buffer = [0u8; 8192];
            // Drain whatever is immediately available without blocking on a
            // still-running process.
            while let Ok(Ok(read)) = tokio::time::timeout(
                std::time::Duration::from_millis(50),
                stdout.read(&mut buffer),
            )
            .await
            {
                if read == 0 {
                    break;
                }
                proc.stdout.extend_from_slice(&buffer[..read]);
                if proc.stdout.len() > COMMAND_OUTPUT_CAP {
                    break;
                }
            }
        }
        let running = matches!(proc.child.try_wait(), Ok(None));
        FsOpOutcome::ok(serde_json::json!({
            "bash_id": bash_id,
            "running": running,
            "output": truncate_output(&proc.stdout),
        }))
    }

    async fn kill_background(&self, params: &JsonValue) -> FsOpOutcome {
        let Some(bash_id) = params["bash_id"].as_str() else {
            return FsOpOutcome::err("kill_background_process requires a bash_id");
        };
        let mut table = self.background.lock().await;
        let Some(mut proc) = table.remove(bash_id) else {
            return FsOpOutcome::err(format!("unknown bash_id {bash_id}"));
        };
        let _ = proc.child.kill().await;
        FsOpOutcome::ok(serde_json::json!({ "bash_id": bash_id, "killed": true }))
    }
}

fn truncate_output(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    text.chars().take(COMMAND_OUTPUT_CAP).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn executor(dir: &tempfile::TempDir, allow_run: bool) -> FsOpExecutor {
        FsOpExecutor::new(dir.path().to_path_buf(), allow_run)
    }

    #[tokio::test]
    async fn read_write_round_trip_stays_inside_root() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(&dir, false);
        let write = exec
            .execute(
                "write",
                &serde_json::json!({"path": "notes/a.txt", "content": "hello"}),
            )
            .await;
        assert!(write.success);

        let read = exec
            .execute("read", &serde_json::json!({"path": "notes/a.txt"}))
            .await;
        assert_eq!(read.data.unwrap()["content"], "hello");
    }

    #[tokio::test]
    async fn parent_escapes_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(&dir, false);
        let outcome = exec
            .execute("read", &serde_json::json!({"path": "../../etc/passwd"}))
            .await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("escapes"));
    }

    #[tokio::test]
    async fn run_command_requires_the_allow_flag() {
        let dir = tempfile::tempdir().unwrap();
        let denied = executor(&dir, false)
            .execute("run_command", &serde_json::json!({"command": "echo hi"}))
            .await;
        assert!(!denied.success);

        let allowed = executor(&dir, true)
            .execute("run_command", &serde_json::json!({"command": "echo hi"}))
            .await;
        assert!(allowed.success);
        assert!(
            allowed.data.unwrap()["stdout"]
                .as_str()
                .unwrap()
                .contains("hi")
        );
    }

    #[tokio::test]
    async fn background_processes_are_keyed_by_bash_id() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(&dir, true);
        let started = exec
            .execute(
                "run_command",
                &serde_json::json!({"command": "sleep 5", "bash_id": "job-1"}),
            )
            .await;
        assert!(started.success);

        let status = exec
            .execute(
                "get_background_output",
                &serde_json::json!({"bash_id": "job-1"}),
            )
            .await;
        assert_eq!(status.data.as_ref().unwrap()["running"], true);

        let killed = exec
            .execute(
                "kill_background_process",
                &serde_json::json!({"bash_id": "job-1"}),
            )
            .await;
        assert!(killed.success);
    }
}
