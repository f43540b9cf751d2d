//! Per-task JSON-lines event log.
//!
//! One JSON object per line:
//! `{ts, level, event, step_name, workspace_name, task_id, [error, duration_ms, ...]}`.
//! Appends go through the store's locked append so each line lands whole.

use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value, json};

use crate::store::Store;

/// Soft cap before a one-time oversize warning (the log is the audit trail
/// and is never rotated).
const LOG_SOFT_CAP: u64 = 10 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Writer bound to one task's `task.log`.
pub struct TaskLogger {
    store: Store,
    workspace: String,
    task_id: String,
    warned_oversize: std::sync::atomic::AtomicBool,
}

impl TaskLogger {
    pub fn new(store: Store, workspace: &str, task_id: &str) -> Self {
        Self {
            store,
            workspace: workspace.to_string(),
            task_id: task_id.to_string(),
            warned_oversize: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Append one event line. Logging failures are reported via `log` and
    /// never propagate - the audit trail must not break the engine.
    pub fn log(&self, level: LogLevel, event: &str, step_name: Option<&str>, extra: Value) {
        let mut entry = Map::new();
        entry.insert(
            "ts".into(),
            json!(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        entry.insert("level".into(), json!(level.to_string()));
        entry.insert("event".into(), json!(event));
        if let Some(step) = step_name {
            entry.insert("step_name".into(), json!(step));
        }
        entry.insert("workspace_name".into(), json!(self.workspace));
        entry.insert("task_id".into(), json!(self.task_id));
        if let Value::Object(fields) = extra {
            for (k, v) in fields {
                entry.insert(k, v);
            }
        }

        let mut line = Value::Object(entry).to_string();
        line.push('\n');

        self.check_size();
        if let Err(e) = self
            .store
            .append_log(&self.workspace, &self.task_id, line.as_bytes())
        {
            log::warn!(
                "failed to append task log for {}/{}: {e}",
                self.workspace,
                self.task_id
            );
        }
    }

    pub fn info(&self, event: &str, step_name: Option<&str>) {
        self.log(LogLevel::Info, event, step_name, json!({}));
    }

    pub fn error(&self, event: &str, step_name: Option<&str>, error: &str) {
        self.log(
            LogLevel::Error,
            event,
            step_name,
            json!({ "error": error }),
        );
    }

    pub fn step_finished(&self, event: &str, step_name: &str, duration: Duration) {
        self.log(
            LogLevel::Info,
            event,
            Some(step_name),
            json!({ "duration_ms": duration.as_millis() as u64 }),
        );
    }

    fn check_size(&self) {
        use std::sync::atomic::Ordering;
        if self.warned_oversize.load(Ordering::Relaxed) {
            return;
        }
        let path = self
            .store
            .home()
            .task_log_path(&self.workspace, &self.task_id);
        if let Ok(meta) = std::fs::metadata(&path)
            && meta.len() > LOG_SOFT_CAP
            && !self.warned_oversize.swap(true, Ordering::Relaxed)
        {
            log::warn!("task log {} exceeds 10MiB", path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::home::AtlasHome;
    use crate::model::Workspace;
    use std::path::PathBuf;

    #[test]
    fn test_log_lines_are_json_objects() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(AtlasHome::at(dir.path()));
        store
            .create_workspace(&Workspace::new("auth", "atlas/auth", PathBuf::from("/wt"), PathBuf::from("/repo")))
            .unwrap();

        let logger = TaskLogger::new(store.clone(), "auth", "t-1");
        logger.info("task_started", None);
        logger.error("step_failed", Some("commit"), "exit 1");
        logger.step_finished("step_completed", "validate", Duration::from_millis(1234));

        let content = store.read_log("auth", "t-1").unwrap();
        let lines: Vec<&str> = content.trim().lines().collect();
        assert_eq!(lines.len(), 3);

        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["event"], "task_started");
        assert_eq!(first["level"], "info");
        assert_eq!(first["workspace_name"], "auth");
        assert_eq!(first["task_id"], "t-1");
        assert!(first.get("step_name").is_none());

        let second: Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["step_name"], "commit");
        assert_eq!(second["error"], "exit 1");

        let third: Value = serde_json::from_str(lines[2]).unwrap();
        assert_eq!(third["duration_ms"], 1234);
    }
}
