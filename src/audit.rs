//! Agent tool-call audit trail.
//!
//! One JSON object per line in `{config_dir}/agent-logs/YYYY-MM-DD.jsonl`
//! (UTC date). Writing is best-effort: a failed write is logged and the
//! agent carries on.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// One tool execution as seen by the agent loop.
pub struct AuditRecord<'a> {
    pub conversation_id: Option<&'a str>,
    pub turn: usize,
    pub tool: &'a str,
    pub input: &'a Value,
    /// Text shown to the model, tagged by outcome.
    pub result: Result<&'a str, &'a str>,
    pub duration: Duration,
}

#[derive(Serialize)]
struct AuditLine<'a> {
    at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    conversation_id: Option<&'a str>,
    turn: usize,
    tool: &'a str,
    input: &'a Value,
    ok: bool,
    message: &'a str,
    duration_ms: u64,
}

impl<'a> AuditLine<'a> {
    fn new(at: DateTime<Utc>, record: &AuditRecord<'a>) -> Self {
        let (ok, message) = match record.result {
            Ok(m) => (true, m),
            Err(m) => (false, m),
        };
        Self {
            at,
            conversation_id: record.conversation_id,
            turn: record.turn,
            tool: record.tool,
            input: record.input,
            ok,
            message,
            duration_ms: u64::try_from(record.duration.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// Writes audit lines under a config directory. A disabled log drops records.
#[derive(Debug, Clone, Default)]
pub struct AuditLog {
    config_dir: Option<PathBuf>,
}

impl AuditLog {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: Some(config_dir.into()),
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.config_dir.is_some()
    }

    pub fn record(&self, record: &AuditRecord<'_>) {
        if let Err(message) = record.result {
            tracing::warn!(tool = record.tool, turn = record.turn, %message, "agent tool call failed");
        }
        let Some(dir) = &self.config_dir else {
            return;
        };
        if let Err(e) = append(dir, Utc::now(), record) {
            tracing::warn!(error = %e, tool = record.tool, "could not write audit line");
        }
    }
}

/// File the audit line for `at` lands in.
pub fn log_path(config_dir: &Path, at: DateTime<Utc>) -> PathBuf {
    crate::paths::agent_logs_dir(config_dir).join(format!("{}.jsonl", at.format("%Y-%m-%d")))
}

fn append(config_dir: &Path, at: DateTime<Utc>, record: &AuditRecord<'_>) -> io::Result<()> {
    let path = log_path(config_dir, at);
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let line = serde_json::to_string(&AuditLine::new(at, record))?;
    let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
    writeln!(file, "{line}")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn record<'a>(input: &'a Value, result: Result<&'a str, &'a str>) -> AuditRecord<'a> {
        AuditRecord {
            conversation_id: Some("conv-1"),
            turn: 2,
            tool: "delete_entity",
            input,
            result,
            duration: Duration::from_millis(5),
        }
    }

    #[test]
    fn file_is_named_for_the_utc_day() {
        let dir = Path::new("/cfg");
        let late = Utc.with_ymd_and_hms(2025, 2, 24, 23, 59, 59).unwrap();
        assert!(log_path(dir, late).ends_with("agent-logs/2025-02-24.jsonl"));
        let epoch = Utc.timestamp_opt(0, 0).unwrap();
        assert!(log_path(dir, epoch).ends_with("agent-logs/1970-01-01.jsonl"));
    }

    #[test]
    fn appends_one_line_per_call() {
        let dir = tempfile::tempdir().unwrap();
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let input = serde_json::json!({ "entityId": "e1" });
        append(dir.path(), at, &record(&input, Ok("Deleted e1"))).unwrap();
        append(dir.path(), at, &record(&input, Err("e1 not found"))).unwrap();

        let text = fs::read_to_string(log_path(dir.path(), at)).unwrap();
        let lines: Vec<Value> = text.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["ok"], true);
        assert_eq!(lines[1]["ok"], false);
        assert_eq!(lines[1]["message"], "e1 not found");
        assert_eq!(lines[1]["turn"], 2);
        assert_eq!(lines[1]["input"]["entityId"], "e1");
        assert_eq!(lines[1]["duration_ms"], 5);
        assert!(lines[0]["at"].as_str().unwrap().starts_with("2026-03-01T12:00:00"));
    }

    #[test]
    fn enabled_log_writes_under_agent_logs() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path());
        log.record(&record(&Value::Null, Ok("ok")));
        let logs = crate::paths::agent_logs_dir(dir.path());
        assert_eq!(fs::read_dir(logs).unwrap().count(), 1);
    }

    #[test]
    fn disabled_log_writes_nothing() {
        let log = AuditLog::disabled();
        assert!(!log.is_enabled());
        log.record(&record(&Value::Null, Ok("ok")));
    }
}
