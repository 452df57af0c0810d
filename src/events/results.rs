//! Result extraction from LAVA-style structured log lines.
//!
//! The dispatcher inside the job prints one JSON object per line, optionally
//! as a YAML list item (`- {...}`):
//!
//! ```text
//! - {"dt": "...", "lvl": "results", "msg": {"definition": "lava", "case": "login", "result": "pass"}}
//! ```
//!
//! Only lines with `lvl == "results"` carry results; everything else is
//! ignored.

use std::collections::BTreeMap;

use serde::Deserialize;
use tracing::{debug, trace};

use super::{ResultEvent, ResultTracker, TestRecord};

/// Level tag of result lines.
const RESULTS_LEVEL: &str = "results";

#[derive(Debug, Deserialize)]
struct LogLine {
    lvl: String,
    msg: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ResultMessage {
    definition: String,
    case: String,
    #[serde(flatten)]
    record: TestRecord,
}

/// Collects results per definition and case.
#[derive(Debug, Clone, Default)]
pub struct LavaResults {
    data: BTreeMap<String, BTreeMap<String, TestRecord>>,
    failed: bool,
}

impl LavaResults {
    /// Creates an empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded result for `definition`/`case`.
    #[must_use]
    pub fn get(&self, definition: &str, case: &str) -> Option<&TestRecord> {
        self.data.get(definition)?.get(case)
    }

    /// Number of recorded cases.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.values().map(BTreeMap::len).sum()
    }

    /// Returns true if nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl ResultTracker for LavaResults {
    fn parse(&mut self, line: &str) -> Option<ResultEvent> {
        let json = line.strip_prefix("- ").unwrap_or(line).trim_start();
        if !json.starts_with('{') {
            return None;
        }

        let entry: LogLine = serde_json::from_str(json).ok()?;
        if entry.lvl != RESULTS_LEVEL {
            return None;
        }

        let message: ResultMessage = match serde_json::from_value(entry.msg) {
            Ok(message) => message,
            Err(e) => {
                debug!(error = %e, "Ignoring malformed result line");
                return None;
            }
        };

        trace!(definition = %message.definition, case = %message.case, result = ?message.record.result, "Result");
        if message.record.is_failure() {
            self.failed = true;
        }

        self.data
            .entry(message.definition.clone())
            .or_default()
            .insert(message.case.clone(), message.record.clone());

        Some(ResultEvent {
            definition: message.definition,
            case: message.case,
            record: message.record,
        })
    }

    fn exit_code(&self) -> i32 {
        i32::from(self.failed)
    }

    fn data(&self) -> serde_json::Value {
        serde_json::to_value(&self.data).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const LOGIN_PASS: &str = r#"- {"dt": "2024-01-01T00:00:00", "lvl": "results", "msg": {"definition": "lava", "case": "login", "result": "pass", "duration": "1.20"}}"#;
    const BOOT_FAIL: &str = r#"{"lvl": "results", "msg": {"definition": "lava", "case": "boot", "result": "fail"}}"#;

    #[test]
    fn test_parse_result_line() {
        let mut results = LavaResults::new();
        let event = results.parse(LOGIN_PASS).expect("result line should parse");

        assert_eq!(event.definition, "lava");
        assert_eq!(event.case, "login");
        assert_eq!(event.record.result.as_deref(), Some("pass"));
        assert_eq!(event.record.extra.get("duration"), Some(&json!("1.20")));
        assert_eq!(results.exit_code(), 0);
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn test_ignores_other_lines() {
        let mut results = LavaResults::new();
        assert!(results.parse("plain output").is_none());
        assert!(results.parse(r#"- {"lvl": "info", "msg": "booting"}"#).is_none());
        assert!(results.parse(r#"- {"lvl": "results", "msg": "not an object"}"#).is_none());
        assert!(results.parse("- {broken").is_none());
        assert!(results.is_empty());
    }

    #[test]
    fn test_failure_sets_exit_code() {
        let mut results = LavaResults::new();
        results.parse(LOGIN_PASS);
        results.parse(BOOT_FAIL);
        assert_eq!(results.exit_code(), 1);
        assert!(results.get("lava", "boot").unwrap().is_failure());
    }

    #[test]
    fn test_data_is_nested_by_definition() {
        let mut results = LavaResults::new();
        results.parse(LOGIN_PASS);
        results.parse(BOOT_FAIL);

        assert_eq!(
            results.data(),
            json!({
                "lava": {
                    "boot": {"result": "fail"},
                    "login": {"result": "pass", "duration": "1.20"}
                }
            })
        );
    }

    #[test]
    fn test_hacking_session_reference() {
        let mut results = LavaResults::new();
        let line = r#"- {"lvl": "results", "msg": {"definition": "hacking-session", "case": "tmate", "result": "pass", "reference": "ssh://abc@tmate.io"}}"#;
        let event = results.parse(line).unwrap();
        assert_eq!(event.hacking_session(), Some("ssh://abc@tmate.io"));
    }
}
