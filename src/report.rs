//! Human-facing instrumentation report, written as line-oriented JSON for
//! readable diffs.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::probelog::{ChangeAction, ClassLog};

/// Summary of one instrumentation run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct InstrumentationReport {
    version: u32,
    specification: String,
    entries: Vec<ReportEntry>,
}

/// One physical edit in the report.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
struct ReportEntry {
    class: String,
    method: String,
    probe_id: u32,
    event_code: u8,
    start: u32,
    length: u32,
    action: String,
}

impl InstrumentationReport {
    pub(crate) fn capture(
        specification: &str,
        class_logs: &BTreeMap<String, ClassLog>,
    ) -> Self {
        let mut entries = Vec::new();
        for (class_name, log) in class_logs {
            for (method_sig, method_log) in &log.method_logs {
                for change in &method_log.bytecode_log {
                    entries.push(ReportEntry {
                        class: class_name.clone(),
                        method: method_sig.clone(),
                        probe_id: change.id,
                        event_code: change.event_code,
                        start: change.start,
                        length: change.length,
                        action: action_name(change.action).to_string(),
                    });
                }
            }
        }
        entries.sort();
        Self {
            version: 1,
            specification: specification.to_string(),
            entries,
        }
    }

    pub(crate) fn entry_count(&self) -> usize {
        self.entries.len()
    }
}

fn action_name(action: ChangeAction) -> &'static str {
    match action {
        ChangeAction::Insert => "insert",
        ChangeAction::CallIntercept => "call_intercept",
        ChangeAction::FieldIntercept => "field_intercept",
    }
}

pub(crate) fn write_report(path: &Path, report: &InstrumentationReport) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create report directory {}", parent.display()))?;
    }
    let mut file = File::create(path)
        .with_context(|| format!("failed to create report file {}", path.display()))?;

    // Compact JSON, one entry per line.
    write!(
        file,
        "{{\"version\":{},\"specification\":{},\"entries\":[",
        report.version,
        serde_json::to_string(&report.specification).context("serialize specification key")?
    )
    .context("failed to write report header")?;
    for (index, entry) in report.entries.iter().enumerate() {
        file.write_all(b"\n").context("failed to write report newline")?;
        serde_json::to_writer(&mut file, entry).context("failed to serialize report entry")?;
        if index + 1 < report.entries.len() {
            file.write_all(b",").context("failed to write report separator")?;
        }
    }
    if !report.entries.is_empty() {
        file.write_all(b"\n")
            .context("failed to write report trailing newline")?;
    }
    file.write_all(b"]}\n").context("failed to finalize report file")?;
    Ok(())
}

pub(crate) fn load_report(path: &Path) -> Result<Option<InstrumentationReport>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read report file {}", path.display()));
        }
    };
    let report =
        serde_json::from_str(&content).context("failed to parse instrumentation report")?;
    Ok(Some(report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events;
    use crate::probelog::BytecodeChange;
    use tempfile::tempdir;

    fn sample_logs() -> BTreeMap<String, ClassLog> {
        let mut log = ClassLog::new("pkg.A");
        let method_log = log.method_log_mut("m()V");
        method_log.insert_change(BytecodeChange {
            id: 1,
            event_code: events::EVENT_VMETHOD_ENTER,
            start: 0,
            length: 6,
            precedes: true,
            action: ChangeAction::Insert,
            interceptor: None,
        });
        method_log.insert_change(BytecodeChange {
            id: 2,
            event_code: events::EVENT_PUTFIELD,
            start: 9,
            length: 3,
            precedes: false,
            action: ChangeAction::FieldIntercept,
            interceptor: None,
        });
        let mut logs = BTreeMap::new();
        logs.insert("pkg.A".to_string(), log);
        logs
    }

    #[test]
    fn capture_flattens_logs_in_order() {
        let report = InstrumentationReport::capture("default", &sample_logs());
        assert_eq!(report.entry_count(), 2);
        assert_eq!(report.entries[0].probe_id, 1);
        assert_eq!(report.entries[0].action, "insert");
        assert_eq!(report.entries[1].action, "field_intercept");
    }

    #[test]
    fn report_write_and_load_round_trip() {
        let dir = tempdir().expect("report temp dir");
        let path = dir.path().join("report.json");
        let report = InstrumentationReport::capture("default", &sample_logs());

        write_report(&path, &report).expect("write report");
        let loaded = load_report(&path).expect("load report").expect("present");

        assert_eq!(loaded.entry_count(), report.entry_count());
        assert_eq!(loaded.specification, "default");
    }

    #[test]
    fn load_missing_report_returns_none() {
        let dir = tempdir().expect("report temp dir");
        let loaded = load_report(&dir.path().join("missing.json")).expect("load");
        assert!(loaded.is_none());
    }
}
