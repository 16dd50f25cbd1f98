#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::wire;

/// Catch-type marker for catch-any handlers.
pub(crate) const CATCH_ANY: &str = "\0";

/// Physical edit categories recorded per probe.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum ChangeAction {
    Insert,
    CallIntercept,
    FieldIntercept,
}

impl ChangeAction {
    fn code(self) -> u8 {
        match self {
            ChangeAction::Insert => 0,
            ChangeAction::CallIntercept => 1,
            ChangeAction::FieldIntercept => 2,
        }
    }

    fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(ChangeAction::Insert),
            1 => Ok(ChangeAction::CallIntercept),
            2 => Ok(ChangeAction::FieldIntercept),
            other => anyhow::bail!("unknown bytecode change action {other}"),
        }
    }
}

/// Restore record for a replaced call or field instruction.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct InterceptRecord {
    /// Opcode of the original, replaced instruction.
    pub(crate) opcode: u8,
    pub(crate) owner: String,
    pub(crate) name: String,
    pub(crate) descriptor: String,
    /// Name of the synthesized interceptor method in the owning class.
    pub(crate) interceptor_name: String,
}

impl InterceptRecord {
    fn write_to<W: Write>(&self, out: &mut W) -> Result<()> {
        wire::write_u8(out, self.opcode)?;
        wire::write_utf(out, &self.owner)?;
        wire::write_utf(out, &self.name)?;
        wire::write_utf(out, &self.descriptor)?;
        wire::write_utf(out, &self.interceptor_name)
    }

    fn read_from<R: Read>(input: &mut R) -> Result<Self> {
        Ok(Self {
            opcode: wire::read_u8(input)?,
            owner: wire::read_utf(input)?,
            name: wire::read_utf(input)?,
            descriptor: wire::read_utf(input)?,
            interceptor_name: wire::read_utf(input)?,
        })
    }
}

/// One physical bytecode edit attributed to a logical probe.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct BytecodeChange {
    pub(crate) id: u32,
    pub(crate) event_code: u8,
    /// Byte offset of the edit in the rewritten method.
    pub(crate) start: u32,
    /// Inserted length, or the replaced instruction's encoded width for
    /// interceptors.
    pub(crate) length: u32,
    pub(crate) precedes: bool,
    pub(crate) action: ChangeAction,
    pub(crate) interceptor: Option<InterceptRecord>,
}

impl BytecodeChange {
    fn write_to<W: Write>(&self, out: &mut W) -> Result<()> {
        wire::write_u32(out, self.id)?;
        wire::write_u8(out, self.event_code)?;
        wire::write_u32(out, self.start)?;
        wire::write_u32(out, self.length)?;
        wire::write_bool(out, self.precedes)?;
        wire::write_u8(out, self.action.code())?;
        match &self.interceptor {
            Some(record) => {
                wire::write_bool(out, true)?;
                record.write_to(out)?;
            }
            None => wire::write_bool(out, false)?,
        }
        Ok(())
    }

    fn read_from<R: Read>(input: &mut R) -> Result<Self> {
        let id = wire::read_u32(input)?;
        let event_code = wire::read_u8(input)?;
        let start = wire::read_u32(input)?;
        let length = wire::read_u32(input)?;
        let precedes = wire::read_bool(input)?;
        let action = ChangeAction::from_code(wire::read_u8(input)?)?;
        let interceptor = if wire::read_bool(input)? {
            Some(InterceptRecord::read_from(input)?)
        } else {
            None
        };
        Ok(Self {
            id,
            event_code,
            start,
            length,
            precedes,
            action,
            interceptor,
        })
    }
}

/// Exception handler added by the instrumentor.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct AddedExceptionHandler {
    pub(crate) probe_id: u32,
    pub(crate) start_pc: u32,
    pub(crate) end_pc: u32,
    pub(crate) handler_pc: u32,
    pub(crate) catch_type: String,
}

impl AddedExceptionHandler {
    pub(crate) fn is_catch_any(&self) -> bool {
        self.catch_type == CATCH_ANY
    }

    fn write_to<W: Write>(&self, out: &mut W) -> Result<()> {
        wire::write_u32(out, self.probe_id)?;
        wire::write_u32(out, self.start_pc)?;
        wire::write_u32(out, self.end_pc)?;
        wire::write_u32(out, self.handler_pc)?;
        wire::write_utf(out, &self.catch_type)
    }

    fn read_from<R: Read>(input: &mut R) -> Result<Self> {
        Ok(Self {
            probe_id: wire::read_u32(input)?,
            start_pc: wire::read_u32(input)?,
            end_pc: wire::read_u32(input)?,
            handler_pc: wire::read_u32(input)?,
            catch_type: wire::read_utf(input)?,
        })
    }
}

/// Ordered record of every edit applied to one method.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct MethodLog {
    pub(crate) method_sig: String,
    /// Kept sorted by `start`, stable for equal offsets.
    pub(crate) bytecode_log: Vec<BytecodeChange>,
    pub(crate) handler_log: Vec<AddedExceptionHandler>,
    /// Handler PCs synthesized by the instrumentor, so later passes do not
    /// treat them as user handlers.
    pub(crate) synthetic_handlers: BTreeSet<u32>,
    pub(crate) exit_probe_id: Option<u32>,
}

impl MethodLog {
    pub(crate) fn new(method_sig: impl Into<String>) -> Self {
        Self {
            method_sig: method_sig.into(),
            ..Self::default()
        }
    }

    /// Insert keeping the log ordered by start offset.
    pub(crate) fn insert_change(&mut self, change: BytecodeChange) {
        let at = self
            .bytecode_log
            .partition_point(|existing| existing.start <= change.start);
        self.bytecode_log.insert(at, change);
    }

    pub(crate) fn remove_changes_for(&mut self, probe_id: u32) -> Vec<BytecodeChange> {
        let (removed, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.bytecode_log)
            .into_iter()
            .partition(|change| change.id == probe_id);
        self.bytecode_log = kept;
        self.handler_log.retain(|handler| handler.probe_id != probe_id);
        if self.exit_probe_id == Some(probe_id) {
            self.exit_probe_id = None;
        }
        removed
    }

    pub(crate) fn changes_for(&self, probe_id: u32) -> impl Iterator<Item = &BytecodeChange> {
        self.bytecode_log
            .iter()
            .filter(move |change| change.id == probe_id)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.bytecode_log.is_empty() && self.handler_log.is_empty()
    }

    fn write_to<W: Write>(&self, out: &mut W) -> Result<()> {
        wire::write_utf(out, &self.method_sig)?;
        wire::write_i32(out, self.bytecode_log.len() as i32)?;
        for change in &self.bytecode_log {
            change.write_to(out)?;
        }
        wire::write_i32(out, self.handler_log.len() as i32)?;
        for handler in &self.handler_log {
            handler.write_to(out)?;
        }
        wire::write_i32(out, self.synthetic_handlers.len() as i32)?;
        for pc in &self.synthetic_handlers {
            wire::write_u32(out, *pc)?;
        }
        match self.exit_probe_id {
            Some(id) => wire::write_i32(out, id as i32)?,
            None => wire::write_i32(out, -1)?,
        }
        Ok(())
    }

    fn read_from<R: Read>(input: &mut R) -> Result<Self> {
        let method_sig = wire::read_utf(input)?;
        let change_count = wire::read_i32(input).context("read bytecode log size")?;
        let mut bytecode_log = Vec::new();
        for _ in 0..change_count {
            bytecode_log.push(BytecodeChange::read_from(input)?);
        }
        let handler_count = wire::read_i32(input).context("read handler log size")?;
        let mut handler_log = Vec::new();
        for _ in 0..handler_count {
            handler_log.push(AddedExceptionHandler::read_from(input)?);
        }
        let synthetic_count = wire::read_i32(input).context("read synthetic handler count")?;
        let mut synthetic_handlers = BTreeSet::new();
        for _ in 0..synthetic_count {
            synthetic_handlers.insert(wire::read_u32(input)?);
        }
        let exit_probe_id = match wire::read_i32(input)? {
            -1 => None,
            id if id >= 0 => Some(id as u32),
            other => anyhow::bail!("bad exit probe id {other}"),
        };
        Ok(Self {
            method_sig,
            bytecode_log,
            handler_log,
            synthetic_handlers,
            exit_probe_id,
        })
    }
}

/// Persistent record of all edits applied to one class.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct ClassLog {
    pub(crate) class_name: String,
    pub(crate) method_logs: BTreeMap<String, MethodLog>,
    /// Methods synthesized into the class, keyed by signature, with the
    /// probes that requested them.
    pub(crate) added_methods: BTreeMap<String, BTreeSet<u32>>,
}

impl ClassLog {
    pub(crate) fn new(class_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            ..Self::default()
        }
    }

    pub(crate) fn method_log_mut(&mut self, method_sig: &str) -> &mut MethodLog {
        self.method_logs
            .entry(method_sig.to_string())
            .or_insert_with(|| MethodLog::new(method_sig))
    }

    pub(crate) fn method_log(&self, method_sig: &str) -> Option<&MethodLog> {
        self.method_logs.get(method_sig)
    }

    pub(crate) fn record_added_method(&mut self, method_sig: &str, probe_id: u32) {
        self.added_methods
            .entry(method_sig.to_string())
            .or_default()
            .insert(probe_id);
    }

    /// Probe-log file name for this class.
    pub(crate) fn file_name(&self) -> String {
        format!("{}.probes.dat", self.class_name)
    }

    pub(crate) fn save(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(self.file_name());
        let file = File::create(&path)
            .with_context(|| format!("failed to create probe log {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        self.write_to(&mut writer)
            .with_context(|| format!("failed to write probe log {}", path.display()))?;
        writer
            .flush()
            .with_context(|| format!("failed to flush probe log {}", path.display()))?;
        Ok(path)
    }

    pub(crate) fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("failed to open probe log {}", path.display()))?;
        let mut reader = BufReader::new(file);
        let class_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.strip_suffix(".probes.dat"))
            .with_context(|| format!("bad probe log file name {}", path.display()))?
            .to_string();
        let mut log = Self::read_from(&mut reader)
            .with_context(|| format!("bad probe log file {}", path.display()))?;
        log.class_name = class_name;
        Ok(log)
    }

    pub(crate) fn write_to<W: Write>(&self, out: &mut W) -> Result<()> {
        wire::write_i32(out, self.added_methods.len() as i32)?;
        for (sig, ids) in &self.added_methods {
            wire::write_utf(out, sig)?;
            wire::write_i32(out, ids.len() as i32)?;
            for id in ids {
                wire::write_u32(out, *id)?;
            }
        }
        wire::write_i32(out, self.method_logs.len() as i32)?;
        for log in self.method_logs.values() {
            log.write_to(out)?;
        }
        Ok(())
    }

    pub(crate) fn read_from<R: Read>(input: &mut R) -> Result<Self> {
        let added_count = wire::read_i32(input).context("read added method count")?;
        let mut added_methods = BTreeMap::new();
        for _ in 0..added_count {
            let sig = wire::read_utf(input)?;
            let id_count = wire::read_i32(input)?;
            let mut ids = BTreeSet::new();
            for _ in 0..id_count {
                ids.insert(wire::read_u32(input)?);
            }
            added_methods.insert(sig, ids);
        }
        let method_count = wire::read_i32(input).context("read method log count")?;
        let mut method_logs = BTreeMap::new();
        for _ in 0..method_count {
            let log = MethodLog::read_from(input)?;
            method_logs.insert(log.method_sig.clone(), log);
        }
        Ok(Self {
            class_name: String::new(),
            method_logs,
            added_methods,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events;

    fn insert(id: u32, start: u32, length: u32) -> BytecodeChange {
        BytecodeChange {
            id,
            event_code: events::EVENT_NEW_OBJ,
            start,
            length,
            precedes: true,
            action: ChangeAction::Insert,
            interceptor: None,
        }
    }

    #[test]
    fn changes_stay_ordered_by_start() {
        let mut log = MethodLog::new("m()V");
        log.insert_change(insert(1, 40, 6));
        log.insert_change(insert(2, 10, 3));
        log.insert_change(insert(3, 40, 2));

        let starts: Vec<u32> = log.bytecode_log.iter().map(|c| c.start).collect();
        assert_eq!(starts, vec![10, 40, 40]);
        // Stable for equal offsets: id 1 landed first.
        assert_eq!(log.bytecode_log[1].id, 1);
    }

    #[test]
    fn remove_releases_changes_handlers_and_exit_probe() {
        let mut log = MethodLog::new("m()V");
        log.insert_change(insert(7, 42, 6));
        log.insert_change(insert(8, 50, 4));
        log.handler_log.push(AddedExceptionHandler {
            probe_id: 7,
            start_pc: 0,
            end_pc: 42,
            handler_pc: 60,
            catch_type: CATCH_ANY.to_string(),
        });
        log.exit_probe_id = Some(7);

        let removed = log.remove_changes_for(7);

        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].start, 42);
        assert_eq!(log.bytecode_log.len(), 1);
        assert!(log.handler_log.is_empty());
        assert_eq!(log.exit_probe_id, None);
    }

    #[test]
    fn catch_any_marker() {
        let handler = AddedExceptionHandler {
            probe_id: 1,
            start_pc: 0,
            end_pc: 4,
            handler_pc: 9,
            catch_type: CATCH_ANY.to_string(),
        };
        assert!(handler.is_catch_any());
        let named = AddedExceptionHandler {
            catch_type: "java.lang.Exception".to_string(),
            ..handler
        };
        assert!(!named.is_catch_any());
    }

    #[test]
    fn class_log_round_trips_through_file() {
        let dir = tempfile::tempdir().expect("probe log temp dir");
        let mut log = ClassLog::new("pkg.A");
        log.record_added_method("write_f$(Lpkg/A;I)V", 3);
        let method_log = log.method_log_mut("m()V");
        method_log.insert_change(BytecodeChange {
            id: 3,
            event_code: events::EVENT_PUTFIELD,
            start: 12,
            length: 3,
            precedes: false,
            action: ChangeAction::FieldIntercept,
            interceptor: Some(InterceptRecord {
                opcode: crate::opcodes::PUTFIELD,
                owner: "pkg.A".to_string(),
                name: "f".to_string(),
                descriptor: "I".to_string(),
                interceptor_name: "write_f$".to_string(),
            }),
        });
        method_log.synthetic_handlers.insert(77);
        method_log.exit_probe_id = Some(9);

        let path = log.save(dir.path()).expect("save class log");
        assert!(path.ends_with("pkg.A.probes.dat"));
        let loaded = ClassLog::load(&path).expect("load class log");

        assert_eq!(log, loaded);
    }

    #[test]
    fn truncated_log_is_a_bad_file() {
        let dir = tempfile::tempdir().expect("probe log temp dir");
        let path = dir.path().join("pkg.B.probes.dat");
        std::fs::write(&path, [0u8, 0, 0]).expect("write truncated log");

        let err = ClassLog::load(&path).expect_err("truncated log must fail");
        assert!(format!("{err:#}").contains("bad probe log file"));
    }

    #[test]
    fn unknown_action_code_is_rejected() {
        assert!(ChangeAction::from_code(9).is_err());
    }
}
