#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};

use anyhow::{Context, Result};

use crate::wire;

/// Largest index representable in the 20-bit string field of an
/// instrumentation code.
pub(crate) const MAX_STRING_INDEX: u32 = (1 << 20) - 1;

/// Interned payload strings referenced by probe masks.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct StringTable {
    strings: Vec<String>,
    index: BTreeMap<String, u32>,
}

impl StringTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Intern `value` and return its index.
    pub(crate) fn add(&mut self, value: &str) -> Result<u32> {
        if let Some(index) = self.index.get(value) {
            return Ok(*index);
        }
        let index = self.strings.len() as u32;
        if index > MAX_STRING_INDEX {
            anyhow::bail!("string table overflow at {value:?}");
        }
        self.strings.push(value.to_string());
        self.index.insert(value.to_string(), index);
        Ok(index)
    }

    pub(crate) fn get(&self, index: u32) -> Option<&str> {
        self.strings.get(index as usize).map(String::as_str)
    }

    pub(crate) fn len(&self) -> usize {
        self.strings.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    pub(crate) fn write_to<W: Write>(&self, out: &mut W) -> Result<()> {
        wire::write_i32(out, self.strings.len() as i32)?;
        for value in &self.strings {
            wire::write_utf(out, value)?;
        }
        Ok(())
    }

    pub(crate) fn read_from<R: Read>(input: &mut R) -> Result<Self> {
        let count = wire::read_i32(input).context("read string table size")?;
        let mut table = Self::new();
        for _ in 0..count {
            let value = wire::read_utf(input)?;
            table.index.insert(value.clone(), table.strings.len() as u32);
            table.strings.push(value);
        }
        Ok(table)
    }
}

/// Process-wide mutable state for one instrumentation run.
///
/// Tests construct a fresh session per scenario; nothing here is global.
#[derive(Debug, Default)]
pub(crate) struct Session {
    strings: StringTable,
    finished_classes: BTreeSet<String>,
    interceptors: BTreeMap<(String, String, String), String>,
    start_probe_class: Option<String>,
    prepare_wait: bool,
    adaptive: bool,
}

impl Session {
    pub(crate) fn new() -> Self {
        Self {
            prepare_wait: true,
            ..Self::default()
        }
    }

    pub(crate) fn strings(&self) -> &StringTable {
        &self.strings
    }

    pub(crate) fn strings_mut(&mut self) -> &mut StringTable {
        &mut self.strings
    }

    pub(crate) fn add_string(&mut self, value: &str) -> Result<u32> {
        self.strings.add(value)
    }

    pub(crate) fn mark_finished(&mut self, class_name: &str) -> bool {
        self.finished_classes.insert(class_name.to_string())
    }

    pub(crate) fn is_finished(&self, class_name: &str) -> bool {
        self.finished_classes.contains(class_name)
    }

    /// Interceptor method cache keyed by `(class, member, signature)`; a
    /// single interceptor is shared by every call site of one target.
    pub(crate) fn interceptor_for(
        &self,
        class: &str,
        member: &str,
        signature: &str,
    ) -> Option<&str> {
        self.interceptors
            .get(&(class.to_string(), member.to_string(), signature.to_string()))
            .map(String::as_str)
    }

    pub(crate) fn cache_interceptor(
        &mut self,
        class: &str,
        member: &str,
        signature: &str,
        interceptor_name: &str,
    ) {
        self.interceptors.insert(
            (class.to_string(), member.to_string(), signature.to_string()),
            interceptor_name.to_string(),
        );
    }

    /// Class carrying the one-shot start probe; only the first candidate
    /// claims it.
    pub(crate) fn claim_start_probe(&mut self, class_name: &str) -> bool {
        if self.start_probe_class.is_some() {
            return false;
        }
        self.start_probe_class = Some(class_name.to_string());
        true
    }

    pub(crate) fn start_probe_class(&self) -> Option<&str> {
        self.start_probe_class.as_deref()
    }

    pub(crate) fn set_prepare_wait(&mut self, enabled: bool) {
        self.prepare_wait = enabled;
    }

    pub(crate) fn prepare_wait(&self) -> bool {
        self.prepare_wait
    }

    pub(crate) fn set_adaptive(&mut self, enabled: bool) {
        self.adaptive = enabled;
    }

    pub(crate) fn adaptive(&self) -> bool {
        self.adaptive
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn string_table_interns_and_round_trips() {
        let mut table = StringTable::new();
        let a = table.add("pkg.A#m#()V#1").expect("add a");
        let b = table.add("pkg.B#n#()V#9").expect("add b");
        let a_again = table.add("pkg.A#m#()V#1").expect("re-add a");

        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(a, a_again);
        assert_eq!(table.get(1), Some("pkg.B#n#()V#9"));

        let mut buf = Vec::new();
        table.write_to(&mut buf).expect("serialize table");
        let restored = StringTable::read_from(&mut Cursor::new(buf)).expect("deserialize table");
        assert_eq!(table, restored);
    }

    #[test]
    fn session_tracks_finished_classes_once() {
        let mut session = Session::new();
        assert!(session.mark_finished("pkg.A"));
        assert!(!session.mark_finished("pkg.A"));
        assert!(session.is_finished("pkg.A"));
        assert!(!session.is_finished("pkg.B"));
    }

    #[test]
    fn interceptor_cache_is_keyed_by_target() {
        let mut session = Session::new();
        session.cache_interceptor("pkg.A", "f", "I", "write_f$");
        assert_eq!(session.interceptor_for("pkg.A", "f", "I"), Some("write_f$"));
        assert_eq!(session.interceptor_for("pkg.A", "g", "I"), None);
    }

    #[test]
    fn start_probe_is_claimed_once() {
        let mut session = Session::new();
        assert!(session.claim_start_probe("pkg.Main"));
        assert!(!session.claim_start_probe("pkg.Other"));
        assert_eq!(session.start_probe_class(), Some("pkg.Main"));
    }
}
