//! Probe tracker: observes the instrumentor, allocates and recycles probe
//! ids, and normalizes edits into the persistent probe log.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};

use tracing::warn;

use crate::instrument::{CodeLayout, InstrumentObserver};
use crate::ir::{ExceptionHandler, Handle};
use crate::opcodes;
use crate::probelog::{
    AddedExceptionHandler, BytecodeChange, CATCH_ANY, ChangeAction, ClassLog, InterceptRecord,
};

/// Live bookkeeping for one logical probe.
#[derive(Clone, Debug)]
pub(crate) struct ProbeRecord {
    pub(crate) id: u32,
    pub(crate) location: String,
    pub(crate) live_keys: BTreeSet<String>,
    pub(crate) change_count: u16,
}

struct BufferedInsert {
    id: u32,
    event_code: u8,
    handles: Vec<Handle>,
    precedes: bool,
}

struct BufferedIntercept {
    id: u32,
    event_code: u8,
    record: InterceptRecord,
    anchor: Handle,
    action: ChangeAction,
}

struct BufferedHandler {
    id: u32,
    handler: ExceptionHandler,
}

/// Observer producing [`ClassLog`]s; ids come from a free list backed by a
/// monotonic counter.
#[derive(Default)]
pub(crate) struct ProbeTracker {
    next_id: u32,
    free_ids: BTreeSet<u32>,
    records: BTreeMap<u32, ProbeRecord>,
    class_logs: BTreeMap<String, ClassLog>,
    current_class: Option<String>,
    current_method: Option<String>,
    baseline: Option<BTreeMap<u32, Handle>>,
    inserts: Vec<BufferedInsert>,
    intercepts: Vec<BufferedIntercept>,
    handlers: Vec<BufferedHandler>,
    synthetic: Vec<Handle>,
    added_methods: Vec<(u32, String)>,
    exit_probe: Option<u32>,
}

impl ProbeTracker {
    pub(crate) fn new() -> Self {
        Self {
            next_id: 1,
            ..Self::default()
        }
    }

    /// Seed with a previously persisted log for adaptive reruns; the id
    /// counter restarts above every id the log knows.
    pub(crate) fn adopt(&mut self, log: ClassLog) {
        let mut max_id = self.next_id - 1;
        for method_log in log.method_logs.values() {
            for change in &method_log.bytecode_log {
                max_id = max_id.max(change.id);
            }
        }
        for ids in log.added_methods.values() {
            for id in ids {
                max_id = max_id.max(*id);
            }
        }
        self.next_id = max_id + 1;
        self.class_logs.insert(log.class_name.clone(), log);
    }

    pub(crate) fn class_log(&self, class_name: &str) -> Option<&ClassLog> {
        self.class_logs.get(class_name)
    }

    pub(crate) fn take_logs(&mut self) -> BTreeMap<String, ClassLog> {
        std::mem::take(&mut self.class_logs)
    }

    pub(crate) fn records(&self) -> impl Iterator<Item = &ProbeRecord> {
        self.records.values()
    }

    pub(crate) fn record(&self, id: u32) -> Option<&ProbeRecord> {
        self.records.get(&id)
    }

    pub(crate) fn live_probe_count(&self) -> usize {
        self.records.len()
    }

    fn current_class_log(&mut self) -> &mut ClassLog {
        let class = self
            .current_class
            .clone()
            .expect("probe tracker used outside a class scope");
        self.class_logs
            .entry(class.clone())
            .or_insert_with(|| ClassLog::new(class))
    }

    fn clear_method_buffers(&mut self) {
        self.baseline = None;
        self.inserts.clear();
        self.intercepts.clear();
        self.handlers.clear();
        self.synthetic.clear();
        self.added_methods.clear();
        self.exit_probe = None;
    }
}

impl InstrumentObserver for ProbeTracker {
    fn class_begin(&mut self, class_name: &str) {
        self.current_class = Some(class_name.to_string());
        self.class_logs
            .entry(class_name.to_string())
            .or_insert_with(|| ClassLog::new(class_name));
    }

    fn class_end(&mut self, _class_name: &str) {
        self.current_class = None;
    }

    fn method_begin(&mut self, method_sig: &str) {
        self.current_method = Some(method_sig.to_string());
        self.clear_method_buffers();
    }

    fn method_baseline(&mut self, _method_sig: &str, layout: &CodeLayout) {
        self.baseline = Some(
            layout
                .offsets
                .iter()
                .map(|(handle, offset)| (*offset, *handle))
                .collect(),
        );
    }

    fn new_probe(&mut self, _event_code: u8, live_keys: &BTreeSet<String>, location: &str) -> u32 {
        let id = match self.free_ids.iter().next().copied() {
            Some(id) => {
                self.free_ids.remove(&id);
                id
            }
            None => {
                let id = self.next_id;
                self.next_id += 1;
                id
            }
        };
        self.records.insert(
            id,
            ProbeRecord {
                id,
                location: location.to_string(),
                live_keys: live_keys.clone(),
                change_count: 0,
            },
        );
        id
    }

    fn probe_inserted(
        &mut self,
        id: u32,
        event_code: u8,
        patch: &[Handle],
        _anchor: Handle,
        precedes: bool,
    ) {
        self.inserts.push(BufferedInsert {
            id,
            event_code,
            handles: patch.to_vec(),
            precedes,
        });
    }

    fn exception_handler_added(&mut self, id: u32, handler: &ExceptionHandler, _removable: bool) {
        // Non-removable handlers appear in the log too, so later passes can
        // match them against live handler tables.
        self.handlers.push(BufferedHandler {
            id,
            handler: handler.clone(),
        });
    }

    fn call_interceptor_added(&mut self, id: u32, record: &InterceptRecord, anchor: Handle) {
        self.intercepts.push(BufferedIntercept {
            id,
            event_code: crate::events::EVENT_CALL_RETURN,
            record: record.clone(),
            anchor,
            action: ChangeAction::CallIntercept,
        });
    }

    fn field_interceptor_added(&mut self, id: u32, record: &InterceptRecord, anchor: Handle) {
        let event_code = match record.opcode {
            opcodes::GETSTATIC => crate::events::EVENT_GETSTATIC,
            opcodes::PUTSTATIC => crate::events::EVENT_PUTSTATIC,
            opcodes::GETFIELD => crate::events::EVENT_GETFIELD,
            _ => crate::events::EVENT_PUTFIELD,
        };
        self.intercepts.push(BufferedIntercept {
            id,
            event_code,
            record: record.clone(),
            anchor,
            action: ChangeAction::FieldIntercept,
        });
    }

    fn field_interceptor_method_added(&mut self, id: u32, method_sig: &str) {
        self.added_methods.push((id, method_sig.to_string()));
    }

    fn static_initializer_added(&mut self, method_sig: &str) {
        let log = self.current_class_log();
        log.method_log_mut(method_sig);
    }

    fn exit_probe_added(&mut self, id: u32) {
        self.exit_probe = Some(id);
    }

    fn probe_removed(&mut self, id: u32, _event_code: u8) {
        let released = match self.records.get_mut(&id) {
            Some(record) => {
                record.change_count = record.change_count.saturating_sub(1);
                record.change_count == 0
            }
            None => {
                warn!(probe = id, "removal reported for an unknown probe");
                false
            }
        };
        if released {
            self.records.remove(&id);
            self.free_ids.insert(id);
        }
    }

    fn synthetic_handler_added(&mut self, handler_pc_handle: Handle) {
        self.synthetic.push(handler_pc_handle);
    }

    fn method_end(&mut self, method_sig: &str, layout: &CodeLayout) {
        let baseline = self.baseline.take();
        let inserts = std::mem::take(&mut self.inserts);
        let intercepts = std::mem::take(&mut self.intercepts);
        let handlers = std::mem::take(&mut self.handlers);
        let synthetic = std::mem::take(&mut self.synthetic);
        let added_methods = std::mem::take(&mut self.added_methods);
        let exit_probe = self.exit_probe.take();

        let mut changes: Vec<BytecodeChange> = Vec::new();
        for insert in inserts {
            let Some(start) = insert
                .handles
                .iter()
                .filter_map(|h| layout.offset_of(*h))
                .min()
            else {
                warn!(method = %method_sig, "buffered insert vanished before commit");
                continue;
            };
            let length = layout.patch_length(&insert.handles);
            changes.push(BytecodeChange {
                id: insert.id,
                event_code: insert.event_code,
                start,
                length,
                precedes: insert.precedes,
                action: ChangeAction::Insert,
                interceptor: None,
            });
        }
        for intercept in intercepts {
            let Some(start) = layout.offset_of(intercept.anchor) else {
                warn!(method = %method_sig, "buffered interceptor vanished before commit");
                continue;
            };
            let length = match intercept.record.opcode {
                opcodes::INVOKEINTERFACE | opcodes::INVOKEDYNAMIC => 5,
                _ => 3,
            };
            changes.push(BytecodeChange {
                id: intercept.id,
                event_code: intercept.event_code,
                start,
                length,
                precedes: false,
                action: intercept.action,
                interceptor: Some(intercept.record),
            });
        }
        changes.sort_by_key(|change| change.start);

        for (id, sig) in &added_methods {
            self.current_class_log().record_added_method(sig, *id);
        }

        let log = self.current_class_log().method_log_mut(method_sig);

        // Adaptive rerun: rebase surviving offsets before new edits merge
        // in between them.
        if let Some(baseline) = &baseline {
            for change in &mut log.bytecode_log {
                if let Some(handle) = baseline.get(&change.start) {
                    if let Some(offset) = layout.offset_of(*handle) {
                        change.start = offset;
                    }
                }
            }
            log.bytecode_log.sort_by_key(|change| change.start);
            for handler in &mut log.handler_log {
                for pc in [
                    &mut handler.start_pc,
                    &mut handler.end_pc,
                    &mut handler.handler_pc,
                ] {
                    if let Some(handle) = baseline.get(pc) {
                        if let Some(offset) = layout.offset_of(*handle) {
                            *pc = offset;
                        }
                    }
                }
            }
            let old = std::mem::take(&mut log.synthetic_handlers);
            log.synthetic_handlers = old
                .into_iter()
                .map(|pc| {
                    baseline
                        .get(&pc)
                        .and_then(|handle| layout.offset_of(*handle))
                        .unwrap_or(pc)
                })
                .collect();
        }

        let mut counted: BTreeMap<u32, u16> = BTreeMap::new();
        for change in changes {
            *counted.entry(change.id).or_default() += 1;
            log.insert_change(change);
        }
        for buffered in handlers {
            let resolve = |handle: Handle| {
                if handle == crate::ir::END_HANDLE {
                    layout.total_len
                } else {
                    layout.offset_of(handle).unwrap_or(0)
                }
            };
            log.handler_log.push(AddedExceptionHandler {
                probe_id: buffered.id,
                start_pc: resolve(buffered.handler.start),
                end_pc: resolve(buffered.handler.end),
                handler_pc: resolve(buffered.handler.handler),
                catch_type: buffered
                    .handler
                    .catch_type
                    .clone()
                    .unwrap_or_else(|| CATCH_ANY.to_string()),
            });
        }
        for handle in synthetic {
            if let Some(offset) = layout.offset_of(handle) {
                log.synthetic_handlers.insert(offset);
            }
        }
        if exit_probe.is_some() {
            log.exit_probe_id = exit_probe;
        }

        for (id, count) in counted {
            if let Some(record) = self.records.get_mut(&id) {
                record.change_count = record.change_count.saturating_add(count);
            }
        }
        self.current_method = None;
    }
}
