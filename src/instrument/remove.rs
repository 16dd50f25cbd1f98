//! Probe removal: replays the probe log against a previously instrumented
//! class and strips the edits belonging to a remove set.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result};
use tracing::warn;

use crate::ir::{Class, Handle, InstrKind};
use crate::probelog::{AddedExceptionHandler, ChangeAction, ClassLog};

use super::InstrumentObserver;
use super::code;

/// Remove every physical edit belonging to `remove` from `class`, keeping
/// the log and the live instruction list in lock-step.
pub(crate) fn remove_probes(
    class: &mut Class,
    class_log: &mut ClassLog,
    remove: &BTreeSet<u32>,
    observer: &mut dyn InstrumentObserver,
) -> Result<()> {
    for (sig, method_log) in class_log.method_logs.iter_mut() {
        let Some(method) = class.methods.iter_mut().find(|m| &m.signature() == sig) else {
            warn!(class = %class.name, method = %sig, "probe log names a missing method");
            continue;
        };
        let Some(body) = method.body.as_mut() else {
            continue;
        };

        let before = code::layout(body);
        let offset_to_handle: BTreeMap<u32, Handle> = before
            .offsets
            .iter()
            .map(|(handle, offset)| (*offset, *handle))
            .collect();

        // Handlers registered for removed probes detach first, while their
        // logged PCs still resolve against live instructions.
        let removed_handlers: Vec<AddedExceptionHandler> = method_log
            .handler_log
            .iter()
            .filter(|handler| remove.contains(&handler.probe_id))
            .cloned()
            .collect();
        for logged in &removed_handlers {
            let start = offset_to_handle.get(&logged.start_pc);
            let handler_pc = offset_to_handle.get(&logged.handler_pc);
            body.handlers.retain(|handler| {
                !(Some(&handler.start) == start && Some(&handler.handler) == handler_pc)
            });
        }

        // Apply removals by handle; handles stay stable across edits, the
        // recorded offsets do not.
        let changes: Vec<_> = method_log
            .bytecode_log
            .iter()
            .filter(|change| remove.contains(&change.id))
            .cloned()
            .collect();
        for change in &changes {
            let handle = *offset_to_handle.get(&change.start).with_context(|| {
                format!(
                    "probe log offset {} is not an instruction boundary in {}",
                    change.start, sig
                )
            })?;
            match change.action {
                ChangeAction::Insert => {
                    let handles = handle_run(body, &before, handle, change.length)
                        .with_context(|| format!("resolve insert range in {sig}"))?;
                    code::remove_range(body, &handles)
                        .with_context(|| format!("remove probe {} from {sig}", change.id))?;
                }
                ChangeAction::CallIntercept => {
                    let record = change
                        .interceptor
                        .as_ref()
                        .context("call intercept change without restore record")?;
                    code::replace_kind(
                        body,
                        handle,
                        InstrKind::Invoke {
                            opcode: record.opcode,
                            owner: record.owner.clone(),
                            name: record.name.clone(),
                            descriptor: record.descriptor.clone(),
                        },
                    )?;
                }
                ChangeAction::FieldIntercept => {
                    let record = change
                        .interceptor
                        .as_ref()
                        .context("field intercept change without restore record")?;
                    code::replace_kind(
                        body,
                        handle,
                        InstrKind::FieldAccess {
                            opcode: record.opcode,
                            owner: record.owner.clone(),
                            name: record.name.clone(),
                            descriptor: record.descriptor.clone(),
                        },
                    )?;
                }
            }
            observer.probe_removed(change.id, change.event_code);
        }

        for id in remove {
            method_log.remove_changes_for(*id);
        }

        // Surviving log entries re-resolve through the post-edit layout.
        let after = code::layout(body);
        for change in &mut method_log.bytecode_log {
            if let Some(handle) = offset_to_handle.get(&change.start) {
                if let Some(offset) = after.offset_of(*handle) {
                    change.start = offset;
                }
            }
        }
        for handler in &mut method_log.handler_log {
            for pc in [
                &mut handler.start_pc,
                &mut handler.end_pc,
                &mut handler.handler_pc,
            ] {
                if let Some(handle) = offset_to_handle.get(pc) {
                    if let Some(offset) = after.offset_of(*handle) {
                        *pc = offset;
                    }
                }
            }
        }
        let synthetic = std::mem::take(&mut method_log.synthetic_handlers);
        method_log.synthetic_handlers = synthetic
            .into_iter()
            .filter_map(|pc| {
                offset_to_handle
                    .get(&pc)
                    .and_then(|handle| after.offset_of(*handle))
            })
            .collect();
    }

    // Synthesized methods whose last requesting probe went away disappear
    // with it.
    let mut dropped = Vec::new();
    class_log.added_methods.retain(|sig, ids| {
        ids.retain(|id| !remove.contains(id));
        if ids.is_empty() {
            dropped.push(sig.clone());
            false
        } else {
            true
        }
    });
    for sig in dropped {
        class.methods.retain(|m| m.signature() != sig);
    }
    Ok(())
}

/// The contiguous instruction run starting at `head` whose encoded widths
/// sum to exactly `length` bytes.
fn handle_run(
    body: &crate::ir::MethodBody,
    layout: &code::CodeLayout,
    head: Handle,
    length: u32,
) -> Result<Vec<Handle>> {
    let start_index = body
        .index_of(head)
        .context("insert head not in instruction list")?;
    let mut covered = 0;
    let mut handles = Vec::new();
    for instr in &body.instructions[start_index..] {
        if covered >= length {
            break;
        }
        covered += layout
            .widths
            .get(&instr.handle)
            .copied()
            .context("instruction missing from layout")?;
        handles.push(instr.handle);
    }
    if covered != length {
        anyhow::bail!("insert length {length} does not align with instruction widths");
    }
    Ok(handles)
}
