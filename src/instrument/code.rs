//! Editing operations on method bodies: patch insertion, targeter updates,
//! removal, and byte-offset layout.

use std::collections::BTreeMap;

use anyhow::{Context, Result};

use crate::ir::{Handle, Instr, InstrKind, MethodBody};
use crate::opcodes;

/// A prepared instruction sequence with its peak operand-stack demand.
#[derive(Clone, Debug)]
pub(crate) struct Patch {
    pub(crate) instrs: Vec<Instr>,
    pub(crate) peak_stack: u16,
}

impl Patch {
    pub(crate) fn handles(&self) -> Vec<Handle> {
        self.instrs.iter().map(|i| i.handle).collect()
    }

    pub(crate) fn first_handle(&self) -> Handle {
        self.instrs.first().map(|i| i.handle).expect("non-empty patch")
    }
}

/// Builds a patch against a body, handing out stable handles up front so
/// intra-patch branches can be wired before insertion.
pub(crate) struct PatchBuilder<'a> {
    body: &'a mut MethodBody,
    instrs: Vec<Instr>,
    depth: i32,
    peak: i32,
}

impl<'a> PatchBuilder<'a> {
    pub(crate) fn new(body: &'a mut MethodBody) -> Self {
        Self {
            body,
            instrs: Vec::new(),
            depth: 0,
            peak: 0,
        }
    }

    /// Reserve a handle for a forward branch target inside this patch.
    pub(crate) fn reserve(&mut self) -> Handle {
        fresh_handle(self.body)
    }

    pub(crate) fn push(&mut self, kind: InstrKind) -> Handle {
        let handle = fresh_handle(self.body);
        self.push_with_handle(handle, kind);
        handle
    }

    /// Emit at a previously reserved handle.
    pub(crate) fn push_with_handle(&mut self, handle: Handle, kind: InstrKind) {
        self.depth += stack_delta(&kind);
        if self.depth > self.peak {
            self.peak = self.depth;
        }
        self.instrs.push(Instr {
            handle,
            pos: -1,
            kind,
        });
    }

    /// Emit an instruction carrying a real (walkable) position, used by the
    /// synchronized-method desugaring whose monitor ops must be probed.
    pub(crate) fn push_with_pos(&mut self, kind: InstrKind, pos: i32) -> Handle {
        let handle = fresh_handle(self.body);
        self.depth += stack_delta(&kind);
        if self.depth > self.peak {
            self.peak = self.depth;
        }
        self.instrs.push(Instr { handle, pos, kind });
        handle
    }

    pub(crate) fn finish(self) -> Patch {
        Patch {
            instrs: self.instrs,
            peak_stack: self.peak.max(0) as u16,
        }
    }
}

pub(crate) fn fresh_handle(body: &mut MethodBody) -> Handle {
    let handle = body.next_handle;
    body.next_handle += 1;
    handle
}

/// Insert `patch` before `anchor`.
///
/// With `retarget`, every branch, switch, and handler-PC pointing at the
/// anchor is rewritten to the patch head so the probe runs however control
/// arrives; handler `start`/`end` anchors are never widened outward.
pub(crate) fn insert_before(
    body: &mut MethodBody,
    anchor: Handle,
    patch: Patch,
    retarget: bool,
) -> Result<Vec<Handle>> {
    let index = body
        .index_of(anchor)
        .with_context(|| format!("insert anchor {anchor} not in method"))?;
    let handles = patch.handles();
    if retarget {
        if let Some(first) = handles.first() {
            update_targeters(body, anchor, *first);
        }
    }
    bump_stack(body, patch.peak_stack);
    body.instructions.splice(index..index, patch.instrs);
    Ok(handles)
}

/// Insert `patch` after `anchor`; fall-through only, nothing is retargeted.
pub(crate) fn insert_after(body: &mut MethodBody, anchor: Handle, patch: Patch) -> Result<Vec<Handle>> {
    let index = body
        .index_of(anchor)
        .with_context(|| format!("insert anchor {anchor} not in method"))?;
    let handles = patch.handles();
    bump_stack(body, patch.peak_stack);
    body.instructions.splice(index + 1..index + 1, patch.instrs);
    Ok(handles)
}

/// Append `patch` at the end of the method (out-of-line handler bodies).
pub(crate) fn append(body: &mut MethodBody, patch: Patch) -> Vec<Handle> {
    let handles = patch.handles();
    bump_stack(body, patch.peak_stack);
    body.instructions.extend(patch.instrs);
    handles
}

/// Swap the instruction form at `anchor`, returning the original. Position
/// and handle survive, so targeters and the offset map stay valid.
pub(crate) fn replace_kind(body: &mut MethodBody, anchor: Handle, kind: InstrKind) -> Result<InstrKind> {
    let index = body
        .index_of(anchor)
        .with_context(|| format!("replace anchor {anchor} not in method"))?;
    Ok(std::mem::replace(&mut body.instructions[index].kind, kind))
}

/// Delete a contiguous handle range; targeters of any removed instruction
/// land on the first surviving successor.
pub(crate) fn remove_range(body: &mut MethodBody, handles: &[Handle]) -> Result<()> {
    if handles.is_empty() {
        return Ok(());
    }
    let first = body
        .index_of(handles[0])
        .with_context(|| format!("remove anchor {} not in method", handles[0]))?;
    let last = first + handles.len() - 1;
    if last >= body.instructions.len() {
        anyhow::bail!("remove range runs past method end");
    }
    for (offset, handle) in handles.iter().enumerate() {
        if body.instructions[first + offset].handle != *handle {
            anyhow::bail!("remove range is not contiguous at handle {handle}");
        }
    }
    // Out-of-line probe code may sit at the very end of the method; with
    // no successor there is nothing left to retarget onto.
    let successor = body.instructions.get(last + 1).map(|i| i.handle);
    if let Some(successor) = successor {
        for handle in handles {
            update_targeters(body, *handle, successor);
            retarget_handler_bounds(body, *handle, successor);
        }
    }
    body.instructions.drain(first..=last);
    Ok(())
}

/// Rewrite every branch, switch, and handler handler-PC from `old` to
/// `new`. Handler `start`/`end` are left alone.
pub(crate) fn update_targeters(body: &mut MethodBody, old: Handle, new: Handle) {
    for instr in &mut body.instructions {
        match &mut instr.kind {
            InstrKind::Branch { target, .. } => {
                if *target == old {
                    *target = new;
                }
            }
            InstrKind::TableSwitch { default, targets, .. } => {
                if *default == old {
                    *default = new;
                }
                for target in targets {
                    if *target == old {
                        *target = new;
                    }
                }
            }
            InstrKind::LookupSwitch { default, pairs } => {
                if *default == old {
                    *default = new;
                }
                for (_, target) in pairs {
                    if *target == old {
                        *target = new;
                    }
                }
            }
            _ => {}
        }
    }
    for handler in &mut body.handlers {
        if handler.handler == old {
            handler.handler = new;
        }
    }
}

/// Only used on removal, where a deleted instruction may anchor a protected
/// region boundary.
fn retarget_handler_bounds(body: &mut MethodBody, old: Handle, new: Handle) {
    for handler in &mut body.handlers {
        if handler.start == old {
            handler.start = new;
        }
        if handler.end == old {
            handler.end = new;
        }
    }
}

fn bump_stack(body: &mut MethodBody, peak: u16) {
    // Patches restore the stack they found; the method only needs headroom
    // for the deepest patch.
    let needed = body.max_stack.saturating_add(peak);
    if needed > body.max_stack {
        body.max_stack = needed;
    }
}

/// Net operand-stack effect of the instruction forms patches emit.
fn stack_delta(kind: &InstrKind) -> i32 {
    match kind {
        InstrKind::PushInt(_) | InstrKind::PushString(_) | InstrKind::PushClass(_) => 1,
        InstrKind::PushLong(_) => 2,
        InstrKind::Invoke { opcode, owner: _, name: _, descriptor } => {
            invoke_stack_delta(*opcode, descriptor)
        }
        InstrKind::FieldAccess { opcode, descriptor, .. } => match *opcode {
            opcodes::GETSTATIC => type_width(descriptor),
            opcodes::PUTSTATIC => -type_width(descriptor),
            opcodes::GETFIELD => type_width(descriptor) - 1,
            opcodes::PUTFIELD => -type_width(descriptor) - 1,
            _ => 0,
        },
        InstrKind::LocalVar { opcode, .. } => match *opcode {
            opcodes::ILOAD | opcodes::FLOAD | opcodes::ALOAD => 1,
            opcodes::LLOAD | opcodes::DLOAD => 2,
            opcodes::ISTORE | opcodes::FSTORE | opcodes::ASTORE => -1,
            opcodes::LSTORE | opcodes::DSTORE => -2,
            _ => 0,
        },
        InstrKind::Raw { opcode, .. } => match *opcode {
            opcodes::DUP => 1,
            opcodes::POP => -1,
            opcodes::ICONST_0 | opcodes::ICONST_1 | opcodes::ACONST_NULL => 1,
            opcodes::MONITORENTER | opcodes::MONITOREXIT => -1,
            opcodes::ATHROW => -1,
            opcodes::IRETURN | opcodes::FRETURN | opcodes::ARETURN => -1,
            opcodes::LRETURN | opcodes::DRETURN => -2,
            _ => 0,
        },
        InstrKind::TypeRef { opcode, .. } => match *opcode {
            opcodes::NEW => 1,
            _ => 0,
        },
        InstrKind::Branch { opcode, .. } => match *opcode {
            opcodes::GOTO | opcodes::GOTO_W => 0,
            opcodes::IFNULL | opcodes::IFNONNULL => -1,
            op if (0x99..=0x9e).contains(&op) => -1,
            op if (opcodes::IF_ICMPEQ..=opcodes::IF_ACMPNE).contains(&op) => -2,
            _ => 0,
        },
        InstrKind::TableSwitch { .. } | InstrKind::LookupSwitch { .. } => -1,
    }
}

fn invoke_stack_delta(opcode: u8, descriptor: &str) -> i32 {
    let (args, ret) = descriptor_slots(descriptor);
    let receiver = if opcode == opcodes::INVOKESTATIC { 0 } else { 1 };
    ret - args - receiver
}

/// Argument and return slot counts of a JVM method descriptor.
fn descriptor_slots(descriptor: &str) -> (i32, i32) {
    let mut args = 0;
    let mut chars = descriptor.chars();
    if chars.next() != Some('(') {
        return (0, 0);
    }
    let mut in_class = false;
    let mut in_args = true;
    let mut ret = 0;
    while let Some(c) = chars.next() {
        if in_class {
            if c == ';' {
                in_class = false;
            }
            continue;
        }
        match c {
            ')' => in_args = false,
            'J' | 'D' => {
                if in_args {
                    args += 2;
                } else {
                    ret = 2;
                }
            }
            'L' => {
                in_class = true;
                if in_args {
                    args += 1;
                } else {
                    ret = 1;
                }
            }
            '[' => continue,
            'V' => {
                if !in_args {
                    ret = 0;
                }
            }
            _ => {
                if in_args {
                    args += 1;
                } else {
                    ret = 1;
                }
            }
        }
    }
    (args, ret)
}

fn type_width(descriptor: &str) -> i32 {
    match descriptor.chars().next() {
        Some('J') | Some('D') => 2,
        _ => 1,
    }
}

/// Byte layout of a method body after editing.
#[derive(Clone, Debug, Default)]
pub(crate) struct CodeLayout {
    pub(crate) offsets: BTreeMap<Handle, u32>,
    pub(crate) widths: BTreeMap<Handle, u32>,
    /// Original position index to rewritten byte offset.
    pub(crate) pos_offsets: BTreeMap<i32, u32>,
    pub(crate) total_len: u32,
}

impl CodeLayout {
    pub(crate) fn offset_of(&self, handle: Handle) -> Option<u32> {
        self.offsets.get(&handle).copied()
    }

    pub(crate) fn patch_length(&self, handles: &[Handle]) -> u32 {
        handles
            .iter()
            .filter_map(|h| self.widths.get(h))
            .sum()
    }
}

/// Assign byte offsets in list order. Switch padding depends on the offset
/// reached, so a single forward pass settles everything.
pub(crate) fn layout(body: &MethodBody) -> CodeLayout {
    let mut result = CodeLayout::default();
    let mut offset = 0u32;
    for instr in &body.instructions {
        let width = encoded_width(&instr.kind, offset);
        result.offsets.insert(instr.handle, offset);
        result.widths.insert(instr.handle, width);
        if instr.pos >= 0 {
            result.pos_offsets.insert(instr.pos, offset);
        }
        offset += width;
    }
    result.total_len = offset;
    result
}

fn encoded_width(kind: &InstrKind, offset: u32) -> u32 {
    match kind {
        InstrKind::Raw { operands, .. } => 1 + operands.len() as u32,
        InstrKind::Branch { opcode, .. } => {
            if *opcode == opcodes::GOTO_W || *opcode == opcodes::JSR_W {
                5
            } else {
                3
            }
        }
        InstrKind::TableSwitch { targets, .. } => {
            let padding = opcodes::switch_padding(offset as usize) as u32;
            1 + padding + 12 + 4 * targets.len() as u32
        }
        InstrKind::LookupSwitch { pairs, .. } => {
            let padding = opcodes::switch_padding(offset as usize) as u32;
            1 + padding + 8 + 8 * pairs.len() as u32
        }
        InstrKind::Invoke { opcode, .. } => {
            if *opcode == opcodes::INVOKEINTERFACE || *opcode == opcodes::INVOKEDYNAMIC {
                5
            } else {
                3
            }
        }
        InstrKind::FieldAccess { .. } | InstrKind::TypeRef { .. } => 3,
        InstrKind::PushInt(value) => {
            if (0..=5).contains(value) {
                1
            } else if i8::try_from(*value).is_ok() {
                2
            } else if i16::try_from(*value).is_ok() {
                3
            } else {
                3
            }
        }
        InstrKind::PushLong(_) => 3,
        InstrKind::PushString(_) | InstrKind::PushClass(_) => 3,
        InstrKind::LocalVar { index, .. } => {
            if *index > u8::MAX as u16 {
                4
            } else {
                2
            }
        }
    }
}
