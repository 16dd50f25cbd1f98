//! Probe patch fragments and synthesized methods.

use anyhow::Result;

use crate::dispatch::{
    self, FLAG_INTERCEPTOR, InstCode, PREPARE_WAIT_FIELD, PREPARE_WAIT_MILLIS, PROBE_CLASS,
    START_FLAG_FIELD,
};
use crate::events;
use crate::ir::{self, Instr, InstrKind, Method, MethodBody};
use crate::opcodes;
use crate::session::Session;

use super::code::{PatchBuilder, fresh_handle};

pub(super) fn invoke_static(owner: &str, name: &str, descriptor: &str) -> InstrKind {
    InstrKind::Invoke {
        opcode: opcodes::INVOKESTATIC,
        owner: owner.to_string(),
        name: name.to_string(),
        descriptor: descriptor.to_string(),
    }
}

pub(super) fn invoke_virtual(owner: &str, name: &str, descriptor: &str) -> InstrKind {
    InstrKind::Invoke {
        opcode: opcodes::INVOKEVIRTUAL,
        owner: owner.to_string(),
        name: name.to_string(),
        descriptor: descriptor.to_string(),
    }
}

pub(super) fn trigger_static(class_name: &str) -> InstrKind {
    invoke_static(class_name, dispatch::TRIGGER_STATIC, dispatch::TRIGGER_STATIC_SIG)
}

pub(super) fn trigger_obj(class_name: &str) -> InstrKind {
    invoke_static(class_name, dispatch::TRIGGER_OBJ, dispatch::TRIGGER_OBJ_SIG)
}

pub(super) fn trigger_mon(class_name: &str) -> InstrKind {
    invoke_static(class_name, dispatch::TRIGGER_MON, dispatch::TRIGGER_MON_SIG)
}

pub(super) fn trigger_catch(class_name: &str) -> InstrKind {
    invoke_static(class_name, dispatch::TRIGGER_CATCH, dispatch::TRIGGER_CATCH_SIG)
}

pub(super) fn raw(opcode: u8) -> InstrKind {
    InstrKind::Raw {
        opcode,
        operands: Vec::new(),
    }
}

pub(super) fn local(opcode: u8, index: u16) -> InstrKind {
    InstrKind::LocalVar { opcode, index }
}

/// Load opcode for a field or parameter descriptor.
pub(super) fn load_opcode(descriptor: &str) -> u8 {
    match descriptor.as_bytes().first() {
        Some(b'J') => opcodes::LLOAD,
        Some(b'D') => opcodes::DLOAD,
        Some(b'F') => opcodes::FLOAD,
        Some(b'L') | Some(b'[') => opcodes::ALOAD,
        _ => opcodes::ILOAD,
    }
}

pub(super) fn store_opcode(descriptor: &str) -> u8 {
    match descriptor.as_bytes().first() {
        Some(b'J') => opcodes::LSTORE,
        Some(b'D') => opcodes::DSTORE,
        Some(b'F') => opcodes::FSTORE,
        Some(b'L') | Some(b'[') => opcodes::ASTORE,
        _ => opcodes::ISTORE,
    }
}

pub(super) fn return_opcode(descriptor: &str) -> u8 {
    match descriptor.as_bytes().first() {
        Some(b'V') => opcodes::RETURN,
        Some(b'J') => opcodes::LRETURN,
        Some(b'D') => opcodes::DRETURN,
        Some(b'F') => opcodes::FRETURN,
        Some(b'L') | Some(b'[') => opcodes::ARETURN,
        _ => opcodes::IRETURN,
    }
}

pub(super) fn slot_width(descriptor: &str) -> u16 {
    match descriptor.as_bytes().first() {
        Some(b'J') | Some(b'D') => 2,
        _ => 1,
    }
}

/// Dotted class name as a JVM field-type fragment, `pkg.A` -> `Lpkg/A;`.
pub(super) fn class_type_descriptor(class_name: &str) -> String {
    format!("L{};", class_name.replace('.', "/"))
}

/// `<clinit>` stub consisting of a lone `return`, synthesized when the
/// class-prepare probe needs a static initializer to live in.
pub(super) fn synthesize_static_initializer() -> Method {
    let mut body = MethodBody::default();
    let handle = fresh_handle(&mut body);
    body.instructions.push(Instr {
        handle,
        pos: 0,
        kind: raw(opcodes::RETURN),
    });
    Method {
        name: "<clinit>".to_string(),
        descriptor: "()V".to_string(),
        access_flags: ir::ACC_STATIC,
        body: Some(body),
        synthetic: false,
    }
}

/// Busy-wait on the probe class's prepare flag. The preparing thread spins
/// in ~10ms sleeps until the dispatcher clears the flag.
pub(super) fn prepare_wait_patch(body: &mut MethodBody) -> super::code::Patch {
    let mut builder = PatchBuilder::new(body);
    let loop_head = builder.reserve();
    let done = builder.reserve();
    builder.push_with_handle(
        loop_head,
        InstrKind::FieldAccess {
            opcode: opcodes::GETSTATIC,
            owner: PROBE_CLASS.to_string(),
            name: PREPARE_WAIT_FIELD.to_string(),
            descriptor: "B".to_string(),
        },
    );
    builder.push(InstrKind::Branch {
        opcode: 0x99, // ifeq
        target: done,
    });
    builder.push(InstrKind::PushLong(PREPARE_WAIT_MILLIS as i64));
    builder.push(invoke_static("java.lang.Thread", "sleep", "(J)V"));
    builder.push(InstrKind::Branch {
        opcode: opcodes::GOTO,
        target: loop_head,
    });
    builder.push_with_handle(done, raw(opcodes::NOP));
    builder.finish()
}

/// Interceptor method name for a field access; the owner is folded in when
/// the interceptor cannot live in the owning class.
pub(super) fn field_interceptor_name(
    declaring_class: &str,
    owner: &str,
    field: &str,
    is_write: bool,
) -> String {
    let mode = if is_write { "write" } else { "read" };
    if declaring_class == owner {
        format!("{mode}_{field}$")
    } else {
        format!("{mode}_{}_{field}$", owner.replace('.', "_"))
    }
}

pub(super) fn call_interceptor_name(owner: &str, name: &str) -> String {
    format!(
        "call_{}_{}$",
        owner.replace('.', "_"),
        name.replace(['<', '>'], "_")
    )
}

/// Descriptor of the interceptor replacing one field instruction.
pub(super) fn field_interceptor_descriptor(field_opcode: u8, owner: &str, descriptor: &str) -> String {
    let owner_type = class_type_descriptor(owner);
    match field_opcode {
        opcodes::GETSTATIC => format!("(){descriptor}"),
        opcodes::PUTSTATIC => format!("({descriptor})V"),
        opcodes::GETFIELD => format!("({owner_type}){descriptor}"),
        _ => format!("({owner_type}{descriptor})V"),
    }
}

/// One-shot start probe: read the probe-class flag, set it, publish
/// `EVENT_START` exactly once.
pub(super) fn start_probe_patch(
    body: &mut MethodBody,
    class_name: &str,
    mask: i32,
) -> super::code::Patch {
    let mut builder = PatchBuilder::new(body);
    let skip = builder.reserve();
    builder.push(InstrKind::FieldAccess {
        opcode: opcodes::GETSTATIC,
        owner: PROBE_CLASS.to_string(),
        name: START_FLAG_FIELD.to_string(),
        descriptor: "Z".to_string(),
    });
    builder.push(InstrKind::Branch {
        opcode: 0x9a, // ifne
        target: skip,
    });
    builder.push(raw(opcodes::ICONST_1));
    builder.push(InstrKind::FieldAccess {
        opcode: opcodes::PUTSTATIC,
        owner: PROBE_CLASS.to_string(),
        name: START_FLAG_FIELD.to_string(),
        descriptor: "Z".to_string(),
    });
    builder.push(InstrKind::PushInt(mask));
    builder.push(trigger_static(class_name));
    builder.push_with_handle(skip, raw(opcodes::NOP));
    builder.finish()
}

/// Synthesized read or write interceptor for one field. The body performs
/// the original access, fires the probe, and returns.
pub(super) fn field_interceptor_method(
    session: &mut Session,
    declaring_class: &str,
    field_opcode: u8,
    owner: &str,
    field: &str,
    descriptor: &str,
    interceptor_name: &str,
    event_code: u8,
) -> Result<Method> {
    let is_static = matches!(field_opcode, opcodes::GETSTATIC | opcodes::PUTSTATIC);
    let is_read = matches!(field_opcode, opcodes::GETSTATIC | opcodes::GETFIELD);
    let method_descriptor = field_interceptor_descriptor(field_opcode, owner, descriptor);

    let payload = format!("{owner}#{field}#{descriptor}");
    let string_index = session.add_string(&payload)?;
    let mask = InstCode::new(event_code, string_index)
        .with_flags(FLAG_INTERCEPTOR)
        .encode();

    let mut body = MethodBody::default();
    let mut builder = PatchBuilder::new(&mut body);
    if is_read {
        if !is_static {
            builder.push(local(opcodes::ALOAD, 0));
        }
        builder.push(InstrKind::FieldAccess {
            opcode: field_opcode,
            owner: owner.to_string(),
            name: field.to_string(),
            descriptor: descriptor.to_string(),
        });
        builder.push(InstrKind::PushInt(mask));
        builder.push(trigger_static(declaring_class));
        builder.push(raw(return_opcode(descriptor)));
    } else {
        if !is_static {
            builder.push(local(opcodes::ALOAD, 0));
            builder.push(local(load_opcode(descriptor), 1));
        } else {
            builder.push(local(load_opcode(descriptor), 0));
        }
        builder.push(InstrKind::FieldAccess {
            opcode: field_opcode,
            owner: owner.to_string(),
            name: field.to_string(),
            descriptor: descriptor.to_string(),
        });
        builder.push(InstrKind::PushInt(mask));
        builder.push(trigger_static(declaring_class));
        builder.push(raw(opcodes::RETURN));
    }
    let patch = builder.finish();
    body.max_stack = patch.peak_stack.max(2);
    body.max_locals = if is_static {
        slot_width(descriptor)
    } else {
        1 + slot_width(descriptor)
    };
    body.instructions = patch.instrs;

    Ok(Method {
        name: interceptor_name.to_string(),
        descriptor: method_descriptor,
        access_flags: ir::ACC_PRIVATE | ir::ACC_STATIC | ir::ACC_FINAL,
        body: Some(body),
        synthetic: true,
    })
}

/// Synthesized call interceptor: performs the original invoke, then fires
/// the probe, preserving the return value on the stack.
pub(super) fn call_interceptor_method(
    session: &mut Session,
    declaring_class: &str,
    call_opcode: u8,
    owner: &str,
    name: &str,
    descriptor: &str,
    interceptor_name: &str,
    event_code: u8,
) -> Result<Method> {
    let has_receiver = call_opcode != opcodes::INVOKESTATIC;
    let (params, return_type) = split_descriptor(descriptor);
    let owner_type = class_type_descriptor(owner);
    let method_descriptor = if has_receiver {
        format!("({owner_type}{params}){return_type}")
    } else {
        descriptor.to_string()
    };

    let payload = format!("{owner}#{name}#{descriptor}");
    let string_index = session.add_string(&payload)?;
    let mask = InstCode::new(event_code, string_index)
        .with_flags(FLAG_INTERCEPTOR)
        .encode();

    let parameters = parameter_descriptors(&params);
    let expected = crate::descriptor::method_param_count(descriptor)?;
    if parameters.len() != expected {
        anyhow::bail!("parameter split of {descriptor:?} disagrees with the descriptor parser");
    }

    let mut body = MethodBody::default();
    let mut builder = PatchBuilder::new(&mut body);
    let mut slot = 0u16;
    if has_receiver {
        builder.push(local(opcodes::ALOAD, slot));
        slot += 1;
    }
    for param in parameters {
        builder.push(local(load_opcode(&param), slot));
        slot += slot_width(&param);
    }
    builder.push(InstrKind::Invoke {
        opcode: call_opcode,
        owner: owner.to_string(),
        name: name.to_string(),
        descriptor: descriptor.to_string(),
    });
    builder.push(InstrKind::PushInt(mask));
    builder.push(trigger_static(declaring_class));
    builder.push(raw(return_opcode(&return_type)));
    let patch = builder.finish();
    body.max_stack = patch.peak_stack.max(slot).max(2);
    body.max_locals = slot;
    body.instructions = patch.instrs;

    Ok(Method {
        name: interceptor_name.to_string(),
        descriptor: method_descriptor,
        access_flags: ir::ACC_PRIVATE | ir::ACC_STATIC | ir::ACC_FINAL,
        body: Some(body),
        synthetic: true,
    })
}

/// Split `(<params>)<ret>` into parameter and return fragments.
pub(super) fn split_descriptor(descriptor: &str) -> (String, String) {
    match descriptor.rsplit_once(')') {
        Some((params, ret)) => (
            params.strip_prefix('(').unwrap_or(params).to_string(),
            ret.to_string(),
        ),
        None => (String::new(), "V".to_string()),
    }
}

/// Individual parameter descriptors of a parameter fragment.
pub(super) fn parameter_descriptors(params: &str) -> Vec<String> {
    let mut result = Vec::new();
    let bytes = params.as_bytes();
    let mut index = 0;
    while index < bytes.len() {
        let start = index;
        while bytes[index] == b'[' {
            index += 1;
        }
        if bytes[index] == b'L' {
            while bytes[index] != b';' {
                index += 1;
            }
        }
        index += 1;
        result.push(params[start..index].to_string());
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameter_descriptors_split_wide_array_and_reference_types() {
        let params = parameter_descriptors("IJ[Ljava/lang/String;[[ID");
        assert_eq!(params, vec!["I", "J", "[Ljava/lang/String;", "[[I", "D"]);
    }

    #[test]
    fn field_write_interceptor_matches_store_shape() {
        let mut session = Session::new();
        let method = field_interceptor_method(
            &mut session,
            "pkg.A",
            opcodes::PUTFIELD,
            "pkg.A",
            "f",
            "I",
            "write_f$",
            events::EVENT_PUTFIELD,
        )
        .expect("interceptor");

        assert_eq!(method.name, "write_f$");
        assert_eq!(method.descriptor, "(Lpkg/A;I)V");
        assert!(method.is_static());
        let body = method.body.expect("body");
        let opcodes_seen: Vec<u8> = body.instructions.iter().map(|i| i.kind.opcode()).collect();
        assert_eq!(
            opcodes_seen,
            vec![
                opcodes::ALOAD,
                opcodes::ILOAD,
                opcodes::PUTFIELD,
                opcodes::LDC_W,
                opcodes::INVOKESTATIC,
                opcodes::RETURN
            ]
        );
    }

    #[test]
    fn static_read_interceptor_returns_field_value() {
        let mut session = Session::new();
        let method = field_interceptor_method(
            &mut session,
            "pkg.A",
            opcodes::GETSTATIC,
            "pkg.A",
            "count",
            "J",
            "read_count$",
            events::EVENT_GETSTATIC,
        )
        .expect("interceptor");

        assert_eq!(method.descriptor, "()J");
        let body = method.body.expect("body");
        assert_eq!(
            body.instructions.last().expect("return").kind.opcode(),
            opcodes::LRETURN
        );
    }

    #[test]
    fn call_interceptor_threads_receiver_and_args() {
        let mut session = Session::new();
        let method = call_interceptor_method(
            &mut session,
            "pkg.A",
            opcodes::INVOKEVIRTUAL,
            "pkg.B",
            "run",
            "(IJ)I",
            "call_run$0",
            events::EVENT_VIRTUAL_CALL,
        )
        .expect("interceptor");

        assert_eq!(method.descriptor, "(Lpkg/B;IJ)I");
        let body = method.body.expect("body");
        let opcodes_seen: Vec<u8> = body.instructions.iter().map(|i| i.kind.opcode()).collect();
        assert_eq!(
            opcodes_seen,
            vec![
                opcodes::ALOAD,
                opcodes::ILOAD,
                opcodes::LLOAD,
                opcodes::INVOKEVIRTUAL,
                opcodes::LDC_W,
                opcodes::INVOKESTATIC,
                opcodes::IRETURN
            ]
        );
        assert_eq!(body.max_locals, 4);
    }

    #[test]
    fn prepare_wait_patch_loops_until_cleared() {
        let mut body = MethodBody::default();
        let patch = prepare_wait_patch(&mut body);
        let opcodes_seen: Vec<u8> = patch.instrs.iter().map(|i| i.kind.opcode()).collect();
        assert_eq!(
            opcodes_seen,
            vec![
                opcodes::GETSTATIC,
                0x99,
                opcodes::LDC2_W,
                opcodes::INVOKESTATIC,
                opcodes::GOTO,
                opcodes::NOP
            ]
        );
        // Back edge returns to the flag read.
        let goto = patch
            .instrs
            .iter()
            .find(|i| i.kind.opcode() == opcodes::GOTO)
            .expect("goto");
        match &goto.kind {
            InstrKind::Branch { target, .. } => {
                assert_eq!(*target, patch.instrs[0].handle);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn start_probe_guards_on_probe_class_flag() {
        let mut body = MethodBody::default();
        let mask = InstCode::new(events::EVENT_START, 0).encode();
        let patch = start_probe_patch(&mut body, "pkg.Main", mask);
        let opcodes_seen: Vec<u8> = patch.instrs.iter().map(|i| i.kind.opcode()).collect();
        assert_eq!(
            opcodes_seen,
            vec![
                opcodes::GETSTATIC,
                0x9a,
                opcodes::ICONST_1,
                opcodes::PUTSTATIC,
                opcodes::LDC_W,
                opcodes::INVOKESTATIC,
                opcodes::NOP
            ]
        );
    }
}
