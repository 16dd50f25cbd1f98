use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use jclassfile::class_file;
use jclassfile::constant_pool::ConstantPool;
use rayon::prelude::*;
use zip::ZipArchive;

use crate::ir::{
    Class, END_HANDLE, ExceptionHandler, Field, Handle, Instr, InstrKind, Method, MethodBody,
};
use crate::opcodes;

/// Parsed classes and counts for one scan.
pub(crate) struct ScanOutput {
    pub(crate) classes: Vec<Class>,
    /// Names of classes coming from the input paths, as opposed to
    /// classpath dependencies.
    pub(crate) input_classes: BTreeSet<String>,
    pub(crate) class_count: usize,
    pub(crate) artifact_count: usize,
}

pub(crate) fn scan_inputs(inputs: &[PathBuf], classpath: &[PathBuf]) -> Result<ScanOutput> {
    let mut pending: Vec<(Vec<u8>, String, bool)> = Vec::new();
    let mut artifact_count = 0;

    for input in inputs {
        collect_path(input, true, true, &mut pending, &mut artifact_count)?;
    }

    // Deterministic ordering for classpath entries and their manifest
    // expansions.
    let mut classpath_entries = classpath.to_vec();
    classpath_entries.sort_by(|a, b| path_key(a).cmp(&path_key(b)));
    for input in inputs {
        if is_jar_path(input) {
            classpath_entries.extend(manifest_classpath(input)?);
        }
    }
    let expanded = expand_classpath(classpath_entries)?;
    for entry in expanded {
        if inputs.contains(&entry) {
            continue;
        }
        collect_path(&entry, false, true, &mut pending, &mut artifact_count)?;
    }

    let parsed: Vec<(Class, bool)> = pending
        .par_iter()
        .map(|(data, uri, is_input)| {
            let class = parse_class_bytes(data, Some(uri.clone()))
                .with_context(|| format!("failed to parse {uri}"))?;
            Ok((class, *is_input))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut classes = Vec::new();
    let mut input_classes = BTreeSet::new();
    for (class, is_input) in parsed {
        if is_input {
            input_classes.insert(class.name.clone());
        }
        classes.push(class);
    }
    let class_count = classes.len();

    Ok(ScanOutput {
        classes,
        input_classes,
        class_count,
        artifact_count,
    })
}

fn collect_path(
    path: &Path,
    is_input: bool,
    strict: bool,
    pending: &mut Vec<(Vec<u8>, String, bool)>,
    artifact_count: &mut usize,
) -> Result<()> {
    if path.is_dir() {
        let mut entries = Vec::new();
        for entry in fs::read_dir(path)
            .with_context(|| format!("failed to read directory {}", path.display()))?
        {
            let entry =
                entry.with_context(|| format!("failed to read entry under {}", path.display()))?;
            entries.push(entry.path());
        }
        entries.sort_by(|a, b| path_key(a).cmp(&path_key(b)));
        for entry in entries {
            collect_path(&entry, is_input, false, pending, artifact_count)?;
        }
        return Ok(());
    }

    let extension = path.extension().and_then(|ext| ext.to_str()).unwrap_or("");
    match extension {
        "class" => {
            let data =
                fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
            *artifact_count += 1;
            pending.push((data, path.to_string_lossy().to_string(), is_input));
            Ok(())
        }
        "jar" => collect_jar(path, is_input, pending, artifact_count),
        _ => {
            if strict {
                anyhow::bail!("unsupported input file: {}", path.display())
            } else {
                Ok(())
            }
        }
    }
}

fn collect_jar(
    path: &Path,
    is_input: bool,
    pending: &mut Vec<(Vec<u8>, String, bool)>,
    artifact_count: &mut usize,
) -> Result<()> {
    let file = fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut archive =
        ZipArchive::new(file).with_context(|| format!("failed to read {}", path.display()))?;
    *artifact_count += 1;

    let mut entry_names = Vec::new();
    for index in 0..archive.len() {
        let entry = archive
            .by_index(index)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        if name.ends_with(".class") && !name.ends_with("module-info.class") {
            entry_names.push(name);
        }
    }
    entry_names.sort();

    for name in entry_names {
        let mut entry = archive
            .by_name(&name)
            .with_context(|| format!("failed to read {}:{}", path.display(), name))?;
        let mut data = Vec::new();
        entry
            .read_to_end(&mut data)
            .with_context(|| format!("failed to read {}:{}", path.display(), name))?;
        *artifact_count += 1;
        pending.push((
            data,
            format!("jar:{}!/{}", path.to_string_lossy(), name),
            is_input,
        ));
    }
    Ok(())
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

fn is_jar_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("jar"))
        .unwrap_or(false)
}

fn expand_classpath(initial: Vec<PathBuf>) -> Result<Vec<PathBuf>> {
    let mut queue = VecDeque::new();
    let mut initial_sorted = initial;
    initial_sorted.sort_by(|a, b| path_key(a).cmp(&path_key(b)));
    for entry in initial_sorted {
        queue.push_back(entry);
    }

    let mut seen = BTreeSet::new();
    let mut result = Vec::new();
    while let Some(entry) = queue.pop_front() {
        let key = path_key(&entry);
        if !seen.insert(key) {
            continue;
        }
        if !entry.exists() {
            anyhow::bail!("classpath entry not found: {}", entry.display());
        }
        result.push(entry.clone());
        if is_jar_path(&entry) {
            let mut referenced = manifest_classpath(&entry)?;
            referenced.sort_by(|a, b| path_key(a).cmp(&path_key(b)));
            for item in referenced {
                queue.push_back(item);
            }
        }
    }

    Ok(result)
}

fn manifest_classpath(path: &Path) -> Result<Vec<PathBuf>> {
    let file = fs::File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut archive =
        ZipArchive::new(file).with_context(|| format!("failed to read {}", path.display()))?;
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if entry.name() != "META-INF/MANIFEST.MF" {
            continue;
        }
        let mut content = String::new();
        entry
            .read_to_string(&mut content)
            .with_context(|| format!("failed to read {}", entry.name()))?;
        return Ok(parse_manifest_classpath(path, &content));
    }

    Ok(Vec::new())
}

fn parse_manifest_classpath(jar_path: &Path, content: &str) -> Vec<PathBuf> {
    let mut class_path = None;
    let mut current_key = None;
    let mut current_value = String::new();

    for raw_line in content.lines() {
        let line = raw_line.trim_end_matches('\r');
        if line.starts_with(' ') {
            if current_key.is_some() {
                current_value.push_str(&line[1..]);
            }
            continue;
        }

        if let Some(key) = current_key.take() {
            if key == "Class-Path" {
                class_path = Some(current_value.clone());
            }
            current_value.clear();
        }

        if let Some((key, value)) = line.split_once(':') {
            current_key = Some(key.trim().to_string());
            current_value.push_str(value.trim_start());
        }
    }

    if let Some(key) = current_key.take() {
        if key == "Class-Path" {
            class_path = Some(current_value.clone());
        }
    }

    let Some(class_path) = class_path else {
        return Vec::new();
    };

    let base_dir = jar_path.parent().unwrap_or_else(|| Path::new(""));
    class_path
        .split_whitespace()
        .map(|entry| {
            let entry_path = PathBuf::from(entry);
            if entry_path.is_absolute() {
                entry_path
            } else {
                base_dir.join(entry_path)
            }
        })
        .collect()
}

/// Dotted form of a slashed internal class name.
fn dotted(name: &str) -> String {
    name.replace('/', ".")
}

pub(crate) fn parse_class_bytes(data: &[u8], artifact: Option<String>) -> Result<Class> {
    let class_file = class_file::parse(data).context("failed to parse class file bytes")?;
    let constant_pool = class_file.constant_pool();
    let class_name = dotted(
        &resolve_class_name(constant_pool, class_file.this_class()).context("resolve class name")?,
    );
    let super_name = if class_file.super_class() == 0 {
        None
    } else {
        Some(dotted(
            &resolve_class_name(constant_pool, class_file.super_class())
                .context("resolve super class name")?,
        ))
    };
    let interfaces = class_file
        .interfaces()
        .iter()
        .map(|index| resolve_class_name(constant_pool, *index).map(|name| dotted(&name)))
        .collect::<Result<Vec<_>>>()
        .context("resolve interface names")?;
    let access_flags = class_file.access_flags().bits();
    let is_interface = access_flags & crate::ir::ACC_INTERFACE != 0;

    let mut fields = Vec::new();
    for field in class_file.fields() {
        fields.push(Field {
            name: resolve_utf8(constant_pool, field.name_index()).context("resolve field name")?,
            descriptor: resolve_utf8(constant_pool, field.descriptor_index())
                .context("resolve field descriptor")?,
            access_flags: field.access_flags().bits(),
        });
    }

    let methods = parse_methods(constant_pool, class_file.methods())
        .with_context(|| format!("parse methods of {class_name}"))?;

    Ok(Class {
        name: class_name,
        super_name,
        interfaces,
        source_file: None,
        access_flags,
        is_interface,
        fields,
        methods,
        artifact,
    })
}

fn parse_methods(
    constant_pool: &[ConstantPool],
    methods: &[jclassfile::methods::MethodInfo],
) -> Result<Vec<Method>> {
    let mut parsed = Vec::new();
    for method in methods {
        let name =
            resolve_utf8(constant_pool, method.name_index()).context("resolve method name")?;
        let descriptor = resolve_utf8(constant_pool, method.descriptor_index())
            .context("resolve method descriptor")?;
        crate::descriptor::validate_method_descriptor(&descriptor)
            .with_context(|| format!("method {name}"))?;
        let access_flags = method.access_flags().bits();
        let mut body = None;
        for attribute in method.attributes() {
            if let jclassfile::attributes::Attribute::Code {
                max_stack,
                max_locals,
                code,
                exception_table,
                ..
            } = attribute
            {
                body = Some(
                    parse_code(constant_pool, code, *max_stack, *max_locals, exception_table)
                        .with_context(|| format!("parse bytecode of {name}{descriptor}"))?,
                );
            }
        }
        parsed.push(Method {
            name,
            descriptor,
            access_flags,
            body,
            synthetic: false,
        });
    }
    Ok(parsed)
}

enum PendingTarget {
    None,
    Branch(u32),
    Table { default: u32, targets: Vec<u32> },
    Lookup { default: u32, pairs: Vec<(i32, u32)> },
}

fn parse_code(
    constant_pool: &[ConstantPool],
    code: &[u8],
    max_stack: u16,
    max_locals: u16,
    exception_table: &[jclassfile::attributes::ExceptionRecord],
) -> Result<MethodBody> {
    // First pass: decode with branch targets as byte offsets.
    let mut decoded: Vec<(u32, InstrKind, PendingTarget)> = Vec::new();
    let mut offset = 0usize;
    while offset < code.len() {
        let opcode = code[offset];
        let length = opcodes::opcode_length(code, offset)?;
        if length == 0 || offset + length > code.len() {
            anyhow::bail!("invalid bytecode length at offset {offset}");
        }
        let (kind, pending) = match opcode {
            0xb6..=0xb9 => {
                let method_index = opcodes::read_u16_at(code, offset + 1)?;
                let method_ref = resolve_method_ref(constant_pool, method_index)
                    .context("resolve method ref")?;
                (
                    InstrKind::Invoke {
                        opcode,
                        owner: dotted(&method_ref.owner),
                        name: method_ref.name,
                        descriptor: method_ref.descriptor,
                    },
                    PendingTarget::None,
                )
            }
            0xb2..=0xb5 => {
                let field_index = opcodes::read_u16_at(code, offset + 1)?;
                let field_ref =
                    resolve_field_ref(constant_pool, field_index).context("resolve field ref")?;
                (
                    InstrKind::FieldAccess {
                        opcode,
                        owner: dotted(&field_ref.owner),
                        name: field_ref.name,
                        descriptor: field_ref.descriptor,
                    },
                    PendingTarget::None,
                )
            }
            op if op == opcodes::NEW => {
                let class_index = opcodes::read_u16_at(code, offset + 1)?;
                let class =
                    resolve_class_name(constant_pool, class_index).context("resolve new class")?;
                (
                    InstrKind::TypeRef {
                        opcode,
                        class: dotted(&class),
                    },
                    PendingTarget::None,
                )
            }
            0x99..=0xa8 | 0xc6 | 0xc7 => {
                let delta = opcodes::read_i16_at(code, offset + 1)? as i32;
                let target = (offset as i32 + delta) as u32;
                (
                    InstrKind::Branch { opcode, target: 0 },
                    PendingTarget::Branch(target),
                )
            }
            0xc8 | 0xc9 => {
                let delta = opcodes::read_i32_at(code, offset + 1)?;
                let target = (offset as i32 + delta) as u32;
                (
                    InstrKind::Branch { opcode, target: 0 },
                    PendingTarget::Branch(target),
                )
            }
            op if op == opcodes::TABLESWITCH => {
                let padding = opcodes::switch_padding(offset);
                let base = offset + 1 + padding;
                let default = (offset as i32 + opcodes::read_i32_at(code, base)?) as u32;
                let low = opcodes::read_i32_at(code, base + 4)?;
                let high = opcodes::read_i32_at(code, base + 8)?;
                let count = (high - low + 1) as usize;
                let mut targets = Vec::with_capacity(count);
                for slot in 0..count {
                    let delta = opcodes::read_i32_at(code, base + 12 + slot * 4)?;
                    targets.push((offset as i32 + delta) as u32);
                }
                (
                    InstrKind::TableSwitch {
                        default: 0,
                        low,
                        targets: Vec::new(),
                    },
                    PendingTarget::Table { default, targets },
                )
            }
            op if op == opcodes::LOOKUPSWITCH => {
                let padding = opcodes::switch_padding(offset);
                let base = offset + 1 + padding;
                let default = (offset as i32 + opcodes::read_i32_at(code, base)?) as u32;
                let npairs = opcodes::read_i32_at(code, base + 4)? as usize;
                let mut pairs = Vec::with_capacity(npairs);
                for slot in 0..npairs {
                    let key = opcodes::read_i32_at(code, base + 8 + slot * 8)?;
                    let delta = opcodes::read_i32_at(code, base + 12 + slot * 8)?;
                    pairs.push((key, (offset as i32 + delta) as u32));
                }
                (
                    InstrKind::LookupSwitch {
                        default: 0,
                        pairs: Vec::new(),
                    },
                    PendingTarget::Lookup { default, pairs },
                )
            }
            _ => (
                InstrKind::Raw {
                    opcode,
                    operands: code[offset + 1..offset + length].to_vec(),
                },
                PendingTarget::None,
            ),
        };
        decoded.push((offset as u32, kind, pending));
        offset += length;
    }

    // Second pass: byte offsets become stable handles.
    let offset_to_handle: BTreeMap<u32, Handle> = decoded
        .iter()
        .enumerate()
        .map(|(index, (offset, _, _))| (*offset, index as Handle))
        .collect();
    let handle_of = |target: u32| -> Result<Handle> {
        offset_to_handle
            .get(&target)
            .copied()
            .with_context(|| format!("branch target {target} is not an instruction boundary"))
    };

    let mut instructions = Vec::with_capacity(decoded.len());
    for (index, (_, mut kind, pending)) in decoded.into_iter().enumerate() {
        match pending {
            PendingTarget::None => {}
            PendingTarget::Branch(target) => {
                if let InstrKind::Branch { target: slot, .. } = &mut kind {
                    *slot = handle_of(target)?;
                }
            }
            PendingTarget::Table { default, targets } => {
                if let InstrKind::TableSwitch {
                    default: default_slot,
                    targets: target_slot,
                    ..
                } = &mut kind
                {
                    *default_slot = handle_of(default)?;
                    *target_slot = targets
                        .into_iter()
                        .map(handle_of)
                        .collect::<Result<Vec<_>>>()?;
                }
            }
            PendingTarget::Lookup { default, pairs } => {
                if let InstrKind::LookupSwitch {
                    default: default_slot,
                    pairs: pair_slot,
                } = &mut kind
                {
                    *default_slot = handle_of(default)?;
                    *pair_slot = pairs
                        .into_iter()
                        .map(|(key, target)| handle_of(target).map(|h| (key, h)))
                        .collect::<Result<Vec<_>>>()?;
                }
            }
        }
        instructions.push(Instr {
            handle: index as Handle,
            pos: index as i32,
            kind,
        });
    }

    let mut handlers = Vec::new();
    for entry in exception_table {
        let start = handle_of(entry.start_pc() as u32).context("resolve handler start")?;
        let end = if entry.end_pc() as usize == code.len() {
            END_HANDLE
        } else {
            handle_of(entry.end_pc() as u32).context("resolve handler end")?
        };
        let handler = handle_of(entry.handler_pc() as u32).context("resolve handler pc")?;
        let catch_type = if entry.catch_type() == 0 {
            None
        } else {
            Some(dotted(
                &resolve_class_name(constant_pool, entry.catch_type())
                    .context("resolve catch type")?,
            ))
        };
        handlers.push(ExceptionHandler {
            start,
            end,
            handler,
            catch_type,
        });
    }

    let next_handle = instructions.len() as Handle;
    Ok(MethodBody {
        max_stack,
        max_locals,
        instructions,
        handlers,
        line_numbers: Vec::new(),
        next_handle,
    })
}

/// Resolved constant pool member reference.
struct MemberRef {
    owner: String,
    name: String,
    descriptor: String,
}

fn resolve_class_name(constant_pool: &[ConstantPool], class_index: u16) -> Result<String> {
    let entry = constant_pool
        .get(class_index as usize)
        .context("missing class entry")?;
    match entry {
        ConstantPool::Class { name_index } => resolve_utf8(constant_pool, *name_index),
        _ => anyhow::bail!("unexpected class entry"),
    }
}

fn resolve_utf8(constant_pool: &[ConstantPool], index: u16) -> Result<String> {
    let entry = constant_pool
        .get(index as usize)
        .context("missing utf8 entry")?;
    match entry {
        ConstantPool::Utf8 { value } => Ok(value.clone()),
        _ => anyhow::bail!("unexpected utf8 entry"),
    }
}

fn resolve_method_ref(constant_pool: &[ConstantPool], index: u16) -> Result<MemberRef> {
    let entry = constant_pool
        .get(index as usize)
        .context("missing method ref entry")?;
    let (class_index, name_and_type_index) = match entry {
        ConstantPool::Methodref {
            class_index,
            name_and_type_index,
        } => (*class_index, *name_and_type_index),
        ConstantPool::InterfaceMethodref {
            class_index,
            name_and_type_index,
        } => (*class_index, *name_and_type_index),
        _ => anyhow::bail!("unexpected method ref entry"),
    };
    resolve_member(constant_pool, class_index, name_and_type_index)
}

fn resolve_field_ref(constant_pool: &[ConstantPool], index: u16) -> Result<MemberRef> {
    let entry = constant_pool
        .get(index as usize)
        .context("missing field ref entry")?;
    match entry {
        ConstantPool::Fieldref {
            class_index,
            name_and_type_index,
        } => resolve_member(constant_pool, *class_index, *name_and_type_index),
        _ => anyhow::bail!("unexpected field ref entry"),
    }
}

fn resolve_member(
    constant_pool: &[ConstantPool],
    class_index: u16,
    name_and_type_index: u16,
) -> Result<MemberRef> {
    let owner = resolve_class_name(constant_pool, class_index).context("resolve owner")?;
    let entry = constant_pool
        .get(name_and_type_index as usize)
        .context("missing name and type entry")?;
    let (name_index, descriptor_index) = match entry {
        ConstantPool::NameAndType {
            name_index,
            descriptor_index,
        } => (*name_index, *descriptor_index),
        _ => anyhow::bail!("unexpected name and type entry"),
    };
    let name = resolve_utf8(constant_pool, name_index).context("resolve member name")?;
    let descriptor =
        resolve_utf8(constant_pool, descriptor_index).context("resolve member descriptor")?;
    Ok(MemberRef {
        owner,
        name,
        descriptor,
    })
}


#[cfg(test)]
mod tests {
    use super::classfile_builder::{ClassFileBuilder, high, low};
    use super::*;

    fn sample_class_bytes() -> Vec<u8> {
        let mut builder = ClassFileBuilder::new("pkg/A", "java/lang/Object");
        let object_init = builder.add_method_ref("java/lang/Object", "<init>", "()V");
        let field = builder.add_field_ref("pkg/A", "f", "I");
        let helper = builder.add_method_ref("pkg/B", "helper", "()V");

        let init_code = vec![0x2a, 0xb7, high(object_init), low(object_init), 0xb1];
        builder.add_method(0x0001, "<init>", "()V", init_code, 1, 1);

        // iconst_0; istore_1; aload_0; iload_1; putfield f; invokestatic
        // helper; goto +3; return
        let m_code = vec![
            0x03,
            0x3c,
            0x2a,
            0x1b,
            0xb5,
            high(field),
            low(field),
            0xb8,
            high(helper),
            low(helper),
            0xa7,
            0x00,
            0x03,
            0xb1,
        ];
        builder.add_method_with_handlers(0x0001, "m", "()V", m_code, 2, 2, vec![(0, 10, 13, 0)]);
        builder.finish()
    }

    #[test]
    fn parse_structures_members_and_branches() {
        let class = parse_class_bytes(&sample_class_bytes(), None).expect("parse class");
        assert_eq!(class.name, "pkg.A");
        assert_eq!(class.super_name.as_deref(), Some("java.lang.Object"));

        let method = class.method("m", "()V").expect("method m");
        let body = method.body.as_ref().expect("body");

        let field = body
            .instructions
            .iter()
            .find(|i| matches!(i.kind, InstrKind::FieldAccess { .. }))
            .expect("field access");
        match &field.kind {
            InstrKind::FieldAccess {
                opcode,
                owner,
                name,
                descriptor,
            } => {
                assert_eq!(*opcode, opcodes::PUTFIELD);
                assert_eq!(owner, "pkg.A");
                assert_eq!(name, "f");
                assert_eq!(descriptor, "I");
            }
            _ => unreachable!(),
        }

        let invoke = body
            .instructions
            .iter()
            .find(|i| matches!(i.kind, InstrKind::Invoke { .. }))
            .expect("invoke");
        match &invoke.kind {
            InstrKind::Invoke { owner, name, .. } => {
                assert_eq!(owner, "pkg.B");
                assert_eq!(name, "helper");
            }
            _ => unreachable!(),
        }

        // The goto at offset 10 jumps to the return at offset 13.
        let branch = body
            .instructions
            .iter()
            .find(|i| matches!(i.kind, InstrKind::Branch { .. }))
            .expect("branch");
        match &branch.kind {
            InstrKind::Branch { target, .. } => {
                let target_instr = body.instr(*target).expect("branch target");
                assert_eq!(target_instr.kind.opcode(), opcodes::RETURN);
            }
            _ => unreachable!(),
        }

        // The handler covering offsets 0..10 lands on the return.
        assert_eq!(body.handlers.len(), 1);
        let handler = &body.handlers[0];
        assert_eq!(handler.start, 0);
        assert!(handler.catch_type.is_none());
        let handler_instr = body.instr(handler.handler).expect("handler target");
        assert_eq!(handler_instr.kind.opcode(), opcodes::RETURN);
    }

    #[test]
    fn parse_rejects_truncated_class() {
        assert!(parse_class_bytes(b"nope", None).is_err());
    }

    #[test]
    fn constructor_super_call_is_parsed_in_place() {
        let class = parse_class_bytes(&sample_class_bytes(), None).expect("parse class");
        let ctor = class.method("<init>", "()V").expect("constructor");
        let body = ctor.body.as_ref().expect("body");
        assert_eq!(body.instructions[1].kind.opcode(), opcodes::INVOKESPECIAL);
    }

    #[test]
    fn scan_inputs_rejects_invalid_class_file() {
        let dir = tempfile::tempdir().expect("scan temp dir");
        let class_path = dir.path().join("bad.class");
        fs::write(&class_path, b"nope").expect("write test class");

        let result = scan_inputs(&[class_path], &[]);

        assert!(result.is_err());
    }

    #[test]
    fn scan_inputs_marks_input_classes() {
        let dir = tempfile::tempdir().expect("scan temp dir");
        let class_path = dir.path().join("A.class");
        fs::write(&class_path, sample_class_bytes()).expect("write test class");

        let result = scan_inputs(&[class_path], &[]).expect("scan class");

        assert_eq!(result.class_count, 1);
        assert!(result.input_classes.contains("pkg.A"));
    }

    #[test]
    fn scan_inputs_resolves_manifest_classpath() {
        let dir = tempfile::tempdir().expect("scan temp dir");
        let jar_path = dir.path().join("main.jar");
        let file = fs::File::create(&jar_path).expect("create jar");
        let mut writer = zip::ZipWriter::new(file);
        use std::io::Write;
        writer
            .start_file(
                "META-INF/MANIFEST.MF",
                zip::write::SimpleFileOptions::default(),
            )
            .expect("start manifest");
        writer
            .write_all(b"Manifest-Version: 1.0\nClass-Path: missing.jar\n\n")
            .expect("write manifest");
        writer.finish().expect("finish jar");

        let result = scan_inputs(&[jar_path], &[]);

        assert!(result.is_err());
    }
}
