#![allow(dead_code)]

/// Class access and property flags.
pub(crate) const ACC_PUBLIC: u16 = 0x0001;
pub(crate) const ACC_PRIVATE: u16 = 0x0002;
pub(crate) const ACC_PROTECTED: u16 = 0x0004;
pub(crate) const ACC_STATIC: u16 = 0x0008;
pub(crate) const ACC_FINAL: u16 = 0x0010;
pub(crate) const ACC_SYNCHRONIZED: u16 = 0x0020;
pub(crate) const ACC_NATIVE: u16 = 0x0100;
pub(crate) const ACC_INTERFACE: u16 = 0x0200;
pub(crate) const ACC_ABSTRACT: u16 = 0x0400;

/// Parsed class in instrumentable form. Names are dotted throughout.
#[derive(Clone, Debug)]
pub(crate) struct Class {
    pub(crate) name: String,
    pub(crate) super_name: Option<String>,
    pub(crate) interfaces: Vec<String>,
    pub(crate) source_file: Option<String>,
    pub(crate) access_flags: u16,
    pub(crate) is_interface: bool,
    pub(crate) fields: Vec<Field>,
    pub(crate) methods: Vec<Method>,
    pub(crate) artifact: Option<String>,
}

impl Class {
    pub(crate) fn method(&self, name: &str, descriptor: &str) -> Option<&Method> {
        self.methods
            .iter()
            .find(|m| m.name == name && m.descriptor == descriptor)
    }

    pub(crate) fn has_method(&self, name: &str, descriptor: &str) -> bool {
        self.method(name, descriptor).is_some()
    }
}

/// Field definition for a class.
#[derive(Clone, Debug)]
pub(crate) struct Field {
    pub(crate) name: String,
    pub(crate) descriptor: String,
    pub(crate) access_flags: u16,
}

impl Field {
    pub(crate) fn is_static(&self) -> bool {
        self.access_flags & ACC_STATIC != 0
    }
}

/// Method with an editable body.
#[derive(Clone, Debug)]
pub(crate) struct Method {
    pub(crate) name: String,
    pub(crate) descriptor: String,
    pub(crate) access_flags: u16,
    pub(crate) body: Option<MethodBody>,
    pub(crate) synthetic: bool,
}

impl Method {
    pub(crate) fn is_static(&self) -> bool {
        self.access_flags & ACC_STATIC != 0
    }

    pub(crate) fn is_abstract(&self) -> bool {
        self.access_flags & ACC_ABSTRACT != 0
    }

    pub(crate) fn is_native(&self) -> bool {
        self.access_flags & ACC_NATIVE != 0
    }

    pub(crate) fn is_synchronized(&self) -> bool {
        self.access_flags & ACC_SYNCHRONIZED != 0
    }

    pub(crate) fn is_constructor(&self) -> bool {
        self.name == "<init>"
    }

    pub(crate) fn is_static_initializer(&self) -> bool {
        self.name == "<clinit>"
    }

    /// Dotted `class.method.signature` location key for this method.
    pub(crate) fn location_key(&self, class_name: &str) -> String {
        format!("{}.{}.{}", class_name, self.name, self.descriptor)
    }

    /// Method signature fragment used as a probe-log key.
    pub(crate) fn signature(&self) -> String {
        format!("{}{}", self.name, self.descriptor)
    }
}

/// Stable identifier of an instruction within one method body.
pub(crate) type Handle = u32;

/// Pseudo-handle marking a handler range that runs to the end of the
/// method (an `end_pc` equal to the code length).
pub(crate) const END_HANDLE: Handle = u32::MAX;

/// Editable method body: an ordered instruction list addressed by stable
/// handles, plus handler and line tables resolved to handles.
#[derive(Clone, Debug, Default)]
pub(crate) struct MethodBody {
    pub(crate) max_stack: u16,
    pub(crate) max_locals: u16,
    pub(crate) instructions: Vec<Instr>,
    pub(crate) handlers: Vec<ExceptionHandler>,
    pub(crate) line_numbers: Vec<LineNumber>,
    pub(crate) next_handle: Handle,
}

/// One instruction; `pos` is the original position index, negative for
/// instrumentor-inserted code.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Instr {
    pub(crate) handle: Handle,
    pub(crate) pos: i32,
    pub(crate) kind: InstrKind,
}

/// Instruction forms the instrumentor distinguishes. Anything it never
/// rewrites or retargets is carried as `Raw` with its operand bytes.
#[derive(Clone, Debug, PartialEq)]
pub(crate) enum InstrKind {
    Raw {
        opcode: u8,
        operands: Vec<u8>,
    },
    Branch {
        opcode: u8,
        target: Handle,
    },
    TableSwitch {
        default: Handle,
        low: i32,
        targets: Vec<Handle>,
    },
    LookupSwitch {
        default: Handle,
        pairs: Vec<(i32, Handle)>,
    },
    Invoke {
        opcode: u8,
        owner: String,
        name: String,
        descriptor: String,
    },
    FieldAccess {
        opcode: u8,
        owner: String,
        name: String,
        descriptor: String,
    },
    TypeRef {
        opcode: u8,
        class: String,
    },
    PushInt(i32),
    PushLong(i64),
    PushString(String),
    /// `ldc` of a class literal.
    PushClass(String),
    LocalVar {
        opcode: u8,
        index: u16,
    },
}

impl InstrKind {
    pub(crate) fn opcode(&self) -> u8 {
        match self {
            InstrKind::Raw { opcode, .. }
            | InstrKind::Branch { opcode, .. }
            | InstrKind::Invoke { opcode, .. }
            | InstrKind::FieldAccess { opcode, .. }
            | InstrKind::TypeRef { opcode, .. }
            | InstrKind::LocalVar { opcode, .. } => *opcode,
            InstrKind::TableSwitch { .. } => crate::opcodes::TABLESWITCH,
            InstrKind::LookupSwitch { .. } => crate::opcodes::LOOKUPSWITCH,
            InstrKind::PushInt(value) => {
                if (0..=5).contains(value) {
                    crate::opcodes::ICONST_0 + *value as u8
                } else if i8::try_from(*value).is_ok() {
                    crate::opcodes::BIPUSH
                } else if i16::try_from(*value).is_ok() {
                    crate::opcodes::SIPUSH
                } else {
                    crate::opcodes::LDC_W
                }
            }
            InstrKind::PushLong(_) => crate::opcodes::LDC2_W,
            InstrKind::PushString(_) | InstrKind::PushClass(_) => crate::opcodes::LDC_W,
        }
    }
}

/// Exception handler with handle-resolved anchors.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ExceptionHandler {
    pub(crate) start: Handle,
    pub(crate) end: Handle,
    pub(crate) handler: Handle,
    pub(crate) catch_type: Option<String>,
}

/// Line table entry resolved to the opening instruction handle.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct LineNumber {
    pub(crate) handle: Handle,
    pub(crate) line: u32,
}

impl MethodBody {
    pub(crate) fn index_of(&self, handle: Handle) -> Option<usize> {
        self.instructions.iter().position(|i| i.handle == handle)
    }

    pub(crate) fn instr(&self, handle: Handle) -> Option<&Instr> {
        self.instructions.iter().find(|i| i.handle == handle)
    }

    /// Source line covering `handle`, from the snapshotted line table.
    pub(crate) fn line_for_handle(&self, handle: Handle) -> Option<u32> {
        let index = self.index_of(handle)?;
        let mut candidate = None;
        for entry in &self.line_numbers {
            match self.index_of(entry.handle) {
                Some(entry_index) if entry_index <= index => candidate = Some(entry.line),
                _ => {}
            }
        }
        candidate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::opcodes;

    #[test]
    fn method_flag_helpers() {
        let method = Method {
            name: "<init>".to_string(),
            descriptor: "()V".to_string(),
            access_flags: ACC_PUBLIC | ACC_SYNCHRONIZED,
            body: None,
            synthetic: false,
        };
        assert!(method.is_constructor());
        assert!(method.is_synchronized());
        assert!(!method.is_static());
        assert_eq!(method.location_key("pkg.A"), "pkg.A.<init>.()V");
        assert_eq!(method.signature(), "<init>()V");
    }

    #[test]
    fn push_int_selects_narrowest_opcode() {
        assert_eq!(InstrKind::PushInt(3).opcode(), opcodes::ICONST_0 + 3);
        assert_eq!(InstrKind::PushInt(100).opcode(), opcodes::BIPUSH);
        assert_eq!(InstrKind::PushInt(300).opcode(), opcodes::SIPUSH);
        assert_eq!(InstrKind::PushInt(1 << 23).opcode(), opcodes::LDC_W);
    }
}
