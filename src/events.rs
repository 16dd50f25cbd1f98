#![allow(dead_code)]

/// Event codes published by the dispatcher.
pub(crate) const EVENT_START: u8 = 1;
pub(crate) const EVENT_THREAD_START: u8 = 2;
pub(crate) const EVENT_THREAD_DEATH: u8 = 3;
pub(crate) const EVENT_NEW_OBJ: u8 = 4;
pub(crate) const EVENT_GETSTATIC: u8 = 5;
pub(crate) const EVENT_PUTSTATIC: u8 = 6;
pub(crate) const EVENT_GETFIELD: u8 = 7;
pub(crate) const EVENT_PUTFIELD: u8 = 8;
pub(crate) const EVENT_MON_CONTEND: u8 = 10;
pub(crate) const EVENT_MON_ACQUIRE: u8 = 11;
pub(crate) const EVENT_MON_PRE_RELEASE: u8 = 12;
pub(crate) const EVENT_MON_RELEASE: u8 = 13;
pub(crate) const EVENT_CONSTRUCTOR: u8 = 20;
pub(crate) const EVENT_STATIC_CALL: u8 = 21;
pub(crate) const EVENT_VIRTUAL_CALL: u8 = 22;
pub(crate) const EVENT_INTERFACE_CALL: u8 = 23;
pub(crate) const EVENT_CALL_RETURN: u8 = 24;
pub(crate) const EVENT_VMETHOD_ENTER: u8 = 30;
pub(crate) const EVENT_VMETHOD_EXIT: u8 = 31;
pub(crate) const EVENT_CONSTRUCTOR_ENTER: u8 = 32;
pub(crate) const EVENT_CONSTRUCTOR_EXIT: u8 = 33;
pub(crate) const EVENT_STATIC_INIT_ENTER: u8 = 34;
pub(crate) const EVENT_SMETHOD_ENTER: u8 = 36;
pub(crate) const EVENT_SMETHOD_EXIT: u8 = 37;
pub(crate) const EVENT_THROW: u8 = 40;
pub(crate) const EVENT_CATCH: u8 = 41;
pub(crate) const EVENT_ARRAY_LOAD: u8 = 44;
pub(crate) const EVENT_ARRAY_STORE: u8 = 45;
/// Structural code for the class-prepare handshake patch; never published
/// to listeners.
pub(crate) const EVENT_CLASS_PREPARE: u8 = 46;

/// Field observable kinds, one rule table each.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub(crate) enum FieldKind {
    GetStatic,
    PutStatic,
    GetField,
    PutField,
}

impl FieldKind {
    pub(crate) fn event_code(self) -> u8 {
        match self {
            FieldKind::GetStatic => EVENT_GETSTATIC,
            FieldKind::PutStatic => EVENT_PUTSTATIC,
            FieldKind::GetField => EVENT_GETFIELD,
            FieldKind::PutField => EVENT_PUTFIELD,
        }
    }

    pub(crate) fn is_write(self) -> bool {
        matches!(self, FieldKind::PutStatic | FieldKind::PutField)
    }

    pub(crate) fn is_static(self) -> bool {
        matches!(self, FieldKind::GetStatic | FieldKind::PutStatic)
    }

    pub(crate) const ALL: [FieldKind; 4] = [
        FieldKind::GetStatic,
        FieldKind::PutStatic,
        FieldKind::GetField,
        FieldKind::PutField,
    ];
}

/// Call observable kinds.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub(crate) enum CallKind {
    Constructor,
    Static,
    Virtual,
    Interface,
}

impl CallKind {
    pub(crate) fn event_code(self) -> u8 {
        match self {
            CallKind::Constructor => EVENT_CONSTRUCTOR,
            CallKind::Static => EVENT_STATIC_CALL,
            CallKind::Virtual => EVENT_VIRTUAL_CALL,
            CallKind::Interface => EVENT_INTERFACE_CALL,
        }
    }

    pub(crate) const ALL: [CallKind; 4] = [
        CallKind::Constructor,
        CallKind::Static,
        CallKind::Virtual,
        CallKind::Interface,
    ];
}

/// Monitor observable kinds.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub(crate) enum MonitorKind {
    Contend,
    Acquire,
    PreRelease,
    Release,
}

impl MonitorKind {
    pub(crate) fn event_code(self) -> u8 {
        match self {
            MonitorKind::Contend => EVENT_MON_CONTEND,
            MonitorKind::Acquire => EVENT_MON_ACQUIRE,
            MonitorKind::PreRelease => EVENT_MON_PRE_RELEASE,
            MonitorKind::Release => EVENT_MON_RELEASE,
        }
    }

    pub(crate) const ALL: [MonitorKind; 4] = [
        MonitorKind::Contend,
        MonitorKind::Acquire,
        MonitorKind::PreRelease,
        MonitorKind::Release,
    ];
}

/// Method enter/exit observable kinds.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub(crate) enum MethodKind {
    StaticEnter,
    StaticExit,
    VirtualEnter,
    VirtualExit,
}

impl MethodKind {
    pub(crate) fn event_code(self) -> u8 {
        match self {
            MethodKind::StaticEnter => EVENT_SMETHOD_ENTER,
            MethodKind::StaticExit => EVENT_SMETHOD_EXIT,
            MethodKind::VirtualEnter => EVENT_VMETHOD_ENTER,
            MethodKind::VirtualExit => EVENT_VMETHOD_EXIT,
        }
    }

    pub(crate) const ALL: [MethodKind; 4] = [
        MethodKind::StaticEnter,
        MethodKind::StaticExit,
        MethodKind::VirtualEnter,
        MethodKind::VirtualExit,
    ];
}

/// Constructor enter/exit observable kinds.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub(crate) enum ConstructKind {
    Enter,
    Exit,
}

impl ConstructKind {
    pub(crate) fn event_code(self) -> u8 {
        match self {
            ConstructKind::Enter => EVENT_CONSTRUCTOR_ENTER,
            ConstructKind::Exit => EVENT_CONSTRUCTOR_EXIT,
        }
    }

    pub(crate) const ALL: [ConstructKind; 2] = [ConstructKind::Enter, ConstructKind::Exit];
}

/// Throwable observable kinds.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub(crate) enum ThrowableKind {
    Throw,
    Catch,
}

impl ThrowableKind {
    pub(crate) fn event_code(self) -> u8 {
        match self {
            ThrowableKind::Throw => EVENT_THROW,
            ThrowableKind::Catch => EVENT_CATCH,
        }
    }

    pub(crate) const ALL: [ThrowableKind; 2] = [ThrowableKind::Throw, ThrowableKind::Catch];
}

/// Array element access directions.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub(crate) enum ArrayAction {
    Load,
    Store,
}

impl ArrayAction {
    pub(crate) fn event_code(self) -> u8 {
        match self {
            ArrayAction::Load => EVENT_ARRAY_LOAD,
            ArrayAction::Store => EVENT_ARRAY_STORE,
        }
    }

    pub(crate) const ALL: [ArrayAction; 2] = [ArrayAction::Load, ArrayAction::Store];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_codes_are_distinct() {
        let codes = [
            EVENT_START,
            EVENT_THREAD_START,
            EVENT_THREAD_DEATH,
            EVENT_NEW_OBJ,
            EVENT_GETSTATIC,
            EVENT_PUTSTATIC,
            EVENT_GETFIELD,
            EVENT_PUTFIELD,
            EVENT_MON_CONTEND,
            EVENT_MON_ACQUIRE,
            EVENT_MON_PRE_RELEASE,
            EVENT_MON_RELEASE,
            EVENT_CONSTRUCTOR,
            EVENT_STATIC_CALL,
            EVENT_VIRTUAL_CALL,
            EVENT_INTERFACE_CALL,
            EVENT_CALL_RETURN,
            EVENT_VMETHOD_ENTER,
            EVENT_VMETHOD_EXIT,
            EVENT_CONSTRUCTOR_ENTER,
            EVENT_CONSTRUCTOR_EXIT,
            EVENT_STATIC_INIT_ENTER,
            EVENT_SMETHOD_ENTER,
            EVENT_SMETHOD_EXIT,
            EVENT_THROW,
            EVENT_CATCH,
            EVENT_ARRAY_LOAD,
            EVENT_ARRAY_STORE,
        ];
        let mut sorted = codes.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), codes.len());
    }

    #[test]
    fn kind_event_codes_match_table() {
        assert_eq!(FieldKind::GetField.event_code(), 7);
        assert_eq!(CallKind::Interface.event_code(), 23);
        assert_eq!(MonitorKind::PreRelease.event_code(), 12);
        assert_eq!(MethodKind::StaticExit.event_code(), 37);
        assert_eq!(ConstructKind::Exit.event_code(), 33);
        assert_eq!(ThrowableKind::Catch.event_code(), 41);
    }
}
