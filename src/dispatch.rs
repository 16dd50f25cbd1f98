#![allow(dead_code)]

use crate::ir::{self, Instr, InstrKind, Method, MethodBody};
use crate::opcodes;

/// Runtime support class referenced by the start and class-prepare probes.
pub(crate) const PROBE_CLASS: &str = "probeweave.rt.Probe";
/// Static boolean flag read by the one-shot start probe.
pub(crate) const START_FLAG_FIELD: &str = "started$";
/// Transient byte flag the class-prepare probe spins on until the
/// dispatcher clears it.
pub(crate) const PREPARE_WAIT_FIELD: &str = "classPrepare$";
/// Poll interval of the class-prepare busy wait, in milliseconds.
pub(crate) const PREPARE_WAIT_MILLIS: i32 = 10;

pub(crate) const TRIGGER_STATIC: &str = "trigger_static";
pub(crate) const TRIGGER_STATIC_SIG: &str = "(I)V";
pub(crate) const TRIGGER_OBJ: &str = "trigger_obj";
pub(crate) const TRIGGER_OBJ_SIG: &str = "(Ljava/lang/Object;I)V";
pub(crate) const TRIGGER_MON: &str = "trigger_mon";
pub(crate) const TRIGGER_MON_SIG: &str = "(Ljava/lang/Object;B)V";
pub(crate) const TRIGGER_CATCH: &str = "trigger_catch";
pub(crate) const TRIGGER_CATCH_SIG: &str = "(Ljava/lang/Class;)V";

/// Flag bit set on the return mask of an exceptional call return or method
/// exit.
pub(crate) const FLAG_EXCEPTIONAL: u8 = 0x1;
/// Flag bit marking a probe routed through an interceptor.
pub(crate) const FLAG_INTERCEPTOR: u8 = 0x2;

/// Decoded form of the 32-bit instrumentation code pushed by probes:
/// `[2: type tag][8: event code][2: flags][20: string-table index]`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct InstCode {
    pub(crate) type_tag: u8,
    pub(crate) event_code: u8,
    pub(crate) flags: u8,
    pub(crate) string_index: u32,
}

impl InstCode {
    pub(crate) fn new(event_code: u8, string_index: u32) -> Self {
        Self {
            type_tag: 0,
            event_code,
            flags: 0,
            string_index,
        }
    }

    pub(crate) fn with_flags(mut self, flags: u8) -> Self {
        self.flags = flags & 0x3;
        self
    }

    pub(crate) fn encode(self) -> i32 {
        (((self.type_tag as u32 & 0x3) << 30)
            | ((self.event_code as u32) << 22)
            | ((self.flags as u32 & 0x3) << 20)
            | (self.string_index & 0xf_ffff)) as i32
    }

    pub(crate) fn decode(code: i32) -> Self {
        let code = code as u32;
        Self {
            type_tag: ((code >> 30) & 0x3) as u8,
            event_code: ((code >> 22) & 0xff) as u8,
            flags: ((code >> 20) & 0x3) as u8,
            string_index: code & 0xf_ffff,
        }
    }

    pub(crate) fn is_exceptional(self) -> bool {
        self.flags & FLAG_EXCEPTIONAL != 0
    }

    pub(crate) fn is_intercepted(self) -> bool {
        self.flags & FLAG_INTERCEPTOR != 0
    }
}

/// Event delivered to listeners when a probe fires.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ProbeEvent {
    pub(crate) code: u8,
    pub(crate) exceptional: bool,
    pub(crate) intercepted: bool,
    /// Payload string resolved through the suite string table.
    pub(crate) payload: Option<String>,
}

/// Consumer of dispatched events. Implementations render, filter, or relay;
/// none of that is the dispatcher's concern.
pub(crate) trait EventListener {
    fn on_event(&mut self, event: &ProbeEvent);
}

/// Forwards probe hits to registered listeners in registration order.
#[derive(Default)]
pub(crate) struct Dispatcher {
    listeners: Vec<(u64, Box<dyn EventListener>)>,
    next_listener_id: u64,
}

impl Dispatcher {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add_listener(&mut self, listener: Box<dyn EventListener>) -> u64 {
        let id = self.next_listener_id;
        self.next_listener_id += 1;
        self.listeners.push((id, listener));
        id
    }

    /// Linear scan over the listener list; ids are never reused.
    pub(crate) fn remove_listener(&mut self, id: u64) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(listener_id, _)| *listener_id != id);
        self.listeners.len() != before
    }

    pub(crate) fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Entry hook for `trigger_static` probes.
    pub(crate) fn trigger_static(&mut self, inst_code: i32, payload: Option<&str>) {
        let code = InstCode::decode(inst_code);
        self.publish(ProbeEvent {
            code: code.event_code,
            exceptional: code.is_exceptional(),
            intercepted: code.is_intercepted(),
            payload: payload.map(str::to_string),
        });
    }

    /// Entry hook for `trigger_obj` probes; the object reference itself
    /// stays on the agent side.
    pub(crate) fn trigger_obj(&mut self, inst_code: i32, payload: Option<&str>) {
        self.trigger_static(inst_code, payload);
    }

    /// Entry hook for `trigger_mon` probes.
    pub(crate) fn trigger_mon(&mut self, mon_event_code: u8) {
        self.publish(ProbeEvent {
            code: mon_event_code,
            exceptional: false,
            intercepted: false,
            payload: None,
        });
    }

    /// Entry hook for `trigger_catch` probes.
    pub(crate) fn trigger_catch(&mut self, class_name: &str) {
        self.publish(ProbeEvent {
            code: crate::events::EVENT_CATCH,
            exceptional: false,
            intercepted: false,
            payload: Some(class_name.to_string()),
        });
    }

    fn publish(&mut self, event: ProbeEvent) {
        for (_, listener) in &mut self.listeners {
            listener.on_event(&event);
        }
    }
}

/// The four no-op hook methods declared on every instrumented class. The
/// bodies are empty on purpose; the host runtime intercepts entry.
pub(crate) fn trigger_methods() -> Vec<Method> {
    [
        (TRIGGER_STATIC, TRIGGER_STATIC_SIG),
        (TRIGGER_OBJ, TRIGGER_OBJ_SIG),
        (TRIGGER_MON, TRIGGER_MON_SIG),
        (TRIGGER_CATCH, TRIGGER_CATCH_SIG),
    ]
    .into_iter()
    .map(|(name, descriptor)| Method {
        name: name.to_string(),
        descriptor: descriptor.to_string(),
        access_flags: ir::ACC_PRIVATE | ir::ACC_STATIC | ir::ACC_FINAL,
        body: Some(MethodBody {
            max_stack: 0,
            max_locals: descriptor_arg_slots(descriptor),
            instructions: vec![Instr {
                handle: 0,
                pos: -1,
                kind: InstrKind::Raw {
                    opcode: opcodes::RETURN,
                    operands: Vec::new(),
                },
            }],
            handlers: Vec::new(),
            line_numbers: Vec::new(),
            next_handle: 1,
        }),
        synthetic: true,
    })
    .collect()
}

fn descriptor_arg_slots(descriptor: &str) -> u16 {
    // Hook signatures only carry object refs, ints, and bytes.
    match descriptor {
        TRIGGER_STATIC_SIG | TRIGGER_CATCH_SIG => 1,
        TRIGGER_OBJ_SIG | TRIGGER_MON_SIG => 2,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events;

    #[test]
    fn inst_code_round_trips_all_fields() {
        let code = InstCode {
            type_tag: 2,
            event_code: events::EVENT_CALL_RETURN,
            flags: FLAG_EXCEPTIONAL,
            string_index: 0xabcde,
        };
        let decoded = InstCode::decode(code.encode());
        assert_eq!(code, decoded);
        assert!(decoded.is_exceptional());
        assert!(!decoded.is_intercepted());
    }

    #[test]
    fn new_mask_matches_shift_layout() {
        let mask = InstCode::new(events::EVENT_NEW_OBJ, 17).encode();
        assert_eq!(mask, ((events::EVENT_NEW_OBJ as i32) << 22) | 17);
    }

    #[test]
    fn string_index_is_capped_to_twenty_bits() {
        let code = InstCode::new(events::EVENT_START, 0x1f_ffff);
        assert_eq!(InstCode::decode(code.encode()).string_index, 0xf_ffff);
    }

    struct Recorder(std::rc::Rc<std::cell::RefCell<Vec<ProbeEvent>>>);

    impl EventListener for Recorder {
        fn on_event(&mut self, event: &ProbeEvent) {
            self.0.borrow_mut().push(event.clone());
        }
    }

    #[test]
    fn dispatcher_forwards_to_listeners_in_order() {
        let seen = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let mut dispatcher = Dispatcher::new();
        dispatcher.add_listener(Box::new(Recorder(seen.clone())));

        dispatcher.trigger_static(
            InstCode::new(events::EVENT_SMETHOD_ENTER, 4).encode(),
            Some("pkg.A#m#()V#9"),
        );
        dispatcher.trigger_mon(events::EVENT_MON_ACQUIRE);
        dispatcher.trigger_catch("java.lang.RuntimeException");

        let seen = seen.borrow();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].code, events::EVENT_SMETHOD_ENTER);
        assert_eq!(seen[0].payload.as_deref(), Some("pkg.A#m#()V#9"));
        assert_eq!(seen[1].code, events::EVENT_MON_ACQUIRE);
        assert_eq!(seen[2].code, events::EVENT_CATCH);
    }

    #[test]
    fn listener_removal_is_linear_and_id_based() {
        let seen = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let mut dispatcher = Dispatcher::new();
        let first = dispatcher.add_listener(Box::new(Recorder(seen.clone())));
        let second = dispatcher.add_listener(Box::new(Recorder(seen.clone())));

        assert!(dispatcher.remove_listener(first));
        assert!(!dispatcher.remove_listener(first));
        assert_eq!(dispatcher.listener_count(), 1);

        dispatcher.trigger_mon(events::EVENT_MON_RELEASE);
        assert_eq!(seen.borrow().len(), 1);

        assert!(dispatcher.remove_listener(second));
        assert_eq!(dispatcher.listener_count(), 0);
    }

    #[test]
    fn trigger_methods_are_empty_static_hooks() {
        let methods = trigger_methods();
        assert_eq!(methods.len(), 4);
        for method in &methods {
            assert!(method.is_static());
            let body = method.body.as_ref().expect("hook body");
            assert_eq!(body.instructions.len(), 1);
            assert_eq!(body.instructions[0].kind.opcode(), opcodes::RETURN);
        }
    }
}
