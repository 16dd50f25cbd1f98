//! Bytecode instrumentor: rewrites methods so in-scope observables drive
//! probe calls, and reports every edit to an observer.

pub(crate) mod code;
mod method;
mod patches;
mod remove;

use std::collections::BTreeSet;

use anyhow::Result;
use tracing::{debug, warn};

use crate::dispatch;
use crate::eventspec::EventSpecification;
use crate::hierarchy::ClassHierarchy;
use crate::ir::{Class, ExceptionHandler, Handle};
use crate::probelog::InterceptRecord;
use crate::session::Session;

pub(crate) use code::CodeLayout;
pub(crate) use remove::remove_probes;

/// Observer of instrumentation edits; the probe tracker normalizes these
/// into the persistent log.
pub(crate) trait InstrumentObserver {
    fn class_begin(&mut self, _class_name: &str) {}

    fn class_end(&mut self, _class_name: &str) {}

    fn method_begin(&mut self, _method_sig: &str) {}

    /// Pre-edit layout of the method, delivered right after
    /// [`method_begin`](Self::method_begin); adaptive reruns key stored
    /// offsets off it.
    fn method_baseline(&mut self, _method_sig: &str, _layout: &CodeLayout) {}

    /// Buffered edits resolve against the final layout here.
    fn method_end(&mut self, _method_sig: &str, _layout: &CodeLayout) {}

    /// Allocate a logical probe id.
    fn new_probe(&mut self, event_code: u8, live_keys: &BTreeSet<String>, location: &str) -> u32;

    fn probe_inserted(
        &mut self,
        _id: u32,
        _event_code: u8,
        _patch: &[Handle],
        _anchor: Handle,
        _precedes: bool,
    ) {
    }

    fn exception_handler_added(&mut self, _id: u32, _handler: &ExceptionHandler, _removable: bool) {}

    fn call_interceptor_added(&mut self, _id: u32, _record: &InterceptRecord, _anchor: Handle) {}

    fn field_interceptor_added(&mut self, _id: u32, _record: &InterceptRecord, _anchor: Handle) {}

    fn field_interceptor_method_added(&mut self, _id: u32, _method_sig: &str) {}

    fn static_initializer_added(&mut self, _method_sig: &str) {}

    fn exit_probe_added(&mut self, _id: u32) {}

    fn probe_removed(&mut self, _id: u32, _event_code: u8) {}

    /// Synthetic handler PCs recorded so later passes skip them.
    fn synthetic_handler_added(&mut self, _handler_pc_handle: Handle) {}
}

/// Drives instrumentation of whole classes against one specification.
pub(crate) struct Instrumentor<'a> {
    spec: &'a EventSpecification,
    hierarchy: &'a dyn ClassHierarchy,
    session: &'a mut Session,
}

impl<'a> Instrumentor<'a> {
    pub(crate) fn new(
        spec: &'a EventSpecification,
        hierarchy: &'a dyn ClassHierarchy,
        session: &'a mut Session,
    ) -> Self {
        Self {
            spec,
            hierarchy,
            session,
        }
    }

    /// Rewrite every method of `class` per the specification. The class is
    /// edited in place; the observer sees each edit.
    pub(crate) fn instrument_class(
        &mut self,
        class: &mut Class,
        observer: &mut dyn InstrumentObserver,
    ) -> Result<()> {
        if class.is_interface {
            warn!(class = %class.name, "skipping interface, no code to instrument");
            return Ok(());
        }
        if !self.spec.in_system(&class.name) {
            debug!(class = %class.name, "class outside the system, skipping");
            return Ok(());
        }
        observer.class_begin(&class.name);

        // The static initializer must exist before the method walk when the
        // class-prepare wait is on, so the walk can patch it like any other
        // method.
        if self.session.prepare_wait()
            && !self.session.adaptive()
            && !class.has_method("<clinit>", "()V")
        {
            let clinit = patches::synthesize_static_initializer();
            observer.static_initializer_added(&clinit.signature());
            class.methods.push(clinit);
        }

        let carries_start_probe = class
            .methods
            .iter()
            .any(|m| m.name == "main" && m.descriptor == "([Ljava/lang/String;)V" && m.is_static())
            && self.session.claim_start_probe(&class.name);
        let start_probe_host = if carries_start_probe {
            if class.has_method("<clinit>", "()V") {
                Some("<clinit>()V".to_string())
            } else {
                Some("main([Ljava/lang/String;)V".to_string())
            }
        } else {
            None
        };

        let mut new_methods = Vec::new();
        for index in 0..class.methods.len() {
            let method = &class.methods[index];
            if method.synthetic {
                continue;
            }
            if method.is_abstract() || method.is_native() {
                warn!(
                    class = %class.name,
                    method = %method.signature(),
                    "skipping method without code"
                );
                continue;
            }
            if method.body.as_ref().map(|b| b.instructions.is_empty()).unwrap_or(true) {
                debug!(
                    class = %class.name,
                    method = %method.signature(),
                    "skipping empty method"
                );
                continue;
            }
            let wants_start_probe = start_probe_host.as_deref()
                == Some(class.methods[index].signature().as_str());
            let mut worker = method::MethodInstrumenter::begin(
                self.spec,
                self.hierarchy,
                self.session,
                class,
                index,
                wants_start_probe,
            )?;
            worker.run(observer)?;
            let outcome = worker.finish();
            let (instrumented, mut added) = (outcome.method, outcome.new_methods);
            class.methods[index] = instrumented;
            new_methods.append(&mut added);
        }

        for method in new_methods {
            if !class.has_method(&method.name, &method.descriptor) {
                class.methods.push(method);
            }
        }
        for hook in dispatch::trigger_methods() {
            if !class.has_method(&hook.name, &hook.descriptor) {
                class.methods.push(hook);
            }
        }

        observer.class_end(&class.name);
        self.session.mark_finished(&class.name);
        Ok(())
    }
}
