//! Per-method instrumentation workflow: preamble, synchronized-method
//! desugaring, the linear site walk, handler reinstallation, entry/exit
//! probes, and commit.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result};

use crate::bounds::{ANY_TYPE, ArrayElementBounds, OBJECT_TYPE};
use crate::dispatch::{FLAG_EXCEPTIONAL, InstCode};
use crate::events::{
    self, ArrayAction, CallKind, ConstructKind, FieldKind, MethodKind, MonitorKind, ThrowableKind,
};
use crate::eventspec::{EventSpecification, member_key};
use crate::hierarchy::ClassHierarchy;
use crate::ir::{self, Class, ExceptionHandler, Handle, InstrKind, Method};
use crate::opcodes;
use crate::probelog::InterceptRecord;
use crate::session::Session;

use super::code::{self, PatchBuilder};
use super::patches;
use super::InstrumentObserver;

/// Result of instrumenting one method.
pub(super) struct MethodOutcome {
    pub(super) method: Method,
    pub(super) new_methods: Vec<Method>,
}

struct SyncRelease {
    head: Handle,
    athrow: Handle,
}

pub(super) struct MethodInstrumenter<'a> {
    spec: &'a EventSpecification,
    hierarchy: &'a dyn ClassHierarchy,
    session: &'a mut Session,
    class_name: String,
    super_name: Option<String>,
    wants_start_probe: bool,
    method: Method,
    method_sig: String,
    loc_key: String,
    live_keys: BTreeSet<String>,
    exc_local: u16,
    monitor_local: Option<u16>,
    value_local: Option<u16>,
    elem_class_local: Option<u16>,
    index_local: Option<u16>,
    front_handlers: Vec<ExceptionHandler>,
    back_handlers: Vec<ExceptionHandler>,
    sync_release: Option<SyncRelease>,
    seen_super: bool,
    super_invoke: Option<Handle>,
    head_anchor: Handle,
    orig_start: Handle,
    next_pos: i32,
    new_methods: Vec<Method>,
}

impl<'a> MethodInstrumenter<'a> {
    pub(super) fn begin(
        spec: &'a EventSpecification,
        hierarchy: &'a dyn ClassHierarchy,
        session: &'a mut Session,
        class: &Class,
        method_index: usize,
        wants_start_probe: bool,
    ) -> Result<Self> {
        let method = class.methods[method_index].clone();
        let body = method
            .body
            .as_ref()
            .context("method without code reached the instrumenter")?;
        let method_sig = method.signature();
        let loc_key = method.location_key(&class.name);
        let next_pos = body
            .instructions
            .iter()
            .map(|i| i.pos)
            .max()
            .unwrap_or(-1)
            + 1;
        let first = body
            .instructions
            .first()
            .map(|i| i.handle)
            .context("empty method reached the instrumenter")?;
        let mut live_keys = BTreeSet::new();
        live_keys.insert(spec.key().to_string());
        Ok(Self {
            spec,
            hierarchy,
            session,
            class_name: class.name.clone(),
            super_name: class.super_name.clone(),
            wants_start_probe,
            method,
            method_sig,
            loc_key,
            live_keys,
            exc_local: 0,
            monitor_local: None,
            value_local: None,
            elem_class_local: None,
            index_local: None,
            front_handlers: Vec::new(),
            back_handlers: Vec::new(),
            sync_release: None,
            seen_super: true,
            super_invoke: None,
            head_anchor: first,
            orig_start: first,
            next_pos,
            new_methods: Vec::new(),
        })
    }

    pub(super) fn run(&mut self, observer: &mut dyn InstrumentObserver) -> Result<()> {
        observer.method_begin(&self.method_sig.clone());
        {
            let body = self.method.body.as_ref().expect("method body");
            let baseline = code::layout(body);
            observer.method_baseline(&self.method_sig, &baseline);
        }
        self.preamble()?;
        if self.method.is_synchronized() {
            self.desugar_synchronized(observer)?;
        }
        self.head_patches(observer)?;
        self.walk(observer)?;
        self.exit_probes(observer)?;
        self.finalize_handlers();
        let body = self.method.body.as_ref().expect("method body");
        let layout = code::layout(body);
        observer.method_end(&self.method_sig, &layout);
        Ok(())
    }

    pub(super) fn finish(self) -> MethodOutcome {
        MethodOutcome {
            method: self.method,
            new_methods: self.new_methods,
        }
    }

    /// Cache `origStart` past any super-constructor call and claim the
    /// scratch local for exceptional exits.
    fn preamble(&mut self) -> Result<()> {
        let is_ctor = self.method.is_constructor();
        let body = self.method.body.as_mut().expect("method body");
        self.exc_local = body.max_locals;
        body.max_locals += 1;

        if is_ctor {
            self.seen_super = false;
            let super_pos = body.instructions.iter().position(|instr| {
                matches!(
                    &instr.kind,
                    InstrKind::Invoke { opcode, owner, name, .. }
                        if *opcode == opcodes::INVOKESPECIAL
                            && name == "<init>"
                            && (Some(owner.as_str()) == self.super_name.as_deref()
                                || owner == &self.class_name)
                )
            });
            if let Some(index) = super_pos {
                self.super_invoke = Some(body.instructions[index].handle);
                if let Some(next) = body.instructions.get(index + 1) {
                    self.orig_start = next.handle;
                    self.head_anchor = next.handle;
                }
            }
        }
        Ok(())
    }

    fn fresh_pos(&mut self) -> i32 {
        let pos = self.next_pos;
        self.next_pos += 1;
        pos
    }

    /// Synchronized methods lose their flag; the body runs between an
    /// explicit monitor enter and per-return exits, with a catch-all
    /// release handler rethrowing afterwards.
    fn desugar_synchronized(&mut self, observer: &mut dyn InstrumentObserver) -> Result<()> {
        self.method.access_flags &= !ir::ACC_SYNCHRONIZED;
        let is_static = self.method.is_static();
        let class_name = self.class_name.clone();
        let enter_pos = self.fresh_pos();

        let monitor_local = if is_static {
            let body = self.method.body.as_mut().expect("method body");
            let local = body.max_locals;
            body.max_locals += 1;
            self.monitor_local = Some(local);
            Some(local)
        } else {
            None
        };

        let body = self.method.body.as_mut().expect("method body");
        let mut builder = PatchBuilder::new(&mut *body);
        match monitor_local {
            Some(local) => {
                builder.push(InstrKind::PushClass(class_name.clone()));
                builder.push(patches::local(opcodes::ASTORE, local));
                builder.push(patches::local(opcodes::ALOAD, local));
            }
            None => {
                builder.push(patches::local(opcodes::ALOAD, 0));
            }
        }
        builder.push_with_pos(patches::raw(opcodes::MONITORENTER), enter_pos);
        let patch = builder.finish();
        let enter_head = patch.first_handle();
        code::insert_before(body, self.head_anchor, patch, false)?;
        self.head_anchor = enter_head;

        // Per-return releases, probed like any user monitor instruction.
        let returns: Vec<Handle> = body
            .instructions
            .iter()
            .filter(|i| i.pos >= 0 && opcodes::is_return(i.kind.opcode()))
            .map(|i| i.handle)
            .collect();
        for ret in returns {
            let exit_pos = self.fresh_pos();
            let body = self.method.body.as_mut().expect("method body");
            let mut builder = PatchBuilder::new(&mut *body);
            match self.monitor_local {
                Some(local) => builder.push(patches::local(opcodes::ALOAD, local)),
                None => builder.push(patches::local(opcodes::ALOAD, 0)),
            };
            builder.push_with_pos(patches::raw(opcodes::MONITOREXIT), exit_pos);
            let patch = builder.finish();
            code::insert_before(body, ret, patch, true)?;
        }

        // Release-and-rethrow handler.
        let exc_local = self.exc_local;
        let release_pos = self.fresh_pos();
        let body = self.method.body.as_mut().expect("method body");
        let mut builder = PatchBuilder::new(&mut *body);
        let head = builder.push(patches::local(opcodes::ASTORE, exc_local));
        match self.monitor_local {
            Some(local) => builder.push(patches::local(opcodes::ALOAD, local)),
            None => builder.push(patches::local(opcodes::ALOAD, 0)),
        };
        builder.push_with_pos(patches::raw(opcodes::MONITOREXIT), release_pos);
        let reload = builder.push(patches::local(opcodes::ALOAD, exc_local));
        let athrow = builder.push(patches::raw(opcodes::ATHROW));
        let patch = builder.finish();
        code::append(body, patch);

        let probe_id = observer.new_probe(
            events::EVENT_MON_ACQUIRE,
            &self.live_keys,
            &self.loc_key,
        );
        let body_span = ExceptionHandler {
            start: self.orig_start,
            end: head,
            handler: head,
            catch_type: None,
        };
        let release_span = ExceptionHandler {
            start: head,
            end: reload,
            handler: head,
            catch_type: None,
        };
        observer.exception_handler_added(probe_id, &body_span, false);
        observer.exception_handler_added(probe_id, &release_span, false);
        observer.synthetic_handler_added(head);
        self.back_handlers.push(body_span);
        self.back_handlers.push(release_span);
        self.sync_release = Some(SyncRelease { head, athrow });
        Ok(())
    }

    /// Head-of-method patches in execution order: class-prepare wait, start
    /// probe, entry probe.
    fn head_patches(&mut self, observer: &mut dyn InstrumentObserver) -> Result<()> {
        if self.method.is_static_initializer()
            && self.session.prepare_wait()
            && !self.session.adaptive()
        {
            let id = observer.new_probe(
                events::EVENT_CLASS_PREPARE,
                &self.live_keys,
                &self.loc_key,
            );
            let body = self.method.body.as_mut().expect("method body");
            let patch = patches::prepare_wait_patch(&mut *body);
            let handles = code::insert_before(body, self.head_anchor, patch, false)?;
            observer.probe_inserted(
                id,
                events::EVENT_CLASS_PREPARE,
                &handles,
                self.head_anchor,
                true,
            );
        }

        if self.wants_start_probe {
            let id = observer.new_probe(events::EVENT_START, &self.live_keys, &self.loc_key);
            let class_name = self.class_name.clone();
            let string_index = self.session.add_string(&class_name)?;
            let mask = InstCode::new(events::EVENT_START, string_index).encode();
            let body = self.method.body.as_mut().expect("method body");
            let patch = patches::start_probe_patch(&mut *body, &class_name, mask);
            let handles = code::insert_before(body, self.head_anchor, patch, false)?;
            observer.probe_inserted(id, events::EVENT_START, &handles, self.head_anchor, true);
        }

        self.entry_probe(observer)?;
        Ok(())
    }

    fn method_event_payload(&self) -> String {
        format!(
            "{}#{}#{}#{:x}",
            self.class_name, self.method.name, self.method.descriptor, self.method.access_flags
        )
    }

    fn entry_exit_codes(&self) -> (Option<(u8, bool)>, Option<(u8, bool)>) {
        if self.method.is_constructor() {
            let enter =
                self.spec
                    .witness_constructor(ConstructKind::Enter, &self.class_name, &self.loc_key);
            let exit =
                self.spec
                    .witness_constructor(ConstructKind::Exit, &self.class_name, &self.loc_key);
            (
                Some((events::EVENT_CONSTRUCTOR_ENTER, enter)),
                Some((events::EVENT_CONSTRUCTOR_EXIT, exit)),
            )
        } else if self.method.is_static_initializer() {
            let enter = self.spec.witness_static_init(&self.class_name);
            (Some((events::EVENT_STATIC_INIT_ENTER, enter)), None)
        } else if self.method.is_static() {
            let enter = self
                .spec
                .witness_method(MethodKind::StaticEnter, &self.loc_key, &self.loc_key);
            let exit = self
                .spec
                .witness_method(MethodKind::StaticExit, &self.loc_key, &self.loc_key);
            (
                Some((events::EVENT_SMETHOD_ENTER, enter)),
                Some((events::EVENT_SMETHOD_EXIT, exit)),
            )
        } else {
            let enter = self
                .spec
                .witness_method(MethodKind::VirtualEnter, &self.loc_key, &self.loc_key);
            let exit = self
                .spec
                .witness_method(MethodKind::VirtualExit, &self.loc_key, &self.loc_key);
            (
                Some((events::EVENT_VMETHOD_ENTER, enter)),
                Some((events::EVENT_VMETHOD_EXIT, exit)),
            )
        }
    }

    fn entry_probe(&mut self, observer: &mut dyn InstrumentObserver) -> Result<()> {
        let (enter, _) = self.entry_exit_codes();
        let Some((event_code, witnessed)) = enter else {
            return Ok(());
        };
        if !witnessed {
            return Ok(());
        }
        let payload = self.method_event_payload();
        let string_index = self.session.add_string(&payload)?;
        let mask = InstCode::new(event_code, string_index).encode();
        let id = observer.new_probe(event_code, &self.live_keys, &self.loc_key);
        let class_name = self.class_name.clone();
        let body = self.method.body.as_mut().expect("method body");
        let mut builder = PatchBuilder::new(&mut *body);
        builder.push(InstrKind::PushInt(mask));
        builder.push(patches::trigger_static(&class_name));
        let patch = builder.finish();
        let handles = code::insert_before(body, self.head_anchor, patch, false)?;
        observer.probe_inserted(id, event_code, &handles, self.head_anchor, true);
        Ok(())
    }

    /// Exit probes before every return, plus the exceptional-exit path.
    fn exit_probes(&mut self, observer: &mut dyn InstrumentObserver) -> Result<()> {
        let (_, exit) = self.entry_exit_codes();
        let Some((event_code, witnessed)) = exit else {
            return Ok(());
        };
        if !witnessed {
            return Ok(());
        }
        let payload = self.method_event_payload();
        let string_index = self.session.add_string(&payload)?;
        let mask = InstCode::new(event_code, string_index).encode();
        let exc_mask = InstCode::new(event_code, string_index)
            .with_flags(FLAG_EXCEPTIONAL)
            .encode();
        let id = observer.new_probe(event_code, &self.live_keys, &self.loc_key);
        let class_name = self.class_name.clone();

        let returns: Vec<Handle> = {
            let body = self.method.body.as_ref().expect("method body");
            body.instructions
                .iter()
                .filter(|i| i.pos >= 0 && opcodes::is_return(i.kind.opcode()))
                .map(|i| i.handle)
                .collect()
        };
        for ret in returns {
            let body = self.method.body.as_mut().expect("method body");
            let mut builder = PatchBuilder::new(&mut *body);
            builder.push(InstrKind::PushInt(mask));
            builder.push(patches::trigger_static(&class_name));
            let patch = builder.finish();
            let handles = code::insert_before(body, ret, patch, true)?;
            observer.probe_inserted(id, event_code, &handles, ret, true);
        }

        match &self.sync_release {
            Some(release) => {
                // The synchronized transform already owns the catch-all;
                // fold the exceptional exit into it.
                let anchor = release.athrow;
                let body = self.method.body.as_mut().expect("method body");
                let mut builder = PatchBuilder::new(&mut *body);
                builder.push(InstrKind::PushInt(exc_mask));
                builder.push(patches::trigger_static(&class_name));
                let patch = builder.finish();
                let handles = code::insert_before(body, anchor, patch, false)?;
                observer.probe_inserted(id, event_code, &handles, anchor, true);
            }
            None => {
                let body = self.method.body.as_mut().expect("method body");
                let mut builder = PatchBuilder::new(&mut *body);
                let head = builder.push(InstrKind::PushInt(exc_mask));
                builder.push(patches::trigger_static(&class_name));
                builder.push(patches::raw(opcodes::ATHROW));
                let patch = builder.finish();
                let handles = code::append(body, patch);
                let handler = ExceptionHandler {
                    start: self.orig_start,
                    end: head,
                    handler: head,
                    catch_type: None,
                };
                observer.exception_handler_added(id, &handler, true);
                observer.probe_inserted(id, event_code, &handles, head, false);
                self.back_handlers.push(handler);
            }
        }
        observer.exit_probe_added(id);
        Ok(())
    }

    /// Single pass over the original (and desugared) instructions,
    /// dispatching on opcode.
    fn walk(&mut self, observer: &mut dyn InstrumentObserver) -> Result<()> {
        let snapshot: Vec<(Handle, i32, InstrKind)> = {
            let body = self.method.body.as_ref().expect("method body");
            body.instructions
                .iter()
                .map(|i| (i.handle, i.pos, i.kind.clone()))
                .collect()
        };
        let handler_heads: BTreeMap<Handle, Option<String>> = {
            let body = self.method.body.as_ref().expect("method body");
            body.handlers
                .iter()
                .map(|h| (h.handler, h.catch_type.clone()))
                .collect()
        };

        for (handle, pos, kind) in snapshot {
            if pos < 0 {
                continue;
            }
            if let Some(catch_type) = handler_heads.get(&handle) {
                self.catch_probe(observer, handle, catch_type.as_deref())?;
            }
            match kind {
                InstrKind::TypeRef { opcode, class } if opcode == opcodes::NEW => {
                    self.new_probe(observer, handle, &class)?;
                }
                InstrKind::Raw { opcode, .. } if opcode == opcodes::MONITORENTER => {
                    self.monitor_probes(
                        observer,
                        handle,
                        [MonitorKind::Contend, MonitorKind::Acquire],
                    )?;
                }
                InstrKind::Raw { opcode, .. } if opcode == opcodes::MONITOREXIT => {
                    self.monitor_probes(
                        observer,
                        handle,
                        [MonitorKind::PreRelease, MonitorKind::Release],
                    )?;
                }
                InstrKind::Raw { opcode, .. }
                    if opcodes::is_array_load(opcode) || opcodes::is_array_store(opcode) =>
                {
                    self.array_probe(observer, handle, opcode)?;
                }
                InstrKind::Invoke {
                    opcode,
                    owner,
                    name,
                    descriptor,
                } if opcode != opcodes::INVOKEDYNAMIC => {
                    self.call_probes(observer, handle, opcode, &owner, &name, &descriptor)?;
                }
                InstrKind::FieldAccess {
                    opcode,
                    owner,
                    name,
                    descriptor,
                } => {
                    self.field_probe(observer, handle, opcode, &owner, &name, &descriptor)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn catch_probe(
        &mut self,
        observer: &mut dyn InstrumentObserver,
        anchor: Handle,
        catch_type: Option<&str>,
    ) -> Result<()> {
        let queried = catch_type.unwrap_or("java.lang.Throwable");
        if !self.spec.witness_throwable(
            ThrowableKind::Catch,
            queried,
            &self.loc_key,
            self.hierarchy,
        )? {
            return Ok(());
        }
        let id = observer.new_probe(events::EVENT_CATCH, &self.live_keys, &self.loc_key);
        let class_name = self.class_name.clone();
        let body = self.method.body.as_mut().expect("method body");
        let mut builder = PatchBuilder::new(&mut *body);
        builder.push(patches::raw(opcodes::DUP));
        builder.push(patches::invoke_virtual(
            "java.lang.Object",
            "getClass",
            "()Ljava/lang/Class;",
        ));
        builder.push(patches::trigger_catch(&class_name));
        let patch = builder.finish();
        let handles = code::insert_before(body, anchor, patch, true)?;
        observer.probe_inserted(id, events::EVENT_CATCH, &handles, anchor, true);
        Ok(())
    }

    fn new_probe(
        &mut self,
        observer: &mut dyn InstrumentObserver,
        anchor: Handle,
        class: &str,
    ) -> Result<()> {
        if !self.spec.witness_new(class, &self.loc_key) {
            return Ok(());
        }
        let string_index = self.session.add_string(class)?;
        let mask = InstCode::new(events::EVENT_NEW_OBJ, string_index).encode();
        let id = observer.new_probe(events::EVENT_NEW_OBJ, &self.live_keys, &self.loc_key);
        let class_name = self.class_name.clone();
        let body = self.method.body.as_mut().expect("method body");
        let mut builder = PatchBuilder::new(&mut *body);
        builder.push(InstrKind::PushInt(mask));
        builder.push(patches::trigger_static(&class_name));
        let patch = builder.finish();
        let handles = code::insert_before(body, anchor, patch, true)?;
        observer.probe_inserted(id, events::EVENT_NEW_OBJ, &handles, anchor, true);
        Ok(())
    }

    fn monitor_probes(
        &mut self,
        observer: &mut dyn InstrumentObserver,
        anchor: Handle,
        kinds: [MonitorKind; 2],
    ) -> Result<()> {
        let mut first = true;
        for kind in kinds {
            if !self.spec.witness_monitor(kind, &self.loc_key) {
                continue;
            }
            let id = observer.new_probe(kind.event_code(), &self.live_keys, &self.loc_key);
            let class_name = self.class_name.clone();
            let body = self.method.body.as_mut().expect("method body");
            let mut builder = PatchBuilder::new(&mut *body);
            builder.push(patches::raw(opcodes::DUP));
            builder.push(InstrKind::PushInt(kind.event_code() as i32));
            builder.push(patches::trigger_mon(&class_name));
            let patch = builder.finish();
            let handles = code::insert_before(body, anchor, patch, first)?;
            observer.probe_inserted(id, kind.event_code(), &handles, anchor, true);
            first = false;
        }
        Ok(())
    }

    fn call_probes(
        &mut self,
        observer: &mut dyn InstrumentObserver,
        anchor: Handle,
        opcode: u8,
        owner: &str,
        name: &str,
        descriptor: &str,
    ) -> Result<()> {
        let kind = match opcode {
            opcodes::INVOKESTATIC => CallKind::Static,
            opcodes::INVOKEINTERFACE => CallKind::Interface,
            opcodes::INVOKESPECIAL if name == "<init>" => CallKind::Constructor,
            _ => CallKind::Virtual,
        };

        if kind == CallKind::Constructor && !self.seen_super {
            // No constructor-call probes until the super call has run; the
            // receiver is still uninitialized.
            if Some(anchor) == self.super_invoke {
                self.seen_super = true;
            }
            return Ok(());
        }

        let name_key = member_key(owner, name, descriptor);
        if !self.spec.witness_call(
            kind,
            owner,
            &name_key,
            &self.class_name,
            &self.loc_key,
        ) {
            return Ok(());
        }

        if kind != CallKind::Constructor && self.spec.use_call_interceptor(&name_key) {
            return self.call_interceptor(observer, anchor, opcode, owner, name, descriptor, kind);
        }

        let payload = format!("{owner}#{name}#{descriptor}");
        let string_index = self.session.add_string(&payload)?;
        let call_mask = InstCode::new(kind.event_code(), string_index).encode();
        let ret_mask = InstCode::new(events::EVENT_CALL_RETURN, string_index).encode();
        let exc_mask = InstCode::new(events::EVENT_CALL_RETURN, string_index)
            .with_flags(FLAG_EXCEPTIONAL)
            .encode();
        let id = observer.new_probe(kind.event_code(), &self.live_keys, &self.loc_key);
        let class_name = self.class_name.clone();

        let body = self.method.body.as_mut().expect("method body");
        let mut builder = PatchBuilder::new(&mut *body);
        builder.push(InstrKind::PushInt(call_mask));
        builder.push(patches::trigger_static(&class_name));
        let patch = builder.finish();
        let handles = code::insert_before(body, anchor, patch, true)?;
        observer.probe_inserted(id, kind.event_code(), &handles, anchor, true);

        let body = self.method.body.as_mut().expect("method body");
        let mut builder = PatchBuilder::new(&mut *body);
        let after_head = builder.push(InstrKind::PushInt(ret_mask));
        builder.push(patches::trigger_static(&class_name));
        let patch = builder.finish();
        let handles = code::insert_after(body, anchor, patch)?;
        observer.probe_inserted(id, events::EVENT_CALL_RETURN, &handles, anchor, false);

        let body = self.method.body.as_mut().expect("method body");
        let mut builder = PatchBuilder::new(&mut *body);
        let handler_head = builder.push(InstrKind::PushInt(exc_mask));
        builder.push(patches::trigger_static(&class_name));
        builder.push(patches::raw(opcodes::ATHROW));
        let patch = builder.finish();
        let handles = code::append(body, patch);
        observer.probe_inserted(id, events::EVENT_CALL_RETURN, &handles, handler_head, false);

        let handler = ExceptionHandler {
            start: anchor,
            end: after_head,
            handler: handler_head,
            catch_type: None,
        };
        observer.exception_handler_added(id, &handler, true);
        self.front_handlers.push(handler);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn call_interceptor(
        &mut self,
        observer: &mut dyn InstrumentObserver,
        anchor: Handle,
        opcode: u8,
        owner: &str,
        name: &str,
        descriptor: &str,
        kind: CallKind,
    ) -> Result<()> {
        let id = observer.new_probe(kind.event_code(), &self.live_keys, &self.loc_key);
        let member = format!("call:{name}");
        let interceptor_name = match self.session.interceptor_for(owner, &member, descriptor) {
            Some(existing) => existing.to_string(),
            None => {
                let interceptor_name = patches::call_interceptor_name(owner, name);
                let method = patches::call_interceptor_method(
                    self.session,
                    &self.class_name,
                    opcode,
                    owner,
                    name,
                    descriptor,
                    &interceptor_name,
                    kind.event_code(),
                )?;
                observer.field_interceptor_method_added(id, &method.signature());
                self.session
                    .cache_interceptor(owner, &member, descriptor, &interceptor_name);
                self.new_methods.push(method);
                interceptor_name
            }
        };

        let replacement_descriptor = if opcode == opcodes::INVOKESTATIC {
            descriptor.to_string()
        } else {
            let (params, ret) = patches::split_descriptor(descriptor);
            format!(
                "({}{params}){ret}",
                patches::class_type_descriptor(owner)
            )
        };
        let record = InterceptRecord {
            opcode,
            owner: owner.to_string(),
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            interceptor_name: interceptor_name.clone(),
        };
        let class_name = self.class_name.clone();
        let body = self.method.body.as_mut().expect("method body");
        code::replace_kind(
            body,
            anchor,
            InstrKind::Invoke {
                opcode: opcodes::INVOKESTATIC,
                owner: class_name,
                name: interceptor_name,
                descriptor: replacement_descriptor,
            },
        )?;
        observer.call_interceptor_added(id, &record, anchor);
        Ok(())
    }

    fn field_probe(
        &mut self,
        observer: &mut dyn InstrumentObserver,
        anchor: Handle,
        opcode: u8,
        owner: &str,
        name: &str,
        descriptor: &str,
    ) -> Result<()> {
        let kind = match opcode {
            opcodes::GETSTATIC => FieldKind::GetStatic,
            opcodes::PUTSTATIC => FieldKind::PutStatic,
            opcodes::GETFIELD => FieldKind::GetField,
            _ => FieldKind::PutField,
        };
        let name_key = member_key(owner, name, descriptor);
        if !self.spec.witness_field(kind, &name_key, &self.loc_key) {
            return Ok(());
        }

        let id = observer.new_probe(kind.event_code(), &self.live_keys, &self.loc_key);
        let member = format!("field:{}:{name}", if kind.is_write() { "write" } else { "read" });
        let interceptor_name = match self.session.interceptor_for(owner, &member, descriptor) {
            Some(existing) => existing.to_string(),
            None => {
                let interceptor_name =
                    patches::field_interceptor_name(&self.class_name, owner, name, kind.is_write());
                let method = patches::field_interceptor_method(
                    self.session,
                    &self.class_name,
                    opcode,
                    owner,
                    name,
                    descriptor,
                    &interceptor_name,
                    kind.event_code(),
                )?;
                observer.field_interceptor_method_added(id, &method.signature());
                self.session
                    .cache_interceptor(owner, &member, descriptor, &interceptor_name);
                self.new_methods.push(method);
                interceptor_name
            }
        };

        let record = InterceptRecord {
            opcode,
            owner: owner.to_string(),
            name: name.to_string(),
            descriptor: descriptor.to_string(),
            interceptor_name: interceptor_name.clone(),
        };
        let replacement_descriptor = patches::field_interceptor_descriptor(opcode, owner, descriptor);
        let class_name = self.class_name.clone();
        let body = self.method.body.as_mut().expect("method body");
        code::replace_kind(
            body,
            anchor,
            InstrKind::Invoke {
                opcode: opcodes::INVOKESTATIC,
                owner: class_name,
                name: interceptor_name,
                descriptor: replacement_descriptor,
            },
        )?;
        observer.field_interceptor_added(id, &record, anchor);
        Ok(())
    }

    fn array_probe(
        &mut self,
        observer: &mut dyn InstrumentObserver,
        anchor: Handle,
        opcode: u8,
    ) -> Result<()> {
        let (element_type, action) = array_site(opcode);
        let resolved = self
            .spec
            .resolve_array_bounds(action, element_type, &self.loc_key);
        if resolved.is_empty() {
            return Ok(());
        }

        let index_local = match self.index_local {
            Some(local) => local,
            None => {
                let body = self.method.body.as_mut().expect("method body");
                let local = body.max_locals;
                body.max_locals += 1;
                self.index_local = Some(local);
                local
            }
        };
        let is_store = opcodes::is_array_store(opcode);
        let value_local = if is_store {
            Some(match self.value_local {
                Some(local) => local,
                None => {
                    let body = self.method.body.as_mut().expect("method body");
                    let local = body.max_locals;
                    body.max_locals += 2;
                    self.value_local = Some(local);
                    local
                }
            })
        } else {
            None
        };
        let needs_snapshot = element_type == OBJECT_TYPE
            && resolved.iter().any(|b| b.element_type != ANY_TYPE);
        let elem_class_local = if needs_snapshot {
            Some(match self.elem_class_local {
                Some(local) => local,
                None => {
                    let body = self.method.body.as_mut().expect("method body");
                    let local = body.max_locals;
                    body.max_locals += 1;
                    self.elem_class_local = Some(local);
                    local
                }
            })
        } else {
            None
        };

        let mut masks = Vec::new();
        for bound in &resolved {
            let payload = format!("{}#{}", self.loc_key, bound.element_type);
            let string_index = self.session.add_string(&payload)?;
            masks.push(InstCode::new(action.event_code(), string_index).encode());
        }

        let id = observer.new_probe(action.event_code(), &self.live_keys, &self.loc_key);
        let class_name = self.class_name.clone();
        let value_store = patches::store_opcode(element_descriptor(element_type));
        let value_load = patches::load_opcode(element_descriptor(element_type));

        let body = self.method.body.as_mut().expect("method body");
        let mut builder = PatchBuilder::new(&mut *body);
        if let Some(value_local) = value_local {
            builder.push(patches::local(value_store, value_local));
        }
        builder.push(patches::local(opcodes::ISTORE, index_local));
        if let Some(class_local) = elem_class_local {
            builder.push(patches::raw(opcodes::DUP));
            builder.push(patches::invoke_virtual(
                "java.lang.Object",
                "getClass",
                "()Ljava/lang/Class;",
            ));
            builder.push(patches::invoke_virtual(
                "java.lang.Class",
                "getComponentType",
                "()Ljava/lang/Class;",
            ));
            builder.push(patches::local(opcodes::ASTORE, class_local));
        }

        for (bound, mask) in resolved.iter().zip(&masks) {
            emit_bound_dispatch(
                &mut builder,
                bound,
                *mask,
                index_local,
                elem_class_local,
                &class_name,
            );
        }

        builder.push(patches::local(opcodes::ILOAD, index_local));
        if let Some(value_local) = value_local {
            builder.push(patches::local(value_load, value_local));
        }
        let patch = builder.finish();
        let handles = code::insert_before(body, anchor, patch, true)?;
        observer.probe_inserted(id, action.event_code(), &handles, anchor, true);
        Ok(())
    }

    fn finalize_handlers(&mut self) {
        let body = self.method.body.as_mut().expect("method body");
        let originals = std::mem::take(&mut body.handlers);
        let mut handlers = std::mem::take(&mut self.front_handlers);
        handlers.extend(originals);
        handlers.append(&mut self.back_handlers);
        body.handlers = handlers;
    }
}

/// Static element type and direction of an array access opcode.
fn array_site(opcode: u8) -> (&'static str, ArrayAction) {
    match opcode {
        opcodes::IALOAD => ("int", ArrayAction::Load),
        opcodes::LALOAD => ("long", ArrayAction::Load),
        opcodes::FALOAD => ("float", ArrayAction::Load),
        opcodes::DALOAD => ("double", ArrayAction::Load),
        opcodes::AALOAD => (OBJECT_TYPE, ArrayAction::Load),
        opcodes::BALOAD => ("byte", ArrayAction::Load),
        opcodes::CALOAD => ("char", ArrayAction::Load),
        opcodes::SALOAD => ("short", ArrayAction::Load),
        opcodes::IASTORE => ("int", ArrayAction::Store),
        opcodes::LASTORE => ("long", ArrayAction::Store),
        opcodes::FASTORE => ("float", ArrayAction::Store),
        opcodes::DASTORE => ("double", ArrayAction::Store),
        opcodes::AASTORE => (OBJECT_TYPE, ArrayAction::Store),
        opcodes::BASTORE => ("byte", ArrayAction::Store),
        opcodes::CASTORE => ("char", ArrayAction::Store),
        _ => ("short", ArrayAction::Store),
    }
}

fn element_descriptor(element_type: &str) -> &'static str {
    match element_type {
        "int" => "I",
        "long" => "J",
        "float" => "F",
        "double" => "D",
        "byte" => "B",
        "char" => "C",
        "short" => "S",
        "boolean" => "Z",
        _ => "Ljava/lang/Object;",
    }
}

/// One `(type-compare, range-compare)` block ending in the trigger call and
/// falling through to the next block.
fn emit_bound_dispatch(
    builder: &mut PatchBuilder<'_>,
    bound: &ArrayElementBounds,
    mask: i32,
    index_local: u16,
    elem_class_local: Option<u16>,
    class_name: &str,
) {
    let end = builder.reserve();
    if bound.element_type != ANY_TYPE {
        if let Some(class_local) = elem_class_local {
            builder.push(patches::local(opcodes::ALOAD, class_local));
            builder.push(InstrKind::PushClass(bound.element_type.clone()));
            builder.push(InstrKind::Branch {
                opcode: opcodes::IF_ACMPNE,
                target: end,
            });
        }
    }
    match (bound.min, bound.max) {
        (Some(min), Some(max)) if min > max => {
            // Tail interval: hit when index <= max or index >= min.
            let hit = builder.reserve();
            builder.push(patches::local(opcodes::ILOAD, index_local));
            builder.push(InstrKind::PushInt(max));
            builder.push(InstrKind::Branch {
                opcode: opcodes::IF_ICMPLE,
                target: hit,
            });
            builder.push(patches::local(opcodes::ILOAD, index_local));
            builder.push(InstrKind::PushInt(min));
            builder.push(InstrKind::Branch {
                opcode: opcodes::IF_ICMPLT,
                target: end,
            });
            builder.push_with_handle(hit, patches::raw(opcodes::NOP));
        }
        (min, max) => {
            if let Some(min) = min {
                builder.push(patches::local(opcodes::ILOAD, index_local));
                builder.push(InstrKind::PushInt(min));
                builder.push(InstrKind::Branch {
                    opcode: opcodes::IF_ICMPLT,
                    target: end,
                });
            }
            if let Some(max) = max {
                builder.push(patches::local(opcodes::ILOAD, index_local));
                builder.push(InstrKind::PushInt(max));
                builder.push(InstrKind::Branch {
                    opcode: opcodes::IF_ICMPGT,
                    target: end,
                });
            }
        }
    }
    builder.push(patches::raw(opcodes::DUP));
    builder.push(InstrKind::PushInt(mask));
    builder.push(patches::trigger_obj(class_name));
    builder.push_with_handle(end, patches::raw(opcodes::NOP));
}
