#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::io::{Read, Write};

use anyhow::{Context, Result};

use crate::bounds::{ArrayElementBounds, ArrayElementConditions, GlobalConstraints};
use crate::condtree::{Condition, ConditionNode, EventConditions, normalize_key};
use crate::events::{
    ArrayAction, CallKind, ConstructKind, FieldKind, MethodKind, MonitorKind, ThrowableKind,
};
use crate::hierarchy::ClassHierarchy;
use crate::wire;

/// Bit reported when a field read must be witnessed.
pub(crate) const WITNESS_READ: u8 = 0x1;
/// Bit reported when a field write must be witnessed.
pub(crate) const WITNESS_WRITE: u8 = 0x2;

/// Property requesting replacement-style call instrumentation.
pub(crate) const PROP_USE_INTERCEPT: &str = "call:use_intercept";

/// Dotted `class.member.signature` name key for a member observable.
pub(crate) fn member_key(class: &str, member: &str, signature: &str) -> String {
    format!("{class}.{member}.{signature}")
}

/// One source unit of the observed program.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct ProgramUnit {
    pub(crate) location: Option<String>,
    pub(crate) use_location: bool,
    pub(crate) is_jar: bool,
    pub(crate) classes: BTreeSet<String>,
}

impl ProgramUnit {
    pub(crate) fn of_classes<I: IntoIterator<Item = String>>(classes: I) -> Self {
        Self {
            classes: classes.into_iter().collect(),
            ..Self::default()
        }
    }

    fn write_to<W: Write>(&self, out: &mut W) -> Result<()> {
        match &self.location {
            Some(location) => {
                wire::write_bool(out, true)?;
                wire::write_utf(out, location)?;
            }
            None => wire::write_bool(out, false)?,
        }
        wire::write_bool(out, self.use_location)?;
        wire::write_bool(out, self.is_jar)?;
        wire::write_i32(out, self.classes.len() as i32)?;
        for class in &self.classes {
            wire::write_utf(out, class)?;
        }
        Ok(())
    }

    fn read_from<R: Read>(input: &mut R) -> Result<Self> {
        let location = if wire::read_bool(input)? {
            Some(wire::read_utf(input)?)
        } else {
            None
        };
        let use_location = wire::read_bool(input)?;
        let is_jar = wire::read_bool(input)?;
        let count = wire::read_i32(input).context("read program unit class count")?;
        let mut classes = BTreeSet::new();
        for _ in 0..count {
            classes.insert(wire::read_utf(input)?);
        }
        Ok(Self {
            location,
            use_location,
            is_jar,
            classes,
        })
    }
}

/// Rule table for one event kind: name key to location conditions.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct RuleMap {
    rules: BTreeMap<String, EventConditions>,
}

impl RuleMap {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.rules.len()
    }

    pub(crate) fn get(&self, name: &str) -> Option<&EventConditions> {
        self.rules.get(normalize_key(name))
    }

    pub(crate) fn insert(&mut self, name: &str, conditions: EventConditions) {
        self.rules.insert(normalize_key(name).to_string(), conditions);
    }

    /// Unconditional rule: location tree whose root answers `inclusion`.
    pub(crate) fn insert_simple(&mut self, name: &str, observable: &str, inclusion: bool, rank: i32) {
        let mut conditions = EventConditions::new(observable);
        conditions.clear(ConditionNode::root(inclusion, rank));
        self.insert(name, conditions);
    }

    pub(crate) fn remove(&mut self, name: &str) -> Option<EventConditions> {
        self.rules.remove(normalize_key(name))
    }

    pub(crate) fn keys(&self) -> impl Iterator<Item = &String> {
        self.rules.keys()
    }

    /// Highest-ranked condition over every prefix of `name_key` that exists
    /// as a rule, each checked against the site's location key.
    pub(crate) fn lookup(&self, name_key: &str, loc_key: &str) -> Condition {
        let name_key = normalize_key(name_key);
        let mut best = Condition::default_exclude();
        let mut end = 0;
        let bytes = name_key.as_bytes();
        loop {
            while end < bytes.len() && bytes[end] != b'.' {
                end += 1;
            }
            if let Some(conditions) = self.rules.get(&name_key[..end]) {
                let cond = conditions.check(loc_key);
                if cond.rank >= best.rank {
                    best = cond;
                }
            }
            if end >= bytes.len() {
                break;
            }
            end += 1;
        }
        best
    }

    pub(crate) fn witness(&self, name_key: &str, loc_key: &str) -> bool {
        self.lookup(name_key, loc_key).inclusion
    }

    /// Whether any rule with a possible inclusion exists under `name_key`'s
    /// prefixes. Conservative, never a false negative.
    pub(crate) fn any_inclusion_for(&self, name_key: &str) -> bool {
        let name_key = normalize_key(name_key);
        let mut end = 0;
        let bytes = name_key.as_bytes();
        loop {
            while end < bytes.len() && bytes[end] != b'.' {
                end += 1;
            }
            if let Some(conditions) = self.rules.get(&name_key[..end]) {
                if conditions.any_inclusions().inclusion {
                    return true;
                }
            }
            if end >= bytes.len() {
                break;
            }
            end += 1;
        }
        false
    }

    pub(crate) fn any_inclusions(&self) -> bool {
        self.rules
            .values()
            .any(|conditions| conditions.any_inclusions().inclusion)
    }

    fn write_to<W: Write>(&self, out: &mut W) -> Result<()> {
        wire::write_i32(out, self.rules.len() as i32)?;
        for (key, conditions) in &self.rules {
            wire::write_utf(out, key)?;
            conditions.write_to(out)?;
        }
        Ok(())
    }

    fn read_from<R: Read>(input: &mut R) -> Result<Self> {
        let count = wire::read_i32(input).context("read rule map size")?;
        let mut map = Self::new();
        for _ in 0..count {
            let key = wire::read_utf(input)?;
            let conditions = EventConditions::read_from(input)
                .with_context(|| format!("read rule {key}"))?;
            map.rules.insert(key, conditions);
        }
        Ok(map)
    }
}

/// Compiled event specification: which observables are in scope where.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct EventSpecification {
    key: String,
    system_units: Vec<ProgramUnit>,
    module_units: Vec<ProgramUnit>,
    auto_boundary: bool,
    new_rules: RuleMap,
    field_rules: [RuleMap; 4],
    call_rules: [RuleMap; 4],
    constructor_rules: [RuleMap; 2],
    method_rules: [RuleMap; 4],
    monitor_rules: [RuleMap; 4],
    throwable_rules: [RuleMap; 2],
    throwable_inc_subclass: [BTreeSet<String>; 2],
    static_init_rules: RuleMap,
    array_elem_conditions: [ArrayElementConditions; 2],
    event_properties: BTreeMap<String, BTreeMap<String, String>>,
    globals: Option<GlobalConstraints>,
}

impl EventSpecification {
    pub(crate) fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            system_units: Vec::new(),
            module_units: Vec::new(),
            auto_boundary: true,
            new_rules: RuleMap::new(),
            field_rules: std::array::from_fn(|_| RuleMap::new()),
            call_rules: std::array::from_fn(|_| RuleMap::new()),
            constructor_rules: std::array::from_fn(|_| RuleMap::new()),
            method_rules: std::array::from_fn(|_| RuleMap::new()),
            monitor_rules: std::array::from_fn(|_| RuleMap::new()),
            throwable_rules: std::array::from_fn(|_| RuleMap::new()),
            throwable_inc_subclass: [BTreeSet::new(), BTreeSet::new()],
            static_init_rules: RuleMap::new(),
            array_elem_conditions: [
                ArrayElementConditions::new(ArrayAction::Load),
                ArrayElementConditions::new(ArrayAction::Store),
            ],
            event_properties: BTreeMap::new(),
            globals: None,
        }
    }

    pub(crate) fn key(&self) -> &str {
        &self.key
    }

    pub(crate) fn set_auto_boundary(&mut self, enabled: bool) {
        self.auto_boundary = enabled;
    }

    pub(crate) fn auto_boundary(&self) -> bool {
        self.auto_boundary
    }

    pub(crate) fn add_system_unit(&mut self, unit: ProgramUnit) {
        self.system_units.push(unit);
    }

    pub(crate) fn add_module_unit(&mut self, unit: ProgramUnit) {
        self.module_units.push(unit);
    }

    pub(crate) fn system_units(&self) -> &[ProgramUnit] {
        &self.system_units
    }

    pub(crate) fn module_units(&self) -> &[ProgramUnit] {
        &self.module_units
    }

    pub(crate) fn set_globals(&mut self, globals: GlobalConstraints) {
        self.globals = Some(globals);
    }

    pub(crate) fn globals(&self) -> Option<&GlobalConstraints> {
        self.globals.as_ref()
    }

    pub(crate) fn system_classes(&self) -> BTreeSet<&str> {
        self.system_units
            .iter()
            .flat_map(|unit| unit.classes.iter().map(String::as_str))
            .collect()
    }

    pub(crate) fn module_classes(&self) -> BTreeSet<&str> {
        self.module_units
            .iter()
            .flat_map(|unit| unit.classes.iter().map(String::as_str))
            .collect()
    }

    pub(crate) fn in_module(&self, class: &str) -> bool {
        self.module_units
            .iter()
            .any(|unit| unit.classes.contains(class))
    }

    pub(crate) fn in_system(&self, class: &str) -> bool {
        self.system_units
            .iter()
            .any(|unit| unit.classes.contains(class))
    }

    /// Module classes must form a subset of the system closure.
    pub(crate) fn validate(&self) -> Result<()> {
        let system = self.system_classes();
        for class in self.module_classes() {
            if !system.contains(class) {
                anyhow::bail!(
                    "module class {class} is not part of the system in specification {}",
                    self.key
                );
            }
        }
        Ok(())
    }

    pub(crate) fn new_rules_mut(&mut self) -> &mut RuleMap {
        &mut self.new_rules
    }

    pub(crate) fn field_rules_mut(&mut self, kind: FieldKind) -> &mut RuleMap {
        &mut self.field_rules[field_index(kind)]
    }

    pub(crate) fn call_rules_mut(&mut self, kind: CallKind) -> &mut RuleMap {
        &mut self.call_rules[call_index(kind)]
    }

    pub(crate) fn constructor_rules_mut(&mut self, kind: ConstructKind) -> &mut RuleMap {
        &mut self.constructor_rules[construct_index(kind)]
    }

    pub(crate) fn method_rules_mut(&mut self, kind: MethodKind) -> &mut RuleMap {
        &mut self.method_rules[method_index(kind)]
    }

    pub(crate) fn monitor_rules_mut(&mut self, kind: MonitorKind) -> &mut RuleMap {
        &mut self.monitor_rules[monitor_index(kind)]
    }

    pub(crate) fn throwable_rules_mut(&mut self, kind: ThrowableKind) -> &mut RuleMap {
        &mut self.throwable_rules[throwable_index(kind)]
    }

    pub(crate) fn static_init_rules_mut(&mut self) -> &mut RuleMap {
        &mut self.static_init_rules
    }

    pub(crate) fn array_conditions(&self, action: ArrayAction) -> &ArrayElementConditions {
        &self.array_elem_conditions[array_index(action)]
    }

    pub(crate) fn array_conditions_mut(&mut self, action: ArrayAction) -> &mut ArrayElementConditions {
        &mut self.array_elem_conditions[array_index(action)]
    }

    pub(crate) fn add_throwable_subclass_include(&mut self, kind: ThrowableKind, class: &str) {
        self.throwable_inc_subclass[throwable_index(kind)].insert(class.to_string());
    }

    pub(crate) fn set_event_property(&mut self, event_key: &str, name: &str, value: &str) {
        self.event_properties
            .entry(event_key.to_string())
            .or_default()
            .insert(name.to_string(), value.to_string());
    }

    /// Property lookup by longest matching prefix of the event key.
    pub(crate) fn event_property(&self, event_key: &str, name: &str) -> Option<&str> {
        let mut best: Option<&str> = None;
        let mut best_len = 0;
        for (prefix, properties) in &self.event_properties {
            if !event_key.starts_with(prefix.as_str()) || prefix.len() < best_len {
                continue;
            }
            if let Some(value) = properties.get(name) {
                best = Some(value.as_str());
                best_len = prefix.len();
            }
        }
        best
    }

    /// Whether calls matching `event_key` use replacement-style probes.
    pub(crate) fn use_call_interceptor(&self, event_key: &str) -> bool {
        self.event_property(event_key, PROP_USE_INTERCEPT) == Some("T")
    }

    pub(crate) fn witness_new(&self, class_name: &str, loc_key: &str) -> bool {
        self.new_rules.witness(class_name, loc_key)
    }

    pub(crate) fn witness_field(&self, kind: FieldKind, field_key: &str, loc_key: &str) -> bool {
        self.field_rules[field_index(kind)].witness(field_key, loc_key)
    }

    /// Call sites cross-checked against the module boundary: calls leaving
    /// the module are witnessed automatically unless disabled.
    pub(crate) fn witness_call(
        &self,
        kind: CallKind,
        target_class: &str,
        name_key: &str,
        caller_class: &str,
        loc_key: &str,
    ) -> bool {
        if self.auto_boundary && self.in_module(caller_class) && !self.in_module(target_class) {
            return true;
        }
        self.call_rules[call_index(kind)].witness(name_key, loc_key)
    }

    pub(crate) fn witness_constructor(
        &self,
        kind: ConstructKind,
        class_name: &str,
        loc_key: &str,
    ) -> bool {
        self.constructor_rules[construct_index(kind)].witness(class_name, loc_key)
    }

    pub(crate) fn witness_method(&self, kind: MethodKind, method_key: &str, loc_key: &str) -> bool {
        self.method_rules[method_index(kind)].witness(method_key, loc_key)
    }

    pub(crate) fn witness_monitor(&self, kind: MonitorKind, loc_key: &str) -> bool {
        self.monitor_rules[monitor_index(kind)].witness(loc_key, loc_key)
    }

    pub(crate) fn witness_static_init(&self, class_name: &str) -> bool {
        self.static_init_rules
            .witness(class_name, &format!("{class_name}.<clinit>.()V"))
    }

    /// Throwable queries widen over included ancestors assignable from the
    /// queried class.
    pub(crate) fn witness_throwable(
        &self,
        kind: ThrowableKind,
        class_name: &str,
        loc_key: &str,
        hierarchy: &dyn ClassHierarchy,
    ) -> Result<bool> {
        let map = &self.throwable_rules[throwable_index(kind)];
        let mut best = map.lookup(class_name, loc_key);
        for ancestor in &self.throwable_inc_subclass[throwable_index(kind)] {
            if ancestor == class_name {
                continue;
            }
            if !hierarchy.is_subclass(class_name, ancestor)? {
                continue;
            }
            if let Some(conditions) = map.get(ancestor) {
                let cond = conditions.check(loc_key);
                if cond.rank >= best.rank {
                    best = cond;
                }
            }
        }
        Ok(best.inclusion)
    }

    /// Runtime heuristic: which accesses of a field can be witnessed at all.
    /// Over-reports when rules carry location conditions.
    pub(crate) fn witness_field_access(&self, field_key: &str, is_static: bool) -> u8 {
        let (read_kind, write_kind) = if is_static {
            (FieldKind::GetStatic, FieldKind::PutStatic)
        } else {
            (FieldKind::GetField, FieldKind::PutField)
        };
        let mut mask = 0;
        if self.field_rules[field_index(read_kind)].any_inclusion_for(field_key) {
            mask |= WITNESS_READ;
        }
        if self.field_rules[field_index(write_kind)].any_inclusion_for(field_key) {
            mask |= WITNESS_WRITE;
        }
        mask
    }

    pub(crate) fn resolve_array_bounds(
        &self,
        action: ArrayAction,
        static_element_type: &str,
        loc_key: &str,
    ) -> Vec<ArrayElementBounds> {
        self.array_elem_conditions[array_index(action)].resolve(
            static_element_type,
            loc_key,
            self.globals.as_ref(),
        )
    }

    pub(crate) fn witnesses_any_monitor(&self) -> bool {
        self.monitor_rules.iter().any(RuleMap::any_inclusions)
    }

    pub(crate) fn witnesses_any_array(&self, action: ArrayAction) -> bool {
        !self.array_elem_conditions[array_index(action)].is_empty()
            || self
                .globals
                .as_ref()
                .map(|g| !g.is_empty())
                .unwrap_or(false)
    }

    pub(crate) fn witnesses_any_catch(&self) -> bool {
        self.throwable_rules[throwable_index(ThrowableKind::Catch)].any_inclusions()
            || !self.throwable_inc_subclass[throwable_index(ThrowableKind::Catch)].is_empty()
    }

    // Adaptive reconfiguration. A `"*"` name targets every module class; the
    // affected keys have their rule state overwritten outright.

    pub(crate) fn add_field_event(&mut self, name: &str, kind: FieldKind) {
        for target in self.adaptive_targets(name) {
            rewrite_root(&mut self.field_rules[field_index(kind)], &target, true);
        }
    }

    pub(crate) fn remove_field_event(&mut self, name: &str, kind: FieldKind) {
        for target in self.adaptive_targets(name) {
            override_subtree(&mut self.field_rules[field_index(kind)], &target, false);
        }
    }

    pub(crate) fn add_method_event(&mut self, name: &str, kind: MethodKind) {
        for target in self.adaptive_targets(name) {
            rewrite_root(&mut self.method_rules[method_index(kind)], &target, true);
        }
    }

    pub(crate) fn remove_method_event(&mut self, name: &str, kind: MethodKind) {
        for target in self.adaptive_targets(name) {
            override_subtree(&mut self.method_rules[method_index(kind)], &target, false);
        }
    }

    pub(crate) fn add_constructor_event(&mut self, name: &str, kind: ConstructKind) {
        for target in self.adaptive_targets(name) {
            rewrite_root(
                &mut self.constructor_rules[construct_index(kind)],
                &target,
                true,
            );
        }
    }

    pub(crate) fn remove_constructor_event(&mut self, name: &str, kind: ConstructKind) {
        for target in self.adaptive_targets(name) {
            override_subtree(
                &mut self.constructor_rules[construct_index(kind)],
                &target,
                false,
            );
        }
    }

    pub(crate) fn add_new_event(&mut self, name: &str) {
        for target in self.adaptive_targets(name) {
            rewrite_root(&mut self.new_rules, &target, true);
        }
    }

    pub(crate) fn remove_new_event(&mut self, name: &str) {
        for target in self.adaptive_targets(name) {
            override_subtree(&mut self.new_rules, &target, false);
        }
    }

    /// Turn off every observable for the targeted classes.
    pub(crate) fn remove_all_events(&mut self, name: &str) {
        let targets = self.adaptive_targets(name);
        let mut maps: Vec<&mut RuleMap> = Vec::new();
        maps.push(&mut self.new_rules);
        maps.extend(self.field_rules.iter_mut());
        maps.extend(self.call_rules.iter_mut());
        maps.extend(self.constructor_rules.iter_mut());
        maps.extend(self.method_rules.iter_mut());
        maps.extend(self.monitor_rules.iter_mut());
        maps.extend(self.throwable_rules.iter_mut());
        maps.push(&mut self.static_init_rules);
        for map in maps {
            for target in &targets {
                override_subtree(map, target, false);
            }
        }
    }

    fn adaptive_targets(&self, name: &str) -> Vec<String> {
        if name == "*" {
            self.module_classes()
                .into_iter()
                .map(str::to_string)
                .collect()
        } else {
            vec![normalize_key(name).to_string()]
        }
    }

    /// Serialize one specification block in suite order.
    pub(crate) fn write_to<W: Write>(&self, out: &mut W) -> Result<()> {
        wire::write_utf(out, &self.key)?;
        write_units(out, &self.system_units)?;
        write_units(out, &self.module_units)?;
        match &self.globals {
            Some(globals) => {
                wire::write_u8(out, 1)?;
                globals.write_to(out)?;
            }
            None => wire::write_u8(out, 0)?,
        }
        self.new_rules.write_to(out)?;
        for map in &self.field_rules {
            map.write_to(out)?;
        }
        for map in &self.call_rules {
            map.write_to(out)?;
        }
        for map in &self.constructor_rules {
            map.write_to(out)?;
        }
        for map in &self.method_rules {
            map.write_to(out)?;
        }
        for map in &self.monitor_rules {
            map.write_to(out)?;
        }
        for map in &self.throwable_rules {
            map.write_to(out)?;
        }
        for set in &self.throwable_inc_subclass {
            wire::write_i32(out, set.len() as i32)?;
            for class in set {
                wire::write_utf(out, class)?;
            }
        }
        self.static_init_rules.write_to(out)?;
        for conditions in &self.array_elem_conditions {
            conditions.write_to(out)?;
        }
        wire::write_i32(out, self.event_properties.len() as i32)?;
        for (key, properties) in &self.event_properties {
            wire::write_utf(out, key)?;
            wire::write_i32(out, properties.len() as i32)?;
            for (name, value) in properties {
                wire::write_utf(out, name)?;
                wire::write_utf(out, value)?;
            }
        }
        Ok(())
    }

    pub(crate) fn read_from<R: Read>(input: &mut R) -> Result<Self> {
        let key = wire::read_utf(input).context("read specification key")?;
        let system_units = read_units(input).context("read system units")?;
        let module_units = read_units(input).context("read module units")?;
        let globals = match wire::read_u8(input)? {
            0 => None,
            1 => Some(GlobalConstraints::read_from(input)?),
            other => anyhow::bail!("bad globals marker {other} in specification {key}"),
        };
        let new_rules = RuleMap::read_from(input).context("read new rules")?;
        let field_rules = read_rule_maps(input, "field rules")?;
        let call_rules = read_rule_maps(input, "call rules")?;
        let constructor_rules = read_rule_maps(input, "constructor rules")?;
        let method_rules = read_rule_maps(input, "method rules")?;
        let monitor_rules = read_rule_maps(input, "monitor rules")?;
        let throwable_rules = read_rule_maps(input, "throwable rules")?;
        let mut throwable_inc_subclass = [BTreeSet::new(), BTreeSet::new()];
        for set in &mut throwable_inc_subclass {
            let count = wire::read_i32(input).context("read throwable include count")?;
            for _ in 0..count {
                set.insert(wire::read_utf(input)?);
            }
        }
        let static_init_rules = RuleMap::read_from(input).context("read static init rules")?;
        let array_elem_conditions = [
            ArrayElementConditions::read_from(input, ArrayAction::Load)
                .context("read array load conditions")?,
            ArrayElementConditions::read_from(input, ArrayAction::Store)
                .context("read array store conditions")?,
        ];
        let property_count = wire::read_i32(input).context("read event property count")?;
        let mut event_properties = BTreeMap::new();
        for _ in 0..property_count {
            let key = wire::read_utf(input)?;
            let entry_count = wire::read_i32(input)?;
            let mut properties = BTreeMap::new();
            for _ in 0..entry_count {
                let name = wire::read_utf(input)?;
                let value = wire::read_utf(input)?;
                properties.insert(name, value);
            }
            event_properties.insert(key, properties);
        }
        Ok(Self {
            key,
            system_units,
            module_units,
            auto_boundary: true,
            new_rules,
            field_rules,
            call_rules,
            constructor_rules,
            method_rules,
            monitor_rules,
            throwable_rules,
            throwable_inc_subclass,
            static_init_rules,
            array_elem_conditions,
            event_properties,
            globals,
        })
    }
}

fn rewrite_root(map: &mut RuleMap, name: &str, inclusion: bool) {
    match map.rules.get_mut(name) {
        Some(conditions) => conditions.clear(ConditionNode::root(inclusion, 1)),
        None => map.insert_simple(name, name, inclusion, 1),
    }
}

/// Full precedence override for `name` and every rule key beneath it.
fn override_subtree(map: &mut RuleMap, name: &str, inclusion: bool) {
    let prefix = format!("{name}.");
    let affected: Vec<String> = map
        .rules
        .keys()
        .filter(|key| key.as_str() == name || key.starts_with(&prefix))
        .cloned()
        .collect();
    for key in affected {
        rewrite_root(map, &key, inclusion);
    }
    if !map.rules.contains_key(name) {
        map.insert_simple(name, name, inclusion, 1);
    }
}

fn field_index(kind: FieldKind) -> usize {
    FieldKind::ALL.iter().position(|k| *k == kind).expect("field kind")
}

fn call_index(kind: CallKind) -> usize {
    CallKind::ALL.iter().position(|k| *k == kind).expect("call kind")
}

fn construct_index(kind: ConstructKind) -> usize {
    ConstructKind::ALL.iter().position(|k| *k == kind).expect("construct kind")
}

fn method_index(kind: MethodKind) -> usize {
    MethodKind::ALL.iter().position(|k| *k == kind).expect("method kind")
}

fn monitor_index(kind: MonitorKind) -> usize {
    MonitorKind::ALL.iter().position(|k| *k == kind).expect("monitor kind")
}

fn throwable_index(kind: ThrowableKind) -> usize {
    ThrowableKind::ALL.iter().position(|k| *k == kind).expect("throwable kind")
}

fn array_index(action: ArrayAction) -> usize {
    ArrayAction::ALL.iter().position(|k| *k == action).expect("array action")
}

fn write_units<W: Write>(out: &mut W, units: &[ProgramUnit]) -> Result<()> {
    wire::write_i32(out, units.len() as i32)?;
    for unit in units {
        unit.write_to(out)?;
    }
    Ok(())
}

fn read_units<R: Read>(input: &mut R) -> Result<Vec<ProgramUnit>> {
    let count = wire::read_i32(input)?;
    let mut units = Vec::new();
    for _ in 0..count {
        units.push(ProgramUnit::read_from(input)?);
    }
    Ok(units)
}

fn read_rule_maps<R: Read, const N: usize>(input: &mut R, what: &str) -> Result<[RuleMap; N]> {
    let mut maps = std::array::from_fn(|_| RuleMap::new());
    for (index, slot) in maps.iter_mut().enumerate() {
        *slot = RuleMap::read_from(input).with_context(|| format!("read {what} table {index}"))?;
    }
    Ok(maps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hierarchy::MapHierarchy;
    use std::io::Cursor;

    fn spec_with_module(classes: &[&str]) -> EventSpecification {
        let mut spec = EventSpecification::new("test");
        let classes: Vec<String> = classes.iter().map(|c| c.to_string()).collect();
        spec.add_system_unit(ProgramUnit::of_classes(classes.clone()));
        spec.add_module_unit(ProgramUnit::of_classes(classes));
        spec
    }

    #[test]
    fn simple_rule_witnesses_by_name_prefix() {
        let mut spec = spec_with_module(&["pkg.A"]);
        spec.field_rules_mut(FieldKind::PutField)
            .insert_simple("pkg.A", "putfield", true, 1);

        assert!(spec.witness_field(FieldKind::PutField, "pkg.A.f.I", "pkg.A.m.()V"));
        assert!(!spec.witness_field(FieldKind::GetField, "pkg.A.f.I", "pkg.A.m.()V"));
        assert!(!spec.witness_field(FieldKind::PutField, "pkg.B.f.I", "pkg.A.m.()V"));
    }

    #[test]
    fn higher_rank_exclusion_beats_wildcard_inclusion() {
        let mut spec = spec_with_module(&["pkg.A"]);
        spec.method_rules_mut(MethodKind::VirtualEnter)
            .insert_simple("pkg.*", "venter", true, 1);
        spec.method_rules_mut(MethodKind::VirtualEnter)
            .insert_simple("pkg.A.m", "venter", false, 5);

        assert!(!spec.witness_method(MethodKind::VirtualEnter, "pkg.A.m", "pkg.A.m.()V"));
        assert!(spec.witness_method(MethodKind::VirtualEnter, "pkg.A.n", "pkg.A.n.()V"));
    }

    #[test]
    fn removing_rule_restores_default_exclude() {
        let mut spec = spec_with_module(&["pkg.A"]);
        spec.new_rules_mut().insert_simple("pkg.A", "new", true, 1);
        assert!(spec.witness_new("pkg.A", "pkg.A.m.()V"));
        spec.new_rules_mut().remove("pkg.A");
        assert!(!spec.witness_new("pkg.A", "pkg.A.m.()V"));
    }

    #[test]
    fn location_condition_restricts_sites() {
        let mut spec = spec_with_module(&["pkg.A", "pkg.B"]);
        let mut conditions = EventConditions::new("new");
        conditions.add("pkg.A", ConditionNode::include(2));
        spec.new_rules_mut().insert("pkg.Widget", conditions);

        assert!(spec.witness_new("pkg.Widget", "pkg.A.m.()V"));
        assert!(!spec.witness_new("pkg.Widget", "pkg.B.m.()V"));
    }

    #[test]
    fn auto_boundary_witnesses_outbound_calls() {
        let mut spec = spec_with_module(&["pkg.A"]);
        assert!(spec.witness_call(
            CallKind::Static,
            "lib.Util",
            "lib.Util.helper.()V",
            "pkg.A",
            "pkg.A.m.()V",
        ));
        spec.set_auto_boundary(false);
        assert!(!spec.witness_call(
            CallKind::Static,
            "lib.Util",
            "lib.Util.helper.()V",
            "pkg.A",
            "pkg.A.m.()V",
        ));
    }

    #[test]
    fn in_module_calls_follow_rules() {
        let mut spec = spec_with_module(&["pkg.A", "pkg.B"]);
        assert!(!spec.witness_call(
            CallKind::Virtual,
            "pkg.B",
            "pkg.B.run.()V",
            "pkg.A",
            "pkg.A.m.()V",
        ));
        spec.call_rules_mut(CallKind::Virtual)
            .insert_simple("pkg.B.run", "vcall", true, 1);
        assert!(spec.witness_call(
            CallKind::Virtual,
            "pkg.B",
            "pkg.B.run.()V",
            "pkg.A",
            "pkg.A.m.()V",
        ));
    }

    #[test]
    fn throwable_subclass_include_widens_query() {
        let mut spec = spec_with_module(&["pkg.A"]);
        spec.throwable_rules_mut(ThrowableKind::Catch)
            .insert_simple("java.lang.Exception", "catch", true, 1);
        spec.add_throwable_subclass_include(ThrowableKind::Catch, "java.lang.Exception");
        let hierarchy = MapHierarchy::new();

        let witnessed = spec
            .witness_throwable(
                ThrowableKind::Catch,
                "java.lang.RuntimeException",
                "pkg.A.m.()V",
                &hierarchy,
            )
            .expect("throwable query");
        assert!(witnessed);

        let unrelated = spec
            .witness_throwable(ThrowableKind::Catch, "java.lang.Class", "pkg.A.m.()V", &hierarchy)
            .expect("throwable query");
        assert!(!unrelated);
    }

    #[test]
    fn field_access_heuristic_over_reports_conditioned_rules() {
        let mut spec = spec_with_module(&["pkg.A"]);
        let mut conditions = EventConditions::new("getfield");
        conditions.add("pkg.Somewhere", ConditionNode::include(3));
        spec.field_rules_mut(FieldKind::GetField)
            .insert("pkg.A.f", conditions);

        let mask = spec.witness_field_access("pkg.A.f.I", false);
        assert_eq!(mask, WITNESS_READ);
    }

    #[test]
    fn field_access_heuristic_reports_both_directions() {
        let mut spec = spec_with_module(&["pkg.A"]);
        spec.field_rules_mut(FieldKind::GetStatic)
            .insert_simple("pkg.A", "getstatic", true, 1);
        spec.field_rules_mut(FieldKind::PutStatic)
            .insert_simple("pkg.A.counter", "putstatic", true, 1);

        let mask = spec.witness_field_access("pkg.A.counter.I", true);
        assert_eq!(mask, WITNESS_READ | WITNESS_WRITE);
    }

    #[test]
    fn adaptive_add_and_remove_field_events() {
        let mut spec = spec_with_module(&["pkg.A", "pkg.B"]);
        spec.add_field_event("*", FieldKind::PutField);
        assert!(spec.witness_field(FieldKind::PutField, "pkg.A.f.I", "pkg.A.m.()V"));
        assert!(spec.witness_field(FieldKind::PutField, "pkg.B.g.J", "pkg.B.m.()V"));

        spec.remove_field_event("pkg.A", FieldKind::PutField);
        assert!(!spec.witness_field(FieldKind::PutField, "pkg.A.f.I", "pkg.A.m.()V"));
        assert!(spec.witness_field(FieldKind::PutField, "pkg.B.g.J", "pkg.B.m.()V"));
    }

    #[test]
    fn adaptive_remove_overrides_deeper_keys() {
        let mut spec = spec_with_module(&["pkg.A"]);
        spec.method_rules_mut(MethodKind::VirtualEnter)
            .insert_simple("pkg.A.m", "venter", true, 9);
        spec.remove_method_event("pkg.A", MethodKind::VirtualEnter);
        assert!(!spec.witness_method(MethodKind::VirtualEnter, "pkg.A.m", "pkg.A.m.()V"));
    }

    #[test]
    fn remove_all_events_silences_module() {
        let mut spec = spec_with_module(&["pkg.A"]);
        spec.new_rules_mut().insert_simple("pkg.A", "new", true, 3);
        spec.monitor_rules_mut(MonitorKind::Acquire)
            .insert_simple("pkg.A", "acquire", true, 3);
        spec.remove_all_events("*");
        assert!(!spec.witness_new("pkg.A", "pkg.A.m.()V"));
        assert!(!spec.witness_monitor(MonitorKind::Acquire, "pkg.A.m.()V"));
    }

    #[test]
    fn event_properties_use_longest_prefix() {
        let mut spec = spec_with_module(&["pkg.A"]);
        spec.set_event_property("pkg", PROP_USE_INTERCEPT, "F");
        spec.set_event_property("pkg.A", PROP_USE_INTERCEPT, "T");

        assert!(spec.use_call_interceptor("pkg.A.m.()V"));
        assert!(!spec.use_call_interceptor("pkg.B.m.()V"));
    }

    #[test]
    fn module_outside_system_is_invalid() {
        let mut spec = EventSpecification::new("bad");
        spec.add_system_unit(ProgramUnit::of_classes(vec!["pkg.A".to_string()]));
        spec.add_module_unit(ProgramUnit::of_classes(vec!["pkg.B".to_string()]));
        assert!(spec.validate().is_err());
    }

    #[test]
    fn specification_block_round_trips() {
        let mut spec = spec_with_module(&["pkg.A", "pkg.B"]);
        spec.new_rules_mut().insert_simple("pkg.A", "new", true, 2);
        spec.field_rules_mut(FieldKind::PutField)
            .insert_simple("pkg.A.f", "putfield", true, 1);
        spec.call_rules_mut(CallKind::Interface)
            .insert_simple("pkg.Iface.run", "icall", true, 4);
        spec.add_throwable_subclass_include(ThrowableKind::Throw, "java.lang.Exception");
        spec.set_event_property("pkg.A", PROP_USE_INTERCEPT, "T");
        let mut globals = GlobalConstraints::new();
        globals
            .add(ArrayElementBounds::new("int", Some(0), Some(3)))
            .expect("add global");
        spec.set_globals(globals);
        spec.array_conditions_mut(ArrayAction::Load)
            .add(
                "int",
                EventConditions::with_tree("array_load", {
                    let mut tree = crate::condtree::ConditionTree::new();
                    tree.clear(ConditionNode::root(true, 1));
                    tree
                }),
                ArrayElementBounds::new("int", Some(2), Some(5)),
            )
            .expect("add array entry");

        let mut buf = Vec::new();
        spec.write_to(&mut buf).expect("serialize specification");
        let restored =
            EventSpecification::read_from(&mut Cursor::new(buf)).expect("deserialize");

        assert_eq!(spec, restored);
        assert!(restored.witness_new("pkg.A", "pkg.A.m.()V"));
        assert!(restored.use_call_interceptor("pkg.A.m.()V"));
    }
}
