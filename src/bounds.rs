#![allow(dead_code)]

use std::collections::BTreeMap;
use std::io::{Read, Write};

use anyhow::{Context, Result};

use crate::condtree::EventConditions;
use crate::events::ArrayAction;
use crate::wire;

/// Wildcard element type matching any array component.
pub(crate) const ANY_TYPE: &str = "*";

/// Fully-qualified name of the polymorphic reference element type.
pub(crate) const OBJECT_TYPE: &str = "java.lang.Object";

const PRIMITIVES: [&str; 8] = [
    "int", "long", "float", "double", "byte", "char", "short", "boolean",
];

pub(crate) fn is_primitive_type(element_type: &str) -> bool {
    PRIMITIVES.contains(&element_type)
}

pub(crate) fn is_reference_type(element_type: &str) -> bool {
    element_type != ANY_TYPE && !is_primitive_type(element_type)
}

/// Index interval attached to one element type.
///
/// `min > max` denotes the two tails `0..=max` and `min..`. A missing bound
/// leaves that side unbounded.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct ArrayElementBounds {
    pub(crate) element_type: String,
    pub(crate) min: Option<i32>,
    pub(crate) max: Option<i32>,
}

impl ArrayElementBounds {
    pub(crate) fn new(element_type: impl Into<String>, min: Option<i32>, max: Option<i32>) -> Self {
        Self {
            element_type: element_type.into(),
            min,
            max,
        }
    }

    pub(crate) fn unbounded(element_type: impl Into<String>) -> Self {
        Self::new(element_type, None, None)
    }

    /// Overlay a suite-wide default onto this site-specific interval.
    ///
    /// Constraining only: a set bound is narrowed, never widened; an unset
    /// bound adopts the global unless that would invert the interval.
    pub(crate) fn merge_global(&mut self, global: &ArrayElementBounds) {
        match (self.min, global.min) {
            (Some(mine), Some(other)) => {
                if other > mine {
                    self.min = Some(other);
                }
            }
            (None, Some(other)) => {
                let inverts = self.max.map(|max| other > max).unwrap_or(false);
                if !inverts {
                    self.min = Some(other);
                }
            }
            _ => {}
        }
        match (self.max, global.max) {
            (Some(mine), Some(other)) => {
                if other < mine {
                    self.max = Some(other);
                }
            }
            (None, Some(other)) => {
                let inverts = self.min.map(|min| other < min).unwrap_or(false);
                if !inverts {
                    self.max = Some(other);
                }
            }
            _ => {}
        }
    }

    /// Whether `index` falls inside the witnessed range.
    pub(crate) fn contains(&self, index: i32) -> bool {
        match (self.min, self.max) {
            (Some(min), Some(max)) if min > max => index <= max || index >= min,
            (min, max) => {
                min.map(|m| index >= m).unwrap_or(true) && max.map(|m| index <= m).unwrap_or(true)
            }
        }
    }

    pub(crate) fn write_to<W: Write>(&self, out: &mut W) -> Result<()> {
        wire::write_utf(out, &self.element_type)?;
        write_bound(out, self.min)?;
        write_bound(out, self.max)
    }

    pub(crate) fn read_from<R: Read>(input: &mut R) -> Result<Self> {
        let element_type = wire::read_utf(input)?;
        let min = read_bound(input)?;
        let max = read_bound(input)?;
        Ok(Self {
            element_type,
            min,
            max,
        })
    }
}

fn write_bound<W: Write>(out: &mut W, bound: Option<i32>) -> Result<()> {
    match bound {
        Some(value) => {
            wire::write_bool(out, true)?;
            wire::write_i32(out, value)
        }
        None => wire::write_bool(out, false),
    }
}

fn read_bound<R: Read>(input: &mut R) -> Result<Option<i32>> {
    if wire::read_bool(input)? {
        Ok(Some(wire::read_i32(input)?))
    } else {
        Ok(None)
    }
}

/// Suite-wide default bounds shared across specifications.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct GlobalConstraints {
    bounds: BTreeMap<String, ArrayElementBounds>,
}

impl GlobalConstraints {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&mut self, bounds: ArrayElementBounds) -> Result<()> {
        if self.bounds.contains_key(&bounds.element_type) {
            anyhow::bail!(
                "unsupported: duplicate global array element bounds for type {}",
                bounds.element_type
            );
        }
        self.bounds.insert(bounds.element_type.clone(), bounds);
        Ok(())
    }

    pub(crate) fn get(&self, element_type: &str) -> Option<&ArrayElementBounds> {
        self.bounds.get(element_type)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &ArrayElementBounds> {
        self.bounds.values()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.bounds.is_empty()
    }

    pub(crate) fn write_to<W: Write>(&self, out: &mut W) -> Result<()> {
        wire::write_i32(out, self.bounds.len() as i32)?;
        for bounds in self.bounds.values() {
            bounds.write_to(out)?;
        }
        Ok(())
    }

    pub(crate) fn read_from<R: Read>(input: &mut R) -> Result<Self> {
        let count = wire::read_i32(input).context("read global constraint count")?;
        let mut globals = Self::new();
        for _ in 0..count {
            let bounds = ArrayElementBounds::read_from(input)?;
            globals.bounds.insert(bounds.element_type.clone(), bounds);
        }
        Ok(globals)
    }
}

/// Per-type rule entry for one array action.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ArrayElementEntry {
    pub(crate) conditions: EventConditions,
    pub(crate) bounds: ArrayElementBounds,
}

/// Per-action mapping from element type to conditions and index bounds.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ArrayElementConditions {
    action: ArrayAction,
    entries: BTreeMap<String, ArrayElementEntry>,
}

impl ArrayElementConditions {
    pub(crate) fn new(action: ArrayAction) -> Self {
        Self {
            action,
            entries: BTreeMap::new(),
        }
    }

    pub(crate) fn action(&self) -> ArrayAction {
        self.action
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn entry(&self, element_type: &str) -> Option<&ArrayElementEntry> {
        self.entries.get(element_type)
    }

    /// Register a rule for one element type; a second request for the same
    /// type is refused.
    pub(crate) fn add(
        &mut self,
        element_type: &str,
        conditions: EventConditions,
        bounds: ArrayElementBounds,
    ) -> Result<()> {
        if self.entries.contains_key(element_type) {
            anyhow::bail!(
                "unsupported: duplicate array element request for type {element_type}"
            );
        }
        self.entries.insert(
            element_type.to_string(),
            ArrayElementEntry { conditions, bounds },
        );
        Ok(())
    }

    /// Resolve the index ranges to witness at one array instruction.
    ///
    /// `static_element_type` is the instruction's static component type;
    /// `aaload`/`aastore` sites resolve through the polymorphic
    /// [`OBJECT_TYPE`] path.
    pub(crate) fn resolve(
        &self,
        static_element_type: &str,
        loc_key: &str,
        globals: Option<&GlobalConstraints>,
    ) -> Vec<ArrayElementBounds> {
        if static_element_type == OBJECT_TYPE {
            self.resolve_object(loc_key, globals)
        } else {
            self.resolve_concrete(static_element_type, loc_key, globals)
        }
    }

    fn resolve_object(
        &self,
        loc_key: &str,
        globals: Option<&GlobalConstraints>,
    ) -> Vec<ArrayElementBounds> {
        let mut resolved = Vec::new();
        if let Some(wildcard) = self.entries.get(ANY_TYPE) {
            if !wildcard.conditions.check(loc_key).inclusion {
                return resolved;
            }
            resolved.push(wildcard.bounds.clone());
            if let Some(globals) = globals {
                for global in globals.iter() {
                    if global.element_type != ANY_TYPE && !is_reference_type(&global.element_type) {
                        continue;
                    }
                    let mut copy = wildcard.bounds.clone();
                    copy.element_type = global.element_type.clone();
                    copy.merge_global(global);
                    resolved.push(copy);
                }
            }
            return resolved;
        }

        let mut consumed = Vec::new();
        for (element_type, entry) in &self.entries {
            if element_type != ANY_TYPE && !is_reference_type(element_type) {
                continue;
            }
            if !entry.conditions.check(loc_key).inclusion {
                continue;
            }
            let mut bounds = entry.bounds.clone();
            if let Some(global) = globals.and_then(|g| {
                g.get(element_type)
                    .or_else(|| g.get(ANY_TYPE))
            }) {
                bounds.merge_global(global);
                consumed.push(global.element_type.clone());
            }
            resolved.push(bounds);
        }

        // Remaining globals surface only under a specification wildcard,
        // which is absent on this branch.
        let _ = consumed;
        resolved
    }

    fn resolve_concrete(
        &self,
        static_element_type: &str,
        loc_key: &str,
        globals: Option<&GlobalConstraints>,
    ) -> Vec<ArrayElementBounds> {
        let entry = self
            .entries
            .get(static_element_type)
            .or_else(|| self.entries.get(ANY_TYPE));
        let Some(entry) = entry else {
            return Vec::new();
        };
        if !entry.conditions.check(loc_key).inclusion {
            return Vec::new();
        }
        let mut bounds = entry.bounds.clone();
        bounds.element_type = static_element_type.to_string();
        if let Some(global) = globals.and_then(|g| {
            g.get(static_element_type)
                .or_else(|| g.get(ANY_TYPE))
        }) {
            bounds.merge_global(global);
        }
        vec![bounds]
    }

    pub(crate) fn write_to<W: Write>(&self, out: &mut W) -> Result<()> {
        wire::write_i32(out, self.entries.len() as i32)?;
        for (element_type, entry) in &self.entries {
            wire::write_utf(out, element_type)?;
            entry.conditions.write_to(out)?;
            entry.bounds.write_to(out)?;
        }
        Ok(())
    }

    pub(crate) fn read_from<R: Read>(input: &mut R, action: ArrayAction) -> Result<Self> {
        let count = wire::read_i32(input).context("read array element entry count")?;
        let mut conditions = Self::new(action);
        for _ in 0..count {
            let element_type = wire::read_utf(input)?;
            let event_conditions = EventConditions::read_from(input)?;
            let bounds = ArrayElementBounds::read_from(input)?;
            conditions.entries.insert(
                element_type,
                ArrayElementEntry {
                    conditions: event_conditions,
                    bounds,
                },
            );
        }
        Ok(conditions)
    }
}
