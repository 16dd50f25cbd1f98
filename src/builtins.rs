//! Built-in event specifications selectable from the command line.

use std::collections::BTreeSet;

use crate::events::{ConstructKind, FieldKind, MethodKind, MonitorKind, ThrowableKind};
use crate::eventspec::{EventSpecification, ProgramUnit};

/// Factory for a named built-in specification.
pub(crate) struct BuiltinSpec {
    pub(crate) name: &'static str,
    pub(crate) description: &'static str,
    pub(crate) build: fn(&BTreeSet<String>, &BTreeSet<String>) -> EventSpecification,
}

inventory::collect!(BuiltinSpec);

/// Macro to register a built-in specification.
///
/// Usage: `register_builtin!("name", "description", build_fn);`
#[macro_export]
macro_rules! register_builtin {
    ($name:expr, $description:expr, $build:expr) => {
        inventory::submit! {
            $crate::builtins::BuiltinSpec {
                name: $name,
                description: $description,
                build: $build,
            }
        }
    };
}

pub(crate) fn builtin(name: &str) -> Option<&'static BuiltinSpec> {
    inventory::iter::<BuiltinSpec>
        .into_iter()
        .find(|spec| spec.name == name)
}

pub(crate) fn all_builtins() -> Vec<&'static BuiltinSpec> {
    let mut builtins: Vec<_> = inventory::iter::<BuiltinSpec>.into_iter().collect();
    builtins.sort_by_key(|spec| spec.name);
    builtins
}

fn base_spec(
    name: &str,
    module_classes: &BTreeSet<String>,
    system_classes: &BTreeSet<String>,
) -> EventSpecification {
    let mut spec = EventSpecification::new(name);
    spec.add_system_unit(ProgramUnit::of_classes(system_classes.iter().cloned()));
    spec.add_module_unit(ProgramUnit::of_classes(module_classes.iter().cloned()));
    spec
}

/// Method and constructor boundaries of every module class, plus automatic
/// module-boundary calls.
fn build_default(
    module_classes: &BTreeSet<String>,
    system_classes: &BTreeSet<String>,
) -> EventSpecification {
    let mut spec = base_spec("default", module_classes, system_classes);
    for class in module_classes {
        for kind in MethodKind::ALL {
            spec.method_rules_mut(kind)
                .insert_simple(class, "method", true, 1);
        }
        for kind in ConstructKind::ALL {
            spec.constructor_rules_mut(kind)
                .insert_simple(class, "constructor", true, 1);
        }
        spec.new_rules_mut().insert_simple(class, "new", true, 1);
        spec.static_init_rules_mut()
            .insert_simple(class, "static_init", true, 1);
    }
    spec
}

/// Shared-state observables: monitor transitions, field reads and writes,
/// and throwable flow across every module class.
fn build_atom(
    module_classes: &BTreeSet<String>,
    system_classes: &BTreeSet<String>,
) -> EventSpecification {
    let mut spec = base_spec("atom", module_classes, system_classes);
    for class in module_classes {
        for kind in MonitorKind::ALL {
            spec.monitor_rules_mut(kind)
                .insert_simple(class, "monitor", true, 1);
        }
        for kind in FieldKind::ALL {
            spec.field_rules_mut(kind)
                .insert_simple(class, "field", true, 1);
        }
        for kind in ThrowableKind::ALL {
            spec.throwable_rules_mut(kind)
                .insert_simple("java.lang.Throwable", "throwable", true, 1);
        }
        for kind in MethodKind::ALL {
            spec.method_rules_mut(kind)
                .insert_simple(class, "method", true, 1);
        }
    }
    spec.add_throwable_subclass_include(ThrowableKind::Throw, "java.lang.Throwable");
    spec.add_throwable_subclass_include(ThrowableKind::Catch, "java.lang.Throwable");
    spec
}

register_builtin!(
    "default",
    "Method, constructor, and allocation events over the module",
    build_default
);
register_builtin!(
    "atom",
    "Monitor, field, and throwable events for shared-state analysis",
    build_atom
);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{CallKind, MonitorKind};

    fn classes(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn both_builtins_are_registered() {
        let names: Vec<&str> = all_builtins().iter().map(|b| b.name).collect();
        assert_eq!(names, vec!["atom", "default"]);
        assert!(builtin("default").is_some());
        assert!(builtin("atom").is_some());
        assert!(builtin("missing").is_none());
    }

    #[test]
    fn default_builtin_witnesses_module_method_boundaries() {
        let module = classes(&["pkg.A"]);
        let system = classes(&["pkg.A", "lib.Util"]);
        let spec = (builtin("default").expect("default").build)(&module, &system);

        assert!(spec.witness_method(
            crate::events::MethodKind::VirtualEnter,
            "pkg.A.m",
            "pkg.A.m.()V"
        ));
        assert!(!spec.witness_method(
            crate::events::MethodKind::VirtualEnter,
            "lib.Util.m",
            "lib.Util.m.()V"
        ));
        // Outbound calls come from the module-boundary default.
        assert!(spec.witness_call(
            CallKind::Static,
            "lib.Util",
            "lib.Util.helper.()V",
            "pkg.A",
            "pkg.A.m.()V"
        ));
    }

    #[test]
    fn atom_builtin_witnesses_monitors_and_fields() {
        let module = classes(&["pkg.A"]);
        let spec = (builtin("atom").expect("atom").build)(&module, &module);

        assert!(spec.witness_monitor(MonitorKind::Acquire, "pkg.A.m.()V"));
        assert!(spec.witness_field(
            crate::events::FieldKind::PutField,
            "pkg.A.f.I",
            "pkg.A.m.()V"
        ));
        assert!(spec.witnesses_any_monitor());
        assert!(spec.witnesses_any_catch());
    }
}
