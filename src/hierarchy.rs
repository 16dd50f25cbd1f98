#![allow(dead_code)]

use std::collections::BTreeMap;

use anyhow::Result;

use crate::ir::Class;

/// Class hierarchy oracle consulted by throwable witness queries and by the
/// instrumentor's super-constructor detection.
pub(crate) trait ClassHierarchy {
    /// Whether `child` is `ancestor` or a transitive subtype of it.
    fn is_subclass(&self, child: &str, ancestor: &str) -> Result<bool>;

    fn is_interface(&self, class: &str) -> Result<bool>;

    fn superclass(&self, class: &str) -> Result<Option<String>>;
}

#[derive(Clone, Debug)]
struct HierarchyEntry {
    super_name: Option<String>,
    interfaces: Vec<String>,
    is_interface: bool,
}

/// In-memory oracle built from scanned classes.
///
/// Platform roots the target never ships (`java.lang.Object`,
/// `java.lang.Throwable` and friends) are seeded so subtype walks terminate;
/// any other unknown class is an incomplete-classpath error.
#[derive(Clone, Debug, Default)]
pub(crate) struct MapHierarchy {
    entries: BTreeMap<String, HierarchyEntry>,
}

const PLATFORM_ROOTS: [(&str, Option<&str>); 6] = [
    ("java.lang.Object", None),
    ("java.lang.Throwable", Some("java.lang.Object")),
    ("java.lang.Exception", Some("java.lang.Throwable")),
    ("java.lang.RuntimeException", Some("java.lang.Exception")),
    ("java.lang.Error", Some("java.lang.Throwable")),
    ("java.lang.Class", Some("java.lang.Object")),
];

impl MapHierarchy {
    pub(crate) fn new() -> Self {
        let mut hierarchy = Self::default();
        for (name, super_name) in PLATFORM_ROOTS {
            hierarchy.insert(name, super_name.map(str::to_string), Vec::new(), false);
        }
        hierarchy
    }

    pub(crate) fn from_classes(classes: &[Class]) -> Self {
        let mut hierarchy = Self::new();
        for class in classes {
            hierarchy.insert(
                &class.name,
                class.super_name.clone(),
                class.interfaces.clone(),
                class.is_interface,
            );
        }
        hierarchy
    }

    pub(crate) fn insert(
        &mut self,
        name: &str,
        super_name: Option<String>,
        interfaces: Vec<String>,
        is_interface: bool,
    ) {
        self.entries.insert(
            name.to_string(),
            HierarchyEntry {
                super_name,
                interfaces,
                is_interface,
            },
        );
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    fn entry(&self, name: &str) -> Result<&HierarchyEntry> {
        self.entries
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("class not on classpath: {name} (incomplete classpath)"))
    }
}

impl ClassHierarchy for MapHierarchy {
    fn is_subclass(&self, child: &str, ancestor: &str) -> Result<bool> {
        if child == ancestor {
            return Ok(true);
        }
        let mut current = child.to_string();
        loop {
            let entry = self.entry(&current)?;
            for iface in &entry.interfaces {
                if iface == ancestor || self.is_subclass(iface, ancestor)? {
                    return Ok(true);
                }
            }
            match &entry.super_name {
                Some(super_name) if super_name == ancestor => return Ok(true),
                Some(super_name) => current = super_name.clone(),
                None => return Ok(false),
            }
        }
    }

    fn is_interface(&self, class: &str) -> Result<bool> {
        Ok(self.entry(class)?.is_interface)
    }

    fn superclass(&self, class: &str) -> Result<Option<String>> {
        Ok(self.entry(class)?.super_name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MapHierarchy {
        let mut hierarchy = MapHierarchy::new();
        hierarchy.insert(
            "pkg.Base",
            Some("java.lang.Object".to_string()),
            vec!["pkg.Marker".to_string()],
            false,
        );
        hierarchy.insert("pkg.Marker", Some("java.lang.Object".to_string()), Vec::new(), true);
        hierarchy.insert("pkg.Derived", Some("pkg.Base".to_string()), Vec::new(), false);
        hierarchy.insert(
            "pkg.AppError",
            Some("java.lang.RuntimeException".to_string()),
            Vec::new(),
            false,
        );
        hierarchy
    }

    #[test]
    fn subclass_walk_covers_supers_and_interfaces() {
        let hierarchy = sample();
        assert!(hierarchy.is_subclass("pkg.Derived", "pkg.Base").expect("walk"));
        assert!(hierarchy.is_subclass("pkg.Derived", "pkg.Marker").expect("walk"));
        assert!(
            hierarchy
                .is_subclass("pkg.Derived", "java.lang.Object")
                .expect("walk")
        );
        assert!(!hierarchy.is_subclass("pkg.Base", "pkg.Derived").expect("walk"));
    }

    #[test]
    fn throwable_chain_is_seeded() {
        let hierarchy = sample();
        assert!(
            hierarchy
                .is_subclass("pkg.AppError", "java.lang.Throwable")
                .expect("walk")
        );
    }

    #[test]
    fn unknown_class_is_incomplete_classpath() {
        let hierarchy = sample();
        let err = hierarchy
            .is_subclass("pkg.Missing", "java.lang.Object")
            .expect_err("unknown class");
        assert!(format!("{err:#}").contains("incomplete classpath"));
    }

    #[test]
    fn interface_flag_is_reported() {
        let hierarchy = sample();
        assert!(hierarchy.is_interface("pkg.Marker").expect("marker"));
        assert!(!hierarchy.is_interface("pkg.Base").expect("base"));
    }
}
