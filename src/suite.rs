//! The EDL suite file: compiled specifications plus the shared string
//! table, written by the instrumentor and read back by the dispatcher.

#![allow(dead_code)]

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use anyhow::{Context, Result};

use crate::eventspec::EventSpecification;
use crate::session::StringTable;
use crate::wire;

const MAGIC: u32 = 0x4544_4c53;
const VERSION: u16 = 1;

/// In-memory form of a suite file.
#[derive(Clone, Debug, Default, PartialEq)]
pub(crate) struct Suite {
    pub(crate) specifications: Vec<EventSpecification>,
    pub(crate) strings: StringTable,
}

impl Suite {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn specification(&self, key: &str) -> Option<&EventSpecification> {
        self.specifications.iter().find(|spec| spec.key() == key)
    }

    pub(crate) fn save(&self, path: &Path) -> Result<()> {
        let file = File::create(path)
            .with_context(|| format!("failed to create suite file {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        self.write_to(&mut writer)
            .with_context(|| format!("failed to write suite file {}", path.display()))?;
        writer
            .flush()
            .with_context(|| format!("failed to flush suite file {}", path.display()))?;
        Ok(())
    }

    pub(crate) fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("failed to open suite file {}", path.display()))?;
        let mut reader = BufReader::new(file);
        Self::read_from(&mut reader)
            .with_context(|| format!("bad suite file {}", path.display()))
    }

    pub(crate) fn write_to<W: Write>(&self, out: &mut W) -> Result<()> {
        wire::write_u32(out, MAGIC)?;
        wire::write_u16(out, VERSION)?;
        wire::write_i32(out, self.specifications.len() as i32)?;
        for spec in &self.specifications {
            spec.write_to(out)
                .with_context(|| format!("write specification {}", spec.key()))?;
        }
        self.strings.write_to(out)
    }

    pub(crate) fn read_from<R: Read>(input: &mut R) -> Result<Self> {
        let magic = wire::read_u32(input).context("read suite header")?;
        if magic != MAGIC {
            anyhow::bail!("not a suite file (magic {magic:#010x})");
        }
        let version = wire::read_u16(input)?;
        if version != VERSION {
            anyhow::bail!("unsupported suite version {version}");
        }
        let count = wire::read_i32(input).context("read specification count")?;
        let mut specifications = Vec::new();
        for index in 0..count {
            let spec = EventSpecification::read_from(input)
                .with_context(|| format!("read specification block {index}"))?;
            spec.validate()?;
            specifications.push(spec);
        }
        let strings = StringTable::read_from(input)?;
        Ok(Self {
            specifications,
            strings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::FieldKind;
    use crate::eventspec::ProgramUnit;

    fn sample_suite() -> Suite {
        let mut spec = EventSpecification::new("demo");
        spec.add_system_unit(ProgramUnit::of_classes(vec![
            "pkg.A".to_string(),
            "pkg.B".to_string(),
        ]));
        spec.add_module_unit(ProgramUnit::of_classes(vec!["pkg.A".to_string()]));
        spec.field_rules_mut(FieldKind::PutField)
            .insert_simple("pkg.A.f", "putfield", true, 1);
        let mut strings = StringTable::new();
        strings.add("pkg.A#f#I").expect("intern payload");
        Suite {
            specifications: vec![spec],
            strings,
        }
    }

    #[test]
    fn suite_round_trips_through_file() {
        let dir = tempfile::tempdir().expect("suite temp dir");
        let path = dir.path().join("demo.suite");
        let suite = sample_suite();

        suite.save(&path).expect("save suite");
        let loaded = Suite::load(&path).expect("load suite");

        assert_eq!(suite, loaded);
        let spec = loaded.specification("demo").expect("spec present");
        assert!(spec.witness_field(FieldKind::PutField, "pkg.A.f.I", "pkg.A.m.()V"));
        assert_eq!(loaded.strings.get(0), Some("pkg.A#f#I"));
    }

    #[test]
    fn garbage_file_is_rejected_with_its_path() {
        let dir = tempfile::tempdir().expect("suite temp dir");
        let path = dir.path().join("broken.suite");
        std::fs::write(&path, b"not a suite").expect("write garbage");

        let err = Suite::load(&path).expect_err("garbage must fail");
        assert!(format!("{err:#}").contains("broken.suite"));
    }

    #[test]
    fn invalid_module_subset_fails_load() {
        let mut spec = EventSpecification::new("bad");
        spec.add_system_unit(ProgramUnit::of_classes(vec!["pkg.A".to_string()]));
        spec.add_module_unit(ProgramUnit::of_classes(vec!["pkg.Z".to_string()]));
        let suite = Suite {
            specifications: vec![spec],
            strings: StringTable::new(),
        };
        let mut buf = Vec::new();
        suite.write_to(&mut buf).expect("serialize");
        assert!(Suite::read_from(&mut std::io::Cursor::new(buf)).is_err());
    }
}
