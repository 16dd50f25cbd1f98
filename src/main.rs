mod bounds;
mod builtins;
mod condtree;
mod descriptor;
mod dispatch;
mod events;
mod eventspec;
mod hierarchy;
mod instrument;
mod ir;
mod opcodes;
mod probelog;
mod report;
mod scan;
mod session;
mod suite;
mod telemetry;
mod tracker;
mod wire;

use std::collections::BTreeSet;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use opentelemetry::KeyValue;
use tracing::info;

use crate::eventspec::EventSpecification;
use crate::hierarchy::MapHierarchy;
use crate::instrument::{Instrumentor, remove_probes};
use crate::report::InstrumentationReport;
use crate::scan::scan_inputs;
use crate::session::Session;
use crate::suite::Suite;
use crate::telemetry::{Telemetry, init_logging, with_span};
use crate::tracker::ProbeTracker;

/// CLI arguments for probeweave execution.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "probeweave",
    about = "Semantic event probe instrumentation for JVM class files and JAR files.",
    version
)]
struct Cli {
    #[arg(
        long,
        value_name = "PATH",
        required = true,
        num_args = 1..,
        help = "Input class/JAR/directory paths forming the module."
    )]
    input: Vec<PathBuf>,
    #[arg(
        long,
        value_name = "PATH",
        num_args = 1..,
        help = "Classpath entries completing the system closure."
    )]
    classpath: Vec<PathBuf>,
    #[arg(long, value_name = "DIR", default_value = ".probeweave")]
    out: PathBuf,
    #[arg(
        long,
        value_name = "NAME",
        default_value = "default",
        help = "Built-in specification to compile (see --list-builtins)."
    )]
    builtin: String,
    #[arg(long)]
    list_builtins: bool,
    #[arg(
        long,
        value_name = "PATH",
        help = "Load a compiled suite instead of a built-in specification."
    )]
    suite: Option<PathBuf>,
    #[arg(long, short = 'd', help = "Disable automatic module-boundary call events.")]
    no_auto_boundary: bool,
    #[arg(
        long,
        short = 'm',
        help = "Adaptive re-instrumentation against an existing suite and probe logs."
    )]
    adaptive: bool,
    #[arg(
        long,
        value_name = "ID",
        num_args = 1..,
        value_delimiter = ',',
        help = "Probe ids to remove after instrumentation (adaptive mode)."
    )]
    remove_probes: Vec<u32>,
    #[arg(long, help = "Omit the class-prepare busy-wait patch.")]
    no_prepare_wait: bool,
    #[arg(long, value_name = "PATH")]
    dump_report: Option<PathBuf>,
    #[arg(long, value_name = "URL")]
    otel: Option<String>,
    #[arg(long)]
    quiet: bool,
    #[arg(long)]
    timing: bool,
}

fn main() -> std::process::ExitCode {
    init_logging();
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err:?}");
            std::process::ExitCode::from(1)
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    if cli.list_builtins {
        for builtin in builtins::all_builtins() {
            println!("{}\t{}", builtin.name, builtin.description);
        }
        return Ok(());
    }

    for path in cli.input.iter().chain(cli.classpath.iter()) {
        if !path.exists() {
            anyhow::bail!("input not found: {}", path.display());
        }
    }

    let telemetry = match &cli.otel {
        Some(url) => Some(Arc::new(Telemetry::new(url.clone())?)),
        None => None,
    };
    let started_at = Instant::now();
    let result = with_span(telemetry.as_deref(), "execution", &[], || {
        run_instrument(&cli, telemetry.clone(), started_at)
    });

    if let Some(telemetry) = telemetry {
        if let Err(err) = telemetry.shutdown() {
            eprintln!("telemetry shutdown failed: {err}");
        }
    }
    result
}

fn run_instrument(cli: &Cli, telemetry: Option<Arc<Telemetry>>, started_at: Instant) -> Result<()> {
    let scan_started_at = Instant::now();
    let scan = with_span(
        telemetry.as_deref(),
        "scan",
        &[KeyValue::new("probeweave.phase", "scan")],
        || scan_inputs(&cli.input, &cli.classpath),
    )?;
    let scan_duration_ms = scan_started_at.elapsed().as_millis();

    let mut spec = resolve_specification(cli, &scan)?;
    spec.set_auto_boundary(!cli.no_auto_boundary);
    spec.validate()?;

    let hierarchy = MapHierarchy::from_classes(&scan.classes);
    let mut session = Session::new();
    session.set_prepare_wait(!cli.no_prepare_wait);
    session.set_adaptive(cli.adaptive);
    let mut tracker = ProbeTracker::new();

    let mut classes = scan.classes;
    let instrument_started_at = Instant::now();
    with_span(
        telemetry.as_deref(),
        "instrument",
        &[KeyValue::new("probeweave.phase", "instrument")],
        || -> Result<()> {
            let mut instrumentor = Instrumentor::new(&spec, &hierarchy, &mut session);
            for class in classes.iter_mut() {
                if !scan.input_classes.contains(&class.name) {
                    continue;
                }
                instrumentor
                    .instrument_class(class, &mut tracker)
                    .with_context(|| format!("instrument class {}", class.name))?;
            }
            Ok(())
        },
    )?;
    let instrument_duration_ms = instrument_started_at.elapsed().as_millis();

    let mut class_logs = tracker.take_logs();
    if !cli.remove_probes.is_empty() {
        let remove: BTreeSet<u32> = cli.remove_probes.iter().copied().collect();
        with_span(
            telemetry.as_deref(),
            "remove",
            &[KeyValue::new("probeweave.phase", "remove")],
            || -> Result<()> {
                for (class_name, log) in class_logs.iter_mut() {
                    let Some(class) = classes.iter_mut().find(|c| &c.name == class_name) else {
                        continue;
                    };
                    remove_probes(class, log, &remove, &mut tracker)
                        .with_context(|| format!("remove probes from {class_name}"))?;
                }
                Ok(())
            },
        )?;
    }

    let write_started_at = Instant::now();
    with_span(
        telemetry.as_deref(),
        "write",
        &[KeyValue::new("probeweave.phase", "write")],
        || -> Result<()> {
            fs::create_dir_all(&cli.out).with_context(|| {
                format!("failed to create output directory {}", cli.out.display())
            })?;
            for log in class_logs.values() {
                log.save(&cli.out)?;
            }
            let suite = Suite {
                specifications: vec![spec.clone()],
                strings: session.strings().clone(),
            };
            suite.save(&cli.out.join("probeweave.suite"))?;
            Ok(())
        },
    )?;
    let write_duration_ms = write_started_at.elapsed().as_millis();

    let probe_count: usize = class_logs
        .values()
        .flat_map(|log| log.method_logs.values())
        .map(|method_log| method_log.bytecode_log.len())
        .sum();

    if let Some(path) = &cli.dump_report {
        let report = InstrumentationReport::capture(spec.key(), &class_logs);
        report::write_report(path, &report)?;
    }

    if !cli.quiet {
        info!(
            classes = class_logs.len(),
            probes = probe_count,
            out = %cli.out.display(),
            "instrumentation complete"
        );
    }
    if cli.timing && !cli.quiet {
        eprintln!(
            "timing: total_ms={} scan_ms={} instrument_ms={} write_ms={} (classes={} artifacts={} probes={})",
            started_at.elapsed().as_millis(),
            scan_duration_ms,
            instrument_duration_ms,
            write_duration_ms,
            scan.class_count,
            scan.artifact_count,
            probe_count
        );
    }
    Ok(())
}

fn resolve_specification(cli: &Cli, scan: &scan::ScanOutput) -> Result<EventSpecification> {
    if let Some(suite_path) = &cli.suite {
        let suite = Suite::load(suite_path)?;
        let spec = suite
            .specifications
            .into_iter()
            .next()
            .context("suite file contains no specification")?;
        return Ok(spec);
    }
    if cli.adaptive {
        anyhow::bail!("adaptive mode requires --suite pointing at a compiled suite");
    }
    let builtin = builtins::builtin(&cli.builtin)
        .with_context(|| format!("unknown built-in specification {:?}", cli.builtin))?;
    let system: BTreeSet<String> = scan.classes.iter().map(|c| c.name.clone()).collect();
    Ok((builtin.build)(&scan.input_classes, &system))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::classfile_builder::{ClassFileBuilder, high, low};

    fn sample_class() -> Vec<u8> {
        let mut builder = ClassFileBuilder::new("pkg/Main", "java/lang/Object");
        let object_init = builder.add_method_ref("java/lang/Object", "<init>", "()V");
        let init_code = vec![0x2a, 0xb7, high(object_init), low(object_init), 0xb1];
        builder.add_method(0x0001, "<init>", "()V", init_code, 1, 1);
        builder.add_method(0x0009, "main", "([Ljava/lang/String;)V", vec![0xb1], 0, 1);
        builder.finish()
    }

    fn cli_for(input: PathBuf, out: PathBuf) -> Cli {
        Cli {
            input: vec![input],
            classpath: Vec::new(),
            out,
            builtin: "default".to_string(),
            list_builtins: false,
            suite: None,
            no_auto_boundary: false,
            adaptive: false,
            remove_probes: Vec::new(),
            no_prepare_wait: false,
            dump_report: None,
            otel: None,
            quiet: true,
            timing: false,
        }
    }

    #[test]
    fn run_produces_probe_logs_suite_and_report() {
        let dir = tempfile::tempdir().expect("run temp dir");
        let class_path = dir.path().join("Main.class");
        fs::write(&class_path, sample_class()).expect("write class");
        let out = dir.path().join("out");
        let report_path = dir.path().join("report.json");

        let mut cli = cli_for(class_path, out.clone());
        cli.dump_report = Some(report_path.clone());
        run_instrument(&cli, None, Instant::now()).expect("instrument run");

        assert!(out.join("pkg.Main.probes.dat").exists());
        assert!(out.join("probeweave.suite").exists());
        let report = report::load_report(&report_path)
            .expect("load report")
            .expect("report present");
        assert!(report.entry_count() > 0);

        let suite = Suite::load(&out.join("probeweave.suite")).expect("load suite");
        assert_eq!(suite.specifications.len(), 1);
        assert_eq!(suite.specifications[0].key(), "default");
    }

    #[test]
    fn run_rejects_missing_input() {
        let dir = tempfile::tempdir().expect("run temp dir");
        let cli = cli_for(dir.path().join("missing.class"), dir.path().join("out"));
        assert!(run(cli).is_err());
    }

    #[test]
    fn unknown_builtin_is_an_error() {
        let dir = tempfile::tempdir().expect("run temp dir");
        let class_path = dir.path().join("Main.class");
        fs::write(&class_path, sample_class()).expect("write class");
        let mut cli = cli_for(class_path, dir.path().join("out"));
        cli.builtin = "nope".to_string();
        assert!(run_instrument(&cli, None, Instant::now()).is_err());
    }

    #[test]
    fn adaptive_mode_requires_a_suite() {
        let dir = tempfile::tempdir().expect("run temp dir");
        let class_path = dir.path().join("Main.class");
        fs::write(&class_path, sample_class()).expect("write class");
        let mut cli = cli_for(class_path, dir.path().join("out"));
        cli.adaptive = true;
        assert!(run_instrument(&cli, None, Instant::now()).is_err());
    }
}
