#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail};
use fxt::MountOptions;
use fxt_harness::{ScenarioReport, WorkloadConfig, inspect_layout, run_workload, scenario_names};
use std::env;
use std::fs;
use std::path::Path;

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args: Vec<String> = env::args().skip(1).collect();
    let cmd = args.first().map(String::as_str);

    match cmd {
        Some("scenarios") => {
            let report = ScenarioReport::run(args.get(1).map(String::as_str))?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.failed > 0 {
                bail!("{} of {} scenarios failed", report.failed, report.scenarios.len());
            }
            Ok(())
        }
        Some("list") => {
            for name in scenario_names() {
                println!("{name}");
            }
            Ok(())
        }
        Some("workload") => run_workload_cmd(&args[1..]),
        Some("layout") => run_layout_cmd(&args[1..]),
        Some("--help" | "-h" | "help") | None => {
            print_usage();
            Ok(())
        }
        Some(other) => {
            print_usage();
            bail!("unknown command: {other}")
        }
    }
}

fn run_workload_cmd(args: &[String]) -> Result<()> {
    let mut config = WorkloadConfig::default();
    let mut index = 0_usize;
    while index < args.len() {
        match args[index].as_str() {
            "--ops" => {
                let raw = args.get(index + 1).context("--ops requires a value")?;
                config.operations = raw.parse().context("invalid --ops value")?;
                index += 2;
            }
            "--seed" => {
                let raw = args.get(index + 1).context("--seed requires a value")?;
                config.seed = raw.parse().context("invalid --seed value")?;
                index += 2;
            }
            "--commit-every" => {
                let raw = args
                    .get(index + 1)
                    .context("--commit-every requires a value")?;
                config.commit_every = raw.parse().context("invalid --commit-every value")?;
                index += 2;
            }
            "--max-blocks" => {
                let raw = args.get(index + 1).context("--max-blocks requires a value")?;
                config.max_extent_blocks = raw.parse().context("invalid --max-blocks value")?;
                index += 2;
            }
            other => {
                bail!("unknown workload option: {other}");
            }
        }
    }

    let report = run_workload(&config)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if let Some(failure) = &report.failure {
        bail!("workload failed: {failure}");
    }
    Ok(())
}

fn run_layout_cmd(args: &[String]) -> Result<()> {
    let Some(layout_path) = args.first() else {
        bail!("usage: fxt-harness layout <layout.json> [options.json]");
    };
    let layout_path = Path::new(layout_path);
    let layout = fs::read_to_string(layout_path)
        .with_context(|| format!("failed to read {}", layout_path.display()))?;
    let options = match args.get(1) {
        Some(raw) => {
            let path = Path::new(raw);
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_json::from_str::<MountOptions>(&text).context("parse mount options")?
        }
        None => MountOptions::default(),
    };
    let snapshot = inspect_layout(&layout, options)?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

fn print_usage() {
    println!("fxt-harness: extent tree scenarios and randomized workloads");
    println!();
    println!("USAGE:");
    println!("  fxt-harness scenarios [NAME]");
    println!("  fxt-harness list");
    println!("  fxt-harness workload [--ops N] [--seed S] [--commit-every N] [--max-blocks N]");
    println!("  fxt-harness layout <layout.json> [options.json]");
    println!();
    println!("Reports are printed as JSON. The exit status is non-zero when any");
    println!("scenario or model check fails.");
}
