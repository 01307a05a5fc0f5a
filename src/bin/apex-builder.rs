use std::path::Path;

use anyhow::{bail, Context, Result};
use apex_builder::action::executor::LocalExecutor;
use apex_builder::action::ActionGraph;
use apex_builder::config::{load_build_input, BuildInput};
use apex_builder::pipeline::{ApexBuilder, BuildOutcome};
use apex_builder::preflight::check_host_tools;
use apex_builder::registry::ModuleRegistry;
use apex_builder::runs::{RunLog, RunRecord, RunStatus};
use tracing_subscriber::EnvFilter;

const DEFAULT_PLAN_OUT_DIR: &str = "out";
const RUNS_TO_KEEP: usize = 5;

fn usage() -> &'static str {
    "Usage:\n  apex-builder plan <config.toml> [out_dir]\n  apex-builder build <config.toml> <out_dir>\n  apex-builder check-tools <config.toml>\n  apex-builder runs <config.toml> <out_dir>"
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();

    match args.as_slice() {
        [cmd, config] if cmd == "plan" => plan(Path::new(config), Path::new(DEFAULT_PLAN_OUT_DIR)),
        [cmd, config, out_dir] if cmd == "plan" => plan(Path::new(config), Path::new(out_dir)),
        [cmd, config, out_dir] if cmd == "build" => build(Path::new(config), Path::new(out_dir)),
        [cmd, config] if cmd == "check-tools" => check_tools(Path::new(config)),
        [cmd, config, out_dir] if cmd == "runs" => list_runs(Path::new(config), Path::new(out_dir)),
        _ => bail!(usage()),
    }
}

fn load(config: &Path) -> Result<BuildInput> {
    let mut input = load_build_input(config)?;
    input
        .product
        .apply_env_overrides(|key| std::env::var(key).ok());
    Ok(input)
}

fn plan_graph(input: &BuildInput, out_dir: &Path) -> Result<(ActionGraph, BuildOutcome)> {
    let registry = ModuleRegistry::new();
    let mut graph = ActionGraph::new();
    let outcome = ApexBuilder::new(input, out_dir)
        .run(&registry, &mut graph)
        .with_context(|| format!("planning '{}'", input.apex.name))?;
    Ok((graph, outcome))
}

fn plan(config: &Path, out_dir: &Path) -> Result<()> {
    let input = load(config)?;
    let (graph, _) = plan_graph(&input, out_dir)?;
    println!("{}", graph.to_json()?);
    Ok(())
}

fn check_tools(config: &Path) -> Result<()> {
    let input = load(config)?;
    check_host_tools(&input)?;
    println!("[apex:{}] all host tools present", input.apex.name);
    Ok(())
}

fn build(config: &Path, out_dir: &Path) -> Result<()> {
    let input = load(config)?;
    let name = input.apex.name.clone();
    check_host_tools(&input)?;
    let (graph, outcome) = plan_graph(&input, out_dir)?;

    let log = RunLog::new(out_dir, &name);
    let mut record = RunRecord::planned(&input, &outcome, log.next_run_id())?;
    log.save(&record)?;

    let build_result = LocalExecutor::new(out_dir).execute(&graph);

    record.finish(&outcome, &build_result);
    if let Err(err) = log.save(&record) {
        if build_result.is_ok() {
            return Err(err);
        }
        tracing::warn!("failed to persist run record: {:#}", err);
    }

    let summary = build_result.with_context(|| format!("building '{}'", name))?;
    log.prune(RUNS_TO_KEEP)?;
    println!(
        "[apex:{}] {} actions run, {} up to date; {} at {}",
        name,
        summary.ran,
        summary.skipped,
        record.reached,
        outcome.artifact.path.display()
    );
    Ok(())
}

fn list_runs(config: &Path, out_dir: &Path) -> Result<()> {
    let input = load(config)?;
    let log = RunLog::new(out_dir, &input.apex.name);
    for run in log.records()? {
        let status = match run.status {
            RunStatus::Building => "building",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
        };
        println!(
            "{}  v{}  {}  {}  {} files  {}{}",
            run.run_id,
            run.version,
            status,
            run.reached,
            run.files.len(),
            run.artifact.display(),
            run.failed_action
                .map(|rule| format!("  (failed in {})", rule))
                .unwrap_or_default()
        );
    }
    if let Some(latest) = log.latest_success()? {
        println!("latest successful: {}", latest.run_id);
    }
    Ok(())
}
