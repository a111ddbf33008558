//! Sequential phase execution — `phaser run`.

use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use phaser::RunPhaseResult;
use phaser::agent::{AgentEvent, AgentObserver};
use phaser::events::{ProgressReporter, RunEvent};
use phaser::phase::PhaseStatus;

use super::super::Cli;
use super::{build_engine, load_config};

struct ConsoleProgress;

#[async_trait]
impl ProgressReporter for ConsoleProgress {
    async fn report(&self, message: &str) {
        println!("  {}", console::style(message).dim());
    }
}

/// Echoes tool activity in verbose mode.
struct ToolEcho;

#[async_trait]
impl AgentObserver for ToolEcho {
    async fn on_event(&self, event: &AgentEvent) -> Result<()> {
        if let AgentEvent::ToolStart { description, .. } = event {
            println!("    {} {}", console::style("→").dim(), console::style(description).dim());
        }
        Ok(())
    }
}

fn print_event(event: &RunEvent) {
    match event {
        RunEvent::PhaseStart {
            phase_id, title, kind, ..
        } => {
            println!(
                "{} {} {} {}",
                console::style("▶").cyan().bold(),
                console::style(phase_id).bold(),
                console::style(format!("({})", kind)).dim(),
                title
            );
        }
        RunEvent::PhaseComplete { phase_id, status, .. } => {
            let line = format!("{} {} {}", status.emoji(), phase_id, status);
            match status {
                PhaseStatus::Done | PhaseStatus::Skipped => println!("{}", console::style(line).green()),
                PhaseStatus::Failed => println!("{}", console::style(line).red()),
                _ => println!("{}", console::style(line).yellow()),
            }
        }
    }
}

pub async fn cmd_run(
    cli: &Cli,
    project_dir: &Path,
    plan: &str,
    max_phases: Option<usize>,
    fix_attempts: Option<u32>,
) -> Result<()> {
    let config = load_config(cli, project_dir, fix_attempts)?;
    let (tx, mut rx) = mpsc::channel::<RunEvent>(64);
    let mut engine = build_engine(config)
        .with_progress(Arc::new(ConsoleProgress))
        .with_events(tx);
    if cli.verbose {
        engine = engine.with_observer(Arc::new(ToolEcho));
    }
    let plan_file = engine.resolve_plan_file(plan);

    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            print_event(&event);
        }
    });

    let cancel = CancellationToken::new();
    let ctrl_c = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\n{}", console::style("Cancelling current phase...").yellow());
                cancel.cancel();
            }
        }
    });

    let mut ran = 0usize;
    let last = loop {
        if max_phases.is_some_and(|max| ran >= max) {
            break None;
        }
        let result = engine.run_next_phase(&plan_file, &cancel).await?;
        ran += 1;
        if !result.is_done() || cancel.is_cancelled() {
            break Some(result);
        }
    };

    ctrl_c.abort();
    drop(engine);
    printer.await.ok();

    match last {
        None => {
            println!();
            println!("Stopped after {} phase(s).", ran);
            Ok(())
        }
        Some(RunPhaseResult::NothingToRun) => {
            println!();
            println!("{}", console::style("All phases complete.").green().bold());
            Ok(())
        }
        Some(result @ RunPhaseResult::Done { .. }) => {
            println!();
            println!("{}", result);
            Ok(())
        }
        Some(result) => anyhow::bail!("{}", result),
    }
}
