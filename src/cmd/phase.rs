//! Phase state inspection and operator commands — `phaser status`,
//! `phaser decompose`, `phaser skip`.

use anyhow::{Context, Result};
use std::path::Path;

use phaser::phase::{PhaseStatus, PlanPhases};
use phaser::plan::plan_id_for;
use phaser::scheduler::{Staleness, check_staleness};

use super::super::Cli;
use super::{build_engine, load_config};

fn print_phases(phases: &PlanPhases) {
    println!();
    println!("{}", console::style(format!("Plan {}", phases.plan_id)).bold().cyan());
    println!("  file: {}", phases.plan_file);
    println!("  updated: {}", phases.updated_at.to_rfc3339());
    println!();

    for phase in &phases.phases {
        let status = format!("{} {:<11}", phase.status.emoji(), phase.status.as_str());
        let status = match phase.status {
            PhaseStatus::Done | PhaseStatus::Skipped => console::style(status).green(),
            PhaseStatus::Failed => console::style(status).red(),
            PhaseStatus::InProgress => console::style(status).yellow(),
            PhaseStatus::Pending => console::style(status).dim(),
        };
        println!(
            "  {} {} {:<9} {}",
            status,
            console::style(&phase.id).bold(),
            phase.kind.as_str(),
            phase.title
        );
        if !phase.depends_on.is_empty() {
            println!("      depends on: {}", phase.depends_on.join(", "));
        }
        if let Some(commit) = &phase.git_commit {
            println!("      commit: {}", &commit[..commit.floor_char_boundary(12)]);
        }
        if let Some(error) = &phase.error {
            println!("      {} {}", console::style("error:").red(), error);
        }
    }

    let counts = phases
        .status_counts()
        .into_iter()
        .map(|(status, n)| format!("{} {}", n, status))
        .collect::<Vec<_>>()
        .join(", ");
    println!();
    println!("  {}", counts);
}

pub fn cmd_status(cli: &Cli, project_dir: &Path, plan: &str, json: bool) -> Result<()> {
    let config = load_config(cli, project_dir, None)?;
    let engine = build_engine(config);
    let plan_file = engine.resolve_plan_file(plan);
    let plan_id = plan_id_for(&plan_file);

    let Some(phases) = engine.load_phases(&plan_id)? else {
        println!("No phases for plan '{}'. Run 'phaser decompose {}' first.", plan_id, plan);
        return Ok(());
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&phases)?);
        return Ok(());
    }

    print_phases(&phases);
    match std::fs::read_to_string(&plan_file) {
        Ok(text) => {
            if let Staleness::Stale { .. } = check_staleness(&phases, &text) {
                println!();
                println!(
                    "  {} plan changed since decomposition; run 'phaser decompose {} --force'",
                    console::style("stale:").yellow().bold(),
                    plan
                );
            }
        }
        Err(_) => println!("  {} plan file {} not found", console::style("warning:").yellow(), plan_file.display()),
    }
    println!();
    Ok(())
}

pub async fn cmd_decompose(cli: &Cli, project_dir: &Path, plan: &str, force: bool) -> Result<()> {
    let config = load_config(cli, project_dir, None)?;
    let engine = build_engine(config);
    let plan_file = engine.resolve_plan_file(plan);
    let decomposition = engine
        .decompose_plan(&plan_file, force)
        .await
        .with_context(|| format!("Failed to decompose {}", plan_file.display()))?;

    if decomposition.created {
        println!(
            "{} {} phases",
            console::style("Decomposed into").green(),
            decomposition.phases.phases.len()
        );
    } else {
        println!("Phases already exist; use --force to regenerate.");
    }
    print_phases(&decomposition.phases);
    println!();
    Ok(())
}

pub async fn cmd_skip(cli: &Cli, project_dir: &Path, plan: &str, phase: &str) -> Result<()> {
    let config = load_config(cli, project_dir, None)?;
    let engine = build_engine(config);
    let plan_id = plan_id_for(&engine.resolve_plan_file(plan));
    engine.skip_phase(&plan_id, phase).await?;
    println!("Skipped {} in {}", phase, plan_id);
    Ok(())
}
