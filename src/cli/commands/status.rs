//! Status report command.

use anyhow::{Context, Result};
use clap::Args;
use comfy_table::{presets, Attribute, Cell, ContentArrangement, Table};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::cli::output::{output, CommandOutput};
use crate::cli::CommandContext;
use crate::domain::models::{Direction, Experiment, ExperimentReport, Query, TrialStatus};

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Only report experiments with this name
    #[arg(short, long)]
    pub name: Option<String>,

    /// Only report experiments owned by this user
    #[arg(short, long)]
    pub user: Option<String>,

    /// Include every version, not only the latest of each experiment
    #[arg(short, long)]
    pub all: bool,

    /// Include the best-so-far trajectory
    #[arg(short, long)]
    pub trajectory: bool,
}

#[derive(Debug, Serialize)]
pub struct StatusOutput {
    pub experiments: Vec<ExperimentReport>,
    #[serde(skip)]
    pub show_trajectory: bool,
}

impl CommandOutput for StatusOutput {
    fn to_human(&self) -> String {
        if self.experiments.is_empty() {
            return "No experiments found.".to_string();
        }

        self.experiments
            .iter()
            .map(|report| render_report(report, self.show_trajectory))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

fn render_report(report: &ExperimentReport, show_trajectory: bool) -> String {
    let title = format!("{}-v{}", report.name, report.version);
    let mut lines = vec![title.clone(), "=".repeat(title.len())];

    let objective_header = match report.direction {
        Direction::Minimize => "min obj",
        Direction::Maximize => "max obj",
    };

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("status").add_attribute(Attribute::Bold),
            Cell::new("quantity").add_attribute(Attribute::Bold),
            Cell::new(objective_header).add_attribute(Attribute::Bold),
        ]);

    for status in TrialStatus::ALL {
        let quantity = report.count(status);
        if quantity == 0 {
            continue;
        }
        let best = match (status, report.best()) {
            (TrialStatus::Completed, Some(best)) => format!("{best:.4}"),
            _ => String::new(),
        };
        table.add_row(vec![
            Cell::new(status.as_str()),
            Cell::new(quantity),
            Cell::new(best),
        ]);
    }

    if report.total() == 0 {
        lines.push("empty".to_string());
    } else {
        lines.push(table.to_string());
    }

    if let Some(max_trials) = report.max_trials {
        lines.push(format!("completed {} of {max_trials} trials", report.count(TrialStatus::Completed)));
    }

    if show_trajectory && !report.trajectory.is_empty() {
        let points: Vec<String> = report.trajectory.iter().map(|v| format!("{v:.4}")).collect();
        lines.push(format!("best so far: {}", points.join(", ")));
    }

    lines.join("\n")
}

/// Keep only the highest version of each (name, user) pair.
fn latest_versions(experiments: Vec<Experiment>) -> Vec<Experiment> {
    let mut latest: BTreeMap<(String, String), Experiment> = BTreeMap::new();
    for experiment in experiments {
        let key = (experiment.name.clone(), experiment.user().to_string());
        match latest.get(&key) {
            Some(current) if current.version >= experiment.version => {}
            _ => {
                latest.insert(key, experiment);
            }
        }
    }
    latest.into_values().collect()
}

pub async fn execute(args: StatusArgs, ctx: &CommandContext) -> Result<()> {
    let mut query = Query::new();
    if let Some(name) = &args.name {
        query = query.eq("name", name.as_str());
    }
    if let Some(user) = &args.user {
        query = query.eq("metadata.user", user.as_str());
    }

    let mut experiments = ctx
        .storage
        .fetch_experiments(&query)
        .await
        .context("Failed to fetch experiments")?;
    if !args.all {
        experiments = latest_versions(experiments);
    }
    experiments.sort_by(|a, b| a.name.cmp(&b.name).then(a.version.cmp(&b.version)));

    let mut reports = Vec::with_capacity(experiments.len());
    for experiment in &experiments {
        reports.push(ctx.storage.experiment_report(experiment).await?);
    }

    let result = StatusOutput {
        experiments: reports,
        show_trajectory: args.trajectory,
    };
    output(&result, ctx.json);
    Ok(())
}
