//! Experiment CLI commands.

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use serde::Serialize;
use std::collections::BTreeMap;

use super::resolve_experiment;
use crate::cli::output::{output, short_id, truncate, CommandOutput};
use crate::cli::CommandContext;
use crate::domain::models::{
    timestamp, Direction, Experiment, ExperimentPatch, Query, SortOrder,
};

#[derive(Args, Debug)]
pub struct ExperimentArgs {
    #[command(subcommand)]
    pub command: ExperimentCommands,
}

#[derive(Subcommand, Debug)]
pub enum ExperimentCommands {
    /// Register a new experiment
    Create {
        /// Experiment name
        name: String,
        /// Owner of the experiment
        #[arg(short, long, env = "USER", default_value = "unknown")]
        user: String,
        /// Search space dimensions (format: "name=prior", repeatable)
        #[arg(short, long)]
        space: Vec<String>,
        /// Maximum number of trials
        #[arg(short, long)]
        max_trials: Option<u64>,
        /// Objective direction (minimize, maximize)
        #[arg(short, long, default_value = "minimize")]
        direction: String,
        /// Algorithm configuration as a JSON object
        #[arg(short, long)]
        algorithms: Option<String>,
        /// Create the next version if the name already exists for this user
        #[arg(short, long)]
        branch: bool,
    },
    /// List experiments
    List {
        /// Filter by owner
        #[arg(short, long)]
        user: Option<String>,
        /// Filter by name
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Show experiment details
    Show {
        /// Experiment id or name
        experiment: String,
        /// Owner, when resolving by name
        #[arg(short, long)]
        user: Option<String>,
    },
    /// Update experiment metadata
    Update {
        /// Experiment id or name
        experiment: String,
        /// Owner, when resolving by name
        #[arg(short, long)]
        user: Option<String>,
        /// New maximum number of trials
        #[arg(short, long)]
        max_trials: Option<u64>,
        /// New objective direction
        #[arg(short, long)]
        direction: Option<String>,
        /// New algorithm configuration as a JSON object
        #[arg(short, long)]
        algorithms: Option<String>,
    },
}

#[derive(Debug, Serialize)]
pub struct ExperimentOutput {
    pub id: String,
    pub name: String,
    pub user: String,
    pub version: u32,
    pub created: String,
    pub direction: String,
    pub max_trials: Option<u64>,
    pub space: BTreeMap<String, String>,
    pub algorithms: serde_json::Value,
}

impl From<&Experiment> for ExperimentOutput {
    fn from(experiment: &Experiment) -> Self {
        Self {
            id: experiment.id.clone(),
            name: experiment.name.clone(),
            user: experiment.user().to_string(),
            version: experiment.version,
            created: timestamp::format(&experiment.metadata.datetime),
            direction: experiment.direction.as_str().to_string(),
            max_trials: experiment.max_trials,
            space: experiment.space.clone(),
            algorithms: experiment.algorithms.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ExperimentListOutput {
    pub experiments: Vec<ExperimentOutput>,
    pub total: usize,
}

impl CommandOutput for ExperimentListOutput {
    fn to_human(&self) -> String {
        if self.experiments.is_empty() {
            return "No experiments found.".to_string();
        }

        let mut lines = vec![format!("Found {} experiment(s):\n", self.total)];
        lines.push(format!(
            "{:<10} {:<24} {:<12} {:<8} {:<10}",
            "ID", "NAME", "USER", "VERSION", "MAX"
        ));
        lines.push("-".repeat(68));

        for experiment in &self.experiments {
            lines.push(format!(
                "{:<10} {:<24} {:<12} {:<8} {:<10}",
                short_id(&experiment.id),
                truncate(&experiment.name, 22),
                truncate(&experiment.user, 10),
                experiment.version,
                experiment
                    .max_trials
                    .map_or_else(|| "-".to_string(), |n| n.to_string())
            ));
        }

        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct ExperimentDetailOutput {
    pub experiment: ExperimentOutput,
}

impl CommandOutput for ExperimentDetailOutput {
    fn to_human(&self) -> String {
        let experiment = &self.experiment;
        let mut lines = vec![
            format!("Experiment: {}-v{}", experiment.name, experiment.version),
            format!("ID: {}", experiment.id),
            format!("User: {}", experiment.user),
            format!("Created: {}", experiment.created),
            format!("Direction: {}", experiment.direction),
        ];

        if let Some(max_trials) = experiment.max_trials {
            lines.push(format!("Max trials: {max_trials}"));
        }

        if !experiment.space.is_empty() {
            lines.push("\nSpace:".to_string());
            for (name, prior) in &experiment.space {
                lines.push(format!("  {name}: {prior}"));
            }
        }

        if !experiment.algorithms.is_null() {
            lines.push(format!("\nAlgorithms: {}", experiment.algorithms));
        }

        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct ExperimentActionOutput {
    pub success: bool,
    pub message: String,
    pub experiment: Option<ExperimentOutput>,
}

impl CommandOutput for ExperimentActionOutput {
    fn to_human(&self) -> String {
        self.message.clone()
    }
}

/// Parse `name=prior` dimension definitions.
fn parse_space(entries: &[String]) -> Result<BTreeMap<String, String>> {
    entries
        .iter()
        .map(|entry| {
            let (name, prior) = entry
                .split_once('=')
                .ok_or_else(|| anyhow::anyhow!("Invalid space entry '{entry}': expected name=prior"))?;
            let name = name.trim();
            if name.is_empty() {
                anyhow::bail!("Invalid space entry '{entry}': empty dimension name");
            }
            Ok((name.to_string(), prior.trim().to_string()))
        })
        .collect()
}

fn parse_direction(direction: &str) -> Result<Direction> {
    Direction::from_str(direction).ok_or_else(|| anyhow::anyhow!("Invalid direction: {direction}"))
}

fn parse_algorithms(raw: &str) -> Result<serde_json::Value> {
    let value: serde_json::Value =
        serde_json::from_str(raw).context("Algorithm configuration must be valid JSON")?;
    if !value.is_object() {
        anyhow::bail!("Algorithm configuration must be a JSON object");
    }
    Ok(value)
}

pub async fn execute(args: ExperimentArgs, ctx: &CommandContext) -> Result<()> {
    let storage = ctx.storage.as_ref();

    match args.command {
        ExperimentCommands::Create {
            name,
            user,
            space,
            max_trials,
            direction,
            algorithms,
            branch,
        } => {
            let mut experiment = Experiment::new(&name, &user)
                .with_space(parse_space(&space)?)
                .with_direction(parse_direction(&direction)?);
            if let Some(max_trials) = max_trials {
                experiment = experiment.with_max_trials(max_trials);
            }
            if let Some(raw) = algorithms {
                experiment = experiment.with_algorithms(parse_algorithms(&raw)?);
            }

            if branch {
                let latest = storage
                    .fetch_experiments(
                        &Query::new()
                            .eq("name", name.as_str())
                            .eq("metadata.user", user.as_str())
                            .sort_by("version", SortOrder::Descending)
                            .limit(1),
                    )
                    .await?;
                if let Some(latest) = latest.first() {
                    experiment = experiment.with_version(latest.version + 1);
                }
            }

            let id = storage.create_experiment(&experiment).await?;
            experiment.id = id;

            let result = ExperimentActionOutput {
                success: true,
                message: format!(
                    "Experiment created: {}-v{} ({})",
                    experiment.name, experiment.version, experiment.id
                ),
                experiment: Some(ExperimentOutput::from(&experiment)),
            };
            output(&result, ctx.json);
        }

        ExperimentCommands::List { user, name } => {
            let mut query = Query::new().sort_by("metadata.datetime", SortOrder::Ascending);
            if let Some(user) = &user {
                query = query.eq("metadata.user", user.as_str());
            }
            if let Some(name) = &name {
                query = query.eq("name", name.as_str());
            }

            let experiments = storage.fetch_experiments(&query).await?;
            let result = ExperimentListOutput {
                total: experiments.len(),
                experiments: experiments.iter().map(ExperimentOutput::from).collect(),
            };
            output(&result, ctx.json);
        }

        ExperimentCommands::Show { experiment, user } => {
            let experiment = resolve_experiment(storage, &experiment, user.as_deref()).await?;
            let result = ExperimentDetailOutput {
                experiment: ExperimentOutput::from(&experiment),
            };
            output(&result, ctx.json);
        }

        ExperimentCommands::Update {
            experiment,
            user,
            max_trials,
            direction,
            algorithms,
        } => {
            let experiment = resolve_experiment(storage, &experiment, user.as_deref()).await?;

            let mut patch = ExperimentPatch::new();
            if let Some(max_trials) = max_trials {
                patch = patch.with_max_trials(max_trials);
            }
            if let Some(direction) = direction {
                patch = patch.with_direction(parse_direction(&direction)?);
            }
            if let Some(raw) = algorithms {
                patch = patch.with_algorithms(parse_algorithms(&raw)?);
            }
            if patch.is_empty() {
                anyhow::bail!("Nothing to update: pass --max-trials, --direction or --algorithms");
            }

            let result = match storage.update_experiment(&experiment, &patch, None).await? {
                Some(updated) => ExperimentActionOutput {
                    success: true,
                    message: format!("Experiment updated: {}-v{}", updated.name, updated.version),
                    experiment: Some(ExperimentOutput::from(&updated)),
                },
                None => ExperimentActionOutput {
                    success: false,
                    message: format!(
                        "Experiment {} changed concurrently; nothing was written",
                        experiment.id
                    ),
                    experiment: None,
                },
            };
            output(&result, ctx.json);
        }
    }

    Ok(())
}
