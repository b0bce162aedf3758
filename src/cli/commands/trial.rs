//! Trial CLI commands.

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::{resolve_experiment, resolve_trial};
use crate::cli::output::{output, short_id, truncate, CommandOutput};
use crate::cli::CommandContext;
use crate::domain::models::{timestamp, Query, SortOrder, Trial, TrialPatch, TrialResult, TrialStatus};
use crate::domain::ports::StorageProtocol;
use crate::domain::StorageError;

#[derive(Args, Debug)]
pub struct TrialArgs {
    #[command(subcommand)]
    pub command: TrialCommands,
}

#[derive(Subcommand, Debug)]
pub enum TrialCommands {
    /// Register a new trial for an experiment
    Register {
        /// Experiment id or name
        #[arg(short, long)]
        experiment: String,
        /// Owner, when resolving the experiment by name
        #[arg(short, long)]
        user: Option<String>,
        /// Parameter assignment (format: "name=value", value parsed as JSON when possible)
        #[arg(short, long)]
        param: Vec<String>,
    },
    /// List trials of an experiment
    List {
        /// Experiment id or name
        #[arg(short, long)]
        experiment: String,
        /// Owner, when resolving the experiment by name
        #[arg(short, long)]
        user: Option<String>,
        /// Filter by status
        #[arg(short, long)]
        status: Option<String>,
        /// Maximum number of trials to display
        #[arg(short, long, default_value = "50")]
        limit: usize,
    },
    /// Show trial details
    Show {
        /// Trial id
        id: String,
    },
    /// Reserve the oldest reservable trial of an experiment
    Reserve {
        /// Experiment id or name
        #[arg(short, long)]
        experiment: String,
        /// Owner, when resolving the experiment by name
        #[arg(short, long)]
        user: Option<String>,
        /// Worker tag recorded on the reservation
        #[arg(short, long)]
        worker: String,
    },
    /// Attach the results in an artifact file and complete the trial
    Ingest {
        /// Trial id
        id: String,
        /// Result artifact (JSON list of name/type/value records)
        #[arg(short, long)]
        artifact: PathBuf,
    },
    /// Move a trial to another status
    SetStatus {
        /// Trial id
        id: String,
        /// Target status
        status: String,
    },
    /// Refresh the heartbeat of a held trial
    Heartbeat {
        /// Trial id
        id: String,
    },
    /// List held trials whose heartbeat is stale
    Lost {
        /// Experiment id or name
        #[arg(short, long)]
        experiment: String,
        /// Owner, when resolving the experiment by name
        #[arg(short, long)]
        user: Option<String>,
        /// Staleness threshold in seconds
        #[arg(short, long, default_value = "300")]
        threshold_secs: i64,
    },
}

#[derive(Debug, Serialize)]
pub struct TrialOutput {
    pub id: String,
    pub experiment: String,
    pub status: String,
    pub worker: Option<String>,
    pub params: BTreeMap<String, Value>,
    pub submit_time: String,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub heartbeat: Option<String>,
    pub objective: Option<f64>,
    pub results: Vec<TrialResult>,
}

impl From<&Trial> for TrialOutput {
    fn from(trial: &Trial) -> Self {
        Self {
            id: trial.id.clone(),
            experiment: trial.experiment.clone(),
            status: trial.status.as_str().to_string(),
            worker: trial.worker.clone(),
            params: trial.params.clone(),
            submit_time: timestamp::format(&trial.submit_time),
            start_time: trial.start_time.as_ref().map(timestamp::format),
            end_time: trial.end_time.as_ref().map(timestamp::format),
            heartbeat: trial.heartbeat.as_ref().map(timestamp::format),
            objective: trial.objective_value(),
            results: trial.results.clone(),
        }
    }
}

fn format_params(params: &BTreeMap<String, Value>) -> String {
    params
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Serialize)]
pub struct TrialListOutput {
    pub trials: Vec<TrialOutput>,
    pub total: usize,
}

impl CommandOutput for TrialListOutput {
    fn to_human(&self) -> String {
        if self.trials.is_empty() {
            return "No trials found.".to_string();
        }

        let mut lines = vec![format!("Found {} trial(s):\n", self.total)];
        lines.push(format!(
            "{:<10} {:<12} {:<12} {:<12} {:<30}",
            "ID", "STATUS", "WORKER", "OBJECTIVE", "PARAMS"
        ));
        lines.push("-".repeat(80));

        for trial in &self.trials {
            lines.push(format!(
                "{:<10} {:<12} {:<12} {:<12} {:<30}",
                short_id(&trial.id),
                trial.status,
                truncate(trial.worker.as_deref().unwrap_or("-"), 10),
                trial
                    .objective
                    .map_or_else(|| "-".to_string(), |v| format!("{v:.4}")),
                truncate(&format_params(&trial.params), 30)
            ));
        }

        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct TrialDetailOutput {
    pub trial: TrialOutput,
}

impl CommandOutput for TrialDetailOutput {
    fn to_human(&self) -> String {
        let trial = &self.trial;
        let mut lines = vec![
            format!("Trial: {}", trial.id),
            format!("Experiment: {}", trial.experiment),
            format!("Status: {}", trial.status),
            format!("Params: {}", format_params(&trial.params)),
            format!("Submitted: {}", trial.submit_time),
        ];

        if let Some(worker) = &trial.worker {
            lines.push(format!("Worker: {worker}"));
        }
        if let Some(start) = &trial.start_time {
            lines.push(format!("Started: {start}"));
        }
        if let Some(end) = &trial.end_time {
            lines.push(format!("Ended: {end}"));
        }
        if let Some(heartbeat) = &trial.heartbeat {
            lines.push(format!("Heartbeat: {heartbeat}"));
        }

        if !trial.results.is_empty() {
            lines.push("\nResults:".to_string());
            for result in &trial.results {
                lines.push(format!(
                    "  - {} ({}): {}",
                    result.name,
                    result.result_type.as_str(),
                    result.value
                ));
            }
        }

        lines.join("\n")
    }
}

#[derive(Debug, Serialize)]
pub struct TrialActionOutput {
    pub success: bool,
    pub message: String,
    pub trial: Option<TrialOutput>,
}

impl TrialActionOutput {
    fn done(message: String, trial: &Trial) -> Self {
        Self {
            success: true,
            message,
            trial: Some(TrialOutput::from(trial)),
        }
    }

    fn skipped(message: String) -> Self {
        Self {
            success: false,
            message,
            trial: None,
        }
    }
}

impl CommandOutput for TrialActionOutput {
    fn to_human(&self) -> String {
        self.message.clone()
    }
}

/// Parse `name=value` assignments; values that are not valid JSON are kept as strings.
fn parse_params(entries: &[String]) -> Result<BTreeMap<String, Value>> {
    let mut params = BTreeMap::new();
    for entry in entries {
        let (name, raw) = entry
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("Invalid parameter '{entry}': expected name=value"))?;
        let name = name.trim();
        if name.is_empty() {
            anyhow::bail!("Invalid parameter '{entry}': empty name");
        }
        let raw = raw.trim();
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        params.insert(name.to_string(), value);
    }
    Ok(params)
}

fn parse_status(status: &str) -> Result<TrialStatus> {
    TrialStatus::from_str(status).ok_or_else(|| {
        let valid: Vec<&str> = TrialStatus::ALL.iter().map(TrialStatus::as_str).collect();
        anyhow::anyhow!("Invalid status '{status}'. Must be one of: {}", valid.join(", "))
    })
}

/// Record the artifact's results on `trial` and complete it.
///
/// A reserved trial is moved to running first. A malformed artifact breaks
/// the trial and the parse error is returned.
pub async fn ingest(
    storage: &dyn StorageProtocol,
    trial: &Trial,
    artifact: &Path,
) -> Result<Option<Trial>> {
    let mut current = trial.clone();
    if current.status == TrialStatus::Reserved {
        let running = TrialPatch::new().with_status(TrialStatus::Running);
        match storage.update_trial(&current, &running, None).await? {
            Some(updated) => current = updated,
            None => return Ok(None),
        }
    }

    let with_results = match storage.retrieve_result(&current, artifact).await {
        Ok(with_results) => with_results,
        Err(err @ StorageError::MalformedResult(_)) => {
            let broken = TrialPatch::new().with_status(TrialStatus::Broken);
            storage
                .update_trial(&current, &broken, None)
                .await
                .context("Failed to mark trial broken after a malformed artifact")?;
            return Err(err.into());
        }
        Err(err) => return Err(err.into()),
    };

    let completed = TrialPatch::new()
        .with_status(TrialStatus::Completed)
        .with_results(with_results.results);
    Ok(storage.update_trial(&current, &completed, None).await?)
}

pub async fn execute(args: TrialArgs, ctx: &CommandContext) -> Result<()> {
    let storage = ctx.storage.as_ref();

    match args.command {
        TrialCommands::Register {
            experiment,
            user,
            param,
        } => {
            let experiment = resolve_experiment(storage, &experiment, user.as_deref()).await?;
            let params = parse_params(&param)?;
            let trial = storage.register_trial(&experiment.id, params).await?;
            let result = TrialActionOutput::done(format!("Trial registered: {}", trial.id), &trial);
            output(&result, ctx.json);
        }

        TrialCommands::List {
            experiment,
            user,
            status,
            limit,
        } => {
            let experiment = resolve_experiment(storage, &experiment, user.as_deref()).await?;
            let mut query = Query::new()
                .eq("experiment", experiment.id.as_str())
                .sort_by("submit_time", SortOrder::Ascending)
                .limit(limit);
            if let Some(status) = status {
                query = query.eq("status", parse_status(&status)?.as_str());
            }

            let trials = storage.fetch_trials(&query).await?;
            let result = TrialListOutput {
                total: trials.len(),
                trials: trials.iter().map(TrialOutput::from).collect(),
            };
            output(&result, ctx.json);
        }

        TrialCommands::Show { id } => {
            let trial = resolve_trial(storage, &id).await?;
            let result = TrialDetailOutput {
                trial: TrialOutput::from(&trial),
            };
            output(&result, ctx.json);
        }

        TrialCommands::Reserve {
            experiment,
            user,
            worker,
        } => {
            let experiment = resolve_experiment(storage, &experiment, user.as_deref()).await?;
            let query = Query::new().eq("experiment", experiment.id.as_str());
            let (query, worker) = (&query, worker.as_str());
            let reserved = ctx
                .retry
                .execute(move || storage.reserve_trial(query, worker))
                .await?;

            let result = match reserved {
                Some(trial) => {
                    TrialActionOutput::done(format!("Trial reserved: {}", trial.id), &trial)
                }
                None => TrialActionOutput::skipped(format!(
                    "No reservable trial in {}-v{}",
                    experiment.name, experiment.version
                )),
            };
            output(&result, ctx.json);
        }

        TrialCommands::Ingest { id, artifact } => {
            let trial = resolve_trial(storage, &id).await?;
            let result = match ingest(storage, &trial, &artifact).await? {
                Some(completed) => TrialActionOutput::done(
                    format!(
                        "Trial completed: {} ({} result(s))",
                        completed.id,
                        completed.results.len()
                    ),
                    &completed,
                ),
                None => TrialActionOutput::skipped(format!(
                    "Trial {id} changed concurrently; nothing was written"
                )),
            };
            output(&result, ctx.json);
        }

        TrialCommands::SetStatus { id, status } => {
            let trial = resolve_trial(storage, &id).await?;
            let next = parse_status(&status)?;

            let mut patch = TrialPatch::new().with_status(next);
            if !matches!(next, TrialStatus::Reserved | TrialStatus::Running) && !next.is_terminal() {
                patch = patch.clear_worker();
            }

            let result = match storage.update_trial(&trial, &patch, None).await? {
                Some(updated) => TrialActionOutput::done(
                    format!("Trial {} is now {}", updated.id, updated.status),
                    &updated,
                ),
                None => TrialActionOutput::skipped(format!(
                    "Trial {id} changed concurrently; nothing was written"
                )),
            };
            output(&result, ctx.json);
        }

        TrialCommands::Heartbeat { id } => {
            let trial = resolve_trial(storage, &id).await?;
            let result = match storage.update_heartbeat(&trial).await? {
                Some(updated) => {
                    TrialActionOutput::done(format!("Heartbeat recorded for {}", updated.id), &updated)
                }
                None => TrialActionOutput::skipped(format!(
                    "Trial {id} is no longer held by {}",
                    trial.worker.as_deref().unwrap_or("-")
                )),
            };
            output(&result, ctx.json);
        }

        TrialCommands::Lost {
            experiment,
            user,
            threshold_secs,
        } => {
            if threshold_secs < 0 {
                anyhow::bail!("Threshold must not be negative");
            }
            let experiment = resolve_experiment(storage, &experiment, user.as_deref()).await?;
            let trials = storage
                .fetch_lost_trials(&experiment.id, chrono::Duration::seconds(threshold_secs))
                .await?;
            let result = TrialListOutput {
                total: trials.len(),
                trials: trials.iter().map(TrialOutput::from).collect(),
            };
            output(&result, ctx.json);
        }
    }

    Ok(())
}
