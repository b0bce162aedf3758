//! CLI command implementations.

pub mod experiment;
pub mod status;
pub mod trial;

use crate::domain::models::{Experiment, Query, SortOrder};
use crate::domain::ports::StorageProtocol;
use crate::domain::{StorageError, StorageResult};

/// Resolve an experiment from an id or a name.
///
/// A name resolves to its highest version, optionally restricted to `user`.
pub(crate) async fn resolve_experiment(
    storage: &dyn StorageProtocol,
    reference: &str,
    user: Option<&str>,
) -> StorageResult<Experiment> {
    if let Some(experiment) = storage
        .fetch_experiments(&Query::by_id(reference))
        .await?
        .into_iter()
        .next()
    {
        return Ok(experiment);
    }

    let mut query = Query::new()
        .eq("name", reference)
        .sort_by("version", SortOrder::Descending)
        .limit(1);
    if let Some(user) = user {
        query = query.eq("metadata.user", user);
    }

    storage
        .fetch_experiments(&query)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| StorageError::ExperimentNotFound(reference.to_string()))
}

/// Fetch a trial by id.
pub(crate) async fn resolve_trial(
    storage: &dyn StorageProtocol,
    id: &str,
) -> anyhow::Result<crate::domain::models::Trial> {
    storage
        .fetch_trials(&Query::by_id(id))
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("Trial not found: {id}"))
}
