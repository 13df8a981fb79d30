#![forbid(unsafe_code)]

mod artifact;
mod config;

use std::path::PathBuf;
use std::time::Duration;

use country_refresh_core::{
    now_utc, reconcile, CancellationToken, CountryStore, CountryTransaction, MultiplierSource,
    ReconciledRecord, RefreshError, RefreshStage, RngMultiplier,
};
use country_refresh_sources::{fetch_both, ExternalSources, FetchBudget, DEFAULT_FETCH_BUDGET};
use serde::Serialize;
use time::OffsetDateTime;
use tracing::{debug, error, info, info_span, warn};
use ulid::Ulid;

pub use artifact::{
    read_artifact, top_by_estimated_gdp, write_artifact, ArtifactRenderer, SvgSummaryRenderer,
};
pub use config::{
    ConfigError, RefreshConfig, DEFAULT_ARTIFACT_PATH, DEFAULT_FETCH_BUDGET_MS,
    ENV_ARTIFACT_PATH, ENV_COUNTRIES_URL, ENV_FETCH_BUDGET_MS, ENV_RATES_URL,
};

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ArtifactOutcome {
    Written { path: PathBuf, bytes: usize },
    Failed { stage: RefreshStage, reason: String },
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RefreshReport {
    pub run_id: Ulid,
    pub record_count: usize,
    #[serde(with = "time::serde::rfc3339")]
    pub refreshed_at: OffsetDateTime,
    pub artifact: ArtifactOutcome,
}

/// Merges a reconciled batch into an open transaction.
///
/// A case-insensitive name match is overwritten in place and keeps its id;
/// anything else is inserted. Returns the number of records processed.
///
/// # Errors
/// Returns the first store error; the caller owns rollback.
pub fn apply<T>(
    tx: &mut T,
    records: &[ReconciledRecord],
    refreshed_at: OffsetDateTime,
) -> anyhow::Result<usize>
where
    T: CountryTransaction + ?Sized,
{
    for record in records {
        match tx.find_by_name(&record.name)? {
            Some(existing) => tx.update(existing.id, record, refreshed_at)?,
            None => {
                tx.insert(record, refreshed_at)?;
            }
        }
    }
    Ok(records.len())
}

pub struct RefreshOrchestrator<'a> {
    sources: &'a dyn ExternalSources,
    store: &'a mut dyn CountryStore,
    renderer: &'a dyn ArtifactRenderer,
    multipliers: Box<dyn MultiplierSource + 'a>,
    fetch_budget: Duration,
    artifact_path: PathBuf,
}

impl<'a> RefreshOrchestrator<'a> {
    #[must_use]
    pub fn new(
        sources: &'a dyn ExternalSources,
        store: &'a mut dyn CountryStore,
        renderer: &'a dyn ArtifactRenderer,
    ) -> Self {
        Self {
            sources,
            store,
            renderer,
            multipliers: Box::new(RngMultiplier::thread()),
            fetch_budget: DEFAULT_FETCH_BUDGET,
            artifact_path: PathBuf::from(DEFAULT_ARTIFACT_PATH),
        }
    }

    #[must_use]
    pub fn with_multipliers(mut self, multipliers: Box<dyn MultiplierSource + 'a>) -> Self {
        self.multipliers = multipliers;
        self
    }

    #[must_use]
    pub fn with_fetch_budget(mut self, fetch_budget: Duration) -> Self {
        self.fetch_budget = fetch_budget;
        self
    }

    #[must_use]
    pub fn with_artifact_path(mut self, artifact_path: impl Into<PathBuf>) -> Self {
        self.artifact_path = artifact_path.into();
        self
    }

    #[must_use]
    pub fn with_config(self, config: &RefreshConfig) -> Self {
        self.with_fetch_budget(config.fetch_budget())
            .with_artifact_path(config.artifact_path.clone())
    }

    /// Fetch, reconcile, upsert in one transaction, then regenerate the
    /// summary artifact from a post-commit snapshot.
    ///
    /// Artifact problems are reported in [`RefreshReport::artifact`] and never
    /// undo committed data.
    ///
    /// # Errors
    /// Returns [`RefreshError::SourceUnavailable`] when either upstream fails
    /// (no transaction is opened), [`RefreshError::Persistence`] when the
    /// upsert or commit fails, and [`RefreshError::Cancelled`] when `cancel`
    /// fires before commit. Every failure after the transaction opens is
    /// preceded by a rollback.
    pub fn run_refresh(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<RefreshReport, RefreshError> {
        let run_id = Ulid::new();
        let span = info_span!("refresh", %run_id);
        let _entered = span.enter();

        let mut stage = RefreshStage::Idle;
        let outcome = self.run_stages(run_id, cancel, &mut stage);
        if let Err(err) = &outcome {
            error!(failed_stage = %stage, error = %err, "refresh aborted");
            advance(&mut stage, RefreshStage::Aborted);
        }
        outcome
    }

    fn run_stages(
        &mut self,
        run_id: Ulid,
        cancel: &CancellationToken,
        stage: &mut RefreshStage,
    ) -> Result<RefreshReport, RefreshError> {
        advance(stage, RefreshStage::Fetching);
        let budget = FetchBudget::new(self.fetch_budget, cancel.clone());
        let (entities, rates) = fetch_both(self.sources, &budget)?;
        info!(
            entities = entities.len(),
            rates = rates.len(),
            "fetched upstream datasets"
        );

        advance(stage, RefreshStage::Reconciling);
        let records = reconcile(&entities, &rates, self.multipliers.as_mut());

        advance(stage, RefreshStage::Upserting);
        ensure_not_cancelled(cancel, RefreshStage::Upserting)?;
        let (record_count, refreshed_at) = self.upsert(&records, cancel)?;

        advance(stage, RefreshStage::Committed);
        info!(record_count, "refresh committed");

        let artifact = self.generate_artifact(refreshed_at, stage);

        advance(stage, RefreshStage::Done);
        Ok(RefreshReport {
            run_id,
            record_count,
            refreshed_at,
            artifact,
        })
    }

    /// Applies `records` in one transaction stamped with the instant it opened.
    fn upsert(
        &mut self,
        records: &[ReconciledRecord],
        cancel: &CancellationToken,
    ) -> Result<(usize, OffsetDateTime), RefreshError> {
        let mut tx = self
            .store
            .begin()
            .map_err(|err| RefreshError::persistence(RefreshStage::Upserting, &err))?;
        let refreshed_at = now_utc();

        let count = match apply(tx.as_mut(), records, refreshed_at) {
            Ok(count) => count,
            Err(err) => {
                rollback_quietly(tx);
                return Err(RefreshError::persistence(RefreshStage::Upserting, &err));
            }
        };

        if cancel.is_cancelled() {
            rollback_quietly(tx);
            return Err(RefreshError::Cancelled {
                stage: RefreshStage::Upserting,
            });
        }

        tx.commit()
            .map_err(|err| RefreshError::persistence(RefreshStage::Upserting, &err))?;
        Ok((count, refreshed_at))
    }

    fn generate_artifact(
        &mut self,
        refreshed_at: OffsetDateTime,
        stage: &mut RefreshStage,
    ) -> ArtifactOutcome {
        advance(stage, RefreshStage::Snapshotting);
        let snapshot = match self.store.snapshot_all() {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(error = %format!("{err:#}"), "snapshot after commit failed");
                return ArtifactOutcome::Failed {
                    stage: RefreshStage::Snapshotting,
                    reason: format!("{err:#}"),
                };
            }
        };

        advance(stage, RefreshStage::ArtifactGenerating);
        match write_artifact(self.renderer, &snapshot, refreshed_at, &self.artifact_path) {
            Ok(bytes) => {
                info!(path = %self.artifact_path.display(), bytes, "summary artifact written");
                ArtifactOutcome::Written {
                    path: self.artifact_path.clone(),
                    bytes,
                }
            }
            Err(err) => {
                warn!(error = %format!("{err:#}"), "summary artifact generation failed");
                ArtifactOutcome::Failed {
                    stage: RefreshStage::ArtifactGenerating,
                    reason: format!("{err:#}"),
                }
            }
        }
    }
}

fn advance(stage: &mut RefreshStage, next: RefreshStage) {
    debug!(from = %stage, to = %next, "refresh stage transition");
    *stage = next;
}

fn ensure_not_cancelled(
    cancel: &CancellationToken,
    stage: RefreshStage,
) -> Result<(), RefreshError> {
    if cancel.is_cancelled() {
        return Err(RefreshError::Cancelled { stage });
    }
    Ok(())
}

fn rollback_quietly(tx: Box<dyn CountryTransaction + '_>) {
    if let Err(err) = tx.rollback() {
        warn!(error = %format!("{err:#}"), "rollback failed; transaction discarded on drop");
    }
}
