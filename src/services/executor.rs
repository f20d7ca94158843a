//! Import executor
//!
//! Converts the NONE rows of a job into records. Runs synchronously for
//! small imports and from the scheduler for deferred ones; both go through
//! `ImportExecutor::run`, which is safe to call again on a partially
//! processed job because only NONE rows are ever fetched.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::dedup_cache::{CachedLookup, DedupCache};
use super::records::{RecordAction, RecordStore, SaveMode};
use super::staging::StagingStore;
use super::status_reporter::StatusReporter;
use super::strategy::{RowOutcome, StrategyRegistry};
use super::Backends;
use crate::config::ImportSettings;
use crate::error::ImportError;
use crate::types::{ImportCounts, ImportJob, JobStatus, MergePolicy, RowFields, RowStatus, StagedRow};

/// State of one executor run: owns the dedup cache and the tally, and is
/// dropped when the run ends.
pub struct ImportRun {
    job: ImportJob,
    fields: Vec<String>,
    staging: Arc<dyn StagingStore>,
    records: Arc<dyn RecordStore>,
    cache: DedupCache<Uuid>,
    created_here: HashSet<Uuid>,
    batch_size: usize,
    tally: ImportCounts,
}

impl ImportRun {
    pub fn new(
        job: ImportJob,
        staging: Arc<dyn StagingStore>,
        records: Arc<dyn RecordStore>,
        settings: &ImportSettings,
    ) -> Self {
        let fields = job.fields();
        Self {
            job,
            fields,
            staging,
            records,
            cache: DedupCache::new(settings.dedup_cache_max),
            created_here: HashSet::new(),
            batch_size: settings.batch_size.max(1),
            tally: ImportCounts::default(),
        }
    }

    /// Rows this run moved to a terminal status
    pub fn tally(&self) -> ImportCounts {
        self.tally
    }

    /// Treat records created by earlier runs of the same staging table as
    /// created here, so a resumed job attaches later rows to them exactly
    /// like an uninterrupted run would.
    pub async fn load_created(&mut self) -> Result<(), ImportError> {
        let created = self
            .staging
            .created_rows(self.job.user_id, &self.job.module, None)
            .await?;
        self.created_here.extend(created.into_iter().map(|row| row.record_id));
        Ok(())
    }

    /// Next rows still in NONE; empty once everything is processed
    pub async fn next_batch(&self) -> Result<Vec<StagedRow>, ImportError> {
        self.staging
            .pending_rows(self.job.user_id, &self.job.module, &self.fields, self.batch_size)
            .await
    }

    /// Resolve an existing record, consulting the run's cache before the
    /// record store. Misses are cached too.
    pub async fn find_existing(
        &mut self,
        key_parts: &[&str],
        criteria: &[(&str, &str)],
    ) -> Result<Option<Uuid>, ImportError> {
        match self.cache.lookup(&self.job.module, key_parts) {
            Some(CachedLookup::Found(id)) => return Ok(Some(*id)),
            Some(CachedLookup::Absent) => return Ok(None),
            None => {}
        }

        let found = self.records.find(&self.job.module, criteria).await?;
        self.cache.store(found, &self.job.module, key_parts);
        Ok(found)
    }

    /// Cache a record created by this run under its lookup key
    pub fn remember(&mut self, key_parts: &[&str], record_id: Uuid) {
        self.cache.store(Some(record_id), &self.job.module, key_parts);
    }

    pub fn created_in_run(&self, record_id: Uuid) -> bool {
        self.created_here.contains(&record_id)
    }

    pub async fn create_record(&mut self, fields: &RowFields) -> Result<Uuid, ImportError> {
        let id = self
            .records
            .create(self.job.user_id, &self.job.module, fields, SaveMode::Bulk)
            .await?;
        self.created_here.insert(id);
        Ok(id)
    }

    pub async fn update_record(
        &self,
        record_id: Uuid,
        fields: &RowFields,
        policy: MergePolicy,
    ) -> Result<(), ImportError> {
        self.records
            .update(&self.job.module, record_id, fields, policy, SaveMode::Bulk)
            .await
    }

    /// Apply the job's merge policy to an existing record
    pub async fn merge_into(&self, record_id: Uuid, fields: &RowFields) -> Result<(), ImportError> {
        self.update_record(record_id, fields, self.job.merge_policy).await
    }

    /// Persist the outcome of one row.
    ///
    /// Row failures mark the row FAILED and return `Ok`; any other error is
    /// returned untouched and leaves the row in NONE.
    pub async fn record_outcome(
        &mut self,
        row: &StagedRow,
        outcome: Result<RowOutcome, ImportError>,
    ) -> Result<(), ImportError> {
        let (status, record_id) = match outcome {
            Ok(RowOutcome::Created(id)) => (RowStatus::Created, Some(id)),
            Ok(RowOutcome::Skipped(existing)) => (RowStatus::Skipped, existing),
            Err(err) if err.is_row_failure() => {
                warn!(job_id = %self.job.id, module = %self.job.module, row_id = row.id, error = %err, "Row conversion failed");
                (RowStatus::Failed, None)
            }
            Err(err) => return Err(err),
        };

        let marked = self
            .staging
            .mark_row(self.job.user_id, &self.job.module, row.id, status, record_id)
            .await?;
        if !marked {
            return Err(ImportError::RowNotPending {
                module: self.job.module.clone(),
                row_id: row.id,
            });
        }

        self.tally.total += 1;
        match status {
            RowStatus::Created => self.tally.created += 1,
            RowStatus::Failed => self.tally.failed += 1,
            RowStatus::Skipped => self.tally.skipped += 1,
            RowStatus::None => {}
        }
        Ok(())
    }
}

pub struct ImportExecutor {
    backends: Backends,
    strategies: Arc<StrategyRegistry>,
    reporter: StatusReporter,
    settings: ImportSettings,
}

impl ImportExecutor {
    pub fn new(backends: Backends, strategies: Arc<StrategyRegistry>, settings: ImportSettings) -> Self {
        let reporter = StatusReporter::new(backends.clone());
        Self {
            backends,
            strategies,
            reporter,
            settings,
        }
    }

    /// Process every NONE row of the job and return the job's counts.
    ///
    /// The job is RUNNING while rows are converted and HALTED afterwards,
    /// also when the run fails. A finished job is not run again.
    pub async fn run(&self, job_id: Uuid) -> Result<ImportCounts, ImportError> {
        let job = self
            .backends
            .queue
            .get(job_id)
            .await?
            .ok_or(ImportError::JobNotFound(job_id))?;

        if job.is_finished() {
            debug!(job_id = %job.id, "Import job already finished");
            return Ok(self.reporter.summarize(&job).await?.counts);
        }

        let permitted = self
            .backends
            .records
            .has_module_permission(job.user_id, &job.module, RecordAction::Import)
            .await?;
        if !permitted {
            // HALTED releases the lock and takes the job off the scheduled set
            if matches!(job.status, JobStatus::None | JobStatus::Scheduled) {
                self.backends.queue.update_status(job_id, JobStatus::Halted).await?;
            }
            warn!(
                %job_id, user_id = %job.user_id, module = %job.module,
                "Import job halted, user lacks import permission"
            );
            return Err(ImportError::PermissionDenied {
                module: job.module.clone(),
                action: RecordAction::Import,
            });
        }

        let job = self.backends.queue.claim_for_run(job_id).await?;
        let user_id = job.user_id;
        let module = job.module.clone();
        let strategy = self.strategies.strategy_for(&module);
        info!(%job_id, %user_id, %module, strategy = strategy.name(), "Import run started");

        let start = Instant::now();
        let mut run = ImportRun::new(
            job,
            self.backends.staging.clone(),
            self.backends.records.clone(),
            &self.settings,
        );
        let result = match run.load_created().await {
            Ok(()) => strategy.import(&mut run).await,
            Err(err) => Err(err),
        };
        let tally = run.tally();
        drop(run);

        let halted = self.backends.queue.update_status(job_id, JobStatus::Halted).await;

        if let Err(err) = result {
            error!(
                %job_id, %user_id, %module, error = %err,
                created = tally.created, failed = tally.failed, skipped = tally.skipped,
                "Import run halted"
            );
            if let Err(status_err) = halted {
                error!(%job_id, error = %status_err, "Failed to mark import job halted");
            }
            return Err(err);
        }

        let job = halted?;
        let summary = self.reporter.summarize(&job).await?;
        info!(
            %job_id, %user_id, %module,
            created = tally.created, failed = tally.failed, skipped = tally.skipped,
            phase = ?summary.phase,
            "Import run completed in {:?}", start.elapsed()
        );
        Ok(summary.counts)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::services::import_queue::ImportQueue;
    use crate::services::strategy::ImportStrategy;
    use crate::services::testing::{contacts, row, Harness, CONTACT_FIELDS};

    fn executor(harness: &Harness) -> ImportExecutor {
        ImportExecutor::new(
            harness.backends(),
            Arc::new(StrategyRegistry::with_builtin(&ImportSettings::default().inventory_modules)),
            ImportSettings::default(),
        )
    }

    #[tokio::test]
    async fn test_small_import_runs_to_done() {
        let harness = Harness::new();
        harness.stage("Contacts", &CONTACT_FIELDS, contacts(50)).await;
        let job = harness.enqueue("Contacts", JobStatus::None).await;

        let counts = executor(&harness).run(job.id).await.unwrap();

        assert_eq!(counts.total, 50);
        assert_eq!(counts.created, 50);
        assert_eq!(counts.failed + counts.skipped, 50 - counts.created);
        assert!(counts.is_complete());

        let job = harness.queue.get(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Halted);
        assert!(job.is_finished());
        assert_eq!(harness.records.live_count("Contacts"), 50);
    }

    #[tokio::test]
    async fn test_row_failures_do_not_stop_the_batch() {
        let harness = Harness::new();
        let mut rows = contacts(3);
        rows.push(row(&[("firstname", "NoLastName")]));
        rows.push(row(&[("lastname", "Bad"), ("email", "not-an-email")]));
        harness.stage("Contacts", &CONTACT_FIELDS, rows).await;
        let job = harness.enqueue("Contacts", JobStatus::None).await;

        let counts = executor(&harness).run(job.id).await.unwrap();

        assert_eq!(counts, ImportCounts { total: 5, created: 3, failed: 2, skipped: 0 });
        assert!(harness.queue.get(job.id).await.unwrap().unwrap().is_finished());
    }

    #[tokio::test]
    async fn test_collaborator_failure_halts_and_rerun_resumes() {
        let harness = Harness::new();
        harness.stage("Contacts", &CONTACT_FIELDS, contacts(5)).await;
        let job = harness.enqueue("Contacts", JobStatus::None).await;
        harness.records.fail_create_when("lastname", "L3");
        let executor = executor(&harness);

        let err = executor.run(job.id).await.unwrap_err();
        assert!(matches!(err, ImportError::Collaborator(_)));

        let halted = harness.queue.get(job.id).await.unwrap().unwrap();
        assert_eq!(halted.status, JobStatus::Halted);
        assert!(!halted.is_finished());
        assert_eq!(
            harness.statuses("Contacts"),
            vec![RowStatus::Created, RowStatus::Created, RowStatus::None, RowStatus::None, RowStatus::None]
        );
        let first_two: Vec<_> = harness.staging.rows(harness.user_id, "Contacts")[..2]
            .iter()
            .map(|r| r.record_id)
            .collect();

        harness.records.clear_failures();
        let counts = executor.run(job.id).await.unwrap();

        assert_eq!(counts.created, 5);
        assert!(harness.statuses("Contacts").iter().all(|s| *s == RowStatus::Created));
        let rows = harness.staging.rows(harness.user_id, "Contacts");
        assert_eq!(rows[0].record_id, first_two[0]);
        assert_eq!(rows[1].record_id, first_two[1]);
        assert_eq!(harness.records.live_count("Contacts"), 5);
    }

    #[tokio::test]
    async fn test_duplicate_contacts_resolve_through_cache() {
        let harness = Harness::new();
        let rows = vec![
            row(&[("lastname", "Novak"), ("firstname", "Petr"), ("email", "petr@example.com")]),
            row(&[("lastname", "NOVAK"), ("firstname", "petr"), ("email", "PETR@example.com")]),
        ];
        harness.stage("Contacts", &CONTACT_FIELDS, rows).await;
        let job = harness.enqueue("Contacts", JobStatus::None).await;

        let counts = executor(&harness).run(job.id).await.unwrap();

        assert_eq!(counts, ImportCounts { total: 2, created: 1, failed: 0, skipped: 1 });
        let rows = harness.staging.rows(harness.user_id, "Contacts");
        assert_eq!(rows[1].status, RowStatus::Skipped);
        assert_eq!(rows[1].record_id, rows[0].record_id);
        assert_eq!(harness.records.live_count("Contacts"), 1);
    }

    #[tokio::test]
    async fn test_finished_job_is_not_rerun() {
        let harness = Harness::new();
        harness.stage("Contacts", &CONTACT_FIELDS, contacts(2)).await;
        let job = harness.enqueue("Contacts", JobStatus::None).await;
        let executor = executor(&harness);

        executor.run(job.id).await.unwrap();
        let counts = executor.run(job.id).await.unwrap();

        assert_eq!(counts.created, 2);
        assert_eq!(harness.records.live_count("Contacts"), 2);
    }

    #[tokio::test]
    async fn test_run_requires_import_permission() {
        let mut harness = Harness::new();
        harness.records = Arc::new(crate::services::records::MemoryRecordStore::restricted());
        harness.stage("Contacts", &CONTACT_FIELDS, contacts(2)).await;
        let job = harness.enqueue("Contacts", JobStatus::None).await;

        let err = executor(&harness).run(job.id).await.unwrap_err();

        assert!(matches!(err, ImportError::PermissionDenied { .. }));
        let job = harness.queue.get(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Halted);
        assert!(!job.is_finished());
        assert!(harness.statuses("Contacts").iter().all(|s| *s == RowStatus::None));
        assert!(harness.queue.get_active_job("Contacts", harness.user_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resumed_inventory_run_attaches_to_earlier_record() {
        let harness = Harness::new();
        harness
            .stage(
                "Invoice",
                &["subject", "productname"],
                vec![
                    row(&[("subject", "INV-1"), ("productname", "A")]),
                    row(&[("subject", "INV-2"), ("productname", "B")]),
                    row(&[("subject", "INV-1"), ("productname", "C")]),
                ],
            )
            .await;
        let job = harness.enqueue("Invoice", JobStatus::None).await;
        harness.records.fail_create_when("subject", "INV-2");
        let executor = executor(&harness);

        assert!(executor.run(job.id).await.is_err());
        assert_eq!(
            harness.statuses("Invoice"),
            vec![RowStatus::Created, RowStatus::None, RowStatus::None]
        );

        harness.records.clear_failures();
        let counts = executor.run(job.id).await.unwrap();

        assert_eq!(counts, ImportCounts { total: 3, created: 3, failed: 0, skipped: 0 });
        let rows = harness.staging.rows(harness.user_id, "Invoice");
        assert_eq!(rows[2].record_id, rows[0].record_id);
        assert_ne!(rows[1].record_id, rows[0].record_id);
        assert_eq!(harness.records.live_count("Invoice"), 2);
    }

    struct SkipEverything;

    #[async_trait]
    impl ImportStrategy for SkipEverything {
        fn name(&self) -> &str {
            "skip-everything"
        }

        async fn convert(&self, _run: &mut ImportRun, _row: &StagedRow) -> Result<RowOutcome, ImportError> {
            Ok(RowOutcome::Skipped(None))
        }
    }

    #[tokio::test]
    async fn test_registered_strategy_replaces_default() {
        let harness = Harness::new();
        harness.stage("Leads", &["company"], vec![row(&[("company", "Acme")]); 3]).await;
        let job = harness.enqueue("Leads", JobStatus::None).await;

        let mut registry = StrategyRegistry::with_builtin(&[]);
        registry.register("Leads", Arc::new(SkipEverything));
        let executor = ImportExecutor::new(harness.backends(), Arc::new(registry), ImportSettings::default());

        let counts = executor.run(job.id).await.unwrap();

        assert_eq!(counts, ImportCounts { total: 3, created: 0, failed: 0, skipped: 3 });
        assert_eq!(harness.records.live_count("Leads"), 0);
    }

    #[tokio::test]
    async fn test_small_batches_still_cover_every_row() {
        let harness = Harness::new();
        harness.stage("Contacts", &CONTACT_FIELDS, contacts(7)).await;
        let job = harness.enqueue("Contacts", JobStatus::None).await;
        let settings = ImportSettings {
            batch_size: 2,
            ..ImportSettings::default()
        };
        let executor = ImportExecutor::new(
            harness.backends(),
            Arc::new(StrategyRegistry::with_builtin(&settings.inventory_modules)),
            settings,
        );

        let counts = executor.run(job.id).await.unwrap();
        assert_eq!(counts.created, 7);
    }
}
