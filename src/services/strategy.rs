//! Per-module import strategies
//!
//! A strategy converts staged rows of one module into records and undoes
//! them again. Modules without a registered strategy use `DefaultStrategy`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use super::executor::ImportRun;
use super::undo::{default_undo, UndoContext};
use crate::defaults::INVENTORY_GROUP_FIELD;
use crate::error::ImportError;
use crate::types::{MergePolicy, StagedRow, UndoReport};

/// Successful conversion of one row
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowOutcome {
    /// A record was created (or the row was attached to one created by
    /// this run)
    Created(Uuid),
    /// Deliberate no-op, usually because the row matched an existing
    /// record. Skipped rows are never undone.
    Skipped(Option<Uuid>),
}

#[async_trait]
pub trait ImportStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Staging columns to use when a stage request does not name any
    fn describe_fields(&self) -> Option<Vec<String>> {
        None
    }

    /// Convert one row. Return `ImportError::RowConversion` for problems
    /// with the row itself; any other error halts the job.
    async fn convert(&self, run: &mut ImportRun, row: &StagedRow) -> Result<RowOutcome, ImportError>;

    /// Process every pending row of the run
    async fn import(&self, run: &mut ImportRun) -> Result<(), ImportError> {
        loop {
            let batch = run.next_batch().await?;
            if batch.is_empty() {
                return Ok(());
            }
            for row in &batch {
                let outcome = self.convert(run, row).await;
                run.record_outcome(row, outcome).await?;
            }
        }
    }

    /// Delete what the job created
    async fn undo(&self, ctx: &UndoContext) -> Result<UndoReport, ImportError> {
        default_undo(ctx).await
    }
}

/// Module name -> strategy, with a fallback for everything else
pub struct StrategyRegistry {
    strategies: HashMap<String, Arc<dyn ImportStrategy>>,
    fallback: Arc<dyn ImportStrategy>,
}

impl StrategyRegistry {
    pub fn new(fallback: Arc<dyn ImportStrategy>) -> Self {
        Self {
            strategies: HashMap::new(),
            fallback,
        }
    }

    /// Registry with the built-in Contacts and inventory strategies
    pub fn with_builtin(inventory_modules: &[String]) -> Self {
        let mut registry = Self::new(Arc::new(DefaultStrategy));
        registry.register("Contacts", Arc::new(ContactsStrategy));
        let inventory: Arc<dyn ImportStrategy> = Arc::new(InventoryStrategy);
        for module in inventory_modules {
            registry.register(module, inventory.clone());
        }
        registry
    }

    pub fn register(&mut self, module: &str, strategy: Arc<dyn ImportStrategy>) {
        self.strategies.insert(module.to_string(), strategy);
    }

    pub fn strategy_for(&self, module: &str) -> Arc<dyn ImportStrategy> {
        self.strategies
            .get(module)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }

    pub fn fields_for(&self, module: &str) -> Option<Vec<String>> {
        self.strategy_for(module).describe_fields()
    }
}

fn field_list(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

// =============================================================================
// Built-in strategies
// =============================================================================

/// One record per row, no dedup
pub struct DefaultStrategy;

#[async_trait]
impl ImportStrategy for DefaultStrategy {
    fn name(&self) -> &str {
        "default"
    }

    async fn convert(&self, run: &mut ImportRun, row: &StagedRow) -> Result<RowOutcome, ImportError> {
        if row.fields.values().all(|v| v.trim().is_empty()) {
            return Err(ImportError::row(row.id, "row has no values"));
        }
        let id = run.create_record(&row.fields).await?;
        Ok(RowOutcome::Created(id))
    }
}

/// Contacts are matched on (last name, first name, email), ignoring case
pub struct ContactsStrategy;

#[async_trait]
impl ImportStrategy for ContactsStrategy {
    fn name(&self) -> &str {
        "contacts"
    }

    fn describe_fields(&self) -> Option<Vec<String>> {
        Some(field_list(&["lastname", "firstname", "email", "phone", "title", "account_name"]))
    }

    async fn convert(&self, run: &mut ImportRun, row: &StagedRow) -> Result<RowOutcome, ImportError> {
        let lastname = row
            .value("lastname")
            .ok_or_else(|| ImportError::row(row.id, "missing lastname"))?;
        let firstname = row.value("firstname");
        let email = row.value("email");
        if let Some(email) = email {
            if !email.contains('@') {
                return Err(ImportError::row(row.id, format!("invalid email {}", email)));
            }
        }

        let key = [
            lastname.to_uppercase(),
            firstname.unwrap_or_default().to_uppercase(),
            email.unwrap_or_default().to_lowercase(),
        ];
        let key_parts: Vec<&str> = key.iter().map(String::as_str).collect();

        let mut criteria = vec![("lastname", lastname)];
        if let Some(firstname) = firstname {
            criteria.push(("firstname", firstname));
        }
        if let Some(email) = email {
            criteria.push(("email", email));
        }

        if let Some(existing) = run.find_existing(&key_parts, &criteria).await? {
            run.merge_into(existing, &row.fields).await?;
            return Ok(RowOutcome::Skipped(Some(existing)));
        }

        let id = run.create_record(&row.fields).await?;
        run.remember(&key_parts, id);
        Ok(RowOutcome::Created(id))
    }
}

/// Inventory rows are line fragments; fragments sharing a subject belong
/// to one record
pub struct InventoryStrategy;

#[async_trait]
impl ImportStrategy for InventoryStrategy {
    fn name(&self) -> &str {
        "inventory"
    }

    fn describe_fields(&self) -> Option<Vec<String>> {
        Some(field_list(&[INVENTORY_GROUP_FIELD, "account_name", "productname", "quantity", "listprice"]))
    }

    async fn convert(&self, run: &mut ImportRun, row: &StagedRow) -> Result<RowOutcome, ImportError> {
        let subject = row
            .value(INVENTORY_GROUP_FIELD)
            .ok_or_else(|| ImportError::row(row.id, format!("missing {}", INVENTORY_GROUP_FIELD)))?;

        match run.find_existing(&[subject], &[(INVENTORY_GROUP_FIELD, subject)]).await? {
            Some(id) if run.created_in_run(id) => {
                run.update_record(id, &row.fields, MergePolicy::Merge).await?;
                Ok(RowOutcome::Created(id))
            }
            Some(existing) => {
                run.merge_into(existing, &row.fields).await?;
                Ok(RowOutcome::Skipped(Some(existing)))
            }
            None => {
                let id = run.create_record(&row.fields).await?;
                run.remember(&[subject], id);
                Ok(RowOutcome::Created(id))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ImportSettings;
    use crate::services::testing::{row, Harness};
    use crate::types::{JobStatus, RowStatus};

    #[test]
    fn test_registry_falls_back_to_default() {
        let registry = StrategyRegistry::with_builtin(&["Invoice".to_string()]);
        assert_eq!(registry.strategy_for("Contacts").name(), "contacts");
        assert_eq!(registry.strategy_for("Invoice").name(), "inventory");
        assert_eq!(registry.strategy_for("Leads").name(), "default");
        assert!(registry.fields_for("Leads").is_none());
        assert!(registry.fields_for("Invoice").unwrap().contains(&"subject".to_string()));
    }

    #[tokio::test]
    async fn test_inventory_fragments_share_one_record() {
        let harness = Harness::new();
        harness
            .stage(
                "Invoice",
                &["subject", "productname"],
                vec![
                    row(&[("subject", "INV-1"), ("productname", "Bolt")]),
                    row(&[("subject", "INV-1"), ("productname", "Nut")]),
                    row(&[("subject", "INV-2"), ("productname", "Gear")]),
                    row(&[("productname", "Orphan")]),
                ],
            )
            .await;
        let job = harness.enqueue("Invoice", JobStatus::Running).await;
        let mut run = ImportRun::new(
            job,
            harness.staging.clone(),
            harness.records.clone(),
            &ImportSettings::default(),
        );

        InventoryStrategy.import(&mut run).await.unwrap();

        let rows = harness.staging.rows(harness.user_id, "Invoice");
        assert_eq!(rows[0].status, RowStatus::Created);
        assert_eq!(rows[1].status, RowStatus::Created);
        assert_eq!(rows[0].record_id, rows[1].record_id);
        assert_ne!(rows[0].record_id, rows[2].record_id);
        assert_eq!(rows[3].status, RowStatus::Failed);
        assert_eq!(harness.records.live_count("Invoice"), 2);
        assert_eq!(run.tally().processed(), 4);
    }

    #[tokio::test]
    async fn test_existing_contact_is_skipped_and_merged() {
        let harness = Harness::new();
        harness
            .stage(
                "Contacts",
                &["lastname", "firstname", "email", "phone"],
                vec![row(&[("lastname", "Doe"), ("firstname", "Jane"), ("phone", "555")])],
            )
            .await;
        let existing = {
            use crate::services::records::{RecordStore, SaveMode};
            harness
                .records
                .create(harness.user_id, "Contacts", &row(&[("lastname", "DOE"), ("firstname", "jane")]), SaveMode::Bulk)
                .await
                .unwrap()
        };

        let mut job = harness.enqueue("Contacts", JobStatus::Running).await;
        job.merge_policy = MergePolicy::Merge;
        let mut run = ImportRun::new(
            job,
            harness.staging.clone(),
            harness.records.clone(),
            &ImportSettings::default(),
        );

        ContactsStrategy.import(&mut run).await.unwrap();

        let rows = harness.staging.rows(harness.user_id, "Contacts");
        assert_eq!(rows[0].status, RowStatus::Skipped);
        assert_eq!(rows[0].record_id, Some(existing));
        let record = harness.records.record(existing).unwrap();
        assert_eq!(record.fields["lastname"], "DOE");
        assert_eq!(record.fields["phone"], "555");
    }
}
