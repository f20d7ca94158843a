/// Staged rows above this count are deferred to the scheduler
pub const DEFAULT_IMMEDIATE_IMPORT_LIMIT: u64 = 1000;

pub const DEFAULT_DEDUP_CACHE_MAX: usize = 1024;

pub const DEFAULT_PREVIEW_LIMIT: usize = 12;

/// Pending rows fetched per executor round trip
pub const DEFAULT_BATCH_SIZE: usize = 250;

/// Scheduled jobs resumed per scheduler pass
pub const DEFAULT_SCHEDULED_BATCH: usize = 10;

/// Column inventory rows are grouped by
pub const INVENTORY_GROUP_FIELD: &str = "subject";

pub fn default_inventory_modules() -> Vec<String> {
    ["Invoice", "SalesOrder", "PurchaseOrder", "Quotes"]
        .iter()
        .map(|m| m.to_string())
        .collect()
}
