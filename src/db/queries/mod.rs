//! Database queries

pub mod import_queue;
pub mod records;
pub mod staging;
