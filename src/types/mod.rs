//! Type definitions

pub mod import_job;
pub mod messages;
pub mod staging;
pub mod status;
pub mod view;

pub use import_job::*;
pub use messages::*;
pub use staging::*;
pub use status::*;
pub use view::*;
