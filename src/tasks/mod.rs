//! Background Tasks Module
//!
//! Contains background tasks that run periodically during server operation.
//!
//! # Tasks
//! - Expiry Cleanup: Purges expired local entries and dead tag index mappings

mod cleanup;

pub use cleanup::spawn_cleanup_task;
