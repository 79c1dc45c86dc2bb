//! Tabula common types, errors, and configuration.
//!
//! This crate provides shared definitions used across all Tabula components.

pub mod config;
pub mod error;
pub mod page;
pub mod types;

pub use config::{BulkConfig, IndexConfig};
pub use error::{Result, TabulaError};
pub use page::{PageId, PageKind, DEFAULT_PAGE_SIZE};
pub use types::{ColumnType, RowId, Value};
