// Chronicle Engine - Core module structure
pub mod audit;
pub mod cli;
pub mod config;
pub mod database;
pub mod entity;
pub mod error;
pub mod unit_of_work;

pub use config::Config;
pub use database::Database;
pub use error::{AuditError, Result};
