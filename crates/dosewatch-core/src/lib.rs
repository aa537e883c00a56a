//! `dosewatch-core`: identifiers, configuration and error types shared by
//! the scheduler engine and the gateway binary.

pub mod config;
pub mod error;
pub mod types;

pub use config::DosewatchConfig;
pub use error::{DosewatchError, Result};
pub use types::{OwnerId, ReminderId};
