pub mod cancel;
pub mod checksum;
pub mod config;
pub mod document;
pub mod error;
pub mod fetch;
pub mod planner;
pub mod script;
pub mod status;
pub mod workspace;

pub use error::{Error, Result};
