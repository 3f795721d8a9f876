//! Application configuration
//!
//! A JSON file holds an [`AppConfig`]; [`ConfigStore`] keeps the current
//! snapshot in memory and persists changes.

mod schema;
mod store;

pub use schema::*;
pub use store::ConfigStore;
