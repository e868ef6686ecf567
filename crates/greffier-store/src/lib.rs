pub mod database;
pub mod keys;
pub mod meetings;
pub mod migrations;
pub mod models;
pub mod revisions;

mod error;

pub use database::Database;
pub use error::StoreError;
pub use models::*;
