pub mod models;
pub mod store;

pub use models::*;
pub use store::{IndexStore, LoadStatus, StoreLock, LOCK_FILENAME, STORE_FILENAME, TEMP_FILENAME};
