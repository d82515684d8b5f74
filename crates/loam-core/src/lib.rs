//! loam-core - Core library for Loam
//!
//! This crate contains the item models, the on-device item store, the storage
//! drivers and the synchronization engine used by the Loam CLI.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod storage;
pub mod sync;
pub mod util;

pub use error::{Error, Result};
pub use models::{Item, ItemId, ItemType};
