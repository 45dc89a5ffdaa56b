//! Shared data model for the stockgen pipeline: requests, attempts, outcomes,
//! persisted records, the provider catalog and run configuration.

pub mod config;
pub mod events;
pub mod generation;
pub mod providers;
pub mod records;
