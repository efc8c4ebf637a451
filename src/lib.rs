//! Collects concert dates for tracked artists from their websites, a
//! listings site, newsletters and a personal inbox, and merges them into
//! one deduplicated SQLite store.

pub mod cache;
pub mod config;
pub mod dates;
pub mod db;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod mail;
pub mod pipeline;
pub mod reconcile;
pub mod sources;
