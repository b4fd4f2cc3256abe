//! Client-side access layer for the IMS inventory API.
//!
//! [`transport`] issues authenticated, de-duplicated HTTP calls and
//! normalizes their failures. [`cache`] and [`query`] keep API reads fresh
//! without re-fetching on every access. [`api`] ties both together into
//! typed clients for each resource.

pub mod api;
pub mod cache;
pub mod config;
pub mod db;
pub mod query;
pub mod session;
pub mod transport;
