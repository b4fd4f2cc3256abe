//! Typed access to the IMS REST API, plain and cached.

mod cached_client;
mod client;
mod resources;
mod types;
mod wire;

pub use cached_client::CachedImsClient;
pub use client::{ImsClient, StockDirection};
pub use resources::Resource;
pub use types::*;
pub use wire::{reserialize, Page, PageRequest};
