//! Wire-level helpers: JSON conversion and paginated collections.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::warn;

/// Re-serialize a value through JSON to convert between compatible types.
pub fn reserialize<T: DeserializeOwned>(value: impl Serialize) -> serde_json::Result<T> {
  serde_json::from_value(serde_json::to_value(value)?)
}

/// Which slice of a collection to ask for. Pages are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
  pub page: u32,
  pub page_size: u32,
}

impl PageRequest {
  pub const DEFAULT_PAGE_SIZE: u32 = 20;

  pub fn new(page: u32, page_size: u32) -> Self {
    Self {
      page: page.max(1),
      page_size: page_size.max(1),
    }
  }

  pub fn skip(&self) -> u64 {
    u64::from(self.page.saturating_sub(1)) * u64::from(self.page_size)
  }

  pub fn limit(&self) -> u64 {
    u64::from(self.page_size)
  }
}

impl Default for PageRequest {
  fn default() -> Self {
    Self::new(1, Self::DEFAULT_PAGE_SIZE)
  }
}

/// One page of a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
  pub items: Vec<T>,
  /// Size of the whole collection on the server.
  pub total: u64,
  pub skip: u64,
  pub limit: u64,
}

impl<T> Page<T> {
  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  /// Whether more items exist past this page.
  pub fn has_more(&self) -> bool {
    self.skip + (self.items.len() as u64) < self.total
  }
}

/// Collections come either wrapped in an envelope or as a bare array,
/// depending on the server version.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub(crate) enum WirePage<T> {
  Envelope {
    items: Vec<T>,
    total: u64,
    #[serde(default)]
    skip: Option<u64>,
    #[serde(default)]
    limit: Option<u64>,
  },
  Bare(Vec<T>),
}

impl<T> WirePage<T> {
  /// Normalize into a `Page` for the slice that was requested.
  pub fn into_page(self, request: PageRequest) -> Page<T> {
    let (mut items, total, skip, limit) = match self {
      WirePage::Envelope {
        items,
        total,
        skip,
        limit,
      } => (
        items,
        Some(total),
        skip.unwrap_or(request.skip()),
        limit.unwrap_or(request.limit()),
      ),
      WirePage::Bare(items) => (items, None, request.skip(), request.limit()),
    };

    let cap = usize::try_from(limit).unwrap_or(usize::MAX);
    if items.len() > cap {
      warn!(received = items.len(), limit, "server returned more items than requested, truncating");
      items.truncate(cap);
    }

    let total = total.unwrap_or(skip + items.len() as u64);
    Page {
      items,
      total,
      skip,
      limit,
    }
  }
}
