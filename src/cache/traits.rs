//! Core traits and types for the caching system.

use serde::{de::DeserializeOwned, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Values that can live in the query cache.
///
/// Entries are stored as JSON so one cache can hold every resource type;
/// anything that round-trips through serde qualifies.
pub trait Cacheable: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

impl<T> Cacheable for T where T: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {}

/// One segment of a query key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyPart {
  Str(String),
  Int(i64),
}

impl fmt::Display for KeyPart {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      KeyPart::Str(s) => write!(f, "{:?}", s),
      KeyPart::Int(n) => write!(f, "{}", n),
    }
  }
}

impl From<&str> for KeyPart {
  fn from(s: &str) -> Self {
    KeyPart::Str(s.to_string())
  }
}

impl From<String> for KeyPart {
  fn from(s: String) -> Self {
    KeyPart::Str(s)
  }
}

macro_rules! int_key_part {
  ($($t:ty),*) => {
    $(
      impl From<$t> for KeyPart {
        fn from(n: $t) -> Self {
          KeyPart::Int(n as i64)
        }
      }
    )*
  };
}

int_key_part!(i32, i64, u32, u64, usize);

/// Logical identity of a cached resource, e.g. `["products", 1, 20]`.
///
/// Keys are hierarchical: invalidating `["products"]` hits every key that
/// starts with it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey(Vec<KeyPart>);

impl QueryKey {
  pub fn new(root: impl Into<KeyPart>) -> Self {
    Self(vec![root.into()])
  }

  pub fn from_parts<I, P>(parts: I) -> Self
  where
    I: IntoIterator<Item = P>,
    P: Into<KeyPart>,
  {
    Self(parts.into_iter().map(Into::into).collect())
  }

  /// Extend the key with another segment.
  pub fn with(mut self, part: impl Into<KeyPart>) -> Self {
    self.0.push(part.into());
    self
  }

  pub fn parts(&self) -> &[KeyPart] {
    &self.0
  }

  /// Whether `prefix` is a (non-strict) prefix of this key.
  pub fn starts_with(&self, prefix: &QueryKey) -> bool {
    self.0.starts_with(&prefix.0)
  }
}

impl fmt::Display for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str("[")?;
    for (i, part) in self.0.iter().enumerate() {
      if i > 0 {
        f.write_str(", ")?;
      }
      write!(f, "{}", part)?;
    }
    f.write_str("]")
  }
}

impl From<&str> for QueryKey {
  fn from(root: &str) -> Self {
    QueryKey::new(root)
  }
}

/// Build a `QueryKey` from a list of segments: `query_key!["products", 1, 20]`.
#[macro_export]
macro_rules! query_key {
  ($($part:expr),+ $(,)?) => {
    $crate::cache::QueryKey::from_parts([$($crate::cache::KeyPart::from($part)),+])
  };
}

/// How trustworthy a cache entry is right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
  /// Fetched within the freshness window; served without a network call.
  Fresh,
  /// Older than the freshness window; served, but the next read re-fetches.
  Stale,
  /// Never fetched, or invalidated since the last fetch.
  Absent,
}

impl Freshness {
  pub fn evaluate(
    fetched_at: Option<Instant>,
    invalidated: bool,
    window: Duration,
    now: Instant,
  ) -> Self {
    match fetched_at {
      None => Freshness::Absent,
      Some(_) if invalidated => Freshness::Absent,
      Some(at) if now.saturating_duration_since(at) < window => Freshness::Fresh,
      Some(_) => Freshness::Stale,
    }
  }
}
