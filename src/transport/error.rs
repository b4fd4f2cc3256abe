//! Normalized failure taxonomy for API calls.

use serde::Deserialize;
use std::time::Duration;

/// Coarse failure class, used by the query layer to decide on retries and by
/// callers that only care about the category of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
  Canceled,
  Network,
  Unauthenticated,
  RateLimited,
  Server,
  Request,
  InvalidResponse,
}

/// A classified API failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
  /// Superseded by a newer identical request, or aborted by the caller.
  #[error("request canceled")]
  Canceled,
  /// No response was received.
  #[error("network error: {0}")]
  Network(String),
  /// No response within the transport timeout.
  #[error("request timed out after {0:?}")]
  TimedOut(Duration),
  #[error("{0}")]
  Unauthenticated(String),
  #[error("rate limited: {0}")]
  RateLimited(String),
  #[error("server error ({status}): {message}")]
  Server { status: u16, message: String },
  #[error("request failed ({status}): {message}")]
  Request { status: u16, message: String },
  /// The descriptor could not be turned into a request; nothing was sent.
  #[error("invalid request: {0}")]
  InvalidRequest(String),
  /// A 2xx response whose body could not be decoded.
  #[error("invalid response: {0}")]
  InvalidResponse(String),
}

impl ApiError {
  pub fn kind(&self) -> ErrorKind {
    match self {
      Self::Canceled => ErrorKind::Canceled,
      Self::Network(_) | Self::TimedOut(_) => ErrorKind::Network,
      Self::Unauthenticated(_) => ErrorKind::Unauthenticated,
      Self::RateLimited(_) => ErrorKind::RateLimited,
      Self::Server { .. } => ErrorKind::Server,
      Self::Request { .. } | Self::InvalidRequest(_) => ErrorKind::Request,
      Self::InvalidResponse(_) => ErrorKind::InvalidResponse,
    }
  }

  /// HTTP status associated with the failure, if a response was received.
  pub fn status(&self) -> Option<u16> {
    match self {
      Self::Unauthenticated(_) => Some(401),
      Self::RateLimited(_) => Some(429),
      Self::Server { status, .. } | Self::Request { status, .. } => Some(*status),
      _ => None,
    }
  }

  /// Human-readable message suitable for a status line or toast.
  pub fn message(&self) -> String {
    match self {
      Self::Unauthenticated(message)
      | Self::RateLimited(message)
      | Self::Network(message)
      | Self::InvalidRequest(message)
      | Self::InvalidResponse(message) => message.clone(),
      Self::Server { message, .. } | Self::Request { message, .. } => message.clone(),
      Self::Canceled | Self::TimedOut(_) => self.to_string(),
    }
  }

  /// Whether a read that failed this way is worth retrying.
  pub fn is_transient(&self) -> bool {
    matches!(self.kind(), ErrorKind::Network | ErrorKind::Server)
  }

  pub(crate) fn decode(err: serde_json::Error) -> Self {
    Self::InvalidResponse(err.to_string())
  }
}

/// Classify a non-2xx HTTP status. Returns `None` for success statuses.
pub(crate) fn classify_status(status: u16, body: &[u8]) -> Option<ApiError> {
  if (200..300).contains(&status) {
    return None;
  }

  let message = error_message(status, body);
  let error = match status {
    401 => ApiError::Unauthenticated(message),
    429 => ApiError::RateLimited(message),
    s if s >= 500 => ApiError::Server { status, message },
    _ => ApiError::Request { status, message },
  };
  Some(error)
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Detail {
  Text(String),
  Items(Vec<DetailItem>),
}

#[derive(Debug, Deserialize)]
struct DetailItem {
  msg: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
  detail: Option<Detail>,
  message: Option<String>,
}

/// Extract the server-provided message from an error body.
///
/// Understands `{"detail": "..."}`, validation lists of the form
/// `{"detail": [{"msg": "..."}]}` and `{"message": "..."}`. Anything else
/// falls back to the canonical reason phrase for the status.
fn error_message(status: u16, body: &[u8]) -> String {
  let parsed: Option<ErrorBody> = serde_json::from_slice(body).ok();

  let message = parsed.and_then(|body| match body.detail {
    Some(Detail::Text(text)) => Some(text),
    Some(Detail::Items(items)) if !items.is_empty() => Some(
      items
        .into_iter()
        .map(|item| item.msg)
        .collect::<Vec<_>>()
        .join("; "),
    ),
    _ => body.message,
  });

  match message {
    Some(m) if !m.trim().is_empty() => m,
    _ => reqwest::StatusCode::from_u16(status)
      .ok()
      .and_then(|s| s.canonical_reason())
      .map(String::from)
      .unwrap_or_else(|| format!("HTTP {}", status)),
  }
}
