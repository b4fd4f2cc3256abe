//! Request descriptors and their identity keys.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

use super::error::ApiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
  Get,
  Post,
  Put,
  Delete,
}

impl Method {
  pub fn as_str(&self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Delete => "DELETE",
    }
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl From<Method> for reqwest::Method {
  fn from(method: Method) -> Self {
    match method {
      Method::Get => reqwest::Method::GET,
      Method::Post => reqwest::Method::POST,
      Method::Put => reqwest::Method::PUT,
      Method::Delete => reqwest::Method::DELETE,
    }
  }
}

/// Description of a single API call, relative to the API base URL.
///
/// Descriptors are built up front and never change once handed to the
/// transport. Reads are de-duplicated by default, writes are not.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestDescriptor {
  method: Method,
  path: String,
  query: Vec<(String, String)>,
  body: Option<Value>,
  dedupe: bool,
}

impl RequestDescriptor {
  pub fn new(method: Method, path: impl Into<String>) -> Self {
    Self {
      method,
      path: path.into(),
      query: Vec::new(),
      body: None,
      dedupe: method == Method::Get,
    }
  }

  pub fn get(path: impl Into<String>) -> Self {
    Self::new(Method::Get, path)
  }

  pub fn post(path: impl Into<String>) -> Self {
    Self::new(Method::Post, path)
  }

  pub fn put(path: impl Into<String>) -> Self {
    Self::new(Method::Put, path)
  }

  pub fn delete(path: impl Into<String>) -> Self {
    Self::new(Method::Delete, path)
  }

  /// Append a query parameter.
  pub fn with_query(mut self, name: impl Into<String>, value: impl ToString) -> Self {
    self.query.push((name.into(), value.to_string()));
    self
  }

  /// Attach a JSON body.
  pub fn with_json<T: Serialize + ?Sized>(mut self, body: &T) -> Result<Self, ApiError> {
    let value =
      serde_json::to_value(body).map_err(|e| ApiError::InvalidRequest(e.to_string()))?;
    self.body = Some(value);
    Ok(self)
  }

  /// Override whether identical in-flight calls supersede each other.
  pub fn deduplicated(mut self, dedupe: bool) -> Self {
    self.dedupe = dedupe;
    self
  }

  pub fn method(&self) -> Method {
    self.method
  }

  pub fn path(&self) -> &str {
    &self.path
  }

  pub fn query(&self) -> &[(String, String)] {
    &self.query
  }

  pub fn body(&self) -> Option<&Value> {
    self.body.as_ref()
  }

  pub fn is_deduplicated(&self) -> bool {
    self.dedupe
  }

  /// Check the path can be resolved against the API base.
  pub fn validate(&self) -> Result<(), ApiError> {
    if !self.path.starts_with('/') {
      return Err(ApiError::InvalidRequest(format!(
        "path must start with '/': {:?}",
        self.path
      )));
    }
    if self.path.contains(['?', '#']) {
      return Err(ApiError::InvalidRequest(format!(
        "query parameters belong in the descriptor, not the path: {:?}",
        self.path
      )));
    }
    Ok(())
  }

  /// Stable identity used to spot duplicate in-flight requests.
  ///
  /// Query parameters are sorted so that parameter order does not matter;
  /// JSON object keys are already ordered by `serde_json`.
  pub fn identity_key(&self) -> String {
    let mut query = self.query.clone();
    query.sort();
    let query = query
      .iter()
      .map(|(k, v)| format!("{}={}", k, v))
      .collect::<Vec<_>>()
      .join("&");
    let body = self
      .body
      .as_ref()
      .map(Value::to_string)
      .unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(self.method.as_str().as_bytes());
    hasher.update(b"\n");
    hasher.update(self.path.as_bytes());
    hasher.update(b"\n");
    hasher.update(query.as_bytes());
    hasher.update(b"\n");
    hasher.update(body.as_bytes());
    hex::encode(hasher.finalize())
  }
}
