//! The HTTP seam underneath the transport.
//!
//! `Transport` only needs "send these bytes, give me a status and a body".
//! Keeping that behind a trait lets the request pipeline be exercised without
//! a live server.

use std::future::Future;
use std::time::Duration;
use url::Url;

use super::request::Method;

/// A fully resolved outbound request.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
  pub method: Method,
  pub url: Url,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
}

impl HttpRequest {
  /// Look up a header value (case-insensitive name).
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
  pub status: u16,
  pub body: Vec<u8>,
}

/// Failure to obtain any response at all.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct BackendError(pub String);

/// Something that can carry an `HttpRequest` to the server.
pub trait HttpBackend: Send + Sync + 'static {
  fn send(
    &self,
    request: HttpRequest,
  ) -> impl Future<Output = Result<HttpResponse, BackendError>> + Send;
}

/// Production backend built on `reqwest`.
#[derive(Clone)]
pub struct ReqwestBackend {
  client: reqwest::Client,
}

impl ReqwestBackend {
  pub fn new(connect_timeout: Duration) -> Result<Self, BackendError> {
    let client = reqwest::Client::builder()
      .connect_timeout(connect_timeout)
      .user_agent(concat!("ims/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| BackendError(format!("Failed to build HTTP client: {}", e)))?;
    Ok(Self { client })
  }
}

impl HttpBackend for ReqwestBackend {
  async fn send(&self, request: HttpRequest) -> Result<HttpResponse, BackendError> {
    let mut builder = self.client.request(request.method.into(), request.url);
    for (name, value) in &request.headers {
      builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(body) = request.body {
      builder = builder.body(body);
    }

    let response = builder.send().await.map_err(|e| BackendError(e.to_string()))?;
    let status = response.status().as_u16();
    let body = response
      .bytes()
      .await
      .map_err(|e| BackendError(format!("Failed to read response body: {}", e)))?;

    Ok(HttpResponse {
      status,
      body: body.to_vec(),
    })
  }
}
