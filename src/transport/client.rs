//! The request pipeline: auth header, de-duplication, timeout, classification.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use super::backend::{HttpBackend, HttpRequest, HttpResponse, ReqwestBackend};
use super::error::{classify_status, ApiError, ErrorKind};
use super::inflight::InflightRegistry;
use super::request::RequestDescriptor;
use crate::session::SessionContext;

/// Default bound on a single call.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Terminal state of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
  Pending,
  Succeeded,
  Canceled,
  TimedOut,
  Failed(ErrorKind),
}

impl RequestState {
  pub fn of<T>(outcome: &Result<T, ApiError>) -> Self {
    match outcome {
      Ok(_) => Self::Succeeded,
      Err(ApiError::Canceled) => Self::Canceled,
      Err(ApiError::TimedOut(_)) => Self::TimedOut,
      Err(e) => Self::Failed(e.kind()),
    }
  }
}

struct TransportInner<B> {
  backend: B,
  base_url: Url,
  session: SessionContext,
  timeout: Duration,
  inflight: InflightRegistry,
}

/// Turns request descriptors into settled outcomes.
///
/// Cloning is cheap; clones share the in-flight registry and session.
pub struct Transport<B: HttpBackend = ReqwestBackend> {
  inner: Arc<TransportInner<B>>,
}

impl<B: HttpBackend> Clone for Transport<B> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<B: HttpBackend> Transport<B> {
  /// Create a transport rooted at `base_url` (e.g. `http://host/api/v1`).
  pub fn new(backend: B, base_url: &str, session: SessionContext) -> Result<Self, ApiError> {
    let base_url = Url::parse(base_url.trim_end_matches('/'))
      .map_err(|e| ApiError::InvalidRequest(format!("invalid base URL {:?}: {}", base_url, e)))?;
    if base_url.cannot_be_a_base() {
      return Err(ApiError::InvalidRequest(format!(
        "base URL cannot carry paths: {}",
        base_url
      )));
    }

    Ok(Self {
      inner: Arc::new(TransportInner {
        backend,
        base_url,
        session,
        timeout: DEFAULT_TIMEOUT,
        inflight: InflightRegistry::default(),
      }),
    })
  }

  /// Set the per-call timeout. Only meaningful before the transport is shared.
  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    if let Some(inner) = Arc::get_mut(&mut self.inner) {
      inner.timeout = timeout;
    }
    self
  }

  pub fn session(&self) -> &SessionContext {
    &self.inner.session
  }

  pub fn base_url(&self) -> &Url {
    &self.inner.base_url
  }

  /// Number of de-duplicated requests currently in flight.
  pub fn in_flight(&self) -> usize {
    self.inner.inflight.len()
  }

  /// Issue a request and wait for its settled outcome.
  pub async fn issue(&self, descriptor: &RequestDescriptor) -> Result<Value, ApiError> {
    self
      .issue_with_cancel(descriptor, CancellationToken::new())
      .await
  }

  /// Issue a request that the caller may abort through `cancel`.
  pub async fn issue_with_cancel(
    &self,
    descriptor: &RequestDescriptor,
    cancel: CancellationToken,
  ) -> Result<Value, ApiError> {
    let request = self.prepare(descriptor)?;

    // Held until this call settles (or is dropped).
    let _slot = descriptor
      .is_deduplicated()
      .then(|| self.inner.inflight.register(descriptor.identity_key(), cancel.clone()));

    let started = Instant::now();
    let outcome = tokio::select! {
      biased;
      _ = cancel.cancelled() => Err(ApiError::Canceled),
      sent = tokio::time::timeout(self.inner.timeout, self.inner.backend.send(request)) => match sent {
        Err(_) => Err(ApiError::TimedOut(self.inner.timeout)),
        Ok(Err(e)) => Err(ApiError::Network(e.to_string())),
        Ok(Ok(response)) => decode(response),
      },
    };

    // A response that lands after we were superseded is not ours to report.
    let outcome = if cancel.is_cancelled() {
      Err(ApiError::Canceled)
    } else {
      outcome
    };

    if matches!(outcome, Err(ApiError::Unauthenticated(_))) {
      self.inner.session.expire();
    }

    let state = RequestState::of(&outcome);
    match &outcome {
      Ok(_) | Err(ApiError::Canceled) => debug!(
        method = %descriptor.method(),
        path = descriptor.path(),
        ?state,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "request settled"
      ),
      Err(e) => warn!(
        method = %descriptor.method(),
        path = descriptor.path(),
        ?state,
        "request failed: {}",
        e
      ),
    }

    outcome
  }

  /// Resolve a descriptor into a concrete HTTP request.
  fn prepare(&self, descriptor: &RequestDescriptor) -> Result<HttpRequest, ApiError> {
    descriptor.validate()?;

    let mut url = self.inner.base_url.clone();
    let path = format!("{}{}", url.path().trim_end_matches('/'), descriptor.path());
    url.set_path(&path);
    if !descriptor.query().is_empty() {
      url
        .query_pairs_mut()
        .extend_pairs(descriptor.query().iter().map(|(k, v)| (k.as_str(), v.as_str())));
    }

    let mut headers = vec![("Accept".to_string(), "application/json".to_string())];
    // Read the token once so the header is consistent for this request.
    if let Some(token) = self.inner.session.token() {
      headers.push(("Authorization".to_string(), format!("Bearer {}", token)));
    }

    let body = match descriptor.body() {
      Some(value) => {
        headers.push(("Content-Type".to_string(), "application/json".to_string()));
        Some(serde_json::to_vec(value).map_err(|e| ApiError::InvalidRequest(e.to_string()))?)
      }
      None => None,
    };

    Ok(HttpRequest {
      method: descriptor.method(),
      url,
      headers,
      body,
    })
  }
}

fn decode(response: HttpResponse) -> Result<Value, ApiError> {
  if let Some(error) = classify_status(response.status, &response.body) {
    return Err(error);
  }
  if response.body.iter().all(u8::is_ascii_whitespace) {
    return Ok(Value::Null);
  }
  serde_json::from_slice(&response.body).map_err(ApiError::decode)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::session::SessionEvent;
  use crate::transport::backend::fake::{FakeBackend, Reply, BASE_URL};
  use crate::transport::request::Method;
  use serde_json::json;
  use tokio::sync::broadcast::error::TryRecvError;

  fn transport(backend: &FakeBackend) -> Transport<FakeBackend> {
    Transport::new(backend.clone(), BASE_URL, SessionContext::in_memory()).unwrap()
  }

  #[tokio::test]
  async fn test_attaches_bearer_token_when_signed_in() {
    let backend = FakeBackend::new();
    backend.on(Method::Get, "/users", Reply::Json(200, json!([])));
    let transport = transport(&backend);

    transport.issue(&RequestDescriptor::get("/users")).await.unwrap();
    transport.session().set_token("t1").unwrap();
    transport.issue(&RequestDescriptor::get("/users")).await.unwrap();

    let requests = backend.requests();
    assert_eq!(requests[0].header("authorization"), None);
    assert_eq!(requests[1].header("authorization"), Some("Bearer t1"));
  }

  #[tokio::test]
  async fn test_builds_url_with_query() {
    let backend = FakeBackend::new();
    backend.on(Method::Get, "/products", Reply::Json(200, json!([])));
    let transport = transport(&backend);

    let descriptor = RequestDescriptor::get("/products")
      .with_query("skip", 20)
      .with_query("limit", 20);
    transport.issue(&descriptor).await.unwrap();

    let url = &backend.requests()[0].url;
    assert_eq!(url.as_str(), "http://ims.test/api/v1/products?skip=20&limit=20");
  }

  #[tokio::test]
  async fn test_sends_json_body() {
    let backend = FakeBackend::new();
    backend.on(Method::Post, "/roles", Reply::Json(200, json!({"id": 1})));
    let transport = transport(&backend);

    let descriptor = RequestDescriptor::post("/roles")
      .with_json(&json!({"name": "admin"}))
      .unwrap();
    let created = transport.issue(&descriptor).await.unwrap();
    assert_eq!(created, json!({"id": 1}));

    let request = &backend.requests()[0];
    assert_eq!(request.header("content-type"), Some("application/json"));
    let sent: Value = serde_json::from_slice(request.body.as_deref().unwrap()).unwrap();
    assert_eq!(sent, json!({"name": "admin"}));
  }

  #[tokio::test]
  async fn test_rejects_unresolvable_path_without_sending() {
    let backend = FakeBackend::new();
    let transport = transport(&backend);

    let err = transport
      .issue(&RequestDescriptor::get("users"))
      .await
      .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Request);
    assert!(backend.requests().is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_duplicate_request_cancels_first() {
    let backend = FakeBackend::new().with_latency(Duration::from_millis(100));
    backend.on(Method::Get, "/users", Reply::Json(200, json!(["fresh"])));
    let transport = transport(&backend);
    let descriptor = RequestDescriptor::get("/users");

    let first = tokio::spawn({
      let transport = transport.clone();
      let descriptor = descriptor.clone();
      async move { transport.issue(&descriptor).await }
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(transport.in_flight(), 1);

    let second = transport.issue(&descriptor).await;
    let first = first.await.unwrap();

    assert_eq!(first, Err(ApiError::Canceled));
    assert_eq!(second, Ok(json!(["fresh"])));
    assert_eq!(transport.in_flight(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_mutations_are_not_deduplicated() {
    let backend = FakeBackend::new().with_latency(Duration::from_millis(50));
    backend.on(Method::Post, "/users", Reply::Json(200, json!({"id": 7})));
    let transport = transport(&backend);
    let descriptor = RequestDescriptor::post("/users")
      .with_json(&json!({"username": "a"}))
      .unwrap();

    let (a, b) = tokio::join!(transport.issue(&descriptor), transport.issue(&descriptor));
    assert!(a.is_ok());
    assert!(b.is_ok());
    assert_eq!(backend.count(Method::Post, "/users"), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_caller_cancellation() {
    let backend = FakeBackend::new();
    backend.on(Method::Get, "/roles", Reply::Hang);
    let transport = transport(&backend);
    let cancel = CancellationToken::new();

    let call = tokio::spawn({
      let transport = transport.clone();
      let cancel = cancel.clone();
      async move {
        transport
          .issue_with_cancel(&RequestDescriptor::get("/roles"), cancel)
          .await
      }
    });
    tokio::time::sleep(Duration::from_millis(5)).await;
    cancel.cancel();

    assert_eq!(call.await.unwrap(), Err(ApiError::Canceled));
    assert_eq!(transport.in_flight(), 0);
  }

  #[tokio::test(start_paused = true)]
  async fn test_timeout_is_a_network_error() {
    let backend = FakeBackend::new();
    backend.on(Method::Get, "/products", Reply::Hang);
    let transport = transport(&backend).with_timeout(Duration::from_secs(15));

    let started = Instant::now();
    let err = transport
      .issue(&RequestDescriptor::get("/products"))
      .await
      .unwrap_err();

    assert_eq!(err, ApiError::TimedOut(Duration::from_secs(15)));
    assert_eq!(err.kind(), ErrorKind::Network);
    assert_eq!(RequestState::of::<()>(&Err(err)), RequestState::TimedOut);
    assert!(started.elapsed() >= Duration::from_secs(15));
  }

  #[tokio::test]
  async fn test_unreachable_server_is_a_network_error() {
    let backend = FakeBackend::new();
    backend.on(Method::Get, "/users", Reply::Unreachable);
    let transport = transport(&backend);

    let err = transport
      .issue(&RequestDescriptor::get("/users"))
      .await
      .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Network);
  }

  #[tokio::test]
  async fn test_unauthorized_clears_session_once() {
    let backend = FakeBackend::new();
    backend.on(
      Method::Get,
      "/users",
      Reply::Json(401, json!({"detail": "Could not validate credentials"})),
    );
    let transport = transport(&backend);
    transport.session().set_token("t1").unwrap();
    let mut events = transport.session().subscribe();

    let err = transport
      .issue(&RequestDescriptor::get("/users"))
      .await
      .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unauthenticated);
    assert_eq!(err.message(), "Could not validate credentials");
    assert_eq!(transport.session().token(), None);

    // A second rejection after the session is gone does not signal again.
    let _ = transport.issue(&RequestDescriptor::get("/users")).await;
    assert_eq!(events.try_recv().unwrap(), SessionEvent::Expired);
    assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
  }

  #[tokio::test]
  async fn test_status_classification() {
    let backend = FakeBackend::new();
    backend.on(Method::Get, "/a", Reply::Json(429, json!({"detail": "slow down"})));
    backend.on(Method::Get, "/b", Reply::Json(502, json!({})));
    backend.on(Method::Get, "/c", Reply::Json(404, json!({"detail": "Role not found"})));
    backend.on(Method::Delete, "/d", Reply::Empty(200));
    let transport = transport(&backend);

    let fail = |path: &'static str| {
      let transport = transport.clone();
      async move {
        transport
          .issue(&RequestDescriptor::get(path))
          .await
          .unwrap_err()
      }
    };

    assert_eq!(fail("/a").await.kind(), ErrorKind::RateLimited);
    assert_eq!(fail("/b").await.kind(), ErrorKind::Server);
    assert_eq!(
      fail("/c").await,
      ApiError::Request {
        status: 404,
        message: "Role not found".to_string()
      }
    );
    assert_eq!(
      transport.issue(&RequestDescriptor::delete("/d")).await,
      Ok(Value::Null)
    );
  }

  #[test]
  fn test_undecodable_success_body() {
    let err = decode(HttpResponse {
      status: 200,
      body: b"<html>".to_vec(),
    })
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidResponse);
  }
}
