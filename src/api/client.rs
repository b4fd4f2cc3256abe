//! Typed client for the IMS REST API.

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::resources::Resource;
use super::types::{Inventory, LoginRequest, LoginResponse, StockChange};
use super::wire::{Page, PageRequest, WirePage};
use crate::config::ApiConfig;
use crate::session::SessionContext;
use crate::transport::{ApiError, HttpBackend, RequestDescriptor, ReqwestBackend, Transport};

/// Direction of a stock movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StockDirection {
  Inbound,
  Outbound,
}

impl StockDirection {
  fn segment(self) -> &'static str {
    match self {
      StockDirection::Inbound => "inbound",
      StockDirection::Outbound => "outbound",
    }
  }
}

/// IMS API client wrapper
pub struct ImsClient<B: HttpBackend = ReqwestBackend> {
  transport: Transport<B>,
  cancel: Option<CancellationToken>,
}

impl<B: HttpBackend> Clone for ImsClient<B> {
  fn clone(&self) -> Self {
    Self {
      transport: self.transport.clone(),
      cancel: self.cancel.clone(),
    }
  }
}

impl ImsClient<ReqwestBackend> {
  /// Build a client for the configured server.
  pub fn connect(config: &ApiConfig, session: SessionContext) -> color_eyre::Result<Self> {
    let timeout_secs = config.timeout_secs.max(1);
    let backend = ReqwestBackend::new(Duration::from_secs(timeout_secs.min(10)))?;
    let transport = Transport::new(backend, &config.base_url, session)?
      .with_timeout(Duration::from_secs(timeout_secs));
    Ok(Self::new(transport))
  }
}

impl<B: HttpBackend> ImsClient<B> {
  pub fn new(transport: Transport<B>) -> Self {
    Self {
      transport,
      cancel: None,
    }
  }

  /// A handle whose requests are all aborted once `cancel` fires.
  pub fn with_cancel(&self, cancel: CancellationToken) -> Self {
    Self {
      transport: self.transport.clone(),
      cancel: Some(cancel),
    }
  }

  pub fn transport(&self) -> &Transport<B> {
    &self.transport
  }

  pub fn session(&self) -> &SessionContext {
    self.transport.session()
  }

  /// Exchange credentials for a token and install it in the session.
  pub async fn login(&self, username: &str, password: &str) -> Result<LoginResponse, ApiError> {
    let descriptor = RequestDescriptor::post("/auth/login").with_json(&LoginRequest {
      username: username.to_string(),
      password: password.to_string(),
    })?;
    let response: LoginResponse = self.request(&descriptor).await?;

    // A token that can't be persisted still works for this process.
    if let Err(e) = self.session().set_token(&response.access_token) {
      warn!("Failed to persist session token: {}", e);
    }
    info!(username, "logged in");
    Ok(response)
  }

  /// Drop the session token locally. The server keeps no session state.
  pub fn logout(&self) -> color_eyre::Result<()> {
    self.session().sign_out()
  }

  pub async fn list<R: Resource>(&self, page: PageRequest) -> Result<Page<R>, ApiError> {
    let descriptor = RequestDescriptor::get(R::PATH)
      .with_query("skip", page.skip())
      .with_query("limit", page.limit());
    let wire: WirePage<R> = self.request(&descriptor).await?;
    Ok(wire.into_page(page))
  }

  pub async fn get<R: Resource>(&self, id: i64) -> Result<R, ApiError> {
    self.request(&RequestDescriptor::get(R::item_path(id))).await
  }

  pub async fn create<R: Resource>(&self, payload: &R::Create) -> Result<R, ApiError> {
    let descriptor = RequestDescriptor::post(R::PATH).with_json(payload)?;
    self.request(&descriptor).await
  }

  pub async fn update<R: Resource>(&self, id: i64, payload: &R::Update) -> Result<R, ApiError> {
    let descriptor = RequestDescriptor::put(R::item_path(id)).with_json(payload)?;
    self.request(&descriptor).await
  }

  pub async fn delete<R: Resource>(&self, id: i64) -> Result<(), ApiError> {
    self
      .issue(&RequestDescriptor::delete(R::item_path(id)))
      .await?;
    Ok(())
  }

  /// Move `quantity` units of a product into or out of stock.
  pub async fn adjust_stock(
    &self,
    product_id: i64,
    direction: StockDirection,
    quantity: i64,
  ) -> Result<Inventory, ApiError> {
    let path = format!(
      "{}/{}/{}",
      <Inventory as Resource>::PATH,
      product_id,
      direction.segment()
    );
    let descriptor = RequestDescriptor::put(path).with_json(&StockChange { quantity })?;
    self.request(&descriptor).await
  }

  /// Issue `descriptor` and decode the payload.
  pub async fn request<T: DeserializeOwned>(
    &self,
    descriptor: &RequestDescriptor,
  ) -> Result<T, ApiError> {
    let value = self.issue(descriptor).await?;
    decode(value)
  }

  /// Issue `descriptor` and hand back the raw payload.
  pub async fn request_raw(&self, descriptor: &RequestDescriptor) -> Result<Value, ApiError> {
    self.issue(descriptor).await
  }

  async fn issue(&self, descriptor: &RequestDescriptor) -> Result<Value, ApiError> {
    let cancel = match &self.cancel {
      Some(parent) => parent.child_token(),
      None => CancellationToken::new(),
    };
    self.transport.issue_with_cancel(descriptor, cancel).await
  }
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T, ApiError> {
  serde_json::from_value(value).map_err(ApiError::decode)
}
