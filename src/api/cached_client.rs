//! Cached IMS client that wraps ImsClient with the query cache.

use serde::de::DeserializeOwned;

use super::client::{ImsClient, StockDirection};
use super::resources::Resource;
use super::types::{Inventory, LoginResponse};
use super::wire::{Page, PageRequest};
use crate::cache::{QueryClient, QueryKey};
use crate::query::{Query, QueryOptions};
use crate::transport::{ApiError, HttpBackend, RequestDescriptor, ReqwestBackend};

/// IMS client with transparent caching support.
///
/// Reads go through the query cache; writes go straight to the server and
/// invalidate whatever they make stale.
pub struct CachedImsClient<B: HttpBackend = ReqwestBackend> {
  inner: ImsClient<B>,
  queries: QueryClient,
}

impl<B: HttpBackend> Clone for CachedImsClient<B> {
  fn clone(&self) -> Self {
    Self {
      inner: self.inner.clone(),
      queries: self.queries.clone(),
    }
  }
}

impl<B: HttpBackend> CachedImsClient<B> {
  pub fn new(inner: ImsClient<B>, queries: QueryClient) -> Self {
    Self { inner, queries }
  }

  /// The uncached client underneath.
  pub fn client(&self) -> &ImsClient<B> {
    &self.inner
  }

  pub fn queries(&self) -> &QueryClient {
    &self.queries
  }

  /// Log in. Whatever the previous user had cached is dropped first.
  pub async fn login(&self, username: &str, password: &str) -> Result<LoginResponse, ApiError> {
    self.queries.clear();
    self.inner.login(username, password).await
  }

  pub fn logout(&self) -> color_eyre::Result<()> {
    self.queries.clear();
    self.inner.logout()
  }

  /// Get one page of a collection with caching.
  pub async fn list<R: Resource>(&self, page: PageRequest) -> Query<Page<R>> {
    self.list_with(page, self.queries.defaults()).await
  }

  pub async fn list_with<R: Resource>(
    &self,
    page: PageRequest,
    options: &QueryOptions,
  ) -> Query<Page<R>> {
    let inner = self.inner.clone();
    self
      .queries
      .read(R::list_key(page), options, move |cancel| {
        let inner = inner.with_cancel(cancel);
        async move { inner.list::<R>(page).await }
      })
      .await
  }

  /// Get a single record by id with caching.
  pub async fn get<R: Resource>(&self, id: i64) -> Query<R> {
    let inner = self.inner.clone();
    self
      .queries
      .read(R::detail_key(id), self.queries.defaults(), move |cancel| {
        let inner = inner.with_cancel(cancel);
        async move { inner.get::<R>(id).await }
      })
      .await
  }

  pub async fn create<R: Resource>(&self, payload: &R::Create) -> Result<R, ApiError> {
    self
      .queries
      .mutate(&R::invalidated_by_write(), self.inner.create::<R>(payload))
      .await
  }

  pub async fn update<R: Resource>(&self, id: i64, payload: &R::Update) -> Result<R, ApiError> {
    self
      .queries
      .mutate(&R::invalidated_by_write(), self.inner.update::<R>(id, payload))
      .await
  }

  pub async fn delete<R: Resource>(&self, id: i64) -> Result<(), ApiError> {
    self
      .queries
      .mutate(&R::invalidated_by_write(), self.inner.delete::<R>(id))
      .await
  }

  /// Move stock in or out. Cached inventories are invalidated on success.
  pub async fn adjust_stock(
    &self,
    product_id: i64,
    direction: StockDirection,
    quantity: i64,
  ) -> Result<Inventory, ApiError> {
    self
      .queries
      .mutate(
        &[Inventory::root_key()],
        self.inner.adjust_stock(product_id, direction, quantity),
      )
      .await
  }

  /// Issue an arbitrary write and invalidate `related` on success.
  pub async fn mutate<T: DeserializeOwned>(
    &self,
    descriptor: &RequestDescriptor,
    related: &[QueryKey],
  ) -> Result<T, ApiError> {
    self
      .queries
      .mutate(related, self.inner.request(descriptor))
      .await
  }
}
