//! Where each record type lives on the server and in the cache.

use serde::{de::DeserializeOwned, Serialize};

use super::types::*;
use super::wire::PageRequest;
use crate::cache::{Cacheable, QueryKey};

/// A record type with a CRUD collection on the server.
pub trait Resource: Cacheable {
  /// Collection path under the API base, e.g. `/users`.
  const PATH: &'static str;
  /// Root segment of every cache key for this resource.
  const KEY: &'static str;
  /// Other roots whose cached data embeds this resource and goes stale with it.
  const RELATED: &'static [&'static str] = &[];

  type Create: Serialize + DeserializeOwned + Send + Sync;
  type Update: Serialize + DeserializeOwned + Send + Sync;

  fn item_path(id: i64) -> String {
    format!("{}/{}", Self::PATH, id)
  }

  /// `[root]`, the prefix covering every cached page and detail.
  fn root_key() -> QueryKey {
    QueryKey::new(Self::KEY)
  }

  /// `[root, page, page_size]`
  fn list_key(page: PageRequest) -> QueryKey {
    Self::root_key().with(page.page).with(page.page_size)
  }

  /// `[root, "detail", id]`
  fn detail_key(id: i64) -> QueryKey {
    Self::root_key().with("detail").with(id)
  }

  /// Keys to invalidate after a successful write.
  fn invalidated_by_write() -> Vec<QueryKey> {
    std::iter::once(Self::KEY)
      .chain(Self::RELATED.iter().copied())
      .map(QueryKey::new)
      .collect()
  }
}

impl Resource for User {
  const PATH: &'static str = "/users";
  const KEY: &'static str = "users";
  type Create = UserCreate;
  type Update = UserUpdate;
}

impl Resource for Role {
  const PATH: &'static str = "/roles";
  const KEY: &'static str = "roles";
  // Users embed their role.
  const RELATED: &'static [&'static str] = &["users"];
  type Create = RoleCreate;
  type Update = RoleUpdate;
}

impl Resource for Permission {
  const PATH: &'static str = "/permissions";
  const KEY: &'static str = "permissions";
  const RELATED: &'static [&'static str] = &["roles"];
  type Create = PermissionCreate;
  type Update = PermissionUpdate;
}

impl Resource for Product {
  const PATH: &'static str = "/products";
  const KEY: &'static str = "products";
  const RELATED: &'static [&'static str] = &["inventories"];
  type Create = ProductCreate;
  type Update = ProductUpdate;
}

impl Resource for Warehouse {
  const PATH: &'static str = "/products/warehouses";
  const KEY: &'static str = "warehouses";
  const RELATED: &'static [&'static str] = &["inventories"];
  type Create = WarehouseCreate;
  type Update = WarehouseUpdate;
}

impl Resource for Inventory {
  const PATH: &'static str = "/products/inventories";
  const KEY: &'static str = "inventories";
  type Create = InventoryCreate;
  type Update = InventoryUpdate;
}
