//! Subcommands of the `ims` binary.

use clap::{Subcommand, ValueEnum};
use color_eyre::{eyre::eyre, Result};
use serde::Serialize;

use ims::api::{
  CachedImsClient, Inventory, PageRequest, Permission, Product, Resource, Role, StockDirection,
  User, Warehouse,
};
use ims::config::Config;
use ims::session::SessionEvent;

#[derive(Subcommand, Debug)]
pub enum Command {
  /// Log in and remember the session (password from IMS_PASSWORD)
  Login { username: String },
  /// Forget the stored session
  Logout,
  /// List one page of a collection
  List {
    resource: ResourceKind,
    #[arg(long, default_value_t = 1)]
    page: u32,
    /// Items per page (defaults to query.page_size)
    #[arg(long)]
    page_size: Option<u32>,
  },
  /// Show a single record
  Get { resource: ResourceKind, id: i64 },
  /// Create a record from a JSON payload
  Create { resource: ResourceKind, json: String },
  /// Update a record with a (partial) JSON payload
  Update {
    resource: ResourceKind,
    id: i64,
    json: String,
  },
  /// Delete a record
  Delete { resource: ResourceKind, id: i64 },
  /// Book stock into the warehouse
  Inbound { product_id: i64, quantity: i64 },
  /// Book stock out of the warehouse
  Outbound { product_id: i64, quantity: i64 },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
  Users,
  Roles,
  Permissions,
  Products,
  Warehouses,
  Inventories,
}

/// Run `$body` with `$r` bound to the record type of `$kind`.
macro_rules! with_resource {
  ($kind:expr, $r:ident => $body:expr) => {
    match $kind {
      ResourceKind::Users => {
        type $r = User;
        $body
      }
      ResourceKind::Roles => {
        type $r = Role;
        $body
      }
      ResourceKind::Permissions => {
        type $r = Permission;
        $body
      }
      ResourceKind::Products => {
        type $r = Product;
        $body
      }
      ResourceKind::Warehouses => {
        type $r = Warehouse;
        $body
      }
      ResourceKind::Inventories => {
        type $r = Inventory;
        $body
      }
    }
  };
}

pub async fn run(api: &CachedImsClient, command: Command, config: &Config) -> Result<()> {
  let mut events = api.client().session().subscribe();
  let result = dispatch(api, command, config).await;

  while let Ok(event) = events.try_recv() {
    if event == SessionEvent::Expired {
      eprintln!("Session expired. Run `ims login <username>` to sign in again.");
    }
  }
  result
}

async fn dispatch(api: &CachedImsClient, command: Command, config: &Config) -> Result<()> {
  match command {
    Command::Login { username } => {
      let password = Config::get_password()?;
      let response = api.login(&username, &password).await?;
      match response.user {
        Some(user) => println!("Logged in as {}", user.username),
        None => println!("Logged in"),
      }
    }
    Command::Logout => {
      api.logout()?;
      println!("Logged out");
    }
    Command::List {
      resource,
      page,
      page_size,
    } => {
      let page = PageRequest::new(page, page_size.unwrap_or(config.query.page_size));
      with_resource!(resource, R => list::<R>(api, page).await?)
    }
    Command::Get { resource, id } => {
      with_resource!(resource, R => print_yaml(&api.get::<R>(id).await.into_result()?)?)
    }
    Command::Create { resource, json } => {
      with_resource!(resource, R => {
        let payload: <R as Resource>::Create = parse_payload(&json)?;
        print_yaml(&api.create::<R>(&payload).await?)?
      })
    }
    Command::Update { resource, id, json } => {
      with_resource!(resource, R => {
        let payload: <R as Resource>::Update = parse_payload(&json)?;
        print_yaml(&api.update::<R>(id, &payload).await?)?
      })
    }
    Command::Delete { resource, id } => {
      with_resource!(resource, R => api.delete::<R>(id).await?);
      println!("Deleted {} {}", resource_name(resource), id);
    }
    Command::Inbound {
      product_id,
      quantity,
    } => {
      let inventory = api
        .adjust_stock(product_id, StockDirection::Inbound, quantity)
        .await?;
      print_yaml(&inventory)?;
    }
    Command::Outbound {
      product_id,
      quantity,
    } => {
      let inventory = api
        .adjust_stock(product_id, StockDirection::Outbound, quantity)
        .await?;
      print_yaml(&inventory)?;
    }
  }
  Ok(())
}

async fn list<R: Resource>(api: &CachedImsClient, page: PageRequest) -> Result<()> {
  let result = api.list::<R>(page).await.into_result()?;
  print_yaml(&result.items)?;
  eprintln!(
    "{}-{} of {}",
    result.skip + u64::from(!result.is_empty()),
    result.skip + result.len() as u64,
    result.total
  );
  Ok(())
}

fn parse_payload<T: serde::de::DeserializeOwned>(json: &str) -> Result<T> {
  serde_json::from_str(json).map_err(|e| eyre!("Invalid JSON payload: {}", e))
}

fn print_yaml<T: Serialize>(value: &T) -> Result<()> {
  print!("{}", serde_yaml::to_string(value)?);
  Ok(())
}

fn resource_name(kind: ResourceKind) -> &'static str {
  with_resource!(kind, R => R::KEY)
}
