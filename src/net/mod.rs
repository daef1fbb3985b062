//! Network collaborators: the fetch path used by the cache strategies and the
//! backend API used to replay deferred writes.

mod client;
mod remote;

pub use client::HttpNetwork;
pub use remote::HttpRemoteApi;

use async_trait::async_trait;
use color_eyre::Result;
use serde_json::Value;

use crate::cache::{HttpResponse, Request};

/// Performs the actual network fetch for an intercepted request.
///
/// `Err` means the network could not be reached (including timeouts). A
/// response with a non-success status is still `Ok`.
#[async_trait]
pub trait Network: Send + Sync + 'static {
  async fn fetch(&self, request: &Request) -> Result<HttpResponse>;
}

/// Remote operations that deferred writes are replayed against.
#[async_trait]
pub trait RemoteApi: Send + Sync {
  async fn create_diary(&self, data: &Value) -> Result<()>;

  async fn update_diary(&self, data: &Value) -> Result<()>;

  async fn delete_diary(&self, data: &Value) -> Result<()>;

  async fn update_settings(&self, data: &Value) -> Result<()>;
}
