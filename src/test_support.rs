//! In-crate doubles for the network and the backend API.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::cache::{HttpResponse, Request};
use crate::net::{Network, RemoteApi};
use crate::queue::QueueItemType;

/// Network double serving canned responses by URL, with an offline switch.
pub struct MockNetwork {
  responses: Mutex<HashMap<String, HttpResponse>>,
  online: AtomicBool,
  calls: AtomicUsize,
}

impl MockNetwork {
  pub fn new() -> Self {
    Self {
      responses: Mutex::new(HashMap::new()),
      online: AtomicBool::new(true),
      calls: AtomicUsize::new(0),
    }
  }

  pub fn offline() -> Self {
    let network = Self::new();
    network.set_online(false);
    network
  }

  pub fn respond(&self, url: &str, response: HttpResponse) {
    self
      .responses
      .lock()
      .unwrap()
      .insert(url.to_string(), response);
  }

  pub fn set_online(&self, online: bool) {
    self.online.store(online, Ordering::SeqCst);
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl Network for MockNetwork {
  async fn fetch(&self, request: &Request) -> Result<HttpResponse> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    if !self.online.load(Ordering::SeqCst) {
      return Err(eyre!("network unreachable"));
    }
    let responses = self.responses.lock().unwrap();
    Ok(
      responses
        .get(request.url.as_str())
        .cloned()
        .unwrap_or_else(|| HttpResponse::new(404, "Not Found")),
    )
  }
}

/// Backend double that records every call and fails payloads on request.
#[derive(Default)]
pub struct MockRemote {
  calls: Mutex<Vec<(QueueItemType, Value)>>,
  failing: Mutex<Vec<Value>>,
}

impl MockRemote {
  pub fn new() -> Self {
    Self::default()
  }

  /// Every call whose payload equals `data` fails.
  pub fn fail_on(&self, data: Value) {
    self.failing.lock().unwrap().push(data);
  }

  pub fn calls(&self) -> Vec<(QueueItemType, Value)> {
    self.calls.lock().unwrap().clone()
  }

  fn record(&self, kind: QueueItemType, data: &Value) -> Result<()> {
    self.calls.lock().unwrap().push((kind, data.clone()));
    if self.failing.lock().unwrap().contains(data) {
      return Err(eyre!("backend rejected {}", data));
    }
    Ok(())
  }
}

#[async_trait]
impl RemoteApi for MockRemote {
  async fn create_diary(&self, data: &Value) -> Result<()> {
    self.record(QueueItemType::DiaryCreate, data)
  }

  async fn update_diary(&self, data: &Value) -> Result<()> {
    self.record(QueueItemType::DiaryUpdate, data)
  }

  async fn delete_diary(&self, data: &Value) -> Result<()> {
    self.record(QueueItemType::DiaryDelete, data)
  }

  async fn update_settings(&self, data: &Value) -> Result<()> {
    self.record(QueueItemType::SettingsUpdate, data)
  }
}
