//! Lifecycle events delivered by the host to a worker.
//!
//! Handlers run synchronously but do their real work in futures handed to
//! `wait_until`. The host keeps an event alive until `settled()` resolves,
//! which covers tasks registered later through a cloned `Lifetime`.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::cache::CacheResult;
use crate::http::{FetchError, Request, Response};

/// What a fetch handler eventually answers with.
pub type Served = CacheResult<Response>;

pub type ResponseFuture = BoxFuture<'static, Result<Served, FetchError>>;

type PendingTask = JoinHandle<Result<()>>;

/// Handle for extending an event's lifetime from inside its own tasks.
#[derive(Clone)]
pub struct Lifetime {
  tx: mpsc::UnboundedSender<PendingTask>,
}

impl Lifetime {
  /// Spawn `task` and keep the event alive until it finishes.
  pub fn wait_until<F>(&self, task: F)
  where
    F: Future<Output = Result<()>> + Send + 'static,
  {
    let handle = tokio::spawn(task);
    // Once the event has settled nobody is listening; the task runs detached.
    let _ = self.tx.send(handle);
  }
}

/// Base of every lifecycle event.
pub struct ExtendableEvent {
  lifetime: Lifetime,
  rx: mpsc::UnboundedReceiver<PendingTask>,
}

impl ExtendableEvent {
  pub fn new() -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    Self {
      lifetime: Lifetime { tx },
      rx,
    }
  }

  pub fn wait_until<F>(&self, task: F)
  where
    F: Future<Output = Result<()>> + Send + 'static,
  {
    self.lifetime.wait_until(task);
  }

  pub fn lifetime(&self) -> Lifetime {
    self.lifetime.clone()
  }

  /// Wait for every task registered so far or while waiting.
  ///
  /// Resolves once all `Lifetime` clones are gone and every task finished.
  /// Returns the first failure, after still waiting for the rest.
  pub async fn settled(self) -> Result<()> {
    let Self { lifetime, mut rx } = self;
    drop(lifetime);

    let mut first_error = None;
    while let Some(handle) = rx.recv().await {
      let outcome = match handle.await {
        Ok(result) => result,
        Err(e) => Err(eyre!("Event task did not complete: {}", e)),
      };
      if let Err(e) = outcome {
        first_error.get_or_insert(e);
      }
    }

    match first_error {
      Some(e) => Err(e),
      None => Ok(()),
    }
  }
}

impl Default for ExtendableEvent {
  fn default() -> Self {
    Self::new()
  }
}

/// One-way flag a handler raises for the host to act on after settling.
#[derive(Debug, Clone, Default)]
pub struct Signal(Arc<AtomicBool>);

impl Signal {
  pub fn raise(&self) {
    self.0.store(true, Ordering::SeqCst);
  }

  pub fn is_raised(&self) -> bool {
    self.0.load(Ordering::SeqCst)
  }
}

/// Fired once when a new worker version is installed.
#[derive(Default)]
pub struct InstallEvent {
  pub event: ExtendableEvent,
  skip_waiting: Signal,
}

impl InstallEvent {
  pub fn new() -> Self {
    Self::default()
  }

  /// Raised to activate right after install instead of waiting for clients
  /// of the previous version to close.
  pub fn skip_waiting(&self) -> Signal {
    self.skip_waiting.clone()
  }
}

/// Fired once when the host promotes a worker to active.
#[derive(Default)]
pub struct ActivateEvent {
  pub event: ExtendableEvent,
  claim: Signal,
}

impl ActivateEvent {
  pub fn new() -> Self {
    Self::default()
  }

  /// Raised to take control of every open client once activation settles.
  pub fn claim_clients(&self) -> Signal {
    self.claim.clone()
  }
}

/// Fired for every outgoing request in scope of a worker.
pub struct FetchEvent {
  pub event: ExtendableEvent,
  request: Request,
  response: Option<ResponseFuture>,
}

impl FetchEvent {
  pub fn new(request: Request) -> Self {
    Self {
      event: ExtendableEvent::new(),
      request,
      response: None,
    }
  }

  pub fn request(&self) -> &Request {
    &self.request
  }

  /// Answer the request with `response` instead of the default network path.
  pub fn respond_with<F>(&mut self, response: F) -> Result<()>
  where
    F: Future<Output = Result<Served, FetchError>> + Send + 'static,
  {
    if self.response.is_some() {
      return Err(eyre!("respond_with already called for {}", self.request.url));
    }
    let response: ResponseFuture = Box::pin(response);
    self.response = Some(response);
    Ok(())
  }

  #[cfg(test)]
  pub fn has_response(&self) -> bool {
    self.response.is_some()
  }

  /// Split into the answer (if any) and the remaining lifetime.
  pub fn into_parts(self) -> (Option<ResponseFuture>, ExtendableEvent) {
    (self.response, self.event)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::AtomicU32;
  use std::time::Duration;
  use url::Url;

  #[tokio::test]
  async fn test_settled_waits_for_nested_tasks() {
    let event = ExtendableEvent::new();
    let counter = Arc::new(AtomicU32::new(0));

    let lifetime = event.lifetime();
    let outer = counter.clone();
    event.wait_until(async move {
      tokio::time::sleep(Duration::from_millis(10)).await;
      let inner = outer.clone();
      lifetime.wait_until(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        inner.fetch_add(1, Ordering::SeqCst);
        Ok(())
      });
      outer.fetch_add(1, Ordering::SeqCst);
      Ok(())
    });

    event.settled().await.unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_settled_reports_first_error_after_all_tasks() {
    let event = ExtendableEvent::new();
    let finished = Signal::default();

    event.wait_until(async { Err(eyre!("boom")) });
    let done = finished.clone();
    event.wait_until(async move {
      tokio::time::sleep(Duration::from_millis(10)).await;
      done.raise();
      Ok(())
    });

    let err = event.settled().await.unwrap_err();
    assert_eq!(err.to_string(), "boom");
    assert!(finished.is_raised());
  }

  #[tokio::test]
  async fn test_settled_without_tasks() {
    ExtendableEvent::new().settled().await.unwrap();
  }

  #[tokio::test]
  async fn test_respond_with_only_once() {
    let url = Url::parse("https://app.test/").unwrap();
    let mut event = FetchEvent::new(Request::get(url));
    assert!(!event.has_response());

    event
      .respond_with(async { Ok(CacheResult::from_network(Response::new(200, "a"))) })
      .unwrap();
    assert!(event
      .respond_with(async { Ok(CacheResult::from_network(Response::new(200, "b"))) })
      .is_err());

    let (response, pending) = event.into_parts();
    let served = response.unwrap().await.unwrap();
    assert_eq!(served.data.body, b"a".to_vec());
    pending.settled().await.unwrap();
  }

  #[test]
  fn test_signal() {
    let signal = Signal::default();
    let handle = signal.clone();
    assert!(!signal.is_raised());
    handle.raise();
    assert!(signal.is_raised());
  }
}
