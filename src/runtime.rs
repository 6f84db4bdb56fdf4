//! In-process host that drives workers through their lifecycle and routes
//! requests to them.

use color_eyre::{eyre::eyre, Result};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheResult, CacheStorage};
use crate::event::{ActivateEvent, ExtendableEvent, FetchEvent, InstallEvent, Served};
use crate::http::{FetchError, Network, Request};
use crate::worker::Worker;

pub type ClientId = u64;

/// Worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  Parsed,
  Installing,
  Installed,
  Activating,
  Activated,
  /// Failed to install, or replaced by a newer version
  Redundant,
}

/// Check if a state transition is valid
fn is_valid_transition(from: WorkerState, to: WorkerState) -> bool {
  use WorkerState::*;

  matches!(
    (from, to),
    (Parsed, Installing)
      | (Installing, Installed)
      | (Installing, Redundant)
      | (Installed, Activating)
      | (Installed, Redundant)
      | (Activating, Activated)
      | (Activating, Redundant)
      | (Activated, Redundant)
  )
}

/// A page or other context that issues requests.
#[derive(Debug, Clone)]
pub struct Client {
  pub url: Url,
  /// Version of the controlling worker, if any
  pub controller: Option<String>,
}

struct Slot<S: CacheStorage, N: Network> {
  worker: Worker<S, N>,
  state: WorkerState,
}

impl<S: CacheStorage, N: Network> Slot<S, N> {
  fn transition(&mut self, to: WorkerState) -> Result<()> {
    if !is_valid_transition(self.state, to) {
      return Err(eyre!(
        "Invalid transition for worker {}: {:?} -> {:?}",
        self.worker.version(),
        self.state,
        to
      ));
    }
    debug!(version = %self.worker.version(), from = ?self.state, ?to, "Worker state change");
    self.state = to;
    Ok(())
  }
}

/// Outcome of routing one request.
pub struct Dispatch {
  pub result: Result<Served, FetchError>,
  /// Work the handler left running, such as a background refresh
  pub pending: ExtendableEvent,
}

/// Registration of a single scope: at most one waiting and one active worker.
pub struct Runtime<S: CacheStorage, N: Network> {
  network: Arc<N>,
  waiting: Option<Slot<S, N>>,
  active: Option<Slot<S, N>>,
  clients: BTreeMap<ClientId, Client>,
  next_client: ClientId,
}

impl<S: CacheStorage, N: Network> Runtime<S, N> {
  /// `network` serves every request no worker answers.
  pub fn new(network: Arc<N>) -> Self {
    Self {
      network,
      waiting: None,
      active: None,
      clients: BTreeMap::new(),
      next_client: 1,
    }
  }

  pub fn active_version(&self) -> Option<&str> {
    self.active.as_ref().map(|slot| slot.worker.version())
  }

  pub fn waiting_version(&self) -> Option<&str> {
    self.waiting.as_ref().map(|slot| slot.worker.version())
  }

  #[cfg(test)]
  pub fn client(&self, id: ClientId) -> Option<&Client> {
    self.clients.get(&id)
  }

  /// Install `worker` and activate it when nothing holds it back.
  ///
  /// It waits only if it did not ask to skip waiting and clients are still
  /// controlled by the current active worker.
  pub async fn register(&mut self, worker: Worker<S, N>) -> Result<WorkerState> {
    let mut slot = Slot {
      worker,
      state: WorkerState::Parsed,
    };
    slot.transition(WorkerState::Installing)?;
    info!(version = %slot.worker.version(), "Installing worker");

    let event = InstallEvent::new();
    slot.worker.on_install(&event);
    let skip_waiting = event.skip_waiting();
    if let Err(e) = event.event.settled().await {
      slot.transition(WorkerState::Redundant)?;
      return Err(e.wrap_err(format!("Install of {} failed", slot.worker.version())));
    }
    slot.transition(WorkerState::Installed)?;

    if skip_waiting.is_raised() || self.active.is_none() || !self.has_controlled_clients() {
      self.activate(slot).await?;
      return Ok(WorkerState::Activated);
    }

    info!(version = %slot.worker.version(), "Worker installed, waiting for clients to close");
    if let Some(mut replaced) = self.waiting.replace(slot) {
      replaced.transition(WorkerState::Redundant)?;
    }
    Ok(WorkerState::Installed)
  }

  /// Adopt a worker installed by an earlier run as the active one.
  pub fn resume(&mut self, worker: Worker<S, N>) -> Result<()> {
    if !worker.is_installed()? {
      return Err(eyre!(
        "Version {} is not installed; run `swcache update` first",
        worker.version()
      ));
    }
    let version = worker.version().to_string();
    self.active = Some(Slot {
      worker,
      state: WorkerState::Activated,
    });
    self.claim();
    debug!(%version, "Resumed active worker");
    Ok(())
  }

  async fn activate(&mut self, mut slot: Slot<S, N>) -> Result<()> {
    slot.transition(WorkerState::Activating)?;
    info!(version = %slot.worker.version(), "Activating worker");

    if let Some(mut previous) = self.active.take() {
      previous.transition(WorkerState::Redundant)?;
    }

    let event = ActivateEvent::new();
    slot.worker.on_activate(&event);
    let claim = event.claim_clients();
    if let Err(e) = event.event.settled().await {
      // Activation proceeds regardless, as a browser would
      warn!(version = %slot.worker.version(), error = %e, "Activate handler failed");
    }

    slot.transition(WorkerState::Activated)?;
    let version = slot.worker.version().to_string();
    self.active = Some(slot);

    // Clients of the replaced worker move over to the new one
    for client in self.clients.values_mut() {
      if client.controller.is_some() {
        client.controller = Some(version.clone());
      }
    }
    if claim.is_raised() {
      self.claim();
    }
    Ok(())
  }

  /// Make the active worker control every open client in its scope.
  fn claim(&mut self) {
    let Some(active) = &self.active else {
      return;
    };
    let config = active.worker.config();
    let mut claimed = 0;
    for client in self.clients.values_mut() {
      if config.in_scope(&client.url) && client.controller.as_deref() != Some(&config.cache_name) {
        client.controller = Some(config.cache_name.clone());
        claimed += 1;
      }
    }
    debug!(version = %config.cache_name, claimed, "Claimed clients");
  }

  fn has_controlled_clients(&self) -> bool {
    self.clients.values().any(|c| c.controller.is_some())
  }

  /// Open a client; it is controlled from the start if an active worker covers its URL.
  pub fn open_client(&mut self, url: Url) -> ClientId {
    let id = self.next_client;
    self.next_client += 1;

    let controller = self
      .active
      .as_ref()
      .filter(|slot| slot.worker.config().in_scope(&url))
      .map(|slot| slot.worker.version().to_string());
    self.clients.insert(id, Client { url, controller });
    id
  }

  /// Close a client, promoting a waiting worker once no client needs the old one.
  pub async fn close_client(&mut self, id: ClientId) -> Result<()> {
    self.clients.remove(&id);
    if !self.has_controlled_clients() {
      if let Some(slot) = self.waiting.take() {
        self.activate(slot).await?;
      }
    }
    Ok(())
  }

  /// Route a request the way a browser would.
  ///
  /// Navigations inside the active worker's scope and requests from a
  /// controlled client go through the worker; everything else, and anything
  /// the worker declines, takes the default network path.
  pub async fn fetch(&self, request: Request, client: Option<ClientId>) -> Dispatch {
    let handler = self.active.as_ref().filter(|slot| {
      if request.is_navigation() {
        slot.worker.config().in_scope(&request.url)
      } else {
        client
          .and_then(|id| self.clients.get(&id))
          .is_some_and(|c| c.controller.as_deref() == Some(slot.worker.version()))
      }
    });

    let mut event = FetchEvent::new(request.clone());
    if let Some(slot) = handler {
      slot.worker.on_fetch(&mut event);
    }

    let (response, pending) = event.into_parts();
    let result = match response {
      Some(response) => response.await,
      None => {
        debug!(method = %request.method, url = %request.url, "Passthrough to network");
        self
          .network
          .fetch(&request)
          .await
          .map(CacheResult::passthrough)
      }
    };

    Dispatch { result, pending }
  }
}
