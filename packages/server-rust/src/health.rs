//! Readiness signal tied to the provider lifecycle.
//!
//! Uses `ArcSwap` for lock-free state reads from health probes and a `watch`
//! channel so hosts can await transitions. Initialization failure is reported
//! through the gate and returned to the caller; it is never retried here.

use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};
use metastore_core::ProviderResult;
use tokio::sync::watch;
use tracing::{error, info};

use crate::config::EntityMetadataProvidersOptions;
use crate::factory::create_and_initialize_entity_metadata_provider;
use crate::traits::EntityMetadataProvider;

/// Provider readiness as seen by traffic-gating collaborators.
///
/// State machine: Starting -> Ready | Failed, Ready -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// Provider not yet initialized.
    Starting,
    /// Provider initialized; traffic may flow.
    Ready,
    /// Initialization failed; see [`ReadinessGate::last_failure`].
    Failed,
    /// Provider closed at shutdown.
    Stopped,
}

/// Shared readiness flag for the entity metadata provider.
#[derive(Debug)]
pub struct ReadinessGate {
    state: Arc<ArcSwap<HealthState>>,
    failure: ArcSwapOption<String>,
    changes: watch::Sender<HealthState>,
}

impl ReadinessGate {
    /// Creates a gate in the `Starting` state.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(HealthState::Starting);
        Self {
            state: Arc::new(ArcSwap::from_pointee(HealthState::Starting)),
            failure: ArcSwapOption::empty(),
            changes: tx,
        }
    }

    #[must_use]
    pub fn state(&self) -> HealthState {
        **self.state.load()
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state() == HealthState::Ready
    }

    /// Message of the initialization failure, if the gate is `Failed`.
    #[must_use]
    pub fn last_failure(&self) -> Option<String> {
        self.failure.load_full().map(|message| (*message).clone())
    }

    /// Shared handle for probes that only read the state.
    #[must_use]
    pub fn state_handle(&self) -> Arc<ArcSwap<HealthState>> {
        Arc::clone(&self.state)
    }

    /// Receiver notified on every transition.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<HealthState> {
        self.changes.subscribe()
    }

    pub fn set_ready(&self) {
        self.failure.store(None);
        self.transition(HealthState::Ready);
    }

    pub fn set_failed(&self, message: impl Into<String>) {
        self.failure.store(Some(Arc::new(message.into())));
        self.transition(HealthState::Failed);
    }

    pub fn set_stopped(&self) {
        self.transition(HealthState::Stopped);
    }

    fn transition(&self, next: HealthState) {
        self.state.store(Arc::new(next));
        // No receivers is fine.
        let _ = self.changes.send(next);
    }
}

impl Default for ReadinessGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds and initializes the provider, reporting the outcome on `gate`.
///
/// # Errors
///
/// Returns the construction or initialization error after marking the gate
/// `Failed`.
pub async fn initialize_provider(
    gate: &ReadinessGate,
    options: EntityMetadataProvidersOptions,
    override_type: Option<&str>,
) -> ProviderResult<Arc<dyn EntityMetadataProvider>> {
    match create_and_initialize_entity_metadata_provider(options, override_type).await {
        Ok(provider) => {
            gate.set_ready();
            info!(provider = %provider.kind(), "entity metadata provider is ready");
            Ok(provider)
        }
        Err(e) => {
            gate.set_failed(e.to_string());
            error!(error = %e, "entity metadata provider is not available");
            Err(e)
        }
    }
}

/// Closes the provider and marks the gate `Stopped`, even if close fails.
///
/// # Errors
///
/// Returns the error reported by `close()`.
pub async fn shutdown_provider(
    gate: &ReadinessGate,
    provider: Arc<dyn EntityMetadataProvider>,
) -> ProviderResult<()> {
    let result = provider.close().await;
    gate.set_stopped();
    result
}
