//! Per-provider session bookkeeping

use super::ProviderId;
use super::session::{ArticleSession, SessionConnector};
use crate::config::ProviderConfig;
use crate::error::{AcquireError, Error, FetchError, Result};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

struct ProviderSlot {
    config: RwLock<ProviderConfig>,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<(u64, Box<dyn ArticleSession>)>>,
    /// Bumped on every configuration change; idle sessions from older generations are dropped
    generation: AtomicU64,
    active: AtomicUsize,
    peak: AtomicUsize,
    connects: AtomicUsize,
}

impl ProviderSlot {
    fn config(&self) -> ProviderConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn take_idle(&self, generation: u64) -> Option<Box<dyn ArticleSession>> {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        idle.retain(|(g, _)| *g == generation);
        idle.pop().map(|(_, session)| session)
    }

    fn put_idle(&self, generation: u64, session: Box<dyn ArticleSession>) {
        if generation != self.generation.load(Ordering::Acquire) {
            return;
        }
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((generation, session));
    }
}

/// Bounded, reusable sessions for every configured provider
///
/// Provider configuration is read-mostly: fetches take snapshots, and only
/// [`ProviderPool::update_provider`] writes it.
pub struct ProviderPool {
    slots: Vec<Arc<ProviderSlot>>,
    connector: Arc<dyn SessionConnector>,
}

impl ProviderPool {
    /// Create a pool; provider ids are positions in `providers`
    pub fn new(providers: Vec<ProviderConfig>, connector: Arc<dyn SessionConnector>) -> Self {
        let slots = providers
            .into_iter()
            .map(|config| {
                Arc::new(ProviderSlot {
                    permits: Arc::new(Semaphore::new(config.connections)),
                    config: RwLock::new(config),
                    idle: Mutex::new(Vec::new()),
                    generation: AtomicU64::new(0),
                    active: AtomicUsize::new(0),
                    peak: AtomicUsize::new(0),
                    connects: AtomicUsize::new(0),
                })
            })
            .collect();
        Self { slots, connector }
    }

    /// Number of configured providers
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether no providers are configured
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Snapshot of a provider's configuration
    pub fn provider(&self, id: ProviderId) -> Option<ProviderConfig> {
        self.slots.get(id.0).map(|slot| slot.config())
    }

    /// Look up a provider by name
    pub fn find(&self, name: &str) -> Option<ProviderId> {
        self.slots
            .iter()
            .position(|slot| slot.config().name == name)
            .map(ProviderId)
    }

    /// Enabled providers in the order they should be tried
    ///
    /// Ascending priority; ties keep configuration order.
    pub fn ordered(&self) -> Vec<ProviderId> {
        let mut enabled: Vec<(i32, ProviderId)> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| {
                let config = slot.config();
                config.enabled.then_some((config.priority, ProviderId(i)))
            })
            .collect();
        enabled.sort_by_key(|(priority, _)| *priority);
        enabled.into_iter().map(|(_, id)| id).collect()
    }

    /// Sum of connection limits over enabled providers
    pub fn total_connections(&self) -> usize {
        self.slots
            .iter()
            .map(|slot| slot.config())
            .filter(|config| config.enabled)
            .map(|config| config.connections)
            .sum()
    }

    /// Sessions currently handed out for a provider
    pub fn active_sessions(&self, id: ProviderId) -> usize {
        self.slots
            .get(id.0)
            .map(|slot| slot.active.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Highest number of simultaneously handed out sessions seen for a provider
    pub fn peak_sessions(&self, id: ProviderId) -> usize {
        self.slots
            .get(id.0)
            .map(|slot| slot.peak.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Number of sessions established for a provider
    pub fn connects(&self, id: ProviderId) -> usize {
        self.slots
            .get(id.0)
            .map(|slot| slot.connects.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Wait for a session to `id`
    ///
    /// Returns `Busy` if no slot frees within `timeout`, `Unavailable` if the
    /// provider is disabled or a session cannot be established.
    pub async fn acquire(
        &self,
        id: ProviderId,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> std::result::Result<PooledSession, AcquireError> {
        let slot = self.slots.get(id.0).ok_or(AcquireError::Unavailable {
            reason: format!("unknown provider {id}"),
            permanent: true,
        })?;
        let config = slot.config();
        if !config.enabled {
            return Err(AcquireError::Unavailable {
                reason: format!("provider {} is disabled", config.name),
                permanent: true,
            });
        }

        let permit = tokio::select! {
            _ = cancel.cancelled() => return Err(AcquireError::Cancelled),
            result = tokio::time::timeout(timeout, Arc::clone(&slot.permits).acquire_owned()) => {
                match result {
                    Err(_elapsed) => return Err(AcquireError::Busy),
                    Ok(Err(_closed)) => {
                        return Err(AcquireError::Unavailable {
                            reason: format!("provider {} pool closed", config.name),
                            permanent: true,
                        });
                    }
                    Ok(Ok(permit)) => permit,
                }
            }
        };

        // Configuration may have changed while waiting
        let config = slot.config();
        if !config.enabled {
            return Err(AcquireError::Unavailable {
                reason: format!("provider {} is disabled", config.name),
                permanent: true,
            });
        }

        let generation = slot.generation.load(Ordering::Acquire);
        let session = match slot.take_idle(generation) {
            Some(session) => session,
            None => {
                let connect = self.connector.connect(&config);
                let connected = tokio::select! {
                    _ = cancel.cancelled() => return Err(AcquireError::Cancelled),
                    result = tokio::time::timeout(timeout, connect) => result,
                };
                match connected {
                    Ok(Ok(session)) => {
                        slot.connects.fetch_add(1, Ordering::AcqRel);
                        session
                    }
                    Ok(Err(e)) => {
                        tracing::warn!(provider = %config.name, error = %e, "Failed to establish session");
                        return Err(AcquireError::Unavailable {
                            permanent: matches!(e, FetchError::Fatal(_)),
                            reason: e.to_string(),
                        });
                    }
                    Err(_elapsed) => {
                        return Err(AcquireError::Unavailable {
                            reason: format!("connecting to {} timed out", config.name),
                            permanent: false,
                        });
                    }
                }
            }
        };

        let active = slot.active.fetch_add(1, Ordering::AcqRel) + 1;
        slot.peak.fetch_max(active, Ordering::AcqRel);

        Ok(PooledSession {
            provider: id,
            name: config.name,
            generation,
            session: Some(session),
            broken: false,
            slot: Arc::clone(slot),
            _permit: permit,
        })
    }

    /// Return a session to its provider
    ///
    /// Healthy sessions are kept for reuse; broken ones are closed and a fresh one
    /// is opened on a later acquire.
    pub fn release(&self, session: PooledSession) {
        drop(session);
    }

    /// Replace a provider's configuration
    ///
    /// Sessions already handed out finish their current fetch; idle sessions are
    /// closed so new credentials and hosts take effect.
    pub fn update_provider(&self, id: ProviderId, config: ProviderConfig) -> Result<()> {
        let slot = self.slots.get(id.0).ok_or_else(|| {
            Error::NotFound(format!("provider {id}"))
        })?;
        if config.connections == 0 {
            return Err(Error::Config {
                message: format!("provider '{}' has a connection limit of 0", config.name),
                key: Some("providers.connections".to_string()),
            });
        }

        let old_limit = {
            let mut current = slot.config.write().unwrap_or_else(PoisonError::into_inner);
            let old = current.connections;
            *current = config.clone();
            old
        };

        if config.connections > old_limit {
            slot.permits.add_permits(config.connections - old_limit);
        } else if config.connections < old_limit {
            let excess = old_limit - config.connections;
            let forgotten = slot.permits.forget_permits(excess);
            let outstanding = excess - forgotten;
            if outstanding > 0 {
                // Permits still held by in-flight fetches are retired as they come back
                let permits = Arc::clone(&slot.permits);
                tokio::spawn(async move {
                    if let Ok(permit) = permits.acquire_many_owned(outstanding as u32).await {
                        permit.forget();
                    }
                });
            }
        }

        slot.generation.fetch_add(1, Ordering::AcqRel);
        slot.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        tracing::info!(
            provider = %config.name,
            enabled = config.enabled,
            connections = config.connections,
            priority = config.priority,
            "Provider configuration updated"
        );
        Ok(())
    }
}

/// A session checked out of the pool
///
/// Dropping it releases the provider slot. Healthy sessions go back to the idle
/// list; sessions marked broken are closed.
pub struct PooledSession {
    provider: ProviderId,
    name: String,
    generation: u64,
    session: Option<Box<dyn ArticleSession>>,
    broken: bool,
    slot: Arc<ProviderSlot>,
    _permit: OwnedSemaphorePermit,
}

impl PooledSession {
    /// Provider this session belongs to
    pub fn provider(&self) -> ProviderId {
        self.provider
    }

    /// Name of the provider
    pub fn provider_name(&self) -> &str {
        &self.name
    }

    /// Retrieve one article body; errors that leave the connection unusable mark
    /// the session broken
    pub async fn fetch_body(&mut self, message_id: &str) -> std::result::Result<Vec<u8>, FetchError> {
        let Some(session) = self.session.as_mut() else {
            return Err(FetchError::Transient("session already closed".to_string()));
        };
        let result = session.fetch_body(message_id).await;
        if let Err(e) = &result
            && e.breaks_session()
        {
            self.broken = true;
        }
        result
    }

    /// Close the connection instead of returning it for reuse
    pub fn discard(&mut self) {
        self.broken = true;
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        self.slot.active.fetch_sub(1, Ordering::AcqRel);
        if let Some(session) = self.session.take()
            && !self.broken
        {
            self.slot.put_idle(self.generation, session);
        }
    }
}
