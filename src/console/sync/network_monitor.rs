//! # Network Monitor
//!
//! Classifies reachability into [`ConnectivityState`] for the rest of the data
//! layer.
//!
//! ## Inputs
//!
//! - **Link events**: platform-level online/offline signals (`set_link_up`)
//! - **Probes**: optional periodic round trips (`record_probe`) that separate
//!   a clean link from an unstable or slow one
//!
//! ## Debouncing
//!
//! A new status is announced only after it has held for the whole debounce
//! window, so a flapping link produces no notifications at all and a real
//! transition produces exactly one. Until the first link event arrives the
//! monitor reports `Offline`.

use crate::shared::SyncResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Network connectivity status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectivityState {
    /// Reachable with good latency and no recent failures
    Stable,
    /// Reachable but with recent probe failures or middling latency
    Unstable,
    /// Reachable but slow
    Poor,
    /// Not reachable, or no signal available
    Offline,
}

impl ConnectivityState {
    pub fn is_stable(self) -> bool {
        self == Self::Stable
    }
}

/// Lightweight reachability check
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    /// Round-trip latency, or an error when the remote cannot be reached
    async fn probe(&self) -> SyncResult<Duration>;
}

/// Monitor tuning
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub debounce: Duration,
    pub probe_interval: Duration,
    pub stable_latency: Duration,
    pub poor_latency: Duration,
    pub offline_after_failures: u32,
    /// Probe results considered when classifying
    pub sample_window: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(1500),
            probe_interval: Duration::from_secs(10),
            stable_latency: Duration::from_millis(300),
            poor_latency: Duration::from_millis(1500),
            offline_after_failures: 3,
            sample_window: 5,
        }
    }
}

type Listener = Arc<dyn Fn(ConnectivityState) + Send + Sync>;
type ListenerMap = Mutex<HashMap<u64, Listener>>;

#[derive(Debug)]
struct MonitorState {
    /// `None` until the platform reports anything
    link_up: Option<bool>,
    samples: VecDeque<Option<Duration>>,
    consecutive_failures: u32,
    committed: ConnectivityState,
    candidate: Option<(ConnectivityState, Instant)>,
}

/// Handle returned by [`ConnectivityMonitor::subscribe`]; dropping it unsubscribes
pub struct Subscription {
    id: u64,
    listeners: Weak<ListenerMap>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&self.id);
        }
    }
}

/// Connectivity monitor
pub struct ConnectivityMonitor {
    config: MonitorConfig,
    state: Mutex<MonitorState>,
    status_tx: watch::Sender<ConnectivityState>,
    listeners: Arc<ListenerMap>,
    next_listener: AtomicU64,
}

impl std::fmt::Debug for ConnectivityMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectivityMonitor")
            .field("status", &self.status())
            .finish()
    }
}

impl ConnectivityMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        let (status_tx, _) = watch::channel(ConnectivityState::Offline);
        Self {
            config,
            state: Mutex::new(MonitorState {
                link_up: None,
                samples: VecDeque::new(),
                consecutive_failures: 0,
                committed: ConnectivityState::Offline,
                candidate: None,
            }),
            status_tx,
            listeners: Arc::new(Mutex::new(HashMap::new())),
            next_listener: AtomicU64::new(0),
        }
    }

    /// Last announced status
    pub fn status(&self) -> ConnectivityState {
        self.lock().committed
    }

    /// Receiver that observes every announced status
    pub fn watch(&self) -> watch::Receiver<ConnectivityState> {
        self.status_tx.subscribe()
    }

    /// Register a callback for announced status changes
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(ConnectivityState) + Send + Sync + 'static,
    {
        let id = self.next_listener.fetch_add(1, Ordering::SeqCst);
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::new(callback));
        Subscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    /// Platform online/offline event
    pub fn set_link_up(&self, up: bool) {
        {
            let mut state = self.lock();
            state.link_up = Some(up);
            if !up {
                state.samples.clear();
                state.consecutive_failures = 0;
            }
        }
        tracing::debug!("[NETWORK] Link {}", if up { "up" } else { "down" });
        self.reevaluate();
    }

    /// Outcome of one reachability probe
    pub fn record_probe(&self, outcome: SyncResult<Duration>) {
        {
            let mut state = self.lock();
            match outcome {
                Ok(latency) => {
                    state.consecutive_failures = 0;
                    state.samples.push_back(Some(latency));
                }
                Err(e) => {
                    tracing::debug!("[NETWORK] Probe failed: {}", e);
                    state.consecutive_failures += 1;
                    state.samples.push_back(None);
                }
            }
            while state.samples.len() > self.config.sample_window.max(1) {
                state.samples.pop_front();
            }
        }
        self.reevaluate();
    }

    /// Commit a pending status whose debounce window has elapsed
    pub fn tick(&self) {
        self.reevaluate();
    }

    /// Drive debouncing and probing in the background
    pub fn spawn(
        self: &Arc<Self>,
        probe: Option<Arc<dyn ReachabilityProbe>>,
    ) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let tick_every = (monitor.config.debounce / 4).max(Duration::from_millis(50));
            let mut ticks = tokio::time::interval(tick_every);
            let mut probes = tokio::time::interval(monitor.config.probe_interval);

            loop {
                tokio::select! {
                    _ = ticks.tick() => monitor.tick(),
                    _ = probes.tick(), if probe.is_some() => {
                        if let Some(probe) = &probe {
                            let outcome = probe.probe().await;
                            monitor.record_probe(outcome);
                        }
                    }
                }
            }
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn classify(&self, state: &MonitorState) -> ConnectivityState {
        if state.link_up != Some(true) {
            return ConnectivityState::Offline;
        }
        if state.consecutive_failures >= self.config.offline_after_failures {
            return ConnectivityState::Offline;
        }
        if state.samples.is_empty() {
            return ConnectivityState::Stable;
        }
        if state.samples.iter().any(Option::is_none) {
            return ConnectivityState::Unstable;
        }

        let total: Duration = state.samples.iter().flatten().sum();
        let average = total / state.samples.len() as u32;
        if average >= self.config.poor_latency {
            ConnectivityState::Poor
        } else if average > self.config.stable_latency {
            ConnectivityState::Unstable
        } else {
            ConnectivityState::Stable
        }
    }

    fn reevaluate(&self) {
        let now = Instant::now();
        let committed = {
            let mut state = self.lock();
            let raw = self.classify(&state);

            if raw == state.committed {
                state.candidate = None;
                return;
            }

            let since = match state.candidate {
                Some((candidate, since)) if candidate == raw => since,
                _ => {
                    state.candidate = Some((raw, now));
                    now
                }
            };
            if now.duration_since(since) < self.config.debounce {
                return;
            }

            tracing::info!("[NETWORK] {:?} -> {:?}", state.committed, raw);
            state.committed = raw;
            state.candidate = None;
            raw
        };

        self.status_tx.send_replace(committed);
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for listener in listeners {
            listener(committed);
        }
    }
}
