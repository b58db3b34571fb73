//! Reload coordination.
//!
//! A reload invalidates the extension cache and then lets every participant
//! refresh whatever it derived from it. Only one reload runs at a time;
//! callers that arrive while one is in flight wait for it and receive its
//! outcome, marked as coalesced, instead of starting another pass.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::error::ReloadError;
use crate::notify::{Notification, Notifier};
use crate::provider::ExtensionKind;
use crate::registry::ExtensionRegistry;

/// Coordinator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadState {
    Idle,
    Reloading,
    /// Held while a failed attempt is recorded and announced, then the
    /// coordinator returns to `Idle`.
    Failed,
}

/// Something refreshed after the extension cache has been invalidated.
#[async_trait]
pub trait ReloadParticipant: Send + Sync {
    fn name(&self) -> &str;

    async fn reload(&self, source: &str) -> Result<(), ReloadError>;
}

/// Cumulative reload counters.
#[derive(Debug, Default)]
pub struct ReloadCounters {
    succeeded: AtomicU64,
    failed: AtomicU64,
    last_error: Mutex<Option<String>>,
    failing: AtomicBool,
}

impl ReloadCounters {
    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Acquire)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Acquire)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    /// Whether the most recent attempt failed.
    pub fn is_failing(&self) -> bool {
        self.failing.load(Ordering::Acquire)
    }

    fn record_success(&self) {
        self.succeeded.fetch_add(1, Ordering::AcqRel);
        self.failing.store(false, Ordering::Release);
    }

    fn record_failure(&self, error: &ReloadError) {
        self.failed.fetch_add(1, Ordering::AcqRel);
        *self.last_error.lock() = Some(error.to_string());
        self.failing.store(true, Ordering::Release);
    }

    pub fn reset(&self) {
        self.succeeded.store(0, Ordering::Release);
        self.failed.store(0, Ordering::Release);
        *self.last_error.lock() = None;
        self.failing.store(false, Ordering::Release);
    }
}

/// Point-in-time view of the coordinator for monitoring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadStats {
    pub succeeded: u64,
    pub failed: u64,
    pub last_error: Option<String>,
    /// Set by a failed attempt, cleared by the next success.
    pub failing: bool,
    pub state: ReloadState,
}

/// Read-only management interface.
pub trait ReloadMonitor: Send + Sync {
    fn stats(&self) -> ReloadStats;
}

/// Outcome of one successful reload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadReport {
    /// Source that triggered the pass.
    pub source: String,
    /// Cache generation installed by the pass.
    pub generation: u64,
    /// Sequence number of the pass, starting at 1.
    pub attempt: u64,
    /// Whether the caller joined a pass started by someone else.
    pub coalesced: bool,
}

type Outcome = Result<ReloadReport, ReloadError>;

/// Runs reloads one at a time and keeps the counters.
pub struct ReloadCoordinator {
    registry: Arc<ExtensionRegistry>,
    participants: RwLock<Vec<Arc<dyn ReloadParticipant>>>,
    gate: tokio::sync::Mutex<Option<Outcome>>,
    attempts: AtomicU64,
    state: Mutex<ReloadState>,
    counters: ReloadCounters,
    notifier: Option<Arc<Notifier>>,
    stopped: AtomicBool,
}

impl ReloadCoordinator {
    pub fn new(registry: Arc<ExtensionRegistry>) -> Self {
        Self {
            registry,
            participants: RwLock::new(Vec::new()),
            gate: tokio::sync::Mutex::new(None),
            attempts: AtomicU64::new(0),
            state: Mutex::new(ReloadState::Idle),
            counters: ReloadCounters::default(),
            notifier: None,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Participants run in registration order after the cache is invalidated.
    pub fn add_participant(&self, participant: Arc<dyn ReloadParticipant>) {
        self.participants.write().push(participant);
    }

    /// Invalidate the whole cache and refresh every participant.
    pub async fn reload(&self, source: &str) -> Result<ReloadReport, ReloadError> {
        self.run(source, None).await
    }

    /// Invalidate one extension kind only, then refresh every participant.
    pub async fn reload_kind(
        &self,
        source: &str,
        kind: ExtensionKind,
    ) -> Result<ReloadReport, ReloadError> {
        self.run(source, Some(kind)).await
    }

    async fn run(&self, source: &str, kind: Option<ExtensionKind>) -> Outcome {
        if self.is_stopped() {
            return Err(ReloadError::Stopped);
        }
        let seen = self.attempts.load(Ordering::Acquire);
        let mut last = self.gate.lock().await;

        if self.attempts.load(Ordering::Acquire) != seen {
            if let Some(outcome) = last.as_ref() {
                debug!(source, "joined reload already in flight");
                return outcome.clone().map(|report| ReloadReport {
                    coalesced: true,
                    ..report
                });
            }
        }
        if self.is_stopped() {
            return Err(ReloadError::Stopped);
        }

        *self.state.lock() = ReloadState::Reloading;
        info!(source, ?kind, "reload started");
        let generation = match kind {
            Some(kind) => self.registry.invalidate_kind(kind),
            None => self.registry.invalidate_all(),
        };
        let result = self.refresh(source).await;
        let attempt = self.attempts.load(Ordering::Acquire) + 1;

        let outcome = match result {
            Ok(()) => {
                self.counters.record_success();
                *self.state.lock() = ReloadState::Idle;
                info!(source, generation, attempt, "reload completed");
                self.notify(Notification::ReloadCompleted {
                    source: source.to_string(),
                });
                Ok(ReloadReport {
                    source: source.to_string(),
                    generation,
                    attempt,
                    coalesced: false,
                })
            }
            Err(error) => {
                self.counters.record_failure(&error);
                *self.state.lock() = ReloadState::Failed;
                warn!(source, generation, attempt, %error, "reload failed");
                self.notify(Notification::ReloadFailed {
                    source: source.to_string(),
                    error: error.to_string(),
                });
                *self.state.lock() = ReloadState::Idle;
                Err(error)
            }
        };
        *last = Some(outcome.clone());
        self.attempts.store(attempt, Ordering::Release);
        outcome
    }

    async fn refresh(&self, source: &str) -> Result<(), ReloadError> {
        let participants = self.participants.read().clone();
        for participant in participants {
            debug!(source, participant = participant.name(), "refreshing participant");
            participant.reload(source).await?;
        }
        Ok(())
    }

    fn notify(&self, notification: Notification) {
        if let Some(notifier) = &self.notifier {
            notifier.notify(notification);
        }
    }

    pub fn state(&self) -> ReloadState {
        *self.state.lock()
    }

    pub fn counters(&self) -> &ReloadCounters {
        &self.counters
    }

    pub fn reset_counters(&self) {
        self.counters.reset();
    }

    /// Refuse further reloads and tear the counters down.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            self.counters.reset();
            debug!("reload coordinator stopped");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

impl ReloadMonitor for ReloadCoordinator {
    fn stats(&self) -> ReloadStats {
        ReloadStats {
            succeeded: self.counters.succeeded(),
            failed: self.counters.failed(),
            last_error: self.counters.last_error(),
            failing: self.counters.is_failing(),
            state: self.state(),
        }
    }
}

impl fmt::Debug for ReloadCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReloadCoordinator")
            .field("state", &self.state())
            .field("attempts", &self.attempts.load(Ordering::Acquire))
            .field("participants", &self.participants.read().len())
            .finish()
    }
}
