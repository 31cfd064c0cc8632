//! Server lifecycle phase and in-flight request accounting.
//!
//! The phase only moves forward: `Starting -> Ready -> Draining -> Stopped`.
//! Readiness checks read it lock-free; shutdown waits on the request
//! counter reaching zero.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::Notify;

/// Lifecycle phase reported by `/health`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Starting,
    /// Accepting REST requests and realtime connections.
    Ready,
    /// Shutdown signalled; realtime clients closed, requests finishing.
    Draining,
    Stopped,
}

impl HealthState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }
}

#[derive(Debug)]
struct Requests {
    active: AtomicU64,
    idle: Notify,
}

/// Tracks the lifecycle phase and the requests still being served.
#[derive(Debug)]
pub struct ShutdownController {
    state: ArcSwap<HealthState>,
    requests: Arc<Requests>,
}

impl ShutdownController {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: ArcSwap::from_pointee(HealthState::Starting),
            requests: Arc::new(Requests {
                active: AtomicU64::new(0),
                idle: Notify::new(),
            }),
        }
    }

    pub fn set_ready(&self) {
        self.state.store(Arc::new(HealthState::Ready));
    }

    /// Enters `Draining`. Readiness starts failing from here on.
    pub fn trigger_shutdown(&self) {
        self.state.store(Arc::new(HealthState::Draining));
    }

    #[must_use]
    pub fn health_state(&self) -> HealthState {
        **self.state.load()
    }

    /// Counts a request until the guard drops, unwinding included.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.requests.active.fetch_add(1, Ordering::AcqRel);
        InFlightGuard {
            requests: Arc::clone(&self.requests),
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.requests.active.load(Ordering::Acquire)
    }

    /// Waits up to `timeout` for every guard to drop.
    ///
    /// On success the phase becomes `Stopped` and `true` is returned; on
    /// timeout the phase stays `Draining`.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let drained = tokio::time::timeout(timeout, async {
            loop {
                let idle = self.requests.idle.notified();
                if self.in_flight_count() == 0 {
                    return;
                }
                idle.await;
            }
        })
        .await
        .is_ok();

        if drained {
            self.state.store(Arc::new(HealthState::Stopped));
        }
        drained
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Held by a request for as long as it runs.
#[derive(Debug)]
pub struct InFlightGuard {
    requests: Arc<Requests>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.requests.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.requests.idle.notify_waiters();
        }
    }
}
