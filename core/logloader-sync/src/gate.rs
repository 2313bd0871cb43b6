//! Pause gate: suspends transfers while the device is busy.
//!
//! A single task polls the device's busy signal and publishes the gate state
//! over a `watch` channel. Coordinators wait on a [`GateHandle`] before each
//! unit of work. After the device goes idle the gate stays closed for a
//! settle delay so the device can finish writing the log it just closed.

use crate::device::DeviceLink;
use crate::scheduler::sleep_or_shutdown;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Current state of the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    /// Transfers may run.
    Open,
    /// The device is busy, or its state is not known yet.
    Paused,
    /// The device went idle; waiting out the settle delay.
    Settling,
}

/// Owner of the gate state. Starts paused until the first busy poll answers.
pub struct PauseGate {
    state: watch::Sender<GateState>,
}

/// Read side of the gate, cloned into each coordinator.
#[derive(Clone)]
pub struct GateHandle {
    state: watch::Receiver<GateState>,
}

impl Default for PauseGate {
    fn default() -> Self {
        Self::new()
    }
}

impl PauseGate {
    pub fn new() -> Self {
        let (state, _) = watch::channel(GateState::Paused);
        Self { state }
    }

    /// Returns a handle observing this gate.
    pub fn subscribe(&self) -> GateHandle {
        GateHandle {
            state: self.state.subscribe(),
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> GateState {
        *self.state.borrow()
    }

    /// Forces the gate into `state`.
    pub fn set(&self, state: GateState) {
        self.state.send_replace(state);
    }

    /// Polls `device` every `poll` until `shutdown` fires.
    pub async fn run(
        self,
        device: Arc<dyn DeviceLink>,
        poll: Duration,
        settle: Duration,
        shutdown: CancellationToken,
    ) {
        // Whether a busy period was seen, so the first idle answer at
        // startup opens the gate without a settle delay.
        let mut seen_busy = false;

        loop {
            match device.is_busy().await {
                Ok(true) => {
                    seen_busy = true;
                    if self.state() != GateState::Paused {
                        info!("Device busy, pausing transfers");
                        self.set(GateState::Paused);
                    }
                }
                Ok(false) => {
                    if self.state() != GateState::Open {
                        let idle = if seen_busy {
                            match self.settle(device.as_ref(), settle, &shutdown).await {
                                Some(idle) => idle,
                                None => break,
                            }
                        } else {
                            true
                        };
                        if idle {
                            info!("Transfers enabled");
                            self.set(GateState::Open);
                        }
                    }
                }
                Err(e) => warn!("Failed to query device busy state: {e}"),
            }

            if !sleep_or_shutdown(poll, &shutdown).await {
                break;
            }
        }

        debug!("pause gate stopped");
    }

    /// Waits out the settle delay, then asks the device again.
    ///
    /// Returns `Some(true)` if the device is still idle, `Some(false)` if it
    /// went busy or could not be queried, and `None` on shutdown.
    async fn settle(
        &self,
        device: &dyn DeviceLink,
        settle: Duration,
        shutdown: &CancellationToken,
    ) -> Option<bool> {
        info!("Device idle, resuming in {:?}", settle);
        self.set(GateState::Settling);
        if !sleep_or_shutdown(settle, shutdown).await {
            return None;
        }

        match device.is_busy().await {
            Ok(false) => Some(true),
            Ok(true) => {
                info!("Device busy again, pausing transfers");
                self.set(GateState::Paused);
                Some(false)
            }
            Err(e) => {
                warn!("Failed to query device busy state: {e}");
                self.set(GateState::Paused);
                Some(false)
            }
        }
    }
}

impl GateHandle {
    /// Returns the current state.
    pub fn state(&self) -> GateState {
        *self.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == GateState::Open
    }

    /// Waits until the gate is open.
    ///
    /// Returns `false` if `shutdown` fired first or the gate went away.
    pub async fn wait_until_open(&self, shutdown: &CancellationToken) -> bool {
        let mut state = self.state.clone();
        loop {
            if shutdown.is_cancelled() {
                return false;
            }
            if *state.borrow_and_update() == GateState::Open {
                return true;
            }
            tokio::select! {
                biased;
                () = shutdown.cancelled() => return false,
                changed = state.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }
}
