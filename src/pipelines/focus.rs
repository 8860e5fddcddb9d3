// SPDX-License-Identifier: GPL-3.0-only

//! Auto-focus status poller
//!
//! Turning auto-focus on starts a worker that reads the sensor's focus result
//! until it settles, then reports the outcome to the host once and exits.

use crate::backends::camera::frame_loop::{LoopAction, WorkerController, lock};
use crate::backends::camera::v4l2_controls::ControlIds;
use crate::backends::camera::{DeviceResult, VideoDevice};
use crate::config::Timeouts;
use crate::constants::sensor;
use crate::errors::{CameraError, CameraResult};
use crate::host::{HostBridge, msg};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// What one focus status read means
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusOutcome {
    InProgress,
    Success,
    Fail,
}

impl FocusOutcome {
    /// Map a status read; unknown values and read errors are failures
    pub fn classify(status: DeviceResult<i32>) -> Self {
        match status {
            Ok(sensor::ISX012_AUTO_FOCUS_IN_PROGRESS) | Ok(sensor::AF_STATUS_IN_PROGRESS) => {
                Self::InProgress
            }
            Ok(sensor::AF_STATUS_SUCCESS) => Self::Success,
            Ok(other) => {
                debug!(status = other, "Auto-focus failed");
                Self::Fail
            }
            Err(e) => {
                error!(error = %e, "Unable to read auto-focus status");
                Self::Fail
            }
        }
    }
}

struct FocusShared {
    device: Arc<dyn VideoDevice>,
    ids: ControlIds,
    host: Arc<HostBridge>,
    poll_interval: Duration,
    active: AtomicBool,
}

/// Auto-focus monitor
pub struct FocusMonitor {
    shared: Arc<FocusShared>,
    join_timeout: Duration,
    worker: Mutex<Option<WorkerController>>,
}

impl FocusMonitor {
    pub fn new(
        device: Arc<dyn VideoDevice>,
        ids: ControlIds,
        host: Arc<HostBridge>,
        timeouts: &Timeouts,
    ) -> Self {
        Self {
            shared: Arc::new(FocusShared {
                device,
                ids,
                host,
                poll_interval: timeouts.focus_poll,
                active: AtomicBool::new(false),
            }),
            join_timeout: timeouts.worker_join,
            worker: Mutex::new(None),
        }
    }

    /// Whether a focus run is in progress
    pub fn running(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }

    pub fn start(&self) -> CameraResult<()> {
        let mut worker = lock(&self.worker);
        if self.running() {
            error!("Auto-focus was already started!");
            return Err(CameraError::AlreadyEnabled("Auto-focus"));
        }

        // A finished run leaves its controller behind
        if let Some(mut finished) = worker.take() {
            finished.join();
        }

        let shared = &self.shared;
        shared
            .device
            .set_control(shared.ids.set_auto_focus, sensor::AUTO_FOCUS_ON)?;

        shared.active.store(true, Ordering::SeqCst);
        let poller = Arc::clone(shared);
        let controller = WorkerController::start("auto-focus", self.join_timeout, move |stop| {
            poller.poll(stop)
        });

        match controller {
            Ok(controller) => {
                *worker = Some(controller);
                info!("Auto-focus started");
                Ok(())
            }
            Err(e) => {
                shared.active.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    /// Stop a focus run
    ///
    /// Nothing to do when no run is in progress.
    pub fn cancel(&self) -> CameraResult<()> {
        let mut worker = lock(&self.worker);
        let controller = worker.take();
        if !self.running() {
            if let Some(mut finished) = controller {
                finished.join();
            }
            return Ok(());
        }

        if let Some(mut controller) = controller {
            if !controller.stop() {
                warn!("Auto-focus thread is taking too long to end, something is going wrong");
            }
        }
        self.shared.active.store(false, Ordering::SeqCst);

        let shared = &self.shared;
        shared
            .device
            .set_control(shared.ids.set_auto_focus, sensor::AUTO_FOCUS_OFF)?;
        info!("Auto-focus cancelled");
        Ok(())
    }
}

impl Drop for FocusMonitor {
    fn drop(&mut self) {
        if let Err(e) = self.cancel() {
            warn!(error = %e, "Unable to cancel auto-focus on drop");
        }
    }
}

impl FocusShared {
    fn poll(&self, stop: &AtomicBool) -> LoopAction {
        if stop.load(Ordering::SeqCst) {
            return LoopAction::Stop;
        }

        let status = self.device.get_control(self.ids.auto_focus_result);
        let success = match FocusOutcome::classify(status) {
            FocusOutcome::InProgress => {
                std::thread::sleep(self.poll_interval);
                return LoopAction::Continue;
            }
            FocusOutcome::Success => true,
            FocusOutcome::Fail => false,
        };

        // A cancel racing the last read wins
        if self
            .active
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            info!(success, "Auto-focus finished");
            self.host.notify(msg::FOCUS, i32::from(success), 0);
        }
        LoopAction::Stop
    }
}
