//! Background execution host
//!
//! Keeps long-running transfers alive independent of the UI: holds the platform keep-alive
//! lock while operations are active and folds progress from concurrent operations into a
//! single throttled status channel. All visible status goes through one serialized task.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI16, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::HostConfig;
use crate::control::OperationControl;
use crate::error::{OpsError, Result};
use crate::progress::{
    byte_percent, file_percent, is_byte_milestone, should_show_file, Completion, ProgressEvent,
};
use crate::types::OperationId;

/// Environment hooks the host depends on
pub trait HostPlatform: Send + Sync {
    /// Ask to be promoted to a visible foreground context.
    ///
    /// Returns `OpsError::StartNotAllowed` when the platform refuses.
    fn request_foreground(&self) -> Result<()>;

    /// Take the keep-alive lock. `timeout` bounds how long the platform may hold it.
    fn acquire_keep_alive(&self, timeout: Duration);

    fn release_keep_alive(&self);
}

/// Platform with no foreground restrictions and nothing to keep awake
#[derive(Debug, Default)]
pub struct HeadlessPlatform;

impl HostPlatform for HeadlessPlatform {
    fn request_foreground(&self) -> Result<()> {
        Ok(())
    }

    fn acquire_keep_alive(&self, timeout: Duration) {
        debug!("keep-alive acquired (timeout {:?})", timeout);
    }

    fn release_keep_alive(&self) {
        debug!("keep-alive released");
    }
}

/// Lifecycle of the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HostState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Signals driving [`HostState`] transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostSignal {
    Launch,
    Ready,
    StartDenied,
    Stop,
    ForcedStop,
    Timeout,
    Halted,
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl HostState {
    pub fn transition(self, signal: HostSignal) -> Result<HostState> {
        use HostSignal::*;
        use HostState::*;

        match (self, signal) {
            (Stopped, Launch) => Ok(Starting),
            (Starting, Ready) => Ok(Running),
            (Starting, StartDenied) => Ok(Stopped),
            (Starting | Running, Stop | ForcedStop | Timeout) => Ok(Stopping),
            (Stopping, Halted) => Ok(Stopped),
            (from, signal) => Err(OpsError::InvalidTransition {
                from: from.to_string(),
                signal: format!("{:?}", signal),
            }),
        }
    }
}

/// Aggregated visible status
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostStatus {
    pub state: HostState,
    pub foreground: bool,
    pub active_operations: usize,
    /// Most recent event behind this status, if any
    pub event: Option<ProgressEvent>,
}

impl HostStatus {
    fn stopped() -> Self {
        Self {
            state: HostState::Stopped,
            foreground: false,
            active_operations: 0,
            event: None,
        }
    }

    /// Text for the single visible notification
    pub fn headline(&self) -> String {
        match (&self.event, self.active_operations) {
            (Some(event), _) => event.describe(),
            (None, 0) => "Idle".to_string(),
            (None, n) => format!("{} operations running", n),
        }
    }
}

const NO_PERCENT: i16 = -1;

struct TrackedOperation {
    label: String,
    control: Arc<OperationControl>,
    file_percent: AtomicI16,
    /// Byte percent restarts when the transferred file changes
    byte_progress: Mutex<(String, i16)>,
}

impl TrackedOperation {
    fn new(label: String, control: Arc<OperationControl>) -> Self {
        Self {
            label,
            control,
            file_percent: AtomicI16::new(NO_PERCENT),
            byte_progress: Mutex::new((String::new(), NO_PERCENT)),
        }
    }

    /// Never lets the visible file percentage go backwards
    fn raise_file_percent(&self, percent: u8) -> u8 {
        let prev = self.file_percent.fetch_max(percent as i16, Ordering::SeqCst);
        prev.max(percent as i16) as u8
    }

    /// True when `percent` is new for `name` and strictly above what was shown
    fn advance_byte_percent(&self, name: &str, percent: u8) -> bool {
        let mut progress = self.byte_progress.lock();
        if progress.0 != name {
            *progress = (name.to_string(), NO_PERCENT);
        }
        if (percent as i16) > progress.1 {
            progress.1 = percent as i16;
            true
        } else {
            false
        }
    }
}

struct PendingStatus {
    operation: Option<OperationId>,
    status: HostStatus,
}

enum StatusCommand {
    Publish(PendingStatus),
    Shutdown(HostStatus),
}

/// Host for background operations
pub struct BackgroundHost {
    config: HostConfig,
    platform: Arc<dyn HostPlatform>,
    state: Mutex<HostState>,
    foreground: AtomicBool,
    active: AtomicUsize,
    keep_alive_held: AtomicBool,
    operations: RwLock<HashMap<OperationId, Arc<TrackedOperation>>>,
    status_tx: Mutex<Option<mpsc::UnboundedSender<StatusCommand>>>,
    broadcaster: broadcast::Sender<HostStatus>,
    latest: Arc<Mutex<HostStatus>>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
}

impl BackgroundHost {
    pub fn new(config: HostConfig, platform: Arc<dyn HostPlatform>) -> Self {
        let (broadcaster, _) = broadcast::channel(config.status_channel_capacity.max(1));
        Self {
            config,
            platform,
            state: Mutex::new(HostState::Stopped),
            foreground: AtomicBool::new(false),
            active: AtomicUsize::new(0),
            keep_alive_held: AtomicBool::new(false),
            operations: RwLock::new(HashMap::new()),
            status_tx: Mutex::new(None),
            broadcaster,
            latest: Arc::new(Mutex::new(HostStatus::stopped())),
            watchdog: Mutex::new(None),
        }
    }

    /// Bring the host up. With `foreground`, also ask the platform for foreground promotion.
    ///
    /// A refused promotion on a fresh start exits the host straight back to `Stopped`
    /// and returns `StartNotAllowed`; it never keeps running half-started. Launching a
    /// running host only upgrades it to foreground when asked.
    pub fn launch(self: &Arc<Self>, foreground: bool) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                HostState::Running => {
                    if foreground && !self.foreground.load(Ordering::SeqCst) {
                        self.platform.request_foreground()?;
                        self.foreground.store(true, Ordering::SeqCst);
                        self.arm_watchdog();
                        info!("Background host promoted to foreground");
                    }
                    return Ok(());
                }
                HostState::Stopped => {}
                other => {
                    return Err(OpsError::InvalidTransition {
                        from: other.to_string(),
                        signal: format!("{:?}", HostSignal::Launch),
                    })
                }
            }

            *state = state.transition(HostSignal::Launch)?;

            if foreground {
                if let Err(e) = self.platform.request_foreground() {
                    *state = state.transition(HostSignal::StartDenied)?;
                    warn!("Background host start denied: {}", e);
                    return Err(e);
                }
            }
            self.foreground.store(foreground, Ordering::SeqCst);

            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(run_status_loop(
                Arc::downgrade(self),
                rx,
                self.broadcaster.clone(),
                self.latest.clone(),
                self.config.status_interval(),
            ));
            *self.status_tx.lock() = Some(tx);

            if foreground {
                self.arm_watchdog();
            }
            *state = state.transition(HostSignal::Ready)?;
        }

        info!("Background host running (foreground: {})", foreground);
        self.publish(None, None);
        Ok(())
    }

    fn arm_watchdog(self: &Arc<Self>) {
        let Some(budget) = self.config.foreground_budget() else {
            return;
        };
        let host = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(budget).await;
            if let Some(host) = host.upgrade() {
                host.on_timeout();
            }
        });
        if let Some(previous) = self.watchdog.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Register a new operation. Fails with `HostStopped` unless the host is running
    /// and with `DuplicateOperation` while another operation holds the same id.
    pub fn start_operation(
        &self,
        id: &OperationId,
        label: &str,
        control: Arc<OperationControl>,
    ) -> Result<()> {
        {
            let state = self.state.lock();
            if *state != HostState::Running {
                return Err(OpsError::HostStopped);
            }
            match self.operations.write().entry(id.clone()) {
                Entry::Occupied(_) => {
                    return Err(OpsError::DuplicateOperation { id: id.to_string() })
                }
                Entry::Vacant(slot) => {
                    slot.insert(Arc::new(TrackedOperation::new(label.to_string(), control)));
                }
            }
            if self.active.fetch_add(1, Ordering::SeqCst) == 0 {
                self.acquire_keep_alive();
            }
        }

        debug!("Operation {} started: {}", id, label);
        self.publish(
            Some(id),
            Some(ProgressEvent::Started {
                label: label.to_string(),
            }),
        );
        Ok(())
    }

    /// Forget an operation and reflect its completion in the status
    pub fn finish_operation(&self, id: &OperationId, completion: Completion) {
        let Some(tracked) = self.operations.write().remove(id) else {
            debug!("Finish for untracked operation {}", id);
            return;
        };

        let remaining = match self
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        {
            Ok(prev) => prev - 1,
            Err(_) => {
                warn!("finish_operation called with active count already 0");
                0
            }
        };
        if remaining == 0 {
            self.release_keep_alive();
            // An operation may have started between the decrement and the release
            if self.active.load(Ordering::SeqCst) > 0 {
                self.acquire_keep_alive();
            }
        }

        debug!("Operation {} finished: {:?}", id, completion);
        self.publish(
            Some(id),
            Some(ProgressEvent::Finished {
                label: tracked.label.clone(),
                completion,
            }),
        );
    }

    pub fn update_progress(&self, id: &OperationId, message: &str) {
        let Some(tracked) = self.live_operation(id) else {
            return;
        };
        self.publish(
            Some(id),
            Some(ProgressEvent::Message {
                label: tracked.label.clone(),
                message: message.to_string(),
            }),
        );
    }

    pub fn update_file_progress(&self, id: &OperationId, current: u64, total: u64, name: &str) {
        let Some(tracked) = self.live_operation(id) else {
            return;
        };
        if !should_show_file(current, total) {
            return;
        }
        let percent = tracked.raise_file_percent(file_percent(current, total));
        self.publish(
            Some(id),
            Some(ProgressEvent::Files {
                label: tracked.label.clone(),
                current,
                total,
                name: name.to_string(),
                percent,
            }),
        );
    }

    pub fn update_bytes_progress(&self, id: &OperationId, current: u64, total: u64, name: &str) {
        let Some(tracked) = self.live_operation(id) else {
            return;
        };
        let percent = byte_percent(current, total, self.config.completion_threshold_bytes);
        if !is_byte_milestone(percent) || !tracked.advance_byte_percent(name, percent) {
            return;
        }
        self.publish(
            Some(id),
            Some(ProgressEvent::Bytes {
                label: tracked.label.clone(),
                current,
                total,
                name: name.to_string(),
                percent,
            }),
        );
    }

    /// Tracked and not cancelled
    fn live_operation(&self, id: &OperationId) -> Option<Arc<TrackedOperation>> {
        let tracked = self.operations.read().get(id).cloned()?;
        if tracked.control.is_cancelled() {
            return None;
        }
        Some(tracked)
    }

    /// Signal every running operation to stop at its next checkpoint
    pub fn cancel_all(&self) -> usize {
        let operations = self.operations.read();
        for (id, tracked) in operations.iter() {
            tracked.control.cancel();
            info!("Cancelled operation: {}", id);
        }
        operations.len()
    }

    /// Graceful stop requested by the owner
    pub fn stop(&self) -> Result<()> {
        self.halt(HostSignal::Stop)
    }

    /// The platform killed the host. Never fails.
    pub fn on_forced_stop(&self) {
        if let Err(e) = self.halt(HostSignal::ForcedStop) {
            debug!("Ignoring forced stop: {}", e);
        }
    }

    /// The platform foreground budget ran out. Never fails.
    pub fn on_timeout(&self) {
        if let Err(e) = self.halt(HostSignal::Timeout) {
            debug!("Ignoring timeout: {}", e);
        }
    }

    fn halt(&self, signal: HostSignal) -> Result<()> {
        let mut state = self.state.lock();
        *state = state.transition(signal)?;
        match signal {
            HostSignal::Stop => info!("Background host stopping"),
            _ => warn!("Background host halted by platform: {:?}", signal),
        }

        let abandoned: Vec<_> = self.operations.write().drain().collect();
        for (id, tracked) in &abandoned {
            tracked.control.cancel();
            debug!("Abandoned operation {} on halt", id);
        }
        self.active.store(0, Ordering::SeqCst);
        self.release_keep_alive();
        self.foreground.store(false, Ordering::SeqCst);
        if let Some(watchdog) = self.watchdog.lock().take() {
            watchdog.abort();
        }

        *state = state.transition(HostSignal::Halted)?;

        let final_status = HostStatus::stopped();
        match self.status_tx.lock().take() {
            Some(tx) => {
                let _ = tx.send(StatusCommand::Shutdown(final_status));
            }
            None => {
                *self.latest.lock() = final_status.clone();
                let _ = self.broadcaster.send(final_status);
            }
        }
        Ok(())
    }

    fn acquire_keep_alive(&self) {
        if self
            .keep_alive_held
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.platform
                .acquire_keep_alive(self.config.keep_alive_timeout());
        }
    }

    fn release_keep_alive(&self) {
        if self
            .keep_alive_held
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.platform.release_keep_alive();
        }
    }

    fn publish(&self, operation: Option<&OperationId>, event: Option<ProgressEvent>) {
        let status = HostStatus {
            state: self.state(),
            foreground: self.is_foreground(),
            active_operations: self.active_operations(),
            event,
        };
        if let Some(tx) = self.status_tx.lock().as_ref() {
            let _ = tx.send(StatusCommand::Publish(PendingStatus {
                operation: operation.cloned(),
                status,
            }));
        }
    }

    /// Whether a pending transfer update still belongs to a live operation
    fn still_visible(&self, pending: &PendingStatus) -> bool {
        let is_transfer = pending
            .status
            .event
            .as_ref()
            .map(ProgressEvent::is_transfer_progress)
            .unwrap_or(false);
        match (&pending.operation, is_transfer) {
            (Some(id), true) => self.live_operation(id).is_some(),
            _ => true,
        }
    }

    pub fn state(&self) -> HostState {
        *self.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.state() == HostState::Running
    }

    pub fn is_foreground(&self) -> bool {
        self.foreground.load(Ordering::SeqCst)
    }

    pub fn active_operations(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn holds_keep_alive(&self) -> bool {
        self.keep_alive_held.load(Ordering::SeqCst)
    }

    /// Register an observer of the visible status channel
    pub fn subscribe(&self) -> broadcast::Receiver<HostStatus> {
        self.broadcaster.subscribe()
    }

    /// Last status that was made visible
    pub fn status(&self) -> HostStatus {
        self.latest.lock().clone()
    }
}

/// The only writer of the visible status.
///
/// At most one emission per `interval`; updates arriving faster replace the pending one so
/// the newest always goes out at the next slot.
async fn run_status_loop(
    host: Weak<BackgroundHost>,
    mut rx: mpsc::UnboundedReceiver<StatusCommand>,
    broadcaster: broadcast::Sender<HostStatus>,
    latest: Arc<Mutex<HostStatus>>,
    interval: Duration,
) {
    let mut pending: Option<PendingStatus> = None;
    let mut last_emit: Option<Instant> = None;

    let emit = |status: HostStatus| {
        *latest.lock() = status.clone();
        let _ = broadcaster.send(status);
    };

    loop {
        let deadline = pending
            .as_ref()
            .map(|_| last_emit.map(|at| at + interval).unwrap_or_else(Instant::now));
        let wake_at = deadline.unwrap_or_else(Instant::now);

        tokio::select! {
            command = rx.recv() => match command {
                Some(StatusCommand::Publish(update)) => pending = Some(update),
                Some(StatusCommand::Shutdown(final_status)) => {
                    emit(final_status);
                    break;
                }
                None => break,
            },
            _ = tokio::time::sleep_until(wake_at), if deadline.is_some() => {
                if let Some(update) = pending.take() {
                    let visible = match host.upgrade() {
                        Some(host) => host.still_visible(&update),
                        None => false,
                    };
                    if visible {
                        emit(update.status);
                        last_emit = Some(Instant::now());
                    }
                }
            }
        }
    }
    debug!("Status loop exited");
}
