//! Operation coordinator
//!
//! Bridges caller-issued operations to the background host. Operations submitted before
//! the host is reachable are held and retried; a refused foreground start falls back to a
//! plain bind. Each caller receives exactly one result through an [`OperationFuture`].

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::{oneshot, Semaphore};
use tracing::{debug, info, warn};

use crate::config::CoordinatorConfig;
use crate::control::OperationControl;
use crate::error::{OpsError, Result};
use crate::host::BackgroundHost;
use crate::progress::{Completion, ProgressUpdate};
use crate::types::{OperationId, OperationState, Outcome};

/// How the coordinator reaches the host
#[async_trait]
pub trait HostLauncher: Send + Sync {
    /// Ask for a foreground start. Allowed to fail; binding must still work afterwards.
    async fn start(&self) -> Result<()>;

    /// Bind to the host, bringing it up without foreground promotion if needed
    async fn bind(&self) -> Result<Arc<BackgroundHost>>;
}

/// Launcher for a host living in the same process
pub struct InProcessLauncher {
    host: Arc<BackgroundHost>,
}

impl InProcessLauncher {
    pub fn new(host: Arc<BackgroundHost>) -> Self {
        Self { host }
    }
}

#[async_trait]
impl HostLauncher for InProcessLauncher {
    async fn start(&self) -> Result<()> {
        self.host.launch(true)
    }

    async fn bind(&self) -> Result<Arc<BackgroundHost>> {
        self.host.launch(false)?;
        Ok(self.host.clone())
    }
}

/// Handle given to an operation body
#[derive(Clone)]
pub struct OperationContext {
    id: OperationId,
    label: String,
    host: Arc<BackgroundHost>,
    control: Arc<OperationControl>,
}

impl OperationContext {
    pub fn id(&self) -> &OperationId {
        &self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn control(&self) -> &Arc<OperationControl> {
        &self.control
    }

    pub fn is_cancelled(&self) -> bool {
        self.control.is_cancelled()
    }

    /// Bail out with `OpsError::Cancelled` once cancellation was requested
    pub fn checkpoint(&self) -> Result<()> {
        self.control.checkpoint()
    }

    /// Report progress; safe to call from any worker thread
    pub fn report(&self, update: ProgressUpdate) {
        match update {
            ProgressUpdate::Message(message) => self.host.update_progress(&self.id, &message),
            ProgressUpdate::Files {
                current,
                total,
                name,
            } => self
                .host
                .update_file_progress(&self.id, current, total, &name),
            ProgressUpdate::Bytes {
                current,
                total,
                name,
            } => self
                .host
                .update_bytes_progress(&self.id, current, total, &name),
        }
    }

    pub fn report_bytes(&self, current: u64, total: u64, name: &str) {
        self.host
            .update_bytes_progress(&self.id, current, total, name);
    }
}

/// Per-file progress for batch operations.
///
/// The body learns the batch size itself and passes it with every report.
#[derive(Clone)]
pub struct FileReporter {
    context: OperationContext,
}

impl FileReporter {
    pub fn report(&self, current: u64, total: u64, name: &str) {
        self.context.report(ProgressUpdate::Files {
            current,
            total,
            name: name.to_string(),
        });
    }

    pub fn context(&self) -> &OperationContext {
        &self.context
    }

    pub fn checkpoint(&self) -> Result<()> {
        self.context.checkpoint()
    }

    pub fn is_cancelled(&self) -> bool {
        self.context.is_cancelled()
    }
}

/// Result of a submitted operation
pub struct OperationFuture<T> {
    id: OperationId,
    rx: oneshot::Receiver<Result<Outcome<T>>>,
}

impl<T> OperationFuture<T> {
    pub fn id(&self) -> &OperationId {
        &self.id
    }
}

impl<T> Future for OperationFuture<T> {
    type Output = Result<Outcome<T>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(OpsError::Disconnected)),
            Poll::Pending => Poll::Pending,
        }
    }
}

struct Submission {
    state: OperationState,
    control: Arc<OperationControl>,
}

struct CoordinatorInner {
    config: CoordinatorConfig,
    launcher: Arc<dyn HostLauncher>,
    host: RwLock<Option<Arc<BackgroundHost>>>,
    workers: Arc<Semaphore>,
    submissions: RwLock<HashMap<OperationId, Submission>>,
}

/// Schedules operations on worker tasks and keeps the host informed
#[derive(Clone)]
pub struct OperationCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl OperationCoordinator {
    pub fn new(config: CoordinatorConfig, launcher: Arc<dyn HostLauncher>) -> Self {
        let workers = Arc::new(Semaphore::new(config.max_concurrent_operations.max(1)));
        Self {
            inner: Arc::new(CoordinatorInner {
                config,
                launcher,
                host: RwLock::new(None),
                workers,
                submissions: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Submit an operation. The body runs on a worker task once the host is reachable.
    ///
    /// Errors from the body reach the caller unchanged, except `OpsError::Cancelled`
    /// which becomes `Outcome::Cancelled`. Reusing the id of an undelivered operation
    /// resolves to `OpsError::DuplicateOperation` without running the body.
    pub fn submit<T, F, Fut>(
        &self,
        id: OperationId,
        label: impl Into<String>,
        body: F,
    ) -> OperationFuture<T>
    where
        T: Send + 'static,
        F: FnOnce(OperationContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let label = label.into();
        let control = Arc::new(OperationControl::new());
        let (tx, rx) = oneshot::channel();

        match self.inner.submissions.write().entry(id.clone()) {
            Entry::Occupied(_) => {
                warn!("Rejected duplicate operation {}: {}", id, label);
                let _ = tx.send(Err(OpsError::DuplicateOperation { id: id.to_string() }));
                return OperationFuture { id, rx };
            }
            Entry::Vacant(slot) => {
                slot.insert(Submission {
                    state: OperationState::Queued,
                    control: control.clone(),
                });
            }
        }
        debug!("Queued operation {}: {}", id, label);

        let inner = self.inner.clone();
        let task_id = id.clone();
        tokio::spawn(async move {
            let result = inner.execute(&task_id, label, control, body).await;
            inner.submissions.write().remove(&task_id);
            if tx.send(result).is_err() {
                debug!("Caller dropped result of operation {}", task_id);
            }
        });

        OperationFuture { id, rx }
    }

    /// Submit a batch operation reporting per-file progress
    pub fn submit_multi_file<T, F, Fut>(
        &self,
        id: OperationId,
        label: impl Into<String>,
        body: F,
    ) -> OperationFuture<T>
    where
        T: Send + 'static,
        F: FnOnce(FileReporter) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        self.submit(id, label, move |context| body(FileReporter { context }))
    }

    /// Best-effort cancellation of everything queued or running.
    ///
    /// The host is signalled through the regular connect path, so this also works
    /// when the coordinator is not currently bound.
    pub fn request_cancel_all(&self) {
        let count = self.cancel_pending();
        info!("Cancel requested for {} operations", count);

        let inner = self.inner.clone();
        tokio::spawn(async move {
            match inner.connected_host().await {
                Ok(host) => {
                    host.cancel_all();
                }
                Err(e) => warn!("Could not reach background host to cancel: {}", e),
            }
        });
    }

    /// Flag every queued or running operation as cancelled without contacting the host
    pub fn cancel_pending(&self) -> usize {
        let submissions = self.inner.submissions.read();
        for submission in submissions.values() {
            submission.control.cancel();
        }
        submissions.len()
    }

    /// Cancel one operation; false when it is unknown or already delivered
    pub fn cancel(&self, id: &OperationId) -> bool {
        match self.inner.submissions.read().get(id) {
            Some(submission) => {
                submission.control.cancel();
                info!("Cancelled operation: {}", id);
                true
            }
            None => false,
        }
    }

    pub fn operation_state(&self, id: &OperationId) -> Option<OperationState> {
        self.inner.submissions.read().get(id).map(|s| s.state)
    }

    /// Operations submitted and not yet delivered
    pub fn pending_operations(&self) -> usize {
        self.inner.submissions.read().len()
    }

    /// Currently bound host, if any
    pub fn host(&self) -> Option<Arc<BackgroundHost>> {
        self.inner.host.read().clone()
    }

    /// Drop the binding; the next operation reconnects
    pub fn disconnect(&self) {
        if self.inner.host.write().take().is_some() {
            info!("Disconnected from background host");
        }
    }
}

impl CoordinatorInner {
    async fn execute<T, F, Fut>(
        &self,
        id: &OperationId,
        label: String,
        control: Arc<OperationControl>,
        body: F,
    ) -> Result<Outcome<T>>
    where
        T: Send + 'static,
        F: FnOnce(OperationContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let _permit = tokio::select! {
            permit = self.workers.clone().acquire_owned() => {
                permit.map_err(|_| OpsError::Disconnected)?
            }
            _ = control.cancelled() => return Ok(Outcome::Cancelled),
        };

        let host = match self.attach(id, &label, &control).await {
            Ok(host) => host,
            Err(OpsError::Cancelled) => return Ok(Outcome::Cancelled),
            Err(e) => return Err(e),
        };
        self.set_state(id, OperationState::Running);

        let context = OperationContext {
            id: id.clone(),
            label,
            host: host.clone(),
            control,
        };
        let result = match tokio::spawn(body(context)).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(OpsError::OperationPanicked { id: id.to_string() }),
            Err(_) => Err(OpsError::Cancelled),
        };

        let (completion, state, delivered) = match result {
            Ok(value) => (
                Completion::Succeeded,
                OperationState::Completed,
                Ok(Outcome::Completed(value)),
            ),
            Err(OpsError::Cancelled) => (
                Completion::Cancelled,
                OperationState::Cancelled,
                Ok(Outcome::Cancelled),
            ),
            Err(e) => {
                warn!("Operation {} failed: {}", id, e);
                (Completion::Failed, OperationState::Failed, Err(e))
            }
        };
        host.finish_operation(id, completion);
        self.set_state(id, state);
        delivered
    }

    /// Reach the host and register the operation with it, retrying within the bind budget
    async fn attach(
        &self,
        id: &OperationId,
        label: &str,
        control: &Arc<OperationControl>,
    ) -> Result<Arc<BackgroundHost>> {
        let attempts = self.config.max_bind_attempts;
        for attempt in 1..=attempts {
            control.checkpoint()?;
            match self.connected_host().await {
                Ok(host) => match host.start_operation(id, label, control.clone()) {
                    Ok(()) => return Ok(host),
                    Err(e @ OpsError::DuplicateOperation { .. }) => return Err(e),
                    Err(e) => {
                        warn!("Host rejected operation {}: {}", id, e);
                        self.host.write().take();
                    }
                },
                Err(e) => warn!(
                    "Host connection attempt {}/{} failed: {}",
                    attempt, attempts, e
                ),
            }

            if attempt < attempts {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.rebind_delay()) => {}
                    _ = control.cancelled() => return Err(OpsError::Cancelled),
                }
            }
        }
        Err(OpsError::HostUnavailable { attempts })
    }

    async fn connected_host(&self) -> Result<Arc<BackgroundHost>> {
        let bound = self.host.read().clone();
        if let Some(host) = bound.filter(|h| h.is_running()) {
            return Ok(host);
        }
        self.connect().await
    }

    async fn connect(&self) -> Result<Arc<BackgroundHost>> {
        if let Err(e) = self.launcher.start().await {
            warn!("Foreground start refused, continuing bind-only: {}", e);
        }
        let host = self.launcher.bind().await?;
        *self.host.write() = Some(host.clone());
        info!("Bound to background host");
        Ok(host)
    }

    fn set_state(&self, id: &OperationId, state: OperationState) {
        if let Some(submission) = self.submissions.write().get_mut(id) {
            submission.state = state;
        }
    }
}
