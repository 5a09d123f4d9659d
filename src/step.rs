use std::collections::HashSet;
use std::fmt::{self, Debug};
use std::future::Future;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ds_client::DsClient;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::connection::{ConnectionManager, Lease, LinkState, ServerLink};
use crate::error::StepError;
use crate::message::FlowMessage;
use crate::status::{NodeStatus, StepReporter};

/// A configured flow step.
///
/// `start` runs once when the flow starts (source steps set up their subscriptions there),
/// `process` runs per inbound message. Both report failures by returning them; the runtime
/// forwards them to the step's reporter.
#[async_trait]
#[typetag::serde(tag = "type")]
pub trait StepType: Send + Sync + Debug {
    fn type_name(&self) -> String;

    /// Id of the server this step talks to, if any.
    fn server(&self) -> Option<&str>;

    async fn start(&self, _ctx: &Arc<StepContext>) -> Result<(), StepError> {
        Ok(())
    }

    async fn process(&self, msg: FlowMessage, ctx: &Arc<StepContext>) -> Result<(), StepError>;

    /// Whether inputs may be processed side by side. By default a step handles its input
    /// one message at a time, in arrival order.
    fn concurrent(&self) -> bool {
        false
    }

    fn clone_box(&self) -> Box<dyn StepType>;
}

#[derive(Serialize, Deserialize)]
pub struct Step(pub Box<dyn StepType>);

impl std::ops::Deref for Step {
    type Target = dyn StepType;

    fn deref(&self) -> &Self::Target {
        &*self.0
    }
}

impl Clone for Step {
    fn clone(&self) -> Self {
        Step(self.0.clone_box())
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Step").field(&self.0).finish()
    }
}

/// What a running step gets from the runtime: its shared connection lease, an output port,
/// a reporter and a cancellation token covering everything it spawns.
pub struct StepContext {
    step_id: String,
    server: Option<Arc<ServerConfig>>,
    lease: Option<Lease>,
    output: mpsc::UnboundedSender<FlowMessage>,
    reporter: Arc<dyn StepReporter>,
    cancel: CancellationToken,
    once: Mutex<HashSet<String>>,
}

impl StepContext {
    pub fn new(
        step_id: impl Into<String>,
        server: Option<Arc<ServerConfig>>,
        connections: &ConnectionManager,
        output: mpsc::UnboundedSender<FlowMessage>,
        reporter: Arc<dyn StepReporter>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let lease = server.as_ref().map(|config| connections.lease(config));
        let ctx = Arc::new(Self {
            step_id: step_id.into(),
            server,
            lease,
            output,
            reporter,
            cancel,
            once: Mutex::new(HashSet::new()),
        });
        ctx.mirror_status();
        ctx
    }

    pub fn step_id(&self) -> &str {
        &self.step_id
    }

    pub fn server(&self) -> Option<&Arc<ServerConfig>> {
        self.server.as_ref()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn link(&self) -> Result<&Arc<ServerLink>, StepError> {
        self.lease
            .as_ref()
            .map(Lease::link)
            .ok_or_else(|| StepError::InvalidInput(format!("step {} has no server", self.step_id)))
    }

    /// A ready client on the step's shared connection.
    pub async fn client(&self) -> Result<Arc<dyn DsClient>, StepError> {
        let lease = self
            .lease
            .as_ref()
            .ok_or_else(|| StepError::InvalidInput(format!("step {} has no server", self.step_id)))?;
        Ok(lease.client().await?)
    }

    /// Sends downstream. Dropped silently once the step is closed.
    pub fn emit(&self, msg: FlowMessage) {
        if self.is_closed() {
            return;
        }
        if self.output.send(msg).is_err() {
            tracing::debug!(step = %self.step_id, "output closed, message dropped");
        }
    }

    /// A clonable emitter for background tasks.
    pub fn emitter(self: &Arc<Self>) -> impl Fn(FlowMessage) + Send + Sync + 'static + use<> {
        let ctx = self.clone();
        move |msg| ctx.emit(msg)
    }

    pub fn status(&self, status: NodeStatus) {
        self.reporter.status(&self.step_id, status);
    }

    pub fn warn(&self, message: &str) {
        self.reporter.warn(&self.step_id, message);
    }

    pub fn error(&self, message: &str) {
        self.reporter.error(&self.step_id, message);
    }

    /// Runs `fut` until it finishes or the step closes.
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = fut => {}
            }
        });
    }

    /// `true` the first time `key` is seen by this step.
    pub fn first_time(&self, key: &str) -> bool {
        match self.once.lock() {
            Ok(mut seen) => seen.insert(key.to_string()),
            Err(poisoned) => poisoned.into_inner().insert(key.to_string()),
        }
    }

    /// Runs `op` now. If it fails, the error is returned and `op` is retried in the background
    /// each time the connection opens again, until it succeeds or the step closes.
    pub async fn start_or_retry<F, Fut>(self: &Arc<Self>, op: F) -> Result<(), StepError>
    where
        F: Fn(Arc<StepContext>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), StepError>> + Send + 'static,
    {
        let mut states = self.link()?.states();
        let err = match op(self.clone()).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        let ctx = self.clone();
        self.spawn(async move {
            loop {
                if states.changed().await.is_err() {
                    return;
                }
                let open = *states.borrow_and_update() == LinkState::Open;
                if !open {
                    continue;
                }
                match op(ctx.clone()).await {
                    Ok(()) => {
                        tracing::info!(step = %ctx.step_id, "started after reconnect");
                        return;
                    }
                    Err(e) => ctx.warn(&format!("start failed: {e}")),
                }
            }
        });
        Err(err)
    }

    fn mirror_status(self: &Arc<Self>) {
        let Some(lease) = &self.lease else { return };
        let mut statuses = lease.link().statuses();
        let reporter = self.reporter.clone();
        let step = self.step_id.clone();
        self.spawn(async move {
            let mut last: Option<NodeStatus> = None;
            loop {
                let current = statuses.borrow_and_update().clone();
                if !last.as_ref().is_some_and(|l| l.same_as(&current)) {
                    reporter.status(&step, current.clone());
                    last = Some(current);
                }
                if statuses.changed().await.is_err() {
                    return;
                }
            }
        });
    }

    /// Stops everything the step spawned and gives its connection lease back.
    pub async fn close(&self) {
        self.cancel.cancel();
        if let Some(lease) = &self.lease {
            lease.release().await;
        }
    }
}

impl fmt::Debug for StepContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepContext")
            .field("step_id", &self.step_id)
            .field("server", &self.server.as_ref().map(|s| s.id.clone()))
            .field("closed", &self.is_closed())
            .finish()
    }
}
