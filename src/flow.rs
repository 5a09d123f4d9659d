//! Flow files and the runtime that wires their steps together.
//!
//! A flow names its servers and steps; each step lists the steps its output is wired to.
//! Every step naming the same server shares one connection through the
//! [`ConnectionManager`], which closes it again when the last step is shut down.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigManager, ServerConfig};
use crate::connection::ConnectionManager;
use crate::message::FlowMessage;
use crate::status::StepReporter;
use crate::step::{Step, StepContext};

const TAP_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlowError {
    #[error("I/O error: {0}")]
    Io(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("step {step} uses unknown server {server}")]
    UnknownServer { step: String, server: String },
    #[error("step {step} is wired to unknown step {target}")]
    UnknownWire { step: String, target: String },
    #[error("no step {0} in this flow")]
    UnknownStep(String),
}

/// A step as it appears in a flow file: its config plus its outgoing wires.
#[derive(Debug, Clone)]
pub struct StepConfig {
    pub id: String,
    pub step: Step,
    pub wires: Vec<String>,
}

impl StepConfig {
    pub fn new(id: impl Into<String>, step: Step) -> Self {
        Self { id: id.into(), step, wires: Vec::new() }
    }

    pub fn wired_to(mut self, targets: &[&str]) -> Self {
        self.wires = targets.iter().map(|t| t.to_string()).collect();
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Flow {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,

    /// server id → config; the key becomes `ServerConfig::id`
    #[serde(default, deserialize_with = "deserialize_servers_with_id")]
    servers: HashMap<String, ServerConfig>,

    /// step id → step config
    #[serde(
        default,
        deserialize_with = "deserialize_steps_with_id",
        serialize_with = "serialize_steps"
    )]
    steps: HashMap<String, StepConfig>,
}

fn deserialize_servers_with_id<'de, D>(deserializer: D) -> Result<HashMap<String, ServerConfig>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: HashMap<String, ServerConfig> = HashMap::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|(id, mut config)| {
            config.id = id.clone();
            (id, config)
        })
        .collect())
}

// `wires` sits next to the step's own fields, so split it off before the
// tagged step config is read.
fn deserialize_steps_with_id<'de, D>(deserializer: D) -> Result<HashMap<String, StepConfig>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    let raw: HashMap<String, Value> = HashMap::deserialize(deserializer)?;
    let mut out = HashMap::with_capacity(raw.len());
    for (id, mut value) in raw {
        let wires = match value.as_object_mut().and_then(|m| m.remove("wires")) {
            Some(w) => serde_json::from_value::<Vec<String>>(w)
                .map_err(|e| D::Error::custom(format!("step {id}: wires: {e}")))?,
            None => Vec::new(),
        };
        let step: Step =
            serde_json::from_value(value).map_err(|e| D::Error::custom(format!("step {id}: {e}")))?;
        out.insert(id.clone(), StepConfig { id, step, wires });
    }
    Ok(out)
}

fn serialize_steps<S>(steps: &HashMap<String, StepConfig>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    use serde::ser::{Error, SerializeMap};

    let mut map = serializer.serialize_map(Some(steps.len()))?;
    for (id, config) in steps {
        let mut value = serde_json::to_value(&config.step).map_err(S::Error::custom)?;
        if let (false, Some(obj)) = (config.wires.is_empty(), value.as_object_mut()) {
            obj.insert("wires".into(), Value::from(config.wires.clone()));
        }
        map.serialize_entry(id, &value)?;
    }
    map.end()
}

impl Flow {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), ..Default::default() }
    }

    pub fn with_server(mut self, server: ServerConfig) -> Self {
        self.servers.insert(server.id.clone(), server);
        self
    }

    pub fn with_step(mut self, step: StepConfig) -> Self {
        self.steps.insert(step.id.clone(), step);
        self
    }

    pub fn servers(&self) -> &HashMap<String, ServerConfig> {
        &self.servers
    }

    pub fn steps(&self) -> &HashMap<String, StepConfig> {
        &self.steps
    }

    /// Every step's server must be declared and every wire must lead to a step.
    pub fn validate(&self) -> Result<(), FlowError> {
        let mut ids: Vec<&String> = self.steps.keys().collect();
        ids.sort();
        for id in ids {
            let config = &self.steps[id];
            if let Some(server) = config.step.server().filter(|s| !self.servers.contains_key(*s)) {
                return Err(FlowError::UnknownServer { step: id.clone(), server: server.to_string() });
            }
            if let Some(target) = config.wires.iter().find(|t| !self.steps.contains_key(*t)) {
                return Err(FlowError::UnknownWire { step: id.clone(), target: target.clone() });
            }
        }
        Ok(())
    }

    /// Fills in credentials the flow file leaves out.
    pub async fn resolve_credentials(&mut self, config: &ConfigManager) {
        for server in self.servers.values_mut() {
            server.resolve_credentials(config).await;
        }
    }
}

pub fn load_flow_from_file(path: impl AsRef<Path>) -> Result<Flow, FlowError> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|e| FlowError::Io(format!("{}: {e}", path.display())))?;
    let flow: Flow =
        serde_yaml_bw::from_str(&text).map_err(|e| FlowError::Parse(format!("{}: {e}", path.display())))?;
    flow.validate()?;
    Ok(flow)
}

pub fn save_flow_to_file(path: impl AsRef<Path>, flow: &Flow) -> Result<(), FlowError> {
    let text = serde_yaml_bw::to_string(flow).map_err(|e| FlowError::Parse(e.to_string()))?;
    fs::write(path, text).map_err(|e| FlowError::Io(e.to_string()))
}

struct RunningStep {
    ctx: Arc<StepContext>,
    input: mpsc::UnboundedSender<FlowMessage>,
    wires: Vec<String>,
}

struct Running {
    flow_id: String,
    steps: HashMap<String, RunningStep>,
    tap: broadcast::Sender<(String, FlowMessage)>,
}

/// Drains one step's input queue. Messages are processed in arrival order unless the step
/// is [`concurrent`](crate::step::StepType::concurrent).
async fn work(step: Arc<Step>, ctx: Arc<StepContext>, mut input: mpsc::UnboundedReceiver<FlowMessage>) {
    loop {
        let msg = tokio::select! {
            _ = ctx.cancel_token().cancelled() => return,
            msg = input.recv() => match msg {
                Some(msg) => msg,
                None => return,
            },
        };
        if step.concurrent() {
            let step = step.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move {
                if let Err(e) = step.process(msg, &ctx).await {
                    ctx.error(&e.to_string());
                }
            });
        } else if let Err(e) = step.process(msg, &ctx).await {
            ctx.error(&e.to_string());
        }
    }
}

impl Running {
    /// Queues `msg` on step `id`.
    fn deliver(&self, id: &str, msg: FlowMessage) -> Result<(), FlowError> {
        let target = self.steps.get(id).ok_or_else(|| FlowError::UnknownStep(id.to_string()))?;
        if target.ctx.is_closed() || target.input.send(msg).is_err() {
            debug!(flow = %self.flow_id, step = %id, "step closed, message dropped");
        }
        Ok(())
    }

    async fn route(self: Arc<Self>, id: String, mut outputs: mpsc::UnboundedReceiver<FlowMessage>, cancel: CancellationToken) {
        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => return,
                msg = outputs.recv() => match msg {
                    Some(msg) => msg,
                    None => return,
                },
            };
            let _ = self.tap.send((id.clone(), msg.clone()));
            let Some(source) = self.steps.get(&id) else { return };
            for target in &source.wires {
                if let Err(e) = self.deliver(target, msg.clone()) {
                    warn!(flow = %self.flow_id, step = %id, "{e}");
                }
            }
        }
    }
}

/// A started flow.
pub struct FlowRuntime {
    running: Arc<Running>,
    cancel: CancellationToken,
}

impl FlowRuntime {
    /// Creates every step's context, starts routing outputs along the wires and then runs
    /// each step's `start`. Start failures are reported, the flow keeps running.
    pub async fn start(
        flow: Flow,
        connections: &ConnectionManager,
        reporter: Arc<dyn StepReporter>,
    ) -> Result<Self, FlowError> {
        flow.validate()?;
        let cancel = CancellationToken::new();
        let servers: HashMap<String, Arc<ServerConfig>> =
            flow.servers.into_iter().map(|(id, config)| (id, Arc::new(config))).collect();

        let mut steps = HashMap::with_capacity(flow.steps.len());
        let mut outputs = Vec::with_capacity(flow.steps.len());
        let mut workers = Vec::with_capacity(flow.steps.len());
        for (id, config) in flow.steps {
            let server = match config.step.server() {
                Some(name) => Some(servers.get(name).cloned().ok_or_else(|| FlowError::UnknownServer {
                    step: id.clone(),
                    server: name.to_string(),
                })?),
                None => None,
            };
            let (tx, rx) = mpsc::unbounded_channel();
            let ctx = StepContext::new(id.clone(), server, connections, tx, reporter.clone(), cancel.child_token());
            outputs.push((id.clone(), rx));
            let (input, queue) = mpsc::unbounded_channel();
            let step = Arc::new(config.step);
            workers.push((step, ctx.clone(), queue));
            steps.insert(id, RunningStep { ctx, input, wires: config.wires });
        }

        let (tap, _) = broadcast::channel(TAP_CAPACITY);
        let running = Arc::new(Running { flow_id: flow.id, steps, tap });
        for (id, rx) in outputs {
            tokio::spawn(running.clone().route(id, rx, cancel.clone()));
        }

        let starts = workers.into_iter().map(|(step, ctx, queue)| async move {
            if let Err(e) = step.start(&ctx).await {
                error!(step = %ctx.step_id(), "start failed: {e}");
                ctx.error(&format!("start failed: {e}"));
            }
            tokio::spawn(work(step, ctx, queue));
        });
        join_all(starts).await;
        info!(flow = %running.flow_id, steps = running.steps.len(), "flow started");

        Ok(Self { running, cancel })
    }

    pub fn id(&self) -> &str {
        &self.running.flow_id
    }

    /// Feeds a message into a step, as if it arrived on one of its wires.
    pub fn inject(&self, step: &str, msg: FlowMessage) -> Result<(), FlowError> {
        self.running.deliver(step, msg)
    }

    /// Every message any step emits, tagged with the emitting step's id.
    pub fn tap(&self) -> broadcast::Receiver<(String, FlowMessage)> {
        self.running.tap.subscribe()
    }

    /// Stops routing, cancels every step's background work and returns the connection leases.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        for s in self.running.steps.values() {
            s.ctx.close().await;
        }
        info!(flow = %self.running.flow_id, "flow stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::{EventEmitStep, RpcResponseStep};

    const FLOW: &str = r#"
id: greeter
title: Greeter
servers:
  ds:
    host: ds.local
    port: 6021
steps:
  provide:
    type: rpc_provide
    server: ds
    method: greet
    wires: [reply]
  reply:
    type: rpc_response
"#;

    #[test]
    fn loads_servers_and_steps_with_ids() {
        let flow: Flow = serde_yaml_bw::from_str(FLOW).unwrap();
        flow.validate().unwrap();

        let ds = &flow.servers()["ds"];
        assert_eq!(ds.id, "ds");
        assert_eq!(ds.url(), "ds.local:6021");
        assert_eq!(ds.reconnect_delay, 5000);

        let provide = &flow.steps()["provide"];
        assert_eq!(provide.id, "provide");
        assert_eq!(provide.step.type_name(), "rpc_provide");
        assert_eq!(provide.wires, vec!["reply".to_string()]);
        assert!(flow.steps()["reply"].wires.is_empty());
    }

    #[test]
    fn unknown_server_and_wire_are_rejected() {
        let flow = Flow::new("f").with_step(StepConfig::new(
            "emit",
            Step(Box::new(EventEmitStep { server: "nope".into(), event: "x".into() })),
        ));
        assert_eq!(
            flow.validate(),
            Err(FlowError::UnknownServer { step: "emit".into(), server: "nope".into() })
        );

        let flow = Flow::new("f")
            .with_step(StepConfig::new("reply", Step(Box::new(RpcResponseStep {}))).wired_to(&["gone"]));
        assert_eq!(
            flow.validate(),
            Err(FlowError::UnknownWire { step: "reply".into(), target: "gone".into() })
        );
    }

    #[test]
    fn unknown_step_type_is_a_parse_error() {
        let yaml = "id: f\nsteps:\n  a:\n    type: teleport\n";
        assert!(serde_yaml_bw::from_str::<Flow>(yaml).is_err());
    }

    #[test]
    fn save_and_load_keep_wires() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("flow.yaml");
        let flow: Flow = serde_yaml_bw::from_str(FLOW).unwrap();

        save_flow_to_file(&path, &flow).unwrap();
        let loaded = load_flow_from_file(&path).unwrap();
        assert_eq!(loaded.steps()["provide"].wires, vec!["reply".to_string()]);
        assert_eq!(loaded.servers()["ds"].port, 6021);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        assert!(matches!(load_flow_from_file("/nonexistent/flow.yaml"), Err(FlowError::Io(_))));
    }
}
