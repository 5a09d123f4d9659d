#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use ds_client::MemoryServer;
use dsflow::connection::ConnectionManager;
use dsflow::flow::{Flow, FlowRuntime};
use dsflow::message::FlowMessage;
use dsflow::status::RecordingReporter;
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};

pub const WAIT: Duration = Duration::from_secs(2);

pub struct Harness {
    pub server: MemoryServer,
    pub connections: Arc<ConnectionManager>,
    pub reporter: RecordingReporter,
    pub runtime: FlowRuntime,
    pub tap: broadcast::Receiver<(String, FlowMessage)>,
}

/// Loads `yaml` and starts it against a fresh in-process server.
pub async fn start(yaml: &str) -> Harness {
    let server = MemoryServer::new();
    start_on(server, yaml).await
}

pub async fn start_on(server: MemoryServer, yaml: &str) -> Harness {
    start_flow(server, parse(yaml)).await
}

pub fn parse(yaml: &str) -> Flow {
    serde_yaml_bw::from_str(yaml).expect("flow yaml")
}

pub async fn start_flow(server: MemoryServer, flow: Flow) -> Harness {
    let connections = ConnectionManager::new(Arc::new(server.clone()));
    let reporter = RecordingReporter::new();
    let runtime = FlowRuntime::start(flow, &connections, Arc::new(reporter.clone()))
        .await
        .expect("flow starts");
    let tap = runtime.tap();
    Harness { server, connections, reporter, runtime, tap }
}

impl Harness {
    /// Next message emitted by `step`, skipping other steps' output.
    pub async fn next_from(&mut self, step: &str) -> FlowMessage {
        let tap = &mut self.tap;
        timeout(WAIT, async {
            loop {
                match tap.recv().await {
                    Ok((id, msg)) if id == step => return msg,
                    Ok(_) => continue,
                    Err(e) => panic!("tap closed: {e}"),
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("no message from {step}"))
    }

    /// Everything emitted within `window`, tagged with the emitting step.
    pub async fn drain(&mut self, window: Duration) -> Vec<(String, FlowMessage)> {
        let mut out = Vec::new();
        let deadline = tokio::time::Instant::now() + window;
        while let Ok(Ok(item)) = tokio::time::timeout_at(deadline, self.tap.recv()).await {
            out.push(item);
        }
        out
    }
}

/// Polls `cond` until it holds, panicking after [`WAIT`].
pub async fn eventually<F: FnMut() -> bool>(what: &str, mut cond: F) {
    let waited = timeout(WAIT, async {
        while !cond() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}
