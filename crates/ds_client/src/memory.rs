//! An in-process records / events / RPC server.
//!
//! `MemoryServer` implements [`Connector`]; each `connect` yields a `MemoryClient` sharing the
//! server's records, event channels and RPC providers. The server is meant for local runs and
//! tests, so it exposes knobs to inject faults:
//!
//! * `fail_transport` raises a transport error on every live client,
//! * `refuse_connections` makes `connect` fail,
//! * `reject_logins` / `add_user` control authentication,
//! * `set_ready_delay` / `set_login_delay` stretch the asynchronous readiness points.
//!
//! Every `connect` call is logged with its `tokio::time::Instant`, which makes reconnect
//! timing observable under tokio's paused clock.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use crate::client::{Connector, DsClient, RpcInvocation, RpcResponse, Subscription};
use crate::message::{ClientError, ClientOptions, ConnectionState, Credentials, RpcError};
use crate::path;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct RecordWatcher {
    client_id: u64,
    path: Option<String>,
    tx: mpsc::UnboundedSender<Value>,
}

struct RecordEntry {
    data: Value,
    watchers: Vec<RecordWatcher>,
}

impl Default for RecordEntry {
    fn default() -> Self {
        // a record that was never written reads as an empty document
        Self { data: Value::Object(Default::default()), watchers: Vec::new() }
    }
}

struct Listener<T> {
    client_id: u64,
    tx: mpsc::UnboundedSender<T>,
}

#[derive(Default)]
struct ServerState {
    records: Mutex<HashMap<String, RecordEntry>>,
    events: Mutex<HashMap<String, Vec<Listener<Value>>>>,
    providers: Mutex<HashMap<String, Vec<Listener<RpcInvocation>>>>,
    round_robin: AtomicUsize,
    users: DashMap<String, String>,
    clients: Mutex<Vec<Arc<MemoryClient>>>,
    attempts: Mutex<Vec<Instant>>,
    next_client: AtomicU64,
    refuse_connections: AtomicBool,
    reject_logins: AtomicBool,
    login_delay: Mutex<Duration>,
    ready_delays: DashMap<String, Duration>,
    logins: AtomicUsize,
}

impl ServerState {
    fn drop_client(&self, client_id: u64) {
        for entry in lock(&self.records).values_mut() {
            entry.watchers.retain(|w| w.client_id != client_id);
        }
        for listeners in lock(&self.events).values_mut() {
            listeners.retain(|l| l.client_id != client_id);
        }
        for listeners in lock(&self.providers).values_mut() {
            listeners.retain(|l| l.client_id != client_id);
        }
        lock(&self.clients).retain(|c| c.id != client_id);
    }

    fn write_record(&self, name: &str, path: Option<&str>, value: Value) {
        let mut records = lock(&self.records);
        let entry = records.entry(name.to_string()).or_default();
        let before = entry.data.clone();
        match path {
            Some(p) => path::set(&mut entry.data, p, value),
            None => entry.data = value,
        }
        if before == entry.data {
            return;
        }
        let after = entry.data.clone();
        entry.watchers.retain(|w| {
            let (old, new) = match &w.path {
                Some(p) => (path::get(&before, p), path::get(&after, p)),
                None => (Some(&before), Some(&after)),
            };
            if old == new {
                return !w.tx.is_closed();
            }
            w.tx.send(new.cloned().unwrap_or(Value::Null)).is_ok()
        });
    }

    fn dispatch_event(&self, channel: &str, data: Value) -> usize {
        let mut events = lock(&self.events);
        let Some(listeners) = events.get_mut(channel) else {
            return 0;
        };
        listeners.retain(|l| l.tx.send(data.clone()).is_ok());
        listeners.len()
    }

    /// Hands the invocation to the next live provider, round robin.
    fn route_invocation(&self, mut invocation: RpcInvocation) -> Result<(), RpcError> {
        let mut providers = lock(&self.providers);
        let Some(listeners) = providers.get_mut(&invocation.method) else {
            return Err(RpcError::NoProvider);
        };
        listeners.retain(|l| !l.tx.is_closed());
        while !listeners.is_empty() {
            let idx = self.round_robin.fetch_add(1, Ordering::Relaxed) % listeners.len();
            match listeners[idx].tx.send(invocation) {
                Ok(()) => return Ok(()),
                Err(mpsc::error::SendError(back)) => {
                    invocation = back;
                    listeners.remove(idx);
                }
            }
        }
        Err(RpcError::NoProvider)
    }
}

/// Shared in-process backend. Cheap to clone.
#[derive(Clone, Default)]
pub struct MemoryServer {
    state: Arc<ServerState>,
}

impl MemoryServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts logins to the registered users. With no users every login succeeds.
    pub fn add_user(&self, username: &str, password: &str) {
        self.state.users.insert(username.to_string(), password.to_string());
    }

    pub fn reject_logins(&self, reject: bool) {
        self.state.reject_logins.store(reject, Ordering::SeqCst);
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.state.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    pub fn set_login_delay(&self, delay: Duration) {
        *lock(&self.state.login_delay) = delay;
    }

    /// Delay before `record` becomes ready for each client that reads it.
    pub fn set_ready_delay(&self, record: &str, delay: Duration) {
        self.state.ready_delays.insert(record.to_string(), delay);
    }

    /// Raises a transport error on every live client.
    pub fn fail_transport(&self, reason: &str) {
        let clients: Vec<Arc<MemoryClient>> = lock(&self.state.clients).clone();
        warn!(clients = clients.len(), "memory server: injecting transport failure: {}", reason);
        for client in clients {
            client.raise(ClientError::ConnectionLost(reason.to_string()));
        }
    }

    /// Instants of every `connect` call, refused ones included.
    pub fn connect_attempts(&self) -> Vec<Instant> {
        lock(&self.state.attempts).clone()
    }

    /// Clients that are connected and not yet closed.
    pub fn live_clients(&self) -> usize {
        lock(&self.state.clients).len()
    }

    /// Number of login calls received.
    pub fn login_count(&self) -> usize {
        self.state.logins.load(Ordering::SeqCst)
    }

    pub fn record(&self, name: &str) -> Value {
        lock(&self.state.records)
            .get(name)
            .map(|e| e.data.clone())
            .unwrap_or(Value::Null)
    }

    pub fn set_record(&self, name: &str, path: Option<&str>, value: Value) {
        self.state.write_record(name, path, value);
    }

    /// Emits an event as if another client had published it.
    pub fn emit(&self, channel: &str, data: Value) -> usize {
        self.state.dispatch_event(channel, data)
    }

    /// Number of backend listeners currently registered on `channel`.
    pub fn event_listeners(&self, channel: &str) -> usize {
        let mut events = lock(&self.state.events);
        match events.get_mut(channel) {
            Some(listeners) => {
                listeners.retain(|l| !l.tx.is_closed());
                listeners.len()
            }
            None => 0,
        }
    }

    /// Number of live watchers on record `name`.
    pub fn record_watchers(&self, name: &str) -> usize {
        let mut records = lock(&self.state.records);
        match records.get_mut(name) {
            Some(entry) => {
                entry.watchers.retain(|w| !w.tx.is_closed());
                entry.watchers.len()
            }
            None => 0,
        }
    }

    /// Number of live providers registered for `method`.
    pub fn providers(&self, method: &str) -> usize {
        let mut providers = lock(&self.state.providers);
        match providers.get_mut(method) {
            Some(listeners) => {
                listeners.retain(|l| !l.tx.is_closed());
                listeners.len()
            }
            None => 0,
        }
    }

    /// Invokes a provided method as a remote requester with arbitrary positional arguments.
    pub async fn call(&self, method: &str, args: Vec<Value>, wait: Duration) -> Result<Value, RpcError> {
        let (response, rx) = RpcResponse::new(method);
        self.state.route_invocation(RpcInvocation {
            method: method.to_string(),
            args,
            response,
        })?;
        await_response(rx, wait).await
    }
}

impl fmt::Debug for MemoryServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryServer")
            .field("live_clients", &self.live_clients())
            .finish()
    }
}

async fn await_response(
    rx: tokio::sync::oneshot::Receiver<Result<Value, String>>,
    wait: Duration,
) -> Result<Value, RpcError> {
    match timeout(wait, rx).await {
        Ok(Ok(Ok(value))) => Ok(value),
        Ok(Ok(Err(reason))) => Err(RpcError::Provider(reason)),
        // the provider dropped the handle without answering
        Ok(Err(_)) => Err(RpcError::ResponseTimeout),
        Err(_) => Err(RpcError::ResponseTimeout),
    }
}

#[async_trait]
impl Connector for MemoryServer {
    async fn connect(&self, url: &str, options: ClientOptions) -> Result<Arc<dyn DsClient>, ClientError> {
        lock(&self.state.attempts).push(Instant::now());
        if self.state.refuse_connections.load(Ordering::SeqCst) {
            return Err(ClientError::Connect {
                url: url.to_string(),
                reason: "connection refused".into(),
            });
        }
        let id = self.state.next_client.fetch_add(1, Ordering::SeqCst);
        let (errors, _) = broadcast::channel(16);
        let client = Arc::new(MemoryClient {
            id,
            url: url.to_string(),
            options,
            server: self.state.clone(),
            state: Mutex::new(ConnectionState::AwaitingAuthentication),
            errors,
            ready: Mutex::new(HashSet::new()),
        });
        lock(&self.state.clients).push(client.clone());
        info!(client = id, %url, "memory server: client connected");
        Ok(client as Arc<dyn DsClient>)
    }
}

/// One connection to a [`MemoryServer`].
pub struct MemoryClient {
    id: u64,
    url: String,
    options: ClientOptions,
    server: Arc<ServerState>,
    state: Mutex<ConnectionState>,
    errors: broadcast::Sender<ClientError>,
    ready: Mutex<HashSet<String>>,
}

impl MemoryClient {
    fn raise(&self, err: ClientError) {
        *lock(&self.state) = ConnectionState::Error;
        self.server.drop_client(self.id);
        let _ = self.errors.send(err);
    }

    fn ensure_open(&self) -> Result<(), ClientError> {
        match *lock(&self.state) {
            ConnectionState::Open => Ok(()),
            ConnectionState::Closed => Err(ClientError::Closed),
            ConnectionState::Error => Err(ClientError::ConnectionLost(self.url.clone())),
            _ => Err(ClientError::NotAuthenticated),
        }
    }

    async fn when_ready(&self, name: &str) -> Result<(), ClientError> {
        self.ensure_open()?;
        let first_read = lock(&self.ready).insert(name.to_string());
        if first_read {
            if let Some(delay) = self.server.ready_delays.get(name).map(|d| *d.value()) {
                sleep(delay).await;
            }
        }
        self.ensure_open()
    }
}

impl fmt::Debug for MemoryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryClient")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("state", &self.connection_state())
            .finish()
    }
}

#[async_trait]
impl DsClient for MemoryClient {
    fn connection_state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    async fn login(&self, credentials: &Credentials) -> Result<(), ClientError> {
        match self.connection_state() {
            ConnectionState::Open => return Ok(()),
            ConnectionState::Closed => return Err(ClientError::Closed),
            ConnectionState::Error => return Err(ClientError::ConnectionLost(self.url.clone())),
            _ => {}
        }
        *lock(&self.state) = ConnectionState::Authenticating;
        self.server.logins.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.server.login_delay);
        if !delay.is_zero() {
            sleep(delay).await;
        }

        let accepted = !self.server.reject_logins.load(Ordering::SeqCst)
            && (self.server.users.is_empty()
                || self
                    .server
                    .users
                    .get(&credentials.username)
                    .is_some_and(|pw| *pw.value() == credentials.password));

        let mut state = lock(&self.state);
        if *state != ConnectionState::Authenticating {
            // closed or failed while the login was in flight
            return Err(ClientError::ConnectionLost(self.url.clone()));
        }
        if accepted {
            *state = ConnectionState::Open;
            debug!(client = self.id, user = %credentials.username, "memory server: login accepted");
            Ok(())
        } else {
            *state = ConnectionState::AwaitingAuthentication;
            Err(ClientError::Login("INVALID_AUTH_DATA".into()))
        }
    }

    fn transport_errors(&self) -> broadcast::Receiver<ClientError> {
        self.errors.subscribe()
    }

    async fn close(&self) {
        *lock(&self.state) = ConnectionState::Closed;
        self.server.drop_client(self.id);
        debug!(client = self.id, "memory server: client closed");
    }

    async fn record_snapshot(&self, name: &str) -> Result<Value, ClientError> {
        self.when_ready(name).await?;
        Ok(lock(&self.server.records)
            .get(name)
            .map(|e| e.data.clone())
            .unwrap_or_else(|| Value::Object(Default::default())))
    }

    async fn record_set(&self, name: &str, path: Option<&str>, value: Value) -> Result<(), ClientError> {
        self.ensure_open()?;
        self.server.write_record(name, path, value);
        Ok(())
    }

    async fn record_subscribe(&self, name: &str, path: Option<&str>) -> Result<Subscription, ClientError> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.server.records)
            .entry(name.to_string())
            .or_default()
            .watchers
            .push(RecordWatcher {
                client_id: self.id,
                path: path.map(str::to_string),
                tx,
            });
        Ok(rx)
    }

    async fn event_emit(&self, channel: &str, data: Value) -> Result<(), ClientError> {
        self.ensure_open()?;
        self.server.dispatch_event(channel, data);
        Ok(())
    }

    async fn event_subscribe(&self, channel: &str) -> Result<Subscription, ClientError> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.server.events)
            .entry(channel.to_string())
            .or_default()
            .push(Listener { client_id: self.id, tx });
        Ok(rx)
    }

    async fn rpc_make(&self, method: &str, data: Value) -> Result<Value, RpcError> {
        self.ensure_open()?;
        let (response, rx) = RpcResponse::new(method);
        self.server.route_invocation(RpcInvocation {
            method: method.to_string(),
            args: vec![data],
            response,
        })?;
        await_response(rx, self.options.rpc_response_timeout).await
    }

    async fn rpc_provide(&self, method: &str) -> Result<mpsc::UnboundedReceiver<RpcInvocation>, ClientError> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.server.providers)
            .entry(method.to_string())
            .or_default()
            .push(Listener { client_id: self.id, tx });
        Ok(rx)
    }
}
