use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::DashMap;
use ds_client::{ClientError, ConnectionState, Connector, DsClient};
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::dispatcher::{self, EventDispatcher};
use super::state::LinkState;
use crate::config::ServerConfig;
use crate::error::{ConnectionError, StepError};
use crate::status::NodeStatus;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Registry of shared connections, keyed by server configuration id.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    links: DashMap<String, Arc<ServerLink>>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn Connector>) -> Arc<Self> {
        Arc::new(Self { connector, links: DashMap::new() })
    }

    /// The link for `config.id`, created on first use. No connection is opened here.
    pub fn link(&self, config: &Arc<ServerConfig>) -> Arc<ServerLink> {
        let entry = self
            .links
            .entry(config.id.clone())
            .or_insert_with(|| ServerLink::new(config.clone(), self.connector.clone()));
        if entry.value().config.as_ref() != config.as_ref() {
            warn!(server = %config.id, "server id already bound to a different configuration, keeping the first");
        }
        entry.value().clone()
    }

    pub fn get(&self, id: &str) -> Option<Arc<ServerLink>> {
        self.links.get(id).map(|l| l.value().clone())
    }

    pub fn lease(&self, config: &Arc<ServerConfig>) -> Lease {
        self.link(config).lease()
    }

    pub async fn acquire(&self, config: &Arc<ServerConfig>) -> Result<Arc<dyn DsClient>, ConnectionError> {
        self.link(config).acquire().await
    }

    /// Closes every connection for good.
    pub async fn shutdown(&self) {
        let links: Vec<Arc<ServerLink>> = self.links.iter().map(|l| l.value().clone()).collect();
        for link in links {
            link.shutdown().await;
        }
        self.links.clear();
        info!("connection manager shut down");
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("links", &self.links.len())
            .finish()
    }
}

#[derive(Default)]
struct LinkInner {
    client: Option<Arc<dyn DsClient>>,
    /// Bumped on every open and every teardown; stale transport watchers compare against it.
    generation: u64,
    last_error: Option<String>,
}

/// The shared connection to one server and its state machine.
pub struct ServerLink {
    config: Arc<ServerConfig>,
    connector: Arc<dyn Connector>,
    inner: Mutex<LinkInner>,
    state: watch::Sender<LinkState>,
    status: watch::Sender<NodeStatus>,
    /// Serialises connect, login and teardown. Record and RPC traffic never takes it.
    connect_lock: tokio::sync::Mutex<()>,
    leases: AtomicUsize,
    reconnecting: AtomicBool,
    /// Cancels the background tasks of the current session (reconnect loop, transport watcher,
    /// event pumps). Replaced whenever the last lease goes.
    session: Mutex<CancellationToken>,
    closed: CancellationToken,
    pub(crate) dispatcher: EventDispatcher,
}

impl ServerLink {
    fn new(config: Arc<ServerConfig>, connector: Arc<dyn Connector>) -> Arc<Self> {
        let closed = CancellationToken::new();
        Arc::new(Self {
            config,
            connector,
            inner: Mutex::new(LinkInner::default()),
            state: watch::Sender::new(LinkState::Idle),
            status: watch::Sender::new(NodeStatus::idle()),
            connect_lock: tokio::sync::Mutex::new(()),
            leases: AtomicUsize::new(0),
            reconnecting: AtomicBool::new(false),
            session: Mutex::new(closed.child_token()),
            closed,
            dispatcher: EventDispatcher::default(),
        })
    }

    pub fn config(&self) -> &Arc<ServerConfig> {
        &self.config
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    pub fn states(&self) -> watch::Receiver<LinkState> {
        self.state.subscribe()
    }

    pub fn statuses(&self) -> watch::Receiver<NodeStatus> {
        self.status.subscribe()
    }

    pub fn lease_count(&self) -> usize {
        self.leases.load(Ordering::SeqCst)
    }

    pub fn last_error(&self) -> Option<String> {
        lock(&self.inner).last_error.clone()
    }

    pub fn lease(self: &Arc<Self>) -> Lease {
        let count = self.leases.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(server = %self.config.id, leases = count, "lease taken");
        Lease { link: self.clone(), released: AtomicBool::new(false) }
    }

    fn set_state(&self, state: LinkState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(server = %self.config.id, from = %previous, to = %state, "link state");
        }
    }

    fn set_status(&self, status: NodeStatus) {
        self.status.send_replace(status);
    }

    pub(crate) fn session_token(&self) -> CancellationToken {
        lock(&self.session).clone()
    }

    fn reset_session(&self) {
        let old = std::mem::replace(&mut *lock(&self.session), self.closed.child_token());
        old.cancel();
    }

    fn open_client(&self) -> Option<Arc<dyn DsClient>> {
        if self.state() != LinkState::Open {
            return None;
        }
        lock(&self.inner)
            .client
            .clone()
            .filter(|c| c.connection_state() == ConnectionState::Open)
    }

    /// Generation of a link still marked `Open` whose client has already failed, before its
    /// transport watcher has taken over.
    fn lost_generation(&self) -> Option<u64> {
        if self.state() != LinkState::Open {
            return None;
        }
        let inner = lock(&self.inner);
        inner
            .client
            .as_ref()
            .filter(|c| c.connection_state() != ConnectionState::Open)
            .map(|_| inner.generation)
    }

    /// Moves the link to `Closing` if `generation` is still the live one, so acquirers wait
    /// for the scheduled reconnect instead of connecting on their own.
    fn mark_lost(&self, generation: u64) {
        let inner = lock(&self.inner);
        if inner.generation == generation && self.state() == LinkState::Open {
            self.set_state(LinkState::Closing);
        }
    }

    fn login_error(&self) -> ConnectionError {
        ConnectionError::Login {
            server: self.config.id.clone(),
            reason: self.last_error().unwrap_or_else(|| "login rejected".to_string()),
        }
    }

    /// A ready client. Concurrent callers share a single connect and login; callers arriving
    /// while the link recovers from a transport error wait for the reconnect to finish.
    pub async fn acquire(self: &Arc<Self>) -> Result<Arc<dyn DsClient>, ConnectionError> {
        let mut waited = false;
        loop {
            if self.closed.is_cancelled() {
                return Err(ConnectionError::Closed(self.config.id.clone()));
            }
            if let Some(client) = self.open_client() {
                return Ok(client);
            }
            if let Some(generation) = self.lost_generation() {
                self.mark_lost(generation);
            }
            if self.state().is_recovering() {
                self.wait_recovered().await?;
                waited = true;
                continue;
            }

            let _guard = self.connect_lock.lock().await;
            if let Some(client) = self.open_client() {
                return Ok(client);
            }
            if let Some(generation) = self.lost_generation() {
                self.mark_lost(generation);
                continue;
            }
            match self.state() {
                s if s.is_recovering() => continue,
                // the reconnect we waited for ended in a rejected login
                LinkState::LoginFailed if waited => return Err(self.login_error()),
                LinkState::Closed => return Err(ConnectionError::Closed(self.config.id.clone())),
                _ => {}
            }
            return match self.establish().await {
                Err(e @ ConnectionError::Transport { .. }) => {
                    self.start_reconnect();
                    Err(e)
                }
                other => other,
            };
        }
    }

    async fn wait_recovered(&self) -> Result<(), ConnectionError> {
        let mut states = self.state.subscribe();
        tokio::select! {
            _ = self.closed.cancelled() => Err(ConnectionError::Closed(self.config.id.clone())),
            r = async { states.wait_for(|s| !s.is_recovering()).await.map(|_| ()) } => {
                r.map_err(|_| ConnectionError::Closed(self.config.id.clone()))
            }
        }
    }

    /// Opens the transport when needed and logs in. Callers hold `connect_lock`.
    async fn establish(self: &Arc<Self>) -> Result<Arc<dyn DsClient>, ConnectionError> {
        let existing = lock(&self.inner).client.clone().filter(|c| {
            !matches!(c.connection_state(), ConnectionState::Closed | ConnectionState::Error)
        });
        let client = match existing {
            Some(client) => client,
            None => {
                self.set_state(LinkState::Connecting);
                self.set_status(NodeStatus::connecting());
                info!(server = %self.config.id, url = %self.config.url(), "connecting");
                let client = self
                    .connector
                    .connect(&self.config.url(), self.config.client_options())
                    .await
                    .map_err(|e| self.transport_failed(e.to_string()))?;
                lock(&self.inner).client = Some(client.clone());
                client
            }
        };
        let errors = client.transport_errors();

        self.set_state(LinkState::Authenticating);
        match client.login(&self.config.login_credentials()).await {
            Ok(()) => {
                let generation = {
                    let mut inner = lock(&self.inner);
                    inner.generation += 1;
                    inner.last_error = None;
                    inner.generation
                };
                self.set_state(LinkState::Open);
                self.set_status(NodeStatus::connected());
                info!(server = %self.config.id, "connection open");
                self.watch_transport(errors, generation);
                Ok(client)
            }
            Err(ClientError::Login(reason)) => {
                error!(server = %self.config.id, "login failed: {}", reason);
                lock(&self.inner).last_error = Some(reason.clone());
                self.set_state(LinkState::LoginFailed);
                self.set_status(NodeStatus::error(format!("login failed: {reason}")));
                Err(ConnectionError::Login { server: self.config.id.clone(), reason })
            }
            Err(other) => {
                lock(&self.inner).client = None;
                client.close().await;
                Err(self.transport_failed(other.to_string()))
            }
        }
    }

    fn transport_failed(&self, reason: String) -> ConnectionError {
        warn!(server = %self.config.id, "transport error: {}", reason);
        lock(&self.inner).last_error = Some(reason.clone());
        self.set_status(NodeStatus::error(&reason));
        ConnectionError::Transport { server: self.config.id.clone(), reason }
    }

    fn watch_transport(self: &Arc<Self>, mut errors: broadcast::Receiver<ClientError>, generation: u64) {
        let link = self.clone();
        let token = self.session_token();
        tokio::spawn(async move {
            let reason = tokio::select! {
                _ = token.cancelled() => return,
                r = errors.recv() => match r {
                    Ok(err) => err.to_string(),
                    Err(broadcast::error::RecvError::Lagged(n)) => format!("{n} transport errors missed"),
                    Err(broadcast::error::RecvError::Closed) => return,
                },
            };
            link.mark_lost(generation);
            link.on_transport_error(generation, reason).await;
        });
    }

    async fn on_transport_error(self: &Arc<Self>, generation: u64, reason: String) {
        let _guard = self.connect_lock.lock().await;
        let client = {
            let mut inner = lock(&self.inner);
            if inner.generation != generation {
                return;
            }
            inner.generation += 1;
            inner.last_error = Some(reason.clone());
            inner.client.take()
        };
        warn!(server = %self.config.id, "connection lost: {}", reason);
        self.set_state(LinkState::Closing);
        self.set_status(NodeStatus::error(&reason));
        if let Some(client) = client {
            client.close().await;
        }
        self.start_reconnect();
    }

    /// Enters `Backoff` and spawns the reconnect loop unless one is already running.
    fn start_reconnect(self: &Arc<Self>) {
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        self.set_state(LinkState::Backoff);
        let link = self.clone();
        let token = self.session_token();
        tokio::spawn(async move { link.reconnect_loop(token).await });
    }

    async fn reconnect_loop(self: Arc<Self>, token: CancellationToken) {
        let delay = self.config.reconnect_delay();
        let mut attempt: u64 = 0;
        loop {
            self.set_state(LinkState::Backoff);
            info!(server = %self.config.id, delay_ms = delay.as_millis() as u64, "reconnecting after delay");
            tokio::select! {
                _ = token.cancelled() => {
                    self.reconnecting.store(false, Ordering::SeqCst);
                    return;
                }
                _ = sleep(delay) => {}
            }

            let _guard = self.connect_lock.lock().await;
            if token.is_cancelled() {
                self.reconnecting.store(false, Ordering::SeqCst);
                return;
            }
            attempt += 1;
            match self.establish().await {
                Err(ConnectionError::Transport { reason, .. }) => {
                    // set under the lock so waiting acquirers keep waiting
                    self.set_state(LinkState::Backoff);
                    debug!(server = %self.config.id, attempt, "reconnect failed: {}", reason);
                }
                outcome => {
                    if let Err(e) = &outcome {
                        error!(server = %self.config.id, attempt, "reconnect stopped: {}", e);
                    }
                    // cleared under the lock so a failure of the new connection can start a fresh loop
                    self.reconnecting.store(false, Ordering::SeqCst);
                    return;
                }
            }
        }
    }

    async fn release(&self) {
        let previous = self
            .leases
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .unwrap_or(0);
        if previous > 1 {
            debug!(server = %self.config.id, leases = previous - 1, "lease released");
            return;
        }
        let _guard = self.connect_lock.lock().await;
        if self.leases.load(Ordering::SeqCst) > 0 {
            return;
        }
        self.teardown(LinkState::Idle).await;
        info!(server = %self.config.id, "last lease released, connection closed");
    }

    /// Callers hold `connect_lock`.
    async fn teardown(&self, next: LinkState) {
        self.reset_session();
        self.dispatcher.clear();
        let client = {
            let mut inner = lock(&self.inner);
            inner.generation += 1;
            inner.client.take()
        };
        self.reconnecting.store(false, Ordering::SeqCst);
        if let Some(client) = client {
            client.close().await;
        }
        self.set_state(next);
        self.set_status(if next == LinkState::Closed { NodeStatus::closed() } else { NodeStatus::idle() });
    }

    pub async fn shutdown(&self) {
        self.closed.cancel();
        let _guard = self.connect_lock.lock().await;
        self.teardown(LinkState::Closed).await;
    }

    /// Runs `open` against a ready client, retrying after every link state change until it
    /// succeeds. `None` once `cancel` fires.
    pub async fn open_with<T, F, Fut>(self: &Arc<Self>, cancel: &CancellationToken, what: &str, open: F) -> Option<T>
    where
        F: Fn(Arc<dyn DsClient>) -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
    {
        loop {
            let mut states = self.states();
            let attempt = tokio::select! {
                _ = cancel.cancelled() => return None,
                r = self.acquire() => r,
            };
            match attempt {
                Ok(client) => match open(client).await {
                    Ok(opened) => return Some(opened),
                    Err(e) => debug!(server = %self.config.id, %what, "open failed: {}", e),
                },
                Err(e) => debug!(server = %self.config.id, %what, "waiting for connection: {}", e),
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                r = states.changed() => if r.is_err() { return None },
            }
        }
    }

    /// A receiver for `channel` sharing the link's single backend listener on it.
    pub async fn subscribe_event(self: &Arc<Self>, channel: &str) -> Result<broadcast::Receiver<Value>, StepError> {
        if let Some(rx) = self.dispatcher.join(channel) {
            return Ok(rx);
        }
        let client = self.acquire().await?;
        let subscription = client.event_subscribe(channel).await?;
        let (rx, fresh) = self.dispatcher.register(channel);
        if fresh {
            debug!(server = %self.config.id, %channel, "backend listener added");
            let token = self.session_token();
            tokio::spawn(dispatcher::pump(self.clone(), channel.to_string(), subscription, token));
        }
        Ok(rx)
    }
}

impl fmt::Debug for ServerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerLink")
            .field("server", &self.config.id)
            .field("state", &self.state())
            .field("leases", &self.lease_count())
            .finish()
    }
}

/// One step's claim on a shared connection. Release it explicitly on shutdown.
#[derive(Debug)]
pub struct Lease {
    link: Arc<ServerLink>,
    released: AtomicBool,
}

impl Lease {
    pub fn link(&self) -> &Arc<ServerLink> {
        &self.link
    }

    pub async fn client(&self) -> Result<Arc<dyn DsClient>, ConnectionError> {
        self.link.acquire().await
    }

    /// Idempotent; the connection closes when the last lease is released.
    pub async fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.link.release().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ds_client::MemoryServer;
    use std::time::Duration;

    fn setup() -> (MemoryServer, Arc<ConnectionManager>, Arc<ServerConfig>) {
        let server = MemoryServer::new();
        let manager = ConnectionManager::new(Arc::new(server.clone()));
        let config = Arc::new(ServerConfig::new("main", "localhost", 6020).with_credentials("u", "p"));
        (server, manager, config)
    }

    async fn wait_for_state(link: &ServerLink, state: LinkState) {
        let mut states = link.states();
        states.wait_for(|s| *s == state).await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_acquire_shares_one_connection() {
        let (server, manager, config) = setup();
        server.set_login_delay(Duration::from_millis(20));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            let config = config.clone();
            handles.push(tokio::spawn(async move { manager.acquire(&config).await }));
        }
        let mut clients = Vec::new();
        for h in handles {
            clients.push(h.await.unwrap().unwrap());
        }

        assert!(clients.iter().all(|c| Arc::ptr_eq(c, &clients[0])));
        assert_eq!(server.connect_attempts().len(), 1);
        assert_eq!(server.login_count(), 1);
        assert_eq!(server.live_clients(), 1);
    }

    #[tokio::test]
    async fn same_id_yields_same_link() {
        let (_server, manager, config) = setup();
        let a = manager.link(&config);
        let b = manager.link(&Arc::new(ServerConfig::new("main", "elsewhere", 1)));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.config().host, "localhost");
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_exactly_after_the_delay() {
        let (server, manager, config) = setup();
        let link = manager.link(&config);
        link.acquire().await.unwrap();

        server.fail_transport("socket hang up");
        wait_for_state(&link, LinkState::Backoff).await;
        wait_for_state(&link, LinkState::Open).await;

        let attempts = server.connect_attempts();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[1] - attempts[0], Duration::from_secs(5));
        assert_eq!(server.live_clients(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_after_transport_error_waits_out_the_delay() {
        let (server, manager, config) = setup();
        manager.acquire(&config).await.unwrap();

        let failed_at = tokio::time::Instant::now();
        server.fail_transport("socket hang up");
        let client = manager.acquire(&config).await.unwrap();

        assert_eq!(client.connection_state(), ConnectionState::Open);
        let attempts = server.connect_attempts();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[1] - failed_at, Duration::from_secs(5));
        assert_eq!(manager.link(&config).state(), LinkState::Open);
        assert_eq!(server.live_clients(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn keeps_retrying_while_the_server_refuses() {
        let (server, manager, config) = setup();
        let link = manager.link(&config);
        link.acquire().await.unwrap();

        server.refuse_connections(true);
        server.fail_transport("gone");
        sleep(Duration::from_secs(21)).await;

        let attempts = server.connect_attempts();
        assert_eq!(attempts.len(), 5);
        for pair in attempts.windows(2) {
            assert_eq!(pair[1] - pair[0], Duration::from_secs(5));
        }
        assert_eq!(link.state(), LinkState::Backoff);

        server.refuse_connections(false);
        let client = link.acquire().await.unwrap();
        assert_eq!(client.connection_state(), ConnectionState::Open);
        assert_eq!(server.connect_attempts().len(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn initial_refusal_schedules_a_reconnect() {
        let (server, manager, config) = setup();
        server.refuse_connections(true);
        let err = manager.acquire(&config).await.unwrap_err();
        assert!(matches!(err, ConnectionError::Transport { .. }));

        server.refuse_connections(false);
        let link = manager.link(&config);
        wait_for_state(&link, LinkState::Open).await;
        let attempts = server.connect_attempts();
        assert_eq!(attempts[1] - attempts[0], Duration::from_secs(5));
    }

    #[tokio::test]
    async fn rejected_login_is_reported_and_retried_on_next_acquire() {
        let (server, manager, config) = setup();
        server.add_user("u", "other");

        let err = manager.acquire(&config).await.unwrap_err();
        assert!(matches!(err, ConnectionError::Login { .. }));
        let link = manager.link(&config);
        assert_eq!(link.state(), LinkState::LoginFailed);
        assert!(link.statuses().borrow().text.starts_with("error - login failed"));

        server.add_user("u", "p");
        manager.acquire(&config).await.unwrap();
        assert_eq!(server.connect_attempts().len(), 1);
        assert_eq!(server.login_count(), 2);
    }

    #[tokio::test]
    async fn last_lease_closes_the_connection() {
        let (server, manager, config) = setup();
        let first = manager.lease(&config);
        let second = manager.lease(&config);
        first.client().await.unwrap();

        first.release().await;
        first.release().await;
        assert_eq!(server.live_clients(), 1);

        second.release().await;
        assert_eq!(server.live_clients(), 0);
        assert_eq!(manager.link(&config).state(), LinkState::Idle);
    }

    #[tokio::test]
    async fn shutdown_refuses_further_acquires() {
        let (server, manager, config) = setup();
        manager.acquire(&config).await.unwrap();
        let link = manager.link(&config);
        manager.shutdown().await;

        assert_eq!(server.live_clients(), 0);
        assert!(matches!(link.acquire().await, Err(ConnectionError::Closed(_))));
    }
}
