use std::sync::Arc;

use dashmap::DashMap;
use ds_client::Subscription;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::manager::ServerLink;

const CHANNEL_CAPACITY: usize = 256;

/// Fans one backend event subscription per channel out to every step listening on it.
#[derive(Debug, Default)]
pub struct EventDispatcher {
    channels: DashMap<String, broadcast::Sender<Value>>,
}

impl EventDispatcher {
    /// A receiver on an already-bound channel.
    pub fn join(&self, channel: &str) -> Option<broadcast::Receiver<Value>> {
        self.channels.get(channel).map(|tx| tx.subscribe())
    }

    /// Receiver for `channel`, and whether the channel was newly bound (the caller then owns
    /// the backend subscription).
    pub(crate) fn register(&self, channel: &str) -> (broadcast::Receiver<Value>, bool) {
        match self.channels.entry(channel.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(e) => (e.get().subscribe(), false),
            dashmap::mapref::entry::Entry::Vacant(e) => {
                let (tx, rx) = broadcast::channel(CHANNEL_CAPACITY);
                e.insert(tx);
                (rx, true)
            }
        }
    }

    pub fn channels(&self) -> Vec<String> {
        self.channels.iter().map(|e| e.key().clone()).collect()
    }

    pub fn subscribers(&self, channel: &str) -> usize {
        self.channels.get(channel).map(|tx| tx.receiver_count()).unwrap_or(0)
    }

    /// Delivers to every receiver. `false` once nobody listens and the channel was unbound.
    fn deliver(&self, channel: &str, value: Value) -> bool {
        let sent = match self.channels.get(channel) {
            Some(tx) => tx.send(value).is_ok(),
            None => return false,
        };
        sent || self.unbind_if_unused(channel).is_none()
    }

    fn unbind_if_unused(&self, channel: &str) -> Option<(String, broadcast::Sender<Value>)> {
        self.channels.remove_if(channel, |_, tx| tx.receiver_count() == 0)
    }

    pub(crate) fn clear(&self) {
        self.channels.clear();
    }
}

/// Forwards one backend subscription into the dispatcher, rebinding it after reconnects,
/// until the session ends or the last receiver is gone.
pub(crate) async fn pump(link: Arc<ServerLink>, channel: String, mut subscription: Subscription, token: CancellationToken) {
    let server = link.config().id.clone();
    loop {
        loop {
            let next = tokio::select! {
                _ = token.cancelled() => return,
                v = subscription.recv() => v,
            };
            let Some(value) = next else { break };
            if !link.dispatcher.deliver(&channel, value) {
                debug!(%server, %channel, "no listeners left, backend listener dropped");
                return;
            }
        }

        debug!(%server, %channel, "backend subscription ended, rebinding");
        subscription = loop {
            if link.dispatcher.subscribers(&channel) == 0 && link.dispatcher.unbind_if_unused(&channel).is_some() {
                return;
            }
            let mut states = link.states();
            let attempt = tokio::select! {
                _ = token.cancelled() => return,
                r = link.acquire() => r,
            };
            match attempt {
                Ok(client) => match client.event_subscribe(&channel).await {
                    Ok(sub) => break sub,
                    Err(e) => debug!(%server, %channel, "rebind failed: {}", e),
                },
                Err(e) => debug!(%server, %channel, "rebind waiting for connection: {}", e),
            }
            tokio::select! {
                _ = token.cancelled() => return,
                _ = states.changed() => {}
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn register_binds_once() {
        let d = EventDispatcher::default();
        let (_a, first) = d.register("topicX");
        let (_b, second) = d.register("topicX");
        assert!(first);
        assert!(!second);
        assert_eq!(d.subscribers("topicX"), 2);
        assert!(d.join("other").is_none());
    }

    #[tokio::test]
    async fn deliver_fans_out_and_unbinds_when_unused() {
        let d = EventDispatcher::default();
        let (mut a, _) = d.register("t");
        let mut b = d.join("t").unwrap();

        assert!(d.deliver("t", json!(42)));
        assert_eq!(a.recv().await.unwrap(), json!(42));
        assert_eq!(b.recv().await.unwrap(), json!(42));

        drop(a);
        drop(b);
        assert!(!d.deliver("t", json!(1)));
        assert!(d.channels().is_empty());
    }
}
