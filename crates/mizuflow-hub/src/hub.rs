// Subscription hub: one event loop owning the client registry.
//
// All mutations (subscribe, unsubscribe, broadcast delivery, heartbeat) are
// serialized through that loop, so the hot fan-out path takes no locks and
// per-client delivery order equals broadcast ingestion order. Delivery is a
// bounded `try_send`: a subscriber that stops draining its channel is evicted
// rather than allowed to stall everyone else.
use mizuflow_wire::EventMessage;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

pub type ClientId = u64;

/// What a subscriber reads from its channel: either a data event or a
/// liveness ping. Only the hub writes to the channel; dropping the write
/// side (eviction, unsubscribe, shutdown) is how a subscriber learns it is
/// disconnected.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Message(EventMessage),
    Ping,
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Interval between ping fan-outs. Clients treat prolonged silence as a
    /// dead connection, so this must stay well under their watchdog.
    pub heartbeat_interval: Duration,
    /// Per-subscriber channel capacity; a full channel marks the subscriber
    /// as a slow consumer.
    pub client_buffer: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(15),
            client_buffer: 128,
        }
    }
}

/// A registered subscriber: its id (for unsubscribe) and the read side of
/// its event channel.
#[derive(Debug)]
pub struct Subscription {
    pub id: ClientId,
    pub events: mpsc::Receiver<StreamEvent>,
}

enum Command {
    Subscribe {
        env: String,
        namespaces: HashSet<String>,
        reply: oneshot::Sender<Subscription>,
    },
    Unsubscribe {
        id: ClientId,
    },
    Broadcast(EventMessage),
}

/// Cloneable handle to the hub loop.
#[derive(Debug, Clone)]
pub struct Hub {
    commands: mpsc::Sender<Command>,
}

impl Hub {
    /// Spawns the hub event loop. The loop runs until `shutdown` fires, at
    /// which point every subscriber channel is closed.
    pub fn spawn(config: HubConfig, shutdown: CancellationToken) -> Self {
        let (commands, rx) = mpsc::channel(1024);
        tokio::spawn(run_loop(config, rx, shutdown));
        Self { commands }
    }

    /// Registers a subscriber for `env` and the given namespace set. A set
    /// containing `"*"` subscribes to everything (dashboard use).
    ///
    /// Returns `None` once the hub has shut down.
    pub async fn subscribe(
        &self,
        env: impl Into<String>,
        namespaces: HashSet<String>,
    ) -> Option<Subscription> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Subscribe {
                env: env.into(),
                namespaces,
                reply,
            })
            .await
            .ok()?;
        rx.await.ok()
    }

    /// Removes a subscriber and closes its channel. Safe to call for an
    /// already-evicted id.
    pub async fn unsubscribe(&self, id: ClientId) {
        let _ = self.commands.send(Command::Unsubscribe { id }).await;
    }

    /// Hands an event to the loop for fan-out. Returns false once the hub
    /// has shut down.
    pub async fn broadcast(&self, msg: EventMessage) -> bool {
        self.commands.send(Command::Broadcast(msg)).await.is_ok()
    }
}

struct ClientEntry {
    sender: mpsc::Sender<StreamEvent>,
    env: String,
    namespaces: HashSet<String>,
}

#[derive(Default)]
struct Registry {
    clients: HashMap<ClientId, ClientEntry>,
    // env -> namespace -> subscriber ids; the shard for narrow subscribers.
    by_env_namespace: HashMap<String, HashMap<String, HashSet<ClientId>>>,
    wildcards: HashSet<ClientId>,
    next_id: ClientId,
}

impl Registry {
    fn insert(&mut self, env: String, namespaces: HashSet<String>, buffer: usize) -> Subscription {
        let id = self.next_id;
        self.next_id += 1;
        let (sender, events) = mpsc::channel(buffer);
        if namespaces.contains("*") {
            self.wildcards.insert(id);
        } else {
            for namespace in &namespaces {
                self.by_env_namespace
                    .entry(env.clone())
                    .or_default()
                    .entry(namespace.clone())
                    .or_default()
                    .insert(id);
            }
        }
        self.clients.insert(
            id,
            ClientEntry {
                sender,
                env,
                namespaces,
            },
        );
        metrics::gauge!("mizuflow_online_subscribers").set(self.clients.len() as f64);
        Subscription { id, events }
    }

    fn remove(&mut self, id: ClientId) {
        let Some(entry) = self.clients.remove(&id) else {
            return;
        };
        self.wildcards.remove(&id);
        if let Some(shards) = self.by_env_namespace.get_mut(&entry.env) {
            for namespace in &entry.namespaces {
                if let Some(ids) = shards.get_mut(namespace) {
                    ids.remove(&id);
                    if ids.is_empty() {
                        shards.remove(namespace);
                    }
                }
            }
            if shards.is_empty() {
                self.by_env_namespace.remove(&entry.env);
            }
        }
        metrics::gauge!("mizuflow_online_subscribers").set(self.clients.len() as f64);
        // Dropping `entry.sender` closes the subscriber's channel.
    }

    fn targets_for(&self, msg: &EventMessage) -> Vec<ClientId> {
        let mut targets: Vec<ClientId> = self.wildcards.iter().copied().collect();
        if let Some(ids) = self
            .by_env_namespace
            .get(&msg.env)
            .and_then(|shards| shards.get(&msg.namespace))
        {
            targets.extend(ids.iter().copied());
        }
        targets
    }
}

async fn run_loop(
    config: HubConfig,
    mut commands: mpsc::Receiver<Command>,
    shutdown: CancellationToken,
) {
    let mut registry = Registry::default();
    let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
    // The first tick completes immediately; skip it so a fresh subscriber is
    // not greeted with a ping before any data.
    heartbeat.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!(subscribers = registry.clients.len(), "hub shutting down");
                return;
            }
            command = commands.recv() => {
                let Some(command) = command else { return };
                match command {
                    Command::Subscribe { env, namespaces, reply } => {
                        let subscription = registry.insert(env, namespaces, config.client_buffer);
                        let id = subscription.id;
                        if reply.send(subscription).is_err() {
                            // Caller went away before the registration completed.
                            registry.remove(id);
                        }
                    }
                    Command::Unsubscribe { id } => registry.remove(id),
                    Command::Broadcast(msg) => {
                        let targets = registry.targets_for(&msg);
                        deliver(&mut registry, StreamEvent::Message(msg), targets);
                        metrics::counter!("mizuflow_hub_broadcasts_total").increment(1);
                    }
                }
            }
            _ = heartbeat.tick() => {
                let everyone: Vec<ClientId> = registry.clients.keys().copied().collect();
                deliver(&mut registry, StreamEvent::Ping, everyone);
            }
        }
    }
}

fn deliver(registry: &mut Registry, event: StreamEvent, targets: Vec<ClientId>) {
    let mut evicted = Vec::new();
    for id in targets {
        let Some(entry) = registry.clients.get(&id) else {
            continue;
        };
        match entry.sender.try_send(event.clone()) {
            Ok(()) => {
                if matches!(event, StreamEvent::Message(_)) {
                    metrics::counter!("mizuflow_hub_pushes_total").increment(1);
                }
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(client = id, "evicting slow subscriber");
                metrics::counter!("mizuflow_hub_slow_consumer_evictions_total").increment(1);
                evicted.push(id);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => evicted.push(id),
        }
    }
    for id in evicted {
        registry.remove(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mizuflow_wire::{Action, FlagType};
    use std::time::Duration;

    fn msg(env: &str, namespace: &str, revision: i64) -> EventMessage {
        EventMessage {
            namespace: namespace.to_string(),
            env: env.to_string(),
            key: "k".to_string(),
            value: "v".to_string(),
            flag_type: FlagType::String,
            version: 1,
            revision,
            action: Action::Put,
        }
    }

    fn namespaces(names: &[&str]) -> HashSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    fn quiet_config() -> HubConfig {
        HubConfig {
            heartbeat_interval: Duration::from_secs(3600),
            client_buffer: 8,
        }
    }

    async fn recv_message(sub: &mut Subscription) -> EventMessage {
        loop {
            match tokio::time::timeout(Duration::from_secs(2), sub.events.recv())
                .await
                .expect("recv timeout")
            {
                Some(StreamEvent::Message(msg)) => return msg,
                Some(StreamEvent::Ping) => continue,
                None => panic!("channel closed"),
            }
        }
    }

    #[tokio::test]
    async fn broadcast_reaches_matching_shard_only() {
        let hub = Hub::spawn(quiet_config(), CancellationToken::new());
        let mut matching = hub
            .subscribe("dev", namespaces(&["default"]))
            .await
            .expect("subscribe");
        let mut other_ns = hub
            .subscribe("dev", namespaces(&["payments"]))
            .await
            .expect("subscribe");
        let mut other_env = hub
            .subscribe("prod", namespaces(&["default"]))
            .await
            .expect("subscribe");

        assert!(hub.broadcast(msg("dev", "default", 1)).await);
        let received = recv_message(&mut matching).await;
        assert_eq!(received.revision, 1);

        // The hub loop has processed the broadcast by now; the others must
        // have nothing queued.
        assert!(other_ns.events.try_recv().is_err());
        assert!(other_env.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn wildcard_receives_every_env_and_namespace() {
        let hub = Hub::spawn(quiet_config(), CancellationToken::new());
        let mut dashboard = hub
            .subscribe("", namespaces(&["*"]))
            .await
            .expect("subscribe");

        assert!(hub.broadcast(msg("dev", "default", 1)).await);
        assert!(hub.broadcast(msg("prod", "payments", 2)).await);

        assert_eq!(recv_message(&mut dashboard).await.revision, 1);
        assert_eq!(recv_message(&mut dashboard).await.revision, 2);
    }

    #[tokio::test]
    async fn slow_subscriber_is_evicted_and_others_continue() {
        let config = HubConfig {
            heartbeat_interval: Duration::from_secs(3600),
            client_buffer: 4,
        };
        let hub = Hub::spawn(config, CancellationToken::new());
        let mut slow = hub
            .subscribe("dev", namespaces(&["default"]))
            .await
            .expect("subscribe");
        let mut healthy = hub
            .subscribe("dev", namespaces(&["default"]))
            .await
            .expect("subscribe");

        // Overflow the slow subscriber's buffer while the healthy one drains.
        for rev in 1..=8 {
            assert!(hub.broadcast(msg("dev", "default", rev)).await);
            assert_eq!(recv_message(&mut healthy).await.revision, rev);
        }

        // The slow subscriber got the buffered prefix, then its channel was
        // closed by the hub.
        let mut seen = 0;
        while let Some(event) = slow.events.recv().await {
            if matches!(event, StreamEvent::Message(_)) {
                seen += 1;
            }
        }
        assert_eq!(seen, 4);

        // Healthy subscriber is still live.
        assert!(hub.broadcast(msg("dev", "default", 9)).await);
        assert_eq!(recv_message(&mut healthy).await.revision, 9);
    }

    #[tokio::test]
    async fn unsubscribe_closes_the_channel() {
        let hub = Hub::spawn(quiet_config(), CancellationToken::new());
        let mut sub = hub
            .subscribe("dev", namespaces(&["default"]))
            .await
            .expect("subscribe");
        hub.unsubscribe(sub.id).await;
        let next = tokio::time::timeout(Duration::from_secs(2), sub.events.recv())
            .await
            .expect("recv timeout");
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn heartbeat_pings_all_subscribers() {
        let config = HubConfig {
            heartbeat_interval: Duration::from_millis(20),
            client_buffer: 8,
        };
        let hub = Hub::spawn(config, CancellationToken::new());
        let mut sub = hub
            .subscribe("dev", namespaces(&["default"]))
            .await
            .expect("subscribe");
        let event = tokio::time::timeout(Duration::from_secs(2), sub.events.recv())
            .await
            .expect("recv timeout")
            .expect("event");
        assert!(matches!(event, StreamEvent::Ping));
    }

    #[tokio::test]
    async fn shutdown_closes_all_subscribers() {
        let shutdown = CancellationToken::new();
        let hub = Hub::spawn(quiet_config(), shutdown.clone());
        let mut sub = hub
            .subscribe("dev", namespaces(&["default"]))
            .await
            .expect("subscribe");
        shutdown.cancel();
        let next = tokio::time::timeout(Duration::from_secs(2), sub.events.recv())
            .await
            .expect("recv timeout");
        assert!(next.is_none());
    }

    #[tokio::test]
    async fn churn_does_not_stall_broadcasts() {
        let hub = Hub::spawn(quiet_config(), CancellationToken::new());
        let mut keepers = Vec::new();
        let mut leavers = Vec::new();
        for i in 0..20 {
            let sub = hub
                .subscribe("dev", namespaces(&["default"]))
                .await
                .expect("subscribe");
            if i % 2 == 0 {
                keepers.push(sub);
            } else {
                leavers.push(sub);
            }
        }
        for sub in &leavers {
            hub.unsubscribe(sub.id).await;
        }
        for rev in 1..=50 {
            assert!(hub.broadcast(msg("dev", "default", rev)).await);
        }
        for sub in &mut keepers {
            assert_eq!(recv_message(sub).await.revision, 1);
        }
    }
}
