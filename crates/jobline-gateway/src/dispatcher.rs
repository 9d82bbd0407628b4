use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use jobline_types::events::GatewayEvent;

/// Bound on each connection's pending event queue. A client that cannot
/// drain this many events is disconnected rather than stalling delivery to
/// others (disconnect-on-overflow); it recovers by reconnecting and
/// refetching, which the reconciliation merge makes safe.
pub const EVENT_QUEUE_CAPACITY: usize = 256;

/// Registry of live subscriptions, keyed by user. Owned by whoever wires
/// the server (or a test); there is no ambient global instance.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// user_id -> active subscriptions. A user may have several sessions
    /// open at once; each gets its own ordered queue.
    subscribers: RwLock<HashMap<Uuid, Vec<Subscription>>>,
}

struct Subscription {
    conn_id: Uuid,
    tx: mpsc::Sender<GatewayEvent>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                subscribers: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Register a connection for `user_id`. Returns the connection id and
    /// the receiving end of its event queue.
    pub fn register(&self, user_id: Uuid) -> (Uuid, mpsc::Receiver<GatewayEvent>) {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);

        let mut subscribers = self
            .inner
            .subscribers
            .write()
            .expect("dispatcher lock poisoned");
        subscribers
            .entry(user_id)
            .or_default()
            .push(Subscription { conn_id, tx });

        debug!("registered gateway connection {} for user {}", conn_id, user_id);
        (conn_id, rx)
    }

    pub fn unregister(&self, user_id: Uuid, conn_id: Uuid) {
        let mut subscribers = self
            .inner
            .subscribers
            .write()
            .expect("dispatcher lock poisoned");
        if let Some(list) = subscribers.get_mut(&user_id) {
            list.retain(|sub| sub.conn_id != conn_id);
            if list.is_empty() {
                subscribers.remove(&user_id);
            }
        }
    }

    /// Deliver an event to every live connection of `user_id`. Never
    /// blocks: a full or closed queue marks that subscription stale and it
    /// is dropped, which closes the connection from the server side.
    pub fn publish_to_user(&self, user_id: Uuid, event: GatewayEvent) {
        let mut stale = Vec::new();
        {
            let subscribers = self
                .inner
                .subscribers
                .read()
                .expect("dispatcher lock poisoned");
            let Some(list) = subscribers.get(&user_id) else {
                return;
            };
            for sub in list {
                if sub.tx.try_send(event.clone()).is_err() {
                    stale.push(sub.conn_id);
                }
            }
        }

        for conn_id in stale {
            warn!(
                "dropping slow or closed gateway connection {} for user {}",
                conn_id, user_id
            );
            self.unregister(user_id, conn_id);
        }
    }

    /// Number of live connections for a user.
    pub fn connection_count(&self, user_id: Uuid) -> usize {
        self.inner
            .subscribers
            .read()
            .expect("dispatcher lock poisoned")
            .get(&user_id)
            .map_or(0, Vec::len)
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}
