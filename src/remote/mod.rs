//! The bus-to-bus link: a `RemoteEndpoint` whose peer is another daemon
//! rather than an application (§4.5).
//!
//! Local clients are served through a bare `zbus::Connection` (see
//! [`crate::peer::Peer`]); a federation link reuses `Connection` purely
//! for its SASL handshake and message framing but layers its own
//! bounded tx queue, idle-probe liveness check, and ordered shutdown on
//! top, since those are exactly the things a generic `Connection` does
//! not give us and the distilled spec requires of bus-to-bus links
//! specifically.

pub mod handshake;

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use event_listener::Event;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::time::{sleep_until, sleep, Instant};
use tracing::{debug, trace, warn};
use zbus::{names::OwnedUniqueName, Connection, Message, MessageBuilder, MessageStream};

use crate::{
    config::PipelineConfig,
    endpoint::{Endpoint as RouterEndpoint, PushError},
    router::Router,
};

const PROBE_PATH: &str = "/org/meshbus/Peer";
const PROBE_INTERFACE: &str = "org.meshbus.Peer";

/// One queued outgoing message. `ttl = None` means reliable: it never
/// expires and is never dropped to relieve backpressure (§4.5).
struct Queued {
    msg: Arc<Message>,
    enqueued_at: Instant,
    ttl: Option<std::time::Duration>,
}

impl Queued {
    fn expired(&self, now: Instant) -> bool {
        match self.ttl {
            Some(ttl) => now.saturating_duration_since(self.enqueued_at) >= ttl,
            None => false,
        }
    }

    fn remaining(&self, now: Instant) -> Option<std::time::Duration> {
        self.ttl
            .map(|ttl| ttl.saturating_sub(now.saturating_duration_since(self.enqueued_at)))
    }
}

/// The bounded outgoing queue backing a bus-to-bus link's tx worker.
///
/// Unlike a plain channel, the producer can walk this queue itself:
/// when it's full, expired entries are dropped to make room before the
/// producer ever has to wait out the full backpressure timeout (§4.5,
/// §8 "back-pressure", §8 scenario 5 "TTL-drop under backpressure").
struct TxQueue {
    messages: Mutex<VecDeque<Queued>>,
    capacity: usize,
    enqueued: Event,
    space_freed: Event,
    closed: AtomicBool,
}

impl TxQueue {
    fn new(capacity: usize) -> Self {
        Self {
            messages: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            enqueued: Event::new(),
            space_freed: Event::new(),
            closed: AtomicBool::new(false),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Wakes every blocked producer and consumer with `ENDPOINT_CLOSING`
    /// semantics; called once, during ordered shutdown.
    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.enqueued.notify(usize::MAX);
        self.space_freed.notify(usize::MAX);
    }

    /// Tries to enqueue without blocking, pruning expired entries first
    /// if the queue is full. Returns whether `msg` was enqueued.
    fn try_push(&self, msg: Arc<Message>, ttl: Option<std::time::Duration>) -> bool {
        let mut messages = self.messages.lock();
        if messages.len() >= self.capacity {
            let now = Instant::now();
            messages.retain(|q| !q.expired(now));
        }
        if messages.len() >= self.capacity {
            return false;
        }

        messages.push_back(Queued {
            msg,
            enqueued_at: Instant::now(),
            ttl,
        });
        drop(messages);
        self.enqueued.notify(1);

        true
    }

    /// Time remaining on the earliest-expiring queued entry, if any
    /// entry carries a TTL at all.
    fn earliest_ttl_remaining(&self) -> Option<std::time::Duration> {
        let now = Instant::now();
        self.messages
            .lock()
            .iter()
            .filter_map(|q| q.remaining(now))
            .min()
    }

    fn pop_front(&self) -> Option<Arc<Message>> {
        let msg = self.messages.lock().pop_front().map(|q| q.msg);
        if msg.is_some() {
            self.space_freed.notify(1);
        }
        msg
    }

    /// Enqueues `msg`, pruning expired entries to make room if the
    /// queue is full, and otherwise waiting for space up to `max_wait`
    /// (§4.5, §8 "back-pressure"). Kept separate from [`Endpoint`] so
    /// the backpressure/TTL-drop algorithm is testable without a live
    /// connection.
    async fn push_with_ttl(
        &self,
        msg: Arc<Message>,
        ttl: Option<std::time::Duration>,
        max_wait: std::time::Duration,
    ) -> Result<(), PushError> {
        let deadline = Instant::now() + max_wait;

        loop {
            if self.is_closed() {
                return Err(PushError::EndpointClosing);
            }
            if self.try_push(msg.clone(), ttl) {
                return Ok(());
            }

            let remaining_budget = deadline.saturating_duration_since(Instant::now());
            if remaining_budget.is_zero() {
                return Err(PushError::Timeout);
            }
            let wait = self
                .earliest_ttl_remaining()
                .unwrap_or(max_wait)
                .min(remaining_budget);

            let listener = self.space_freed.listen();
            if self.is_closed() {
                return Err(PushError::EndpointClosing);
            }
            tokio::select! {
                _ = sleep(wait) => {}
                _ = listener => {}
            }
        }
    }
}

/// A live federation link to one remote daemon.
pub struct Endpoint {
    unique_name: OwnedUniqueName,
    remote_guid: String,
    conn: Connection,
    queue: TxQueue,
    max_wait: std::time::Duration,
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("remote::Endpoint")
            .field("unique_name", &self.unique_name)
            .field("remote_guid", &self.remote_guid)
            .finish()
    }
}

impl Endpoint {
    pub fn unique_name(&self) -> &OwnedUniqueName {
        &self.unique_name
    }

    pub fn remote_guid(&self) -> &str {
        &self.remote_guid
    }

    /// The underlying connection, used for the federation control calls
    /// (`ExchangeNames`/`NameChanged`) that bypass the tx queue: those
    /// are method calls with replies, not fire-and-forget application
    /// traffic, so they go straight over the wire rather than through
    /// the bounded back-pressure pipeline below (§4.3, §4.5).
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Enqueues `msg` as reliable (never expires while queued). Ordinary
    /// routed traffic has no TTL of its own to carry, so this is what
    /// the router's fan-out calls.
    pub async fn push(&self, msg: Arc<Message>) -> Result<(), PushError> {
        self.push_with_ttl(msg, None).await
    }

    /// Enqueues `msg`, expiring it after `ttl` if it's still queued when
    /// that elapses (`None` means reliable). If the queue is full,
    /// already-expired entries are pruned to make room before the
    /// producer waits; the wait is capped at the earliest remaining TTL
    /// among what's left queued, or `PipelineConfig::max_backpressure_wait`
    /// if nothing queued carries a TTL (§4.5, §8 "back-pressure").
    pub async fn push_with_ttl(
        &self,
        msg: Arc<Message>,
        ttl: Option<std::time::Duration>,
    ) -> Result<(), PushError> {
        self.queue.push_with_ttl(msg, ttl, self.max_wait).await
    }

    /// Deliberately tears this link down (§4.4 `Disconnect`). Closing the
    /// queue wakes `next_outgoing` with `None` on its next poll, which
    /// `run`'s select loop treats exactly like the peer hanging up on its
    /// own, so teardown goes through the same ordered shutdown path.
    pub fn close(&self) {
        self.queue.close();
    }
}

/// Spawns the rx/tx pipeline for a just-authenticated bus-to-bus
/// connection and returns the shared handle the router fans out
/// through, plus the background task driving it.
pub fn spawn(
    conn: Connection,
    unique_name: OwnedUniqueName,
    remote_guid: String,
    router: Router,
    pipeline: PipelineConfig,
) -> (Arc<Endpoint>, tokio::task::JoinHandle<()>) {
    let endpoint = Arc::new(Endpoint {
        unique_name,
        remote_guid,
        conn: conn.clone(),
        queue: TxQueue::new(pipeline.tx_queue_capacity),
        max_wait: pipeline.max_backpressure_wait(),
    });

    let task = tokio::spawn(run(conn, router, endpoint.clone(), pipeline));
    (endpoint, task)
}

async fn run(conn: Connection, router: Router, endpoint: Arc<Endpoint>, pipeline: PipelineConfig) {
    let handle = RouterEndpoint::Bus2Bus(endpoint.clone());
    router.register_endpoint(handle.clone());

    let mut stream = MessageStream::from(&conn);
    let mut missed_probes = 0u32;
    let mut deadline = Instant::now() + pipeline.idle_timeout();

    loop {
        tokio::select! {
            biased;

            outgoing = next_outgoing(&endpoint) => {
                match outgoing {
                    Some(msg) => {
                        if let Err(e) = conn.send(&msg).await {
                            warn!("bus-to-bus send to {} failed: {}", endpoint.unique_name(), e);
                            break;
                        }
                    }
                    // The queue was closed and drained: nothing will
                    // ever send on it again.
                    None => break,
                }
            }

            incoming = stream.next() => {
                match incoming {
                    Some(Ok(msg)) => {
                        missed_probes = 0;
                        deadline = Instant::now() + pipeline.idle_timeout();

                        if is_probe(&msg, "ProbeReq") {
                            if let Err(e) = send_probe(&conn, "ProbeAck").await {
                                warn!("failed to ack probe from {}: {}", endpoint.unique_name(), e);
                            }
                            continue;
                        }
                        if is_probe(&msg, "ProbeAck") {
                            continue;
                        }
                        if is_federation_control(&msg) {
                            // `BusHello`/`ExchangeNames`/`NameChanged` calls
                            // (and their replies) are handled by the
                            // `handshake::Acceptor` served on this same
                            // connection; routing them as ordinary
                            // application traffic would misdeliver them as
                            // destination-less broadcasts.
                            continue;
                        }

                        if let Err(e) = router.push(&handle, Arc::new(msg)).await {
                            warn!("routing message from {} failed: {}", endpoint.unique_name(), e);
                        }
                    }
                    Some(Err(e)) => {
                        warn!("bus-to-bus link to {} errored: {}", endpoint.unique_name(), e);
                        break;
                    }
                    None => {
                        debug!("bus-to-bus link to {} closed by peer", endpoint.unique_name());
                        break;
                    }
                }
            }

            _ = sleep_until(deadline) => {
                missed_probes += 1;
                if missed_probes > pipeline.max_idle_probes {
                    warn!(
                        "bus-to-bus link to {} missed {} probes, tearing down",
                        endpoint.unique_name(),
                        missed_probes
                    );
                    break;
                }
                trace!("probing idle bus-to-bus link to {}", endpoint.unique_name());
                if let Err(e) = send_probe(&conn, "ProbeReq").await {
                    warn!("failed to probe {}: {}", endpoint.unique_name(), e);
                    break;
                }
                deadline = Instant::now() + pipeline.probe_timeout();
            }
        }
    }

    // Ordered shutdown: stop accepting new outbound traffic before we
    // tell the router this endpoint is gone, so nothing can observe a
    // registered-but-already-dead endpoint. Closing the queue also
    // wakes any producer currently blocked in `push_with_ttl` with
    // `ENDPOINT_CLOSING` instead of leaving it to time out.
    endpoint.queue.close();
    let changes = router.unregister_endpoint(endpoint.unique_name().as_ref());
    for change in changes {
        trace!("released on link teardown: {:?}", change);
    }

    // Drop our own strong references before asking the federation table
    // to clean up: `remove_bus2bus_endpoint_cascade` only sees a
    // virtual endpoint as orphaned once every `Arc<Endpoint>` keeping
    // its route alive (this one and `handle` included) is gone.
    let remote_guid = endpoint.remote_guid().to_string();
    drop(handle);
    drop(endpoint);
    if let Some(federation) = router.federation() {
        federation
            .remove_bus2bus_endpoint_cascade(&remote_guid, &router)
            .await;
    }
}

/// Waits for and dequeues the next outgoing message, or returns `None`
/// once the queue has been closed and drained.
async fn next_outgoing(endpoint: &Arc<Endpoint>) -> Option<Arc<Message>> {
    loop {
        // Register the listener before rechecking the queue so a
        // message enqueued between the check and the listen can't be
        // missed: `enqueued.notify` only wakes listeners already
        // registered.
        let listener = endpoint.queue.enqueued.listen();
        if let Some(msg) = endpoint.queue.pop_front() {
            return Some(msg);
        }
        if endpoint.queue.is_closed() {
            return None;
        }
        listener.await;
    }
}

fn is_probe(msg: &Message, member: &str) -> bool {
    let hdr = msg.header();
    hdr.interface().map(|i| i.as_str()) == Some(PROBE_INTERFACE)
        && hdr.member().map(|m| m.as_str()) == Some(member)
}

fn is_federation_control(msg: &Message) -> bool {
    msg.header().interface().map(|i| i.as_str()) == Some(handshake::INTERFACE)
}

async fn send_probe(conn: &Connection, member: &'static str) -> zbus::Result<()> {
    let msg = MessageBuilder::signal(PROBE_PATH, PROBE_INTERFACE, member)?.build(&())?;
    conn.send(&msg).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(member: &str) -> Arc<Message> {
        Arc::new(
            MessageBuilder::signal("/org/meshbus/Test", "org.meshbus.Test", member)
                .unwrap()
                .build(&())
                .unwrap(),
        )
    }

    #[test]
    fn try_push_prunes_expired_entries_to_make_room() {
        let queue = TxQueue::new(2);
        assert!(queue.try_push(signal("a"), Some(std::time::Duration::from_millis(1))));
        assert!(queue.try_push(signal("b"), None));
        // Queue full; "a" hasn't expired yet, so there's no room.
        assert!(!queue.try_push(signal("c"), None));

        std::thread::sleep(std::time::Duration::from_millis(20));

        // "a" has now expired and should be pruned to make room.
        assert!(queue.try_push(signal("c"), None));
        assert_eq!(queue.messages.lock().len(), 2);
    }

    #[test]
    fn earliest_ttl_remaining_ignores_reliable_entries() {
        let queue = TxQueue::new(4);
        queue.try_push(signal("reliable"), None);
        assert_eq!(queue.earliest_ttl_remaining(), None);

        queue.try_push(signal("expiring"), Some(std::time::Duration::from_secs(5)));
        let remaining = queue.earliest_ttl_remaining().unwrap();
        assert!(remaining <= std::time::Duration::from_secs(5));
    }

    #[tokio::test]
    async fn push_with_ttl_drops_expired_head_to_admit_new_message() {
        let queue = TxQueue::new(1);
        assert!(queue.try_push(signal("old"), Some(std::time::Duration::from_millis(30))));

        let started = Instant::now();
        queue
            .push_with_ttl(
                signal("new"),
                Some(std::time::Duration::from_secs(5)),
                std::time::Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert!(started.elapsed() < std::time::Duration::from_millis(500));
        assert_eq!(queue.messages.lock().len(), 1);
    }

    #[tokio::test]
    async fn push_with_ttl_returns_timeout_when_all_reliable_and_consumer_stalled() {
        let queue = TxQueue::new(1);
        assert!(queue.try_push(signal("stuck"), None));

        let result = queue
            .push_with_ttl(
                signal("blocked"),
                None,
                std::time::Duration::from_millis(50),
            )
            .await;
        assert!(matches!(result, Err(PushError::Timeout)));
    }

    #[tokio::test]
    async fn push_with_ttl_returns_endpoint_closing_once_closed() {
        let queue = TxQueue::new(1);
        assert!(queue.try_push(signal("stuck"), None));
        queue.close();

        let result = queue
            .push_with_ttl(
                signal("blocked"),
                None,
                std::time::Duration::from_secs(1),
            )
            .await;
        assert!(matches!(result, Err(PushError::EndpointClosing)));
    }
}
