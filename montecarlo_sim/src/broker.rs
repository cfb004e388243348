//! In-memory message broker with TTL bookkeeping and fault injection.
//!
//! Semantics follow an AMQP broker closely enough for the cluster protocol:
//! - a message's expiry is fixed at first enqueue (the shorter of queue TTL
//!   and per-message expiration) and survives requeues
//! - expired messages are evicted lazily, on the next read of their queue
//! - in-flight (unacknowledged) messages are not counted by `passive_declare`
//! - `nack(requeue)` puts a message back at the head, flagged redelivered
//! - closing a session requeues its in-flight messages

use async_trait::async_trait;
use montecarlo_env::{
    AckMode, BrokerConnector, ConsumeOptions, ConsumerTag, Delivery, DeliveryTag, EnvError,
    MessageBroker, MonteCarloContext, PublishOptions, QueueOptions,
};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

/// Operation counters, for assertions and run reports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BrokerStats {
    pub publishes: u64,
    pub gets: u64,
    pub deliveries: u64,
    pub acks: u64,
    pub nacks: u64,
    pub requeues: u64,
    pub expired: u64,

    /// Publishes to a queue that does not exist (silently dropped)
    pub unroutable: u64,

    /// Publishes failed on purpose
    pub injected_failures: u64,

    pub connections: u64,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    payload: Vec<u8>,
    expires_at: Option<Duration>,
    redelivered: bool,
}

#[derive(Debug)]
struct SimQueue {
    options: QueueOptions,
    messages: VecDeque<StoredMessage>,
    published: u64,
}

impl SimQueue {
    /// Drops expired messages; returns how many.
    fn evict_expired(&mut self, now: Duration) -> u64 {
        let before = self.messages.len();
        self.messages
            .retain(|m| m.expires_at.map_or(true, |deadline| deadline > now));
        (before - self.messages.len()) as u64
    }
}

#[derive(Debug)]
struct InFlight {
    session: u64,
    consumer: Option<u64>,
    queue: String,
    message: StoredMessage,
}

#[derive(Debug)]
struct ConsumerState {
    queue: String,
    options: ConsumeOptions,
    unacked: usize,
}

#[derive(Debug, Default)]
struct SessionState {
    consumers: HashMap<u64, ConsumerState>,
}

#[derive(Debug, Default)]
struct FaultState {
    /// Remaining forced publish failures per queue
    failing_publishes: HashMap<String, u32>,
    refuse_connections: bool,
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: HashMap<String, SimQueue>,
    sessions: HashMap<u64, SessionState>,
    in_flight: HashMap<u64, InFlight>,
    next_tag: u64,
    next_id: u64,
    faults: FaultState,
    stats: BrokerStats,
}

impl BrokerState {
    fn queue_mut(&mut self, name: &str, now: Duration) -> Result<&mut SimQueue, EnvError> {
        let queue = self
            .queues
            .get_mut(name)
            .ok_or_else(|| EnvError::not_found(name))?;
        self.stats.expired += queue.evict_expired(now);
        Ok(queue)
    }

    fn session(&mut self, id: u64) -> Result<&mut SessionState, EnvError> {
        self.sessions.get_mut(&id).ok_or(EnvError::SessionClosed)
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn track(&mut self, session: u64, consumer: Option<u64>, queue: &str, message: StoredMessage) -> Delivery {
        self.next_tag += 1;
        let tag = self.next_tag;
        let delivery = Delivery {
            tag: DeliveryTag(tag),
            queue: queue.to_string(),
            payload: message.payload.clone(),
            redelivered: message.redelivered,
        };
        self.in_flight.insert(
            tag,
            InFlight {
                session,
                consumer,
                queue: queue.to_string(),
                message,
            },
        );
        delivery
    }

    /// Removes an in-flight message owned by `session`.
    fn settle(&mut self, session: u64, tag: DeliveryTag) -> Result<InFlight, EnvError> {
        match self.in_flight.get(&tag.0) {
            Some(entry) if entry.session == session => {}
            _ => return Err(EnvError::UnknownDelivery(tag.0)),
        }
        let entry = self
            .in_flight
            .remove(&tag.0)
            .ok_or(EnvError::UnknownDelivery(tag.0))?;

        if let Some(consumer) = entry.consumer {
            if let Some(state) = self
                .sessions
                .get_mut(&entry.session)
                .and_then(|s| s.consumers.get_mut(&consumer))
            {
                state.unacked = state.unacked.saturating_sub(1);
            }
        }
        Ok(entry)
    }

    /// Puts a message back at the head of its queue.
    fn requeue(&mut self, entry: InFlight) {
        let Some(queue) = self.queues.get_mut(&entry.queue) else {
            debug!(queue = %entry.queue, "Requeue target deleted, dropping message");
            return;
        };
        let mut message = entry.message;
        message.redelivered = true;
        queue.messages.push_front(message);
        self.stats.requeues += 1;
    }
}

struct Shared<C> {
    context: Arc<C>,
    state: Mutex<BrokerState>,
    changed: Notify,
}

impl<C> Shared<C> {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The simulated broker process; hands out sessions.
pub struct SimBrokerServer<C: MonteCarloContext> {
    shared: Arc<Shared<C>>,
}

impl<C: MonteCarloContext> SimBrokerServer<C> {
    pub fn new(context: Arc<C>) -> Self {
        Self {
            shared: Arc::new(Shared {
                context,
                state: Mutex::new(BrokerState::default()),
                changed: Notify::new(),
            }),
        }
    }

    /// Creates an Arc-wrapped server for sharing.
    pub fn shared(context: Arc<C>) -> Arc<Self> {
        Arc::new(Self::new(context))
    }

    /// Fault injection handle.
    pub fn faults(&self) -> SimBrokerFaults<C> {
        SimBrokerFaults {
            shared: self.shared.clone(),
        }
    }

    pub fn stats(&self) -> BrokerStats {
        self.shared.lock().stats.clone()
    }

    /// Ready messages in `queue` after expiry, `None` if it does not exist.
    pub fn ready_count(&self, queue: &str) -> Option<usize> {
        let now = self.shared.context.now();
        let mut state = self.shared.lock();
        state.queue_mut(queue, now).ok().map(|q| q.messages.len())
    }

    /// Messages ever accepted by `queue`.
    pub fn published_to(&self, queue: &str) -> u64 {
        self.shared.lock().queues.get(queue).map_or(0, |q| q.published)
    }

    /// Payloads of the ready messages in `queue`, head first.
    pub fn snapshot(&self, queue: &str) -> Vec<Vec<u8>> {
        let now = self.shared.context.now();
        let mut state = self.shared.lock();
        state
            .queue_mut(queue, now)
            .map(|q| q.messages.iter().map(|m| m.payload.clone()).collect())
            .unwrap_or_default()
    }

    pub fn in_flight(&self) -> usize {
        self.shared.lock().in_flight.len()
    }

    pub fn open_sessions(&self) -> usize {
        self.shared.lock().sessions.len()
    }
}

#[async_trait]
impl<C: MonteCarloContext> BrokerConnector for SimBrokerServer<C> {
    type Session = SimBroker<C>;

    async fn connect(&self) -> Result<Arc<SimBroker<C>>, EnvError> {
        let mut state = self.shared.lock();
        if state.faults.refuse_connections {
            return Err(EnvError::connection("broker refused connection"));
        }
        let id = state.next_id();
        state.sessions.insert(id, SessionState::default());
        state.stats.connections += 1;
        debug!(session = id, "Session opened");

        Ok(Arc::new(SimBroker {
            id,
            shared: self.shared.clone(),
        }))
    }
}

/// Fault injection for the simulated broker.
pub struct SimBrokerFaults<C> {
    shared: Arc<Shared<C>>,
}

impl<C> SimBrokerFaults<C> {
    /// Makes the next `count` publishes to `queue` fail with a transient error.
    pub fn fail_publishes(&self, queue: &str, count: u32) {
        let mut state = self.shared.lock();
        *state.faults.failing_publishes.entry(queue.to_string()).or_default() += count;
    }

    /// Refuses (or accepts again) new sessions.
    pub fn refuse_connections(&self, refuse: bool) {
        self.shared.lock().faults.refuse_connections = refuse;
    }

    /// Clears every injected fault.
    pub fn heal_all(&self) {
        self.shared.lock().faults = FaultState::default();
    }
}

/// One session on a [`SimBrokerServer`].
pub struct SimBroker<C> {
    id: u64,
    shared: Arc<Shared<C>>,
}

impl<C: MonteCarloContext> SimBroker<C> {
    pub fn session_id(&self) -> u64 {
        self.id
    }

    fn now(&self) -> Duration {
        self.shared.context.now()
    }

    /// Takes the next message for a consumer, if its window allows.
    ///
    /// `Err(())` means the consumer or session is gone.
    fn try_dispatch(&self, consumer: &ConsumerTag) -> Result<Option<Delivery>, ()> {
        let now = self.now();
        let mut state = self.shared.lock();

        let options = {
            let session = state.sessions.get(&self.id).ok_or(())?;
            let consumer_state = session.consumers.get(&consumer.id).ok_or(())?;
            let window = consumer_state.options.prefetch as usize;
            if consumer_state.options.ack_mode == AckMode::Manual
                && window > 0
                && consumer_state.unacked >= window
            {
                return Ok(None);
            }
            consumer_state.options
        };

        let queue = match state.queue_mut(&consumer.queue, now) {
            Ok(queue) => queue,
            Err(_) => return Ok(None),
        };
        let Some(message) = queue.messages.pop_front() else {
            return Ok(None);
        };
        state.stats.deliveries += 1;

        if options.ack_mode == AckMode::Auto {
            return Ok(Some(Delivery {
                tag: DeliveryTag(0),
                queue: consumer.queue.clone(),
                payload: message.payload,
                redelivered: message.redelivered,
            }));
        }

        if let Some(consumer_state) = state
            .sessions
            .get_mut(&self.id)
            .and_then(|s| s.consumers.get_mut(&consumer.id))
        {
            consumer_state.unacked += 1;
        }
        Ok(Some(state.track(self.id, Some(consumer.id), &consumer.queue, message)))
    }
}

#[async_trait]
impl<C: MonteCarloContext> MessageBroker for SimBroker<C> {
    async fn declare(&self, queue: &str, options: QueueOptions) -> Result<(), EnvError> {
        let mut state = self.shared.lock();
        state.session(self.id)?;

        match state.queues.get(queue) {
            Some(existing) => {
                if options.message_ttl.is_some() && existing.options.message_ttl != options.message_ttl {
                    return Err(EnvError::PreconditionFailed(format!(
                        "queue '{}' declared with message TTL {:?}, requested {:?}",
                        queue, existing.options.message_ttl, options.message_ttl
                    )));
                }
            }
            None => {
                debug!(queue, ?options, "Queue declared");
                state.queues.insert(
                    queue.to_string(),
                    SimQueue {
                        options,
                        messages: VecDeque::new(),
                        published: 0,
                    },
                );
            }
        }
        Ok(())
    }

    async fn passive_declare(&self, queue: &str) -> Result<u32, EnvError> {
        let now = self.now();
        let mut state = self.shared.lock();
        state.session(self.id)?;
        Ok(state.queue_mut(queue, now)?.messages.len() as u32)
    }

    async fn publish(
        &self,
        queue: &str,
        payload: Vec<u8>,
        options: PublishOptions,
    ) -> Result<(), EnvError> {
        let now = self.now();
        {
            let mut state = self.shared.lock();
            state.session(self.id)?;

            if let Some(remaining) = state.faults.failing_publishes.get_mut(queue) {
                if *remaining > 0 {
                    *remaining -= 1;
                    state.stats.injected_failures += 1;
                    return Err(EnvError::publish(format!("injected failure on '{}'", queue)));
                }
            }

            let Some(target) = state.queues.get_mut(queue) else {
                state.stats.unroutable += 1;
                debug!(queue, "Unroutable publish dropped");
                return Ok(());
            };

            let ttl = match (target.options.message_ttl, options.expiration) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            target.messages.push_back(StoredMessage {
                payload,
                expires_at: ttl.map(|ttl| now + ttl),
                redelivered: false,
            });
            target.published += 1;
            state.stats.publishes += 1;
        }
        self.shared.changed.notify_waiters();
        Ok(())
    }

    async fn get(&self, queue: &str) -> Result<Option<Delivery>, EnvError> {
        let now = self.now();
        let mut state = self.shared.lock();
        state.session(self.id)?;
        state.stats.gets += 1;

        let Some(message) = state.queue_mut(queue, now)?.messages.pop_front() else {
            return Ok(None);
        };
        Ok(Some(state.track(self.id, None, queue, message)))
    }

    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<ConsumerTag, EnvError> {
        let mut state = self.shared.lock();
        state.session(self.id)?;
        if !state.queues.contains_key(queue) {
            return Err(EnvError::not_found(queue));
        }

        let id = state.next_id();
        state.session(self.id)?.consumers.insert(
            id,
            ConsumerState {
                queue: queue.to_string(),
                options,
                unacked: 0,
            },
        );
        Ok(ConsumerTag {
            id,
            queue: queue.to_string(),
        })
    }

    async fn recv(&self, consumer: &ConsumerTag) -> Option<Delivery> {
        loop {
            let changed = self.shared.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            match self.try_dispatch(consumer) {
                Ok(Some(delivery)) => return Some(delivery),
                Ok(None) => {}
                Err(()) => return None,
            }
            changed.await;
        }
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), EnvError> {
        {
            let mut state = self.shared.lock();
            state.session(self.id)?;
            state.settle(self.id, tag)?;
            state.stats.acks += 1;
        }
        self.shared.changed.notify_waiters();
        Ok(())
    }

    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<(), EnvError> {
        {
            let mut state = self.shared.lock();
            state.session(self.id)?;
            let entry = state.settle(self.id, tag)?;
            state.stats.nacks += 1;
            if requeue {
                state.requeue(entry);
            }
        }
        self.shared.changed.notify_waiters();
        Ok(())
    }

    async fn purge(&self, queue: &str) -> Result<u32, EnvError> {
        let now = self.now();
        let mut state = self.shared.lock();
        state.session(self.id)?;
        let target = state.queue_mut(queue, now)?;
        let removed = target.messages.len() as u32;
        target.messages.clear();
        Ok(removed)
    }

    async fn delete(&self, queue: &str) -> Result<u32, EnvError> {
        let now = self.now();
        let mut state = self.shared.lock();
        state.session(self.id)?;
        let removed = state.queue_mut(queue, now)?.messages.len() as u32;
        state.queues.remove(queue);
        for session in state.sessions.values_mut() {
            session.consumers.retain(|_, c| c.queue != queue);
        }
        drop(state);
        self.shared.changed.notify_waiters();
        Ok(removed)
    }

    async fn close(&self) {
        {
            let mut state = self.shared.lock();
            if state.sessions.remove(&self.id).is_none() {
                return;
            }

            let mut owned: Vec<u64> = state
                .in_flight
                .iter()
                .filter(|(_, entry)| entry.session == self.id)
                .map(|(tag, _)| *tag)
                .collect();
            // Newest first, so the oldest ends up at the head.
            owned.sort_unstable_by(|a, b| b.cmp(a));
            for tag in owned {
                if let Some(entry) = state.in_flight.remove(&tag) {
                    state.requeue(entry);
                }
            }
            debug!(session = self.id, "Session closed");
        }
        self.shared.changed.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SimContext;

    async fn setup() -> (Arc<SimContext>, SimBrokerServer<SimContext>, Arc<SimBroker<SimContext>>) {
        let ctx = SimContext::shared(7);
        let server = SimBrokerServer::new(ctx.clone());
        let session = server.connect().await.unwrap();
        (ctx, server, session)
    }

    #[tokio::test(start_paused = true)]
    async fn test_peek_is_non_destructive() {
        let (_ctx, server, session) = setup().await;
        session.declare("modelo", QueueOptions::durable()).await.unwrap();
        session
            .publish("modelo", b"m".to_vec(), PublishOptions::persistent())
            .await
            .unwrap();

        let first = session.peek("modelo").await.unwrap().unwrap();
        let second = session.peek("modelo").await.unwrap().unwrap();
        assert_eq!(first.payload, b"m");
        assert!(!first.redelivered);
        assert!(second.redelivered);
        assert_eq!(session.passive_declare("modelo").await.unwrap(), 1);
        assert_eq!(server.in_flight(), 0);
        assert_eq!(server.stats().gets, 2);
        assert_eq!(server.stats().requeues, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_survives_requeue() {
        let (ctx, _server, session) = setup().await;
        session
            .declare("modelo", QueueOptions::durable_with_ttl(Duration::from_secs(60)))
            .await
            .unwrap();
        session
            .publish(
                "modelo",
                b"m".to_vec(),
                PublishOptions::persistent_with_ttl(Duration::from_secs(30)),
            )
            .await
            .unwrap();

        ctx.sleep(Duration::from_secs(20)).await;
        assert!(session.peek("modelo").await.unwrap().is_some());

        // Requeue did not restart the clock; the shorter TTL applies.
        ctx.sleep(Duration::from_secs(11)).await;
        assert_eq!(session.passive_declare("modelo").await.unwrap(), 0);
        assert!(session.get("modelo").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_declare_ttl_mismatch() {
        let (_ctx, _server, session) = setup().await;
        session
            .declare("modelo", QueueOptions::durable_with_ttl(Duration::from_secs(60)))
            .await
            .unwrap();
        let err = session
            .declare("modelo", QueueOptions::durable_with_ttl(Duration::from_secs(10)))
            .await
            .unwrap_err();
        assert!(matches!(err, EnvError::PreconditionFailed(_)));
        session.declare("modelo", QueueOptions::durable()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_passive_declare_missing_queue() {
        let (_ctx, _server, session) = setup().await;
        assert!(matches!(
            session.passive_declare("nada").await,
            Err(EnvError::QueueNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacked_not_counted_and_prefetch_window() {
        let (_ctx, _server, session) = setup().await;
        session.declare("q", QueueOptions::durable()).await.unwrap();
        for i in 0..3u8 {
            session.publish("q", vec![i], PublishOptions::persistent()).await.unwrap();
        }

        let consumer = session.consume("q", ConsumeOptions::manual(1)).await.unwrap();
        let first = session.recv(&consumer).await.unwrap();
        assert_eq!(first.payload, vec![0]);
        assert_eq!(session.passive_declare("q").await.unwrap(), 2);

        // Window is full until the first is settled.
        let blocked = tokio::time::timeout(Duration::from_secs(1), session.recv(&consumer)).await;
        assert!(blocked.is_err());

        session.nack(first.tag, true).await.unwrap();
        let again = session.recv(&consumer).await.unwrap();
        assert_eq!(again.payload, vec![0]);
        assert!(again.redelivered);
        session.ack(again.tag).await.unwrap();
        assert_eq!(session.recv(&consumer).await.unwrap().payload, vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recv_wakes_on_publish() {
        let (ctx, server, session) = setup().await;
        session.declare("q", QueueOptions::durable()).await.unwrap();
        let consumer = session.consume("q", ConsumeOptions::manual(1)).await.unwrap();

        let publisher = server.connect().await.unwrap();
        ctx.spawn("publisher", async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            publisher
                .publish("q", b"hola".to_vec(), PublishOptions::persistent())
                .await
                .unwrap();
        });

        let delivery = session.recv(&consumer).await.unwrap();
        assert_eq!(delivery.payload, b"hola");
        assert_eq!(ctx.now(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_requeues_and_unblocks() {
        let (_ctx, server, session) = setup().await;
        session.declare("q", QueueOptions::durable()).await.unwrap();
        session.publish("q", b"a".to_vec(), PublishOptions::persistent()).await.unwrap();
        let consumer = session.consume("q", ConsumeOptions::manual(1)).await.unwrap();
        let _held = session.recv(&consumer).await.unwrap();
        assert_eq!(server.ready_count("q"), Some(0));

        session.close().await;
        assert_eq!(server.ready_count("q"), Some(1));
        assert!(session.recv(&consumer).await.is_none());
        assert!(matches!(
            session.publish("q", vec![], PublishOptions::persistent()).await,
            Err(EnvError::SessionClosed)
        ));
        assert_eq!(server.open_sessions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_foreign_tag_rejected() {
        let (_ctx, server, session) = setup().await;
        session.declare("q", QueueOptions::durable()).await.unwrap();
        session.publish("q", b"a".to_vec(), PublishOptions::persistent()).await.unwrap();
        let delivery = session.get("q").await.unwrap().unwrap();

        let other = server.connect().await.unwrap();
        assert!(matches!(
            other.ack(delivery.tag).await,
            Err(EnvError::UnknownDelivery(_))
        ));
        session.ack(delivery.tag).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_faults() {
        let (_ctx, server, session) = setup().await;
        session.declare("q", QueueOptions::durable()).await.unwrap();
        server.faults().fail_publishes("q", 2);

        for _ in 0..2 {
            let err = session
                .publish("q", vec![1], PublishOptions::persistent())
                .await
                .unwrap_err();
            assert!(err.is_transient());
        }
        session.publish("q", vec![1], PublishOptions::persistent()).await.unwrap();
        assert_eq!(server.stats().injected_failures, 2);

        server.faults().refuse_connections(true);
        assert!(server.connect().await.is_err());
        server.faults().heal_all();
        assert!(server.connect().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_delete_and_unroutable() {
        let (_ctx, server, session) = setup().await;
        session.declare("q", QueueOptions::durable()).await.unwrap();
        session.publish("q", vec![1], PublishOptions::persistent()).await.unwrap();
        session.publish("q", vec![2], PublishOptions::persistent()).await.unwrap();

        assert_eq!(session.purge("q").await.unwrap(), 2);
        session.publish("q", vec![3], PublishOptions::persistent()).await.unwrap();
        assert_eq!(session.delete("q").await.unwrap(), 1);
        assert!(matches!(session.delete("q").await, Err(EnvError::QueueNotFound(_))));

        session.publish("q", vec![4], PublishOptions::persistent()).await.unwrap();
        assert_eq!(server.stats().unroutable, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_ack_consumer() {
        let (_ctx, server, session) = setup().await;
        session.declare("q", QueueOptions::durable()).await.unwrap();
        session.publish("q", vec![1], PublishOptions::persistent()).await.unwrap();
        let consumer = session
            .consume(
                "q",
                ConsumeOptions {
                    prefetch: 1,
                    ack_mode: AckMode::Auto,
                },
            )
            .await
            .unwrap();
        assert_eq!(session.recv(&consumer).await.unwrap().payload, vec![1]);
        assert_eq!(server.in_flight(), 0);
    }

    proptest::proptest! {
        #[test]
        fn prop_peeks_see_model_exactly_until_ttl(
            ttl_ms in 100u64..10_000,
            gaps in proptest::collection::vec(1u64..2_000, 1..20),
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .unwrap();

            let observations = runtime.block_on(async {
                let (ctx, server, session) = setup().await;
                let ttl = Duration::from_millis(ttl_ms);
                session.declare("modelo", QueueOptions::durable_with_ttl(ttl)).await.unwrap();
                session
                    .publish("modelo", b"m".to_vec(), PublishOptions::persistent_with_ttl(ttl))
                    .await
                    .unwrap();
                let published_at = ctx.now();

                let mut observations = Vec::new();
                for gap in gaps {
                    ctx.sleep(Duration::from_millis(gap)).await;
                    let alive = ctx.now() - published_at < ttl;
                    let seen = session.peek("modelo").await.unwrap().is_some();
                    let resident = session.passive_declare("modelo").await.unwrap();
                    observations.push((alive, seen, resident, server.in_flight()));
                }
                observations
            });

            for (alive, seen, resident, in_flight) in observations {
                proptest::prop_assert_eq!(seen, alive);
                proptest::prop_assert_eq!(resident, u32::from(alive));
                proptest::prop_assert_eq!(in_flight, 0);
            }
        }
    }
}
