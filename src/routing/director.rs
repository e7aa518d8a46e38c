//! The routing engine.
//!
//! Every datagram enters through [`MessageDirector::route`], lands on a
//! bounded lock-free queue, and is fanned out by `process`: decode the
//! receiver header, look up subscribers, deliver to everyone except the
//! origin, forward upstream when the origin was local. In threaded mode a
//! pool of worker threads drains the queue; otherwise the submitting call
//! drains it inline.
//!
//! Ordering: submissions from one origin enter the queue in order, but
//! worker parallelism may reorder deliveries across workers. Only the
//! inline (non-threaded) mode gives per-origin FIFO end to end; nothing
//! may assume cross-worker ordering.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::queue::ArrayQueue;
use parking_lot::{Mutex, RwLock};

use crate::error::Error;
use crate::events::EventSender;
use crate::protocol::constants::{
    Channel, CONTROL_ADD_CHANNEL, CONTROL_ADD_POST_REMOVE, CONTROL_ADD_RANGE,
    CONTROL_CLEAR_POST_REMOVES, CONTROL_LOG_MESSAGE, CONTROL_REMOVE_CHANNEL, CONTROL_REMOVE_RANGE,
    CONTROL_SET_CON_NAME, CONTROL_SET_CON_URL,
};
use crate::protocol::datagram::{self, Datagram, DatagramHandle, DatagramIterator};
use crate::routing::metrics::{RouterMetrics, RouterStats};
use crate::routing::participant::{DatagramSink, Participant, ParticipantId};
use crate::routing::range_map::ChannelRange;
use crate::routing::subscriptions::{CoverageEvent, SubscriptionMap};

/// Routing queue capacity. Producers spin-yield on the rare full queue
/// rather than signalling backpressure.
const ROUTING_QUEUE_CAPACITY: usize = 1024;

/// How long an empty-queue worker sleeps before polling again.
const WORKER_IDLE_BACKOFF: Duration = Duration::from_micros(100);

/// The parent-facing side of the tree, when one is configured.
pub trait UpstreamLink: Send + Sync {
    /// Ship a datagram to the parent router.
    fn forward(&self, dg: DatagramHandle);
}

struct QueuedDatagram {
    origin: Option<Arc<Participant>>,
    dg: DatagramHandle,
}

struct Shared {
    subs: RwLock<SubscriptionMap>,
    participants: Mutex<HashMap<ParticipantId, Arc<Participant>>>,
    terminated: Mutex<Vec<Arc<Participant>>>,
    queue: ArrayQueue<QueuedDatagram>,
    upstream: Mutex<Option<Arc<dyn UpstreamLink>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    stop: AtomicBool,
    draining: AtomicBool,
    next_id: AtomicU64,
    threaded: bool,
    worker_count: usize,
    metrics: RouterMetrics,
    events: EventSender,
}

/// The message director. Cheap to clone; all clones share one router.
#[derive(Clone)]
pub struct MessageDirector {
    shared: Arc<Shared>,
}

impl MessageDirector {
    pub fn new(threaded: bool, events: EventSender) -> Self {
        let worker_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2)
            .max(2);

        Self {
            shared: Arc::new(Shared {
                subs: RwLock::new(SubscriptionMap::new()),
                participants: Mutex::new(HashMap::new()),
                terminated: Mutex::new(Vec::new()),
                queue: ArrayQueue::new(ROUTING_QUEUE_CAPACITY),
                upstream: Mutex::new(None),
                workers: Mutex::new(Vec::new()),
                stop: AtomicBool::new(false),
                draining: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
                threaded,
                worker_count,
                metrics: RouterMetrics::new(),
                events,
            }),
        }
    }

    pub fn is_threaded(&self) -> bool {
        self.shared.threaded
    }

    pub fn stats(&self) -> RouterStats {
        self.shared.metrics.snapshot()
    }

    /// The event sink this router logs through.
    pub fn events(&self) -> &EventSender {
        &self.shared.events
    }

    /// Attach the parent link. Subscriptions already held are not replayed;
    /// configure the upstream before accepting downstream peers.
    pub fn set_upstream(&self, upstream: Arc<dyn UpstreamLink>) {
        *self.shared.upstream.lock() = Some(upstream);
    }

    pub fn has_upstream(&self) -> bool {
        self.shared.upstream.lock().is_some()
    }

    // ------------------------------------------------------------------
    // Participant lifecycle
    // ------------------------------------------------------------------

    /// Register a new participant around its delivery sink.
    pub fn add_participant(
        &self,
        name: impl Into<String>,
        sink: Box<dyn DatagramSink>,
    ) -> Arc<Participant> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let participant = Arc::new(Participant::new(id, name.into(), sink));

        self.shared
            .participants
            .lock()
            .insert(id, participant.clone());
        self.shared.subs.write().add_member(id);

        tracing::debug!(id, name = %participant.name(), "Participant added");
        participant
    }

    pub fn participant_count(&self) -> usize {
        self.shared.participants.lock().len()
    }

    /// Tear a participant down: unsubscribe everything (firing
    /// last-subscriber hooks), route its post-removes as if it had sent
    /// them, recall the copies buffered upstream, and park the object in
    /// the terminated set for the periodic sweep to destroy.
    pub fn remove_participant(&self, id: ParticipantId) {
        let Some(participant) = self.shared.participants.lock().remove(&id) else {
            return;
        };
        participant.mark_terminated();

        {
            let mut subs = self.shared.subs.write();
            let events = subs.remove_member(id);
            self.replicate(&events);
        }

        let post_removes = participant.take_post_removes();
        let mut senders: Vec<Channel> = Vec::new();
        for (sender, dg) in post_removes {
            if !senders.contains(&sender) {
                senders.push(sender);
            }
            self.route(Some(participant.clone()), dg);
        }
        for sender in senders {
            self.recall_post_removes_upstream(sender);
        }

        tracing::info!(id, name = %participant.name(), "Participant removed");
        self.shared.terminated.lock().push(participant);
    }

    /// Destroy everything in the terminated set. Called by the periodic
    /// sweep in threaded mode and at the tail of inline routing otherwise;
    /// the delay gives workers holding snapshot handles their quiescence
    /// window.
    pub fn sweep_terminated(&self) {
        let drained = std::mem::take(&mut *self.shared.terminated.lock());
        if !drained.is_empty() {
            tracing::trace!(count = drained.len(), "Swept terminated participants");
        }
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    pub fn subscribe_channel(&self, participant: &Arc<Participant>, ch: Channel) {
        let mut subs = self.shared.subs.write();
        let events = subs.subscribe_channel(participant.id(), ch);
        self.replicate(&events);
    }

    pub fn unsubscribe_channel(&self, participant: &Arc<Participant>, ch: Channel) {
        let mut subs = self.shared.subs.write();
        let events = subs.unsubscribe_channel(participant.id(), ch);
        self.replicate(&events);
    }

    pub fn subscribe_range(&self, participant: &Arc<Participant>, range: ChannelRange) {
        let mut subs = self.shared.subs.write();
        let events = subs.subscribe_range(participant.id(), range);
        self.replicate(&events);
    }

    pub fn unsubscribe_range(&self, participant: &Arc<Participant>, range: ChannelRange) {
        let mut subs = self.shared.subs.write();
        let events = subs.unsubscribe_range(participant.id(), range);
        self.replicate(&events);
    }

    pub fn unsubscribe_all(&self, participant: &Arc<Participant>) {
        let mut subs = self.shared.subs.write();
        let events = subs.unsubscribe_all(participant.id());
        self.replicate(&events);
    }

    /// True if `participant` currently hears `ch`.
    pub fn is_subscribed(&self, participant: &Arc<Participant>, ch: Channel) -> bool {
        self.shared.subs.read().is_subscribed(participant.id(), ch)
    }

    // ------------------------------------------------------------------
    // Routing
    // ------------------------------------------------------------------

    /// Entry point for peer-sourced traffic: control messages addressed to
    /// the control channel are consumed here, everything else is routed.
    pub fn dispatch(&self, participant: &Arc<Participant>, dg: DatagramHandle) {
        if datagram::is_control(&dg) {
            if let Err(e) = self.handle_control(participant, &dg) {
                tracing::error!(
                    participant = %participant.name(),
                    error = %e,
                    "Dropping malformed control message"
                );
                self.shared.metrics.record_dropped();
            }
            return;
        }
        self.route(Some(participant.clone()), dg);
    }

    /// Submit a datagram for routing. `origin` is `Some` for locally
    /// sourced traffic and `None` for datagrams received from upstream.
    pub fn route(&self, origin: Option<Arc<Participant>>, dg: DatagramHandle) {
        let mut msg = QueuedDatagram { origin, dg };
        loop {
            match self.shared.queue.push(msg) {
                Ok(()) => break,
                Err(rejected) => {
                    // Full queue: yield and retry. The queue is sized for
                    // headroom, so this is a stall, not an error.
                    msg = rejected;
                    std::thread::yield_now();
                }
            }
        }

        if self.shared.threaded {
            return;
        }
        self.flush_queue();
    }

    /// Drain the queue inline (non-threaded mode). The guard keeps nested
    /// submissions from re-entering; they are picked up by the drain
    /// already in progress.
    fn flush_queue(&self) {
        loop {
            if self.shared.draining.swap(true, Ordering::Acquire) {
                return;
            }
            while let Some(msg) = self.shared.queue.pop() {
                self.process(msg.origin.as_ref(), &msg.dg);
            }
            self.shared.draining.store(false, Ordering::Release);
            // A producer may have slipped in between the last pop and the
            // flag reset; pick its message up rather than strand it.
            if self.shared.queue.is_empty() {
                break;
            }
        }
        self.sweep_terminated();
    }

    fn process(&self, origin: Option<&Arc<Participant>>, dg: &DatagramHandle) {
        let mut dgi = DatagramIterator::new(dg);
        let receivers = match datagram::read_receivers(&mut dgi) {
            Ok(receivers) => receivers,
            Err(e) => {
                tracing::error!(
                    origin = %origin_name(origin),
                    error = %e,
                    "Truncated datagram header; dropping"
                );
                self.shared.metrics.record_dropped();
                return;
            }
        };

        // Snapshot the target set so termination during delivery cannot
        // invalidate the iteration.
        let targets: Vec<Arc<Participant>> = {
            let subs = self.shared.subs.read();
            let mut ids = subs.lookup(&receivers);
            drop(subs);
            if let Some(origin) = origin {
                ids.remove(&origin.id());
            }
            let live = self.shared.participants.lock();
            ids.iter().filter_map(|id| live.get(id).cloned()).collect()
        };

        for target in &targets {
            if target.is_terminated() {
                continue;
            }
            if let Err(e) = target.deliver(dg) {
                tracing::error!(
                    origin = %origin_name(origin),
                    target = %target.name(),
                    error = %e,
                    "Delivery failed; continuing fan-out"
                );
                self.shared.metrics.record_delivery_error();
            }
        }

        self.shared.metrics.record_routed(dg.size());

        if origin.is_some() {
            // Locally sourced: replicate to the parent. With no parent we
            // are the root of the tree and the fan-out above was final.
            let upstream = self.shared.upstream.lock();
            if let Some(up) = upstream.as_ref() {
                up.forward(dg.clone());
            }
        }
        // origin == None means the datagram came from upstream; never
        // reflect it back.
    }

    // ------------------------------------------------------------------
    // Control channel
    // ------------------------------------------------------------------

    fn handle_control(
        &self,
        participant: &Arc<Participant>,
        dg: &DatagramHandle,
    ) -> Result<(), Error> {
        // Past the receiver header: count byte plus one channel.
        let mut dgi = DatagramIterator::with_offset(dg, 1 + 8);
        let code = dgi.read_u16()?;
        match code {
            CONTROL_ADD_CHANNEL => {
                let ch = dgi.read_channel()?;
                self.subscribe_channel(participant, ch);
            }
            CONTROL_REMOVE_CHANNEL => {
                let ch = dgi.read_channel()?;
                self.unsubscribe_channel(participant, ch);
            }
            CONTROL_ADD_RANGE => {
                let lo = dgi.read_channel()?;
                let hi = dgi.read_channel()?;
                self.subscribe_range(participant, ChannelRange::new(lo, hi));
            }
            CONTROL_REMOVE_RANGE => {
                let lo = dgi.read_channel()?;
                let hi = dgi.read_channel()?;
                self.unsubscribe_range(participant, ChannelRange::new(lo, hi));
            }
            CONTROL_ADD_POST_REMOVE => {
                let sender = dgi.read_channel()?;
                let blob = dgi.read_blob()?;
                let stored = Datagram::from_bytes(blob).into_handle();
                participant.add_post_remove(sender, stored);
                self.preroute_post_remove_upstream(sender, blob);
            }
            CONTROL_CLEAR_POST_REMOVES => {
                let sender = dgi.read_channel()?;
                participant.clear_post_removes(sender);
                self.recall_post_removes_upstream(sender);
            }
            CONTROL_SET_CON_NAME => {
                let name = dgi.read_string()?;
                tracing::debug!(
                    id = participant.id(),
                    old = %participant.name(),
                    new = %name,
                    "Participant renamed"
                );
                participant.set_name(name);
            }
            CONTROL_SET_CON_URL => {
                let url = dgi.read_string()?;
                participant.set_url(url);
            }
            CONTROL_LOG_MESSAGE => {
                let blob = dgi.read_blob()?;
                self.shared.events.send(blob);
            }
            other => return Err(Error::BadControlCode(other)),
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Upstream replication
    // ------------------------------------------------------------------

    /// Mirror first/last subscription transitions to the parent. Called
    /// with the subscription lock held so the parent sees transitions in
    /// the order they were decided.
    fn replicate(&self, events: &[CoverageEvent]) {
        if events.is_empty() {
            return;
        }
        let upstream = self.shared.upstream.lock();
        let Some(up) = upstream.as_ref() else {
            return;
        };
        for event in events {
            let dg = match event {
                CoverageEvent::ChannelAdded(ch) => {
                    let mut dg = Datagram::control(CONTROL_ADD_CHANNEL);
                    dg.add_channel(*ch);
                    dg
                }
                CoverageEvent::ChannelRemoved(ch) => {
                    let mut dg = Datagram::control(CONTROL_REMOVE_CHANNEL);
                    dg.add_channel(*ch);
                    dg
                }
                CoverageEvent::RangeAdded(r) => {
                    let mut dg = Datagram::control(CONTROL_ADD_RANGE);
                    dg.add_channel(r.lo);
                    dg.add_channel(r.hi);
                    dg
                }
                CoverageEvent::RangeRemoved(r) => {
                    let mut dg = Datagram::control(CONTROL_REMOVE_RANGE);
                    dg.add_channel(r.lo);
                    dg.add_channel(r.hi);
                    dg
                }
            };
            up.forward(dg.into_handle());
        }
    }

    /// Buffer a copy of a post-remove with the parent, so it still fires
    /// if this whole router dies instead of the participant alone.
    fn preroute_post_remove_upstream(&self, sender: Channel, blob: &[u8]) {
        let upstream = self.shared.upstream.lock();
        let Some(up) = upstream.as_ref() else {
            return;
        };
        let mut dg = Datagram::control(CONTROL_ADD_POST_REMOVE);
        dg.add_channel(sender);
        dg.add_blob(blob);
        up.forward(dg.into_handle());
    }

    fn recall_post_removes_upstream(&self, sender: Channel) {
        let upstream = self.shared.upstream.lock();
        let Some(up) = upstream.as_ref() else {
            return;
        };
        let mut dg = Datagram::control(CONTROL_CLEAR_POST_REMOVES);
        dg.add_channel(sender);
        up.forward(dg.into_handle());
    }

    // ------------------------------------------------------------------
    // Worker pool
    // ------------------------------------------------------------------

    /// Spawn the routing workers. No-op outside threaded mode or when the
    /// pool is already running.
    pub fn start_workers(&self) {
        if !self.shared.threaded {
            return;
        }
        let mut workers = self.shared.workers.lock();
        if !workers.is_empty() {
            return;
        }
        tracing::info!(workers = self.shared.worker_count, "Starting routing worker pool");
        for worker in 0..self.shared.worker_count {
            let md = self.clone();
            workers.push(std::thread::spawn(move || md.worker_loop(worker)));
        }
    }

    fn worker_loop(&self, worker: usize) {
        tracing::debug!(worker, "Routing worker started");
        loop {
            match self.shared.queue.pop() {
                Some(msg) => self.process(msg.origin.as_ref(), &msg.dg),
                None => {
                    // Exit only once the stop flag is up and the queue has
                    // drained; sleeping beats a condvar for a lock-free pop.
                    if self.shared.stop.load(Ordering::Acquire) {
                        break;
                    }
                    std::thread::sleep(WORKER_IDLE_BACKOFF);
                }
            }
        }
        tracing::debug!(worker, "Routing worker exiting");
    }

    /// Stop the worker pool and release anything still queued.
    pub fn shutdown(&self) {
        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.shared.workers.lock());
        if !workers.is_empty() {
            tracing::info!("Shutting down routing worker pool");
            self.shared.stop.store(true, Ordering::Release);
            for handle in workers {
                let _ = handle.join();
            }
            self.shared.stop.store(false, Ordering::Release);
        }

        while self.shared.queue.pop().is_some() {}
        self.sweep_terminated();
    }
}

fn origin_name(origin: Option<&Arc<Participant>>) -> String {
    match origin {
        Some(p) => p.name(),
        None => "upstream".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::participant::testing::{CollectSink, FailSink};

    fn director() -> MessageDirector {
        MessageDirector::new(false, EventSender::disabled())
    }

    fn add_with_sink(md: &MessageDirector, name: &str) -> (Arc<Participant>, Arc<CollectSink>) {
        let sink = Arc::new(CollectSink::default());
        let p = md.add_participant(name, Box::new(SharedSink(sink.clone())));
        (p, sink)
    }

    /// Adapter so tests can keep a handle on the sink they hand over.
    struct SharedSink(Arc<CollectSink>);

    impl DatagramSink for SharedSink {
        fn deliver(&self, dg: &DatagramHandle) -> Result<(), Error> {
            self.0.deliver(dg)
        }
    }

    #[derive(Default)]
    struct CaptureUpstream {
        sent: Mutex<Vec<DatagramHandle>>,
    }

    impl UpstreamLink for CaptureUpstream {
        fn forward(&self, dg: DatagramHandle) {
            self.sent.lock().push(dg);
        }
    }

    impl CaptureUpstream {
        fn control_codes(&self) -> Vec<u16> {
            self.sent
                .lock()
                .iter()
                .filter(|dg| datagram::is_control(dg))
                .map(|dg| {
                    DatagramIterator::with_offset(dg, 9)
                        .read_u16()
                        .expect("control code")
                })
                .collect()
        }
    }

    fn payload(dg: &DatagramHandle) -> Vec<u8> {
        let mut dgi = DatagramIterator::new(dg);
        datagram::read_receivers(&mut dgi).unwrap();
        dgi.read_remainder().to_vec()
    }

    #[test]
    fn test_single_channel_fanout() {
        // S1: A and B on 100, C on 200; D publishes to [100].
        let md = director();
        let (a, a_sink) = add_with_sink(&md, "A");
        let (b, b_sink) = add_with_sink(&md, "B");
        let (c, c_sink) = add_with_sink(&md, "C");
        let (d, d_sink) = add_with_sink(&md, "D");

        md.subscribe_channel(&a, 100);
        md.subscribe_channel(&b, 100);
        md.subscribe_channel(&c, 200);

        let mut dg = Datagram::to_channel(100);
        dg.add_data(&[0xAA, 0xBB]);
        md.route(Some(d.clone()), dg.into_handle());

        assert_eq!(payload(&a_sink.received.lock()[0]), vec![0xAA, 0xBB]);
        assert_eq!(payload(&b_sink.received.lock()[0]), vec![0xAA, 0xBB]);
        assert!(c_sink.received.lock().is_empty());
        assert!(d_sink.received.lock().is_empty());
    }

    #[test]
    fn test_no_self_delivery_even_when_subscribed() {
        let md = director();
        let (a, a_sink) = add_with_sink(&md, "A");
        let (b, b_sink) = add_with_sink(&md, "B");
        md.subscribe_channel(&a, 7);
        md.subscribe_channel(&b, 7);

        md.route(Some(a.clone()), Datagram::to_channel(7).into_handle());
        assert!(a_sink.received.lock().is_empty());
        assert_eq!(b_sink.received.lock().len(), 1);
    }

    #[test]
    fn test_range_subscription_routing() {
        // S2: subscribe [1000, 2000], hit 1500, miss 3000, unsubscribe.
        let md = director();
        let (a, a_sink) = add_with_sink(&md, "A");
        let (sender, _) = add_with_sink(&md, "sender");

        md.subscribe_range(&a, ChannelRange::new(1000, 2000));
        md.route(Some(sender.clone()), Datagram::to_channel(1500).into_handle());
        assert_eq!(a_sink.received.lock().len(), 1);

        md.route(Some(sender.clone()), Datagram::to_channel(3000).into_handle());
        assert_eq!(a_sink.received.lock().len(), 1);

        md.unsubscribe_range(&a, ChannelRange::new(1000, 2000));
        md.route(Some(sender.clone()), Datagram::to_channel(1500).into_handle());
        assert_eq!(a_sink.received.lock().len(), 1);
    }

    #[test]
    fn test_post_remove_delivery() {
        // S3: A queues a post-remove targeting 500; B hears 500.
        let md = director();
        let (a, a_sink) = add_with_sink(&md, "A");
        let (b, b_sink) = add_with_sink(&md, "B");

        md.subscribe_channel(&a, 500);
        md.subscribe_channel(&b, 500);

        let mut r = Datagram::to_channel(500);
        r.add_data(&[0x52]);
        a.add_post_remove(77, r.into_handle());

        md.remove_participant(a.id());

        let received = b_sink.received.lock();
        assert_eq!(received.len(), 1);
        assert_eq!(payload(&received[0]), vec![0x52]);
        // The removed participant got nothing, and its buffer is spent.
        assert!(a_sink.received.lock().is_empty());
        assert!(a.take_post_removes().is_empty());
    }

    #[test]
    fn test_post_removes_deliver_in_order() {
        let md = director();
        let (a, _) = add_with_sink(&md, "A");
        let (b, b_sink) = add_with_sink(&md, "B");
        md.subscribe_channel(&b, 500);

        for i in 0..3u8 {
            let mut dg = Datagram::to_channel(500);
            dg.add_u8(i);
            a.add_post_remove(1, dg.into_handle());
        }
        md.remove_participant(a.id());

        let received = b_sink.received.lock();
        let order: Vec<u8> = received.iter().map(|dg| payload(dg)[0]).collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn test_terminated_participant_receives_nothing() {
        let md = director();
        let (a, a_sink) = add_with_sink(&md, "A");
        let (sender, _) = add_with_sink(&md, "sender");
        md.subscribe_channel(&a, 9);

        md.remove_participant(a.id());
        md.route(Some(sender.clone()), Datagram::to_channel(9).into_handle());
        assert!(a_sink.received.lock().is_empty());

        md.sweep_terminated();
    }

    #[test]
    fn test_delivery_failure_is_isolated() {
        let md = director();
        let failing = md.add_participant("failing", Box::new(FailSink));
        let (ok, ok_sink) = add_with_sink(&md, "ok");
        let (sender, _) = add_with_sink(&md, "sender");

        md.subscribe_channel(&failing, 11);
        md.subscribe_channel(&ok, 11);

        md.route(Some(sender.clone()), Datagram::to_channel(11).into_handle());
        assert_eq!(ok_sink.received.lock().len(), 1);
        assert_eq!(md.stats().delivery_errors, 1);
    }

    #[test]
    fn test_truncated_header_dropped() {
        let md = director();
        let (a, a_sink) = add_with_sink(&md, "A");
        let (sender, _) = add_with_sink(&md, "sender");
        md.subscribe_channel(&a, 5);

        // Claims two receivers but carries only one.
        let mut dg = Datagram::new();
        dg.add_u8(2);
        dg.add_channel(5);
        md.route(Some(sender.clone()), dg.into_handle());

        assert!(a_sink.received.lock().is_empty());
        assert_eq!(md.stats().datagrams_dropped, 1);
    }

    #[test]
    fn test_upstream_replication_first_last() {
        // S4: only coverage transitions replicate.
        let md = director();
        let upstream = Arc::new(CaptureUpstream::default());
        md.set_upstream(upstream.clone());

        let (a, _) = add_with_sink(&md, "A");
        let (b, _) = add_with_sink(&md, "B");

        md.subscribe_channel(&a, 42);
        assert_eq!(upstream.control_codes(), vec![CONTROL_ADD_CHANNEL]);

        md.subscribe_channel(&b, 42);
        assert_eq!(upstream.control_codes().len(), 1);

        md.unsubscribe_channel(&a, 42);
        assert_eq!(upstream.control_codes().len(), 1);

        md.unsubscribe_channel(&b, 42);
        assert_eq!(
            upstream.control_codes(),
            vec![CONTROL_ADD_CHANNEL, CONTROL_REMOVE_CHANNEL]
        );
    }

    #[test]
    fn test_local_traffic_forwards_upstream_but_not_back() {
        let md = director();
        let upstream = Arc::new(CaptureUpstream::default());
        md.set_upstream(upstream.clone());
        let (a, a_sink) = add_with_sink(&md, "A");
        md.subscribe_channel(&a, 123);

        // Upstream-sourced: delivered locally, not reflected.
        md.route(None, Datagram::to_channel(123).into_handle());
        assert_eq!(a_sink.received.lock().len(), 1);
        assert!(upstream.sent.lock().iter().all(|dg| datagram::is_control(dg)));

        // Locally sourced: forwarded up.
        let (b, _) = add_with_sink(&md, "B");
        md.route(Some(b.clone()), Datagram::to_channel(123).into_handle());
        let data_up: Vec<_> = upstream
            .sent
            .lock()
            .iter()
            .filter(|dg| !datagram::is_control(dg))
            .cloned()
            .collect();
        assert_eq!(data_up.len(), 1);
    }

    #[test]
    fn test_control_dispatch_over_wire_shapes() {
        let md = director();
        let (a, a_sink) = add_with_sink(&md, "A");
        let (sender, _) = add_with_sink(&md, "sender");

        // Subscribe via a wire-shaped control datagram.
        let mut sub = Datagram::control(CONTROL_ADD_CHANNEL);
        sub.add_channel(600);
        md.dispatch(&a, sub.into_handle());

        md.route(Some(sender.clone()), Datagram::to_channel(600).into_handle());
        assert_eq!(a_sink.received.lock().len(), 1);

        // Rename via control.
        let mut rename = Datagram::control(CONTROL_SET_CON_NAME);
        rename.add_string("renamed");
        md.dispatch(&a, rename.into_handle());
        assert_eq!(a.name(), "renamed");

        let mut set_url = Datagram::control(CONTROL_SET_CON_URL);
        set_url.add_string("md://example");
        md.dispatch(&a, set_url.into_handle());
        assert_eq!(a.url(), "md://example");

        // Unsubscribe via control.
        let mut unsub = Datagram::control(CONTROL_REMOVE_CHANNEL);
        unsub.add_channel(600);
        md.dispatch(&a, unsub.into_handle());
        md.route(Some(sender.clone()), Datagram::to_channel(600).into_handle());
        assert_eq!(a_sink.received.lock().len(), 1);
    }

    #[test]
    fn test_control_shape_requires_exact_header() {
        let md = director();
        let (a, a_sink) = add_with_sink(&md, "A");
        let (b, _) = add_with_sink(&md, "B");
        md.subscribe_channel(&a, crate::protocol::CONTROL_CHANNEL);

        // A subscribe-shaped body addressed to [control, 99] is plain data:
        // it reaches channel-1 subscribers and mutates nothing.
        let mut data = Datagram::to_channels(&[crate::protocol::CONTROL_CHANNEL, 99]);
        data.add_u16(CONTROL_ADD_CHANNEL);
        data.add_channel(555);
        md.dispatch(&b, data.into_handle());

        assert_eq!(a_sink.received.lock().len(), 1);
        assert!(!md.is_subscribed(&b, 555));
    }

    #[test]
    fn test_bad_control_code_dropped() {
        let md = director();
        let (a, _) = add_with_sink(&md, "A");
        let bogus = Datagram::control(0x4242);
        md.dispatch(&a, bogus.into_handle());
        assert_eq!(md.stats().datagrams_dropped, 1);
    }

    #[test]
    fn test_post_remove_control_replicates_upstream() {
        let md = director();
        let upstream = Arc::new(CaptureUpstream::default());
        md.set_upstream(upstream.clone());
        let (a, _) = add_with_sink(&md, "A");

        let mut inner = Datagram::to_channel(500);
        inner.add_data(&[1, 2, 3]);

        let mut add = Datagram::control(CONTROL_ADD_POST_REMOVE);
        add.add_channel(77);
        add.add_blob(inner.as_slice());
        md.dispatch(&a, add.into_handle());
        assert_eq!(upstream.control_codes(), vec![CONTROL_ADD_POST_REMOVE]);

        let mut clear = Datagram::control(CONTROL_CLEAR_POST_REMOVES);
        clear.add_channel(77);
        md.dispatch(&a, clear.into_handle());
        assert_eq!(
            upstream.control_codes(),
            vec![CONTROL_ADD_POST_REMOVE, CONTROL_CLEAR_POST_REMOVES]
        );

        // Cleared: removal routes nothing and recalls nothing further for
        // that sender.
        md.remove_participant(a.id());
        assert_eq!(
            upstream.control_codes(),
            vec![CONTROL_ADD_POST_REMOVE, CONTROL_CLEAR_POST_REMOVES]
        );
    }

    #[test]
    fn test_threaded_mode_delivers() {
        let md = MessageDirector::new(true, EventSender::disabled());
        md.start_workers();

        let (a, a_sink) = add_with_sink(&md, "A");
        let (sender, _) = add_with_sink(&md, "sender");
        md.subscribe_channel(&a, 300);

        for _ in 0..16 {
            md.route(Some(sender.clone()), Datagram::to_channel(300).into_handle());
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while a_sink.received.lock().len() < 16 {
            assert!(std::time::Instant::now() < deadline, "fan-out stalled");
            std::thread::sleep(Duration::from_millis(1));
        }

        md.shutdown();
        assert_eq!(a_sink.received.lock().len(), 16);
    }
}
