//! Participants: the endpoints the router delivers to.
//!
//! The router owns every participant. Transports hand a [`DatagramSink`] to
//! [`MessageDirector::add_participant`](crate::routing::MessageDirector::add_participant)
//! and get back a shared handle; when the transport dies it calls
//! `remove_participant` and the router takes care of unsubscription,
//! post-remove delivery, and deferred destruction.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::error::Error;
use crate::protocol::constants::Channel;
use crate::protocol::datagram::DatagramHandle;

/// Stable identity of a participant for the life of its registration.
pub type ParticipantId = u64;

/// Where delivered datagrams go.
///
/// Implementations must be callable from routing worker threads; network
/// participants enqueue onto their connection's send queue, in-process
/// participants consume directly.
pub trait DatagramSink: Send + Sync {
    /// Deliver one datagram. A failure is isolated to this delivery: the
    /// router logs it and carries on with the rest of the fan-out.
    fn deliver(&self, dg: &DatagramHandle) -> Result<(), Error>;
}

/// A routing endpoint local to this director.
pub struct Participant {
    id: ParticipantId,
    name: Mutex<String>,
    url: Mutex<String>,
    terminated: AtomicBool,
    // Ordered; multiple entries per sender are allowed and delivered in
    // registration order.
    post_removes: Mutex<Vec<(Channel, DatagramHandle)>>,
    sink: Box<dyn DatagramSink>,
}

impl Participant {
    pub(crate) fn new(id: ParticipantId, name: String, sink: Box<dyn DatagramSink>) -> Self {
        Self {
            id,
            name: Mutex::new(name),
            url: Mutex::new(String::new()),
            terminated: AtomicBool::new(false),
            post_removes: Mutex::new(Vec::new()),
            sink,
        }
    }

    pub fn id(&self) -> ParticipantId {
        self.id
    }

    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    pub fn set_name(&self, name: String) {
        *self.name.lock() = name;
    }

    pub fn url(&self) -> String {
        self.url.lock().clone()
    }

    pub fn set_url(&self, url: String) {
        *self.url.lock() = url;
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    pub(crate) fn mark_terminated(&self) {
        self.terminated.store(true, Ordering::Release);
    }

    /// Queue a datagram to be routed on this participant's behalf when it
    /// is removed.
    pub fn add_post_remove(&self, sender: Channel, dg: DatagramHandle) {
        self.post_removes.lock().push((sender, dg));
    }

    /// Drop queued post-removes registered under `sender`.
    pub fn clear_post_removes(&self, sender: Channel) {
        self.post_removes.lock().retain(|(s, _)| *s != sender);
    }

    /// Take the whole buffer for delivery; leaves it empty.
    pub(crate) fn take_post_removes(&self) -> Vec<(Channel, DatagramHandle)> {
        std::mem::take(&mut self.post_removes.lock())
    }

    pub(crate) fn deliver(&self, dg: &DatagramHandle) -> Result<(), Error> {
        self.sink.deliver(dg)
    }
}

impl std::fmt::Debug for Participant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Participant")
            .field("id", &self.id)
            .field("name", &self.name.lock())
            .field("terminated", &self.is_terminated())
            .finish()
    }
}
