//! Publish/subscribe routing core.
//!
//! The director fans every datagram out to the local participants whose
//! subscriptions match its receiver list, then replicates it to the parent
//! router when the traffic originated locally.
//!
//! # Architecture
//!
//! ```text
//!                         MessageDirector
//!                  ┌───────────────────────────┐
//!   route(origin)  │ queue: ArrayQueue<(o,dg)> │
//!  ───────────────►│ subs:  RwLock<Subscription│
//!                  │        Map>               │
//!                  │ participants / terminated │
//!                  └────────────┬──────────────┘
//!                               │ worker threads (or inline)
//!              ┌────────────────┼────────────────┐
//!              ▼                ▼                ▼
//!        [Participant]    [Participant]    upstream link
//!        sink.deliver()   sink.deliver()   forward(dg)
//! ```
//!
//! Subscriptions are mutated through control messages on channel 1 and take
//! effect before the next `route` call from the same connection; lookups
//! and mutations serialize on the subscription lock.

pub mod director;
pub mod metrics;
pub mod participant;
pub mod range_map;
pub mod subscriptions;

pub use director::{MessageDirector, UpstreamLink};
pub use metrics::{RouterMetrics, RouterStats};
pub use participant::{DatagramSink, Participant, ParticipantId};
pub use range_map::{ChannelRange, RangeMap, RangeSet};
pub use subscriptions::{CoverageEvent, SubscriptionMap};
