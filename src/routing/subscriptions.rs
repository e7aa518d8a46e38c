//! The subscription index: who hears what.
//!
//! Bidirectional bookkeeping between participants and the channels and
//! ranges they subscribe. The forward direction answers routing lookups;
//! the reverse direction (per-member state) makes unsubscribe-all O(its
//! own subscriptions) and keeps the two views consistent under one lock,
//! which the director provides.

use std::collections::{HashMap, HashSet};

use crate::protocol::constants::Channel;
use crate::routing::participant::ParticipantId;
use crate::routing::range_map::{ChannelRange, RangeMap, RangeSet};

/// A first-subscriber or last-subscriber transition, reported to the
/// caller so it can replicate the change upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoverageEvent {
    ChannelAdded(Channel),
    ChannelRemoved(Channel),
    RangeAdded(ChannelRange),
    RangeRemoved(ChannelRange),
}

#[derive(Debug, Default)]
struct MemberSubs {
    channels: HashSet<Channel>,
    coverage: RangeSet,
}

/// Router-wide subscription state.
#[derive(Debug, Default)]
pub struct SubscriptionMap {
    channels: HashMap<Channel, HashSet<ParticipantId>>,
    ranges: RangeMap,
    members: HashMap<ParticipantId, MemberSubs>,
}

impl SubscriptionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a participant with no subscriptions.
    pub fn add_member(&mut self, pid: ParticipantId) {
        self.members.entry(pid).or_default();
    }

    /// Subscribe `pid` to a single channel. Repeat subscriptions are no-ops.
    pub fn subscribe_channel(&mut self, pid: ParticipantId, ch: Channel) -> Vec<CoverageEvent> {
        let member = self.members.entry(pid).or_default();
        if !member.channels.insert(ch) {
            return Vec::new();
        }
        let subs = self.channels.entry(ch).or_default();
        let first = subs.is_empty();
        subs.insert(pid);
        if first {
            vec![CoverageEvent::ChannelAdded(ch)]
        } else {
            Vec::new()
        }
    }

    /// Drop `pid`'s single-channel subscription, if it holds one.
    pub fn unsubscribe_channel(&mut self, pid: ParticipantId, ch: Channel) -> Vec<CoverageEvent> {
        let Some(member) = self.members.get_mut(&pid) else {
            return Vec::new();
        };
        if !member.channels.remove(&ch) {
            return Vec::new();
        }
        self.drop_channel_entry(pid, ch)
    }

    /// Subscribe `pid` over a closed range. Overlap with its existing
    /// coverage resolves to the portions actually added.
    pub fn subscribe_range(&mut self, pid: ParticipantId, r: ChannelRange) -> Vec<CoverageEvent> {
        let member = self.members.entry(pid).or_default();
        let mut events = Vec::new();
        for piece in member.coverage.insert(r) {
            for newly in self.ranges.insert(pid, piece) {
                events.push(CoverageEvent::RangeAdded(newly));
            }
        }
        events
    }

    /// Withdraw `pid` from a closed range. Subtracts from its coverage, so
    /// unsubscribing a sub-range of an earlier subscription splits it.
    pub fn unsubscribe_range(&mut self, pid: ParticipantId, r: ChannelRange) -> Vec<CoverageEvent> {
        let Some(member) = self.members.get_mut(&pid) else {
            return Vec::new();
        };
        let mut events = Vec::new();
        for piece in member.coverage.remove(r) {
            for opened in self.ranges.remove(pid, piece) {
                events.push(CoverageEvent::RangeRemoved(opened));
            }
        }
        events
    }

    /// Remove every subscription `pid` holds.
    pub fn unsubscribe_all(&mut self, pid: ParticipantId) -> Vec<CoverageEvent> {
        let Some(member) = self.members.get_mut(&pid) else {
            return Vec::new();
        };
        let channels: Vec<Channel> = member.channels.drain().collect();
        let spans = member.coverage.clear();

        let mut events = Vec::new();
        for ch in channels {
            events.extend(self.drop_channel_entry(pid, ch));
        }
        for span in spans {
            for opened in self.ranges.remove(pid, span) {
                events.push(CoverageEvent::RangeRemoved(opened));
            }
        }
        events
    }

    /// Unsubscribe everything and forget the member.
    pub fn remove_member(&mut self, pid: ParticipantId) -> Vec<CoverageEvent> {
        let events = self.unsubscribe_all(pid);
        self.members.remove(&pid);
        events
    }

    /// Union of single-channel and range subscribers over a receiver list.
    pub fn lookup(&self, receivers: &[Channel]) -> HashSet<ParticipantId> {
        let mut out = HashSet::new();
        for &ch in receivers {
            if let Some(subs) = self.channels.get(&ch) {
                out.extend(subs.iter().copied());
            }
            self.ranges.lookup(ch, &mut out);
        }
        out
    }

    /// True if `pid` would receive traffic on `ch` via either index.
    pub fn is_subscribed(&self, pid: ParticipantId, ch: Channel) -> bool {
        self.channels
            .get(&ch)
            .is_some_and(|subs| subs.contains(&pid))
            || self.ranges.covers(pid, ch)
    }

    fn drop_channel_entry(&mut self, pid: ParticipantId, ch: Channel) -> Vec<CoverageEvent> {
        let Some(subs) = self.channels.get_mut(&ch) else {
            return Vec::new();
        };
        subs.remove(&pid);
        if subs.is_empty() {
            self.channels.remove(&ch);
            vec![CoverageEvent::ChannelRemoved(ch)]
        } else {
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(lo: Channel, hi: Channel) -> ChannelRange {
        ChannelRange::new(lo, hi)
    }

    #[test]
    fn test_first_and_last_channel_hooks() {
        let mut subs = SubscriptionMap::new();
        assert_eq!(
            subs.subscribe_channel(1, 42),
            vec![CoverageEvent::ChannelAdded(42)]
        );
        // Second subscriber: no hook.
        assert_eq!(subs.subscribe_channel(2, 42), vec![]);
        // Repeat from the same participant: no-op.
        assert_eq!(subs.subscribe_channel(1, 42), vec![]);

        assert_eq!(subs.unsubscribe_channel(1, 42), vec![]);
        assert_eq!(
            subs.unsubscribe_channel(2, 42),
            vec![CoverageEvent::ChannelRemoved(42)]
        );
        // Unsubscribing what was never held: nothing.
        assert_eq!(subs.unsubscribe_channel(2, 42), vec![]);
    }

    #[test]
    fn test_lookup_unions_channels_and_ranges() {
        let mut subs = SubscriptionMap::new();
        subs.subscribe_channel(1, 100);
        subs.subscribe_channel(2, 100);
        subs.subscribe_channel(3, 200);
        subs.subscribe_range(4, r(50, 150));

        assert_eq!(subs.lookup(&[100]), HashSet::from([1, 2, 4]));
        assert_eq!(subs.lookup(&[200]), HashSet::from([3]));
        assert_eq!(subs.lookup(&[100, 200]), HashSet::from([1, 2, 3, 4]));
        assert!(subs.lookup(&[999]).is_empty());
    }

    #[test]
    fn test_range_hooks_track_global_coverage() {
        let mut subs = SubscriptionMap::new();
        assert_eq!(
            subs.subscribe_range(1, r(1000, 2000)),
            vec![CoverageEvent::RangeAdded(r(1000, 2000))]
        );
        // Covered already: no hook for the overlap, one for the extension.
        assert_eq!(
            subs.subscribe_range(2, r(1500, 2500)),
            vec![CoverageEvent::RangeAdded(r(2001, 2500))]
        );

        assert_eq!(
            subs.unsubscribe_range(1, r(1000, 2000)),
            vec![CoverageEvent::RangeRemoved(r(1000, 1499))]
        );
        assert_eq!(
            subs.unsubscribe_range(2, r(1500, 2500)),
            vec![CoverageEvent::RangeRemoved(r(1500, 2500))]
        );
        assert!(subs.lookup(&[1500]).is_empty());
    }

    #[test]
    fn test_channel_and_range_indices_are_independent() {
        let mut subs = SubscriptionMap::new();
        subs.subscribe_range(1, r(0, 100));
        // A single-channel subscription inside someone's range coverage is
        // still a first for the channel index.
        assert_eq!(
            subs.subscribe_channel(2, 50),
            vec![CoverageEvent::ChannelAdded(50)]
        );
        assert_eq!(subs.lookup(&[50]), HashSet::from([1, 2]));
    }

    #[test]
    fn test_unsubscribe_all_fires_every_last_hook() {
        let mut subs = SubscriptionMap::new();
        subs.subscribe_channel(1, 10);
        subs.subscribe_channel(1, 20);
        subs.subscribe_channel(2, 20);
        subs.subscribe_range(1, r(100, 200));

        let events = subs.remove_member(1);
        assert!(events.contains(&CoverageEvent::ChannelRemoved(10)));
        // Channel 20 still has participant 2.
        assert!(!events.contains(&CoverageEvent::ChannelRemoved(20)));
        assert!(events.contains(&CoverageEvent::RangeRemoved(r(100, 200))));

        assert!(subs.lookup(&[10]).is_empty());
        assert_eq!(subs.lookup(&[20]), HashSet::from([2]));
        assert!(subs.lookup(&[150]).is_empty());
    }

    #[test]
    fn test_forward_and_reverse_views_agree() {
        let mut subs = SubscriptionMap::new();
        subs.subscribe_channel(1, 7);
        subs.subscribe_range(1, r(30, 40));

        assert!(subs.is_subscribed(1, 7));
        assert!(subs.is_subscribed(1, 35));
        assert!(!subs.is_subscribed(1, 8));

        subs.unsubscribe_channel(1, 7);
        subs.unsubscribe_range(1, r(30, 40));
        assert!(!subs.is_subscribed(1, 7));
        assert!(!subs.is_subscribed(1, 35));
    }

    #[test]
    fn test_unsubscribe_subrange_keeps_rest() {
        let mut subs = SubscriptionMap::new();
        subs.subscribe_range(1, r(1000, 2000));
        assert_eq!(
            subs.unsubscribe_range(1, r(1400, 1600)),
            vec![CoverageEvent::RangeRemoved(r(1400, 1600))]
        );
        assert!(subs.is_subscribed(1, 1399));
        assert!(!subs.is_subscribed(1, 1500));
        assert!(subs.is_subscribed(1, 1601));
    }
}
