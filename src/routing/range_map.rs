//! Interval bookkeeping for range subscriptions.
//!
//! Two structures share the [`ChannelRange`] vocabulary:
//!
//! * [`RangeSet`] tracks one participant's own coverage as disjoint, merged
//!   spans, so re-subscribing an overlapping range and unsubscribing a
//!   sub-range both resolve to the exact portions that changed.
//! * [`RangeMap`] is the router-wide interval map from disjoint spans to
//!   subscriber sets. Point lookups answer "who covers channel c"; inserts
//!   and removals report the sub-ranges whose global coverage appeared or
//!   vanished, which drives upstream replication.

use std::collections::{BTreeMap, HashSet};

use crate::protocol::constants::Channel;
use crate::routing::participant::ParticipantId;

/// Closed interval of channels, `lo <= hi`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelRange {
    pub lo: Channel,
    pub hi: Channel,
}

impl ChannelRange {
    /// Build a range, swapping inverted bounds rather than rejecting them.
    pub fn new(lo: Channel, hi: Channel) -> Self {
        if lo <= hi {
            Self { lo, hi }
        } else {
            Self { lo: hi, hi: lo }
        }
    }

    pub fn contains(&self, c: Channel) -> bool {
        self.lo <= c && c <= self.hi
    }

    pub fn overlaps(&self, other: &ChannelRange) -> bool {
        self.lo <= other.hi && other.lo <= self.hi
    }
}

impl std::fmt::Display for ChannelRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {}]", self.lo, self.hi)
    }
}

/// Merge adjacent or overlapping ranges in an ascending, disjoint list.
fn coalesce(mut ranges: Vec<ChannelRange>) -> Vec<ChannelRange> {
    ranges.sort_by_key(|r| r.lo);
    let mut out: Vec<ChannelRange> = Vec::with_capacity(ranges.len());
    for r in ranges {
        match out.last_mut() {
            Some(last) if last.hi.saturating_add(1) >= r.lo => {
                last.hi = last.hi.max(r.hi);
            }
            _ => out.push(r),
        }
    }
    out
}

/// One participant's normalized range coverage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeSet {
    // Sorted by lo; disjoint; adjacent spans merged.
    spans: Vec<ChannelRange>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    pub fn contains(&self, c: Channel) -> bool {
        self.spans
            .binary_search_by(|s| {
                if s.hi < c {
                    std::cmp::Ordering::Less
                } else if s.lo > c {
                    std::cmp::Ordering::Greater
                } else {
                    std::cmp::Ordering::Equal
                }
            })
            .is_ok()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChannelRange> {
        self.spans.iter()
    }

    /// Add `r`, returning the portions that were not covered before.
    pub fn insert(&mut self, r: ChannelRange) -> Vec<ChannelRange> {
        let added = self.gaps_in(r);
        if added.is_empty() {
            return added;
        }

        // Union `r` into the span list, absorbing everything it touches.
        let mut lo = r.lo;
        let mut hi = r.hi;
        self.spans.retain(|s| {
            let touches = s.lo <= hi.saturating_add(1) && s.hi.saturating_add(1) >= lo;
            if touches {
                lo = lo.min(s.lo);
                hi = hi.max(s.hi);
            }
            !touches
        });
        let merged = ChannelRange { lo, hi };
        let pos = self
            .spans
            .binary_search_by_key(&merged.lo, |s| s.lo)
            .unwrap_err();
        self.spans.insert(pos, merged);

        added
    }

    /// Subtract `r`, returning the portions that were actually covered.
    pub fn remove(&mut self, r: ChannelRange) -> Vec<ChannelRange> {
        let mut removed = Vec::new();
        let mut kept = Vec::with_capacity(self.spans.len() + 1);
        for s in self.spans.drain(..) {
            if s.hi < r.lo || s.lo > r.hi {
                kept.push(s);
                continue;
            }
            let cut = ChannelRange {
                lo: s.lo.max(r.lo),
                hi: s.hi.min(r.hi),
            };
            if s.lo < cut.lo {
                kept.push(ChannelRange {
                    lo: s.lo,
                    hi: cut.lo - 1,
                });
            }
            if s.hi > cut.hi {
                kept.push(ChannelRange {
                    lo: cut.hi + 1,
                    hi: s.hi,
                });
            }
            removed.push(cut);
        }
        self.spans = kept;
        removed
    }

    /// Drop all coverage, returning what was held.
    pub fn clear(&mut self) -> Vec<ChannelRange> {
        std::mem::take(&mut self.spans)
    }

    /// Portions of `r` not currently covered.
    fn gaps_in(&self, r: ChannelRange) -> Vec<ChannelRange> {
        let mut gaps = Vec::new();
        let mut cursor = Some(r.lo);
        for s in &self.spans {
            if s.hi < r.lo || s.lo > r.hi {
                continue;
            }
            let Some(c) = cursor else { break };
            if s.lo > c {
                gaps.push(ChannelRange { lo: c, hi: s.lo - 1 });
            }
            cursor = if s.hi >= r.hi { None } else { Some(s.hi + 1) };
        }
        if let Some(c) = cursor {
            gaps.push(ChannelRange { lo: c, hi: r.hi });
        }
        gaps
    }
}

#[derive(Debug, Clone)]
struct MapSpan {
    hi: Channel,
    subs: HashSet<ParticipantId>,
}

/// Interval map from disjoint spans to the participants covering them.
#[derive(Debug, Clone, Default)]
pub struct RangeMap {
    // Keyed by span lo. Spans are disjoint; a span exists only while at
    // least one participant covers it.
    spans: BTreeMap<Channel, MapSpan>,
}

impl RangeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    /// Collect every participant whose coverage contains `c`.
    pub fn lookup(&self, c: Channel, out: &mut HashSet<ParticipantId>) {
        if let Some((_, span)) = self.spans.range(..=c).next_back() {
            if span.hi >= c {
                out.extend(span.subs.iter().copied());
            }
        }
    }

    /// True if `pid` covers channel `c`.
    pub fn covers(&self, pid: ParticipantId, c: Channel) -> bool {
        self.spans
            .range(..=c)
            .next_back()
            .is_some_and(|(_, s)| s.hi >= c && s.subs.contains(&pid))
    }

    /// Register `pid` over `r`. The caller guarantees `pid` does not already
    /// cover any part of `r` (per-participant normalization happens in
    /// [`RangeSet`]). Returns the maximal sub-ranges that previously had no
    /// subscriber at all.
    pub fn insert(&mut self, pid: ParticipantId, r: ChannelRange) -> Vec<ChannelRange> {
        let keys = self.overlapping_keys(r);
        let mut cursor = Some(r.lo);
        let mut newly = Vec::new();

        for k in keys {
            let span = self.spans.remove(&k).expect("span key vanished");
            let span_range = ChannelRange { lo: k, hi: span.hi };
            let cut = ChannelRange {
                lo: span_range.lo.max(r.lo),
                hi: span_range.hi.min(r.hi),
            };

            // Untouched left/right remainders keep the old subscriber set.
            if span_range.lo < cut.lo {
                self.spans.insert(
                    span_range.lo,
                    MapSpan {
                        hi: cut.lo - 1,
                        subs: span.subs.clone(),
                    },
                );
            }
            if span_range.hi > cut.hi {
                self.spans.insert(
                    cut.hi + 1,
                    MapSpan {
                        hi: span_range.hi,
                        subs: span.subs.clone(),
                    },
                );
            }

            // Gap before this span had no coverage until now.
            if let Some(c) = cursor {
                if cut.lo > c {
                    let gap = ChannelRange { lo: c, hi: cut.lo - 1 };
                    self.spans.insert(
                        gap.lo,
                        MapSpan {
                            hi: gap.hi,
                            subs: HashSet::from([pid]),
                        },
                    );
                    newly.push(gap);
                }
            }

            let mut subs = span.subs;
            subs.insert(pid);
            self.spans.insert(cut.lo, MapSpan { hi: cut.hi, subs });
            cursor = cut.hi.checked_add(1).filter(|&c| c <= r.hi);
        }

        if let Some(c) = cursor {
            let gap = ChannelRange { lo: c, hi: r.hi };
            self.spans.insert(
                gap.lo,
                MapSpan {
                    hi: gap.hi,
                    subs: HashSet::from([pid]),
                },
            );
            newly.push(gap);
        }

        coalesce(newly)
    }

    /// Withdraw `pid` from `r`. The caller guarantees `pid` covers all of
    /// `r`. Returns the maximal sub-ranges left with no subscriber.
    pub fn remove(&mut self, pid: ParticipantId, r: ChannelRange) -> Vec<ChannelRange> {
        let keys = self.overlapping_keys(r);
        let mut uncovered = Vec::new();

        for k in keys {
            let span = self.spans.remove(&k).expect("span key vanished");
            let span_range = ChannelRange { lo: k, hi: span.hi };
            let cut = ChannelRange {
                lo: span_range.lo.max(r.lo),
                hi: span_range.hi.min(r.hi),
            };

            if span_range.lo < cut.lo {
                self.spans.insert(
                    span_range.lo,
                    MapSpan {
                        hi: cut.lo - 1,
                        subs: span.subs.clone(),
                    },
                );
            }
            if span_range.hi > cut.hi {
                self.spans.insert(
                    cut.hi + 1,
                    MapSpan {
                        hi: span_range.hi,
                        subs: span.subs.clone(),
                    },
                );
            }

            let mut subs = span.subs;
            subs.remove(&pid);
            if subs.is_empty() {
                uncovered.push(cut);
            } else {
                self.spans.insert(cut.lo, MapSpan { hi: cut.hi, subs });
            }
        }

        coalesce(uncovered)
    }

    /// Keys of spans intersecting `r`, ascending.
    fn overlapping_keys(&self, r: ChannelRange) -> Vec<Channel> {
        let mut keys = Vec::new();
        if let Some((&k, span)) = self.spans.range(..r.lo).next_back() {
            if span.hi >= r.lo {
                keys.push(k);
            }
        }
        keys.extend(self.spans.range(r.lo..=r.hi).map(|(&k, _)| k));
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(lo: Channel, hi: Channel) -> ChannelRange {
        ChannelRange::new(lo, hi)
    }

    fn lookup(map: &RangeMap, c: Channel) -> HashSet<ParticipantId> {
        let mut out = HashSet::new();
        map.lookup(c, &mut out);
        out
    }

    #[test]
    fn test_range_set_insert_reports_new_coverage() {
        let mut set = RangeSet::new();
        assert_eq!(set.insert(r(100, 200)), vec![r(100, 200)]);
        // Fully inside: nothing new.
        assert_eq!(set.insert(r(120, 180)), vec![]);
        // Overlap on both sides: only the flanks are new.
        assert_eq!(set.insert(r(50, 250)), vec![r(50, 99), r(201, 250)]);
        assert!(set.contains(50) && set.contains(250) && !set.contains(251));
    }

    #[test]
    fn test_range_set_merges_adjacent() {
        let mut set = RangeSet::new();
        set.insert(r(0, 9));
        set.insert(r(10, 19));
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![&r(0, 19)]);
    }

    #[test]
    fn test_range_set_remove_subrange_splits() {
        let mut set = RangeSet::new();
        set.insert(r(1000, 2000));
        assert_eq!(set.remove(r(1200, 1300)), vec![r(1200, 1300)]);
        assert!(set.contains(1199) && !set.contains(1200));
        assert!(!set.contains(1300) && set.contains(1301));
        // Removing a range never held yields nothing.
        assert_eq!(set.remove(r(5000, 6000)), vec![]);
    }

    #[test]
    fn test_range_set_channel_max_boundary() {
        let mut set = RangeSet::new();
        assert_eq!(
            set.insert(r(Channel::MAX - 10, Channel::MAX)),
            vec![r(Channel::MAX - 10, Channel::MAX)]
        );
        assert!(set.contains(Channel::MAX));
        assert_eq!(
            set.remove(r(Channel::MAX - 10, Channel::MAX)),
            vec![r(Channel::MAX - 10, Channel::MAX)]
        );
        assert!(set.is_empty());
    }

    #[test]
    fn test_range_map_first_and_last_coverage() {
        let mut map = RangeMap::new();
        assert_eq!(map.insert(1, r(1000, 2000)), vec![r(1000, 2000)]);
        // Second subscriber over a sub-range: nothing newly covered.
        assert_eq!(map.insert(2, r(1500, 1600)), vec![]);

        assert_eq!(lookup(&map, 1500), HashSet::from([1, 2]));
        assert_eq!(lookup(&map, 1499), HashSet::from([1]));
        assert!(lookup(&map, 3000).is_empty());

        // First subscriber leaves: only the part nobody else covers opens up.
        assert_eq!(
            map.remove(1, r(1000, 2000)),
            vec![r(1000, 1499), r(1601, 2000)]
        );
        assert_eq!(lookup(&map, 1550), HashSet::from([2]));

        assert_eq!(map.remove(2, r(1500, 1600)), vec![r(1500, 1600)]);
        assert!(map.is_empty());
    }

    #[test]
    fn test_range_map_gap_spanning_insert() {
        let mut map = RangeMap::new();
        map.insert(1, r(10, 19));
        map.insert(1, r(40, 49));
        // Covers the hole and both flanks.
        assert_eq!(map.insert(2, r(0, 60)), vec![r(0, 9), r(20, 39), r(50, 60)]);
        assert_eq!(lookup(&map, 15), HashSet::from([1, 2]));
        assert_eq!(lookup(&map, 30), HashSet::from([2]));
    }

    #[test]
    fn test_range_map_remove_coalesces_fragments() {
        let mut map = RangeMap::new();
        map.insert(1, r(0, 100));
        // Fragment participant 1's coverage into multiple spans.
        map.insert(2, r(40, 60));
        map.remove(2, r(40, 60));
        // Withdrawal still reports one maximal uncovered range.
        assert_eq!(map.remove(1, r(0, 100)), vec![r(0, 100)]);
    }

    #[test]
    fn test_range_map_point_spans() {
        let mut map = RangeMap::new();
        assert_eq!(map.insert(7, r(42, 42)), vec![r(42, 42)]);
        assert!(map.covers(7, 42));
        assert!(!map.covers(7, 41));
        assert_eq!(map.remove(7, r(42, 42)), vec![r(42, 42)]);
        assert!(map.is_empty());
    }

    #[test]
    fn test_coalesce_merges_touching() {
        let merged = coalesce(vec![r(5, 9), r(0, 4), r(20, 30)]);
        assert_eq!(merged, vec![r(0, 9), r(20, 30)]);
    }
}
