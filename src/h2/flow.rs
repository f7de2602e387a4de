use std::collections::{HashMap, HashSet};

use loona_h2::StreamId;
use tracing::{debug, trace};

/// Flow-control windows must never exceed 2^31-1 octets.
pub(crate) const MAX_WINDOW_SIZE: i64 = (1 << 31) - 1;

/// Default window size before any SETTINGS or WINDOW_UPDATE applies.
pub(crate) const DEFAULT_WINDOW_SIZE: i64 = 65_535;

/// Read access to the priority tree, as flow control sees it: every node
/// is a stream id, the connection itself is [StreamId::CONNECTION], and
/// weights follow RFC 7540 section 5.3 (1..=256, default 16).
pub(crate) trait StreamTree {
    /// Parent of `id`; `None` for the connection root (and for ids the
    /// tree doesn't know, which never happens for backlogged streams).
    fn parent_of(&self, id: StreamId) -> Option<StreamId>;

    fn weight_of(&self, id: StreamId) -> u32;

    fn children_of(&self, id: StreamId) -> Vec<StreamId>;
}

#[derive(Default)]
struct BacklogEntry {
    /// Bytes reserved by the stream and not yet turned into a grant.
    remaining: i64,
    /// Bytes granted by an allocation round and not yet consumed.
    granted: i64,
}

/// The connection-level send window, plus the backlog of streams whose
/// reservations couldn't be satisfied from it.
///
/// Grants don't leave the window at allocation time: they're debited when
/// the stream comes back and consumes them via [FlowControl::reserve], so
/// the window plus all outstanding grants always adds up (conservation).
pub(crate) struct FlowControl {
    send_window: i64,
    backlog: HashMap<StreamId, BacklogEntry>,
    backlog_size: i64,
}

impl Default for FlowControl {
    fn default() -> Self {
        Self {
            send_window: DEFAULT_WINDOW_SIZE,
            backlog: HashMap::new(),
            backlog_size: 0,
        }
    }
}

impl FlowControl {
    pub(crate) fn send_window(&self) -> i64 {
        self.send_window
    }

    #[cfg(test)]
    pub(crate) fn backlog_size(&self) -> i64 {
        self.backlog_size
    }

    /// One pass of the window reservation protocol. Returns the number of
    /// bytes granted to `id` right now; zero means the stream is parked
    /// in the backlog and will be woken by a later
    /// [FlowControl::increment_connection_window].
    pub(crate) fn reserve(&mut self, tree: &impl StreamTree, id: StreamId, requested: i64) -> i64 {
        debug_assert!(requested > 0);

        if self.send_window < 1 || self.backlog_size > 0 {
            match self.backlog.get_mut(&id) {
                None => {
                    self.backlog.insert(
                        id,
                        BacklogEntry {
                            remaining: requested,
                            granted: 0,
                        },
                    );
                    self.backlog_size += requested;

                    // every ancestor up to and including the root takes
                    // part in the allocation tree
                    let mut parent = tree.parent_of(id);
                    while let Some(p) = parent {
                        if self.backlog.contains_key(&p) {
                            break;
                        }
                        self.backlog.insert(p, BacklogEntry::default());
                        parent = tree.parent_of(p);
                    }

                    trace!(%id, %requested, backlog_size = %self.backlog_size, "backlogged");
                    0
                }
                Some(entry) => {
                    if entry.granted > 0 {
                        let allocation = entry.granted;
                        if entry.remaining == 0 {
                            // the reservation has been fully allocated so
                            // this stream can leave the backlog
                            self.backlog.remove(&id);
                        } else {
                            // this allocation has been used; the stream
                            // stays backlogged, it still owes bytes
                            entry.granted = 0;
                        }
                        self.send_window -= allocation;
                        allocation
                    } else {
                        0
                    }
                }
            }
        } else if self.send_window < requested {
            let allocation = self.send_window;
            self.send_window = 0;
            allocation
        } else {
            self.send_window -= requested;
            requested
        }
    }

    /// Applies a WINDOW_UPDATE for stream zero. When the window crosses
    /// from exhausted to positive, the backlog is released and the
    /// returned streams must be re-queued for sending.
    ///
    /// Overflow past 2^31-1 is a connection-level flow control error,
    /// surfaced as `Err(())` so the caller picks its own error type.
    pub(crate) fn increment_connection_window(
        &mut self,
        tree: &impl StreamTree,
        increment: i64,
    ) -> Result<HashSet<StreamId>, ()> {
        let window = self.send_window;
        if window + increment > MAX_WINDOW_SIZE {
            return Err(());
        }

        let mut to_notify = HashSet::new();
        if window < 1 && window + increment > 0 {
            to_notify = self.release_backlog(tree, window + increment);
        }
        self.send_window += increment;
        debug!(old = %window, new = %self.send_window, "connection window update");
        Ok(to_notify)
    }

    /// Drops any state the backlog holds for a stream that's going away.
    pub(crate) fn forget(&mut self, id: StreamId) {
        if let Some(entry) = self.backlog.remove(&id) {
            self.backlog_size -= entry.remaining;
        }
    }

    fn release_backlog(&mut self, tree: &impl StreamTree, increment: i64) -> HashSet<StreamId> {
        let mut released = HashSet::new();

        if self.backlog_size < increment {
            // the whole backlog fits: everyone gets to renegotiate
            // against the restored window
            released.extend(self.backlog.keys().copied());
            self.backlog.clear();
            self.backlog_size = 0;
            return released;
        }

        let mut left_to_allocate = increment;
        while left_to_allocate > 0 {
            left_to_allocate = self.allocate(tree, StreamId::CONNECTION, left_to_allocate);
        }

        for (id, entry) in &self.backlog {
            if entry.granted > 0 {
                self.backlog_size -= entry.granted;
                released.insert(*id);
            }
        }
        released
    }

    /// Weighted recursive allocation along the priority tree. Returns the
    /// part of `allocation` that couldn't be placed in this subtree.
    fn allocate(&mut self, tree: &impl StreamTree, node: StreamId, allocation: i64) -> i64 {
        trace!(%node, %allocation, "allocate");

        let entry = self
            .backlog
            .get_mut(&node)
            .expect("allocation only ever visits backlogged nodes");
        if entry.remaining >= allocation {
            entry.remaining -= allocation;
            entry.granted += allocation;
            return 0;
        }

        // the node's own reservation is satisfied; the rest flows to its
        // backlogged children
        let consumed = entry.remaining;
        entry.granted += consumed;
        entry.remaining = 0;
        let mut left_to_allocate = allocation - consumed;

        let mut recipients: Vec<StreamId> = tree
            .children_of(node)
            .into_iter()
            .filter(|child| self.backlog.contains_key(child))
            .collect();

        while left_to_allocate > 0 {
            if recipients.is_empty() {
                self.backlog.remove(&node);
                return left_to_allocate;
            }

            let total_weight: i64 = recipients
                .iter()
                .map(|r| tree.weight_of(*r) as i64)
                .sum();

            let round_pool = left_to_allocate;
            let mut allocated = 0;
            let mut i = 0;
            while i < recipients.len() {
                let recipient = recipients[i];
                let mut share = round_pool * tree.weight_of(recipient) as i64 / total_weight;
                if share == 0 {
                    // avoids rounding triggering an infinite loop; causes
                    // a very slight over-allocation which HTTP/2 copes
                    // with
                    share = 1;
                }
                let remainder = self.allocate(tree, recipient, share);
                if remainder > 0 {
                    // fully satisfied downstream, excluded from the next
                    // round
                    recipients.swap_remove(i);
                } else {
                    i += 1;
                }
                allocated += share - remainder;
            }
            left_to_allocate -= allocated;
        }

        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A priority tree fixture: (id, parent, weight) triples.
    struct FixtureTree {
        nodes: Vec<(u32, u32, u32)>,
    }

    impl FixtureTree {
        fn flat(ids: &[u32]) -> Self {
            Self {
                nodes: ids.iter().map(|&id| (id, 0, 16)).collect(),
            }
        }
    }

    impl StreamTree for FixtureTree {
        fn parent_of(&self, id: StreamId) -> Option<StreamId> {
            if id == StreamId::CONNECTION {
                return None;
            }
            self.nodes
                .iter()
                .find(|(n, _, _)| *n == id.0)
                .map(|(_, p, _)| StreamId(*p))
        }

        fn weight_of(&self, id: StreamId) -> u32 {
            self.nodes
                .iter()
                .find(|(n, _, _)| *n == id.0)
                .map(|(_, _, w)| *w)
                .unwrap_or(16)
        }

        fn children_of(&self, id: StreamId) -> Vec<StreamId> {
            self.nodes
                .iter()
                .filter(|(_, p, _)| *p == id.0)
                .map(|(n, _, _)| StreamId(*n))
                .collect()
        }
    }

    #[test]
    fn grants_up_to_window_then_backlogs() {
        let tree = FixtureTree::flat(&[1]);
        let mut flow = FlowControl::default();

        assert_eq!(flow.reserve(&tree, StreamId(1), 1000), 1000);
        assert_eq!(flow.send_window(), 64_535);

        // more than the window: partial grant, window exhausted
        assert_eq!(flow.reserve(&tree, StreamId(1), 100_000), 64_535);
        assert_eq!(flow.send_window(), 0);

        // nothing left: reservation parks in the backlog
        assert_eq!(flow.reserve(&tree, StreamId(1), 34_465), 0);
        assert_eq!(flow.backlog_size(), 34_465);
    }

    #[test]
    fn window_update_releases_whole_backlog_when_it_fits() {
        let tree = FixtureTree::flat(&[1]);
        let mut flow = FlowControl::default();

        assert_eq!(flow.reserve(&tree, StreamId(1), 65_535), 65_535);
        assert_eq!(flow.reserve(&tree, StreamId(1), 100), 0);

        let released = flow
            .increment_connection_window(&tree, 50_000)
            .unwrap();
        assert!(released.contains(&StreamId(1)));
        assert_eq!(flow.backlog_size(), 0);

        // renegotiation succeeds against the restored window
        assert_eq!(flow.reserve(&tree, StreamId(1), 100), 100);
        assert_eq!(flow.send_window(), 49_900);
    }

    #[test]
    fn partial_release_grants_and_conserves_bytes() {
        let tree = FixtureTree::flat(&[1]);
        let mut flow = FlowControl::default();

        assert_eq!(flow.reserve(&tree, StreamId(1), 65_535), 65_535);
        assert_eq!(flow.reserve(&tree, StreamId(1), 84_465), 0);

        let released = flow
            .increment_connection_window(&tree, 50_000)
            .unwrap();
        assert!(released.contains(&StreamId(1)));

        // the grant is debited from the window when consumed
        assert_eq!(flow.send_window(), 50_000);
        assert_eq!(flow.reserve(&tree, StreamId(1), 84_465), 50_000);
        assert_eq!(flow.send_window(), 0);

        // 34465 bytes still owed
        assert_eq!(flow.backlog_size(), 34_465);
    }

    #[test]
    fn weighted_siblings_split_the_pool() {
        // two streams under the root, weights 16 and 8, both starving
        let tree = FixtureTree {
            nodes: vec![(1, 0, 16), (3, 0, 8)],
        };
        let mut flow = FlowControl::default();

        // drain the window first
        assert_eq!(flow.reserve(&tree, StreamId(1), 65_535), 65_535);
        assert_eq!(flow.reserve(&tree, StreamId(1), 100_000), 0);
        assert_eq!(flow.reserve(&tree, StreamId(3), 100_000), 0);

        let released = flow
            .increment_connection_window(&tree, 1500)
            .unwrap();
        assert!(released.contains(&StreamId(1)));
        assert!(released.contains(&StreamId(3)));

        let granted_1 = flow.reserve(&tree, StreamId(1), 100_000);
        let granted_3 = flow.reserve(&tree, StreamId(3), 100_000);
        assert!((granted_1 - 1000).abs() <= 1, "granted_1 = {granted_1}");
        assert!((granted_3 - 500).abs() <= 1, "granted_3 = {granted_3}");
        assert_eq!(granted_1 + granted_3, 1500);
    }

    #[test]
    fn dependent_stream_waits_for_its_parent() {
        // 3 depends on 1; 1's reservation is served before 3 sees bytes
        let tree = FixtureTree {
            nodes: vec![(1, 0, 16), (3, 1, 16)],
        };
        let mut flow = FlowControl::default();

        assert_eq!(flow.reserve(&tree, StreamId(1), 65_535), 65_535);
        assert_eq!(flow.reserve(&tree, StreamId(1), 1000), 0);
        assert_eq!(flow.reserve(&tree, StreamId(3), 1000), 0);

        flow.increment_connection_window(&tree, 1200).unwrap();

        assert_eq!(flow.reserve(&tree, StreamId(1), 1000), 1000);
        assert_eq!(flow.reserve(&tree, StreamId(3), 1000), 200);
    }

    #[test]
    fn conservation_across_grants_and_updates() {
        // P3: granted total == initial window + updates - current window
        let tree = FixtureTree::flat(&[1, 3, 5]);
        let mut flow = FlowControl::default();
        let mut granted_total: i64 = 0;
        let mut update_total: i64 = 0;

        granted_total += flow.reserve(&tree, StreamId(1), 30_000);
        granted_total += flow.reserve(&tree, StreamId(3), 50_000);
        granted_total += flow.reserve(&tree, StreamId(5), 10_000);
        assert_eq!(flow.reserve(&tree, StreamId(5), 10_000), 0);

        for increment in [5_000i64, 2_000, 20_000] {
            update_total += increment;
            let released = flow.increment_connection_window(&tree, increment).unwrap();
            for id in released {
                // a full release also names the root entry
                if id == StreamId::CONNECTION {
                    continue;
                }
                granted_total += flow.reserve(&tree, id, 10_000);
            }
        }

        assert_eq!(
            granted_total,
            DEFAULT_WINDOW_SIZE + update_total - flow.send_window()
        );
    }

    #[test]
    fn tiny_pool_still_makes_progress() {
        // shares round down to zero but the forced minimum of one byte
        // keeps the loop finite
        let tree = FixtureTree {
            nodes: vec![(1, 0, 255), (3, 0, 1)],
        };
        let mut flow = FlowControl::default();

        assert_eq!(flow.reserve(&tree, StreamId(1), 65_535), 65_535);
        assert_eq!(flow.reserve(&tree, StreamId(1), 100), 0);
        assert_eq!(flow.reserve(&tree, StreamId(3), 100), 0);

        let released = flow.increment_connection_window(&tree, 4).unwrap();
        assert!(!released.is_empty());
    }

    #[test]
    fn window_overflow_is_an_error() {
        let tree = FixtureTree::flat(&[1]);
        let mut flow = FlowControl::default();
        assert!(flow
            .increment_connection_window(&tree, MAX_WINDOW_SIZE)
            .is_err());
    }

    #[test]
    fn forget_clears_reservation() {
        let tree = FixtureTree::flat(&[1]);
        let mut flow = FlowControl::default();

        assert_eq!(flow.reserve(&tree, StreamId(1), 65_535), 65_535);
        assert_eq!(flow.reserve(&tree, StreamId(1), 500), 0);
        assert_eq!(flow.backlog_size(), 500);

        flow.forget(StreamId(1));
        assert_eq!(flow.backlog_size(), 0);
    }
}
