use std::collections::{BTreeSet, HashMap, HashSet};

use loona_h2::StreamId;
use tracing::{debug, warn};

use super::{
    flow::{StreamTree, MAX_WINDOW_SIZE},
    types::{H2ConnectionError, H2StreamError, StreamOutgoing, StreamState},
};

pub(crate) const DEFAULT_WEIGHT: u32 = 16;

/// How many admissions go by between pruning passes.
const PRUNE_INTERVAL: u32 = 10;

pub(crate) struct Stream {
    pub(crate) state: StreamState,

    // priority tree node: parent is [StreamId::CONNECTION] for top-level
    // streams, weight is 1..=256
    pub(crate) parent: StreamId,
    pub(crate) children: HashSet<StreamId>,
    pub(crate) weight: u32,

    /// true while this stream counts against MAX_CONCURRENT_STREAMS
    counted_active: bool,
}

impl Stream {
    fn new(state: StreamState) -> Self {
        Self {
            state,
            parent: StreamId::CONNECTION,
            children: HashSet::new(),
            weight: DEFAULT_WEIGHT,
            counted_active: false,
        }
    }
}

/// The table of every stream this connection knows about, alive or
/// lingering in the priority tree, plus the id bookkeeping RFC 7540
/// section 5.1.1 requires.
pub(crate) struct StreamMap {
    entries: HashMap<StreamId, Stream>,

    /// children of the connection root
    root_children: HashSet<StreamId>,

    /// highest peer-initiated (odd) id ever accepted
    pub(crate) max_remote_stream_id: u32,

    /// highest odd id that ever started HEADERS processing; `None` until
    /// the first one, so the idle-closure sweep starts at id 1
    max_active_remote_stream_id: Option<u32>,

    /// highest id for which headers were fully processed, reported in
    /// GOAWAY frames
    pub(crate) max_processed_stream_id: u32,

    /// next id for a server-initiated (pushed) stream
    next_local_stream_id: u32,

    /// number of peer streams currently counting against
    /// MAX_CONCURRENT_STREAMS
    pub(crate) active_remote_streams: u32,

    new_streams_since_prune: u32,
}

impl Default for StreamMap {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            root_children: HashSet::new(),
            max_remote_stream_id: 0,
            max_active_remote_stream_id: None,
            max_processed_stream_id: 0,
            next_local_stream_id: 2,
            active_remote_streams: 0,
            new_streams_since_prune: 0,
        }
    }
}

impl StreamMap {
    pub(crate) fn get(&self, id: StreamId) -> Option<&Stream> {
        self.entries.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: StreamId) -> Option<&mut Stream> {
        self.entries.get_mut(&id)
    }

    pub(crate) fn contains(&self, id: StreamId) -> bool {
        self.entries.contains_key(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    fn insert(&mut self, id: StreamId, stream: Stream) {
        debug_assert_eq!(stream.parent, StreamId::CONNECTION);
        self.root_children.insert(id);
        self.entries.insert(id, stream);
    }

    /// Creates a peer-initiated stream in idle state, enforcing the id
    /// rules of RFC 7540 section 5.1.1 and occasionally pruning.
    pub(crate) fn create_remote_stream(
        &mut self,
        id: StreamId,
        max_concurrent_streams: u32,
    ) -> Result<(), H2ConnectionError> {
        if id.is_server_initiated() {
            return Err(H2ConnectionError::ClientSidShouldBeOdd);
        }

        if id.0 <= self.max_remote_stream_id {
            return Err(H2ConnectionError::ClientSidShouldBeNumericallyIncreasing {
                stream_id: id,
                max_remote_stream_id: self.max_remote_stream_id,
            });
        }

        self.prune_closed_streams(max_concurrent_streams);

        self.insert(id, Stream::new(StreamState::Idle));
        self.max_remote_stream_id = id.0;
        Ok(())
    }

    /// Installs the request that rode in on an HTTP/1.1 upgrade as
    /// stream 1: fully received, counted, already processed.
    pub(crate) fn seed_upgrade_stream(&mut self, outgoing: StreamOutgoing) {
        let id = StreamId(1);
        let mut stream = Stream::new(StreamState::HalfClosedRemote { outgoing });
        stream.counted_active = true;
        self.root_children.insert(id);
        self.entries.insert(id, stream);
        self.max_remote_stream_id = 1;
        self.max_active_remote_stream_id = Some(1);
        self.max_processed_stream_id = 1;
        self.active_remote_streams = 1;
    }

    /// Allocates the next server-initiated stream id and registers the
    /// promised stream.
    pub(crate) fn create_local_stream(&mut self, state: StreamState) -> StreamId {
        let id = StreamId(self.next_local_stream_id);
        self.next_local_stream_id += 2;
        self.insert(id, Stream::new(state));
        id
    }

    /// Runs the admission side of HEADERS processing for a remote stream
    /// that exists in the table: closes over-jumped idle ids, then checks
    /// the concurrency cap. The count may transiently overshoot the soft
    /// limit by one between the increment and the check.
    pub(crate) fn admit_remote_stream(
        &mut self,
        id: StreamId,
        max_concurrent_streams: u32,
    ) -> Result<(), H2StreamError> {
        self.close_idle_streams(id.0);

        self.active_remote_streams += 1;
        if self.active_remote_streams > max_concurrent_streams {
            self.active_remote_streams -= 1;
            return Err(H2StreamError::RefusedStream);
        }

        let stream = self
            .entries
            .get_mut(&id)
            .expect("admission runs on streams already in the table");
        stream.counted_active = true;
        Ok(())
    }

    /// Takes the stream out of the active count, exactly once.
    pub(crate) fn deactivate(&mut self, id: StreamId) {
        if let Some(stream) = self.entries.get_mut(&id) {
            if stream.counted_active {
                stream.counted_active = false;
                self.active_remote_streams -= 1;
            }
        }
    }

    /// RFC 7540 section 5.1.1: a HEADERS frame at id N implicitly closes
    /// every idle stream with a lower odd id the peer skipped over.
    fn close_idle_streams(&mut self, new_max_active: u32) {
        let start = match self.max_active_remote_stream_id {
            Some(max) => max + 2,
            None => 1,
        };
        let mut id = start;
        while id < new_max_active {
            if let Some(stream) = self.entries.get_mut(&StreamId(id)) {
                if matches!(stream.state, StreamState::Idle) {
                    debug!(stream_id = %id, "closing idle stream");
                    stream.state = StreamState::Closed { final_closed: true };
                }
            }
            id += 2;
        }
        self.max_active_remote_stream_id = Some(new_max_active);
    }

    pub(crate) fn note_processed(&mut self, id: StreamId) {
        if self.max_processed_stream_id < id.0 {
            self.max_processed_stream_id = id.0;
        }
    }

    /// Lazily reaps closed streams, every [PRUNE_INTERVAL]th new stream.
    ///
    /// RFC 7540 section 5.3.4: endpoints should maintain state for at
    /// least MAX_CONCURRENT_STREAMS streams; 10% on top of that is kept
    /// for closed streams still shaping the priority tree. Streams that
    /// went straight from idle to closed are the tree's skeleton, so they
    /// are only removed when nothing else gets us under the cap.
    fn prune_closed_streams(&mut self, max_concurrent_streams: u32) {
        if self.new_streams_since_prune < PRUNE_INTERVAL - 1 {
            self.new_streams_since_prune += 1;
            return;
        }
        self.new_streams_since_prune = 0;

        let max = max_concurrent_streams as u64;
        let max = (max + max / 10).min(i32::MAX as u64) as usize;

        let mut to_close = match self.entries.len().checked_sub(max) {
            None | Some(0) => return,
            Some(n) => n,
        };

        debug!(
            max_retained = %max,
            streams = %self.entries.len(),
            "pruning closed streams"
        );

        // Streams that might be load-bearing parts of the priority tree.
        // Only remove these if we absolutely have to.
        let mut additional_candidates = BTreeSet::new();

        let mut removable = Vec::new();
        for (id, stream) in &self.entries {
            if to_close == 0 {
                break;
            }
            // Never remove active streams or streams with children
            if stream.state.is_active() || !stream.children.is_empty() {
                continue;
            }
            match stream.state {
                StreamState::Closed { final_closed: true } => {
                    additional_candidates.insert(id.0);
                }
                _ => {
                    removable.push(*id);
                    to_close -= 1;
                }
            }
        }
        for id in removable {
            debug!(stream_id = %id, "pruned stream");
            self.remove(id);
        }

        while to_close > 0 {
            let Some(pruned) = additional_candidates.pop_last() else {
                break;
            };
            debug!(stream_id = %pruned, "pruned stream that may have been part of the priority tree");
            self.remove(StreamId(pruned));
            to_close -= 1;
        }

        if to_close > 0 {
            warn!(
                short_by = %to_close,
                "pruning could not get the stream count under the cap"
            );
        }
    }

    /// Removes a childless stream from the table and the tree.
    fn remove(&mut self, id: StreamId) {
        if let Some(stream) = self.entries.remove(&id) {
            debug_assert!(stream.children.is_empty());
            self.children_of_mut(stream.parent).remove(&id);
        }
    }

    fn children_of_mut(&mut self, id: StreamId) -> &mut HashSet<StreamId> {
        if id == StreamId::CONNECTION {
            &mut self.root_children
        } else {
            &mut self
                .entries
                .get_mut(&id)
                .expect("tree links only ever point at live entries")
                .children
        }
    }

    fn detach(&mut self, id: StreamId) {
        let parent = match self.entries.get(&id) {
            Some(stream) => stream.parent,
            None => return,
        };
        self.children_of_mut(parent).remove(&id);
    }

    fn attach(&mut self, id: StreamId, parent: StreamId) {
        self.children_of_mut(parent).insert(id);
        self.entries
            .get_mut(&id)
            .expect("attach operates on live entries")
            .parent = parent;
    }

    fn is_descendant(&self, ancestor: StreamId, id: StreamId) -> bool {
        let mut cursor = self.parent_of(id);
        while let Some(p) = cursor {
            if p == ancestor {
                return true;
            }
            cursor = self.parent_of(p);
        }
        false
    }

    /// Moves `id` under `parent` with the given weight, per RFC 7540
    /// section 5.3.3. An unknown parent means the connection root;
    /// `exclusive` makes `id` the sole child, adopting its siblings.
    pub(crate) fn reprioritise(
        &mut self,
        id: StreamId,
        parent: StreamId,
        exclusive: bool,
        weight: u32,
    ) {
        let parent = if parent != StreamId::CONNECTION && !self.entries.contains_key(&parent) {
            StreamId::CONNECTION
        } else {
            parent
        };

        // if the new parent currently hangs below us, hoist it to our
        // spot first so the tree stays acyclic
        if parent != StreamId::CONNECTION && self.is_descendant(id, parent) {
            let own_parent = self.entries[&id].parent;
            self.detach(parent);
            self.attach(parent, own_parent);
        }

        self.detach(id);

        if exclusive {
            let adopted: Vec<StreamId> = self.children_of_mut(parent).drain().collect();
            for child in &adopted {
                self.entries
                    .get_mut(child)
                    .expect("tree links only ever point at live entries")
                    .parent = id;
            }
            self.entries
                .get_mut(&id)
                .expect("reprioritise operates on live entries")
                .children
                .extend(adopted);
        }

        self.attach(id, parent);
        self.entries.get_mut(&id).unwrap().weight = weight;
    }

    /// Applies the signed INITIAL_WINDOW_SIZE delta to every stream that
    /// can still send. Returns the streams whose window would overflow;
    /// those get closed with a stream-level flow control error while the
    /// connection lives on.
    pub(crate) fn apply_initial_window_delta(&mut self, delta: i64) -> (Vec<StreamId>, bool) {
        let mut overflowed = Vec::new();
        let mut newly_positive = false;

        for (id, stream) in self.entries.iter_mut() {
            if let Some(outgoing) = stream.state.outgoing_mut() {
                let next_cap = outgoing.capacity + delta;
                if next_cap > MAX_WINDOW_SIZE {
                    overflowed.push(*id);
                    continue;
                }
                if next_cap > 0 && outgoing.capacity <= 0 {
                    newly_positive = true;
                }
                outgoing.capacity = next_cap;
            }
        }

        (overflowed, newly_positive)
    }

    fn parent_of(&self, id: StreamId) -> Option<StreamId> {
        if id == StreamId::CONNECTION {
            return None;
        }
        self.entries.get(&id).map(|s| s.parent)
    }
}

impl StreamTree for StreamMap {
    fn parent_of(&self, id: StreamId) -> Option<StreamId> {
        StreamMap::parent_of(self, id)
    }

    fn weight_of(&self, id: StreamId) -> u32 {
        self.entries
            .get(&id)
            .map(|s| s.weight)
            .unwrap_or(DEFAULT_WEIGHT)
    }

    fn children_of(&self, id: StreamId) -> Vec<StreamId> {
        if id == StreamId::CONNECTION {
            self.root_children.iter().copied().collect()
        } else {
            self.entries
                .get(&id)
                .map(|s| s.children.iter().copied().collect())
                .unwrap_or_default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map_with_remote_streams(ids: &[u32]) -> StreamMap {
        let mut map = StreamMap::default();
        for &id in ids {
            map.create_remote_stream(StreamId(id), u32::MAX).unwrap();
        }
        map
    }

    #[test]
    fn remote_ids_must_be_odd_and_increasing() {
        let mut map = StreamMap::default();

        assert!(matches!(
            map.create_remote_stream(StreamId(2), 100),
            Err(H2ConnectionError::ClientSidShouldBeOdd)
        ));

        map.create_remote_stream(StreamId(5), 100).unwrap();
        assert!(matches!(
            map.create_remote_stream(StreamId(3), 100),
            Err(H2ConnectionError::ClientSidShouldBeNumericallyIncreasing { .. })
        ));
        assert!(matches!(
            map.create_remote_stream(StreamId(5), 100),
            Err(H2ConnectionError::ClientSidShouldBeNumericallyIncreasing { .. })
        ));
        map.create_remote_stream(StreamId(7), 100).unwrap();
    }

    #[test]
    fn admission_cap_refuses_excess_streams() {
        let mut map = map_with_remote_streams(&[1, 3, 5]);

        map.admit_remote_stream(StreamId(1), 2).unwrap();
        map.admit_remote_stream(StreamId(3), 2).unwrap();
        assert!(matches!(
            map.admit_remote_stream(StreamId(5), 2),
            Err(H2StreamError::RefusedStream)
        ));
        assert_eq!(map.active_remote_streams, 2);

        map.deactivate(StreamId(1));
        map.deactivate(StreamId(1));
        assert_eq!(map.active_remote_streams, 1);
    }

    #[test]
    fn skipped_ids_close_as_final() {
        let mut map = StreamMap::default();

        // streams 1..9 exist only as priority-tree nodes
        for id in [1u32, 3, 5] {
            map.create_remote_stream(StreamId(id), 100).unwrap();
        }
        map.create_remote_stream(StreamId(9), 100).unwrap();
        map.admit_remote_stream(StreamId(9), 100).unwrap();

        for id in [1u32, 3, 5] {
            assert!(
                matches!(
                    map.get(StreamId(id)).unwrap().state,
                    StreamState::Closed { final_closed: true }
                ),
                "stream {id} should have closed as final"
            );
        }
        assert!(matches!(
            map.get(StreamId(9)).unwrap().state,
            StreamState::Idle
        ));
    }

    #[test]
    fn idle_closure_sweeps_resume_where_they_stopped() {
        let mut map = StreamMap::default();

        map.create_remote_stream(StreamId(1), 100).unwrap();
        map.admit_remote_stream(StreamId(1), 100).unwrap();
        map.create_remote_stream(StreamId(7), 100).unwrap();
        map.admit_remote_stream(StreamId(7), 100).unwrap();

        // ids 3 and 5 were never created at all; nothing to close, but
        // the sweep cursor has moved past them
        assert_eq!(map.max_active_remote_stream_id, Some(7));
        assert!(!map.contains(StreamId(3)));
    }

    #[test]
    fn pruning_keeps_active_and_parented_streams() {
        let mut map = StreamMap::default();

        // cap of 4 retains 4 streams; create enough closed streams to go
        // over, the tenth creation triggers the pruning pass
        let mut id = 1;
        for _ in 0..PRUNE_INTERVAL - 1 {
            map.create_remote_stream(StreamId(id), 4).unwrap();
            map.get_mut(StreamId(id)).unwrap().state = StreamState::Closed {
                final_closed: false,
            };
            id += 2;
        }

        map.create_remote_stream(StreamId(id), 4).unwrap();
        assert!(
            map.len() <= 5,
            "expected pruning to cut down to the cap, have {}",
            map.len()
        );
        assert!(map.contains(StreamId(id)));
    }

    #[test]
    fn pruning_prefers_non_final_streams() {
        let mut map = StreamMap::default();

        let mut id = 1;
        for i in 0..PRUNE_INTERVAL - 1 {
            map.create_remote_stream(StreamId(id), 2).unwrap();
            map.get_mut(StreamId(id)).unwrap().state = StreamState::Closed {
                final_closed: i % 2 == 0,
            };
            id += 2;
        }

        // the tenth creation prunes: plainly-closed streams go first,
        // final-closed ones only as far as needed
        map.create_remote_stream(StreamId(id), 2).unwrap();

        let survivors: Vec<u32> = (1..id)
            .step_by(2)
            .filter(|&i| map.contains(StreamId(i)))
            .collect();
        // all plainly-closed streams went first; any survivors from the
        // old batch are final-closed ones
        for survivor in survivors {
            assert!(matches!(
                map.get(StreamId(survivor)).unwrap().state,
                StreamState::Closed { final_closed: true }
            ));
        }
    }

    #[test]
    fn exclusive_reprioritise_adopts_siblings() {
        let mut map = map_with_remote_streams(&[1, 3, 5]);

        map.reprioritise(StreamId(5), StreamId::CONNECTION, true, 32);

        let five = map.get(StreamId(5)).unwrap();
        assert_eq!(five.parent, StreamId::CONNECTION);
        assert_eq!(five.weight, 32);
        assert_eq!(five.children.len(), 2);
        assert_eq!(map.get(StreamId(1)).unwrap().parent, StreamId(5));
        assert_eq!(map.get(StreamId(3)).unwrap().parent, StreamId(5));
    }

    #[test]
    fn reprioritise_under_own_descendant_hoists_it() {
        let mut map = map_with_remote_streams(&[1, 3]);
        map.reprioritise(StreamId(3), StreamId(1), false, 16);

        // 1 now wants to depend on its own child 3
        map.reprioritise(StreamId(1), StreamId(3), false, 8);

        assert_eq!(map.get(StreamId(3)).unwrap().parent, StreamId::CONNECTION);
        assert_eq!(map.get(StreamId(1)).unwrap().parent, StreamId(3));
        assert!(!map.is_descendant(StreamId(1), StreamId(1)));
    }

    #[test]
    fn window_delta_fanout_reports_overflow() {
        use crate::h2::types::{BodyOutgoing, HeadersOutgoing, StreamOutgoing};

        let mut map = map_with_remote_streams(&[1, 3]);
        for (id, capacity) in [(1u32, 65_535i64), (3, MAX_WINDOW_SIZE - 10)] {
            map.get_mut(StreamId(id)).unwrap().state = StreamState::HalfClosedRemote {
                outgoing: StreamOutgoing {
                    headers: HeadersOutgoing::WaitingForHeaders,
                    body: BodyOutgoing::StillReceiving(Default::default()),
                    capacity,
                    final_response: false,
                },
            };
        }

        let (overflowed, _) = map.apply_initial_window_delta(100);
        assert_eq!(overflowed, vec![StreamId(3)]);
        // the overflowing stream's window is left alone, the caller
        // closes it anyway
        let one = map.get_mut(StreamId(1)).unwrap();
        assert_eq!(one.state.outgoing_mut().unwrap().capacity, 65_635);
    }
}
