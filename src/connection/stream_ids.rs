// Stream-id allocation
//
// Every in-flight request on a connection owns a protocol stream id. Ids
// live in groups of 128, pre-populated in descending order so popping hands
// out the lowest id first. Groups are created lazily up to the protocol
// maximum and trailing fully-free groups are released again after a
// debounce interval, so a burst of traffic does not pin memory forever.
//
// Invariant at every observation point:
//   in_use + sum(group.len) == group_count * 128

use tokio::time::{Duration, Instant};

use crate::frame::ProtocolVersion;

/// Ids per group; group index of an id is `id >> GROUP_SHIFT`.
pub const GROUP_SIZE: usize = 128;
const GROUP_SHIFT: usize = 7;

/// Groups kept alive even when idle.
const MIN_GROUPS: usize = 4;

/// Delay between noticing an oversized stack and releasing tail groups.
pub const SHRINK_DELAY: Duration = Duration::from_secs(5);

/// Bounded LIFO allocator for protocol stream ids.
pub struct StreamIdStack {
    /// Free ids, grouped; `groups[g]` holds ids in `[g*128, g*128+127]`.
    groups: Vec<Vec<i16>>,
    /// Index of the group pops are currently served from.
    active: usize,
    in_use: usize,
    max_groups: usize,
    shrink_at: Option<Instant>,
}

impl StreamIdStack {
    pub fn new(version: ProtocolVersion) -> Self {
        Self::with_max_stream_id(version.max_stream_id())
    }

    pub fn with_max_stream_id(max_stream_id: i16) -> Self {
        let max_groups = (max_stream_id as usize + 1) / GROUP_SIZE;
        let mut stack = StreamIdStack {
            groups: Vec::with_capacity(MIN_GROUPS.min(max_groups)),
            active: 0,
            in_use: 0,
            max_groups,
            shrink_at: None,
        };
        stack.groups.push(new_group(0));
        stack
    }

    /// Pop the next free id, or `None` when the connection is saturated:
    /// every id up to the protocol maximum is in flight.
    pub fn pop(&mut self) -> Option<i16> {
        loop {
            if let Some(id) = self.groups[self.active].pop() {
                self.in_use += 1;
                return Some(id);
            }
            if self.active + 1 < self.groups.len() {
                self.active += 1;
            } else if self.groups.len() < self.max_groups {
                self.groups.push(new_group(self.groups.len()));
                self.active = self.groups.len() - 1;
            } else {
                return None;
            }
        }
    }

    /// Return an id to the stack. Pushing to a lower-indexed group makes
    /// that group active again so low ids stay preferred.
    pub fn push(&mut self, id: i16) {
        let group = (id as usize) >> GROUP_SHIFT;
        debug_assert!(group < self.groups.len(), "push of unallocated id {id}");
        self.groups[group].push(id);
        self.in_use -= 1;
        if group < self.active {
            self.active = group;
        }
        if self.groups.len() > MIN_GROUPS && self.shrink_at.is_none() {
            self.shrink_at = Some(Instant::now() + SHRINK_DELAY);
        }
    }

    /// When a shrink is pending and its debounce has elapsed, release
    /// trailing fully-free groups, keeping at least `MIN_GROUPS` and never
    /// passing the active pointer. Returns the number of groups released.
    pub fn maybe_shrink(&mut self) -> usize {
        match self.shrink_at {
            Some(at) if Instant::now() >= at => {}
            _ => return 0,
        }
        self.shrink_at = None;

        let mut released = 0;
        while self.groups.len() > MIN_GROUPS
            && self.groups.len() - 1 > self.active
            && self.groups.last().map(Vec::len) == Some(GROUP_SIZE)
        {
            self.groups.pop();
            released += 1;
        }
        released
    }

    /// Deadline of the pending shrink, if one is scheduled.
    pub fn shrink_deadline(&self) -> Option<Instant> {
        self.shrink_at
    }

    pub fn in_use(&self) -> usize {
        self.in_use
    }

    pub fn free(&self) -> usize {
        self.groups.iter().map(Vec::len).sum()
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    #[cfg(test)]
    fn check_invariant(&self) {
        assert_eq!(
            self.in_use + self.free(),
            self.group_count() * GROUP_SIZE,
            "stream-id bookkeeping out of balance"
        );
    }
}

fn new_group(index: usize) -> Vec<i16> {
    let base = (index * GROUP_SIZE) as i16;
    (base..base + GROUP_SIZE as i16).rev().collect()
}
