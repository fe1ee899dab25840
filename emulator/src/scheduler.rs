use std::collections::BinaryHeap;
use std::collections::HashMap;
use std::cmp::Ordering;

#[cfg(feature = "serde_support")]
use serde::{Deserialize, Serialize};

/// Token routed back to the device that scheduled the event.
pub type EventToken = u32;

/// Handle for a pending one-shot event. Stale handles are harmless; firing
/// or unscheduling consumes the underlying entry.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "serde_support", derive(Serialize, Deserialize))]
pub struct EventHandle(u64);

#[derive(PartialEq, Eq)]
struct Entry {
    time: u64,
    seq: u64,
    token: EventToken,
}

// BinaryHeap is a max-heap; invert so the earliest (time, seq) pops first.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .time
            .cmp(&self.time)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Single-threaded cycle scheduler: a 64-bit monotonic cycle counter plus a
/// priority queue of one-shot (time, token) events. All device "delays" in
/// the emulator are expressed as events against this queue.
pub struct Scheduler {
    now: u64,
    heap: BinaryHeap<Entry>,
    // seq -> scheduled time, removed on unschedule/fire (lazy heap deletion)
    live: HashMap<u64, u64>,
    next_seq: u64,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler {
            now: 0,
            heap: BinaryHeap::new(),
            live: HashMap::new(),
            next_seq: 1,
        }
    }

    pub fn now(&self) -> u64 {
        self.now
    }

    /// Schedule a one-shot event `delay` cycles from now.
    pub fn schedule(&mut self, delay: u64, token: EventToken) -> EventHandle {
        let seq = self.next_seq;
        self.next_seq += 1;
        let time = self.now + delay;
        self.heap.push(Entry { time, seq, token });
        self.live.insert(seq, time);
        EventHandle(seq)
    }

    /// Cancel a pending event. Cancelling an already-fired event is a no-op.
    pub fn unschedule(&mut self, handle: EventHandle) {
        self.live.remove(&handle.0);
    }

    /// Convenience for the `Option<EventHandle>` fields devices keep.
    pub fn unschedule_opt(&mut self, handle: &mut Option<EventHandle>) {
        if let Some(h) = handle.take() {
            self.unschedule(h);
        }
    }

    /// Cycles until the event fires, or `None` if it already fired or was
    /// cancelled.
    pub fn ticks_to_event(&self, handle: EventHandle) -> Option<u64> {
        self.live
            .get(&handle.0)
            .map(|&time| time.saturating_sub(self.now))
    }

    /// Time of the next pending event, if any.
    pub fn peek_next_time(&mut self) -> Option<u64> {
        self.skim_dead();
        self.heap.peek().map(|e| e.time)
    }

    /// Pop the next pending event at or before `until`, advancing `now` to
    /// its time. Returns `None` when nothing is due.
    pub fn pop_due(&mut self, until: u64) -> Option<(u64, EventToken)> {
        self.skim_dead();
        match self.heap.peek() {
            Some(e) if e.time <= until => {
                let e = self.heap.pop().unwrap();
                self.live.remove(&e.seq);
                if e.time > self.now {
                    self.now = e.time;
                }
                Some((e.time, e.token))
            }
            _ => None,
        }
    }

    /// Advance the clock with no event dispatch. The caller is responsible
    /// for draining due events first.
    pub fn advance(&mut self, cycles: u64) {
        self.now += cycles;
    }

    pub fn advance_to(&mut self, time: u64) {
        if time > self.now {
            self.now = time;
        }
    }

    fn skim_dead(&mut self) {
        while let Some(e) = self.heap.peek() {
            if self.live.contains_key(&e.seq) {
                break;
            }
            self.heap.pop();
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
