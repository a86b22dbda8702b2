//! The event queue: a min-heap keyed by `(time, type_priority, sequence)`
//! that gives the event loop its strict, deterministic pop order.
//!
//! Grounded on the same priority-queue-over-`BinaryHeap` shape the teacher
//! crate uses for its transfer scheduler (`TransferOp` ordered by priority),
//! generalized here to a three-way tuple key and inverted into a min-heap via
//! `Reverse`.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::clock::Tick;
use crate::request::{InstanceId, RequestId};

/// The kind of event and its instance-routing info. The heap's ordering key
/// only cares about [`EventKind::type_priority`]: cluster-level events all
/// get priority `0` (strictly before any instance event at the same tick),
/// instance-level events get `1 + instance_id` so that lower instance
/// indices pop first; distinct event kinds for the same instance at the
/// same tick are left to the insertion-sequence tie-break, matching the
/// causal order they were scheduled in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    ClusterArrival,
    Admission,
    Routing,
    Dispatch,
    Arrival(InstanceId),
    Queued(InstanceId),
    Scheduled(InstanceId),
    Step(InstanceId),
    Preemption(InstanceId),
}

impl EventKind {
    fn type_priority(&self) -> u64 {
        match self {
            EventKind::ClusterArrival
            | EventKind::Admission
            | EventKind::Routing
            | EventKind::Dispatch => 0,
            EventKind::Arrival(i)
            | EventKind::Queued(i)
            | EventKind::Scheduled(i)
            | EventKind::Step(i)
            | EventKind::Preemption(i) => 1 + *i as u64,
        }
    }
}

/// Optional payload carried alongside an event's subject request.
#[derive(Debug, Clone, Default)]
pub struct EventPayload {
    pub target_instance: Option<InstanceId>,
    pub reason: Option<String>,
}

/// A single scheduled event.
#[derive(Debug, Clone)]
pub struct Event {
    pub time: Tick,
    pub kind: EventKind,
    /// `None` for step events, which have no single subject request.
    pub request_id: Option<RequestId>,
    pub payload: EventPayload,
    seq: u64,
}

/// The ordering key used by the heap: smallest tuple pops first.
#[derive(PartialEq, Eq, PartialOrd, Ord)]
struct OrderKey {
    time: Tick,
    type_priority: u64,
    seq: u64,
}

impl Event {
    fn order_key(&self) -> OrderKey {
        OrderKey {
            time: self.time,
            type_priority: self.kind.type_priority(),
            seq: self.seq,
        }
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.order_key() == other.order_key()
    }
}
impl Eq for Event {}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.order_key().cmp(&other.order_key())
    }
}

/// Min-heap of events, ordered `(time, type_priority, instance index,
/// sequence)` ascending. `Schedule`/`Pop` are both `O(log n)`.
#[derive(Debug, Default)]
pub struct EventQueue {
    heap: BinaryHeap<Reverse<Event>>,
    next_seq: u64,
    clock: Tick,
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 0,
            clock: Tick::ZERO,
        }
    }

    /// Current simulation clock — read-only from handlers, advanced only by
    /// [`EventQueue::pop`].
    pub fn now(&self) -> Tick {
        self.clock
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn schedule(
        &mut self,
        time: Tick,
        kind: EventKind,
        request_id: Option<RequestId>,
        payload: EventPayload,
    ) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Reverse(Event {
            time,
            kind,
            request_id,
            payload,
            seq,
        }));
    }

    /// Pop the lowest-ordered event, advancing the clock to its time.
    /// Monotonicity: `clock_after >= clock_before` always holds because the
    /// heap never holds an event with `time < clock`.
    pub fn pop(&mut self) -> Option<Event> {
        let ev = self.heap.pop().map(|Reverse(e)| e)?;
        debug_assert!(ev.time >= self.clock, "event queue popped out of order");
        self.clock = ev.time;
        Some(ev)
    }

    pub fn peek(&self) -> Option<&Event> {
        self.heap.peek().map(|Reverse(e)| e)
    }
}
