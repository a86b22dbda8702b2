//! Instance scheduler: reorders the wait queue in place before each step's
//! batch formation consumes it from the front.

use serde::{Deserialize, Serialize};

use crate::clock::Tick;
use crate::request::Request;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SchedulerKind {
    Fcfs,
    PriorityFcfs,
    Sjf,
    ReversePriority,
}

pub trait InstanceScheduler {
    /// Stable sort in place. `clock` is accepted for symmetry with the
    /// interface contract even where a given implementation ignores it.
    fn order_queue(&self, queue: &mut Vec<Request>, clock: Tick);
}

/// Identity: no reorder.
pub struct Fcfs;

impl InstanceScheduler for Fcfs {
    fn order_queue(&self, _queue: &mut Vec<Request>, _clock: Tick) {}
}

/// Descending by `priority`, ties by arrival time ascending then ID.
pub struct PriorityFcfs;

impl InstanceScheduler for PriorityFcfs {
    fn order_queue(&self, queue: &mut Vec<Request>, _clock: Tick) {
        queue.sort_by(|a, b| {
            b.priority
                .partial_cmp(&a.priority)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.arrival_time.cmp(&b.arrival_time))
                .then(a.id.cmp(&b.id))
        });
    }
}

/// Ascending by prompt length, ties by arrival then ID.
pub struct Sjf;

impl InstanceScheduler for Sjf {
    fn order_queue(&self, queue: &mut Vec<Request>, _clock: Tick) {
        queue.sort_by(|a, b| {
            a.input_tokens
                .len()
                .cmp(&b.input_tokens.len())
                .then(a.arrival_time.cmp(&b.arrival_time))
                .then(a.id.cmp(&b.id))
        });
    }
}

/// Ascending by `priority` — pathological, inverts `PriorityFcfs`'s intent.
pub struct ReversePriority;

impl InstanceScheduler for ReversePriority {
    fn order_queue(&self, queue: &mut Vec<Request>, _clock: Tick) {
        queue.sort_by(|a, b| {
            a.priority
                .partial_cmp(&b.priority)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.arrival_time.cmp(&b.arrival_time))
                .then(a.id.cmp(&b.id))
        });
    }
}

pub fn build(kind: SchedulerKind) -> Box<dyn InstanceScheduler + Send + Sync> {
    match kind {
        SchedulerKind::Fcfs => Box::new(Fcfs),
        SchedulerKind::PriorityFcfs => Box::new(PriorityFcfs),
        SchedulerKind::Sjf => Box::new(Sjf),
        SchedulerKind::ReversePriority => Box::new(ReversePriority),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::SloClass;

    fn req(id: u64, arrival: u64, input_len: usize, priority: f64) -> Request {
        let mut r = Request::new(id, Tick(arrival), vec![0; input_len], vec![0; 1], SloClass::Standard, 0, 0);
        r.priority = priority;
        r
    }

    #[test]
    fn fcfs_preserves_order() {
        let mut q = vec![req(2, 5, 1, 0.0), req(1, 1, 1, 0.0)];
        Fcfs.order_queue(&mut q, Tick(0));
        assert_eq!(q[0].id, 2);
        assert_eq!(q[1].id, 1);
    }

    #[test]
    fn priority_fcfs_sorts_descending_with_tiebreak() {
        let mut q = vec![req(1, 10, 1, 1.0), req(2, 5, 1, 2.0), req(3, 1, 1, 2.0)];
        PriorityFcfs.order_queue(&mut q, Tick(0));
        assert_eq!(q.iter().map(|r| r.id).collect::<Vec<_>>(), vec![3, 2, 1]);
    }

    #[test]
    fn sjf_sorts_ascending_by_prompt_length() {
        let mut q = vec![req(1, 0, 100, 0.0), req(2, 0, 10, 0.0), req(3, 0, 50, 0.0)];
        Sjf.order_queue(&mut q, Tick(0));
        assert_eq!(q.iter().map(|r| r.id).collect::<Vec<_>>(), vec![2, 3, 1]);
    }

    #[test]
    fn reverse_priority_sorts_ascending() {
        let mut q = vec![req(1, 0, 1, 3.0), req(2, 0, 1, 1.0)];
        ReversePriority.order_queue(&mut q, Tick(0));
        assert_eq!(q.iter().map(|r| r.id).collect::<Vec<_>>(), vec![2, 1]);
    }
}
