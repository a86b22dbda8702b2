//! Single-instance engine scenarios exercised through the public API:
//! unservable drops, zero-output completion, and multi-request draining.

use blis::batch::VllmBatchFormation;
use blis::event::{EventKind, EventQueue};
use blis::instance::SingleInstanceEngine;
use blis::kv::SingleTierStore;
use blis::latency::BlackboxModel;
use blis::metrics::ClusterMetrics;
use blis::priority::Constant;
use blis::request::{Request, RequestId, SloClass};
use blis::scheduler::Fcfs;
use blis::Tick;

fn engine(capacity: usize, block_size: usize, max_running: usize) -> SingleInstanceEngine {
    SingleInstanceEngine::new(
        0,
        Box::new(SingleTierStore::new(capacity, block_size)),
        Box::new(BlackboxModel::new([10.0, 0.2, 0.05], [5.0, 0.01, 20.0])),
        Box::new(VllmBatchFormation),
        Box::new(Fcfs),
        Box::new(Constant),
        1000,
        max_running,
        0,
    )
}

fn req(id: RequestId, input: usize, output: usize) -> Request {
    Request::new(id, Tick(0), (0..input as u32).collect(), vec![0; output], SloClass::Standard, 0, 0)
}

fn drive_to_quiescence(e: &mut SingleInstanceEngine, q: &mut EventQueue, m: &mut ClusterMetrics) {
    let mut step_idx = 0u64;
    while let Some(ev) = q.pop() {
        match ev.kind {
            EventKind::Queued(_) => e.handle_queued(q, ev.time),
            EventKind::Step(_) => {
                step_idx += 1;
                e.handle_step(q, m, ev.time, step_idx);
            }
            _ => {}
        }
        if e.wait_queue_len() == 0 && e.running_batch_len() == 0 && q.is_empty() {
            break;
        }
    }
}

#[test]
fn oversized_request_is_dropped_and_conservation_still_holds() {
    let mut e = engine(1, 4, 4); // 4-token total capacity
    let mut q = EventQueue::new();
    let mut m = ClusterMetrics::new();

    m.register_request(1, Tick(0), SloClass::Standard);
    e.handle_arrival(req(1, 1000, 1), &mut q, &mut m, Tick(0));

    assert_eq!(e.wait_queue_len(), 0);
    assert!(m.conservation_ok(0, 0));
}

#[test]
fn three_requests_drain_and_all_complete() {
    let mut e = engine(64, 4, 8);
    let mut q = EventQueue::new();
    let mut m = ClusterMetrics::new();

    for id in 1..=3u64 {
        m.register_request(id, Tick(0), SloClass::Standard);
        e.handle_arrival(req(id, 16, 2), &mut q, &mut m, Tick(0));
    }
    drive_to_quiescence(&mut e, &mut q, &mut m);

    assert_eq!(m.completed_requests().count(), 3);
    for r in m.completed_requests() {
        assert!(r.ttft_us.is_some());
        assert!(r.e2e_us.is_some());
    }
}

#[test]
fn cache_hit_rate_reflects_prefix_reuse_across_requests() {
    let mut e = engine(64, 4, 8);
    let mut q = EventQueue::new();
    let mut m = ClusterMetrics::new();

    // two requests with an identical prompt prefix, submitted back to back.
    m.register_request(1, Tick(0), SloClass::Standard);
    e.handle_arrival(req(1, 16, 1), &mut q, &mut m, Tick(0));
    drive_to_quiescence(&mut e, &mut q, &mut m);

    m.register_request(2, Tick(0), SloClass::Standard);
    e.handle_arrival(req(2, 16, 1), &mut q, &mut m, Tick(0));
    drive_to_quiescence(&mut e, &mut q, &mut m);

    assert!(e.stats().cache_hit_rate > 0.0, "second request should reuse the first's cached blocks");
}
