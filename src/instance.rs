//! The single-instance engine: owns one instance's wait queue, running
//! batch, and KV store, and reacts to the instance-local events the shared
//! event queue delivers to it.
//!
//! Grounded on the teacher's `server::ConnectionActor` event-handler-per-
//! message shape, generalized from "one handler per wire message" to "one
//! handler per simulator event kind."

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::admission::AdmissionPolicy;
use crate::batch::{BatchContext, BatchFormation};
use crate::clock::Tick;
use crate::event::{Event, EventKind, EventPayload, EventQueue};
use crate::kv::KvStore;
use crate::latency::LatencyModel;
use crate::metrics::ClusterMetrics;
use crate::priority::PriorityPolicy;
use crate::request::{InstanceId, Request, RequestId, RequestState};
use crate::scheduler::InstanceScheduler;

/// Read-only view an instance hands to the cluster's snapshot provider.
#[derive(Debug, Clone, Copy)]
pub struct InstanceStats {
    pub queue_depth: usize,
    pub batch_size: usize,
    pub kv_utilization: f64,
    pub free_kv_blocks: usize,
    pub cache_hit_rate: f64,
}

pub struct SingleInstanceEngine {
    pub id: InstanceId,
    wait_queue: Vec<Request>,
    running_batch: Vec<Request>,
    kv: Box<dyn KvStore + Send + Sync>,
    latency_model: Box<dyn LatencyModel + Send + Sync>,
    batch_formation: Box<dyn BatchFormation + Send + Sync>,
    scheduler: Box<dyn InstanceScheduler + Send + Sync>,
    priority_policy: Box<dyn PriorityPolicy + Send + Sync>,
    computed_tokens: BTreeMap<RequestId, usize>,
    max_scheduled_tokens: u64,
    max_running_reqs: usize,
    long_prefill_token_threshold: usize,
    step_scheduled: bool,
    cache_hits_observed: u64,
    cache_lookups_observed: u64,
}

impl SingleInstanceEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: InstanceId,
        kv: Box<dyn KvStore + Send + Sync>,
        latency_model: Box<dyn LatencyModel + Send + Sync>,
        batch_formation: Box<dyn BatchFormation + Send + Sync>,
        scheduler: Box<dyn InstanceScheduler + Send + Sync>,
        priority_policy: Box<dyn PriorityPolicy + Send + Sync>,
        max_scheduled_tokens: u64,
        max_running_reqs: usize,
        long_prefill_token_threshold: usize,
    ) -> Self {
        Self {
            id,
            wait_queue: Vec::new(),
            running_batch: Vec::new(),
            kv,
            latency_model,
            batch_formation,
            scheduler,
            priority_policy,
            computed_tokens: BTreeMap::new(),
            max_scheduled_tokens,
            max_running_reqs,
            long_prefill_token_threshold,
            step_scheduled: false,
            cache_hits_observed: 0,
            cache_lookups_observed: 0,
        }
    }

    pub fn stats(&self) -> InstanceStats {
        let cache_hit_rate = if self.cache_lookups_observed > 0 {
            self.cache_hits_observed as f64 / self.cache_lookups_observed as f64
        } else {
            0.0
        };
        InstanceStats {
            queue_depth: self.wait_queue.len(),
            batch_size: self.running_batch.len(),
            kv_utilization: self.kv.used_blocks() as f64 / self.kv.total_capacity().max(1) as f64,
            free_kv_blocks: self.kv.total_capacity() - self.kv.used_blocks(),
            cache_hit_rate,
        }
    }

    fn minimum_servable(&self, req: &Request) -> bool {
        req.blocks_needed(self.kv.block_size()) <= self.kv.total_capacity()
    }

    /// Arrival event: the request enters this instance's pipeline.
    pub fn handle_arrival(&mut self, mut req: Request, queue: &mut EventQueue, metrics: &mut ClusterMetrics, now: Tick) {
        req.state = RequestState::Queued;
        req.assigned_instance = Some(self.id);

        if !self.minimum_servable(&req) {
            warn!(instance_id = self.id, request_id = req.id, "request unservable, dropping");
            metrics.record_dropped_unservable(req.id);
            return;
        }

        let req_id = req.id;
        let delay = self.latency_model.queueing_time(&req);
        self.wait_queue.push(req);

        queue.schedule(now.saturating_add(delay), EventKind::Queued(self.id), Some(req_id), EventPayload::default());
    }

    /// QueuedEvent: work-conserving — kick off a step if none is pending.
    pub fn handle_queued(&mut self, queue: &mut EventQueue, now: Tick) {
        if !self.step_scheduled {
            queue.schedule(now, EventKind::Step(self.id), None, EventPayload::default());
            self.step_scheduled = true;
        }
    }

    /// Step event: order the queue, form a batch, execute it, detect
    /// completions, schedule the next step if there's still work.
    pub fn handle_step(&mut self, queue: &mut EventQueue, metrics: &mut ClusterMetrics, now: Tick, step_idx: u64) {
        self.step_scheduled = false;

        for req in &mut self.wait_queue {
            req.priority = self.priority_policy.compute(req, now);
        }
        self.scheduler.order_queue(&mut self.wait_queue, now);

        let mut ctx = BatchContext {
            kv: &mut *self.kv,
            wait_queue: std::mem::take(&mut self.wait_queue),
            computed_tokens: std::mem::take(&mut self.computed_tokens),
            max_scheduled_tokens: self.max_scheduled_tokens,
            max_running_reqs: self.max_running_reqs,
            long_prefill_token_threshold: self.long_prefill_token_threshold,
            now,
            step_idx,
            scheduling_processing_time: self.latency_model.scheduling_processing_time(),
            preemption_processing_time: self.latency_model.preemption_processing_time(),
        };
        let result = self.batch_formation.form_batch(std::mem::take(&mut self.running_batch), &mut ctx);

        if result.blocks_requested > 0 {
            self.cache_hits_observed += result.cache_hits as u64;
            self.cache_lookups_observed += result.blocks_requested as u64;
            metrics.record_cache_lookup(result.cache_hits, result.blocks_requested);
        }

        if result.newly_scheduled.is_empty() && !ctx.wait_queue.is_empty() && result.remaining_budget > 0 {
            metrics.record_hol_blocking();
        }
        for scheduled in &result.newly_scheduled {
            if ctx
                .wait_queue
                .iter()
                .any(|waiting| waiting.priority > scheduled.request.priority)
            {
                metrics.record_priority_inversion();
            }
        }

        self.wait_queue = ctx.wait_queue;
        self.computed_tokens = ctx.computed_tokens;
        self.running_batch = result.running_batch;

        for scheduled in &result.newly_scheduled {
            metrics.record_scheduling_delay(scheduled.request.id, scheduled.delay);
            queue.schedule(
                now.saturating_add(scheduled.delay),
                EventKind::Scheduled(self.id),
                Some(scheduled.request.id),
                EventPayload::default(),
            );
        }
        for preempted in &result.preempted {
            metrics.record_preemption();
            queue.schedule(
                now.saturating_add(preempted.delay),
                EventKind::Preemption(self.id),
                Some(preempted.request.id),
                EventPayload::default(),
            );
        }

        let step_duration = self.latency_model.step_time(&self.running_batch) + self.kv.consume_pending_transfer_latency();

        // Execution pass: advance progress and record TTFT/ITL.
        for req in &mut self.running_batch {
            let was_in_prefill = req.progress_index < req.input_tokens.len();
            req.progress_index += req.num_new_tokens;
            let prefill_just_completed = was_in_prefill && req.progress_index >= req.input_tokens.len();

            if prefill_just_completed {
                let ttft = now.saturating_add(step_duration + self.latency_model.output_token_processing_time()).saturating_sub(req.arrival_time);
                metrics.record_ttft(req.id, ttft);
            } else if !was_in_prefill {
                let itl = step_duration + self.latency_model.output_token_processing_time();
                metrics.record_itl(req.id, itl);
            }
        }

        // Completion pass: separate traversal so a zero-output request's
        // TTFT (recorded above) and E2E (recorded here) both land this step.
        let mut completed_ids = Vec::new();
        for req in &mut self.running_batch {
            if req.is_complete() {
                self.kv.release_kv_blocks(req.id);
                self.computed_tokens.remove(&req.id);
                let e2e = now.saturating_add(step_duration).saturating_sub(req.arrival_time);
                metrics.record_e2e(req.id, e2e);
                req.state = RequestState::Completed;
                completed_ids.push(req.id);
            }
        }
        self.running_batch.retain(|r| !completed_ids.contains(&r.id));

        debug!(
            instance_id = self.id,
            tick = now.as_micros(),
            queue_depth = self.wait_queue.len(),
            batch_size = self.running_batch.len(),
            "step complete"
        );

        if !self.wait_queue.is_empty() || !self.running_batch.is_empty() {
            queue.schedule(now.saturating_add(step_duration), EventKind::Step(self.id), None, EventPayload::default());
            self.step_scheduled = true;
        }
    }

    /// Accounting hook; preemption itself already happened inside batch
    /// formation, this is purely a trace point.
    pub fn handle_preemption(&self, request_id: Option<RequestId>, now: Tick) {
        debug!(instance_id = self.id, request_id = ?request_id, tick = now.as_micros(), "preemption trace");
    }

    pub fn handle_scheduled(&self, request_id: Option<RequestId>, now: Tick) {
        debug!(instance_id = self.id, request_id = ?request_id, tick = now.as_micros(), "scheduled trace");
    }

    pub fn handle_event(&mut self, event: &Event, queue: &mut EventQueue, metrics: &mut ClusterMetrics, req: Option<Request>, step_idx: u64) {
        match event.kind {
            EventKind::Arrival(_) => {
                if let Some(req) = req {
                    self.handle_arrival(req, queue, metrics, event.time);
                }
            }
            EventKind::Queued(_) => self.handle_queued(queue, event.time),
            EventKind::Step(_) => self.handle_step(queue, metrics, event.time, step_idx),
            EventKind::Preemption(_) => self.handle_preemption(event.request_id, event.time),
            EventKind::Scheduled(_) => self.handle_scheduled(event.request_id, event.time),
            _ => {}
        }
    }

    pub fn wait_queue_len(&self) -> usize {
        self.wait_queue.len()
    }

    pub fn running_batch_len(&self) -> usize {
        self.running_batch.len()
    }
}

/// Admission result applied before a request is even handed to an instance
/// (used by the cluster coordinator, not the instance itself — kept here
/// since it shares the instance-facing `Request` type).
pub fn apply_admission(policy: &mut dyn AdmissionPolicy, req: &Request, clock: Tick) -> crate::admission::Decision {
    policy.decide(req, clock)
}
