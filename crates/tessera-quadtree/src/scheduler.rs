//! Asynchronous block loading with a worker pool, a byte budget and retry
//! backoff.
//!
//! The owning thread queues load requests, issues them to worker threads as
//! budget and concurrency allow, and drains completions once per frame.
//! Workers only read and decode bytes; every node and store mutation happens
//! on the owning thread. Each request carries the node's generational id and
//! a fresh epoch so results for destroyed or re-requested nodes are dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::{Receiver, Sender, unbounded};
use rustc_hash::{FxHashMap, FxHashSet};
use tessera_config::StreamingConfig;
use tracing::{debug, error, warn};

use crate::error::{StreamingFailure, TerrainError};
use crate::hierarchy::NodeHierarchy;
use crate::load_queue::LoadQueue;
use crate::node::{NodeId, NodeKey, NodeState};
use crate::patch::{PatchData, PatchStore};
use crate::source::{BlockRequest, PatchSource};

/// A load handed to a worker thread.
struct LoadJob {
    node: NodeId,
    epoch: u64,
    request: BlockRequest,
    cancelled: Arc<AtomicBool>,
}

/// Result of a worker's attempt at a job.
#[derive(Debug)]
pub enum LoadOutcome {
    Loaded(PatchData),
    Failed(StreamingFailure),
    /// The job was cancelled before the read started; the source was not
    /// called.
    Cancelled,
}

/// A finished job, delivered back to the owning thread.
#[derive(Debug)]
pub struct LoadCompletion {
    pub node: NodeId,
    pub epoch: u64,
    pub outcome: LoadOutcome,
}

/// Outcome of [`StreamScheduler::request_load`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestStatus {
    /// The node moved to `Streaming` and joined the queue.
    Queued,
    /// A load is already pending or in flight; only its priority changed.
    AlreadyStreaming,
    /// The node already holds data.
    AlreadyResident,
    /// Retries are exhausted for this node.
    Degraded,
    /// A retry is scheduled for a later tick.
    BackingOff,
    /// The node no longer exists.
    Unknown,
}

struct InFlight {
    node: NodeId,
    reserved: usize,
    cancelled: Arc<AtomicBool>,
}

/// Counters for one issue or drain step.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamingReport {
    pub issued: usize,
    pub completed: usize,
    pub failed: usize,
    pub degraded: usize,
    pub stale: usize,
    pub evicted: usize,
    pub deferred: usize,
}

impl StreamingReport {
    fn absorb(&mut self, other: StreamingReport) {
        self.issued += other.issued;
        self.completed += other.completed;
        self.failed += other.failed;
        self.degraded += other.degraded;
        self.stale += other.stale;
        self.evicted += other.evicted;
        self.deferred += other.deferred;
    }
}

/// Issues block loads and reconciles their results into the hierarchy.
pub struct StreamScheduler {
    job_sender: Sender<LoadJob>,
    completion_receiver: Receiver<LoadCompletion>,
    worker_count: usize,
    pending: LoadQueue,
    in_flight: FxHashMap<u64, InFlight>,
    reserved_bytes: usize,
    next_epoch: u64,
    degraded: FxHashSet<NodeKey>,
    resolution: u32,
    config: StreamingConfig,
    report: StreamingReport,
}

impl StreamScheduler {
    /// Spawn the loader pool.
    ///
    /// `resolution` is the patch resolution every block is decoded with.
    pub fn new(
        config: &StreamingConfig,
        resolution: u32,
        source: Arc<dyn PatchSource>,
    ) -> Result<Self, TerrainError> {
        let worker_count = config.resolved_worker_threads(num_cpus::get());
        let (job_sender, job_receiver) = unbounded::<LoadJob>();
        let (completion_sender, completion_receiver) = unbounded::<LoadCompletion>();

        for i in 0..worker_count {
            let receiver = job_receiver.clone();
            let sender = completion_sender.clone();
            let source = Arc::clone(&source);

            std::thread::Builder::new()
                .name(format!("patch-loader-{i}"))
                .spawn(move || {
                    while let Ok(job) = receiver.recv() {
                        let outcome = run_job(source.as_ref(), &job);
                        if sender
                            .send(LoadCompletion {
                                node: job.node,
                                epoch: job.epoch,
                                outcome,
                            })
                            .is_err()
                        {
                            break;
                        }
                    }
                })
                .map_err(TerrainError::Spawn)?;
        }

        debug!(workers = worker_count, "patch loader pool started");

        Ok(Self {
            job_sender,
            completion_receiver,
            worker_count,
            pending: LoadQueue::new(),
            in_flight: FxHashMap::default(),
            reserved_bytes: 0,
            next_epoch: 1,
            degraded: FxHashSet::default(),
            resolution,
            config: config.clone(),
            report: StreamingReport::default(),
        })
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Jobs handed to workers whose results have not been drained.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Requests waiting for a load slot.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Bytes reserved for in-flight loads.
    pub fn reserved_bytes(&self) -> usize {
        self.reserved_bytes
    }

    /// True when nothing is queued or in flight.
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_empty()
    }

    /// Whether a node key has exhausted its retries.
    pub fn is_degraded(&self, key: NodeKey) -> bool {
        self.degraded.contains(&key)
    }

    /// Counters accumulated since the last call.
    pub fn take_report(&mut self) -> StreamingReport {
        std::mem::take(&mut self.report)
    }

    /// Ask for a node's block. `Empty` nodes become `Streaming` and are
    /// queued; repeated requests only refresh the queue priority.
    pub fn request_load(
        &mut self,
        hierarchy: &mut NodeHierarchy,
        id: NodeId,
        tick: u64,
        priority: f64,
    ) -> RequestStatus {
        let epoch = self.next_epoch;
        let degraded_key = hierarchy
            .get(id)
            .is_some_and(|node| self.degraded.contains(&node.key()));
        let Some(node) = hierarchy.get_mut(id) else {
            return RequestStatus::Unknown;
        };

        match node.state {
            NodeState::Streaming => {
                if self.pending.contains(id) {
                    self.pending.push(id, priority);
                }
                return RequestStatus::AlreadyStreaming;
            }
            state if state.has_data() => return RequestStatus::AlreadyResident,
            _ => {}
        }
        if degraded_key {
            node.load.degraded = true;
        }
        if node.load.degraded {
            return RequestStatus::Degraded;
        }
        if node.load.retry_after > tick {
            return RequestStatus::BackingOff;
        }

        match hierarchy.mark_streaming(id, epoch) {
            Ok(()) => {
                self.next_epoch += 1;
                self.pending.push(id, priority);
                RequestStatus::Queued
            }
            Err(violation) => {
                error!(%violation, "load request rejected");
                RequestStatus::Unknown
            }
        }
    }

    /// Synchronously drop a resident leaf's block (`Resident` → `Empty`).
    /// Returns the bytes freed.
    pub fn request_unload(
        &mut self,
        hierarchy: &mut NodeHierarchy,
        store: &mut PatchStore,
        id: NodeId,
    ) -> usize {
        match hierarchy.release_patch(id) {
            Ok(handle) => store.release(handle),
            Err(violation) => {
                debug_assert!(false, "unload rejected: {violation}");
                error!(%violation, "unload rejected");
                0
            }
        }
    }

    /// Withdraw a `Streaming` node's load. A queued request is dropped; an
    /// in-flight job is flagged so its result is discarded on arrival.
    /// The node returns to `Empty`.
    pub fn cancel(&mut self, hierarchy: &mut NodeHierarchy, id: NodeId) -> bool {
        if hierarchy.get(id).map(|node| node.state) != Some(NodeState::Streaming) {
            return false;
        }
        self.pending.remove(id);
        for job in self.in_flight.values().filter(|job| job.node == id) {
            job.cancelled.store(true, Ordering::Relaxed);
        }
        hierarchy.mark_empty(id).is_ok()
    }

    /// Apply every completion that has arrived since the last drain.
    pub fn drain_completions(
        &mut self,
        hierarchy: &mut NodeHierarchy,
        store: &mut PatchStore,
        tick: u64,
    ) -> StreamingReport {
        let mut report = StreamingReport::default();

        while let Ok(completion) = self.completion_receiver.try_recv() {
            let Some(job) = self.in_flight.remove(&completion.epoch) else {
                report.stale += 1;
                continue;
            };
            self.reserved_bytes -= job.reserved;

            let current = hierarchy.get(completion.node).is_some_and(|node| {
                node.state == NodeState::Streaming && node.load.epoch == completion.epoch
            }) && !job.cancelled.load(Ordering::Relaxed);

            // Cancelled jobs, destroyed nodes and superseded epochs.
            let result = match completion.outcome {
                LoadOutcome::Loaded(data) if current => Ok(data),
                LoadOutcome::Failed(failure) if current => Err(failure),
                _ => {
                    debug!(
                        node = ?completion.node,
                        epoch = completion.epoch,
                        "discarding stale load result"
                    );
                    report.stale += 1;
                    continue;
                }
            };

            match result {
                Ok(data) => {
                    let (lo, hi) = (data.min_height(), data.max_height());
                    let handle = store.insert(data);
                    if let Err(violation) = hierarchy.mark_resident(completion.node, handle, lo, hi)
                    {
                        store.release(handle);
                        error!(%violation, "could not attach loaded block");
                        continue;
                    }
                    if let Some(node) = hierarchy.get_mut(completion.node) {
                        node.load.failed_attempts = 0;
                    }
                    report.completed += 1;
                }
                Err(failure) => {
                    report.failed += 1;
                    if self.record_failure(hierarchy, completion.node, tick, &failure) {
                        report.degraded += 1;
                    }
                }
            }
        }

        self.report.absorb(report);
        report
    }

    /// Revert a failed node to `Empty` and schedule its retry, or degrade it
    /// permanently once retries run out. Returns true when degraded.
    fn record_failure(
        &mut self,
        hierarchy: &mut NodeHierarchy,
        id: NodeId,
        tick: u64,
        failure: &StreamingFailure,
    ) -> bool {
        if hierarchy.mark_empty(id).is_err() {
            return false;
        }
        let Some(node) = hierarchy.get_mut(id) else {
            return false;
        };
        node.load.failed_attempts += 1;
        let attempts = node.load.failed_attempts;

        if attempts > self.config.max_load_retries {
            node.load.degraded = true;
            self.degraded.insert(node.key);
            warn!(
                key = %node.key,
                attempts,
                %failure,
                "load retries exhausted; node permanently degraded"
            );
            true
        } else {
            let backoff = self.config.backoff_for_attempt(attempts);
            node.load.retry_after = tick + backoff;
            debug!(key = %node.key, attempts, backoff, %failure, "load failed; retry scheduled");
            false
        }
    }

    /// Evict least-recently-touched leaves until resident bytes fit the
    /// budget. Nodes touched at or after `protected_tick` are kept.
    pub fn enforce_budget(
        &mut self,
        hierarchy: &mut NodeHierarchy,
        store: &mut PatchStore,
        protected_tick: u64,
    ) -> usize {
        if !store.is_over_budget() {
            return 0;
        }
        let mut evicted = 0;
        for id in hierarchy.eviction_candidates(protected_tick) {
            if !store.is_over_budget() {
                break;
            }
            self.request_unload(hierarchy, store, id);
            evicted += 1;
        }
        if store.is_over_budget() {
            debug!(
                resident = store.resident_bytes(),
                budget = store.budget(),
                "no evictable nodes left; store remains over budget"
            );
        }
        self.report.evicted += evicted;
        evicted
    }

    /// Hand queued requests to workers while concurrency and budget allow.
    ///
    /// Before each job the store must hold resident + reserved + the new
    /// block under the budget; leaves untouched since `tick` are evicted
    /// oldest first to make room. When nothing is left to evict the request
    /// stays queued for the next frame.
    pub fn issue(
        &mut self,
        hierarchy: &mut NodeHierarchy,
        store: &mut PatchStore,
        tick: u64,
    ) -> StreamingReport {
        let mut report = StreamingReport::default();
        let estimate = PatchData::estimated_bytes(self.resolution);
        let mut candidates: Option<std::vec::IntoIter<NodeId>> = None;

        while self.in_flight.len() < self.config.max_concurrent_loads {
            let Some((id, priority)) = self.pending.pop() else {
                break;
            };
            let Some(node) = hierarchy.get(id) else {
                continue;
            };
            if node.state != NodeState::Streaming {
                continue;
            }
            let request = BlockRequest {
                key: node.key,
                bounds: node.bounds,
                resolution: self.resolution,
            };
            let epoch = node.load.epoch;

            let mut fits = store.fits(self.reserved_bytes + estimate);
            while !fits {
                let next = candidates
                    .get_or_insert_with(|| hierarchy.eviction_candidates(tick).into_iter())
                    .next();
                let Some(victim) = next else {
                    break;
                };
                self.request_unload(hierarchy, store, victim);
                report.evicted += 1;
                fits = store.fits(self.reserved_bytes + estimate);
            }
            if !fits {
                debug!(key = %request.key, "budget exhausted; load deferred");
                self.pending.push(id, priority);
                report.deferred += 1;
                break;
            }

            let cancelled = Arc::new(AtomicBool::new(false));
            let job = LoadJob {
                node: id,
                epoch,
                request,
                cancelled: Arc::clone(&cancelled),
            };
            if self.job_sender.send(job).is_err() {
                error!("patch loader pool has shut down");
                let _ = hierarchy.mark_empty(id);
                break;
            }
            self.reserved_bytes += estimate;
            self.in_flight.insert(
                epoch,
                InFlight {
                    node: id,
                    reserved: estimate,
                    cancelled,
                },
            );
            report.issued += 1;
        }

        self.report.absorb(report);
        report
    }
}

/// Read and decode one block on a worker thread.
fn run_job(source: &dyn PatchSource, job: &LoadJob) -> LoadOutcome {
    if job.cancelled.load(Ordering::Relaxed) {
        return LoadOutcome::Cancelled;
    }
    let key = job.request.key;
    let bytes = match source.read_block(&job.request) {
        Ok(bytes) => bytes,
        Err(source) => return LoadOutcome::Failed(StreamingFailure::Source { key, source }),
    };
    match PatchData::decode(job.request.resolution, &bytes) {
        Ok(data) => LoadOutcome::Loaded(data),
        Err(source) => LoadOutcome::Failed(StreamingFailure::Decode { key, source }),
    }
}

#[cfg(test)]
#[path = "scheduler_tests.rs"]
mod tests;
