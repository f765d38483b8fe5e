//! The partitioned request queue (§4.5): one FIFO per `ModelFamily` so a
//! burst against one family can't starve another, a per-key concurrency
//! cap so one credential doesn't get hit with every in-flight request for
//! its family at once, and a background dispatch tick that pulls
//! requests out of their partition as capacity frees up.
//!
//! The per-key concurrency cap is an RAII guard released on `Drop`, the
//! same shape `wangyccn-AI-Relay-Technology`'s `forward::limits::LimitGuard`
//! uses for its per-session caps — acquiring a slot returns a guard, and
//! whether the in-flight request finishes normally, errors, or the
//! dispatcher task is cancelled, the slot is freed exactly once.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures_util::Stream;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{Notify, oneshot};

use crate::config::DequeueStrategy;
use crate::error::{ProxyError, ProxyResult};
use crate::key_pool::KeyPool;
use crate::model::ModelFamily;
use crate::pipeline::PreparedRequest;

#[cfg(test)]
#[path = "queue_tests.rs"]
mod tests;

pub const DISPATCH_TICK: Duration = Duration::from_millis(50);
pub const STREAM_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
pub const STALE_CLEANUP_INTERVAL: Duration = Duration::from_secs(20);
pub const QUEUE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const MAX_CONCURRENT_PER_KEY: u32 = 2;

struct QueuedRequest {
	prepared: PreparedRequest,
	enqueued_at: Instant,
	retry_count: u32,
	responder: oneshot::Sender<ProxyResult<Dispatched>>,
}

pub struct Dispatched {
	pub prepared: PreparedRequest,
	pub guard: KeySlotGuard,
}

struct Inner {
	partitions: HashMap<ModelFamily, VecDeque<QueuedRequest>>,
	concurrent_by_key: HashMap<String, u32>,
	concurrent_by_identifier: HashMap<String, u32>,
	/// Exponential moving average of time-in-partition, used by
	/// `estimated_wait` — a cheap estimator, not a precise one.
	avg_dispatch_ms: HashMap<ModelFamily, f64>,
	/// Timestamps of requests admitted in the trailing 60s, used by
	/// `check_model_rate_limit` (§6 `MODEL_RATE_LIMIT`).
	rate_limit_window: HashMap<ModelFamily, VecDeque<Instant>>,
}

const MODEL_RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);

pub struct PartitionedQueue {
	inner: Mutex<Inner>,
	notify: Notify,
	key_pool: Arc<KeyPool>,
	dequeue_strategy: DequeueStrategy,
}

/// Held by the in-flight request; dropping it (however that happens)
/// frees the per-key concurrency slot it claimed.
pub struct KeySlotGuard {
	queue: Arc<PartitionedQueue>,
	key_hash: String,
}

impl Drop for KeySlotGuard {
	fn drop(&mut self) {
		let mut inner = self.queue.inner.lock();
		if let Some(count) = inner.concurrent_by_key.get_mut(&self.key_hash) {
			*count = count.saturating_sub(1);
		}
		drop(inner);
		self.queue.notify.notify_one();
	}
}

/// Held for the full lifetime of one caller's request (enqueue through
/// final response), not just its time waiting in a partition — §4.5's
/// per-identifier cap counts a request as occupying its slot the whole
/// time it's outstanding, the same way `KeySlotGuard` tracks a key's slot
/// across the whole in-flight call rather than just the queue wait.
pub struct IdentifierGuard {
	queue: Arc<PartitionedQueue>,
	identifier: String,
}

impl Drop for IdentifierGuard {
	fn drop(&mut self) {
		let mut inner = self.queue.inner.lock();
		if let Some(count) = inner.concurrent_by_identifier.get_mut(&self.identifier) {
			*count = count.saturating_sub(1);
			if *count == 0 {
				inner.concurrent_by_identifier.remove(&self.identifier);
			}
		}
	}
}

impl PartitionedQueue {
	/// `key_pool` is the same pool instance the pipeline validated against
	/// (§4.3/§4.5 are two views onto one shared credential registry): the
	/// queue only admits a request to dispatch once the pool actually has
	/// a usable key for its partition, and claims that key at the moment
	/// of dispatch rather than at enqueue time.
	pub fn new(key_pool: Arc<KeyPool>, dequeue_strategy: DequeueStrategy) -> Self {
		PartitionedQueue {
			inner: Mutex::new(Inner {
				partitions: HashMap::new(),
				concurrent_by_key: HashMap::new(),
				concurrent_by_identifier: HashMap::new(),
				avg_dispatch_ms: HashMap::new(),
				rate_limit_window: HashMap::new(),
			}),
			notify: Notify::new(),
			key_pool,
			dequeue_strategy,
		}
	}

	/// §4.5: claims one of `identifier`'s concurrency slots, or rejects
	/// with `TooManyQueued` if it's already at `limit`. Callers should hold
	/// the returned guard for the entire request lifecycle and call this
	/// before `enqueue`.
	pub fn admit(self: &Arc<Self>, identifier: &str, limit: u32) -> ProxyResult<IdentifierGuard> {
		let mut inner = self.inner.lock();
		let count = inner.concurrent_by_identifier.entry(identifier.to_string()).or_insert(0);
		if *count >= limit {
			return Err(ProxyError::TooManyQueued { identifier: relay_core::strng::new(identifier) });
		}
		*count += 1;
		Ok(IdentifierGuard { queue: Arc::clone(self), identifier: identifier.to_string() })
	}

	/// §6 `MODEL_RATE_LIMIT`: rejects if `family` has already admitted
	/// `limit` requests within the trailing 60s sliding window. Call before
	/// `enqueue`, once the request's family is known.
	pub fn check_model_rate_limit(&self, family: ModelFamily, limit: u32) -> ProxyResult<()> {
		let mut inner = self.inner.lock();
		let now = Instant::now();
		let window = inner.rate_limit_window.entry(family).or_default();
		while matches!(window.front(), Some(t) if now.duration_since(*t) > MODEL_RATE_LIMIT_WINDOW) {
			window.pop_front();
		}
		if window.len() as u32 >= limit {
			return Err(ProxyError::ModelRateLimited { family: relay_core::strng::new(family.as_str()) });
		}
		window.push_back(now);
		Ok(())
	}

	/// Enqueues a prepared request and returns a future that resolves once
	/// the dispatcher has claimed a concurrency slot for it (or it's been
	/// sitting long enough to time out).
	pub fn enqueue(
		self: &Arc<Self>,
		prepared: PreparedRequest,
	) -> oneshot::Receiver<ProxyResult<Dispatched>> {
		let (tx, rx) = oneshot::channel();
		let family = prepared.context.family;
		let mut inner = self.inner.lock();
		inner.partitions.entry(family).or_default().push_back(QueuedRequest {
			prepared,
			enqueued_at: Instant::now(),
			retry_count: 0,
			responder: tx,
		});
		drop(inner);
		self.notify.notify_one();
		rx
	}

	/// Re-enqueues a request that failed with a retryable upstream error,
	/// at the front of its partition so retries don't lose their place
	/// behind requests that arrived after the original attempt.
	pub fn requeue(self: &Arc<Self>, mut prepared: PreparedRequest, retry_count: u32) -> oneshot::Receiver<ProxyResult<Dispatched>> {
		prepared.context.retry_count = retry_count;
		let (tx, rx) = oneshot::channel();
		let family = prepared.context.family;
		let mut inner = self.inner.lock();
		inner.partitions.entry(family).or_default().push_front(QueuedRequest {
			prepared,
			enqueued_at: Instant::now(),
			retry_count,
			responder: tx,
		});
		drop(inner);
		self.notify.notify_one();
		rx
	}

	/// A rough wait-time estimate for a new request joining `family`'s
	/// partition right now: queue depth times the partition's recent
	/// average dispatch latency.
	pub fn estimated_wait(&self, family: ModelFamily) -> Duration {
		let inner = self.inner.lock();
		let depth = inner.partitions.get(&family).map(VecDeque::len).unwrap_or(0);
		let avg = inner.avg_dispatch_ms.get(&family).copied().unwrap_or(200.0);
		Duration::from_millis((depth as f64 * avg) as u64)
	}

	/// Runs forever, driving the dispatch tick / stale cleanup / fairness
	/// loop described in §4.5. Intended to be spawned once at startup.
	pub async fn run(self: Arc<Self>) {
		let mut last_cleanup = Instant::now();
		loop {
			tokio::time::sleep(DISPATCH_TICK).await;
			self.dispatch_once();
			if last_cleanup.elapsed() >= STALE_CLEANUP_INTERVAL {
				self.cleanup_stale();
				last_cleanup = Instant::now();
			}
		}
	}

	/// One dispatch pass: for every partition with a waiting request, ask
	/// the key pool for a key usable right now (late-bound, per §9 Design
	/// Notes — selection happens at dequeue, independent of enqueue
	/// order), then claim a per-key concurrency slot for it. Partitions
	/// themselves are visited in an unspecified (HashMap) order each tick;
	/// which request comes out of a given partition is governed by
	/// `dequeue_strategy` (§4.5): `Fair` takes the smallest `startTime`
	/// (the front of the FIFO), `Random` takes any waiting request with
	/// equal probability.
	fn dispatch_once(self: &Arc<Self>) {
		let mut inner = self.inner.lock();
		let families: Vec<ModelFamily> = inner.partitions.keys().copied().collect();
		for family in families {
			let Some(queue) = inner.partitions.get_mut(&family) else { continue };
			if queue.front().is_none() {
				continue;
			}
			// `lockout_period` is `None` when no key for this family is
			// configured at all; the pipeline already rejects that case
			// up front, so a request only reaches here if one of its
			// partition's keys is merely rate-limited right now.
			match self.key_pool.lockout_period(family) {
				Some(period) if period.is_zero() => {},
				_ => continue,
			}
			let Ok(handle) = self.key_pool.get(family) else { continue };
			let key_hash = handle.hash.clone();
			let in_flight = inner.concurrent_by_key.get(&key_hash).copied().unwrap_or(0);
			if in_flight >= MAX_CONCURRENT_PER_KEY {
				continue;
			}
			let Some(mut request) = (match self.dequeue_strategy {
				DequeueStrategy::Fair => inner.partitions.get_mut(&family).and_then(VecDeque::pop_front),
				DequeueStrategy::Random => inner.partitions.get_mut(&family).and_then(|queue| {
					if queue.is_empty() {
						None
					} else {
						let idx = rand::rng().random_range(0..queue.len());
						queue.remove(idx)
					}
				}),
			}) else {
				continue;
			};
			request.prepared.context.key = Some(handle);
			*inner.concurrent_by_key.entry(key_hash.clone()).or_insert(0) += 1;

			let wait_ms = request.enqueued_at.elapsed().as_millis() as f64;
			let avg = inner.avg_dispatch_ms.entry(family).or_insert(wait_ms);
			*avg = *avg * 0.8 + wait_ms * 0.2;

			let guard = KeySlotGuard { queue: Arc::clone(self), key_hash };
			let _ = request.responder.send(Ok(Dispatched { prepared: request.prepared, guard }));
		}
	}

	/// Requests that have been waiting longer than `QUEUE_TIMEOUT` are
	/// failed back to their caller rather than left to dispatch into a
	/// response nobody is still listening for.
	fn cleanup_stale(&self) {
		let mut inner = self.inner.lock();
		for queue in inner.partitions.values_mut() {
			let mut kept = VecDeque::with_capacity(queue.len());
			while let Some(request) = queue.pop_front() {
				if request.enqueued_at.elapsed() >= QUEUE_TIMEOUT {
					let _ = request.responder.send(Err(ProxyError::Retryable(
						"request timed out waiting in queue".to_string(),
					)));
				} else {
					kept.push_back(request);
				}
			}
			*queue = kept;
		}
	}

	pub fn depth(&self, family: ModelFamily) -> usize {
		self.inner.lock().partitions.get(&family).map(VecDeque::len).unwrap_or(0)
	}

	/// Waits on `rx`, yielding an SSE keep-alive comment line every
	/// `STREAM_KEEPALIVE_INTERVAL` while the request is still sitting in its
	/// partition (§4.5: "starts a 10s heartbeat if `isStreaming`"). Only
	/// meant for streaming requests — non-streaming callers just `.await`
	/// the receiver directly, since there's no open connection to keep
	/// alive until a response exists to write to it.
	pub fn wait_for_dispatch(
		self: &Arc<Self>,
		rx: oneshot::Receiver<ProxyResult<Dispatched>>,
		family: ModelFamily,
	) -> impl Stream<Item = ProxyResult<DispatchWait>> + use<> {
		let queue = Arc::clone(self);
		async_stream::stream! {
			tokio::pin!(rx);
			loop {
				tokio::select! {
					biased;
					result = &mut rx => {
						yield match result {
							Ok(Ok(dispatched)) => Ok(DispatchWait::Dispatched(Box::new(dispatched))),
							Ok(Err(err)) => Err(err),
							Err(_) => Err(ProxyError::Internal("queue dropped response channel".to_string())),
						};
						return;
					}
					_ = tokio::time::sleep(STREAM_KEEPALIVE_INTERVAL) => {
						let depth = queue.depth(family);
						let wait = queue.estimated_wait(family);
						yield Ok(DispatchWait::Heartbeat(heartbeat_event(depth, wait)));
					}
				}
			}
		}
	}
}

/// One step of waiting for a queued streaming request to dispatch: either a
/// keep-alive comment to forward to the client immediately, or the terminal
/// dispatch result.
pub enum DispatchWait {
	Heartbeat(Bytes),
	Dispatched(Box<Dispatched>),
}

/// §4.5: "optionally a synthetic data event containing queue length and
/// average wait" — emitted as an SSE comment line (ignored by any parser
/// reading `data:` fields, visible to anything inspecting the raw stream)
/// rather than a `data:` event, since it isn't part of the completion the
/// client is assembling.
fn heartbeat_event(queue_length: usize, avg_wait: Duration) -> Bytes {
	Bytes::from(std::format!(": queue_length={queue_length} avg_wait_ms={}\n\n", avg_wait.as_millis()))
}
