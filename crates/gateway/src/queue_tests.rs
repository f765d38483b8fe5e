use secrecy::SecretString;

use super::*;
use crate::key::{Credential, Key};
use crate::model::APIFormat;
use crate::request_context::RequestContext;

fn prepared_for(family: ModelFamily) -> PreparedRequest {
	let mut context = RequestContext::new(
		relay_core::literal!("user"),
		relay_core::literal!("1.1.1.1"),
		APIFormat::OpenAIChat,
		relay_core::literal!("gpt-4"),
	);
	context.family = family;
	PreparedRequest { context, service: family.service(), upstream_body: serde_json::json!({}) }
}

fn pool_with_openai_key() -> Arc<KeyPool> {
	let pool = Arc::new(KeyPool::new());
	pool.add_key(Key::new(Credential::OpenAI { api_key: SecretString::from("sk-a".to_string()), organization_id: None, is_trial: false }));
	pool
}

#[tokio::test]
async fn dispatches_when_slot_is_free() {
	let pool = pool_with_openai_key();
	let queue = Arc::new(PartitionedQueue::new(pool, DequeueStrategy::Fair));
	let rx = queue.enqueue(prepared_for(ModelFamily::Gpt4));
	queue.dispatch_once();
	let dispatched = rx.await.unwrap().unwrap();
	assert_eq!(dispatched.prepared.context.family, ModelFamily::Gpt4);
	assert!(dispatched.prepared.context.key.is_some(), "dispatch must assign a key late");
}

#[tokio::test]
async fn does_not_dispatch_with_no_keys_configured() {
	let queue = Arc::new(PartitionedQueue::new(Arc::new(KeyPool::new()), DequeueStrategy::Fair));
	let rx = queue.enqueue(prepared_for(ModelFamily::Gpt4));
	queue.dispatch_once();
	assert_eq!(queue.depth(ModelFamily::Gpt4), 1, "request stays queued when no key exists yet");
	drop(rx);
}

#[tokio::test]
async fn respects_per_key_concurrency_cap() {
	// A single registered key caps how many requests in its family can
	// be in flight at once, regardless of queue depth.
	let pool = pool_with_openai_key();
	let queue = Arc::new(PartitionedQueue::new(pool, DequeueStrategy::Fair));
	let mut receivers = Vec::new();
	for _ in 0..(MAX_CONCURRENT_PER_KEY + 1) {
		receivers.push(queue.enqueue(prepared_for(ModelFamily::Gpt4)));
	}
	// Drain with repeated ticks; only MAX_CONCURRENT_PER_KEY should
	// dispatch before a slot frees up. Each selection also locks the
	// key out for KEY_REUSE_DELAY (§4.3 step 4), so successive ticks
	// need to wait that out to claim the key again.
	for i in 0..MAX_CONCURRENT_PER_KEY {
		if i > 0 {
			tokio::time::sleep(crate::key_pool::KEY_REUSE_DELAY + Duration::from_millis(50)).await;
		}
		queue.dispatch_once();
	}
	let mut dispatched = 0;
	let mut guards = Vec::new();
	for rx in &mut receivers {
		if let Ok(Ok(d)) = rx.try_recv() {
			dispatched += 1;
			guards.push(d.guard);
		}
	}
	assert_eq!(dispatched, MAX_CONCURRENT_PER_KEY as usize);

	drop(guards);
	tokio::time::sleep(crate::key_pool::KEY_REUSE_DELAY + Duration::from_millis(50)).await;
	queue.dispatch_once();
	let mut total = dispatched;
	for rx in &mut receivers {
		if let Ok(Ok(_)) = rx.try_recv() {
			total += 1;
		}
	}
	assert_eq!(total, (MAX_CONCURRENT_PER_KEY + 1) as usize);
}

#[test]
fn model_rate_limit_rejects_once_the_window_is_full() {
	let queue = Arc::new(PartitionedQueue::new(Arc::new(KeyPool::new()), DequeueStrategy::Fair));
	queue.check_model_rate_limit(ModelFamily::Gpt4, 2).unwrap();
	queue.check_model_rate_limit(ModelFamily::Gpt4, 2).unwrap();
	let err = queue.check_model_rate_limit(ModelFamily::Gpt4, 2).unwrap_err();
	assert!(matches!(err, ProxyError::ModelRateLimited { .. }));
}

#[test]
fn model_rate_limit_tracks_families_independently() {
	let queue = Arc::new(PartitionedQueue::new(Arc::new(KeyPool::new()), DequeueStrategy::Fair));
	queue.check_model_rate_limit(ModelFamily::Gpt4, 1).unwrap();
	assert!(queue.check_model_rate_limit(ModelFamily::Claude, 1).is_ok());
}

#[test]
fn admit_rejects_the_nth_plus_one_request_for_one_identifier() {
	let pool = Arc::new(KeyPool::new());
	let queue = Arc::new(PartitionedQueue::new(pool, DequeueStrategy::Fair));
	let _a = queue.admit("user-1", 2).unwrap();
	let _b = queue.admit("user-1", 2).unwrap();
	let err = queue.admit("user-1", 2).unwrap_err();
	assert!(matches!(err, ProxyError::TooManyQueued { .. }));
}

#[test]
fn admit_tracks_identifiers_independently() {
	let pool = Arc::new(KeyPool::new());
	let queue = Arc::new(PartitionedQueue::new(pool, DequeueStrategy::Fair));
	let _a = queue.admit("user-1", 1).unwrap();
	assert!(queue.admit("user-2", 1).is_ok());
}

#[test]
fn dropping_the_guard_frees_the_identifier_slot() {
	let pool = Arc::new(KeyPool::new());
	let queue = Arc::new(PartitionedQueue::new(pool, DequeueStrategy::Fair));
	let guard = queue.admit("user-1", 1).unwrap();
	assert!(queue.admit("user-1", 1).is_err());
	drop(guard);
	assert!(queue.admit("user-1", 1).is_ok());
}

#[tokio::test]
async fn separate_partitions_do_not_block_each_other() {
	let pool = Arc::new(KeyPool::new());
	pool.add_key(Key::new(Credential::OpenAI { api_key: SecretString::from("sk-a".to_string()), organization_id: None, is_trial: false }));
	pool.add_key(Key::new(Credential::Anthropic { api_key: SecretString::from("sk-ant".to_string()) }));
	let queue = Arc::new(PartitionedQueue::new(pool, DequeueStrategy::Fair));
	let rx_a = queue.enqueue(prepared_for(ModelFamily::Gpt4));
	let rx_b = queue.enqueue(prepared_for(ModelFamily::Claude));
	queue.dispatch_once();
	assert!(rx_a.await.unwrap().is_ok());
	assert!(rx_b.await.unwrap().is_ok());
}

#[tokio::test(start_paused = true)]
async fn wait_for_dispatch_emits_heartbeats_before_a_key_is_free() {
	use futures_util::StreamExt;

	let queue = Arc::new(PartitionedQueue::new(Arc::new(KeyPool::new()), DequeueStrategy::Fair));
	let rx = queue.enqueue(prepared_for(ModelFamily::Gpt4));
	let mut events = queue.wait_for_dispatch(rx, ModelFamily::Gpt4);

	// No key is configured at all, so the request sits in its partition
	// and the caller should see keep-alive comments at the configured
	// interval rather than the connection going idle.
	let first = events.next().await.unwrap().unwrap();
	assert!(matches!(first, DispatchWait::Heartbeat(_)));
	if let DispatchWait::Heartbeat(bytes) = first {
		let text = String::from_utf8(bytes.to_vec()).unwrap();
		assert!(text.starts_with(": queue_length="));
	}
	let second = events.next().await.unwrap().unwrap();
	assert!(matches!(second, DispatchWait::Heartbeat(_)));
}

#[tokio::test]
async fn wait_for_dispatch_resolves_once_a_key_becomes_available() {
	use futures_util::StreamExt;

	let pool = pool_with_openai_key();
	let queue = Arc::new(PartitionedQueue::new(pool, DequeueStrategy::Fair));
	let rx = queue.enqueue(prepared_for(ModelFamily::Gpt4));
	let mut events = queue.wait_for_dispatch(rx, ModelFamily::Gpt4);
	queue.dispatch_once();
	let event = events.next().await.unwrap().unwrap();
	assert!(matches!(event, DispatchWait::Dispatched(_)));
	assert!(events.next().await.is_none());
}

#[tokio::test]
async fn random_dequeue_strategy_eventually_drains_every_request() {
	let pool = Arc::new(KeyPool::new());
	for i in 0..4 {
		pool.add_key(Key::new(Credential::OpenAI {
			api_key: SecretString::from(format!("sk-{i}")),
			organization_id: None,
			is_trial: false,
		}));
	}
	let queue = Arc::new(PartitionedQueue::new(pool, DequeueStrategy::Random));
	let mut receivers = Vec::new();
	for _ in 0..8 {
		receivers.push(queue.enqueue(prepared_for(ModelFamily::Gpt4)));
	}
	for _ in 0..8 {
		queue.dispatch_once();
		tokio::time::sleep(crate::key_pool::KEY_REUSE_DELAY + Duration::from_millis(10)).await;
	}
	let mut dispatched = 0;
	for rx in &mut receivers {
		if let Ok(Ok(_)) = rx.try_recv() {
			dispatched += 1;
		}
	}
	assert_eq!(dispatched, 8, "every enqueued request is eventually dispatched under random dequeue");
}
