//! The key pool: one registry per `LLMService`, each holding every key
//! configured for that service and handing out the least-recently-used
//! available key for a requested `ModelFamily`.
//!
//! Selection is least-recently-used rather than random so usage spreads
//! evenly across a service's keys instead of hammering whichever key
//! happens to sort first; `last_used` is refreshed on every successful
//! selection.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use relay_core::Strng;

use crate::error::{ProxyError, ProxyResult};
use crate::key::{Key, Usage};
use crate::model::{LLMService, ModelFamily};

/// §4.3 step 4: every successful selection locks the key out for this long
/// before it can be re-selected, even though the upstream call it's about to
/// serve hasn't returned yet. Without it, two requests racing the dispatch
/// tick microseconds apart would both land on the same idle key before
/// either one's usage or rate-limit status is known.
pub const KEY_REUSE_DELAY: Duration = Duration::from_millis(500);

struct Entry {
	key: Key,
	last_used: Option<Instant>,
}

struct Registry {
	service: LLMService,
	entries: Vec<Entry>,
}

impl Registry {
	fn new(service: LLMService) -> Self {
		Registry { service, entries: Vec::new() }
	}

	fn select(&mut self, family: ModelFamily) -> Option<usize> {
		let now = Instant::now();
		let never = Instant::now() - Duration::from_secs(u64::MAX / 2);
		let available = self.entries.iter().enumerate().filter(|(_, e)| e.key.is_available_for(family, now));
		// §4.3 step 3: "for OpenAI only: among equals, prefer trial keys" —
		// trial keys draw from separate free quota, so the pool should
		// exhaust that before dipping into paid keys. Every other service
		// has no such distinction and `is_trial` is always false there, so
		// this reduces to plain LRU for them.
		if self.service == LLMService::OpenAI {
			let trial = available
				.clone()
				.filter(|(_, e)| e.key.is_trial())
				.min_by_key(|(_, e)| e.last_used.unwrap_or(never));
			if let Some((i, _)) = trial {
				return Some(i);
			}
		}
		available.min_by_key(|(_, e)| e.last_used.unwrap_or(never)).map(|(i, _)| i)
	}

	/// §4.3 `getLockoutPeriod`: zero if some key matching `family` is
	/// available right now, otherwise the soonest any matching (but
	/// currently locked-out) key frees up. Keys that don't serve `family`
	/// at all don't count either way — there's nothing the caller can do
	/// about those by waiting.
	fn lockout_period(&self, family: ModelFamily, now: Instant) -> Option<Duration> {
		let mut soonest: Option<Duration> = None;
		for entry in &self.entries {
			let key = &entry.key;
			if key.status == crate::key::KeyStatus::Disabled {
				continue;
			}
			if !key.model_families.is_empty() && !key.model_families.contains(&family) {
				continue;
			}
			if key.is_available_for(family, now) {
				return Some(Duration::ZERO);
			}
			if let Some(until) = key.rate_limited_until {
				let remaining = until.saturating_duration_since(now);
				soonest = Some(match soonest {
					Some(existing) if existing <= remaining => existing,
					_ => remaining,
				});
			}
		}
		soonest
	}
}

/// A handle to a selected key, identified by service + hash so callers
/// (the pipeline, the queue, the response handler) don't hold a borrow into
/// the pool across an await point.
#[derive(Debug, Clone)]
pub struct KeyHandle {
	pub service: LLMService,
	pub hash: String,
}

pub struct KeyPool {
	registries: RwLock<HashMap<LLMService, Registry>>,
}

impl Default for KeyPool {
	fn default() -> Self {
		Self::new()
	}
}

impl KeyPool {
	pub fn new() -> Self {
		let mut registries = HashMap::new();
		for service in [
			LLMService::OpenAI,
			LLMService::Anthropic,
			LLMService::AwsBedrock,
			LLMService::AzureOpenAI,
			LLMService::GoogleAI,
			LLMService::Mistral,
		] {
			registries.insert(service, Registry::new(service));
		}
		KeyPool { registries: RwLock::new(registries) }
	}

	pub fn add_key(&self, key: Key) {
		let mut registries = self.registries.write();
		let registry = registries.entry(key.service()).or_insert_with(|| Registry::new(key.service()));
		registry.entries.push(Entry { key, last_used: None });
	}

	/// Selects the least-recently-used available key for `family`, marks it
	/// used now, and returns a handle to it.
	pub fn get(&self, family: ModelFamily) -> ProxyResult<KeyHandle> {
		let service = family.service();
		let mut registries = self.registries.write();
		let registry = registries
			.get_mut(&service)
			.ok_or_else(|| ProxyError::NoKeysAvailable { family: family_label(family) })?;
		let idx = registry
			.select(family)
			.ok_or_else(|| ProxyError::NoKeysAvailable { family: family_label(family) })?;
		let entry = &mut registry.entries[idx];
		let now = Instant::now();
		entry.last_used = Some(now);
		entry.key.mark_rate_limited(KEY_REUSE_DELAY, None, now);
		Ok(KeyHandle { service, hash: entry.key.hash.clone() })
	}

	/// Per §4.3: `None` (no matching keys at all, or the service was never
	/// configured) vs `Some(Duration::ZERO)` (a key is usable right now)
	/// vs `Some(remaining)` (every matching key is locked out, soonest one
	/// frees up in `remaining`). The queue's dispatch tick uses this to
	/// decide whether a partition is worth trying to drain this pass.
	pub fn lockout_period(&self, family: ModelFamily) -> Option<Duration> {
		let registries = self.registries.read();
		registries.get(&family.service())?.lockout_period(family, Instant::now())
	}

	pub fn with_key<R>(&self, handle: &KeyHandle, f: impl FnOnce(&Key) -> R) -> Option<R> {
		let registries = self.registries.read();
		let registry = registries.get(&handle.service)?;
		registry.entries.iter().find(|e| e.key.hash == handle.hash).map(|e| f(&e.key))
	}

	pub fn with_key_mut<R>(&self, handle: &KeyHandle, f: impl FnOnce(&mut Key) -> R) -> Option<R> {
		let mut registries = self.registries.write();
		let registry = registries.get_mut(&handle.service)?;
		registry.entries.iter_mut().find(|e| e.key.hash == handle.hash).map(|e| f(&mut e.key))
	}

	pub fn disable(&self, handle: &KeyHandle, reason: impl Into<String>) {
		let reason = reason.into();
		self.with_key_mut(handle, move |key| key.disable(reason));
	}

	pub fn mark_rate_limited(&self, handle: &KeyHandle, retry_after: Duration, family: Option<ModelFamily>) {
		let now = Instant::now();
		self.with_key_mut(handle, move |key| key.mark_rate_limited(retry_after, family, now));
	}

	pub fn record_usage(&self, handle: &KeyHandle, usage: Usage) {
		self.with_key_mut(handle, move |key| key.record_usage(usage));
	}

	/// Every key across every registry, for the checker's probe loop.
	pub fn all_handles(&self) -> Vec<KeyHandle> {
		let registries = self.registries.read();
		registries
			.values()
			.flat_map(|r| r.entries.iter().map(|e| KeyHandle { service: r.service, hash: e.key.hash.clone() }))
			.collect()
	}

	pub fn set_model_families(&self, handle: &KeyHandle, families: Vec<ModelFamily>) {
		self.with_key_mut(handle, move |key| key.model_families = families);
	}

	/// Count of active, non-rate-limited keys for a service, for metrics.
	pub fn available_count(&self, service: LLMService) -> usize {
		let now = Instant::now();
		let registries = self.registries.read();
		registries
			.get(&service)
			.map(|r| r.entries.iter().filter(|e| e.key.status != crate::key::KeyStatus::Disabled && e.key.rate_limited_until.map(|u| now >= u).unwrap_or(true)).count())
			.unwrap_or(0)
	}

	pub fn total_count(&self, service: LLMService) -> usize {
		let registries = self.registries.read();
		registries.get(&service).map(|r| r.entries.len()).unwrap_or(0)
	}
}

fn family_label(family: ModelFamily) -> Strng {
	relay_core::literal!(family.as_str())
}

#[cfg(test)]
mod tests {
	use super::*;
	use secrecy::SecretString;

	fn openai_key(key: &str) -> Key {
		Key::new(crate::key::Credential::OpenAI { api_key: SecretString::from(key.to_string()), organization_id: None, is_trial: false })
	}

	fn trial_openai_key(key: &str) -> Key {
		Key::new(crate::key::Credential::OpenAI { api_key: SecretString::from(key.to_string()), organization_id: None, is_trial: true })
	}

	#[test]
	fn no_keys_available_errors() {
		let pool = KeyPool::new();
		let err = pool.get(ModelFamily::Gpt4).unwrap_err();
		assert!(matches!(err, ProxyError::NoKeysAvailable { .. }));
	}

	#[test]
	fn round_robins_least_recently_used() {
		let pool = KeyPool::new();
		pool.add_key(openai_key("sk-a"));
		pool.add_key(openai_key("sk-b"));
		let first = pool.get(ModelFamily::Gpt4).unwrap();
		let second = pool.get(ModelFamily::Gpt4).unwrap();
		assert_ne!(first.hash, second.hash);
	}

	#[test]
	fn rate_limited_key_is_skipped() {
		let pool = KeyPool::new();
		pool.add_key(openai_key("sk-a"));
		pool.add_key(openai_key("sk-b"));
		let first = pool.get(ModelFamily::Gpt4).unwrap();
		pool.mark_rate_limited(&first, Duration::from_secs(60), Some(ModelFamily::Gpt4));
		let second = pool.get(ModelFamily::Gpt4).unwrap();
		assert_ne!(first.hash, second.hash);
		// `second`'s own KEY_REUSE_DELAY lockout needs to expire before it's
		// selectable again; `first` is still well within its 60s rate limit.
		std::thread::sleep(KEY_REUSE_DELAY + Duration::from_millis(50));
		let third = pool.get(ModelFamily::Gpt4).unwrap();
		assert_eq!(second.hash, third.hash, "only one key left available");
	}

	#[test]
	fn disabled_key_removed_from_rotation_permanently() {
		let pool = KeyPool::new();
		pool.add_key(openai_key("sk-a"));
		let handle = pool.get(ModelFamily::Gpt4).unwrap();
		pool.disable(&handle, "revoked");
		let err = pool.get(ModelFamily::Gpt4).unwrap_err();
		assert!(matches!(err, ProxyError::NoKeysAvailable { .. }));
	}

	#[test]
	fn trial_openai_keys_are_preferred_over_paid_keys_among_equals() {
		let pool = KeyPool::new();
		pool.add_key(openai_key("sk-paid"));
		pool.add_key(trial_openai_key("sk-trial"));
		let selected = pool.get(ModelFamily::Gpt4).unwrap();
		assert_eq!(pool.with_key(&selected, |k| k.is_trial()), Some(true));
	}

	#[test]
	fn trial_preference_falls_back_to_paid_once_trial_keys_are_exhausted() {
		let pool = KeyPool::new();
		pool.add_key(openai_key("sk-paid"));
		pool.add_key(trial_openai_key("sk-trial"));
		let trial = pool.get(ModelFamily::Gpt4).unwrap();
		pool.disable(&trial, "quota exhausted");
		let selected = pool.get(ModelFamily::Gpt4).unwrap();
		assert_eq!(pool.with_key(&selected, |k| k.is_trial()), Some(false));
	}

	#[test]
	fn lockout_period_is_zero_when_a_key_is_free() {
		let pool = KeyPool::new();
		pool.add_key(openai_key("sk-a"));
		assert_eq!(pool.lockout_period(ModelFamily::Gpt4), Some(Duration::ZERO));
	}

	#[test]
	fn lockout_period_is_none_for_an_unconfigured_service() {
		let pool = KeyPool::new();
		assert_eq!(pool.lockout_period(ModelFamily::Gpt4), None);
	}

	#[test]
	fn lockout_period_reflects_remaining_rate_limit() {
		let pool = KeyPool::new();
		pool.add_key(openai_key("sk-a"));
		let handle = pool.get(ModelFamily::Gpt4).unwrap();
		pool.mark_rate_limited(&handle, Duration::from_secs(30), None);
		let remaining = pool.lockout_period(ModelFamily::Gpt4).expect("key exists but is locked out");
		assert!(remaining > Duration::ZERO && remaining <= Duration::from_secs(30));
	}
}
