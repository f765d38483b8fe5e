//! The `Key` data model: a single upstream credential plus the bookkeeping
//! the pool needs to rotate, rate-limit, and account usage against it.
//!
//! Each service has its own credential shape (a bearer token, an AWS
//! access/secret pair, an Azure resource/deployment/key triple, ...), so
//! `Key` is a tagged union over a per-service payload rather than one
//! struct with optional fields for every service. Behavior that's common
//! across services (lockout, usage accounting, disabling) lives on the
//! outer `Key`; behavior that differs per service is reached through
//! `Key::credential`'s match arms, giving each variant its own method table
//! without trait-object indirection.

use std::time::{Duration, Instant};

use secrecy::SecretString;
use sha2::{Digest, Sha256};

use crate::model::{LLMService, ModelFamily};

#[derive(Debug, Clone)]
pub enum Credential {
	/// `is_trial`: an OpenAI key without a payment method attached, drawing
	/// from separate free quota. §4.3 step 3 prefers these over paid keys
	/// when both are otherwise equally eligible, so free quota gets used up
	/// before paid usage is incurred.
	OpenAI { api_key: SecretString, organization_id: Option<String>, is_trial: bool },
	Anthropic { api_key: SecretString },
	AwsBedrock { access_key_id: String, secret_access_key: SecretString, region: String },
	AzureOpenAI { resource_name: String, deployment_id: String, api_key: SecretString },
	GoogleAI { api_key: SecretString },
	Mistral { api_key: SecretString },
}

impl Credential {
	pub fn service(&self) -> LLMService {
		match self {
			Credential::OpenAI { .. } => LLMService::OpenAI,
			Credential::Anthropic { .. } => LLMService::Anthropic,
			Credential::AwsBedrock { .. } => LLMService::AwsBedrock,
			Credential::AzureOpenAI { .. } => LLMService::AzureOpenAI,
			Credential::GoogleAI { .. } => LLMService::GoogleAI,
			Credential::Mistral { .. } => LLMService::Mistral,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStatus {
	Active,
	/// Rate-limited until the contained deadline; the pool skips the key
	/// for selection but the checker continues to probe it once it's past
	/// that deadline so it can be brought back without a manual recheck.
	RateLimited,
	/// Disabled by the checker or by usage accounting noticing the key is
	/// revoked/exhausted; only a manual recheck clears this.
	Disabled,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Usage {
	pub prompt_tokens: u64,
	pub completion_tokens: u64,
	/// USD-denominated cost for usage-metered families like DALL-E where
	/// token counts aren't the billing unit.
	pub cost_usd_micros: u64,
}

impl Usage {
	pub fn add(&mut self, other: Usage) {
		self.prompt_tokens += other.prompt_tokens;
		self.completion_tokens += other.completion_tokens;
		self.cost_usd_micros += other.cost_usd_micros;
	}
}

#[derive(Debug)]
pub struct Key {
	/// Stable identifier derived from a hash of the credential, used in
	/// logs and metrics so the literal secret never needs to appear there.
	pub hash: String,
	pub credential: Credential,
	pub status: KeyStatus,
	/// Families this key is usable for; empty means "probe determines it",
	/// populated once the checker confirms access (e.g. an org's key might
	/// not have `gpt-4` access).
	pub model_families: Vec<ModelFamily>,
	pub rate_limited_until: Option<Instant>,
	/// Per-family lockout: a 429 scoped to one family (common on OpenAI,
	/// where `gpt-4` and `gpt-3.5-turbo` have independent rate limit
	/// buckets) shouldn't take the whole key out of rotation for families
	/// it isn't rate-limited on.
	pub rate_limited_families: Vec<ModelFamily>,
	pub usage: Usage,
	pub soft_limit_usd_micros: Option<u64>,
	pub hard_limit_usd_micros: Option<u64>,
	pub last_checked: Option<Instant>,
	pub disabled_reason: Option<String>,
	/// Anthropic canary result (§4.3): whether the key's probe response
	/// contained the "please answer ethically" injection, a cheap signal
	/// some pool operators use to flag keys worth deprioritizing.
	pub is_pozzed: Option<bool>,
	/// AWS Bedrock canary result (§4.3): whether
	/// `bedrock:GetModelInvocationLoggingConfiguration` reports invocation
	/// logging enabled on the account this key belongs to.
	pub aws_logging_enabled: Option<bool>,
}

impl Key {
	pub fn new(credential: Credential) -> Self {
		let hash = hash_credential(&credential);
		Key {
			hash,
			credential,
			status: KeyStatus::Active,
			model_families: Vec::new(),
			rate_limited_until: None,
			rate_limited_families: Vec::new(),
			usage: Usage::default(),
			soft_limit_usd_micros: None,
			hard_limit_usd_micros: None,
			last_checked: None,
			disabled_reason: None,
			is_pozzed: None,
			aws_logging_enabled: None,
		}
	}

	pub fn service(&self) -> LLMService {
		self.credential.service()
	}

	/// §4.3 step 3: only OpenAI keys distinguish trial from paid.
	pub fn is_trial(&self) -> bool {
		matches!(self.credential, Credential::OpenAI { is_trial: true, .. })
	}

	/// A key is usable for `family` right now if it's active (or its
	/// rate-limit window has elapsed), supports the family, and isn't
	/// individually rate-limited on that family.
	pub fn is_available_for(&self, family: ModelFamily, now: Instant) -> bool {
		if self.status == KeyStatus::Disabled {
			return false;
		}
		if !self.model_families.is_empty() && !self.model_families.contains(&family) {
			return false;
		}
		if let Some(until) = self.rate_limited_until {
			if now < until {
				return false;
			}
		}
		if self.rate_limited_families.contains(&family) {
			if let Some(until) = self.rate_limited_until {
				if now < until {
					return false;
				}
			}
		}
		if let Some(hard) = self.hard_limit_usd_micros {
			if self.usage.cost_usd_micros >= hard {
				return false;
			}
		}
		true
	}

	pub fn mark_rate_limited(&mut self, retry_after: Duration, family: Option<ModelFamily>, now: Instant) {
		let until = now + retry_after;
		self.rate_limited_until = Some(match self.rate_limited_until {
			Some(existing) if existing > until => existing,
			_ => until,
		});
		if let Some(family) = family {
			if !self.rate_limited_families.contains(&family) {
				self.rate_limited_families.push(family);
			}
		}
	}

	pub fn clear_rate_limit(&mut self) {
		self.rate_limited_until = None;
		self.rate_limited_families.clear();
	}

	pub fn disable(&mut self, reason: impl Into<String>) {
		self.status = KeyStatus::Disabled;
		self.disabled_reason = Some(reason.into());
	}

	pub fn record_usage(&mut self, usage: Usage) {
		self.usage.add(usage);
		if let Some(soft) = self.soft_limit_usd_micros {
			if self.usage.cost_usd_micros >= soft && self.status == KeyStatus::Active {
				tracing::warn!(key = %self.hash, "key crossed soft usage limit");
			}
		}
	}
}

fn hash_credential(credential: &Credential) -> String {
	let mut hasher = Sha256::new();
	let discriminant = std::mem::discriminant(credential);
	hasher.update(format!("{discriminant:?}").as_bytes());
	let secret = match credential {
		Credential::OpenAI { api_key, .. } => secrecy::ExposeSecret::expose_secret(api_key).to_string(),
		Credential::Anthropic { api_key } => secrecy::ExposeSecret::expose_secret(api_key).to_string(),
		Credential::AwsBedrock { access_key_id, secret_access_key, .. } => {
			format!("{access_key_id}:{}", secrecy::ExposeSecret::expose_secret(secret_access_key))
		},
		Credential::AzureOpenAI { resource_name, deployment_id, api_key } => {
			format!("{resource_name}:{deployment_id}:{}", secrecy::ExposeSecret::expose_secret(api_key))
		},
		Credential::GoogleAI { api_key } => secrecy::ExposeSecret::expose_secret(api_key).to_string(),
		Credential::Mistral { api_key } => secrecy::ExposeSecret::expose_secret(api_key).to_string(),
	};
	hasher.update(secret.as_bytes());
	hex::encode(&hasher.finalize()[..8])
}

#[cfg(test)]
mod tests {
	use super::*;

	fn openai_key(key: &str) -> Key {
		Key::new(Credential::OpenAI { api_key: SecretString::from(key.to_string()), organization_id: None, is_trial: false })
	}

	#[test]
	fn hash_is_stable_for_same_credential() {
		let a = openai_key("sk-test-1");
		let b = openai_key("sk-test-1");
		assert_eq!(a.hash, b.hash);
	}

	#[test]
	fn hash_differs_for_different_credentials() {
		let a = openai_key("sk-test-1");
		let b = openai_key("sk-test-2");
		assert_ne!(a.hash, b.hash);
	}

	#[test]
	fn rate_limited_key_unavailable_until_deadline_passes() {
		let mut key = openai_key("sk-test");
		let now = Instant::now();
		key.mark_rate_limited(Duration::from_secs(30), Some(ModelFamily::Gpt4), now);
		assert!(!key.is_available_for(ModelFamily::Gpt4, now));
		assert!(key.is_available_for(ModelFamily::Turbo, now));
		assert!(key.is_available_for(ModelFamily::Gpt4, now + Duration::from_secs(31)));
	}

	#[test]
	fn disabled_key_never_available() {
		let mut key = openai_key("sk-test");
		key.disable("revoked");
		assert!(!key.is_available_for(ModelFamily::Gpt4, Instant::now()));
	}

	#[test]
	fn hard_limit_takes_key_out_of_rotation() {
		let mut key = openai_key("sk-test");
		key.hard_limit_usd_micros = Some(1_000_000);
		key.record_usage(Usage { cost_usd_micros: 1_000_000, ..Default::default() });
		assert!(!key.is_available_for(ModelFamily::Gpt4, Instant::now()));
	}
}
