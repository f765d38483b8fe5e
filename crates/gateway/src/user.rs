//! User identity and per-user quota enforcement (§3, §4.4 step 8).
//!
//! A `User` is identified by an opaque token the client presents (the
//! `GATEKEEPER`-issued token, not an upstream API key); the store tracks
//! per-family token usage against configured soft/hard quotas and the set
//! of IPs that have used the token, for the `MAX_IPS_PER_USER` enforcement.

use std::collections::{HashMap, HashSet};

use parking_lot::RwLock;
use relay_core::Strng;

use crate::error::{ProxyError, ProxyResult};
use crate::model::ModelFamily;

#[derive(Debug, Clone, Default)]
pub struct FamilyUsage {
	pub prompt_tokens: u64,
	pub completion_tokens: u64,
}

/// §3: a user's type governs which checks apply to it. `Special` users
/// (internal/staff tokens) bypass both the per-IP limit and quota
/// enforcement entirely; `Temporary` users behave like `Normal` ones here
/// but are expected to carry an `expires_at` the external gatekeeper
/// enforces before a request ever reaches the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UserType {
	#[default]
	Normal,
	Special,
	Temporary,
}

#[derive(Debug, Clone)]
pub struct User {
	pub token: Strng,
	pub nickname: Option<String>,
	pub user_type: UserType,
	pub ips: HashSet<String>,
	pub usage: HashMap<ModelFamily, FamilyUsage>,
	pub token_quota: HashMap<ModelFamily, u64>,
	pub max_ips: Option<usize>,
	pub disabled: bool,
}

impl User {
	pub fn new(token: Strng) -> Self {
		User {
			token,
			nickname: None,
			user_type: UserType::Normal,
			ips: HashSet::new(),
			usage: HashMap::new(),
			token_quota: HashMap::new(),
			max_ips: None,
			disabled: false,
		}
	}

	fn total_tokens(&self, family: ModelFamily) -> u64 {
		self.usage.get(&family).map(|u| u.prompt_tokens + u.completion_tokens).unwrap_or(0)
	}

	/// §4.4 step 8: rejects if this request's own token cost, added to usage
	/// already on the books, would push the family past its quota —
	/// not just once past usage alone already reached it.
	pub fn check_quota(&self, family: ModelFamily, requested_tokens: u64) -> ProxyResult<()> {
		if self.disabled {
			return Err(ProxyError::Auth("user is disabled".to_string()));
		}
		if self.user_type == UserType::Special {
			return Ok(());
		}
		if let Some(quota) = self.token_quota.get(&family) {
			if self.total_tokens(family) + requested_tokens > *quota {
				return Err(ProxyError::QuotaExceeded {
					user: self.token.clone(),
					detail: format!("token quota exhausted for {}", family.as_str()),
				});
			}
		}
		Ok(())
	}

	pub fn record_usage(&mut self, family: ModelFamily, prompt_tokens: u64, completion_tokens: u64) {
		let entry = self.usage.entry(family).or_default();
		entry.prompt_tokens += prompt_tokens;
		entry.completion_tokens += completion_tokens;
	}

	/// Records a new IP seen for this user, rejecting it if that would push
	/// the user past `max_ips` and the IP hasn't been seen before (an IP
	/// the user already used doesn't count against the limit again).
	/// `Special` users bypass the limit entirely (§3 invariant).
	pub fn check_and_record_ip(&mut self, ip: &str) -> ProxyResult<()> {
		if self.ips.contains(ip) {
			return Ok(());
		}
		if self.user_type != UserType::Special {
			if let Some(max) = self.max_ips {
				if self.ips.len() >= max {
					return Err(ProxyError::Auth(format!("too many IPs for this token (limit {max})")));
				}
			}
		}
		self.ips.insert(ip.to_string());
		Ok(())
	}
}

pub struct UserStore {
	users: RwLock<HashMap<Strng, User>>,
}

impl Default for UserStore {
	fn default() -> Self {
		Self::new()
	}
}

impl UserStore {
	pub fn new() -> Self {
		UserStore { users: RwLock::new(HashMap::new()) }
	}

	pub fn upsert(&self, user: User) {
		self.users.write().insert(user.token.clone(), user);
	}

	/// §6 `QUOTA_REFRESH_PERIOD`: clears every user's recorded usage,
	/// giving each family's quota a fresh window. Intended to be called
	/// from a background tick, not per-request.
	pub fn reset_all_usage(&self) {
		for user in self.users.write().values_mut() {
			user.usage.clear();
		}
	}

	pub fn get(&self, token: &str) -> ProxyResult<User> {
		self
			.users
			.read()
			.get(token)
			.cloned()
			.ok_or_else(|| ProxyError::Auth("unrecognized token".to_string()))
	}

	pub fn with_user_mut<R>(&self, token: &str, f: impl FnOnce(&mut User) -> R) -> ProxyResult<R> {
		let mut users = self.users.write();
		let user = users.get_mut(token).ok_or_else(|| ProxyError::Auth("unrecognized token".to_string()))?;
		Ok(f(user))
	}

	/// Like `with_user_mut`, but a token seen for the first time gets a
	/// fresh `User` rather than an `unrecognized token` error, seeded with
	/// `default_quota` (§6 `TOKEN_QUOTA`) in place of an external gatekeeper
	/// upsert.
	pub fn with_user_mut_or_create<R>(
		&self,
		token: &str,
		default_quota: &HashMap<ModelFamily, u64>,
		f: impl FnOnce(&mut User) -> R,
	) -> R {
		let mut users = self.users.write();
		let user = users.entry(relay_core::strng::new(token)).or_insert_with(|| {
			let mut user = User::new(relay_core::strng::new(token));
			user.token_quota = default_quota.clone();
			user
		});
		f(user)
	}
}
