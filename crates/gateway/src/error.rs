//! Single error taxonomy for everything the proxy can reject a request for.
//!
//! Every subsystem (pipeline, queue, key pool, response handler) returns its
//! own narrow error type internally, but all of them convert into
//! `ProxyError` at the point where a client-facing decision has to be made,
//! so there is exactly one place that maps an error to an HTTP status and a
//! response body.

use relay_core::Strng;

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
	#[error("validation failed: {0}")]
	Validation(String),

	#[error("authentication failed: {0}")]
	Auth(String),

	#[error("quota exceeded for {user}: {detail}")]
	QuotaExceeded { user: Strng, detail: String },

	#[error("request too large: {0}")]
	ContextTooLarge(String),

	#[error("no keys available for {family}")]
	NoKeysAvailable { family: Strng },

	#[error("too many concurrent requests queued for {identifier}")]
	TooManyQueued { identifier: Strng },

	#[error("rate limit exceeded for {family}")]
	ModelRateLimited { family: Strng },

	#[error("model family {family} is not permitted on this deployment")]
	FamilyNotAllowed { family: Strng },

	#[error("upstream error ({status}): {body}")]
	Upstream { status: u16, body: String },

	#[error("retryable error: {0}")]
	Retryable(String),

	#[error("network error: {0}")]
	Network(#[from] reqwest::Error),

	#[error("internal error: {0}")]
	Internal(String),
}

impl ProxyError {
	/// HTTP status code to report to the client, per the error taxonomy.
	pub fn status_code(&self) -> u16 {
		match self {
			ProxyError::Validation(_) => 400,
			ProxyError::Auth(_) => 401,
			ProxyError::QuotaExceeded { .. } => 429,
			ProxyError::ContextTooLarge(_) => 400,
			// §7: NoKeysAvailable is reported as a 500 with a hint, not a
			// 503 — from the client's perspective the proxy itself is
			// broken (misconfigured), not merely busy.
			ProxyError::NoKeysAvailable { .. } => 500,
			// §4.5: the per-identifier concurrency cap is a caller-side
			// backpressure signal, not a quota violation — 429 lets the
			// client distinguish it from §7's QuotaExceeded by body shape.
			ProxyError::TooManyQueued { .. } => 429,
			ProxyError::ModelRateLimited { .. } => 429,
			ProxyError::FamilyNotAllowed { .. } => 400,
			ProxyError::Upstream { status, .. } => *status,
			ProxyError::Retryable(_) => 503,
			ProxyError::Network(_) => 502,
			ProxyError::Internal(_) => 500,
		}
	}

	/// Whether the queue should re-enqueue the request rather than fail it
	/// back to the client immediately.
	pub fn is_retryable(&self) -> bool {
		matches!(
			self,
			ProxyError::Retryable(_) | ProxyError::NoKeysAvailable { .. } | ProxyError::Network(_)
		)
	}

	/// Body returned to the client, shaped like the upstream's own error
	/// envelope isn't attempted here — callers translate this into the
	/// caller's requested APIFormat (see `transform`).
	pub fn client_message(&self) -> String {
		self.to_string()
	}

	/// Short tag used as the `<type>` in §6's SSE error framing
	/// (`[<type> (<status>)]: <json>`); deliberately coarser than the
	/// `thiserror` variant names since it's client-visible.
	pub fn kind(&self) -> &'static str {
		match self {
			ProxyError::Validation(_) => "proxy_validation_error",
			ProxyError::Auth(_) => "proxy_auth_error",
			ProxyError::QuotaExceeded { .. } => "proxy_quota_exceeded",
			ProxyError::ContextTooLarge(_) => "proxy_context_too_large",
			ProxyError::NoKeysAvailable { .. } => "proxy_no_keys_available",
			ProxyError::TooManyQueued { .. } => "proxy_rate_limited",
			ProxyError::ModelRateLimited { .. } => "proxy_model_rate_limited",
			ProxyError::FamilyNotAllowed { .. } => "proxy_family_not_allowed",
			ProxyError::Upstream { .. } => "proxy_upstream_error",
			ProxyError::Retryable(_) => "proxy_retryable_error",
			ProxyError::Network(_) => "proxy_network_error",
			ProxyError::Internal(_) => "proxy_internal_error",
		}
	}
}

pub type ProxyResult<T> = Result<T, ProxyError>;

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn status_codes_match_the_taxonomy() {
		assert_eq!(ProxyError::Validation("x".to_string()).status_code(), 400);
		assert_eq!(ProxyError::QuotaExceeded { user: relay_core::literal!("u"), detail: "x".to_string() }.status_code(), 429);
		assert_eq!(ProxyError::NoKeysAvailable { family: relay_core::literal!("gpt4") }.status_code(), 500);
		assert_eq!(ProxyError::TooManyQueued { identifier: relay_core::literal!("1.1.1.1") }.status_code(), 429);
	}

	#[test]
	fn only_transient_variants_are_retryable() {
		assert!(ProxyError::Retryable("x".to_string()).is_retryable());
		assert!(ProxyError::NoKeysAvailable { family: relay_core::literal!("gpt4") }.is_retryable());
		assert!(!ProxyError::Validation("x".to_string()).is_retryable());
		assert!(!ProxyError::Upstream { status: 400, body: "x".to_string() }.is_retryable());
	}
}
