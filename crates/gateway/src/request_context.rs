//! The per-request context object threaded through the pipeline, the
//! queue, and the response handler. One of these is created per inbound
//! request and carries everything downstream stages need without
//! reaching back into shared state.

use std::time::Instant;

use relay_core::Strng;
use uuid::Uuid;

use crate::key::Usage;
use crate::key_pool::KeyHandle;
use crate::model::{APIFormat, ModelFamily};

#[derive(Debug, Clone)]
pub struct RequestContext {
	pub request_id: Uuid,
	pub user_token: Strng,
	pub ip: Strng,
	pub incoming_format: APIFormat,
	pub requested_model: Strng,
	pub family: ModelFamily,
	pub streaming: bool,
	pub prompt_tokens_estimate: u64,
	pub max_output_tokens: u64,
	pub retry_count: u32,
	/// Set once the Anthropic-text preamble-injection retry has happened,
	/// so the pipeline can bound that retry to a single attempt (see
	/// DESIGN.md's Open Question decision).
	pub preamble_retried: bool,
	pub key: Option<KeyHandle>,
	pub enqueued_at: Option<Instant>,
	pub usage_so_far: Usage,
}

impl RequestContext {
	pub fn new(user_token: Strng, ip: Strng, incoming_format: APIFormat, requested_model: Strng) -> Self {
		let family = crate::model::resolve(incoming_format.default_service(), &requested_model);
		RequestContext {
			request_id: Uuid::new_v4(),
			user_token,
			ip,
			incoming_format,
			requested_model,
			family,
			streaming: false,
			prompt_tokens_estimate: 0,
			max_output_tokens: 0,
			retry_count: 0,
			preamble_retried: false,
			key: None,
			enqueued_at: None,
			usage_so_far: Usage::default(),
		}
	}

	pub fn wait_time(&self) -> Option<std::time::Duration> {
		self.enqueued_at.map(|t| t.elapsed())
	}
}
