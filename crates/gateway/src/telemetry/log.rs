//! Accumulates per-request fields across the pipeline/queue/response
//! handler and emits them as a single structured event at the end,
//! rather than logging at every stage — the same "accumulate on a
//! struct, log once" shape the teacher uses for its own request logging.

use std::time::Duration;

use relay_core::Strng;
use uuid::Uuid;

use crate::model::ModelFamily;

#[derive(Debug, Default)]
pub struct RequestLog {
	pub request_id: Option<Uuid>,
	pub user: Option<Strng>,
	pub family: Option<ModelFamily>,
	pub prompt_tokens: u64,
	pub completion_tokens: u64,
	pub queue_wait: Option<Duration>,
	pub retry_count: u32,
	pub status: Option<u16>,
}

impl RequestLog {
	pub fn emit(&self) {
		tracing::info!(
			request_id = self.request_id.map(|id| id.to_string()),
			user = self.user.as_ref().map(|u| u.as_str()),
			family = self.family.map(|f| f.as_str()),
			prompt_tokens = self.prompt_tokens,
			completion_tokens = self.completion_tokens,
			queue_wait_ms = self.queue_wait.map(|d| d.as_millis() as u64),
			retry_count = self.retry_count,
			status = self.status,
			"request completed"
		);
	}
}
