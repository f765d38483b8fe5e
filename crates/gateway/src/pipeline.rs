//! The preprocessor chain (§4.4): a fixed sequence of stages every
//! request passes through between ingress and being handed to the
//! partitioned queue. Each stage can reject the request outright; stages
//! run in order because later ones depend on state earlier ones set
//! (token counting needs the resolved model family, key selection needs
//! the token count, signing needs the selected key).

use relay_core::Strng;

use base64::Engine;

use crate::config::Config;
use crate::error::{ProxyError, ProxyResult};
use crate::key_pool::KeyPool;
use crate::model::{LLMService, ModelFamily};
use crate::request_context::RequestContext;
use crate::schema::{self, openai};
use crate::tokenizer::{self, ChatMessage};
use crate::transform;
use crate::user::UserStore;

#[cfg(test)]
#[path = "pipeline_tests.rs"]
mod tests;

pub struct PreparedRequest {
	pub context: RequestContext,
	pub service: LLMService,
	pub upstream_body: serde_json::Value,
}

pub struct Pipeline<'a> {
	pub key_pool: &'a KeyPool,
	pub users: &'a UserStore,
	pub config: &'a Config,
}

impl<'a> Pipeline<'a> {
	pub fn new(key_pool: &'a KeyPool, users: &'a UserStore, config: &'a Config) -> Self {
		Pipeline { key_pool, users, config }
	}

	/// Runs every stage up through key selection and dialect translation.
	/// Signing happens later, against the actual outbound `reqwest`
	/// request, since it needs the final serialized body bytes.
	pub fn process(
		&self,
		user_token: &str,
		ip: &str,
		mut request: openai::ChatCompletionRequest,
	) -> ProxyResult<PreparedRequest> {
		// 1. normalize: fill defaults, reject unsupported fields.
		self.normalize(&mut request)?;

		// 2. resolve identity (auto-provisioning a default-quota user the
		// first time a token is seen) and enforce per-IP limits.
		self
			.users
			.with_user_mut_or_create(user_token, &self.config.default_token_quota, |user| user.check_and_record_ip(ip))?;

		// 3. build the request context, resolving the model family.
		let mut context = RequestContext::new(
			relay_core::format!("{user_token}"),
			relay_core::format!("{ip}"),
			crate::model::APIFormat::OpenAIChat,
			relay_core::format!("{}", request.model),
		);
		context.streaming = request.stream;

		// §3/§6 ALLOWED_MODEL_FAMILIES: reject families this deployment
		// hasn't opted into before doing any further (more expensive) work.
		if !self.config.family_allowed(context.family) {
			return Err(ProxyError::FamilyNotAllowed { family: family_display(context.family) });
		}

		let requested_max = request.max_tokens.unwrap_or(schema::DEFAULT_MAX_TOKENS) as u64;
		context.max_output_tokens = match self.config.output_ceiling(context.family.service()) {
			Some(ceiling) => requested_max.min(ceiling),
			None => requested_max,
		};

		// 4. count tokens and enforce the absolute input-size ceiling.
		let texts: Vec<String> = request.messages.iter().map(|m| m.content.text()).collect();
		let messages: Vec<ChatMessage> = request
			.messages
			.iter()
			.zip(&texts)
			.map(|(m, text)| ChatMessage { role: &m.role, content: text, name: m.name.as_deref() })
			.collect();
		let text_len: usize = texts.iter().map(|t| t.len()).sum();
		let mut prompt_tokens = tokenizer::count_chat_tokens(context.family, &messages);
		prompt_tokens += self.count_vision_tokens(&request.messages)?;
		tokenizer::check_prompt_size(context.family, text_len, prompt_tokens)?;
		context.prompt_tokens_estimate = prompt_tokens as u64;

		// 5. validateContextSize (§4.4 step 6): min(configured proxy max,
		// model max) across prompt + requested output tokens; Claude gets
		// a 0.95 safety factor since it degrades rather than erroring when
		// run over its nominal window.
		self.validate_context_size(&context)?;

		// 6. validateVision (§4.4 step 9): reject image-bearing prompts on
		// services that haven't opted in, unless the caller is special.
		self.validate_vision(user_token, &context, &request.messages)?;

		// 7. enforce the user's token quota for this family before doing
		// any more (relatively expensive) work. The request's own cost
		// counts against the quota before it's been served, not just the
		// usage already on the books (§4.4 step 8, Scenario 3).
		let requested_tokens = context.prompt_tokens_estimate + context.max_output_tokens;
		self.users.with_user_mut_or_create(user_token, &self.config.default_token_quota, |user| {
			user.check_quota(context.family, requested_tokens)
		})?;

		// 8. fail fast if the service has no keys configured at all; that's
		// a permanent condition, not a transient lockout, so there's no
		// point making the caller wait out a 5-minute queue timeout to
		// learn it. A key that's merely rate-limited right now is *not*
		// rejected here — the queue (§4.5) holds the request and assigns a
		// key, late-bound, only once one is actually usable (§9 Design
		// Notes: key selection happens at dequeue, not at enqueue).
		let service = context.family.service();
		if self.key_pool.total_count(service) == 0 {
			return Err(ProxyError::NoKeysAvailable { family: family_display(context.family) });
		}

		// 9. translate into the upstream dialect. The dialect a family
		// speaks is fixed by its service, independent of which specific
		// key eventually serves the request, so this doesn't need the key
		// selected yet.
		let upstream_body = transform::translate_request(service, &request)?;

		Ok(PreparedRequest { context, service, upstream_body })
	}

	fn normalize(&self, request: &mut openai::ChatCompletionRequest) -> ProxyResult<()> {
		schema::validate_n(request.n)?;
		if request.messages.is_empty() {
			return Err(ProxyError::Validation("messages must not be empty".to_string()));
		}
		if request.max_tokens.is_none() {
			request.max_tokens = Some(schema::DEFAULT_MAX_TOKENS);
		}
		request.temperature = Some(schema::clamp_temperature(request.temperature));
		request.top_p = Some(schema::clamp_top_p(request.top_p));
		Ok(())
	}

	/// §4.4 step 6: reject prompts that would overrun the model's context
	/// window once the requested output tokens are accounted for. The
	/// effective window is `min(vendor window, operator ceiling)`, and
	/// Claude families get a 0.95 safety factor applied to their side of
	/// that minimum since Anthropic's own window advertisement runs close
	/// to the actual limit.
	fn validate_context_size(&self, context: &RequestContext) -> ProxyResult<()> {
		let mut limit = context.family.context_window();
		if context.family.is_claude() {
			limit = (limit as f64 * 0.95) as u64;
		}
		if let Some(ceiling) = self.config.context_ceiling(context.family.service()) {
			limit = limit.min(ceiling);
		}
		let needed = context.prompt_tokens_estimate + context.max_output_tokens;
		if needed > limit {
			return Err(ProxyError::ContextTooLarge(format!(
				"{needed} tokens (prompt + requested output) exceeds the {limit}-token window for {}",
				context.family.as_str()
			)));
		}
		Ok(())
	}

	/// §4.4 step 9: a message carrying inline images is only allowed
	/// through to services that have been explicitly enabled for vision,
	/// unless the caller is a `special` user (§7 bypasses quota and IP
	/// limits the same way). Remote (non-`data:`) image URLs are rejected
	/// outright per §4.1 — providers are reached through per-key upstream
	/// credentials, not the caller's own network access.
	fn validate_vision(
		&self,
		user_token: &str,
		context: &RequestContext,
		messages: &[openai::Message],
	) -> ProxyResult<()> {
		let images: Vec<&openai::ImageUrl> = messages.iter().flat_map(|m| m.content.images()).collect();
		if images.is_empty() {
			return Ok(());
		}
		for image in &images {
			if !image.url.starts_with("data:") {
				return Err(ProxyError::Validation(format!("image URL must be an inline data: URI, got {}", image.url)));
			}
		}
		let is_special = self
			.users
			.get(user_token)
			.map(|user| user.user_type == crate::user::UserType::Special)
			.unwrap_or(false);
		let service = context.family.service();
		if !is_special && !self.config.allowed_vision_services.contains(&service) {
			return Err(ProxyError::Validation(format!("{} is not enabled for vision requests", service.as_str())));
		}
		Ok(())
	}

	/// Adds the vendor's per-image token cost (§4.1 tile math) on top of
	/// the plain-text token count. Only OpenAI-family services have a
	/// documented per-tile cost; other dialects either don't support
	/// inline images or don't publish a token formula for them, so their
	/// images contribute nothing to the estimate.
	fn count_vision_tokens(&self, messages: &[openai::Message]) -> ProxyResult<usize> {
		let mut total = 0usize;
		for message in messages {
			for image in message.content.images() {
				let Some(data) = image.url.strip_prefix("data:").and_then(|rest| rest.split(',').nth(1)) else {
					continue;
				};
				let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(data) else {
					continue;
				};
				let Ok((width, height)) = tokenizer::image_dimensions(&bytes) else {
					continue;
				};
				let low_detail = image.detail.as_deref() == Some("low");
				total += tokenizer::count_image_tokens(width, height, low_detail);
			}
		}
		Ok(total)
	}
}

pub fn family_display(family: ModelFamily) -> Strng {
	relay_core::literal!(family.as_str())
}

