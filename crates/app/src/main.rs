//! `llm-relay` binary: loads configuration from the environment, builds
//! the key pool and user store, starts the key checker and partitioned
//! queue as background tasks, and serves the ingress HTTP surface.

use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::State;
use bytes::Bytes;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use clap::Parser;
use llm_relay::config::{self, Config};
use llm_relay::key_checker::KeyChecker;
use llm_relay::key_pool::KeyPool;
use llm_relay::pipeline::Pipeline;
use llm_relay::queue::PartitionedQueue;
use llm_relay::schema::openai::ChatCompletionRequest;
use llm_relay::telemetry::log::RequestLog;
use llm_relay::telemetry::metrics::{FamilyLabel, Metrics};
use llm_relay::user::UserStore;
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;

#[derive(Parser, Debug)]
#[command(name = "llm-relay", about = "Multi-tenant reverse proxy in front of several LLM vendor APIs")]
struct Cli {
	#[arg(long, value_enum, default_value = "pretty")]
	log_format: LogFormatArg,
}

#[derive(Clone, Debug, clap::ValueEnum)]
enum LogFormatArg {
	Pretty,
	Json,
}

struct AppState {
	pool: Arc<KeyPool>,
	users: Arc<UserStore>,
	queue: Arc<PartitionedQueue>,
	client: reqwest::Client,
	metrics: Metrics,
	registry: parking_lot::Mutex<Registry>,
	config: Config,
}

/// A retryable upstream/queue failure is retried in-place a bounded
/// number of times rather than forwarded to the client immediately; the
/// queue's own 5-minute stale timeout is the ultimate backstop, so this
/// cap only bounds how many times one request re-joins its partition
/// before giving up sooner than that.
const MAX_RETRIES: u32 = 3;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let cli = Cli::parse();
	init_tracing(&cli.log_format);

	let config = Config::from_env();
	llm_relay::tokenizer::preload();

	let pool = Arc::new(KeyPool::new());
	load_keys_from_env(&pool);

	let users = Arc::new(UserStore::new());
	let queue = Arc::new(PartitionedQueue::new(Arc::clone(&pool), config.dequeue_strategy));

	// §6 `QUOTA_REFRESH_PERIOD`: periodically clear recorded usage so every
	// user's token quota gets a fresh window. No-op when unconfigured.
	if let Some(period) = config.quota_refresh_period {
		let users = Arc::clone(&users);
		tokio::spawn(async move {
			let mut interval = tokio::time::interval(period);
			interval.tick().await;
			loop {
				interval.tick().await;
				users.reset_all_usage();
			}
		});
	}

	// §6 `CHECK_KEYS`: disabling this skips both the blocking startup probe
	// and the steady-state background probing loop entirely, leaving every
	// key's health to be inferred from live traffic outcomes only.
	if config.check_keys {
		let checker = KeyChecker::default();
		checker.startup_probe(&pool).await;
		let pool = Arc::clone(&pool);
		tokio::spawn(async move {
			let checker = KeyChecker::default();
			checker.run_steady_state(&pool).await;
		});
	}
	{
		let queue = Arc::clone(&queue);
		tokio::spawn(async move { queue.run().await });
	}

	let mut registry = Registry::default();
	let metrics = Metrics::new(&mut registry);
	relay_core::tokio_metrics::TokioCollector::register(&mut registry, &tokio::runtime::Handle::current());

	let port = config.port;
	let state = Arc::new(AppState {
		pool,
		users,
		queue,
		client: reqwest::Client::new(),
		metrics,
		registry: parking_lot::Mutex::new(registry),
		config,
	});
	let app = Router::new()
		.route("/v1/chat/completions", post(chat_completions))
		.route("/metrics", get(metrics_handler))
		.with_state(state);

	let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
	tracing::info!(port, "llm-relay listening");
	axum::serve(listener, app).await?;
	Ok(())
}

fn init_tracing(format: &LogFormatArg) {
	let filter = tracing_subscriber::EnvFilter::try_from_default_env()
		.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
	let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
	match format {
		LogFormatArg::Json => subscriber.json().init(),
		LogFormatArg::Pretty => subscriber.init(),
	}
}

fn load_keys_from_env(pool: &KeyPool) {
	for (var, parser) in [
		("OPENAI_KEY", config::parse_openai_keys as fn(&str) -> Vec<llm_relay::key::Key>),
		("ANTHROPIC_KEY", config::parse_anthropic_keys),
		("AWS_CREDENTIALS", config::parse_aws_keys),
		("AZURE_CREDENTIALS", config::parse_azure_keys),
		("GOOGLE_AI_KEY", config::parse_google_ai_keys),
		("MISTRAL_KEY", config::parse_mistral_keys),
	] {
		if let Ok(raw) = std::env::var(var) {
			for key in parser(&raw) {
				pool.add_key(key);
			}
		}
	}
}

async fn chat_completions(
	State(state): State<Arc<AppState>>,
	headers: axum::http::HeaderMap,
	Json(request): Json<ChatCompletionRequest>,
) -> axum::response::Response {
	let token = headers
		.get(axum::http::header::AUTHORIZATION)
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.strip_prefix("Bearer "))
		.unwrap_or_default()
		.to_string();
	let ip = headers
		.get("x-forwarded-for")
		.and_then(|v| v.to_str().ok())
		.unwrap_or("0.0.0.0")
		.to_string();

	let mut log = RequestLog { request_id: Some(uuid::Uuid::new_v4()), user: Some(relay_core::strng::new(&token)), ..Default::default() };

	// §4.5: admit against the per-identifier concurrency cap before doing
	// any other work; the guard is held for the whole request, including
	// the eventual upstream round trip, and releases the slot on drop
	// however this function returns.
	let identifier = if token.is_empty() { ip.clone() } else { token.clone() };
	let _identifier_guard = match state.queue.admit(&identifier, state.config.concurrency_limit(&identifier)) {
		Ok(guard) => guard,
		Err(err) => {
			log.status = Some(err.status_code());
			log.emit();
			return error_response(err);
		},
	};

	let pipeline = Pipeline::new(&state.pool, &state.users, &state.config);
	let prepared = match pipeline.process(&token, &ip, request) {
		Ok(prepared) => prepared,
		Err(err) => {
			log.status = Some(err.status_code());
			log.emit();
			let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
			return (status, Json(serde_json::json!({ "error": { "message": err.client_message() } }))).into_response();
		},
	};

	let streaming = prepared.context.streaming;
	let family = prepared.context.family;
	log.family = Some(family);

	if let Some(limit) = state.config.model_rate_limit(family) {
		if let Err(err) = state.queue.check_model_rate_limit(family, limit) {
			log.status = Some(err.status_code());
			log.emit();
			return error_response(err);
		}
	}

	let family_label = FamilyLabel { family: family.as_str().to_string() };
	state.metrics.requests_total.get_or_create(&family_label).inc();

	let enqueued_at = Instant::now();

	// §4.5: a streaming request keeps the connection open (with heartbeat
	// comments) for as long as it sits queued, so its body has to be one
	// continuous stream starting from the queue wait itself — it can't wait
	// for `rx` to resolve the way the non-streaming path does, since by the
	// time this handler would otherwise return a response, headers (and
	// possibly heartbeat bytes) may already be committed to the client.
	if streaming {
		let rx = state.queue.enqueue(prepared);
		let queue = Arc::clone(&state.queue);
		let pool = Arc::clone(&state.pool);
		let users = Arc::clone(&state.users);
		let client = state.client.clone();
		let retries_total = state.metrics.retries_total.clone();
		let family_label = family_label.clone();

		let body_stream = async_stream::stream! {
			use futures_util::StreamExt;
			use llm_relay::queue::DispatchWait;

			let mut waiting = queue.wait_for_dispatch(rx, family);
			let mut dispatched = loop {
				match waiting.next().await {
					Some(Ok(DispatchWait::Heartbeat(bytes))) => yield Ok::<Bytes, std::io::Error>(bytes),
					Some(Ok(DispatchWait::Dispatched(d))) => break *d,
					Some(Err(err)) => {
						retries_total.get_or_create(&family_label).inc();
						log.status = Some(err.status_code());
						log.queue_wait = Some(enqueued_at.elapsed());
						log.emit();
						yield Ok(llm_relay::sse::framed_error_event(err.kind(), err.status_code(), &err.client_message()));
						yield Ok(llm_relay::sse::encode_done());
						return;
					},
					None => return,
				}
			};
			log.queue_wait = Some(enqueued_at.elapsed());

			let dispatcher = llm_relay::dispatch::Dispatcher::new(&client, &pool);
			let mut retry_count = 0u32;
			loop {
				// the key is consumed by `send_streaming`'s slot guard but the
				// handle itself is cheap to clone, and the accumulator needs
				// it after the response moves into the forwarded stream below.
				let handle = dispatched.prepared.context.key.clone();
				match dispatcher.send_streaming(&dispatched).await {
					Ok((service, response)) => {
						let accumulator = llm_relay::response::StreamAccumulator::new(service);
						let byte_stream = response.bytes_stream();
						let users = Arc::clone(&users);
						let pool = Arc::clone(&pool);
						log.status = Some(200);
						log.retry_count = retry_count;
						let mut forwarded = llm_relay::response::stream_with_accumulator(byte_stream, accumulator, move |usage| {
							let _ = users.with_user_mut(&token, |user| {
								user.record_usage(family, usage.prompt_tokens, usage.completion_tokens)
							});
							if let Some(handle) = handle {
								pool.record_usage(&handle, usage);
							}
							log.prompt_tokens = usage.prompt_tokens;
							log.completion_tokens = usage.completion_tokens;
							log.emit();
						});
						while let Some(chunk) = forwarded.next().await {
							yield chunk.map_err(std::io::Error::other);
						}
						return;
					},
					Err(err) => {
						if err.is_retryable() && retry_count < MAX_RETRIES {
							retry_count += 1;
							retries_total.get_or_create(&family_label).inc();
							let rx = queue.requeue(dispatched.prepared, retry_count);
							dispatched = match rx.await {
								Ok(Ok(d)) => d,
								Ok(Err(err)) => {
									log.status = Some(err.status_code());
									log.emit();
									yield Ok(llm_relay::sse::framed_error_event(err.kind(), err.status_code(), &err.client_message()));
									yield Ok(llm_relay::sse::encode_done());
									return;
								},
								Err(_) => return,
							};
							continue;
						}
						log.status = Some(err.status_code());
						log.retry_count = retry_count;
						log.emit();
						yield Ok(llm_relay::sse::framed_error_event(err.kind(), err.status_code(), &err.client_message()));
						yield Ok(llm_relay::sse::encode_done());
						return;
					},
				}
			}
		};

		let body = axum::body::Body::from_stream(body_stream);
		return axum::response::Response::builder()
			.header(axum::http::header::CONTENT_TYPE, "text/event-stream")
			.body(body)
			.unwrap()
			.into_response();
	}

	let rx = state.queue.enqueue(prepared);
	let mut dispatched = match rx.await {
		Ok(Ok(dispatched)) => dispatched,
		Ok(Err(err)) => {
			state.metrics.retries_total.get_or_create(&family_label).inc();
			log.status = Some(err.status_code());
			log.queue_wait = Some(enqueued_at.elapsed());
			log.emit();
			return error_response(err);
		},
		Err(_) => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
	};
	log.queue_wait = Some(enqueued_at.elapsed());

	let dispatcher = llm_relay::dispatch::Dispatcher::new(&state.client, &state.pool);
	let mut retry_count = 0u32;
	loop {
		match dispatcher.send(&dispatched).await {
			Ok(result) => {
				let _ = state.users.with_user_mut(&token, |user| {
					user.record_usage(family, result.usage.prompt_tokens, result.usage.completion_tokens)
				});
				log.status = Some(200);
				log.retry_count = retry_count;
				log.prompt_tokens = result.usage.prompt_tokens;
				log.completion_tokens = result.usage.completion_tokens;
				log.emit();
				return Json(result.body).into_response();
			},
			Err(err) => {
				if err.is_retryable() && retry_count < MAX_RETRIES {
					retry_count += 1;
					state.metrics.retries_total.get_or_create(&family_label).inc();
					let rx = state.queue.requeue(dispatched.prepared, retry_count);
					dispatched = match rx.await {
						Ok(Ok(d)) => d,
						Ok(Err(err)) => {
							log.status = Some(err.status_code());
							log.emit();
							return error_response(err);
						},
						Err(_) => return StatusCode::INTERNAL_SERVER_ERROR.into_response(),
					};
					continue;
				}
				log.status = Some(err.status_code());
				log.retry_count = retry_count;
				log.emit();
				return error_response(err);
			},
		}
	}
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> axum::response::Response {
	let mut buf = String::new();
	let registry = state.registry.lock();
	if let Err(err) = encode(&mut buf, &registry) {
		return (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response();
	}
	drop(registry);
	(StatusCode::OK, [(axum::http::header::CONTENT_TYPE, "text/plain; charset=utf-8")], buf).into_response()
}

fn error_response(err: llm_relay::ProxyError) -> axum::response::Response {
	let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
	(status, Json(serde_json::json!({ "error": { "message": err.client_message() } }))).into_response()
}
