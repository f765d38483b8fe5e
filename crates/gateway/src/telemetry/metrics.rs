//! Process metrics, registered into one `prometheus_client::Registry`
//! alongside `relay_core::tokio_metrics::TokioCollector`.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct FamilyLabel {
	pub family: String,
}

pub struct Metrics {
	pub queue_depth: Family<FamilyLabel, Gauge>,
	pub requests_total: Family<FamilyLabel, Counter>,
	pub retries_total: Family<FamilyLabel, Counter>,
	pub keys_available: Family<FamilyLabel, Gauge>,
}

impl Metrics {
	pub fn new(registry: &mut Registry) -> Self {
		let queue_depth = Family::default();
		let requests_total = Family::default();
		let retries_total = Family::default();
		let keys_available = Family::default();

		registry.register("llm_relay_queue_depth", "requests waiting per model family", queue_depth.clone());
		registry.register("llm_relay_requests_total", "requests processed per model family", requests_total.clone());
		registry.register("llm_relay_retries_total", "requests requeued after a retryable failure", retries_total.clone());
		registry.register("llm_relay_keys_available", "keys currently usable per service", keys_available.clone());

		Metrics { queue_depth, requests_total, retries_total, keys_available }
	}
}
