use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

/// Creates the metrics sub registry for latchd.
pub fn sub_registry(registry: &mut Registry) -> &mut Registry {
	registry.sub_registry_with_prefix("latchd")
}

/// Engine metrics. The registry is injected by the embedder; latchd itself
/// exposes no scrape endpoint.
#[derive(Clone, Debug, Default)]
pub struct Metrics {
	pub connections_opened: Counter,
	pub connections_closed: Counter,
	pub active_connections: Gauge,
	pub lock_commands: Counter,
	pub unlock_commands: Counter,
	pub state_commands: Counter,
	pub protocol_errors: Counter,
}

impl Metrics {
	pub fn new(registry: &mut Registry) -> Self {
		let metrics = Metrics::default();
		registry.register(
			"connections_opened",
			"Connections accepted",
			metrics.connections_opened.clone(),
		);
		registry.register(
			"connections_closed",
			"Connections closed",
			metrics.connections_closed.clone(),
		);
		registry.register(
			"active_connections",
			"Connections currently open",
			metrics.active_connections.clone(),
		);
		registry.register(
			"lock_commands",
			"LOCK commands processed",
			metrics.lock_commands.clone(),
		);
		registry.register(
			"unlock_commands",
			"UNLOCK commands processed",
			metrics.unlock_commands.clone(),
		);
		registry.register(
			"state_commands",
			"STATE commands processed",
			metrics.state_commands.clone(),
		);
		registry.register(
			"protocol_errors",
			"Frames rejected before dispatch",
			metrics.protocol_errors.clone(),
		);
		metrics
	}
}
