use prometheus::{
    Encoder, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub offers_total: IntCounterVec,
    pub assignments_total: IntCounterVec,
    pub rejected_transitions_total: IntCounterVec,
    pub active_offers: IntGauge,
    pub orders_in_queue: IntGauge,
    pub assignment_latency_seconds: HistogramVec,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let offers_total = IntCounterVec::new(
            Opts::new("offers_total", "Courier offers by outcome"),
            &["outcome"],
        )
        .expect("valid offers_total metric");

        let assignments_total = IntCounterVec::new(
            Opts::new("assignments_total", "Finished assignment attempts by outcome"),
            &["outcome"],
        )
        .expect("valid assignments_total metric");

        let rejected_transitions_total = IntCounterVec::new(
            Opts::new(
                "rejected_transitions_total",
                "Order transitions refused without mutation, by error kind",
            ),
            &["kind"],
        )
        .expect("valid rejected_transitions_total metric");

        let active_offers = IntGauge::new("active_offers", "Offers currently awaiting a courier")
            .expect("valid active_offers metric");

        let orders_in_queue = IntGauge::new("orders_in_queue", "Current number of orders in queue")
            .expect("valid orders_in_queue metric");

        let assignment_latency_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "assignment_latency_seconds",
                "Latency of one match-and-offer attempt in seconds",
            ),
            &["outcome"],
        )
        .expect("valid assignment_latency_seconds metric");

        registry
            .register(Box::new(offers_total.clone()))
            .expect("register offers_total");
        registry
            .register(Box::new(assignments_total.clone()))
            .expect("register assignments_total");
        registry
            .register(Box::new(rejected_transitions_total.clone()))
            .expect("register rejected_transitions_total");
        registry
            .register(Box::new(active_offers.clone()))
            .expect("register active_offers");
        registry
            .register(Box::new(orders_in_queue.clone()))
            .expect("register orders_in_queue");
        registry
            .register(Box::new(assignment_latency_seconds.clone()))
            .expect("register assignment_latency_seconds");

        Self {
            registry,
            offers_total,
            assignments_total,
            rejected_transitions_total,
            active_offers,
            orders_in_queue,
            assignment_latency_seconds,
        }
    }

    pub fn encode(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|err| format!("failed to encode metrics: {err}"))?;

        String::from_utf8(buffer).map_err(|err| format!("metrics are not valid utf8: {err}"))
    }
}
