//! Prometheus metrics for an evaluation run.
//!
//! The registry is owned by a [`HarnessMetrics`] value created per run and
//! shared through an `Arc`, so independent runs (and tests) never collide on
//! metric registration.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

/// Metrics recorded while a run is in progress.
pub struct HarnessMetrics {
    registry: Registry,
    /// Finished tasks, labeled by terminal status and agent.
    tasks_total: CounterVec,
    /// Task wall-clock duration in seconds, labeled by agent.
    task_duration: HistogramVec,
    /// Agent tokens consumed, labeled by agent.
    tokens_total: CounterVec,
    /// Containers currently held by workers.
    containers_active: Gauge,
    /// Tasks waiting in the queue.
    queue_depth: Gauge,
    /// Retries of transient provisioning failures.
    provision_retries: Counter,
}

impl HarnessMetrics {
    /// Creates and registers every metric on a fresh registry.
    ///
    /// # Errors
    ///
    /// Returns a `prometheus::Error` if a metric definition is invalid.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let tasks_total = CounterVec::new(
            Opts::new("featbench_tasks_total", "Evaluation tasks finished"),
            &["status", "agent"],
        )?;

        let task_duration = HistogramVec::new(
            HistogramOpts::new(
                "featbench_task_duration_seconds",
                "Evaluation task duration in seconds",
            )
            .buckets(vec![30.0, 60.0, 120.0, 300.0, 600.0, 1200.0, 1800.0, 3600.0]),
            &["agent"],
        )?;

        let tokens_total = CounterVec::new(
            Opts::new("featbench_agent_tokens_total", "Tokens consumed by agents"),
            &["agent"],
        )?;

        let containers_active = Gauge::new(
            "featbench_containers_active",
            "Evaluation containers currently held",
        )?;

        let queue_depth = Gauge::new("featbench_queue_depth", "Tasks waiting to be evaluated")?;

        let provision_retries = Counter::new(
            "featbench_provision_retries_total",
            "Retries of transient provisioning failures",
        )?;

        registry.register(Box::new(tasks_total.clone()))?;
        registry.register(Box::new(task_duration.clone()))?;
        registry.register(Box::new(tokens_total.clone()))?;
        registry.register(Box::new(containers_active.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(provision_retries.clone()))?;

        Ok(Self {
            registry,
            tasks_total,
            task_duration,
            tokens_total,
            containers_active,
            queue_depth,
            provision_retries,
        })
    }

    /// Records a finished task.
    pub fn record_task(&self, agent: &str, status: &str, duration_secs: f64, tokens: u64) {
        self.tasks_total.with_label_values(&[status, agent]).inc();
        self.task_duration
            .with_label_values(&[agent])
            .observe(duration_secs);
        self.tokens_total
            .with_label_values(&[agent])
            .inc_by(tokens as f64);
    }

    pub fn container_started(&self) {
        self.containers_active.inc();
    }

    pub fn container_released(&self) {
        self.containers_active.dec();
    }

    pub fn provision_retry(&self) {
        self.provision_retries.inc();
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.set(depth as f64);
    }

    pub fn containers_active(&self) -> f64 {
        self.containers_active.get()
    }

    /// Encodes every metric in the Prometheus text exposition format.
    pub fn export(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
