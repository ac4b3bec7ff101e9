use metrics::{Counter, Gauge, Histogram, Unit, describe_counter, describe_gauge, describe_histogram};
use lazy_static::lazy_static;
use std::sync::Arc;

pub struct RuntimeMetrics {
    // Task lifecycle metrics
    pub active_tasks: Gauge,

    // Recurrent task performance metrics
    pub task_iterations: Counter,
    pub task_iteration_latency: Histogram,

    // Error metrics
    pub task_errors: Counter,
}

impl RuntimeMetrics {
    pub fn new() -> Self {
        let metrics = Self {
            active_tasks: metrics::gauge!("runtime.active_tasks"),
            task_iterations: metrics::counter!("runtime.task_iterations"),
            task_iteration_latency: metrics::histogram!("runtime.task_iteration_latency"),
            task_errors: metrics::counter!("runtime.task_errors"),
        };

        // Metrics Description
        describe_gauge!("runtime.active_tasks", "Number of tasks currently running");
        describe_counter!("runtime.task_iterations", "Number of recurrent task iterations executed");
        describe_histogram!("runtime.task_iteration_latency", Unit::Seconds, "Duration of a single recurrent task iteration");
        describe_counter!("runtime.task_errors", "Number of failed task runs and iterations");

        metrics
    }
}

lazy_static! {
    pub static ref METRICS: Arc<RuntimeMetrics> = Arc::new(RuntimeMetrics::new());
}
