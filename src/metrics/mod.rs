//! Prometheus metrics for the director and the enrichment worker
//!
//! This module provides metrics tracking for:
//! - Director: rotations by reason, timer adjustments, downvote vetoes, propagation runs
//! - Worker: task outcomes by type, task duration, API backoff state
//! - Both loops: tick errors by component and error category
//!
//! # Usage
//!
//! Call `init_metrics()` at application startup to register all metrics.
//! If initialization fails, metrics operations become no-ops.

use prometheus::{
    register_counter, register_counter_vec, register_gauge_vec, register_histogram_vec, Counter,
    CounterVec, Encoder, GaugeVec, HistogramVec, TextEncoder,
};
use std::sync::OnceLock;

// ============================================================================
// Metrics Storage
// ============================================================================

/// Container for all rotation engine metrics
struct DirectorMetrics {
    rotations: CounterVec,
    timer_adjustments: Counter,
    downvote_vetoes: Counter,
    propagations: Counter,
}

/// Container for all worker metrics
struct WorkerMetrics {
    tasks: CounterVec,
    task_duration: HistogramVec,
    backoff_active: GaugeVec,
}

/// Container for metrics shared by both loops
struct LoopMetrics {
    tick_errors: CounterVec,
}

static DIRECTOR_METRICS: OnceLock<DirectorMetrics> = OnceLock::new();

static WORKER_METRICS: OnceLock<WorkerMetrics> = OnceLock::new();

static LOOP_METRICS: OnceLock<LoopMetrics> = OnceLock::new();

/// Flag to track if initialization was attempted
static METRICS_INIT_ATTEMPTED: OnceLock<bool> = OnceLock::new();

// ============================================================================
// Initialization
// ============================================================================

/// Initialize all Prometheus metrics
///
/// This function should be called once at application startup.
/// If metric registration fails, errors are logged and subsequent
/// metric operations become no-ops.
///
/// # Example
///
/// ```ignore
/// if let Err(e) = linksite::metrics::init_metrics() {
///     tracing::warn!("Metrics initialization failed: {}", e);
/// }
/// ```
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    // Prevent double initialization
    if METRICS_INIT_ATTEMPTED.get().is_some() {
        return Ok(());
    }
    METRICS_INIT_ATTEMPTED.set(true).ok();

    let director = DirectorMetrics {
        rotations: register_counter_vec!(
            "linksite_director_rotations_total",
            "Total rotations by selection reason",
            &["reason"]
        )?,
        timer_adjustments: register_counter!(
            "linksite_director_timer_adjustments_total",
            "Total writes of an adjusted rotation end time"
        )?,
        downvote_vetoes: register_counter!(
            "linksite_director_downvote_vetoes_total",
            "Total rotations forced by a single user's downvotes"
        )?,
        propagations: register_counter!(
            "linksite_director_propagations_total",
            "Total score propagation runs"
        )?,
    };

    let worker = WorkerMetrics {
        tasks: register_counter_vec!(
            "linksite_worker_tasks_total",
            "Total task executions by type and outcome",
            &["task_type", "outcome"]
        )?,
        task_duration: register_histogram_vec!(
            "linksite_worker_task_duration_seconds",
            "Task execution duration in seconds",
            &["task_type"],
            vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
        )?,
        backoff_active: register_gauge_vec!(
            "linksite_api_backoff_active",
            "Whether an external API is in failure backoff (1 = yes, 0 = no)",
            &["api"]
        )?,
    };

    let loops = LoopMetrics {
        tick_errors: register_counter_vec!(
            "linksite_tick_errors_total",
            "Total failed ticks by component and error category",
            &["component", "category"]
        )?,
    };

    DIRECTOR_METRICS
        .set(director)
        .map_err(|_| "Director metrics already initialized")?;
    WORKER_METRICS
        .set(worker)
        .map_err(|_| "Worker metrics already initialized")?;
    LOOP_METRICS
        .set(loops)
        .map_err(|_| "Loop metrics already initialized")?;

    tracing::info!("Prometheus metrics initialized successfully");
    Ok(())
}

/// Check if metrics have been initialized
pub fn metrics_initialized() -> bool {
    DIRECTOR_METRICS.get().is_some()
        && WORKER_METRICS.get().is_some()
        && LOOP_METRICS.get().is_some()
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Encode all metrics to Prometheus text format
pub fn gather_metrics() -> Result<String, Box<dyn std::error::Error>> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

/// Record a completed rotation
pub fn record_rotation(reason: &str) {
    if let Some(m) = DIRECTOR_METRICS.get() {
        m.rotations.with_label_values(&[reason]).inc();
    }
}

pub fn record_timer_adjustment() {
    if let Some(m) = DIRECTOR_METRICS.get() {
        m.timer_adjustments.inc();
    }
}

pub fn record_downvote_veto() {
    if let Some(m) = DIRECTOR_METRICS.get() {
        m.downvote_vetoes.inc();
    }
}

pub fn record_propagation() {
    if let Some(m) = DIRECTOR_METRICS.get() {
        m.propagations.inc();
    }
}

/// Record a task execution outcome
pub fn record_task(task_type: &str, outcome: &str, duration_secs: f64) {
    let Some(m) = WORKER_METRICS.get() else {
        return;
    };

    m.tasks.with_label_values(&[task_type, outcome]).inc();
    m.task_duration
        .with_label_values(&[task_type])
        .observe(duration_secs);
}

/// Update the backoff gauge of one API
pub fn set_backoff_active(api: &str, active: bool) {
    if let Some(m) = WORKER_METRICS.get() {
        m.backoff_active
            .with_label_values(&[api])
            .set(if active { 1.0 } else { 0.0 });
    }
}

/// Record a tick that ended in an error
pub fn record_tick_error(component: &str, category: &str) {
    if let Some(m) = LOOP_METRICS.get() {
        m.tick_errors.with_label_values(&[component, category]).inc();
    }
}

// ============================================================================
// Tests
// ============================================================================
