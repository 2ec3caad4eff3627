use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use owo_colors::OwoColorize;
use std::sync::OnceLock;
use std::time::Instant;
use tokio::net::TcpListener;

use crate::shutdown::shutdown_signal;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static SERVER_STARTED: OnceLock<()> = OnceLock::new();

fn install_recorder_once() -> &'static PrometheusHandle {
    PROM_HANDLE.get_or_init(|| {
        PrometheusBuilder::new()
            .install_recorder()
            .expect("install global metrics recorder")
    })
}

/// Starts the `/healthz`, `/readyz`, `/metrics` server iff `METRICS_PORT` is
/// set. A no-op under `lambda` invocation, where nothing ever binds a port;
/// meaningful under `serve`, where one process runs for hours.
pub fn maybe_spawn_metrics_server() {
    let Some(port) = metric_port_env() else {
        return;
    };

    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_panic(info);
        std::process::exit(1);
    }));

    if SERVER_STARTED.set(()).is_ok() {
        let _ = install_recorder_once();
        tokio::spawn(run_metrics_server(port));
    }
}

pub async fn run_metrics_server(port: u16) {
    let handle = install_recorder_once().clone();
    let metrics_route = get(move || async move { handle.render() });
    let app = Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(|| async { "ok" }))
        .route("/metrics", metrics_route);

    let addr = format!("0.0.0.0:{port}");
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| {
            eprintln!("{} {addr}: {e}", "failed to bind metrics server to".red());
            e
        })
        .unwrap();

    println!(
        "{}{}",
        "starting metrics server • port=".green(),
        port.to_string().green().dimmed(),
    );
    let started = Instant::now();
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("serve metrics");
    println!(
        "{} {}",
        "metrics server stopped • uptime was".red(),
        format!("{:.2?}", started.elapsed()).red().dimmed()
    );
}

fn metric_port_env() -> Option<u16> {
    std::env::var("METRICS_PORT").ok().and_then(|s| s.parse().ok())
}

/// Counters and gauges the reconcile loop and worker pool update directly;
/// kept as plain functions rather than a struct since `metrics`'s macros are
/// already a thin global-registry facade (§1.1).
pub mod reconcile {
    use metrics::{counter, gauge, histogram};

    pub fn loop_started(cluster: &str) {
        counter!("k3ctl_reconcile_total", "cluster" => cluster.to_string()).increment(1);
    }

    pub fn loop_duration(cluster: &str, phase: &str, seconds: f64) {
        histogram!(
            "k3ctl_reconcile_duration_seconds",
            "cluster" => cluster.to_string(),
            "phase" => phase.to_string(),
        )
        .record(seconds);
    }

    pub fn phase_gauge(cluster: &str, phase: &str) {
        gauge!("k3ctl_cluster_phase", "cluster" => cluster.to_string(), "phase" => phase.to_string())
            .set(1.0);
    }

    pub fn lease_contended(cluster: &str) {
        counter!("k3ctl_lease_contended_total", "cluster" => cluster.to_string()).increment(1);
    }

    pub fn requeue_scheduled(cluster: &str, delay_seconds: u64) {
        histogram!("k3ctl_requeue_delay_seconds", "cluster" => cluster.to_string())
            .record(delay_seconds as f64);
    }
}
