//! Prometheus text exposition of the metrics registry

use std::fmt::Write;

use crate::tracing::metrics::Metrics;

/// Export metrics in Prometheus text format
///
/// Histograms are exported as summaries over their retained window.
pub fn export_prometheus(metrics: &Metrics) -> String {
    let mut output = String::new();

    let mut counters: Vec<_> = metrics.all_counters().into_iter().collect();
    counters.sort_by(|a, b| a.0.cmp(&b.0));
    for (name, value) in counters {
        let _ = writeln!(&mut output, "# TYPE {name} counter\n{name} {value}");
    }

    let mut gauges: Vec<_> = metrics.all_gauges().into_iter().collect();
    gauges.sort_by(|a, b| a.0.cmp(&b.0));
    for (name, value) in gauges {
        let _ = writeln!(&mut output, "# TYPE {name} gauge\n{name} {value}");
    }

    let mut histograms: Vec<_> = metrics.all_histograms().into_iter().collect();
    histograms.sort_by(|a, b| a.0.cmp(&b.0));
    for (name, stats) in histograms {
        let _ = writeln!(&mut output, "# TYPE {name} summary");
        let _ = writeln!(&mut output, "{name}{{quantile=\"0.5\"}} {}", stats.p50);
        let _ = writeln!(&mut output, "{name}{{quantile=\"0.9\"}} {}", stats.p90);
        let _ = writeln!(&mut output, "{name}{{quantile=\"0.99\"}} {}", stats.p99);
        let _ = writeln!(&mut output, "{name}_sum {}", stats.sum);
        let _ = writeln!(&mut output, "{name}_count {}", stats.count);
    }

    output
}

/// Export global metrics in Prometheus format
pub fn prometheus_format() -> String {
    export_prometheus(crate::tracing::metrics::global())
}

/// JSON snapshot of the registry, used by health endpoints
pub fn create_metrics_snapshot(metrics: &Metrics) -> serde_json::Value {
    serde_json::json!({
        "counters": metrics.all_counters(),
        "gauges": metrics.all_gauges(),
        "histograms": metrics.all_histograms().into_iter().map(|(k, v)| {
            (k, serde_json::json!({
                "count": v.count,
                "sum": v.sum,
                "mean": v.mean,
                "p50": v.p50,
                "p99": v.p99,
            }))
        }).collect::<serde_json::Map<_, _>>(),
    })
}
