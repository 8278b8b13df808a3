//! Prometheus metrics endpoint.

use crate::metrics::{Operation, LATENCY_BUCKETS_MS};
use crate::server::Relay;
use axum::{http::header::CONTENT_TYPE, response::IntoResponse, Extension};
use std::fmt::Write;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Prometheus metrics handler.
///
/// Returns metrics in Prometheus text format.
/// Includes gauges (current state), counters (monotonic since startup) and
/// one latency histogram per protocol operation.
pub async fn metrics_handler(Extension(relay): Extension<Arc<Relay>>) -> impl IntoResponse {
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        render(&relay),
    )
}

fn render(relay: &Relay) -> String {
    let m = relay.metrics();

    // Gauges: current state
    let sockets = relay.total_sessions();
    let rooms = relay.total_rooms();
    let store_healthy = u8::from(relay.store_health().is_healthy());
    let (join_budget, message_budget) = relay.rate_limits().budgets();

    // Counters: monotonic since startup
    let conns_total = m.connections_total.load(Ordering::Relaxed);
    let rate_limits = m.rate_limit_hits.load(Ordering::Relaxed);
    let migrations = m.key_migrations.load(Ordering::Relaxed);
    let reads_hit = m.config_reads_hit.load(Ordering::Relaxed);
    let reads_miss = m.config_reads_miss.load(Ordering::Relaxed);
    let queued = m.messages_queued.load(Ordering::Relaxed);
    let acks_removed = m.acks_removed.load(Ordering::Relaxed);
    let acks_unmatched = m.acks_unmatched.load(Ordering::Relaxed);
    let published = m.broadcasts_published.load(Ordering::Relaxed);
    let received = m.broadcasts_received.load(Ordering::Relaxed);
    let store_errors = m.store_errors.load(Ordering::Relaxed);

    let mut body = format!(
        r#"# HELP relay_sockets_active Number of connected sockets on this instance
# TYPE relay_sockets_active gauge
relay_sockets_active {sockets}

# HELP relay_rooms_active Number of rooms with a local member
# TYPE relay_rooms_active gauge
relay_rooms_active {rooms}

# HELP relay_info Server information
# TYPE relay_info gauge
relay_info{{version="{version}",backend="{backend}"}} 1

# HELP relay_store_healthy Whether the last store probe succeeded
# TYPE relay_store_healthy gauge
relay_store_healthy {store_healthy}

# HELP relay_rate_limit_budget Current requests allowed per window
# TYPE relay_rate_limit_budget gauge
relay_rate_limit_budget{{limiter="join"}} {join_budget}
relay_rate_limit_budget{{limiter="message"}} {message_budget}

# HELP relay_connections_total Total WebSocket connections accepted
# TYPE relay_connections_total counter
relay_connections_total {conns_total}

# HELP relay_rate_limit_hits_total Total rate limit rejections
# TYPE relay_rate_limit_hits_total counter
relay_rate_limit_hits_total {rate_limits}

# HELP relay_key_migrations_total Records moved from legacy keys to hash-tagged keys
# TYPE relay_key_migrations_total counter
relay_key_migrations_total {migrations}

# HELP relay_config_reads_total Channel config reads
# TYPE relay_config_reads_total counter
relay_config_reads_total{{result="hit"}} {reads_hit}
relay_config_reads_total{{result="miss"}} {reads_miss}

# HELP relay_messages_queued_total Messages appended to a pending queue
# TYPE relay_messages_queued_total counter
relay_messages_queued_total {queued}

# HELP relay_acks_total Acknowledgements handled
# TYPE relay_acks_total counter
relay_acks_total{{result="removed"}} {acks_removed}
relay_acks_total{{result="unmatched"}} {acks_unmatched}

# HELP relay_broadcasts_total Room broadcasts exchanged with other instances
# TYPE relay_broadcasts_total counter
relay_broadcasts_total{{direction="published"}} {published}
relay_broadcasts_total{{direction="received"}} {received}

# HELP relay_store_errors_total Store errors caught in handlers
# TYPE relay_store_errors_total counter
relay_store_errors_total {store_errors}
"#,
        version = env!("CARGO_PKG_VERSION"),
        backend = relay.store().backend(),
    );

    if let Some(pool) = relay.store().pool_state() {
        let _ = write!(
            body,
            r#"
# HELP relay_store_pool_connections Store pool connections by state
# TYPE relay_store_pool_connections gauge
relay_store_pool_connections{{state="idle"}} {}
relay_store_pool_connections{{state="in_use"}} {}
relay_store_pool_connections{{state="max"}} {}
"#,
            pool.idle, pool.in_use, pool.max_size
        );
    }

    body.push_str(
        "\n# HELP relay_operations_total Protocol operations by outcome\n\
         # TYPE relay_operations_total counter\n",
    );
    for op in Operation::ALL {
        let stats = m.operation(op);
        let _ = writeln!(
            body,
            "relay_operations_total{{operation=\"{}\",outcome=\"success\"}} {}",
            op.as_str(),
            stats.successes()
        );
        let _ = writeln!(
            body,
            "relay_operations_total{{operation=\"{}\",outcome=\"error\"}} {}",
            op.as_str(),
            stats.errors()
        );
    }

    body.push_str(
        "\n# HELP relay_operation_duration_seconds Protocol operation latency\n\
         # TYPE relay_operation_duration_seconds histogram\n",
    );
    for op in Operation::ALL {
        let stats = m.operation(op);
        let label = op.as_str();
        for (bound, count) in LATENCY_BUCKETS_MS.iter().zip(stats.cumulative_buckets()) {
            let _ = writeln!(
                body,
                "relay_operation_duration_seconds_bucket{{operation=\"{label}\",le=\"{}\"}} {count}",
                *bound as f64 / 1000.0
            );
        }
        let _ = writeln!(
            body,
            "relay_operation_duration_seconds_bucket{{operation=\"{label}\",le=\"+Inf\"}} {}",
            stats.count()
        );
        let _ = writeln!(
            body,
            "relay_operation_duration_seconds_sum{{operation=\"{label}\"}} {}",
            stats.sum_seconds()
        );
        let _ = writeln!(
            body,
            "relay_operation_duration_seconds_count{{operation=\"{label}\"}} {}",
            stats.count()
        );
    }

    body
}
