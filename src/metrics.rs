use std::process::Command;
use std::sync::Arc;
use std::thread;

use prometheus::{Encoder, GaugeVec, Opts, Registry, TextEncoder};
use serde::Deserialize;
use sysinfo::Networks;
use tiny_http::{Response, Server};

#[derive(Debug, Deserialize)]
struct NftOutput {
    nftables: Vec<NftObject>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
#[allow(dead_code)]
enum NftObject {
    Rule { rule: NftRule },
    Other(serde_json::Value),
}

#[derive(Debug, Deserialize)]
struct NftRule {
    table: String,
    expr: Vec<NftExpr>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
#[allow(dead_code)]
enum NftExpr {
    Counter { counter: Counter },
    Queue { queue: Queue },
    Other(serde_json::Value),
}

#[derive(Debug, Deserialize)]
struct Counter {
    packets: u64,
    bytes: u64,
}

#[derive(Debug, Deserialize)]
struct Queue {
    num: u16,
}

/// Counter readings for a single NFQUEUE rule.
struct RuleMetrics {
    queue: u16,
    matched_packets: u64,
    matched_bytes: u64,
}

/// Read the per-rule packet counters back out of the kernel table. Rules
/// are identified by their queue number. Returns nothing when the table
/// is absent (daemon stopped, or iptables backend in use).
fn collect_nft_metrics(table_name: &str) -> Vec<RuleMetrics> {
    let output = Command::new("nft")
        .args(["-j", "list", "table", "inet", table_name])
        .output();

    let output = match output {
        Ok(o) if o.status.success() => o,
        _ => return Vec::new(),
    };

    let json_str = String::from_utf8_lossy(&output.stdout);
    let nft_output: NftOutput = match serde_json::from_str(&json_str) {
        Ok(o) => o,
        Err(_) => return Vec::new(),
    };

    let mut metrics = Vec::new();

    for obj in nft_output.nftables {
        let NftObject::Rule { rule } = obj else {
            continue;
        };
        if rule.table != table_name {
            continue;
        }

        let mut counter = None;
        let mut queue = None;
        for expr in &rule.expr {
            match expr {
                NftExpr::Counter { counter: c } => counter = Some(c),
                NftExpr::Queue { queue: q } => queue = Some(q.num),
                NftExpr::Other(_) => {}
            }
        }

        if let (Some(counter), Some(queue)) = (counter, queue) {
            metrics.push(RuleMetrics {
                queue,
                matched_packets: counter.packets,
                matched_bytes: counter.bytes,
            });
        }
    }

    metrics
}

/// Start the Prometheus exporter on the given port. Gauges are refreshed
/// on every scrape.
pub fn start_server(port: u16, table_name: String) {
    let addr = format!("0.0.0.0:{port}");

    let registry = Arc::new(Registry::new());

    let matched_packets = GaugeVec::new(
        Opts::new(
            "zapret_rule_matched_packets_total",
            "Packets diverted to the NFQUEUE rule",
        ),
        &["queue"],
    )
    .expect("valid metric opts");

    let matched_bytes = GaugeVec::new(
        Opts::new(
            "zapret_rule_matched_bytes_total",
            "Bytes diverted to the NFQUEUE rule",
        ),
        &["queue"],
    )
    .expect("valid metric opts");

    let net_rx_bytes = GaugeVec::new(
        Opts::new(
            "network_receive_bytes_total",
            "Total bytes received on network interface",
        ),
        &["interface"],
    )
    .expect("valid metric opts");

    let net_tx_bytes = GaugeVec::new(
        Opts::new(
            "network_transmit_bytes_total",
            "Total bytes transmitted on network interface",
        ),
        &["interface"],
    )
    .expect("valid metric opts");

    for gauge in [&matched_packets, &matched_bytes, &net_rx_bytes, &net_tx_bytes] {
        registry
            .register(Box::new(gauge.clone()))
            .expect("metric registers once");
    }

    thread::spawn(move || {
        let server = match Server::http(&addr) {
            Ok(s) => s,
            Err(err) => {
                tracing::error!(error = %err, "failed to start metrics server");
                return;
            }
        };

        tracing::info!(address = %addr, "metrics server listening");

        for request in server.incoming_requests() {
            if request.url() != "/metrics" {
                let _ = request.respond(Response::from_string("Not Found").with_status_code(404));
                continue;
            }

            matched_packets.reset();
            matched_bytes.reset();
            net_rx_bytes.reset();
            net_tx_bytes.reset();

            for m in collect_nft_metrics(&table_name) {
                let queue = m.queue.to_string();
                matched_packets
                    .with_label_values(&[queue.as_str()])
                    .set(m.matched_packets as f64);
                matched_bytes
                    .with_label_values(&[queue.as_str()])
                    .set(m.matched_bytes as f64);
            }

            let networks = Networks::new_with_refreshed_list();
            for (name, data) in &networks {
                net_rx_bytes
                    .with_label_values(&[name.as_str()])
                    .set(data.total_received() as f64);
                net_tx_bytes
                    .with_label_values(&[name.as_str()])
                    .set(data.total_transmitted() as f64);
            }

            let encoder = TextEncoder::new();
            let families = registry.gather();
            let mut buffer = Vec::new();
            if encoder.encode(&families, &mut buffer).is_err() {
                let _ = request.respond(Response::from_string("").with_status_code(500));
                continue;
            }

            let response = Response::from_data(buffer).with_header(
                tiny_http::Header::from_bytes(
                    &b"Content-Type"[..],
                    encoder.format_type().as_bytes(),
                )
                .expect("static header is valid"),
            );
            let _ = request.respond(response);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nft_json_rules_parse_queue_and_counter() {
        let json = r#"{
            "nftables": [
                {"metainfo": {"version": "1.0.9"}},
                {"table": {"family": "inet", "name": "zapretunix"}},
                {"chain": {"family": "inet", "table": "zapretunix", "name": "output"}},
                {"rule": {
                    "family": "inet",
                    "table": "zapretunix",
                    "chain": "output",
                    "handle": 2,
                    "comment": "Added by zapret",
                    "expr": [
                        {"match": {"op": "==", "left": {"payload": {"protocol": "tcp", "field": "dport"}}, "right": 443}},
                        {"counter": {"packets": 120, "bytes": 8400}},
                        {"queue": {"num": 0, "flags": "bypass"}}
                    ]
                }}
            ]
        }"#;

        let parsed: NftOutput = serde_json::from_str(json).unwrap();
        let rules: Vec<_> = parsed
            .nftables
            .iter()
            .filter(|o| matches!(o, NftObject::Rule { .. }))
            .collect();
        assert_eq!(rules.len(), 1);

        let NftObject::Rule { rule } = rules[0] else {
            unreachable!();
        };
        assert_eq!(rule.table, "zapretunix");

        let counter = rule.expr.iter().find_map(|e| match e {
            NftExpr::Counter { counter } => Some(counter),
            _ => None,
        });
        let queue = rule.expr.iter().find_map(|e| match e {
            NftExpr::Queue { queue } => Some(queue.num),
            _ => None,
        });
        assert_eq!(counter.unwrap().packets, 120);
        assert_eq!(queue, Some(0));
    }

    #[test]
    fn missing_table_yields_no_metrics() {
        let metrics = collect_nft_metrics("definitely_not_a_real_table");
        assert!(metrics.is_empty());
    }
}
