#![allow(dead_code)]

use prometheus::proto::Metric;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use wy::engine::timing::TimingEngine;
use wy::metrics::MetricsRegistry;
use wy::{App, TargetServer};
use wy_common::TimingProfile;

pub fn app(profile: TimingProfile) -> App {
    App::new(
        TimingEngine::new(profile),
        MetricsRegistry::new("test").expect("metrics registry"),
    )
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub app: Arc<App>,
    shutdown: CancellationToken,
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

pub async fn spawn_server(profile: TimingProfile, h2c: bool) -> TestServer {
    let server = TargetServer::bind_app("127.0.0.1:0".parse().unwrap(), h2c, app(profile))
        .expect("bind test server");
    let addr = server.local_addr().unwrap();
    let app = server.app();
    let shutdown = CancellationToken::new();
    tokio::spawn(server.run(shutdown.clone()));
    TestServer {
        addr,
        app,
        shutdown,
    }
}

fn has_labels(metric: &Metric, expected: &[(&str, &str)]) -> bool {
    expected.iter().all(|(name, value)| {
        metric
            .get_label()
            .iter()
            .any(|l| l.get_name() == *name && l.get_value() == *value)
    })
}

pub fn request_count(metrics: &MetricsRegistry, code: &str, method: &str) -> u64 {
    metrics
        .gather()
        .iter()
        .filter(|f| f.get_name() == "http_requests_total")
        .flat_map(|f| f.get_metric().iter())
        .filter(|m| has_labels(m, &[("code", code), ("method", method)]))
        .map(|m| m.get_counter().get_value() as u64)
        .sum()
}

pub fn duration_samples(metrics: &MetricsRegistry, code: &str, handler: &str, method: &str) -> (u64, f64) {
    metrics
        .gather()
        .iter()
        .filter(|f| f.get_name() == "http_request_duration_seconds")
        .flat_map(|f| f.get_metric().iter())
        .filter(|m| has_labels(m, &[("code", code), ("handler", handler), ("method", method)]))
        .map(|m| {
            let h = m.get_histogram();
            (h.get_sample_count(), h.get_sample_sum())
        })
        .fold((0, 0.0), |(count, sum), (c, s)| (count + c, sum + s))
}
