use futures::Stream;
use hyper::body::HttpBody;
use hyper::{Body, Method, Response};
use pin_project_lite::pin_project;
use prometheus::proto::MetricFamily;
use prometheus::{
    Encoder, Gauge, Histogram, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry,
    TextEncoder,
};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

/// Per-process request metrics.
///
/// Built once at startup and shared by every route. Aggregates only grow;
/// nothing is evicted until the process exits.
pub struct MetricsRegistry {
    registry: Registry,
    requests_total: IntCounterVec,
    request_duration: HistogramVec,
}

impl MetricsRegistry {
    pub fn new(app_version: &str) -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("http_requests_total", "Count of all HTTP requests"),
            &["code", "method"],
        )?;
        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                "http_request_duration_seconds",
                "Duration of all HTTP requests",
            ),
            &["code", "handler", "method"],
        )?;
        let version = Gauge::with_opts(
            Opts::new("version", "Version information about this binary")
                .const_label("version", app_version),
        )?;
        version.set(1.0);

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(request_duration.clone()))?;
        registry.register(Box::new(version))?;

        Ok(Self {
            registry,
            requests_total,
            request_duration,
        })
    }

    /// Runs `handler` and records its outcome.
    ///
    /// The request counter is attributed to the status the handler actually
    /// produced. With a `duration_label`, the response body is wrapped so the
    /// elapsed time is observed once the last body chunk has been handed to
    /// the connection, or when the body is dropped early.
    pub async fn instrument<F>(
        &self,
        duration_label: Option<&'static str>,
        method: &Method,
        handler: F,
    ) -> Response<Body>
    where
        F: Future<Output = Response<Body>>,
    {
        let started = Instant::now();
        let response = handler.await;

        let code = response.status().as_u16().to_string();
        let method = method.as_str();
        self.requests_total
            .with_label_values(&[code.as_str(), method])
            .inc();

        let Some(label) = duration_label else {
            return response;
        };

        let histogram = self
            .request_duration
            .with_label_values(&[code.as_str(), label, method]);
        let (parts, body) = response.into_parts();
        let body = Body::wrap_stream(TimedBody::new(body, histogram, started));
        Response::from_parts(parts, body)
    }

    pub fn gather(&self) -> Vec<MetricFamily> {
        self.registry.gather()
    }

    /// Text exposition of every registered metric.
    pub fn render(&self) -> String {
        let metric_families = self.registry.gather();
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();

        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            return format!("# Error encoding metrics: {}", e);
        }

        String::from_utf8(buffer).unwrap_or_else(|_| "# Error: Invalid UTF8".to_string())
    }
}

struct DurationObservation {
    histogram: Histogram,
    started: Instant,
    observed: bool,
}

impl DurationObservation {
    fn observe(&mut self) {
        if !self.observed {
            self.observed = true;
            self.histogram
                .observe(self.started.elapsed().as_secs_f64());
        }
    }
}

impl Drop for DurationObservation {
    fn drop(&mut self) {
        self.observe();
    }
}

pin_project! {
    /// Forwards every chunk of `inner` unchanged and records the request
    /// duration when the stream ends.
    struct TimedBody {
        #[pin]
        inner: Body,
        observation: DurationObservation,
    }
}

impl TimedBody {
    fn new(inner: Body, histogram: Histogram, started: Instant) -> Self {
        Self {
            inner,
            observation: DurationObservation {
                histogram,
                started,
                observed: false,
            },
        }
    }
}

impl Stream for TimedBody {
    type Item = Result<bytes::Bytes, hyper::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        let polled = this.inner.poll_data(cx);
        if let Poll::Ready(None) = polled {
            this.observation.observe();
        }
        polled
    }
}
