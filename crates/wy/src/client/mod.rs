//! Sequential request repetition against a single target.
//!
//! One request is in flight at a time. The generator waits for the complete
//! response before sleeping for the interval and moving on, and the first
//! transport failure ends the run. A non-2xx status is just an outcome.

use bytes::Bytes;
use hyper::client::HttpConnector;
use hyper::{Body, Client, Method, Request, StatusCode, Uri};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wy_common::ClientConfig;

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("invalid target url {url:?}: {reason}")]
    InvalidTarget { url: String, reason: String },
    #[error("request {attempt} to {url} failed: {source}")]
    Transport {
        url: Uri,
        attempt: u64,
        #[source]
        source: hyper::Error,
    },
    #[error("request {attempt} to {url} timed out after {after:?}")]
    Timeout {
        url: Uri,
        attempt: u64,
        after: Duration,
    },
    #[error("failed to write response body: {0}")]
    Output(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repetition {
    Fixed(u64),
    Unbounded,
}

impl Repetition {
    /// `forever` wins over `count`.
    pub fn from_flags(count: u64, forever: bool) -> Self {
        if forever {
            Repetition::Unbounded
        } else {
            Repetition::Fixed(count)
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoadPlan {
    pub target: Uri,
    pub repetition: Repetition,
    /// Pause between consecutive requests, never before the first or after the last.
    pub interval: Duration,
    pub print_body: bool,
    pub timeout: Option<Duration>,
}

impl LoadPlan {
    pub fn new(target: &str, repetition: Repetition) -> Result<Self, LoadError> {
        Ok(Self {
            target: parse_target(target)?,
            repetition,
            interval: Duration::ZERO,
            print_body: true,
            timeout: None,
        })
    }

    /// The single-shot form: one request, no interval.
    pub fn single(target: &str, print_body: bool) -> Result<Self, LoadError> {
        Ok(Self {
            print_body,
            ..Self::new(target, Repetition::Fixed(1))?
        })
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self, LoadError> {
        Ok(Self {
            target: parse_target(&config.url)?,
            repetition: Repetition::from_flags(config.count, config.forever),
            interval: config.interval,
            print_body: config.print_body,
            timeout: config.timeout,
        })
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn print_body(mut self, print_body: bool) -> Self {
        self.print_body = print_body;
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_target(mut self, target: Uri) -> Self {
        self.target = target;
        self
    }
}

fn parse_target(url: &str) -> Result<Uri, LoadError> {
    let invalid = |reason: String| LoadError::InvalidTarget {
        url: url.to_string(),
        reason,
    };

    let uri: Uri = url.parse().map_err(|e: hyper::http::uri::InvalidUri| invalid(e.to_string()))?;
    match uri.scheme_str() {
        Some("http") => {}
        Some(other) => return Err(invalid(format!("unsupported scheme {other:?}"))),
        None => return Err(invalid("missing scheme".to_string())),
    }
    if uri.authority().is_none() {
        return Err(invalid("missing host".to_string()));
    }
    Ok(uri)
}

/// Result of one completed request.
#[derive(Debug)]
pub struct RequestOutcome {
    pub status: StatusCode,
    pub body: Bytes,
    pub elapsed: Duration,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub issued: u64,
    pub by_status: BTreeMap<u16, u64>,
    /// The run stopped at a cancellation point rather than by exhausting its plan.
    pub cancelled: bool,
}

pub struct LoadGenerator {
    client: Client<HttpConnector, Body>,
    cancel: CancellationToken,
}

impl LoadGenerator {
    pub fn new(cancel: CancellationToken) -> Self {
        Self::with_client(Client::new(), cancel)
    }

    pub fn with_client(client: Client<HttpConnector, Body>, cancel: CancellationToken) -> Self {
        Self { client, cancel }
    }

    /// Executes `plan`, writing each body followed by a newline to `out`
    /// when the plan asks for it.
    pub async fn run<W>(&self, plan: &LoadPlan, out: &mut W) -> Result<RunSummary, LoadError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut summary = RunSummary::default();

        debug!(url = %plan.target, repetition = ?plan.repetition, interval = ?plan.interval, "Starting run");

        loop {
            if let Repetition::Fixed(count) = plan.repetition {
                if summary.issued >= count {
                    break;
                }
            }

            if summary.issued > 0 && !plan.interval.is_zero() {
                if self.cancel.is_cancelled() {
                    summary.cancelled = true;
                    break;
                }
                let interrupted = tokio::select! {
                    _ = tokio::time::sleep(plan.interval) => false,
                    _ = self.cancel.cancelled() => true,
                };
                if interrupted {
                    summary.cancelled = true;
                    break;
                }
            }

            if self.cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }

            let attempt = summary.issued + 1;
            let outcome = self.fetch(plan, attempt).await?;
            summary.issued = attempt;
            *summary.by_status.entry(outcome.status.as_u16()).or_default() += 1;

            if !outcome.status.is_success() {
                warn!(attempt, status = outcome.status.as_u16(), "Non-success status");
            }
            debug!(attempt, status = outcome.status.as_u16(), elapsed = ?outcome.elapsed, "Request completed");

            if plan.print_body {
                out.write_all(&outcome.body).await?;
                out.write_all(b"\n").await?;
                out.flush().await?;
            }
        }

        info!(
            issued = summary.issued,
            cancelled = summary.cancelled,
            statuses = ?summary.by_status,
            "Run finished"
        );
        Ok(summary)
    }

    /// Issues one GET and reads the full response.
    pub async fn fetch(&self, plan: &LoadPlan, attempt: u64) -> Result<RequestOutcome, LoadError> {
        let started = Instant::now();
        let exchange = self.exchange(&plan.target, attempt);

        let (status, body) = match plan.timeout {
            Some(after) => timeout(after, exchange).await.map_err(|_| LoadError::Timeout {
                url: plan.target.clone(),
                attempt,
                after,
            })??,
            None => exchange.await?,
        };

        Ok(RequestOutcome {
            status,
            body,
            elapsed: started.elapsed(),
        })
    }

    async fn exchange(&self, target: &Uri, attempt: u64) -> Result<(StatusCode, Bytes), LoadError> {
        let transport = |source: hyper::Error| LoadError::Transport {
            url: target.clone(),
            attempt,
            source,
        };

        let req = Request::builder()
            .method(Method::GET)
            .uri(target.clone())
            .body(Body::empty())
            .map_err(|e| LoadError::InvalidTarget {
                url: target.to_string(),
                reason: e.to_string(),
            })?;

        let response = self.client.request(req).await.map_err(transport)?;
        let status = response.status();
        // Drained even when not printed so the pooled connection can be reused.
        let body = hyper::body::to_bytes(response.into_body())
            .await
            .map_err(transport)?;

        Ok((status, body))
    }
}
