//! Phased response emission for the success route.
//!
//! A response is delivered in three separately delayable stages so a client
//! can observe a configurable time-to-first-byte and a slow trailing body:
//!
//! ```text
//! sleep(header_delay)      -> status line + headers, flushed
//! sleep(first_byte_delay)  -> body[..1], flushed
//! sleep(last_byte_delay)   -> body[1..], flushed
//! ```
//!
//! Headers go out as soon as the handler returns the `Response`. The body is a
//! channel body fed by a writer task, and hyper flushes every chunk it takes
//! off the channel. The phase order is fixed by position, never by which
//! delay is shorter.

use crate::engine::counter::RequestCounter;
use bytes::Bytes;
use hyper::body::Sender;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Body, Response, StatusCode};
use std::time::Duration;
use tracing::debug;
use wy_common::TimingProfile;

pub const GREETING_PREFIX: &str = "Hello from okra example application.";
pub const NOT_FOUND_BODY: &str = "Not Found";
pub const SERVER_ERROR_BODY: &str = "Internal Server Error";

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";

/// Body served by the success route for request `id`.
pub fn greeting(id: u64) -> Bytes {
    Bytes::from(format!("{GREETING_PREFIX}: {id}"))
}

/// Splits a payload into the first-byte write and the remaining write.
///
/// A one byte payload yields an empty remainder, which is still written.
pub fn split_first_byte(payload: &Bytes) -> (Bytes, Bytes) {
    let at = payload.len().min(1);
    (payload.slice(..at), payload.slice(at..))
}

/// Serves the success route according to a fixed [`TimingProfile`].
#[derive(Debug, Default)]
pub struct TimingEngine {
    profile: TimingProfile,
    counter: RequestCounter,
}

impl TimingEngine {
    pub fn new(profile: TimingProfile) -> Self {
        Self {
            profile,
            counter: RequestCounter::new(),
        }
    }

    pub fn profile(&self) -> TimingProfile {
        self.profile
    }

    pub fn counter(&self) -> &RequestCounter {
        &self.counter
    }

    /// Handles one request on the success route.
    ///
    /// The returned future resolves after `header_delay`; the body keeps
    /// streaming in the background until the last phase has been written.
    pub async fn found(&self) -> Response<Body> {
        suspend(self.profile.header_delay).await;

        let (sender, body) = Body::channel();
        let id = self.counter.next_id();
        let payload = greeting(id);
        let profile = self.profile;

        tokio::spawn(async move {
            if let Err(e) = write_body_phases(sender, payload, profile).await {
                // Client went away mid-stream; the remaining phases are dropped.
                debug!(request_id = id, error = %e, "Phased write aborted");
            }
        });

        let mut response = Response::new(body);
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static(TEXT_PLAIN));
        response
    }
}

async fn write_body_phases(
    mut sender: Sender,
    payload: Bytes,
    profile: TimingProfile,
) -> Result<(), hyper::Error> {
    let (first, rest) = split_first_byte(&payload);

    suspend(profile.first_byte_delay).await;
    sender.send_data(first).await?;

    suspend(profile.last_byte_delay).await;
    sender.send_data(rest).await?;

    Ok(())
}

async fn suspend(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

/// Immediate 404 with a fixed body.
pub fn not_found() -> Response<Body> {
    fixed(StatusCode::NOT_FOUND, NOT_FOUND_BODY)
}

/// Immediate 500 with a fixed body.
pub fn server_error() -> Response<Body> {
    fixed(StatusCode::INTERNAL_SERVER_ERROR, SERVER_ERROR_BODY)
}

fn fixed(status: StatusCode, body: &'static str) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(TEXT_PLAIN));
    response
}
