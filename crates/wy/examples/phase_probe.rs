use hyper::body::HttpBody;
use hyper::{Client, Uri};
use std::time::Instant;

/// Measures header, first-byte and last-byte latency of one request.
///
/// Run a target first, e.g.
/// `wy serve --delay-header-first-byte 200ms --delay-body-first-byte 300ms --delay-body-last-byte 1s`
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let target: Uri = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "http://127.0.0.1:8080/".to_string())
        .parse()?;
    let client = Client::new();

    println!("Probing {}", target);

    let started = Instant::now();
    let response = client.get(target).await?;
    let headers_at = started.elapsed();
    println!("[headers]    {:>8.1?}  status {}", headers_at, response.status());

    let mut body = response.into_body();
    let mut received = Vec::new();
    let mut chunk_no = 0;
    while let Some(chunk) = body.data().await {
        let chunk = chunk?;
        chunk_no += 1;
        println!(
            "[chunk {:>2}]   {:>8.1?}  {} bytes",
            chunk_no,
            started.elapsed(),
            chunk.len()
        );
        received.extend_from_slice(&chunk);
    }

    println!("[complete]   {:>8.1?}", started.elapsed());
    println!("{}", String::from_utf8_lossy(&received));
    Ok(())
}
