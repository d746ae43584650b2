// src/services/fetcher.rs

//! Bounded-concurrency HTTP fetcher.
//!
//! One `Fetcher` is created per detection run and owns its HTTP client;
//! the semaphore it shares with the rest of the process bounds in-flight
//! requests globally. Every failure surfaces as a typed [`FetchError`],
//! never as a raw transport error.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};

use crate::config::{GlobalOptions, ProxyConfig};
use crate::error::{FetchError, Result};
use crate::utils::host_of;

/// Redirect cap; the final URL after redirects is reported to the caller.
const MAX_REDIRECTS: usize = 10;

/// Exponential backoff with symmetric jitter for transient retries.
struct ExponentialBackoff {
    base_ms: u64,
    max_ms: u64,
    jitter_percent: u64,
}

impl ExponentialBackoff {
    const fn new(base_ms: u64, max_ms: u64) -> Self {
        Self {
            base_ms,
            max_ms,
            jitter_percent: 25,
        }
    }

    #[cfg(test)]
    fn without_jitter(mut self) -> Self {
        self.jitter_percent = 0;
        self
    }

    fn delay(&self, attempt: u32) -> Duration {
        let exponential = self.base_ms.saturating_mul(2u64.saturating_pow(attempt.min(16)));
        let capped = exponential.min(self.max_ms);
        if self.jitter_percent == 0 {
            return Duration::from_millis(capped);
        }
        let spread = capped * self.jitter_percent / 100;
        let low = capped.saturating_sub(spread);
        let high = capped.saturating_add(spread);
        Duration::from_millis(rand::thread_rng().gen_range(low..=high))
    }
}

/// Append-only fetch counters, readable while runs are in flight.
#[derive(Debug, Default)]
pub struct FetchMetrics {
    attempted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time copy of the fetch counters.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct FetchMetricsSnapshot {
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
}

impl FetchMetrics {
    fn snapshot(&self) -> FetchMetricsSnapshot {
        FetchMetricsSnapshot {
            attempted: self.attempted.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// A successfully fetched response.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub requested_url: String,

    /// URL after following redirects; differs from `requested_url` when the
    /// server canonicalized the address
    pub final_url: String,

    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl FetchedPage {
    /// Body decoded as UTF-8, lossily.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

struct ProxyRotation {
    control_addr: Option<String>,
    control_password: Option<String>,
    rotate_every: usize,
    successes: AtomicUsize,
}

/// HTTP fetcher with a global concurrency bound, soft per-host pacing,
/// transient-failure retries, and optional SOCKS proxy routing.
pub struct Fetcher {
    client: Client,

    /// Present only when a proxy is configured with direct fallback allowed
    direct_client: Option<Client>,

    semaphore: Arc<Semaphore>,
    per_host_delay: Duration,
    host_gate: Mutex<HashMap<String, Instant>>,
    backoff: ExponentialBackoff,
    retry_attempts: u32,
    max_body_bytes: usize,
    metrics: FetchMetrics,
    proxy: Option<ProxyRotation>,
}

impl Fetcher {
    /// Create a fetcher for one run, sharing the process-wide semaphore.
    pub fn new(
        options: &GlobalOptions,
        proxy: Option<&ProxyConfig>,
        semaphore: Arc<Semaphore>,
    ) -> Result<Self> {
        let client = Self::build_client(options, proxy)?;
        let direct_client = match proxy {
            Some(p) if p.allow_direct_fallback => Some(Self::build_client(options, None)?),
            _ => None,
        };

        Ok(Self {
            client,
            direct_client,
            semaphore,
            per_host_delay: options.per_host_delay(),
            host_gate: Mutex::new(HashMap::new()),
            backoff: ExponentialBackoff::new(options.retry_base_ms, 30_000),
            retry_attempts: options.retry_attempts.max(1),
            max_body_bytes: options.max_body_bytes,
            metrics: FetchMetrics::default(),
            proxy: proxy.map(|p| ProxyRotation {
                control_addr: p.control_addr.clone(),
                control_password: p.control_password.clone(),
                rotate_every: p.rotate_every,
                successes: AtomicUsize::new(0),
            }),
        })
    }

    fn build_client(options: &GlobalOptions, proxy: Option<&ProxyConfig>) -> Result<Client> {
        let mut builder = Client::builder()
            .user_agent(&options.user_agent)
            .timeout(options.fetch_timeout())
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS));

        if let Some(p) = proxy {
            builder = builder.proxy(reqwest::Proxy::all(&p.socks_addr)?);
        }

        Ok(builder.build()?)
    }

    /// Current fetch counters.
    pub fn metrics(&self) -> FetchMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Fetch a URL under the global semaphore, retrying transient failures.
    pub async fn fetch(&self, url: &str) -> std::result::Result<FetchedPage, FetchError> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .expect("fetch semaphore closed");

        self.pace_host(url).await;
        self.metrics.attempted.fetch_add(1, Ordering::Relaxed);

        let mut attempt = 0u32;
        loop {
            match self.fetch_once(&self.client, url).await {
                Ok(page) => {
                    self.metrics.succeeded.fetch_add(1, Ordering::Relaxed);
                    self.note_success().await;
                    return Ok(page);
                }
                Err(err) if err.is_transient() && attempt + 1 < self.retry_attempts => {
                    let delay = self.backoff.delay(attempt);
                    debug!(url, attempt, ?delay, error = %err, "retrying transient fetch failure");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err @ FetchError::ConnectionRefused) => {
                    if let Some(direct) = &self.direct_client {
                        warn!(url, "proxy connection failed, falling back to direct");
                        let outcome = self.fetch_once(direct, url).await;
                        match &outcome {
                            Ok(_) => self.metrics.succeeded.fetch_add(1, Ordering::Relaxed),
                            Err(_) => self.metrics.failed.fetch_add(1, Ordering::Relaxed),
                        };
                        return outcome;
                    }
                    self.metrics.failed.fetch_add(1, Ordering::Relaxed);
                    return Err(err);
                }
                Err(err) => {
                    self.metrics.failed.fetch_add(1, Ordering::Relaxed);
                    return Err(err);
                }
            }
        }
    }

    async fn fetch_once(
        &self,
        client: &Client,
        url: &str,
    ) -> std::result::Result<FetchedPage, FetchError> {
        let response = client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(&e))?;

        let status = response.status().as_u16();
        if (400..500).contains(&status) {
            return Err(FetchError::HttpClient(status));
        }
        if status >= 500 {
            return Err(FetchError::HttpServer(status));
        }

        if let Some(length) = response.content_length() {
            if length as usize > self.max_body_bytes {
                return Err(FetchError::TooLarge {
                    limit: self.max_body_bytes,
                });
            }
        }

        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());

        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::from_reqwest(&e))?;
        if body.len() > self.max_body_bytes {
            return Err(FetchError::TooLarge {
                limit: self.max_body_bytes,
            });
        }

        Ok(FetchedPage {
            requested_url: url.to_string(),
            final_url,
            status,
            content_type,
            body: body.to_vec(),
        })
    }

    /// Enforce minimum spacing between request starts against one host.
    async fn pace_host(&self, url: &str) {
        if self.per_host_delay.is_zero() {
            return;
        }
        let Some(host) = host_of(url) else { return };

        let wait = {
            let mut gate = self.host_gate.lock().await;
            let now = Instant::now();
            let start = match gate.get(&host) {
                Some(last) => (*last + self.per_host_delay).max(now),
                None => now,
            };
            gate.insert(host, start);
            start.saturating_duration_since(now)
        };

        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    /// Track successful fetches for proxy identity rotation.
    async fn note_success(&self) {
        let Some(rotation) = &self.proxy else { return };
        if rotation.rotate_every == 0 {
            return;
        }
        let count = rotation.successes.fetch_add(1, Ordering::Relaxed) + 1;
        if count % rotation.rotate_every != 0 {
            return;
        }
        let Some(addr) = &rotation.control_addr else {
            return;
        };
        match rotate_identity(addr, rotation.control_password.as_deref()).await {
            Ok(()) => info!(fetches = count, "tor identity rotated"),
            Err(e) => warn!(error = %e, "tor identity rotation failed"),
        }
    }
}

/// Request a fresh Tor circuit via the control port.
async fn rotate_identity(control_addr: &str, password: Option<&str>) -> std::io::Result<()> {
    let mut stream = TcpStream::connect(control_addr).await?;

    let auth = format!("AUTHENTICATE \"{}\"\r\n", password.unwrap_or(""));
    stream.write_all(auth.as_bytes()).await?;
    expect_ok(&mut stream, "authentication").await?;

    stream.write_all(b"SIGNAL NEWNYM\r\n").await?;
    expect_ok(&mut stream, "NEWNYM signal").await?;

    Ok(())
}

async fn expect_ok(stream: &mut TcpStream, context: &str) -> std::io::Result<()> {
    let mut buf = [0u8; 256];
    let n = stream.read(&mut buf).await?;
    let reply = String::from_utf8_lossy(&buf[..n]);
    if reply.starts_with("250") {
        Ok(())
    } else {
        Err(std::io::Error::other(format!(
            "tor control {context} rejected: {}",
            reply.trim()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_exponential_growth() {
        let backoff = ExponentialBackoff::new(1000, 30_000).without_jitter();
        assert_eq!(backoff.delay(0).as_millis(), 1000);
        assert_eq!(backoff.delay(1).as_millis(), 2000);
        assert_eq!(backoff.delay(2).as_millis(), 4000);
    }

    #[test]
    fn test_backoff_cap() {
        let backoff = ExponentialBackoff::new(1000, 8000).without_jitter();
        assert_eq!(backoff.delay(10).as_millis(), 8000);
    }

    #[test]
    fn test_backoff_jitter_bounds() {
        let backoff = ExponentialBackoff::new(1000, 30_000);
        for _ in 0..50 {
            let ms = backoff.delay(0).as_millis() as u64;
            assert!((750..=1250).contains(&ms), "jittered delay {ms} out of range");
        }
    }

    #[test]
    fn test_fetcher_construction() {
        let fetcher = Fetcher::new(
            &GlobalOptions::default(),
            None,
            Arc::new(Semaphore::new(4)),
        )
        .unwrap();
        assert!(fetcher.direct_client.is_none());
        assert_eq!(fetcher.metrics().attempted, 0);
    }

    #[test]
    fn test_fetched_page_text() {
        let page = FetchedPage {
            requested_url: "https://example.com".to_string(),
            final_url: "https://example.com/".to_string(),
            status: 200,
            content_type: Some("text/html".to_string()),
            body: b"hello".to_vec(),
        };
        assert_eq!(page.text(), "hello");
    }
}
