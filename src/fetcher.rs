//! Conditional HTTP fetcher.
//!
//! Single-URL GET against the cache slot: sends `If-None-Match` /
//! `If-Modified-Since` from the sidecar, persists 2xx bodies back into the
//! store, retries 429/503/5xx and transport failures with jittered backoff,
//! honors `Retry-After`, and recovers once from a 412 validator rejection.

use rand::rngs::OsRng;
use rand::Rng;
use reqwest::header::{HeaderMap, ACCEPT, IF_MODIFIED_SINCE, IF_NONE_MATCH, RETRY_AFTER};
use thiserror::Error;

use crate::data_structures::{utc_now_string, DebugPolicy, JitterMode, RetryPolicy};
use crate::store::{sha256_hex, BlobStore, StoredMeta, StreamError};

const ERROR_BODY_PREVIEW: usize = 200;

/// Outcome classes of a single fetch. The retry loop only ever re-enters on
/// `Retryable` and `Transport`; everything else surfaces to the caller.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP {status} retryable for {url}: {detail}")]
    Retryable {
        status: u16,
        url: String,
        retry_after: Option<f64>,
        detail: String,
    },
    #[error("HTTP {status} for {url}: {detail}")]
    Fatal {
        status: u16,
        url: String,
        detail: String,
    },
    #[error("transport error for {url}: {detail}")]
    Transport {
        url: String,
        timeout: bool,
        detail: String,
    },
    #[error("no cached copy of {url} to satisfy a 304 response")]
    CacheMiss { url: String },
    #[error("storage failure: {0}")]
    Storage(#[from] std::io::Error),
    #[error("failed fetching {url} after {attempts} attempts: {source}")]
    Exhausted {
        url: String,
        attempts: u32,
        #[source]
        source: Box<FetchError>,
    },
}

impl FetchError {
    /// Ledger `error_type` bucket for this failure.
    pub fn error_type(&self) -> &'static str {
        match self {
            FetchError::Transport { timeout: true, .. } => "timeout",
            FetchError::Retryable { .. } | FetchError::Fatal { .. } => "http",
            FetchError::Exhausted { source, .. } => source.error_type(),
            _ => "client",
        }
    }

    /// HTTP status carried by the failure, when there is one.
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::Retryable { status, .. } | FetchError::Fatal { status, .. } => {
                Some(*status)
            }
            FetchError::Exhausted { source, .. } => source.status(),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            FetchError::Transport { timeout, .. } => *timeout,
            FetchError::Exhausted { source, .. } => source.is_timeout(),
            _ => false,
        }
    }
}

/// Result of a successful fetch. `bytes` is None when the body was streamed
/// to disk, and may be None on a 304 with an empty cache slot: callers that
/// need the payload fall back to the slot themselves.
#[derive(Debug)]
pub struct FetchOutput {
    pub bytes: Option<Vec<u8>>,
    pub meta: StoredMeta,
    pub status: u16,
    pub headers: HeaderMap,
}

#[derive(Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    store: BlobStore,
    retry: RetryPolicy,
    debug: DebugPolicy,
}

impl Fetcher {
    pub fn new(
        client: reqwest::Client,
        store: BlobStore,
        retry: RetryPolicy,
        debug: DebugPolicy,
    ) -> Self {
        Fetcher {
            client,
            store,
            retry,
            debug,
        }
    }

    /// Fetch a URL under the conditional-cache discipline.
    pub async fn fetch(
        &self,
        url: &str,
        accept: &str,
        return_bytes: bool,
    ) -> Result<FetchOutput, FetchError> {
        let meta = self.store.load_meta(url).await;
        let conditional =
            !self.debug.no_cache && (meta.etag.is_some() || meta.last_modified.is_some());

        let budget = self.retry.retries.max(1);
        let mut attempt = 0u32;
        let mut sleep_s = self.retry.base_delay;
        loop {
            attempt += 1;
            let err = match self
                .attempt_once(url, accept, &meta, return_bytes, conditional)
                .await
            {
                Ok(output) => return Ok(output),
                Err(e @ (FetchError::Retryable { .. } | FetchError::Transport { .. })) => e,
                Err(fatal) => return Err(fatal),
            };
            if attempt >= budget {
                return Err(FetchError::Exhausted {
                    url: url.to_string(),
                    attempts: budget,
                    source: Box::new(err),
                });
            }
            // Upstream pacing wins over local jitter for this attempt.
            let delay = match &err {
                FetchError::Retryable {
                    retry_after: Some(ra),
                    ..
                } if *ra > 0.0 => self.retry.cap_delay.min(*ra),
                _ => {
                    sleep_s = backoff_delay(&self.retry, attempt, sleep_s);
                    sleep_s
                }
            };
            self.debug.trace_error(&format!(
                "retrying {url} in {delay:.2}s after attempt {attempt}: {err}"
            ));
            tokio::time::sleep(std::time::Duration::from_secs_f64(delay)).await;
        }
    }

    /// Fetch and always hand back payload bytes, falling back to the cache
    /// slot when the upstream answers 304.
    pub async fn fetch_bytes(
        &self,
        url: &str,
        accept: &str,
    ) -> Result<(Vec<u8>, u16), FetchError> {
        let out = self.fetch(url, accept, true).await?;
        let status = out.status;
        match out.bytes {
            Some(bytes) => Ok((bytes, status)),
            None => Err(FetchError::CacheMiss {
                url: url.to_string(),
            }),
        }
    }

    async fn attempt_once(
        &self,
        url: &str,
        accept: &str,
        meta: &StoredMeta,
        return_bytes: bool,
        conditional: bool,
    ) -> Result<FetchOutput, FetchError> {
        let mut req = self.client.get(url).header(ACCEPT, accept);
        if conditional {
            if let Some(etag) = &meta.etag {
                req = req.header(IF_NONE_MATCH, etag.as_str());
            }
            if let Some(lm) = &meta.last_modified {
                req = req.header(IF_MODIFIED_SINCE, lm.as_str());
            }
        }
        self.debug
            .trace_request(&format!("GET {url} accept={accept} conditional={conditional}"));

        let resp = req.send().await.map_err(|e| transport_error(url, &e))?;
        let status = resp.status().as_u16();
        let headers = resp.headers().clone();

        if status == 304 {
            return Ok(self
                .not_modified(url, meta.clone(), headers, return_bytes)
                .await);
        }
        if status == 412 && conditional {
            self.debug
                .trace_error(&format!("HTTP 412 for {url}; retrying without validators"));
            return self.recover_without_validators(url, accept, return_bytes).await;
        }
        if status >= 400 {
            let body = resp.bytes().await.unwrap_or_default();
            let detail =
                String::from_utf8_lossy(&body[..body.len().min(ERROR_BODY_PREVIEW)]).into_owned();
            self.debug
                .trace_error(&format!("HTTP {status} for {url}: {detail}"));
            if status == 429 || status == 503 || status >= 500 {
                let retry_after = headers
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_retry_after);
                return Err(FetchError::Retryable {
                    status,
                    url: url.to_string(),
                    retry_after,
                    detail,
                });
            }
            return Err(FetchError::Fatal {
                status,
                url: url.to_string(),
                detail,
            });
        }

        self.persist_success(url, resp, status, headers, meta.clone(), return_bytes)
            .await
    }

    async fn not_modified(
        &self,
        url: &str,
        meta: StoredMeta,
        headers: HeaderMap,
        return_bytes: bool,
    ) -> FetchOutput {
        let bytes = if return_bytes {
            self.store.read_cached(url).await
        } else {
            None
        };
        FetchOutput {
            bytes,
            meta,
            status: 304,
            headers,
        }
    }

    /// One-shot recovery from a validator rejection: plain request, fresh
    /// meta, outside the retry budget. Anything but success here is fatal.
    async fn recover_without_validators(
        &self,
        url: &str,
        accept: &str,
        return_bytes: bool,
    ) -> Result<FetchOutput, FetchError> {
        let meta = StoredMeta::default();
        self.debug
            .trace_request(&format!("GET {url} accept={accept} (validator recovery)"));
        let resp = self
            .client
            .get(url)
            .header(ACCEPT, accept)
            .send()
            .await
            .map_err(|e| transport_error(url, &e))?;
        let status = resp.status().as_u16();
        let headers = resp.headers().clone();
        if status == 304 {
            return Ok(self.not_modified(url, meta, headers, return_bytes).await);
        }
        if status >= 400 {
            let body = resp.bytes().await.unwrap_or_default();
            let detail =
                String::from_utf8_lossy(&body[..body.len().min(ERROR_BODY_PREVIEW)]).into_owned();
            return Err(FetchError::Fatal {
                status,
                url: url.to_string(),
                detail,
            });
        }
        self.persist_success(url, resp, status, headers, meta, return_bytes)
            .await
    }

    async fn persist_success(
        &self,
        url: &str,
        resp: reqwest::Response,
        status: u16,
        headers: HeaderMap,
        mut meta: StoredMeta,
        return_bytes: bool,
    ) -> Result<FetchOutput, FetchError> {
        update_meta_from_headers(&mut meta, &headers);
        meta.fetched_at = Some(utc_now_string());

        if return_bytes {
            let content = resp
                .bytes()
                .await
                .map_err(|e| transport_error(url, &e))?
                .to_vec();
            meta.sha256 = Some(sha256_hex(&content));
            self.store.write_bytes(url, &content, &meta).await?;
            return Ok(FetchOutput {
                bytes: Some(content),
                meta,
                status,
                headers,
            });
        }

        match self.store.stream_into(url, resp, &mut meta).await {
            Ok(_) => Ok(FetchOutput {
                bytes: None,
                meta,
                status,
                headers,
            }),
            Err(StreamError::Io(e)) => Err(FetchError::Storage(e)),
            Err(StreamError::Network(e)) => Err(transport_error(url, &e)),
        }
    }
}

fn transport_error(url: &str, e: &reqwest::Error) -> FetchError {
    FetchError::Transport {
        url: url.to_string(),
        timeout: e.is_timeout(),
        detail: e.to_string(),
    }
}

fn update_meta_from_headers(meta: &mut StoredMeta, headers: &HeaderMap) {
    for (header, slot) in [
        (reqwest::header::ETAG, &mut meta.etag),
        (reqwest::header::LAST_MODIFIED, &mut meta.last_modified),
        (reqwest::header::CONTENT_TYPE, &mut meta.content_type),
    ] {
        if let Some(value) = headers.get(&header).and_then(|v| v.to_str().ok()) {
            *slot = Some(value.to_string());
        }
    }
}

/// Parse a `Retry-After` header: integer seconds or an HTTP-date.
pub fn parse_retry_after(value: &str) -> Option<f64> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(secs) = value.parse::<u64>() {
        return Some(secs as f64);
    }
    let when = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    let delta = when.with_timezone(&chrono::Utc) - chrono::Utc::now();
    Some(delta.num_milliseconds().max(0) as f64 / 1000.0)
}

/// Backoff delay for a retry attempt. `previous` feeds the decorrelated
/// mode; full jitter only looks at the attempt number.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32, previous: f64) -> f64 {
    match policy.jitter {
        JitterMode::Decorrelated => {
            let upper = policy.cap_delay.min(previous * 3.0);
            secure_uniform(policy.base_delay, upper)
        }
        JitterMode::Full => {
            let upper = policy
                .cap_delay
                .min(policy.base_delay * 2f64.powi(attempt.saturating_sub(1) as i32));
            secure_uniform(0.0, upper)
        }
    }
}

/// Uniform draw from the OS entropy source.
fn secure_uniform(low: f64, high: f64) -> f64 {
    if high <= low {
        return low;
    }
    OsRng.gen_range(low..high)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_structures::USER_AGENT;
    use std::time::{Duration, Instant};
    use tempfile::tempdir;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn policy(retries: u32) -> RetryPolicy {
        RetryPolicy {
            retries,
            base_delay: 0.01,
            cap_delay: 0.05,
            jitter: JitterMode::Decorrelated,
        }
    }

    fn fetcher(store: BlobStore, retries: u32) -> Fetcher {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent(USER_AGENT)
            .build()
            .unwrap();
        Fetcher::new(client, store, policy(retries), DebugPolicy::default())
    }

    #[tokio::test]
    async fn cold_fetch_stores_blob_and_validators() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/doc"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(b"<x/>".to_vec())
                    .insert_header("ETag", "\"abc\"")
                    .insert_header("Last-Modified", "Thu, 01 Jan 2026 00:00:00 GMT")
                    .insert_header("Content-Type", "application/xml"),
            )
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let store = BlobStore::new(dir.path());
        let url = format!("{}/doc", server.uri());
        let out = fetcher(store.clone(), 3)
            .fetch(&url, "application/xml", false)
            .await
            .unwrap();

        assert_eq!(out.status, 200);
        let meta = store.load_meta(&url).await;
        assert_eq!(meta.etag.as_deref(), Some("\"abc\""));
        assert_eq!(
            meta.last_modified.as_deref(),
            Some("Thu, 01 Jan 2026 00:00:00 GMT")
        );
        assert_eq!(meta.sha256.as_deref(), Some(sha256_hex(b"<x/>").as_str()));
        assert!(meta.fetched_at.is_some());
        assert_eq!(store.read_cached(&url).await.unwrap(), b"<x/>");
    }

    #[tokio::test]
    async fn warm_fetch_sends_validators_and_returns_cached_on_304() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/doc"))
            .and(header("If-None-Match", "\"abc\""))
            .and(header("If-Modified-Since", "Thu, 01 Jan 2026 00:00:00 GMT"))
            .respond_with(ResponseTemplate::new(304))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let store = BlobStore::new(dir.path());
        let url = format!("{}/doc", server.uri());
        let seeded = StoredMeta {
            etag: Some("\"abc\"".into()),
            last_modified: Some("Thu, 01 Jan 2026 00:00:00 GMT".into()),
            sha256: Some(sha256_hex(b"<x/>")),
            ..Default::default()
        };
        store.write_bytes(&url, b"<x/>", &seeded).await.unwrap();

        let out = fetcher(store.clone(), 3)
            .fetch(&url, "application/xml", true)
            .await
            .unwrap();
        assert_eq!(out.status, 304);
        assert_eq!(out.bytes.unwrap(), b"<x/>");
        // Sidecar untouched.
        assert_eq!(store.load_meta(&url).await, seeded);
    }

    #[tokio::test]
    async fn retry_after_is_honored_before_the_second_attempt() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/busy"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "1"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/busy"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ok".to_vec()))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let store = BlobStore::new(dir.path());
        let url = format!("{}/busy", server.uri());
        // cap_delay above the Retry-After value so the upstream pacing is
        // what actually sleeps.
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap();
        let fetcher = Fetcher::new(
            client,
            store,
            RetryPolicy {
                retries: 3,
                base_delay: 0.01,
                cap_delay: 5.0,
                jitter: JitterMode::Decorrelated,
            },
            DebugPolicy::default(),
        );
        let started = Instant::now();
        let out = fetcher.fetch(&url, "application/xml", true).await.unwrap();
        assert_eq!(out.status, 200);
        assert!(started.elapsed() >= Duration::from_millis(950));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn precondition_failure_recovers_without_validators() {
        let server = MockServer::start().await;
        // Conditional request is rejected once; the plain retry succeeds.
        Mock::given(method("GET"))
            .and(path("/doc"))
            .and(header("If-None-Match", "\"stale\""))
            .respond_with(ResponseTemplate::new(412))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/doc"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(b"fresh".to_vec())
                    .insert_header("ETag", "\"new\""),
            )
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let store = BlobStore::new(dir.path());
        let url = format!("{}/doc", server.uri());
        store
            .save_meta(
                &url,
                &StoredMeta {
                    etag: Some("\"stale\"".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        // retries=1 proves the recovery request is outside the budget.
        let out = fetcher(store.clone(), 1)
            .fetch(&url, "application/xml", true)
            .await
            .unwrap();
        assert_eq!(out.status, 200);
        assert_eq!(out.bytes.unwrap(), b"fresh");
        assert_eq!(store.load_meta(&url).await.etag.as_deref(), Some("\"new\""));
    }

    #[tokio::test]
    async fn non_retryable_status_fails_immediately() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gone"))
            .respond_with(ResponseTemplate::new(404).set_body_bytes(b"not here".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let url = format!("{}/gone", server.uri());
        let err = fetcher(BlobStore::new(dir.path()), 5)
            .fetch(&url, "application/xml", true)
            .await
            .unwrap_err();
        match err {
            FetchError::Fatal { status, detail, .. } => {
                assert_eq!(status, 404);
                assert!(detail.contains("not here"));
            }
            other => panic!("expected fatal error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn budget_exhaustion_names_the_last_cause() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(500))
            .expect(2)
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let url = format!("{}/flaky", server.uri());
        let err = fetcher(BlobStore::new(dir.path()), 2)
            .fetch(&url, "application/xml", true)
            .await
            .unwrap_err();
        match &err {
            FetchError::Exhausted { attempts, source, .. } => {
                assert_eq!(*attempts, 2);
                assert_eq!(source.status(), Some(500));
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(err.error_type(), "http");
        assert_eq!(err.status(), Some(500));
    }

    #[tokio::test]
    async fn fetch_bytes_surfaces_cache_miss_on_bare_304() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/doc"))
            .respond_with(ResponseTemplate::new(304))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let store = BlobStore::new(dir.path());
        let url = format!("{}/doc", server.uri());
        store
            .save_meta(
                &url,
                &StoredMeta {
                    etag: Some("\"abc\"".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let err = fetcher(store, 2)
            .fetch_bytes(&url, "application/json")
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::CacheMiss { .. }));
    }

    #[test]
    fn decorrelated_backoff_stays_within_bounds() {
        let policy = RetryPolicy {
            retries: 6,
            base_delay: 0.5,
            cap_delay: 20.0,
            jitter: JitterMode::Decorrelated,
        };
        let mut previous = policy.base_delay;
        for attempt in 1..=50 {
            let next = backoff_delay(&policy, attempt, previous);
            let upper = policy.cap_delay.min(previous * 3.0).max(policy.base_delay);
            assert!(next >= policy.base_delay, "{next} below base");
            assert!(next <= upper, "{next} above {upper}");
            previous = next;
        }
    }

    #[test]
    fn full_jitter_backoff_is_capped_exponential() {
        let policy = RetryPolicy {
            retries: 6,
            base_delay: 0.5,
            cap_delay: 4.0,
            jitter: JitterMode::Full,
        };
        for attempt in 1..=20 {
            let next = backoff_delay(&policy, attempt, 1.0);
            let upper = policy.cap_delay.min(0.5 * 2f64.powi(attempt as i32 - 1));
            assert!((0.0..=upper).contains(&next));
        }
    }

    #[test]
    fn retry_after_parses_seconds_and_http_dates() {
        assert_eq!(parse_retry_after("2"), Some(2.0));
        assert_eq!(parse_retry_after(""), None);
        assert_eq!(parse_retry_after("soon"), None);
        let future = (chrono::Utc::now() + chrono::Duration::seconds(30)).to_rfc2822();
        let parsed = parse_retry_after(&future).unwrap();
        assert!(parsed > 25.0 && parsed <= 30.5);
        // Dates in the past clamp to zero rather than going negative.
        let past = (chrono::Utc::now() - chrono::Duration::seconds(30)).to_rfc2822();
        assert_eq!(parse_retry_after(&past), Some(0.0));
    }
}
