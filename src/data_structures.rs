use std::collections::HashMap;
use std::sync::Arc;

use serde_derive::Serialize;

use crate::dashboard::DashboardState;
use crate::ledger::Ledger;
use crate::limiter::AdaptiveLimiter;
use crate::stats::RunStats;
use crate::store::BlobStore;

pub const BASE_URL: &str = "https://www.boe.es";
pub const SUMARIO_API: &str = "https://www.boe.es/datosabiertos/api/boe/sumario";
pub const LEGIS_API: &str = "https://www.boe.es/datosabiertos/api/legislacion-consolidada";

/// Constant for the whole run so the upstream sees a stable client identity.
pub const USER_AGENT: &str = concat!("boe-ingest/", env!("CARGO_PKG_VERSION"));

/// Payload format of a download target. Also names the content-addressed
/// subdirectory and file extension in the store.
#[derive(clap::ValueEnum, Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Format {
    Xml,
    Json,
    Pdf,
}

impl Format {
    pub fn as_str(&self) -> &'static str {
        match self {
            Format::Xml => "xml",
            Format::Json => "json",
            Format::Pdf => "pdf",
        }
    }

    pub fn extension(&self) -> &'static str {
        self.as_str()
    }
}

impl std::fmt::Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which enumeration produced a target. Stored as `source_kind` in the
/// resource ledger so repeated runs of either command converge on the same
/// rows.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SourceKind {
    ConsolidadaId,
    SumarioItem,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::ConsolidadaId => "consolidada_id",
            SourceKind::SumarioItem => "sumario_item",
        }
    }
}

/// A single unit of work for the pipeline.
#[derive(Clone, Debug)]
pub struct Target {
    /// Stable domain identifier (ELI or BOE id); falls back to the URL.
    pub key: String,
    pub url: String,
    pub format: Format,
    pub source_kind: SourceKind,
    pub accept: String,
}

/// One line of the append-only JSONL manifest.
#[derive(Serialize, Clone, Debug)]
pub struct ManifestRecord {
    pub run_id: String,
    pub cmd: String,
    pub ts: String,
    pub key: String,
    pub url: String,
    pub ok: bool,
    pub status: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fetched_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Backoff jitter strategy for the retry loop.
#[derive(clap::ValueEnum, Copy, Clone, Debug, PartialEq, Eq)]
pub enum JitterMode {
    Decorrelated,
    Full,
}

/// Retry/backoff knobs shared by every fetch in a run.
#[derive(Copy, Clone, Debug)]
pub struct RetryPolicy {
    pub retries: u32,
    pub base_delay: f64,
    pub cap_delay: f64,
    pub jitter: JitterMode,
}

/// HTTP tracing and cache-control flags.
#[derive(Copy, Clone, Debug, Default)]
pub struct DebugPolicy {
    pub debug_http: bool,
    pub debug_http_all: bool,
    pub no_cache: bool,
}

impl DebugPolicy {
    /// Request lines are only worth the noise when everything is traced.
    pub fn trace_request(&self, message: &str) {
        if self.debug_http_all {
            log::info!("{}", message);
        }
    }

    /// Non-200 responses are traced in both debug modes.
    pub fn trace_error(&self, message: &str) {
        if self.debug_http {
            log::info!("{}", message);
        }
    }
}

/// I/O handles shared by every component that touches the network or disk.
#[derive(Clone)]
pub struct IoBundle {
    pub client: reqwest::Client,
    pub store: BlobStore,
}

/// Mutable run-scoped state, passed by handle into the pipeline, tuner and
/// dashboard loops. No process-wide globals.
#[derive(Clone)]
pub struct RuntimeBundle {
    pub run_id: String,
    pub limiter: Arc<AdaptiveLimiter>,
    pub stats: Arc<RunStats>,
    pub dashboard: Option<Arc<DashboardState>>,
    pub ledger: Option<Arc<dyn Ledger>>,
}

/// Flatten response headers into a JSON-friendly map. Multi-valued headers
/// keep the first value, matching what the ledger stores.
pub fn headers_to_map(headers: &reqwest::header::HeaderMap) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for (name, value) in headers.iter() {
        if let Ok(v) = value.to_str() {
            out.entry(name.as_str().to_string())
                .or_insert_with(|| v.to_string());
        }
    }
    out
}

/// UTC timestamp in the compact form used by the manifest and sidecars.
pub fn utc_now_string() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_round_trip() {
        assert_eq!(Format::Xml.as_str(), "xml");
        assert_eq!(Format::Pdf.extension(), "pdf");
        assert_eq!(SourceKind::SumarioItem.as_str(), "sumario_item");
    }

    #[test]
    fn manifest_record_skips_absent_fields() {
        let rec = ManifestRecord {
            run_id: "r".into(),
            cmd: "sumario".into(),
            ts: "2026-01-01T00:00:00Z".into(),
            key: "k".into(),
            url: "https://example.org/x".into(),
            ok: false,
            status: Some(500),
            content_type: None,
            etag: None,
            last_modified: None,
            sha256: None,
            fetched_at: None,
            error: Some("HTTP 500".into()),
        };
        let line = serde_json::to_string(&rec).unwrap();
        assert!(line.contains("\"error\":\"HTTP 500\""));
        assert!(!line.contains("etag"));
    }

    #[test]
    fn headers_flatten_keeps_first_value() {
        let mut h = reqwest::header::HeaderMap::new();
        h.append("x-thing", "a".parse().unwrap());
        h.append("x-thing", "b".parse().unwrap());
        let map = headers_to_map(&h);
        assert_eq!(map.get("x-thing").map(String::as_str), Some("a"));
    }
}
