//! Fan-out download pipeline.
//!
//! All targets are queued up front; `max_limit` workers drain the queue,
//! each holding a limiter token per item. Per item the worker enforces
//! idempotent delivery: ledger pre-check (skip when the payload is already
//! persisted), conditional fetch into the blob store, content-addressed
//! promotion, attempt close, per-format ledger update, manifest line, stats.
//! Every opened attempt is closed before the token is released, on every
//! path. The manifest is a single-writer stream; a failed manifest write
//! aborts the whole run.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use log::{error, info, warn};
use tokio::io::AsyncWriteExt;

use crate::data_structures::{
    headers_to_map, utc_now_string, IoBundle, ManifestRecord, RuntimeBundle, Target,
};
use crate::fetcher::Fetcher;
use crate::ledger::{AttemptClose, FormatUpdate, Ledger};
use crate::store::BlobStore;
use crate::tuner::SystemSampler;

const SYSTEM_LOOP_INTERVAL: Duration = Duration::from_millis(800);

#[derive(Clone, Debug)]
pub struct PipelineOptions {
    pub cmd: String,
    pub manifest_name: String,
    /// Cadence of the live progress log line.
    pub progress_interval: Duration,
}

/// Serialized JSONL manifest stream. One mutex, one record per line.
struct ManifestWriter {
    path: PathBuf,
    run_id: String,
    cmd: String,
    lock: tokio::sync::Mutex<()>,
}

/// Per-item fields of a manifest record; run identity and timestamp are
/// stamped by the writer.
#[derive(Clone, Debug, Default)]
struct ManifestEntry {
    key: String,
    url: String,
    ok: bool,
    status: Option<u16>,
    content_type: Option<String>,
    etag: Option<String>,
    last_modified: Option<String>,
    sha256: Option<String>,
    fetched_at: Option<String>,
    error: Option<String>,
}

impl ManifestWriter {
    fn new(path: PathBuf, run_id: String, cmd: String) -> Self {
        ManifestWriter {
            path,
            run_id,
            cmd,
            lock: tokio::sync::Mutex::new(()),
        }
    }

    async fn append(&self, entry: ManifestEntry) -> Result<()> {
        let record = ManifestRecord {
            run_id: self.run_id.clone(),
            cmd: self.cmd.clone(),
            ts: utc_now_string(),
            key: entry.key,
            url: entry.url,
            ok: entry.ok,
            status: entry.status,
            content_type: entry.content_type,
            etag: entry.etag,
            last_modified: entry.last_modified,
            sha256: entry.sha256,
            fetched_at: entry.fetched_at,
            error: entry.error,
        };
        let line = serde_json::to_string(&record).context("serializing manifest record")?;
        let _guard = self.lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("opening manifest {}", self.path.display()))?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        Ok(())
    }
}

struct WorkerCtx {
    queue: Mutex<VecDeque<Target>>,
    fetcher: Fetcher,
    store: BlobStore,
    runtime: RuntimeBundle,
    manifest: ManifestWriter,
    aborted: AtomicBool,
}

/// Run the download pipeline to completion. Auxiliary loops (progress log,
/// dashboard system loop) live only as long as the queue.
pub async fn run_queue_download(
    io: &IoBundle,
    runtime: &RuntimeBundle,
    fetcher: &Fetcher,
    targets: Vec<Target>,
    options: PipelineOptions,
) -> Result<()> {
    let total = targets.len();
    info!("{}: queueing {} targets", options.cmd, total);

    if let Some(dash) = &runtime.dashboard {
        dash.set_run_info(&runtime.run_id, &options.cmd);
        dash.set_status("RUNNING");
        dash.set_timestamp();
        dash.set_total(total as u64);
        dash.set_concurrency(runtime.limiter.get_target().await as u64);
        dash.set_limits(
            runtime.stats.max_concurrency_configured() as u64,
            runtime.stats.max_concurrency_reached() as u64,
        );
    }

    let ctx = Arc::new(WorkerCtx {
        queue: Mutex::new(VecDeque::from(targets)),
        fetcher: fetcher.clone(),
        store: io.store.clone(),
        runtime: runtime.clone(),
        manifest: ManifestWriter::new(
            io.store.manifest_path(&options.manifest_name),
            runtime.run_id.clone(),
            options.cmd.clone(),
        ),
        aborted: AtomicBool::new(false),
    });

    let system_task = runtime.dashboard.clone().map(|dash| {
        let runtime = runtime.clone();
        tokio::spawn(async move {
            let mut sampler = SystemSampler::new();
            loop {
                push_system_metrics(&dash, &runtime, &mut sampler).await;
                tokio::time::sleep(SYSTEM_LOOP_INTERVAL).await;
            }
        })
    });

    let progress_task = {
        let runtime = runtime.clone();
        let interval = options.progress_interval.max(Duration::from_secs(1));
        let cmd = options.cmd.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let totals = runtime.stats.totals().await;
                info!(
                    "{cmd}: {}/{total} done (ok={} skipped_304={} errors={} bytes={})",
                    totals.done, totals.ok, totals.skipped_304, totals.errors, totals.bytes
                );
            }
        })
    };

    let workers: Vec<_> = (0..runtime.limiter.max_limit())
        .map(|_| {
            let ctx = ctx.clone();
            tokio::spawn(worker(ctx))
        })
        .collect();

    let mut failure: Option<anyhow::Error> = None;
    for handle in workers {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                if failure.is_none() {
                    failure = Some(e);
                }
            }
            Err(join) => {
                if failure.is_none() {
                    failure = Some(anyhow::anyhow!("worker task panicked: {join}"));
                }
            }
        }
    }

    progress_task.abort();
    if let Some(task) = system_task {
        task.abort();
    }

    if let Some(dash) = &runtime.dashboard {
        let totals = runtime.stats.totals().await;
        dash.set_status("DONE");
        dash.set_timestamp();
        dash.sync_totals(
            totals.done,
            totals.ok,
            totals.skipped_304,
            totals.errors,
            totals.http_429,
            totals.http_5xx,
            totals.bytes,
        );
    }

    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

async fn push_system_metrics(
    dash: &crate::dashboard::DashboardState,
    runtime: &RuntimeBundle,
    sampler: &mut SystemSampler,
) {
    let cpu = sampler
        .cpu_percent()
        .map(|c| format!("{c:.1}%"))
        .unwrap_or_else(|| "n/a".to_string());
    let ram = sampler
        .memory()
        .map(|(rss, pct)| format!("{:.1} MB ({pct:.1}%)", rss as f64 / 1024.0 / 1024.0))
        .unwrap_or_else(|| "n/a".to_string());
    dash.set_system(&cpu, &ram);
    dash.set_timestamp();
    let totals = runtime.stats.totals().await;
    dash.sync_totals(
        totals.done,
        totals.ok,
        totals.skipped_304,
        totals.errors,
        totals.http_429,
        totals.http_5xx,
        totals.bytes,
    );
    dash.set_concurrency(runtime.limiter.get_target().await as u64);
    dash.set_limits(
        runtime.stats.max_concurrency_configured() as u64,
        runtime.stats.max_concurrency_reached() as u64,
    );
}

async fn worker(ctx: Arc<WorkerCtx>) -> Result<()> {
    loop {
        if ctx.aborted.load(Ordering::Relaxed) {
            return Ok(());
        }
        let target = ctx.queue.lock().expect("target queue poisoned").pop_front();
        let Some(target) = target else {
            return Ok(());
        };
        ctx.runtime.limiter.acquire().await;
        let result = handle_one(&ctx, &target).await;
        ctx.runtime.limiter.release();
        if let Err(e) = result {
            ctx.aborted.store(true, Ordering::Relaxed);
            return Err(e);
        }
    }
}

/// Process one target and record it in the stats and dashboard exactly
/// once. Only run-fatal conditions (manifest write failures) return Err.
async fn handle_one(ctx: &WorkerCtx, target: &Target) -> Result<()> {
    let t0 = Instant::now();
    let mut status: Option<u16> = None;
    let mut nbytes: u64 = 0;
    let mut timeout = false;

    let outcome = process_target(ctx, target, t0, &mut status, &mut nbytes, &mut timeout).await;

    ctx.runtime
        .stats
        .record(status, t0.elapsed().as_secs_f64(), nbytes, timeout)
        .await;
    if let Some(dash) = &ctx.runtime.dashboard {
        dash.update_item(status, nbytes, &target.url, timeout, &target.accept);
        dash.set_concurrency(ctx.runtime.limiter.get_target().await as u64);
        dash.set_limits(
            ctx.runtime.stats.max_concurrency_configured() as u64,
            ctx.runtime.stats.max_concurrency_reached() as u64,
        );
    }
    outcome
}

enum PreCheck {
    /// Format already downloaded and its payload is still on disk.
    Skip { sha256: Option<String>, nbytes: u64 },
    Proceed { resource_id: i64, attempt_id: i64 },
}

async fn process_target(
    ctx: &WorkerCtx,
    target: &Target,
    t0: Instant,
    status: &mut Option<u16>,
    nbytes: &mut u64,
    timeout: &mut bool,
) -> Result<()> {
    let ledger = ctx.runtime.ledger.as_deref();
    let mut resource_id: i64 = 0;
    let mut attempt_id: Option<i64> = None;

    if let Some(ledger) = ledger {
        match pre_check(ledger, &ctx.store, target).await {
            Ok(PreCheck::Skip {
                sha256,
                nbytes: size,
            }) => {
                *status = Some(304);
                *nbytes = size;
                ctx.manifest
                    .append(ManifestEntry {
                        key: target.key.clone(),
                        url: target.url.clone(),
                        ok: true,
                        status: Some(304),
                        sha256,
                        fetched_at: Some(utc_now_string()),
                        ..Default::default()
                    })
                    .await?;
                return Ok(());
            }
            Ok(PreCheck::Proceed {
                resource_id: rid,
                attempt_id: aid,
            }) => {
                resource_id = rid;
                attempt_id = Some(aid);
            }
            Err(e) => {
                // No attempt was opened; the target fails without touching
                // the resource row further.
                warn!("ledger pre-check failed for {}: {e:#}", target.key);
                ctx.manifest
                    .append(ManifestEntry {
                        key: target.key.clone(),
                        url: target.url.clone(),
                        ok: false,
                        error: Some(format!("ledger: {e:#}")),
                        ..Default::default()
                    })
                    .await?;
                return Ok(());
            }
        }
    }

    match ctx.fetcher.fetch(&target.url, &target.accept, false).await {
        Ok(out) => {
            *status = Some(out.status);
            *nbytes = ctx.store.cached_size(&target.url).await;

            let mut storage_uri: Option<String> = None;
            if let Some(sha) = &out.meta.sha256 {
                let (data_path, _) = ctx.store.paths_for(&target.url);
                match ctx.store.promote(target.format, sha, &data_path).await {
                    Ok(Some(path)) => storage_uri = Some(file_uri(&path).await),
                    Ok(None) => {}
                    Err(e) => warn!("promote failed for {}: {e}", target.key),
                }
            }

            if let (Some(ledger), Some(aid)) = (ledger, attempt_id) {
                let content_length = out
                    .headers
                    .get(reqwest::header::CONTENT_LENGTH)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<i64>().ok())
                    .or(if *nbytes > 0 { Some(*nbytes as i64) } else { None });
                let close = AttemptClose {
                    duration_ms: t0.elapsed().as_millis() as i64,
                    http_status: Some(out.status as i32),
                    response_headers: serde_json::to_value(headers_to_map(&out.headers))
                        .unwrap_or(serde_json::Value::Null),
                    content_type: out.meta.content_type.clone(),
                    content_length,
                    sha256: out.meta.sha256.clone(),
                    storage_uri: storage_uri.clone(),
                    error_type: None,
                    error_detail: None,
                };
                let ledger_result = finish_success(
                    ledger,
                    aid,
                    resource_id,
                    target,
                    out.status,
                    close,
                    out.meta.sha256.clone(),
                    storage_uri,
                )
                .await;
                if let Err(e) = ledger_result {
                    error!("ledger update failed for {}: {e:#}", target.key);
                    ctx.manifest
                        .append(ManifestEntry {
                            key: target.key.clone(),
                            url: target.url.clone(),
                            ok: false,
                            status: *status,
                            error: Some(format!("ledger: {e:#}")),
                            ..Default::default()
                        })
                        .await?;
                    return Ok(());
                }
            }

            ctx.manifest
                .append(ManifestEntry {
                    key: target.key.clone(),
                    url: target.url.clone(),
                    ok: out.status < 400,
                    status: Some(out.status),
                    content_type: out.meta.content_type.clone(),
                    etag: out.meta.etag.clone(),
                    last_modified: out.meta.last_modified.clone(),
                    sha256: out.meta.sha256.clone(),
                    fetched_at: out.meta.fetched_at.clone(),
                    error: None,
                })
                .await?;
        }
        Err(e) => {
            *status = e.status();
            *timeout = e.is_timeout();
            warn!("{} failed: {e}", target.key);

            if let (Some(ledger), Some(aid)) = (ledger, attempt_id) {
                let close = AttemptClose {
                    duration_ms: t0.elapsed().as_millis() as i64,
                    http_status: status.map(|s| s as i32),
                    response_headers: serde_json::Value::Object(Default::default()),
                    error_type: Some(e.error_type().to_string()),
                    error_detail: Some(e.to_string()),
                    ..Default::default()
                };
                if let Err(le) = ledger.attempt_finish(aid, close).await {
                    error!("failed to close attempt for {}: {le:#}", target.key);
                }
                let update = FormatUpdate {
                    ok: false,
                    downloaded_at: chrono::Utc::now(),
                    http_status: status.map(|s| s as i32),
                    sha256: None,
                    storage_uri: None,
                    error: Some(e.to_string()),
                };
                if let Err(le) = ledger.update_format(resource_id, target.format, update).await {
                    error!("failed to record failure for {}: {le:#}", target.key);
                }
            }

            ctx.manifest
                .append(ManifestEntry {
                    key: target.key.clone(),
                    url: target.url.clone(),
                    ok: false,
                    status: *status,
                    error: Some(e.to_string()),
                    ..Default::default()
                })
                .await?;
        }
    }
    Ok(())
}

async fn pre_check(ledger: &dyn Ledger, store: &BlobStore, target: &Target) -> Result<PreCheck> {
    let url = target.url.as_str();
    let (url_xml, url_json, url_pdf) = match target.format {
        crate::data_structures::Format::Xml => (Some(url), None, None),
        crate::data_structures::Format::Json => (None, Some(url), None),
        crate::data_structures::Format::Pdf => (None, None, Some(url)),
    };
    let resource_id = ledger
        .upsert_resource(target.source_kind.as_str(), &target.key, url_xml, url_json, url_pdf)
        .await?;
    let format_status = ledger.format_status(resource_id, target.format).await?;

    if format_status.downloaded {
        if let Some(path) = resolve_existing_payload(
            store,
            target.format,
            format_status.sha256.as_deref(),
            format_status.storage_uri.as_deref(),
        )
        .await
        {
            let size = tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
            return Ok(PreCheck::Skip {
                sha256: format_status.sha256,
                nbytes: size,
            });
        }
    }

    let attempt_id = ledger
        .attempt_start(resource_id, target.format, url, &target.accept)
        .await?;
    Ok(PreCheck::Proceed {
        resource_id,
        attempt_id,
    })
}

#[allow(clippy::too_many_arguments)]
async fn finish_success(
    ledger: &dyn Ledger,
    attempt_id: i64,
    resource_id: i64,
    target: &Target,
    status: u16,
    close: AttemptClose,
    sha256: Option<String>,
    storage_uri: Option<String>,
) -> Result<()> {
    ledger.attempt_finish(attempt_id, close).await?;
    if status == 304 {
        ledger
            .update_format_not_modified(
                resource_id,
                target.format,
                true,
                chrono::Utc::now(),
                Some(status as i32),
            )
            .await?;
    } else {
        ledger
            .update_format(
                resource_id,
                target.format,
                FormatUpdate {
                    ok: status < 400,
                    downloaded_at: chrono::Utc::now(),
                    http_status: Some(status as i32),
                    sha256,
                    storage_uri,
                    error: None,
                },
            )
            .await?;
    }
    Ok(())
}

/// Locate a previously promoted payload, by its recorded URI or by
/// reconstructing the content-addressed path from the hash.
async fn resolve_existing_payload(
    store: &BlobStore,
    format: crate::data_structures::Format,
    sha256: Option<&str>,
    storage_uri: Option<&str>,
) -> Option<PathBuf> {
    if let Some(uri) = storage_uri {
        let path = match url::Url::parse(uri) {
            Ok(parsed) => parsed.to_file_path().ok(),
            Err(_) => Some(PathBuf::from(uri)),
        };
        if let Some(path) = path {
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Some(path);
            }
        }
    }
    let sha = sha256?;
    let candidate = store.payload_path(format, sha);
    if tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
        return Some(candidate);
    }
    None
}

async fn file_uri(path: &Path) -> String {
    let absolute = tokio::fs::canonicalize(path)
        .await
        .unwrap_or_else(|_| path.to_path_buf());
    format!("file://{}", absolute.display())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_structures::{Format, JitterMode, RetryPolicy, SourceKind, DebugPolicy};
    use crate::ledger::testing::MemoryLedger;
    use crate::limiter::AdaptiveLimiter;
    use crate::stats::RunStats;
    use crate::store::sha256_hex;
    use tempfile::tempdir;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn target(url: &str, key: &str) -> Target {
        Target {
            key: key.to_string(),
            url: url.to_string(),
            format: Format::Xml,
            source_kind: SourceKind::SumarioItem,
            accept: "application/xml".to_string(),
        }
    }

    async fn runtime_with(ledger: Option<Arc<dyn Ledger>>) -> RuntimeBundle {
        let limiter = Arc::new(AdaptiveLimiter::new(4, 4));
        limiter.initialize().await;
        RuntimeBundle {
            run_id: "20260101T000000Z-1234".to_string(),
            limiter,
            stats: Arc::new(RunStats::new(4)),
            dashboard: None,
            ledger,
        }
    }

    fn io_and_fetcher(store: BlobStore) -> (IoBundle, Fetcher) {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap();
        let retry = RetryPolicy {
            retries: 2,
            base_delay: 0.01,
            cap_delay: 0.05,
            jitter: JitterMode::Decorrelated,
        };
        let fetcher = Fetcher::new(client.clone(), store.clone(), retry, DebugPolicy::default());
        (IoBundle { client, store }, fetcher)
    }

    fn options() -> PipelineOptions {
        PipelineOptions {
            cmd: "sumario".to_string(),
            manifest_name: "manifest_test.jsonl".to_string(),
            progress_interval: Duration::from_secs(60),
        }
    }

    async fn manifest_lines(store: &BlobStore) -> Vec<serde_json::Value> {
        let raw = tokio::fs::read_to_string(store.manifest_path("manifest_test.jsonl"))
            .await
            .unwrap();
        raw.lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn successful_run_persists_promotes_and_records() {
        let server = MockServer::start().await;
        for (route, body) in [("/a", "<a/>"), ("/b", "<b/>")] {
            Mock::given(method("GET"))
                .and(path(route))
                .respond_with(
                    ResponseTemplate::new(200)
                        .set_body_bytes(body.as_bytes().to_vec())
                        .insert_header("Content-Type", "application/xml"),
                )
                .expect(1)
                .mount(&server)
                .await;
        }

        let dir = tempdir().unwrap();
        let store = BlobStore::new(dir.path());
        store.ensure_dirs().unwrap();
        let ledger = Arc::new(MemoryLedger::new());
        let runtime = runtime_with(Some(ledger.clone() as Arc<dyn Ledger>)).await;
        let (io, fetcher) = io_and_fetcher(store.clone());

        let targets = vec![
            target(&format!("{}/a", server.uri()), "BOE-A-2026-1"),
            target(&format!("{}/b", server.uri()), "BOE-A-2026-2"),
        ];
        run_queue_download(&io, &runtime, &fetcher, targets, options())
            .await
            .unwrap();

        // One manifest line per target.
        let lines = manifest_lines(&store).await;
        assert_eq!(lines.len(), 2);
        for line in &lines {
            assert_eq!(line["ok"], true);
            assert_eq!(line["status"], 200);
            assert_eq!(line["run_id"], "20260101T000000Z-1234");
        }

        // Content-addressed copies exist and hash to their names.
        let sha_a = sha256_hex(b"<a/>");
        let promoted = store.payload_path(Format::Xml, &sha_a);
        let bytes = tokio::fs::read(&promoted).await.unwrap();
        assert_eq!(sha256_hex(&bytes), sha_a);

        // Ledger: two resources, two closed attempts with storage URIs.
        assert_eq!(ledger.resources().await.len(), 2);
        let attempts = ledger.attempts().await;
        assert_eq!(attempts.len(), 2);
        for attempt in &attempts {
            let closed = attempt.closed.as_ref().expect("attempt left open");
            assert_eq!(closed.http_status, Some(200));
            assert!(closed.storage_uri.as_deref().unwrap().starts_with("file://"));
            assert!(closed.sha256.is_some());
        }
        assert_eq!(ledger.open_attempts().await, 0);

        let totals = runtime.stats.totals().await;
        assert_eq!(totals.done, 2);
        assert_eq!(totals.ok, 2);
        assert_eq!(totals.done, totals.ok + totals.skipped_304 + totals.errors);
    }

    #[tokio::test]
    async fn already_persisted_targets_skip_the_fetch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let store = BlobStore::new(dir.path());
        store.ensure_dirs().unwrap();
        let url = format!("{}/a", server.uri());

        // Seed the ledger row and the promoted payload on disk.
        let ledger = Arc::new(MemoryLedger::new());
        let rid = ledger
            .upsert_resource("sumario_item", "BOE-A-2026-1", Some(&url), None, None)
            .await
            .unwrap();
        let sha = sha256_hex(b"<a/>");
        let payload = store.payload_path(Format::Xml, &sha);
        tokio::fs::create_dir_all(payload.parent().unwrap()).await.unwrap();
        tokio::fs::write(&payload, b"<a/>").await.unwrap();
        ledger.mark_downloaded(rid, Format::Xml, Some(sha.clone()), None).await;

        let runtime = runtime_with(Some(ledger.clone() as Arc<dyn Ledger>)).await;
        let (io, fetcher) = io_and_fetcher(store.clone());
        run_queue_download(&io, &runtime, &fetcher, vec![target(&url, "BOE-A-2026-1")], options())
            .await
            .unwrap();

        let lines = manifest_lines(&store).await;
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["ok"], true);
        assert_eq!(lines[0]["status"], 304);
        assert_eq!(lines[0]["sha256"], sha.as_str());

        // No attempt was opened for the skip.
        assert!(ledger.attempts().await.is_empty());
        let totals = runtime.stats.totals().await;
        assert_eq!(totals.skipped_304, 1);
        assert_eq!(totals.ok, 0);
    }

    #[tokio::test]
    async fn failures_close_attempts_and_do_not_stop_the_queue() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/bad"))
            .respond_with(ResponseTemplate::new(404).set_body_bytes(b"missing".to_vec()))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/good"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"<g/>".to_vec()))
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let store = BlobStore::new(dir.path());
        store.ensure_dirs().unwrap();
        let ledger = Arc::new(MemoryLedger::new());
        let runtime = runtime_with(Some(ledger.clone() as Arc<dyn Ledger>)).await;
        let (io, fetcher) = io_and_fetcher(store.clone());

        let targets = vec![
            target(&format!("{}/bad", server.uri()), "BOE-A-2026-1"),
            target(&format!("{}/good", server.uri()), "BOE-A-2026-2"),
        ];
        run_queue_download(&io, &runtime, &fetcher, targets, options())
            .await
            .unwrap();

        let lines = manifest_lines(&store).await;
        assert_eq!(lines.len(), 2);
        let failed: Vec<_> = lines.iter().filter(|l| l["ok"] == false).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0]["status"], 404);
        assert!(failed[0]["error"].as_str().unwrap().contains("404"));

        assert_eq!(ledger.open_attempts().await, 0);
        let attempts = ledger.attempts().await;
        let bad = attempts
            .iter()
            .find(|a| a.request_url.ends_with("/bad"))
            .unwrap();
        assert_eq!(
            bad.closed.as_ref().unwrap().error_type.as_deref(),
            Some("http")
        );

        let totals = runtime.stats.totals().await;
        assert_eq!(totals.done, 2);
        assert_eq!(totals.ok, 1);
        assert_eq!(totals.errors, 1);
    }

    #[tokio::test]
    async fn second_run_against_unchanged_upstream_skips_via_304() {
        let server = MockServer::start().await;
        // First request is unconditional; later requests carry the stored
        // validator and get a 304.
        Mock::given(method("GET"))
            .and(path("/doc"))
            .and(header("If-None-Match", "\"v1\""))
            .respond_with(ResponseTemplate::new(304))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/doc"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(b"<doc/>".to_vec())
                    .insert_header("ETag", "\"v1\""),
            )
            .mount(&server)
            .await;

        let dir = tempdir().unwrap();
        let store = BlobStore::new(dir.path());
        store.ensure_dirs().unwrap();
        let url = format!("{}/doc", server.uri());
        let ledger = Arc::new(MemoryLedger::new());
        let (io, fetcher) = io_and_fetcher(store.clone());

        let first = runtime_with(Some(ledger.clone() as Arc<dyn Ledger>)).await;
        run_queue_download(&io, &first, &fetcher, vec![target(&url, "BOE-A-2026-1")], options())
            .await
            .unwrap();
        let first_totals = first.stats.totals().await;
        assert_eq!(first_totals.ok, 1);

        // Drop the promoted payload so the ledger pre-check cannot skip and
        // the conditional fetch itself has to answer.
        let sha = sha256_hex(b"<doc/>");
        tokio::fs::remove_file(store.payload_path(Format::Xml, &sha))
            .await
            .unwrap();

        let second = runtime_with(Some(ledger.clone() as Arc<dyn Ledger>)).await;
        run_queue_download(&io, &second, &fetcher, vec![target(&url, "BOE-A-2026-1")], options())
            .await
            .unwrap();
        let second_totals = second.stats.totals().await;
        assert_eq!(second_totals.ok, 0);
        assert_eq!(second_totals.skipped_304, 1);

        // The 304 attempt closed and only refreshed the status triplet.
        assert_eq!(ledger.open_attempts().await, 0);
        let status = ledger
            .format_status(1, Format::Xml)
            .await
            .unwrap();
        assert!(status.downloaded);
        assert_eq!(status.sha256.as_deref(), Some(sha.as_str()));
    }
}
