//! Live run dashboard.
//!
//! `DashboardState` is a thread-safe mirror of the run counters that workers
//! and the system loop push into; the axum server exposes it as an HTML
//! panel (with the current snapshot inlined) and a JSON endpoint the page
//! polls every 800 ms. The HTTP-class buckets are derived from each item's
//! status here, never stored as authoritative truth.

use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::http::header;
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Local;
use serde_derive::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::cli::ConfigError;

#[derive(Serialize, Clone, Debug, Default)]
pub struct DashboardSnapshot {
    pub run_id: String,
    pub cmd: String,
    pub status: String,
    pub last_update_local: String,
    pub total: u64,
    pub done: u64,
    pub ok: u64,
    pub bytes: u64,
    pub xml_ok: u64,
    pub pdf_ok: u64,
    pub skipped_304: u64,
    pub errors: u64,
    pub http_2xx: u64,
    pub http_3xx: u64,
    pub http_4xx: u64,
    pub http_5xx: u64,
    pub http_429: u64,
    pub timeouts: u64,
    pub client_errors: u64,
    pub other_errors: u64,
    pub concurrency: u64,
    pub concurrency_max_cfg: u64,
    pub max_concurrency_reached: u64,
    pub cpu_pct: String,
    pub ram_text: String,
}

pub struct DashboardState {
    inner: Mutex<DashboardSnapshot>,
}

impl DashboardState {
    pub fn new() -> Self {
        DashboardState {
            inner: Mutex::new(DashboardSnapshot {
                status: "IDLE".to_string(),
                last_update_local: "-".to_string(),
                cpu_pct: "n/a".to_string(),
                ram_text: "n/a".to_string(),
                ..Default::default()
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, DashboardSnapshot> {
        self.inner.lock().expect("dashboard state poisoned")
    }

    pub fn snapshot(&self) -> DashboardSnapshot {
        self.lock().clone()
    }

    pub fn set_run_info(&self, run_id: &str, cmd: &str) {
        let mut s = self.lock();
        s.run_id = run_id.to_string();
        s.cmd = cmd.to_string();
    }

    pub fn set_status(&self, status: &str) {
        self.lock().status = status.to_string();
    }

    pub fn set_timestamp(&self) {
        self.lock().last_update_local = Local::now().format("%d/%m/%Y %H:%M:%S").to_string();
    }

    pub fn set_total(&self, total: u64) {
        self.lock().total = total;
    }

    pub fn set_concurrency(&self, value: u64) {
        self.lock().concurrency = value;
    }

    pub fn set_limits(&self, max_cfg: u64, max_reached: u64) {
        let mut s = self.lock();
        s.concurrency_max_cfg = max_cfg;
        s.max_concurrency_reached = max_reached;
    }

    pub fn set_system(&self, cpu_pct: &str, ram_text: &str) {
        let mut s = self.lock();
        s.cpu_pct = cpu_pct.to_string();
        s.ram_text = ram_text.to_string();
    }

    /// Overwrite the aggregate counters from the run stats, which are the
    /// source of truth for totals.
    #[allow(clippy::too_many_arguments)]
    pub fn sync_totals(
        &self,
        done: u64,
        ok: u64,
        skipped_304: u64,
        errors: u64,
        http_429: u64,
        http_5xx: u64,
        bytes: u64,
    ) {
        let mut s = self.lock();
        s.done = done;
        s.ok = ok;
        s.skipped_304 = skipped_304;
        s.errors = errors;
        s.http_429 = http_429;
        s.http_5xx = http_5xx;
        s.bytes = bytes;
    }

    /// Record one completed item, deriving the HTTP-class buckets and the
    /// error classes from its status.
    pub fn update_item(
        &self,
        status: Option<u16>,
        nbytes: u64,
        url: &str,
        timeout: bool,
        format_hint: &str,
    ) {
        let mut s = self.lock();
        s.done += 1;
        s.bytes += nbytes;
        s.last_update_local = Local::now().format("%d/%m/%Y %H:%M:%S").to_string();

        if timeout {
            s.timeouts += 1;
            s.errors += 1;
            return;
        }
        let status = match status {
            None => {
                s.other_errors += 1;
                s.errors += 1;
                return;
            }
            Some(status) => status,
        };

        if status == 304 {
            s.skipped_304 += 1;
            s.http_3xx += 1;
            return;
        }
        if (200..300).contains(&status) {
            s.ok += 1;
            s.http_2xx += 1;
            if is_pdf_success(url, format_hint) {
                s.pdf_ok += 1;
            } else {
                s.xml_ok += 1;
            }
            return;
        }
        if (300..400).contains(&status) {
            s.http_3xx += 1;
            return;
        }
        if status == 429 {
            s.http_429 += 1;
        }
        if (400..500).contains(&status) {
            s.http_4xx += 1;
            s.client_errors += 1;
            s.errors += 1;
        } else {
            s.http_5xx += 1;
            s.other_errors += 1;
            s.errors += 1;
        }
    }
}

impl Default for DashboardState {
    fn default() -> Self {
        Self::new()
    }
}

/// The dashboard counts every non-PDF success as XML.
fn is_pdf_success(url: &str, format_hint: &str) -> bool {
    let url = url.to_ascii_lowercase();
    format_hint.to_ascii_lowercase().contains("application/pdf")
        || url.ends_with(".pdf")
        || url.contains("/pdfs/")
}

/// Handle to the running dashboard server.
pub struct DashboardServer {
    pub url: String,
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl DashboardServer {
    /// Ask the server to exit and wait briefly for it.
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = tokio::time::timeout(std::time::Duration::from_secs(2), self.handle).await;
    }
}

/// Bind and serve the dashboard. A port that cannot be bound is an operator
/// problem, reported as a configuration error.
pub async fn start_dashboard(
    state: Arc<DashboardState>,
    host: &str,
    port: u16,
) -> Result<DashboardServer, ConfigError> {
    let listener = tokio::net::TcpListener::bind((host, port))
        .await
        .map_err(|e| ConfigError(format!("cannot bind dashboard to {host}:{port}: {e}")))?;
    let local = listener
        .local_addr()
        .map_err(|e| ConfigError(format!("dashboard listener has no address: {e}")))?;

    let router = Router::new()
        .route("/", get(index))
        .route("/api/state", get(api_state))
        .with_state(state);

    let (shutdown, rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        let serve = axum::serve(listener, router).with_graceful_shutdown(async move {
            let _ = rx.await;
        });
        if let Err(e) = serve.await {
            log::error!("dashboard server failed: {e}");
        }
    });

    Ok(DashboardServer {
        url: format!("http://{local}"),
        shutdown,
        handle,
    })
}

async fn index(State(state): State<Arc<DashboardState>>) -> impl IntoResponse {
    (
        [(header::CACHE_CONTROL, "no-store")],
        Html(render_html(&state.snapshot())),
    )
}

async fn api_state(State(state): State<Arc<DashboardState>>) -> impl IntoResponse {
    ([(header::CACHE_CONTROL, "no-store")], Json(state.snapshot()))
}

fn render_html(snapshot: &DashboardSnapshot) -> String {
    let payload = serde_json::to_string(snapshot).expect("snapshot serialization");
    HTML_TEMPLATE.replace("__STATE__", &payload)
}

const HTML_TEMPLATE: &str = r#"<!doctype html>
<html lang="en">
  <head>
    <meta charset="utf-8" />
    <meta name="viewport" content="width=device-width, initial-scale=1" />
    <title>BOE ingestion dashboard</title>
    <style>
      :root {
        --bg: #0b0f1a; --panel: #121829; --card: #1a2336;
        --text: #e2e8f0; --muted: #94a3b8; --accent: #38bdf8;
        --track: #25314a; --warn: #f59e0b; --err: #ef4444; --ok: #22c55e;
      }
      * { box-sizing: border-box; }
      body { margin: 0; background: var(--bg); color: var(--text); font-family: Arial, sans-serif; }
      .frame { width: min(1200px, 100%); padding: clamp(16px, 2.5vw, 32px); margin: 0 auto; }
      .shell { background: var(--panel); border-radius: 24px; padding: clamp(24px, 3.2vw, 40px); }
      h1 { margin: 0; font-size: 28px; }
      .subtitle { color: var(--muted); font-size: 14px; margin-top: 6px; }
      .run-meta { display: flex; align-items: center; gap: 12px; margin-top: 16px; flex-wrap: wrap; }
      .run-chip { background: #1b2a44; color: var(--accent); font-size: 11px; letter-spacing: 1px;
                  padding: 4px 10px; border-radius: 999px; }
      .run-value { font-size: 14px; font-weight: bold; overflow-wrap: anywhere; }
      .grid { display: grid; grid-template-columns: repeat(auto-fit, minmax(260px, 1fr));
              gap: 24px; margin-top: 24px; }
      .card { background: var(--card); border-radius: 16px; padding: 24px; min-height: 150px; }
      .label { color: var(--muted); font-size: 12px; letter-spacing: 1px; }
      .value-lg { margin-top: 18px; font-size: 24px; overflow-wrap: anywhere; }
      .bar { margin-top: 16px; height: 12px; border-radius: 999px; background: var(--track);
             position: relative; }
      .bar-fill { position: absolute; left: 0; top: 0; height: 12px; border-radius: 999px;
                  background: var(--ok); width: 0%; }
      .value-sm { margin-top: 16px; color: var(--muted); font-size: 12px; }
      .bars { display: flex; align-items: flex-end; gap: 28px; margin-top: 24px; height: 110px; }
      .bars > div { width: 46px; height: 8px; }
      .bar-counts, .bar-labels { display: flex; gap: 52px; margin-top: 6px; font-size: 11px;
                                 color: var(--muted); }
      .metrics { margin-top: 16px; display: grid; gap: 8px; font-size: 12px; }
    </style>
  </head>
  <body>
    <div class="frame">
      <div class="shell">
        <h1>BOE ingestion dashboard</h1>
        <div class="subtitle">Live progress and run metrics</div>
        <div class="run-meta">
          <div class="run-chip">RUN</div><div class="run-value" id="run-id">-</div>
          <div class="run-chip">CMD</div><div class="run-value" id="run-cmd">-</div>
          <div class="run-chip">STATUS</div><div class="run-value" id="run-status">-</div>
          <div class="run-chip">UPDATED</div><div class="run-value" id="run-time">-</div>
        </div>

        <div class="grid">
          <div class="card">
            <div class="label">TOTAL PROGRESS</div>
            <div class="value-lg" id="progress-count">0 / 0</div>
            <div class="bar"><div class="bar-fill" id="progress-bar"></div></div>
            <div class="value-sm" id="progress-meta">0%&nbsp;&nbsp;OK: 0</div>
          </div>

          <div class="card">
            <div class="label">DOWNLOADS</div>
            <div class="value-lg" id="bytes-total">0 B</div>
            <div class="metrics">
              <div>XML ok: <span id="xml-ok">0</span></div>
              <div>PDF ok: <span id="pdf-ok">0</span></div>
              <div>Skipped 304: <span id="metric-304">0</span></div>
            </div>
          </div>

          <div class="card">
            <div class="label">ERRORS</div>
            <div class="bars">
              <div id="err-timeouts" style="background: var(--warn);"></div>
              <div id="err-client" style="background: var(--accent);"></div>
              <div id="err-other" style="background: var(--err);"></div>
            </div>
            <div class="bar-counts">
              <div id="err-timeouts-count">0</div>
              <div id="err-client-count">0</div>
              <div id="err-other-count">0</div>
            </div>
            <div class="bar-labels"><div>Timeouts</div><div>Client</div><div>Other</div></div>
          </div>

          <div class="card">
            <div class="label">HTTP STATUS</div>
            <div class="bars">
              <div id="http-2xx" style="background: var(--ok);"></div>
              <div id="http-3xx" style="background: var(--accent);"></div>
              <div id="http-4xx" style="background: var(--warn);"></div>
              <div id="http-5xx" style="background: var(--err);"></div>
            </div>
            <div class="bar-counts">
              <div id="http-2xx-count">0</div>
              <div id="http-3xx-count">0</div>
              <div id="http-4xx-count">0</div>
              <div id="http-5xx-count">0</div>
            </div>
            <div class="bar-labels"><div>2xx</div><div>3xx</div><div>4xx</div><div>5xx</div></div>
          </div>

          <div class="card">
            <div class="label">RUN METRICS</div>
            <div class="metrics">
              <div id="metric-errors">Errors: 0</div>
              <div id="metric-429">HTTP 429: 0</div>
              <div id="metric-concurrency">Concurrency: 0</div>
              <div id="metric-max-cfg">Max configured: 0</div>
              <div id="metric-max-hit">Max reached: 0</div>
              <div id="metric-cpu">CPU: n/a</div>
              <div id="metric-ram">RAM: n/a</div>
            </div>
          </div>
        </div>
      </div>
    </div>

    <script>
      const initialState = __STATE__;

      function formatBytes(value) {
        if (value <= 0) return "0 B";
        const mb = value / (1024 * 1024);
        if (mb >= 0.1) return `${mb.toFixed(1)} MB`;
        const kb = value / 1024;
        if (kb >= 0.1) return `${kb.toFixed(1)} KB`;
        return `${value} B`;
      }

      function setBarHeight(el, value, max, height) {
        const h = Math.max(6, Math.round((value / Math.max(max, 1)) * height));
        el.style.height = `${h}px`;
      }

      function render(s) {
        const total = s.total || 0;
        const done = s.done || 0;
        const percent = total ? Math.round((done / total) * 100) : 0;

        document.getElementById("run-id").textContent = s.run_id || "-";
        document.getElementById("run-cmd").textContent = s.cmd || "-";
        document.getElementById("run-status").textContent = s.status || "-";
        document.getElementById("run-time").textContent = s.last_update_local || "-";
        document.getElementById("progress-count").textContent = `${done} / ${total}`;
        document.getElementById("progress-meta").textContent = `${percent}%  OK: ${s.ok || 0}`;
        document.getElementById("progress-bar").style.width = `${percent}%`;

        document.getElementById("bytes-total").textContent = formatBytes(s.bytes || 0);
        document.getElementById("xml-ok").textContent = s.xml_ok || 0;
        document.getElementById("pdf-ok").textContent = s.pdf_ok || 0;
        document.getElementById("metric-304").textContent = s.skipped_304 || 0;

        document.getElementById("metric-errors").textContent = `Errors: ${s.errors || 0}`;
        document.getElementById("metric-429").textContent = `HTTP 429: ${s.http_429 || 0}`;
        document.getElementById("metric-concurrency").textContent = `Concurrency: ${s.concurrency || 0}`;
        document.getElementById("metric-max-cfg").textContent = `Max configured: ${s.concurrency_max_cfg || 0}`;
        document.getElementById("metric-max-hit").textContent = `Max reached: ${s.max_concurrency_reached || 0}`;
        document.getElementById("metric-cpu").textContent = `CPU: ${s.cpu_pct || "n/a"}`;
        document.getElementById("metric-ram").textContent = `RAM: ${s.ram_text || "n/a"}`;

        document.getElementById("err-timeouts-count").textContent = s.timeouts || 0;
        document.getElementById("err-client-count").textContent = s.client_errors || 0;
        document.getElementById("err-other-count").textContent = s.other_errors || 0;
        const errMax = Math.max(s.timeouts || 0, s.client_errors || 0, s.other_errors || 0, 1);
        setBarHeight(document.getElementById("err-timeouts"), s.timeouts || 0, errMax, 110);
        setBarHeight(document.getElementById("err-client"), s.client_errors || 0, errMax, 110);
        setBarHeight(document.getElementById("err-other"), s.other_errors || 0, errMax, 110);

        document.getElementById("http-2xx-count").textContent = s.http_2xx || 0;
        document.getElementById("http-3xx-count").textContent = s.http_3xx || 0;
        document.getElementById("http-4xx-count").textContent = s.http_4xx || 0;
        document.getElementById("http-5xx-count").textContent = s.http_5xx || 0;
        const httpMax = Math.max(s.http_2xx || 0, s.http_3xx || 0, s.http_4xx || 0, s.http_5xx || 0, 1);
        setBarHeight(document.getElementById("http-2xx"), s.http_2xx || 0, httpMax, 110);
        setBarHeight(document.getElementById("http-3xx"), s.http_3xx || 0, httpMax, 110);
        setBarHeight(document.getElementById("http-4xx"), s.http_4xx || 0, httpMax, 110);
        setBarHeight(document.getElementById("http-5xx"), s.http_5xx || 0, httpMax, 110);
      }

      async function fetchState() {
        try {
          const res = await fetch("/api/state");
          if (!res.ok) return;
          render(await res.json());
        } catch (err) {}
      }

      render(initialState);
      setInterval(fetchState, 800);
    </script>
  </body>
</html>
"#;
