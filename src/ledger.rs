//! Relational ledger for resources and download attempts.
//!
//! Two tables under the `ingest` schema: `resource`, keyed by
//! `(source_kind, resource_key)` with one slot triplet per payload format,
//! and `attempt`, one row per HTTP interaction. Every operation is
//! idempotent on its own; there are no cross-table transactions. The
//! pipeline talks to the `Ledger` trait so tests can swap in an in-memory
//! implementation.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::data_structures::Format;

/// Download state of one format slot on a resource row.
#[derive(Clone, Debug, Default)]
pub struct FormatStatus {
    pub downloaded: bool,
    pub sha256: Option<String>,
    pub storage_uri: Option<String>,
}

/// Everything recorded when an attempt is closed.
#[derive(Clone, Debug, Default)]
pub struct AttemptClose {
    pub duration_ms: i64,
    pub http_status: Option<i32>,
    pub response_headers: serde_json::Value,
    pub content_type: Option<String>,
    pub content_length: Option<i64>,
    pub sha256: Option<String>,
    pub storage_uri: Option<String>,
    pub error_type: Option<String>,
    pub error_detail: Option<String>,
}

/// Full per-format update after an attempt.
#[derive(Clone, Debug)]
pub struct FormatUpdate {
    pub ok: bool,
    pub downloaded_at: DateTime<Utc>,
    pub http_status: Option<i32>,
    pub sha256: Option<String>,
    pub storage_uri: Option<String>,
    pub error: Option<String>,
}

#[async_trait]
pub trait Ledger: Send + Sync {
    /// Create or refresh a resource row. Non-null URLs overwrite their
    /// slot; nulls preserve whatever is already there.
    async fn upsert_resource(
        &self,
        source_kind: &str,
        resource_key: &str,
        url_xml: Option<&str>,
        url_json: Option<&str>,
        url_pdf: Option<&str>,
    ) -> Result<i64>;

    async fn format_status(&self, resource_id: i64, format: Format) -> Result<FormatStatus>;

    /// Open an attempt row. The caller owns closing it, on every path.
    async fn attempt_start(
        &self,
        resource_id: i64,
        format: Format,
        request_url: &str,
        accept: &str,
    ) -> Result<i64>;

    async fn attempt_finish(&self, attempt_id: i64, close: AttemptClose) -> Result<()>;

    async fn update_format(
        &self,
        resource_id: i64,
        format: Format,
        update: FormatUpdate,
    ) -> Result<()>;

    /// 304 path: refresh only the status triplet, keep sha/uri/error.
    async fn update_format_not_modified(
        &self,
        resource_id: i64,
        format: Format,
        ok: bool,
        downloaded_at: DateTime<Utc>,
        http_status: Option<i32>,
    ) -> Result<()>;
}

const UPSERT_RESOURCE: &str = "\
INSERT INTO ingest.resource (source_kind, resource_key, url_xml, url_json, url_pdf)
VALUES ($1, $2, $3, $4, $5)
ON CONFLICT (source_kind, resource_key)
DO UPDATE SET
  url_xml  = COALESCE(EXCLUDED.url_xml,  ingest.resource.url_xml),
  url_json = COALESCE(EXCLUDED.url_json, ingest.resource.url_json),
  url_pdf  = COALESCE(EXCLUDED.url_pdf,  ingest.resource.url_pdf),
  updated_at = now()
RETURNING resource_id";

const ATTEMPT_START: &str = "\
INSERT INTO ingest.attempt (resource_id, format, request_url, accept_header, requested_at)
VALUES ($1, $2, $3, $4, now())
RETURNING attempt_id";

const ATTEMPT_FINISH: &str = "\
UPDATE ingest.attempt
SET finished_at = now(),
    duration_ms = $2,
    http_status = $3,
    response_headers = $4,
    content_type = $5,
    content_length = $6,
    sha256 = $7,
    storage_uri = $8,
    error_type = $9,
    error_detail = $10
WHERE attempt_id = $1";

fn format_status_sql(format: Format) -> &'static str {
    match format {
        Format::Xml => {
            "SELECT xml_downloaded, xml_sha256, xml_storage_uri
             FROM ingest.resource WHERE resource_id = $1"
        }
        Format::Json => {
            "SELECT json_downloaded, json_sha256, json_storage_uri
             FROM ingest.resource WHERE resource_id = $1"
        }
        Format::Pdf => {
            "SELECT pdf_downloaded, pdf_sha256, pdf_storage_uri
             FROM ingest.resource WHERE resource_id = $1"
        }
    }
}

fn update_format_sql(format: Format) -> &'static str {
    match format {
        Format::Xml => {
            "UPDATE ingest.resource
             SET xml_downloaded = $2, xml_downloaded_at = $3, xml_http_status = $4,
                 xml_sha256 = $5, xml_storage_uri = $6, xml_error = $7, updated_at = now()
             WHERE resource_id = $1"
        }
        Format::Json => {
            "UPDATE ingest.resource
             SET json_downloaded = $2, json_downloaded_at = $3, json_http_status = $4,
                 json_sha256 = $5, json_storage_uri = $6, json_error = $7, updated_at = now()
             WHERE resource_id = $1"
        }
        Format::Pdf => {
            "UPDATE ingest.resource
             SET pdf_downloaded = $2, pdf_downloaded_at = $3, pdf_http_status = $4,
                 pdf_sha256 = $5, pdf_storage_uri = $6, pdf_error = $7, updated_at = now()
             WHERE resource_id = $1"
        }
    }
}

fn update_format_not_modified_sql(format: Format) -> &'static str {
    match format {
        Format::Xml => {
            "UPDATE ingest.resource
             SET xml_downloaded = $2, xml_downloaded_at = $3, xml_http_status = $4,
                 updated_at = now()
             WHERE resource_id = $1"
        }
        Format::Json => {
            "UPDATE ingest.resource
             SET json_downloaded = $2, json_downloaded_at = $3, json_http_status = $4,
                 updated_at = now()
             WHERE resource_id = $1"
        }
        Format::Pdf => {
            "UPDATE ingest.resource
             SET pdf_downloaded = $2, pdf_downloaded_at = $3, pdf_http_status = $4,
                 updated_at = now()
             WHERE resource_id = $1"
        }
    }
}

const SCHEMA_DDL: &[&str] = &[
    "CREATE SCHEMA IF NOT EXISTS ingest",
    "CREATE TABLE IF NOT EXISTS ingest.resource (
        resource_id   BIGSERIAL PRIMARY KEY,
        source_kind   TEXT NOT NULL,
        resource_key  TEXT NOT NULL,
        url_xml       TEXT,
        url_json      TEXT,
        url_pdf       TEXT,
        xml_downloaded      BOOLEAN NOT NULL DEFAULT FALSE,
        xml_downloaded_at   TIMESTAMPTZ,
        xml_http_status     INTEGER,
        xml_sha256          TEXT,
        xml_storage_uri     TEXT,
        xml_error           TEXT,
        json_downloaded     BOOLEAN NOT NULL DEFAULT FALSE,
        json_downloaded_at  TIMESTAMPTZ,
        json_http_status    INTEGER,
        json_sha256         TEXT,
        json_storage_uri    TEXT,
        json_error          TEXT,
        pdf_downloaded      BOOLEAN NOT NULL DEFAULT FALSE,
        pdf_downloaded_at   TIMESTAMPTZ,
        pdf_http_status     INTEGER,
        pdf_sha256          TEXT,
        pdf_storage_uri     TEXT,
        pdf_error           TEXT,
        created_at    TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at    TIMESTAMPTZ NOT NULL DEFAULT now(),
        UNIQUE (source_kind, resource_key)
    )",
    "CREATE TABLE IF NOT EXISTS ingest.attempt (
        attempt_id       BIGSERIAL PRIMARY KEY,
        resource_id      BIGINT NOT NULL REFERENCES ingest.resource(resource_id),
        format           TEXT NOT NULL,
        request_url      TEXT NOT NULL,
        accept_header    TEXT,
        requested_at     TIMESTAMPTZ NOT NULL DEFAULT now(),
        finished_at      TIMESTAMPTZ,
        duration_ms      BIGINT,
        http_status      INTEGER,
        response_headers JSONB,
        content_type     TEXT,
        content_length   BIGINT,
        sha256           TEXT,
        storage_uri      TEXT,
        error_type       TEXT,
        error_detail     TEXT
    )",
];

/// Postgres-backed ledger.
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub async fn connect(dsn: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .min_connections(1)
            .max_connections(5)
            .connect(dsn)
            .await
            .context("connecting to the ledger database")?;
        Ok(PgLedger { pool })
    }

    /// Create the schema when it does not exist yet. Safe to run on every
    /// startup.
    pub async fn ensure_schema(&self) -> Result<()> {
        for ddl in SCHEMA_DDL {
            sqlx::query(ddl)
                .execute(&self.pool)
                .await
                .context("applying ledger schema")?;
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl Ledger for PgLedger {
    async fn upsert_resource(
        &self,
        source_kind: &str,
        resource_key: &str,
        url_xml: Option<&str>,
        url_json: Option<&str>,
        url_pdf: Option<&str>,
    ) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(UPSERT_RESOURCE)
            .bind(source_kind)
            .bind(resource_key)
            .bind(url_xml)
            .bind(url_json)
            .bind(url_pdf)
            .fetch_one(&self.pool)
            .await
            .context("upserting resource")?;
        Ok(id)
    }

    async fn format_status(&self, resource_id: i64, format: Format) -> Result<FormatStatus> {
        let row: Option<(bool, Option<String>, Option<String>)> =
            sqlx::query_as(format_status_sql(format))
                .bind(resource_id)
                .fetch_optional(&self.pool)
                .await
                .context("reading format status")?;
        Ok(match row {
            Some((downloaded, sha256, storage_uri)) => FormatStatus {
                downloaded,
                sha256,
                storage_uri,
            },
            None => FormatStatus::default(),
        })
    }

    async fn attempt_start(
        &self,
        resource_id: i64,
        format: Format,
        request_url: &str,
        accept: &str,
    ) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(ATTEMPT_START)
            .bind(resource_id)
            .bind(format.as_str())
            .bind(request_url)
            .bind(accept)
            .fetch_one(&self.pool)
            .await
            .context("opening attempt")?;
        Ok(id)
    }

    async fn attempt_finish(&self, attempt_id: i64, close: AttemptClose) -> Result<()> {
        sqlx::query(ATTEMPT_FINISH)
            .bind(attempt_id)
            .bind(close.duration_ms)
            .bind(close.http_status)
            .bind(close.response_headers)
            .bind(close.content_type)
            .bind(close.content_length)
            .bind(close.sha256)
            .bind(close.storage_uri)
            .bind(close.error_type)
            .bind(close.error_detail)
            .execute(&self.pool)
            .await
            .context("closing attempt")?;
        Ok(())
    }

    async fn update_format(
        &self,
        resource_id: i64,
        format: Format,
        update: FormatUpdate,
    ) -> Result<()> {
        sqlx::query(update_format_sql(format))
            .bind(resource_id)
            .bind(update.ok)
            .bind(update.downloaded_at)
            .bind(update.http_status)
            .bind(update.sha256)
            .bind(update.storage_uri)
            .bind(update.error)
            .execute(&self.pool)
            .await
            .context("updating resource format")?;
        Ok(())
    }

    async fn update_format_not_modified(
        &self,
        resource_id: i64,
        format: Format,
        ok: bool,
        downloaded_at: DateTime<Utc>,
        http_status: Option<i32>,
    ) -> Result<()> {
        sqlx::query(update_format_not_modified_sql(format))
            .bind(resource_id)
            .bind(ok)
            .bind(downloaded_at)
            .bind(http_status)
            .execute(&self.pool)
            .await
            .context("updating resource format (not modified)")?;
        Ok(())
    }
}
