//! Command-line surface.
//!
//! Two subcommands (`consolidada` for the legislation catalog, `sumario`
//! for the daily index) over a common set of store/network/concurrency
//! options. Validation failures surface as `ConfigError` and exit the
//! process with code 2.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use thiserror::Error;

use crate::data_structures::{Format, JitterMode};

pub const DEFAULT_STORE: &str = "./boe_store";
pub const DEFAULT_TIMEOUT_S: u64 = 90;
pub const DEFAULT_RETRIES: u32 = 6;
pub const DEFAULT_BASE_DELAY: f64 = 0.5;
pub const DEFAULT_CAP_DELAY: f64 = 20.0;
pub const DEFAULT_CONCURRENCY_START: usize = 10;
pub const DEFAULT_CONCURRENCY_MAX: usize = 25;
pub const DEFAULT_CPU_HIGH_PCT: f32 = 85.0;
pub const DEFAULT_CPU_LOW_PCT: f32 = 70.0;

/// A startup problem the operator has to fix; reported with exit code 2.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ConfigError(pub String);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Concurrency {
    Auto,
    Fixed(usize),
}

pub fn parse_concurrency(value: &str) -> Result<Concurrency, String> {
    let v = value.trim().to_ascii_lowercase();
    if v == "auto" || v == "a" {
        return Ok(Concurrency::Auto);
    }
    match v.parse::<usize>() {
        Ok(n) if n >= 1 => Ok(Concurrency::Fixed(n)),
        _ => Err("concurrency must be an integer >= 1 or 'auto'".to_string()),
    }
}

/// Accepts YYYYMMDD or DD-MM-YYYY; yields YYYYMMDD.
pub fn normalize_date(value: &str) -> Result<String, String> {
    let v = value.trim();
    if v.len() == 8 && v.bytes().all(|b| b.is_ascii_digit()) {
        return Ok(v.to_string());
    }
    let parts: Vec<&str> = v.split('-').collect();
    if parts.len() == 3
        && parts[0].len() == 2
        && parts[1].len() == 2
        && parts[2].len() == 4
        && parts.iter().all(|p| p.bytes().all(|b| b.is_ascii_digit()))
    {
        return Ok(format!("{}{}{}", parts[2], parts[1], parts[0]));
    }
    Err("date must be YYYYMMDD or DD-MM-YYYY".to_string())
}

fn parse_yyyymmdd(value: &str) -> Result<String, String> {
    let v = value.trim();
    if v.len() == 8 && v.bytes().all(|b| b.is_ascii_digit()) {
        Ok(v.to_string())
    } else {
        Err("expected a YYYYMMDD date".to_string())
    }
}

/// Document part of a consolidated act.
#[derive(ValueEnum, Copy, Clone, Debug, PartialEq, Eq)]
pub enum Part {
    Full,
    Metadatos,
    Analisis,
    #[value(name = "metadata-eli")]
    MetadataEli,
    Texto,
    #[value(name = "texto/indice")]
    TextoIndice,
}

impl Part {
    /// URL path segment appended to the document URL; `full` adds nothing.
    pub fn segment(&self) -> Option<&'static str> {
        match self {
            Part::Full => None,
            Part::Metadatos => Some("metadatos"),
            Part::Analisis => Some("analisis"),
            Part::MetadataEli => Some("metadata-eli"),
            Part::Texto => Some("texto"),
            Part::TextoIndice => Some("texto/indice"),
        }
    }
}

#[derive(Parser, Clone, Debug)]
#[command(
    name = "boe-ingest",
    version,
    about = "BOE bulletin downloader with conditional caching and adaptive concurrency"
)]
pub struct CliArgs {
    /// Base directory of the blob store.
    #[arg(long, default_value = DEFAULT_STORE)]
    pub store: PathBuf,

    /// PostgreSQL DSN for the ingest ledger.
    #[arg(long, env = "BOE_DB_DSN")]
    pub db_dsn: Option<String>,

    /// Run without the ledger database.
    #[arg(long)]
    pub no_db: bool,

    /// Payload formats to ingest (comma separated).
    #[arg(long, value_delimiter = ',', default_value = "xml")]
    pub formats: Vec<Format>,

    /// Total per-request timeout in seconds.
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_S)]
    pub timeout: u64,

    /// Attempt budget per URL for 429/5xx/transport failures.
    #[arg(long, default_value_t = DEFAULT_RETRIES)]
    pub retries: u32,

    /// Fixed worker concurrency, or 'auto' for AIMD control.
    #[arg(long, default_value = "auto", value_parser = parse_concurrency)]
    pub concurrency: Concurrency,

    /// Initial target when concurrency is auto.
    #[arg(long, default_value_t = DEFAULT_CONCURRENCY_START)]
    pub concurrency_start: usize,

    /// Concurrency ceiling when auto.
    #[arg(long, default_value_t = DEFAULT_CONCURRENCY_MAX)]
    pub concurrency_max: usize,

    /// Seconds between live progress log lines.
    #[arg(long, default_value_t = 4)]
    pub ui_refresh: u64,

    /// Trace non-200 HTTP traffic.
    #[arg(long)]
    pub debug_http: bool,

    /// Trace all HTTP traffic (slower).
    #[arg(long)]
    pub debug_http_all: bool,

    /// Skip conditional request headers; payloads are still stored.
    #[arg(long)]
    pub no_cache: bool,

    /// CPU % above which the tuner backs off.
    #[arg(long, default_value_t = DEFAULT_CPU_HIGH_PCT)]
    pub cpu_high: f32,

    /// CPU % below which the tuner may raise concurrency.
    #[arg(long, default_value_t = DEFAULT_CPU_LOW_PCT)]
    pub cpu_low: f32,

    /// Backoff jitter strategy.
    #[arg(long, value_enum, default_value = "decorrelated")]
    pub jitter: JitterMode,

    /// Base backoff delay in seconds.
    #[arg(long, default_value_t = DEFAULT_BASE_DELAY)]
    pub base_delay: f64,

    /// Backoff ceiling in seconds.
    #[arg(long, default_value_t = DEFAULT_CAP_DELAY)]
    pub cap_delay: f64,

    /// Serve the live dashboard and open it in a browser.
    #[arg(long)]
    pub open_web: bool,

    /// Dashboard bind host.
    #[arg(long, default_value = "127.0.0.1")]
    pub web_host: String,

    /// Dashboard bind port.
    #[arg(long, default_value_t = 8000, value_parser = clap::value_parser!(u16).range(1..))]
    pub web_port: u16,

    /// Log to a file instead of stderr.
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Command {
    /// Download consolidated legislation for catalog entries with an ELI.
    Consolidada {
        /// Document part to request.
        #[arg(long, value_enum, default_value = "full")]
        part: Part,

        /// Accept header for the document requests.
        #[arg(long, default_value = "application/xml")]
        accept: String,

        /// Only entries updated since this date (YYYYMMDD).
        #[arg(long, value_parser = parse_yyyymmdd)]
        from: Option<String>,

        /// Only entries updated up to this date (YYYYMMDD).
        #[arg(long, value_parser = parse_yyyymmdd)]
        to: Option<String>,

        /// File with one ELI per line; only those are downloaded.
        #[arg(long)]
        allowlist_file: Option<PathBuf>,

        /// Manifest file name under the store's index/ directory.
        #[arg(long, default_value = "manifest_consolidada_eli.jsonl")]
        manifest_name: String,
    },

    /// Download the daily index and every item it lists.
    Sumario {
        /// Index date, YYYYMMDD (or DD-MM-YYYY).
        #[arg(long, value_parser = normalize_date)]
        date: String,

        /// Manifest file name under the store's index/ directory.
        #[arg(long, default_value = "manifest_sumario.jsonl")]
        manifest_name: String,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Consolidada { .. } => "consolidada",
            Command::Sumario { .. } => "sumario",
        }
    }
}

/// (max_limit, start) from the concurrency flags.
pub fn compute_concurrency(args: &CliArgs) -> (usize, usize) {
    match args.concurrency {
        Concurrency::Auto => (args.concurrency_max.max(1), args.concurrency_start.max(1)),
        Concurrency::Fixed(n) => (n, n),
    }
}
