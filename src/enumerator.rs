//! Target enumeration from the two upstream listings.
//!
//! `consolidada` starts from the consolidated-legislation catalog (JSON) and
//! keeps only entries with a canonical ELI URL; `sumario` starts from the
//! daily index XML and collects its `url_xml` children. Both produce the
//! same `Target` shape for the pipeline, deterministically for the same
//! input bytes.

use std::collections::HashSet;
use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use quick_xml::events::Event;
use quick_xml::Reader;
use regex::Regex;

use crate::cli::Part;
use crate::data_structures::{Format, SourceKind, Target, BASE_URL, LEGIS_API, SUMARIO_API};
use crate::fetcher::Fetcher;

fn boe_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"BOE-[A-Z]-\d{4}-\d+").expect("BOE id pattern"))
}

fn url_xml_fallback_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<url_xml>(.*?)</url_xml>").expect("url_xml pattern"))
}

fn unique_preserve_order(values: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    values
        .into_iter()
        .filter(|v| seen.insert(v.clone()))
        .collect()
}

/// One usable row of the consolidated catalog.
#[derive(Clone, Debug, PartialEq)]
pub struct CatalogEntry {
    pub doc_id: String,
    pub url_eli: String,
}

/// True for canonical ELI URLs on the bulletin host.
pub fn is_eli_url(url: &str) -> bool {
    url.trim().starts_with(&format!("{BASE_URL}/eli/"))
}

/// Catalog listing URL, with the optional update-date window propagated
/// upstream.
pub fn catalog_url(from: Option<&str>, to: Option<&str>) -> String {
    let mut params = Vec::new();
    if let Some(from) = from {
        params.push(format!("from={from}"));
    }
    if let Some(to) = to {
        params.push(format!("to={to}"));
    }
    params.push("limit=-1".to_string());
    format!("{LEGIS_API}?{}", params.join("&"))
}

/// Consolidated-document URL for one identifier, optionally narrowed to a
/// document part.
pub fn consolidated_id_url(doc_id: &str, part: Part) -> String {
    match part.segment() {
        Some(segment) => format!("{LEGIS_API}/id/{doc_id}/{segment}"),
        None => format!("{LEGIS_API}/id/{doc_id}"),
    }
}

pub fn sumario_url(date: &str) -> String {
    format!("{SUMARIO_API}/{date}")
}

/// Parse the catalog payload: either a bare JSON array or one wrapped in a
/// `data` field. Entries without an identifier or ELI URL are dropped here;
/// prefix filtering happens in `build_consolidated_targets`.
pub fn parse_catalog(raw: &[u8]) -> Result<Vec<CatalogEntry>> {
    let value: serde_json::Value =
        serde_json::from_slice(raw).context("catalog payload is not valid JSON")?;
    let items = match &value {
        serde_json::Value::Array(items) => items.as_slice(),
        serde_json::Value::Object(map) => match map.get("data") {
            Some(serde_json::Value::Array(items)) => items.as_slice(),
            _ => anyhow::bail!("unexpected catalog JSON shape"),
        },
        _ => anyhow::bail!("unexpected catalog JSON shape"),
    };
    Ok(items
        .iter()
        .filter_map(|item| {
            let doc_id = item.get("identificador")?.as_str()?.to_string();
            let url_eli = item.get("url_eli")?.as_str()?.trim().to_string();
            if doc_id.is_empty() || url_eli.is_empty() {
                return None;
            }
            Some(CatalogEntry { doc_id, url_eli })
        })
        .collect())
}

/// Build download targets from catalog entries: ELI-prefixed rows only,
/// optionally narrowed by an allow-list of exact ELIs.
pub fn build_consolidated_targets(
    entries: &[CatalogEntry],
    part: Part,
    allowlist: Option<&HashSet<String>>,
    accept: &str,
) -> Vec<Target> {
    entries
        .iter()
        .filter(|e| is_eli_url(&e.url_eli))
        .filter(|e| allowlist.map_or(true, |wanted| wanted.contains(e.url_eli.trim())))
        .map(|e| Target {
            key: e.url_eli.trim().to_string(),
            url: consolidated_id_url(&e.doc_id, part),
            format: Format::Xml,
            source_kind: SourceKind::ConsolidadaId,
            accept: accept.to_string(),
        })
        .collect()
}

/// Extract the per-item XML URLs from a daily index payload.
///
/// The structured pass matches elements by local name, so namespaced
/// documents work; if the document does not parse, a regex sweep over the
/// raw text recovers whatever `<url_xml>` pairs it can. Order is preserved
/// and duplicates are dropped keeping the first occurrence.
pub fn extract_sumario_item_urls(xml: &[u8]) -> Vec<String> {
    let text = String::from_utf8_lossy(xml);
    match extract_urls_structured(&text) {
        Some(urls) => unique_preserve_order(urls),
        None => {
            let urls = url_xml_fallback_re()
                .captures_iter(&text)
                .map(|c| c[1].trim().to_string())
                .filter(|u| !u.is_empty())
                .collect();
            unique_preserve_order(urls)
        }
    }
}

fn extract_urls_structured(text: &str) -> Option<Vec<String>> {
    let mut reader = Reader::from_str(text);
    let mut urls = Vec::new();
    let mut capturing = false;
    let mut current = String::new();
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"url_xml" => {
                capturing = true;
                current.clear();
            }
            Ok(Event::Text(t)) if capturing => {
                current.push_str(&t.unescape().ok()?);
            }
            Ok(Event::End(e)) if e.local_name().as_ref() == b"url_xml" => {
                capturing = false;
                let url = current.trim().to_string();
                if !url.is_empty() {
                    urls.push(url);
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(_) => return None,
        }
    }
    Some(urls)
}

/// Daily-index targets. Keys prefer the BOE identifier embedded in the URL.
pub fn build_sumario_targets(urls: &[String], accept: &str) -> Vec<Target> {
    urls.iter()
        .map(|u| {
            let url = if u.starts_with('/') {
                format!("{BASE_URL}{u}")
            } else {
                u.clone()
            };
            let key = boe_id_re()
                .find(&url)
                .map(|m| m.as_str().to_string())
                .unwrap_or_else(|| url.clone());
            Target {
                key,
                url,
                format: Format::Xml,
                source_kind: SourceKind::SumarioItem,
                accept: accept.to_string(),
            }
        })
        .collect()
}

/// Load an ELI allow-list: one ELI per line, blanks ignored.
pub async fn load_allowlist(path: &Path) -> Result<HashSet<String>> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading allow-list {}", path.display()))?;
    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

/// Fetch and parse the consolidated catalog, falling back to the cache slot
/// when the upstream answers 304.
pub async fn fetch_catalog_entries(
    fetcher: &Fetcher,
    from: Option<&str>,
    to: Option<&str>,
) -> Result<Vec<CatalogEntry>> {
    let url = catalog_url(from, to);
    let (bytes, _status) = fetcher
        .fetch_bytes(&url, "application/json")
        .await
        .context("fetching consolidated catalog")?;
    parse_catalog(&bytes)
}

/// Fetch the daily index payload for a date, with the same cache fallback.
pub async fn fetch_sumario_xml(fetcher: &Fetcher, date: &str) -> Result<Vec<u8>> {
    let url = sumario_url(date);
    let (bytes, _status) = fetcher
        .fetch_bytes(&url, "application/xml")
        .await
        .with_context(|| format!("fetching daily index {date}"))?;
    Ok(bytes)
}
