//! Source registry, listing/detail scraping, pagination, and report
//! extraction for CHMM.
//!
//! A source is a configured job board: a base listing URL plus selector
//! rules. [`PageWalker`] turns a source into a lazy, finite sequence of
//! listing pages; [`fetch_details`] fills in descriptions through a bounded
//! worker pool with a cache short-circuit; [`extract_reports`] pulls text
//! out of uploaded PDFs keyed by content hash.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chmm_core::RawPosting;
use chmm_store::{CacheStore, FetchError, HttpFetcher, Namespace, ShutdownFlag};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "chmm-sources";

const MAX_DESCRIPTION_CHARS: usize = 20_000;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("invalid selector `{selector}` for source {source_id}")]
    Selector { source_id: String, selector: String },
    #[error("invalid base url `{url}`: {reason}")]
    BaseUrl { url: String, reason: String },
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// Selector rules for one listing page layout. Defaults cover the common
/// job-board markup; individual sources override what differs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingSelectors {
    #[serde(default = "default_item_selector")]
    pub item: String,
    #[serde(default = "default_title_selector")]
    pub title: String,
    #[serde(default = "default_company_selector")]
    pub company: String,
    #[serde(default = "default_location_selector")]
    pub location: String,
    #[serde(default = "default_date_selector")]
    pub date: String,
    #[serde(default = "default_link_selector")]
    pub link: String,
}

fn default_item_selector() -> String {
    "article, .job_listing, .job-preview".to_string()
}
fn default_title_selector() -> String {
    "h3, h2".to_string()
}
fn default_company_selector() -> String {
    "[class*=\"company\" i]".to_string()
}
fn default_location_selector() -> String {
    "[class*=\"location\" i]".to_string()
}
fn default_date_selector() -> String {
    "time, [class*=\"date\" i]".to_string()
}
fn default_link_selector() -> String {
    "a[href]".to_string()
}

impl Default for ListingSelectors {
    fn default() -> Self {
        Self {
            item: default_item_selector(),
            title: default_title_selector(),
            company: default_company_selector(),
            location: default_location_selector(),
            date: default_date_selector(),
            link: default_link_selector(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub base_url: String,
    #[serde(default = "default_page_cap")]
    pub page_cap: usize,
    #[serde(default)]
    pub selectors: ListingSelectors,
    #[serde(default)]
    pub notes: Option<String>,
}

fn default_page_cap() -> usize {
    10
}

impl SourceConfig {
    /// Selector and URL problems are configuration errors; surface them
    /// before any fetch is attempted.
    pub fn validate(&self) -> Result<(), SourceError> {
        for selector in [
            &self.selectors.item,
            &self.selectors.title,
            &self.selectors.company,
            &self.selectors.location,
            &self.selectors.date,
            &self.selectors.link,
        ] {
            if Selector::parse(selector).is_err() {
                return Err(SourceError::Selector {
                    source_id: self.source_id.clone(),
                    selector: selector.clone(),
                });
            }
        }
        Url::parse(&self.base_url).map_err(|err| SourceError::BaseUrl {
            url: self.base_url.clone(),
            reason: err.to_string(),
        })?;
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

pub fn load_registry(path: impl AsRef<Path>) -> Result<SourceRegistry> {
    let path = path.as_ref();
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let registry: SourceRegistry =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    for source in &registry.sources {
        source.validate()?;
    }
    Ok(registry)
}

/// Strip tracking noise so the same posting always keys to the same URL.
/// Fragments and utm-style parameters go; everything else is preserved.
pub fn canonicalize_url(url: &Url) -> String {
    let mut canonical = url.clone();
    canonical.set_fragment(None);
    let kept: Vec<(String, String)> = canonical
        .query_pairs()
        .filter(|(k, _)| !k.starts_with("utm_") && k != "fbclid" && k != "gclid")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        canonical.set_query(None);
    } else {
        let query = kept
            .iter()
            .map(|(k, v)| {
                if v.is_empty() {
                    k.clone()
                } else {
                    format!("{k}={v}")
                }
            })
            .collect::<Vec<_>>()
            .join("&");
        canonical.set_query(Some(&query));
    }
    canonical.to_string()
}

fn sel(selector: &str) -> Selector {
    // Selectors were validated at registry load; re-parsing cannot fail here.
    Selector::parse(selector).expect("selector validated at load")
}

fn element_text(el: ElementRef<'_>) -> String {
    el.text().collect::<String>().trim().to_string()
}

fn first_text(scope: ElementRef<'_>, selector: &str) -> Option<String> {
    scope
        .select(&sel(selector))
        .next()
        .map(element_text)
        .filter(|t| !t.is_empty())
}

fn date_text(scope: ElementRef<'_>, selector: &str) -> Option<String> {
    let el = scope.select(&sel(selector)).next()?;
    if let Some(datetime) = el.value().attr("datetime") {
        let datetime = datetime.trim();
        if !datetime.is_empty() {
            return Some(datetime.to_string());
        }
    }
    let text = element_text(el);
    (!text.is_empty()).then_some(text)
}

/// Parse one listing page into raw postings. Falls back to a generic
/// link scan when the item selector matches nothing, so markup drift
/// degrades to thin records instead of an empty run.
pub fn parse_listing(source: &SourceConfig, page_url: &Url, html: &str) -> Vec<RawPosting> {
    let document = Html::parse_document(html);
    let mut postings = Vec::new();

    for item in document.select(&sel(&source.selectors.item)) {
        let Some(link) = item
            .select(&sel(&source.selectors.link))
            .next()
            .and_then(|a| a.value().attr("href"))
        else {
            continue;
        };
        let Ok(joined) = page_url.join(link) else {
            continue;
        };
        let title = first_text(item, &source.selectors.title)
            .or_else(|| {
                item.select(&sel(&source.selectors.link))
                    .next()
                    .map(element_text)
                    .filter(|t| !t.is_empty())
            })
            .unwrap_or_else(|| "Job".to_string());
        postings.push(RawPosting {
            source: source.source_id.clone(),
            title,
            company: first_text(item, &source.selectors.company).unwrap_or_default(),
            location: first_text(item, &source.selectors.location).unwrap_or_default(),
            date_text: date_text(item, &source.selectors.date),
            url: canonicalize_url(&joined),
            description: String::new(),
        });
    }

    if postings.is_empty() {
        postings = parse_generic(source, page_url, &document);
    }
    postings
}

fn parse_generic(source: &SourceConfig, page_url: &Url, document: &Html) -> Vec<RawPosting> {
    let mut postings = Vec::new();
    for a in document.select(&sel("a[href]")) {
        let Some(href) = a.value().attr("href") else {
            continue;
        };
        if !href.to_ascii_lowercase().contains("job") {
            continue;
        }
        let Ok(joined) = page_url.join(href) else {
            continue;
        };
        let text = element_text(a);
        postings.push(RawPosting {
            source: source.source_id.clone(),
            title: if text.is_empty() { "Job".to_string() } else { text },
            company: String::new(),
            location: String::new(),
            date_text: None,
            url: canonicalize_url(&joined),
            description: String::new(),
        });
    }
    postings
}

/// Resolve the "next page" link of a listing page, if any. Relative
/// candidates are joined against the page's own URL; links leaving the
/// page's host are refused.
pub fn find_next_page(html: &str, page_url: &Url) -> Option<Url> {
    let document = Html::parse_document(html);

    let candidate = next_by_rel(&document)
        .or_else(|| next_by_label(&document))
        .or_else(|| next_by_text(&document))
        .or_else(|| next_by_pager(&document))?;

    let joined = page_url.join(&candidate).ok()?;
    if joined.host_str() != page_url.host_str() {
        return None;
    }
    Some(joined)
}

fn next_by_rel(document: &Html) -> Option<String> {
    document
        .select(&sel("a[href]"))
        .find(|a| {
            a.value()
                .attr("rel")
                .map(|rel| rel.to_ascii_lowercase().contains("next"))
                .unwrap_or(false)
        })
        .and_then(|a| a.value().attr("href").map(str::to_string))
}

fn next_by_label(document: &Html) -> Option<String> {
    document
        .select(&sel("a[href]"))
        .find(|a| {
            ["aria-label", "title"].iter().any(|attr| {
                a.value()
                    .attr(attr)
                    .map(|v| v.to_ascii_lowercase().contains("next"))
                    .unwrap_or(false)
            })
        })
        .and_then(|a| a.value().attr("href").map(str::to_string))
}

fn next_by_text(document: &Html) -> Option<String> {
    document
        .select(&sel("a[href]"))
        .find(|a| {
            let text = element_text(*a).to_ascii_lowercase();
            text.contains("next") || text == ">" || text == "»"
        })
        .and_then(|a| a.value().attr("href").map(str::to_string))
}

/// Pagination containers without an explicit next link: take the first
/// anchor following the active page marker.
fn next_by_pager(document: &Html) -> Option<String> {
    let pager = sel("[class*=\"pagination\" i], [class*=\"pager\" i]");
    let active = sel("[class*=\"active\" i], [class*=\"current\" i]");
    for container in document.select(&pager) {
        let Some(current) = container.select(&active).next() else {
            continue;
        };
        for sibling in current.next_siblings() {
            let Some(el) = ElementRef::wrap(sibling) else {
                continue;
            };
            let anchor = if el.value().name() == "a" {
                Some(el)
            } else {
                el.select(&sel("a[href]")).next()
            };
            if let Some(href) = anchor.and_then(|a| a.value().attr("href")) {
                return Some(href.to_string());
            }
        }
    }
    None
}

/// Narrow fetch seam so pagination and detail fetching are testable
/// without a network.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch_page(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
    ) -> Result<String, FetchError>;
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch_page(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
    ) -> Result<String, FetchError> {
        self.fetch_text(run_id, source_id, url)
            .await
            .map(|resp| resp.body)
    }
}

#[derive(Debug, Clone)]
pub struct ListingPage {
    pub url: Url,
    pub postings: Vec<RawPosting>,
}

/// Lazy, finite traversal of a source's listing pages. Stops when no next
/// link is found, the page cap is reached, a page yields zero new listings,
/// a URL repeats, or shutdown is requested.
pub struct PageWalker<'a> {
    fetcher: &'a dyn PageFetcher,
    source: &'a SourceConfig,
    run_id: Uuid,
    shutdown: ShutdownFlag,
    next_url: Option<Url>,
    visited: HashSet<String>,
    seen_posting_urls: HashSet<String>,
    pages_yielded: usize,
}

impl<'a> PageWalker<'a> {
    pub fn new(
        fetcher: &'a dyn PageFetcher,
        source: &'a SourceConfig,
        run_id: Uuid,
        shutdown: ShutdownFlag,
    ) -> Result<Self, SourceError> {
        let start = Url::parse(&source.base_url).map_err(|err| SourceError::BaseUrl {
            url: source.base_url.clone(),
            reason: err.to_string(),
        })?;
        Ok(Self {
            fetcher,
            source,
            run_id,
            shutdown,
            next_url: Some(start),
            visited: HashSet::new(),
            seen_posting_urls: HashSet::new(),
            pages_yielded: 0,
        })
    }

    /// Fetch and parse the next page. `Ok(None)` is exhaustion; a fetch
    /// error aborts traversal for this source only.
    pub async fn next_page(&mut self) -> Result<Option<ListingPage>, SourceError> {
        if self.pages_yielded >= self.source.page_cap || self.shutdown.is_cancelled() {
            return Ok(None);
        }
        let Some(url) = self.next_url.take() else {
            return Ok(None);
        };
        if !self.visited.insert(url.to_string()) {
            return Ok(None);
        }

        let html = self
            .fetcher
            .fetch_page(self.run_id, &self.source.source_id, url.as_str())
            .await?;
        self.pages_yielded += 1;

        let mut postings = parse_listing(self.source, &url, &html);
        postings.retain(|p| self.seen_posting_urls.insert(p.url.clone()));
        if postings.is_empty() {
            debug!(source_id = %self.source.source_id, %url, "page yielded no new listings, stopping");
            return Ok(None);
        }

        self.next_url = find_next_page(&html, &url);
        Ok(Some(ListingPage { url, postings }))
    }
}

/// What a source traversal produced. `aborted` is set when a listing page
/// could not be fetched after retries; postings from earlier pages are
/// kept.
#[derive(Debug, Clone, Default)]
pub struct SourceScrape {
    pub postings: Vec<RawPosting>,
    pub aborted: bool,
}

/// Walk every page of a source and return its raw postings, descriptions
/// not yet fetched. Zero postings is a valid outcome. A failed listing
/// fetch aborts traversal for this source only; pages already parsed are
/// returned.
pub async fn collect_source(
    fetcher: &dyn PageFetcher,
    source: &SourceConfig,
    run_id: Uuid,
    shutdown: ShutdownFlag,
) -> Result<SourceScrape, SourceError> {
    let mut walker = PageWalker::new(fetcher, source, run_id, shutdown)?;
    let mut scrape = SourceScrape::default();
    loop {
        match walker.next_page().await {
            Ok(Some(page)) => {
                debug!(source_id = %source.source_id, url = %page.url, count = page.postings.len(), "listing page parsed");
                scrape.postings.extend(page.postings);
            }
            Ok(None) => break,
            Err(err) => {
                warn!(source_id = %source.source_id, %err, "listing fetch failed, abandoning this source");
                scrape.aborted = true;
                break;
            }
        }
    }
    Ok(scrape)
}

/// Pull the description text out of a detail page, preferring a dedicated
/// description container over the whole document.
pub fn extract_description(html: &str) -> String {
    let document = Html::parse_document(html);
    let container = document
        .select(&sel("article"))
        .next()
        .or_else(|| document.select(&sel("#job-description")).next())
        .or_else(|| {
            document
                .select(&sel("[class*=\"description\" i], [class*=\"content\" i]"))
                .next()
        });

    let text = match container {
        Some(el) => el.text().collect::<Vec<_>>().join(" "),
        None => match document.select(&sel("body")).next() {
            Some(body) => body.text().collect::<Vec<_>>().join(" "),
            None => String::new(),
        },
    };
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    truncate_chars(&collapsed, MAX_DESCRIPTION_CHARS)
}

fn truncate_chars(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    text.chars().take(limit).collect()
}

/// Fill in descriptions for a batch of postings through the bounded worker
/// pool. Cache hits skip the network entirely; fetch failures degrade to an
/// empty description rather than dropping the posting.
pub async fn fetch_details(
    fetcher: Arc<dyn PageFetcher>,
    cache: CacheStore,
    run_id: Uuid,
    postings: Vec<RawPosting>,
    shutdown: ShutdownFlag,
) -> Vec<RawPosting> {
    let mut tasks = tokio::task::JoinSet::new();
    let total = postings.len();

    for (index, posting) in postings.into_iter().enumerate() {
        let fetcher = Arc::clone(&fetcher);
        let cache = cache.clone();
        let shutdown = shutdown.clone();
        tasks.spawn(async move {
            let filled = fill_description(fetcher.as_ref(), &cache, run_id, posting, shutdown).await;
            (index, filled)
        });
    }

    let mut ordered: Vec<Option<RawPosting>> = (0..total).map(|_| None).collect();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, posting)) => ordered[index] = Some(posting),
            Err(err) => warn!(%err, "detail fetch task panicked"),
        }
    }
    ordered.into_iter().flatten().collect()
}

async fn fill_description(
    fetcher: &dyn PageFetcher,
    cache: &CacheStore,
    run_id: Uuid,
    mut posting: RawPosting,
    shutdown: ShutdownFlag,
) -> RawPosting {
    if let Some(entry) = cache.get(Namespace::DetailPage, &posting.url).await {
        posting.description = extract_description(&entry.value);
        return posting;
    }
    if shutdown.is_cancelled() {
        return posting;
    }

    match fetcher.fetch_page(run_id, &posting.source, &posting.url).await {
        Ok(body) => {
            if let Err(err) = cache.put(Namespace::DetailPage, &posting.url, &body).await {
                warn!(url = %posting.url, %err, "caching detail page failed");
            }
            posting.description = extract_description(&body);
        }
        Err(err) => {
            warn!(url = %posting.url, %err, "detail fetch failed, keeping posting without description");
        }
    }
    posting
}

/// A report document read from the uploads directory, text extracted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportSource {
    pub name: String,
    pub content_hash: String,
    pub text: String,
}

/// Extract text from every PDF in `dir`, consulting the document-text cache
/// by content hash so unchanged files are never reprocessed. Corrupt
/// documents are logged and skipped.
pub async fn extract_reports(
    dir: &Path,
    cache: &CacheStore,
    worker_limit: usize,
) -> Result<Vec<ReportSource>> {
    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating reports directory {}", dir.display()))?;

    let mut names = Vec::new();
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("reading reports directory {}", dir.display()))?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_pdf = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("pdf"))
            .unwrap_or(false);
        if is_pdf {
            names.push(path);
        }
    }
    names.sort();

    let limiter = Arc::new(tokio::sync::Semaphore::new(worker_limit.max(1)));
    let mut tasks = tokio::task::JoinSet::new();

    for (index, path) in names.into_iter().enumerate() {
        let cache = cache.clone();
        let limiter = Arc::clone(&limiter);
        tasks.spawn(async move {
            let _permit = limiter.acquire_owned().await.expect("semaphore not closed");
            (index, extract_one_report(&path, &cache).await)
        });
    }

    let mut indexed = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((index, Some(report))) => indexed.push((index, report)),
            Ok((_, None)) => {}
            Err(err) => warn!(%err, "report extraction task panicked"),
        }
    }
    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, report)| report).collect())
}

async fn extract_one_report(path: &Path, cache: &CacheStore) -> Option<ReportSource> {
    let name = path.file_name()?.to_string_lossy().to_string();
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(report = %name, %err, "reading report failed, skipping");
            return None;
        }
    };
    let content_hash = CacheStore::sha256_hex(&bytes);

    if let Some(entry) = cache.get(Namespace::DocumentText, &content_hash).await {
        return Some(ReportSource {
            name,
            content_hash,
            text: entry.value,
        });
    }

    let extracted =
        tokio::task::spawn_blocking(move || pdf_extract::extract_text_from_mem(&bytes)).await;
    let text = match extracted {
        Ok(Ok(text)) => text,
        Ok(Err(err)) => {
            warn!(report = %name, %err, "pdf extraction failed, skipping");
            return None;
        }
        Err(err) => {
            warn!(report = %name, %err, "pdf extraction task panicked, skipping");
            return None;
        }
    };
    if text.trim().is_empty() {
        warn!(report = %name, "pdf yielded no text, skipping");
        return None;
    }

    if let Err(err) = cache.put(Namespace::DocumentText, &content_hash, &text).await {
        warn!(report = %name, %err, "caching extracted text failed");
    }
    Some(ReportSource {
        name,
        content_hash,
        text,
    })
}
