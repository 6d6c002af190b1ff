//! Normalization, deduplication, and enrichment for CHMM records.
//!
//! Everything in this crate is a pure function of its inputs plus the
//! structures built once per run (pattern tables, the skill taxonomy, the
//! sentiment lexicon), so a fixed input always enriches to the same output.
//! The one exception is the geocoder, which talks to an external service
//! through its own rate gate and the shared cache store.

use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use chmm_core::{
    CleanPosting, Coordinates, EnrichedPosting, RawPosting, ReportRecord, SalaryBounds,
    TopEntities,
};
use chmm_store::{CacheStore, IntervalGate, Namespace};
use chrono::NaiveDate;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "chmm-enrich";

/// Description prefix length covered by the content fingerprint. Tail edits
/// (a changed "apply by" date, a tweaked footer) must not change identity.
const FINGERPRINT_PREFIX_CHARS: usize = 280;

#[derive(Debug, Error)]
pub enum EnrichError {
    #[error("geocoder contact identifier is not configured")]
    MissingContact,
    #[error("entity recognizer unavailable: {0}")]
    Recognizer(String),
    #[error("building geocoder http client: {0}")]
    Http(String),
}

const STATES: &[(&str, &str)] = &[
    ("AL", "Alabama"),
    ("AK", "Alaska"),
    ("AZ", "Arizona"),
    ("AR", "Arkansas"),
    ("CA", "California"),
    ("CO", "Colorado"),
    ("CT", "Connecticut"),
    ("DE", "Delaware"),
    ("DC", "District of Columbia"),
    ("FL", "Florida"),
    ("GA", "Georgia"),
    ("HI", "Hawaii"),
    ("ID", "Idaho"),
    ("IL", "Illinois"),
    ("IN", "Indiana"),
    ("IA", "Iowa"),
    ("KS", "Kansas"),
    ("KY", "Kentucky"),
    ("LA", "Louisiana"),
    ("ME", "Maine"),
    ("MD", "Maryland"),
    ("MA", "Massachusetts"),
    ("MI", "Michigan"),
    ("MN", "Minnesota"),
    ("MS", "Mississippi"),
    ("MO", "Missouri"),
    ("MT", "Montana"),
    ("NE", "Nebraska"),
    ("NV", "Nevada"),
    ("NH", "New Hampshire"),
    ("NJ", "New Jersey"),
    ("NM", "New Mexico"),
    ("NY", "New York"),
    ("NC", "North Carolina"),
    ("ND", "North Dakota"),
    ("OH", "Ohio"),
    ("OK", "Oklahoma"),
    ("OR", "Oregon"),
    ("PA", "Pennsylvania"),
    ("RI", "Rhode Island"),
    ("SC", "South Carolina"),
    ("SD", "South Dakota"),
    ("TN", "Tennessee"),
    ("TX", "Texas"),
    ("UT", "Utah"),
    ("VT", "Vermont"),
    ("VA", "Virginia"),
    ("WA", "Washington"),
    ("WV", "West Virginia"),
    ("WI", "Wisconsin"),
    ("WY", "Wyoming"),
];

fn resolve_state(token: &str) -> Option<&'static str> {
    let token = token.trim().trim_end_matches('.');
    if token.is_empty() {
        return None;
    }
    if token.len() == 2 {
        let upper = token.to_ascii_uppercase();
        return STATES
            .iter()
            .find(|(abbrev, _)| *abbrev == upper)
            .map(|(abbrev, _)| *abbrev);
    }
    STATES
        .iter()
        .find(|(_, name)| name.eq_ignore_ascii_case(token))
        .map(|(abbrev, _)| *abbrev)
}

/// Pattern tables built once per run; normalization is then a pure
/// function of (raw record, tables).
pub struct Normalizer {
    tag_re: Regex,
    salary_re: Regex,
    job_type_rules: Vec<(&'static str, Regex)>,
    seniority_rules: Vec<(&'static str, Regex)>,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Normalizer {
    pub fn new() -> Self {
        let rule = |pattern: &str| Regex::new(pattern).expect("static pattern compiles");
        Self {
            tag_re: rule(r"<[^>]*>"),
            salary_re: rule(
                r"(?i)(\$|usd)?\s*(\d{2,3}(?:[,.]\d{3})?)(?:\s*(?:-|–|—|to)\s*\$?\s*(\d{2,3}(?:[,.]\d{3})?))?(?:\s*per\s*(year|yr|hour|hr|annum))?",
            ),
            job_type_rules: vec![
                (
                    "field-tech",
                    rule(r"(?i)field (?:tech|technician|director|crew)|crew (?:chief|member)|survey tech|archaeolog(?:ist|ical) tech"),
                ),
                (
                    "lab/analyst",
                    rule(r"(?i)\blab\b|laboratory|analyst|curation|curator|collections"),
                ),
                (
                    "architectural-historian",
                    rule(r"(?i)architectural historian|historic preservation|historian"),
                ),
                (
                    "pm/pi",
                    rule(r"(?i)project manager|principal investigator|program manager|project director"),
                ),
            ],
            seniority_rules: vec![
                ("lead/PI", rule(r"(?i)\blead\b|principal|director|chief")),
                ("senior", rule(r"(?i)\bsenior\b|\bsr\b\.?")),
                (
                    "entry",
                    rule(r"(?i)\bentry\b|junior|\bjr\b\.?|assistant|intern\b|technician\b"),
                ),
            ],
        }
    }

    /// Strip markup, decode the common entities, collapse whitespace.
    pub fn clean_text(&self, text: &str) -> String {
        let stripped = self.tag_re.replace_all(text, " ");
        let decoded = stripped
            .replace("&amp;", "&")
            .replace("&lt;", "<")
            .replace("&gt;", ">")
            .replace("&quot;", "\"")
            .replace("&#39;", "'")
            .replace("&nbsp;", " ")
            .replace('\u{a0}', " ");
        decoded.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    /// Scan for a currency-amount pair or range. A match counts as
    /// confident only when a currency marker or a per-period suffix is
    /// present; anything less leaves every field `None`. Never errors.
    pub fn extract_salary(&self, text: &str) -> (SalaryBounds, Option<String>) {
        for caps in self.salary_re.captures_iter(text) {
            let has_currency = caps.get(1).is_some();
            let has_period = caps.get(4).is_some();
            if !has_currency && !has_period {
                continue;
            }
            let min = caps.get(2).and_then(|m| parse_amount(m.as_str()));
            let max = caps.get(3).and_then(|m| parse_amount(m.as_str()));
            if min.is_none() {
                continue;
            }
            let currency = has_currency.then(|| "USD".to_string());
            return (SalaryBounds { min, max }, currency);
        }
        (SalaryBounds::default(), None)
    }

    pub fn parse_date(&self, text: Option<&str>) -> Option<NaiveDate> {
        let text = text?.trim();
        if text.is_empty() {
            return None;
        }
        // datetime attributes sometimes carry a full timestamp.
        let date_part = text.split('T').next().unwrap_or(text);
        for format in ["%Y-%m-%d", "%m/%d/%Y", "%B %d, %Y", "%b %d, %Y"] {
            if let Ok(date) = NaiveDate::parse_from_str(date_part, format) {
                return Some(date);
            }
        }
        None
    }

    fn classify(&self, rules: &[(&'static str, Regex)], haystacks: &[&str]) -> Option<&'static str> {
        for haystack in haystacks {
            for (bucket, pattern) in rules {
                if pattern.is_match(haystack) {
                    return Some(*bucket);
                }
            }
        }
        None
    }

    /// Normalize a raw posting into its cleaned, classified form.
    pub fn normalize(&self, raw: &RawPosting) -> CleanPosting {
        let title = self.clean_text(&raw.title);
        let company = self.clean_text(&raw.company);
        let location = raw.location.trim().to_string();
        let description = self.clean_text(&raw.description);

        let (city, state) = parse_city_state(&location);
        let (salary, currency) = self.extract_salary(&description);
        let job_type = self
            .classify(&self.job_type_rules, &[title.as_str(), description.as_str()])
            .unwrap_or("other")
            .to_string();
        let seniority = self
            .classify(&self.seniority_rules, &[title.as_str()])
            .unwrap_or("unspecified")
            .to_string();
        let fingerprint = fingerprint(&title, &company, &description);

        CleanPosting {
            source: raw.source.clone(),
            title,
            company,
            location,
            city,
            state,
            date_posted: self.parse_date(raw.date_text.as_deref()),
            job_type,
            seniority,
            salary,
            currency,
            url: raw.url.clone(),
            description,
            fingerprint,
        }
    }
}

fn parse_amount(text: &str) -> Option<f64> {
    text.replace([',', '.'], "").parse::<f64>().ok()
}

/// Best-effort "City, ST" / "City, StateName" split. Unrecognized formats
/// leave both halves `None`; the raw location text is always retained on
/// the record unchanged.
pub fn parse_city_state(location: &str) -> (Option<String>, Option<String>) {
    let location = location.trim();
    if location.is_empty() {
        return (None, None);
    }
    if let Some((city_part, rest)) = location.split_once(',') {
        let city = city_part.trim();
        let state_token = rest.trim().split_whitespace().next().unwrap_or("");
        if let (false, Some(state)) = (city.is_empty(), resolve_state(state_token)) {
            return (Some(city.to_string()), Some(state.to_string()));
        }
        return (None, None);
    }
    // A bare token like "Remote" or "Tucson" still reads as a city.
    if location.split_whitespace().count() <= 2 {
        return (Some(location.to_string()), None);
    }
    (None, None)
}

/// Stable content identity: sha256 over lowercased title, company, and the
/// leading description characters.
pub fn fingerprint(title: &str, company: &str, description: &str) -> String {
    let prefix: String = description.chars().take(FINGERPRINT_PREFIX_CHARS).collect();
    let composite = format!(
        "{}|{}|{}",
        title.trim().to_lowercase(),
        company.trim().to_lowercase(),
        prefix.trim().to_lowercase()
    );
    let mut hasher = Sha256::new();
    hasher.update(composite.as_bytes());
    hex::encode(hasher.finalize())
}

/// Duplicate filter over canonical URL and content fingerprint. Seed it
/// with persisted history so re-ingested records collapse across runs,
/// not just within one.
#[derive(Debug, Default)]
pub struct Deduper {
    seen_urls: HashSet<String>,
    seen_fingerprints: HashSet<String>,
    duplicates_dropped: usize,
}

impl Deduper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_history<U, F>(&mut self, urls: U, fingerprints: F)
    where
        U: IntoIterator<Item = String>,
        F: IntoIterator<Item = String>,
    {
        self.seen_urls.extend(urls);
        self.seen_fingerprints.extend(fingerprints);
    }

    /// Returns false when the posting duplicates an already-seen record;
    /// duplicates are counted, never errored.
    pub fn admit(&mut self, posting: &CleanPosting) -> bool {
        let url_is_new = !posting.url.is_empty() && !self.seen_urls.contains(&posting.url);
        let fp_is_new = !self.seen_fingerprints.contains(&posting.fingerprint);
        if (!posting.url.is_empty() && !url_is_new) || !fp_is_new {
            self.duplicates_dropped += 1;
            return false;
        }
        if !posting.url.is_empty() {
            self.seen_urls.insert(posting.url.clone());
        }
        self.seen_fingerprints.insert(posting.fingerprint.clone());
        true
    }

    pub fn duplicates_dropped(&self) -> usize {
        self.duplicates_dropped
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxonomyEntry {
    pub alias: String,
    pub canonical: String,
    #[serde(default)]
    pub category: Option<String>,
}

/// Alias table pre-sorted longest-first so compound terms ("ArcGIS Pro")
/// claim their span before any shorter alias can shadow them. Matching is
/// a pure function of (text, taxonomy).
#[derive(Debug, Clone)]
pub struct SkillTaxonomy {
    entries: Vec<TaxonomyEntry>,
}

impl SkillTaxonomy {
    pub fn from_entries(mut entries: Vec<TaxonomyEntry>) -> Self {
        entries.retain(|e| !e.alias.trim().is_empty());
        for entry in &mut entries {
            if entry.canonical.trim().is_empty() {
                entry.canonical = entry.alias.clone();
            }
        }
        // Longest alias first; alphabetical within a length so the table
        // order never depends on load order.
        entries.sort_by(|a, b| {
            b.alias
                .chars()
                .count()
                .cmp(&a.alias.chars().count())
                .then_with(|| a.alias.cmp(&b.alias))
        });
        Self { entries }
    }

    pub fn from_csv_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let mut reader = csv::Reader::from_path(path)
            .with_context(|| format!("opening taxonomy {}", path.display()))?;
        let mut entries = Vec::new();
        for record in reader.deserialize::<TaxonomyEntry>() {
            let entry =
                record.with_context(|| format!("parsing taxonomy row in {}", path.display()))?;
            entries.push(entry);
        }
        Ok(Self::from_entries(entries))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Match every alias against `text`, longest alias winning overlapping
    /// spans. Output is deduplicated and alphabetical regardless of how
    /// many aliases hit the same canonical skill.
    pub fn match_skills(&self, text: &str) -> Vec<String> {
        let haystack = text.to_lowercase();
        let mut claimed: Vec<(usize, usize)> = Vec::new();
        let mut found: BTreeSet<String> = BTreeSet::new();

        for entry in &self.entries {
            let needle = entry.alias.to_lowercase();
            for (start, matched) in haystack.match_indices(&needle) {
                let end = start + matched.len();
                if !on_word_boundary(&haystack, start, end) {
                    continue;
                }
                if claimed.iter().any(|&(s, e)| start < e && s < end) {
                    continue;
                }
                claimed.push((start, end));
                found.insert(entry.canonical.clone());
            }
        }
        found.into_iter().collect()
    }
}

fn on_word_boundary(haystack: &str, start: usize, end: usize) -> bool {
    let before_ok = haystack[..start]
        .chars()
        .next_back()
        .map(|c| !c.is_alphabetic())
        .unwrap_or(true);
    let after_ok = haystack[end..]
        .chars()
        .next()
        .map(|c| !c.is_alphabetic())
        .unwrap_or(true);
    before_ok && after_ok
}

/// Pluggable named-entity seam, restricted to organizations and places.
/// Output is advisory; a failing recognizer degrades to an empty list and
/// never blocks skill, salary, or location processing.
pub trait EntityRecognizer: Send + Sync {
    fn extract(&self, text: &str) -> Result<TopEntities, EnrichError>;
}

const ORG_SUFFIXES: &[&str] = &[
    "Inc",
    "LLC",
    "Ltd",
    "Corp",
    "Company",
    "Consultants",
    "Consulting",
    "Associates",
    "Group",
    "University",
    "College",
    "Museum",
    "Society",
    "Institute",
    "Services",
    "Department",
    "Agency",
    "Commission",
    "Foundation",
];

/// Capitalization-and-suffix heuristic recognizer used when no external
/// model is wired in.
pub struct HeuristicRecognizer {
    top_n: usize,
    place_re: Regex,
}

impl HeuristicRecognizer {
    pub fn new(top_n: usize) -> Self {
        Self {
            top_n,
            place_re: Regex::new(r"([A-Z][A-Za-z.]+(?: [A-Z][A-Za-z.]+)*),\s*([A-Z]{2})\b")
                .expect("static pattern compiles"),
        }
    }
}

impl Default for HeuristicRecognizer {
    fn default() -> Self {
        Self::new(10)
    }
}

impl EntityRecognizer for HeuristicRecognizer {
    fn extract(&self, text: &str) -> Result<TopEntities, EnrichError> {
        let mut orgs: Vec<String> = Vec::new();
        let mut places: Vec<String> = Vec::new();

        // Capitalized runs ending in an organization suffix.
        let mut run: Vec<&str> = Vec::new();
        for token in text.split_whitespace() {
            let word = token.trim_matches(|c: char| !c.is_alphanumeric() && c != '.');
            let capitalized = word.chars().next().map(char::is_uppercase).unwrap_or(false);
            if capitalized {
                run.push(word);
                let tail = word.trim_end_matches('.');
                if run.len() >= 2 && ORG_SUFFIXES.contains(&tail) {
                    orgs.push(run.join(" "));
                    run.clear();
                }
            } else {
                run.clear();
            }
        }

        for caps in self.place_re.captures_iter(text) {
            if resolve_state(&caps[2]).is_some() {
                places.push(format!("{}, {}", &caps[1], &caps[2]));
            }
        }
        for (_, name) in STATES {
            if text.contains(name) {
                places.push((*name).to_string());
            }
        }

        Ok(TopEntities {
            orgs: rank_top(orgs, self.top_n),
            places: rank_top(places, self.top_n),
        })
    }
}

fn rank_top(items: Vec<String>, top_n: usize) -> Vec<String> {
    let mut counts: Vec<(String, usize)> = Vec::new();
    for item in items {
        match counts.iter_mut().find(|(existing, _)| *existing == item) {
            Some((_, count)) => *count += 1,
            None => counts.push((item, 1)),
        }
    }
    counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    counts.into_iter().take(top_n).map(|(item, _)| item).collect()
}

const POSITIVE_WORDS: &[&str] = &[
    "excellent", "great", "competitive", "opportunity", "opportunities", "growth", "benefits",
    "supportive", "flexible", "innovative", "rewarding", "generous", "collaborative", "paid",
    "advancement", "training", "mentorship", "welcoming", "passionate", "meaningful", "stable",
    "bonus", "friendly", "dynamic", "leading", "respected", "strong", "thriving",
];

const NEGATIVE_WORDS: &[&str] = &[
    "demanding", "stress", "stressful", "hazard", "hazardous", "risk", "difficult", "strict",
    "harsh", "dangerous", "fatigue", "unpaid", "layoff", "deadline", "pressure", "remote-only",
    "heavy", "adverse", "extreme", "strenuous", "uncertain", "temporary", "mandatory",
];

/// Small lexicon scorer in `[-1.0, 1.0]`; empty or neutral text scores 0.
pub struct SentimentLexicon {
    positive: HashSet<&'static str>,
    negative: HashSet<&'static str>,
}

impl Default for SentimentLexicon {
    fn default() -> Self {
        Self {
            positive: POSITIVE_WORDS.iter().copied().collect(),
            negative: NEGATIVE_WORDS.iter().copied().collect(),
        }
    }
}

impl SentimentLexicon {
    pub fn score(&self, text: &str) -> f64 {
        let mut positive = 0usize;
        let mut negative = 0usize;
        for token in text.split(|c: char| !c.is_alphanumeric() && c != '-') {
            let token = token.to_lowercase();
            if token.is_empty() {
                continue;
            }
            if self.positive.contains(token.as_str()) {
                positive += 1;
            } else if self.negative.contains(token.as_str()) {
                negative += 1;
            }
        }
        if positive + negative == 0 {
            return 0.0;
        }
        (positive as f64 - negative as f64) / (positive + negative) as f64
    }
}

/// Skill, entity, and sentiment enrichment for one cleaned posting.
/// Coordinates are attached later by the geocode stage.
pub fn enrich_posting(
    posting: CleanPosting,
    taxonomy: &SkillTaxonomy,
    recognizer: &dyn EntityRecognizer,
    lexicon: &SentimentLexicon,
) -> EnrichedPosting {
    let haystack = format!("{} {}", posting.title, posting.description);
    let skills = taxonomy.match_skills(&haystack);
    let entities = match recognizer.extract(&posting.description) {
        Ok(entities) => entities,
        Err(err) => {
            warn!(url = %posting.url, %err, "entity extraction failed, continuing without entities");
            TopEntities::default()
        }
    };
    let sentiment = lexicon.score(&posting.description);

    EnrichedPosting {
        posting,
        skills,
        entities,
        sentiment,
        coords: None,
    }
}

/// Same enrichment path for an extracted report document.
pub fn enrich_report(
    name: String,
    content_hash: String,
    text: String,
    taxonomy: &SkillTaxonomy,
    recognizer: &dyn EntityRecognizer,
) -> ReportRecord {
    let skills = taxonomy.match_skills(&text);
    let entities = match recognizer.extract(&text) {
        Ok(entities) => entities,
        Err(err) => {
            warn!(report = %name, %err, "entity extraction failed, continuing without entities");
            TopEntities::default()
        }
    };
    let word_count = text.split_whitespace().count();

    ReportRecord {
        name,
        content_hash,
        word_count,
        skills,
        entities,
        text,
    }
}

/// Exact-string normalization for geocode cache keys.
pub fn normalize_location(location: &str) -> String {
    location
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone)]
pub struct GeocoderConfig {
    pub endpoint: String,
    pub contact: String,
    pub min_interval: Duration,
    pub timeout: Duration,
}

impl Default for GeocoderConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://nominatim.openstreetmap.org/search".to_string(),
            contact: String::new(),
            min_interval: Duration::from_secs(1),
            timeout: Duration::from_secs(15),
        }
    }
}

/// Cached resolution outcome. `resolved: false` is the negative marker
/// distinguishing "tried and failed" from "never tried".
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct GeocodeCacheValue {
    resolved: bool,
    lat: Option<f64>,
    lon: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct LookupHit {
    lat: String,
    lon: String,
}

/// Free-text location resolution through an external lookup service.
/// Cache-first; its rate gate is independent of the fetcher's and never
/// dips below one second per the service's usage policy.
pub struct Geocoder {
    client: reqwest::Client,
    gate: IntervalGate,
    cache: CacheStore,
    endpoint: String,
}

impl Geocoder {
    pub fn new(config: GeocoderConfig, cache: CacheStore) -> Result<Self, EnrichError> {
        let contact = config.contact.trim();
        if contact.is_empty() {
            return Err(EnrichError::MissingContact);
        }
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(format!("chmm/0.1 ({contact})"))
            .build()
            .map_err(|err| EnrichError::Http(err.to_string()))?;

        Ok(Self {
            client,
            gate: IntervalGate::new(config.min_interval.max(Duration::from_secs(1))),
            cache,
            endpoint: config.endpoint,
        })
    }

    /// Resolve a free-text location to coordinates, or `None`. Failures
    /// are cached as negative markers so the same failing address is not
    /// re-queried on every run.
    pub async fn lookup(&self, location: &str) -> Option<Coordinates> {
        let key = normalize_location(location);
        if key.is_empty() {
            return None;
        }

        if let Some(entry) = self.cache.get(Namespace::Geocode, &key).await {
            match serde_json::from_str::<GeocodeCacheValue>(&entry.value) {
                Ok(cached) => {
                    return match (cached.resolved, cached.lat, cached.lon) {
                        (true, Some(lat), Some(lon)) => Some(Coordinates { lat, lon }),
                        _ => None,
                    };
                }
                Err(err) => {
                    warn!(%key, %err, "discarding unreadable geocode cache value");
                }
            }
        }

        self.gate.wait_turn().await;
        let resolved = self.resolve_remote(&key).await;
        let value = match resolved {
            Some(coords) => GeocodeCacheValue {
                resolved: true,
                lat: Some(coords.lat),
                lon: Some(coords.lon),
            },
            None => GeocodeCacheValue {
                resolved: false,
                lat: None,
                lon: None,
            },
        };
        if let Ok(payload) = serde_json::to_string(&value) {
            if let Err(err) = self.cache.put(Namespace::Geocode, &key, &payload).await {
                warn!(%key, %err, "caching geocode result failed");
            }
        }
        resolved
    }

    async fn resolve_remote(&self, query: &str) -> Option<Coordinates> {
        let request = self
            .client
            .get(&self.endpoint)
            .query(&[("format", "json"), ("limit", "1"), ("q", query)]);

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                warn!(%query, %err, "geocode request failed");
                return None;
            }
        };
        if !response.status().is_success() {
            warn!(%query, status = %response.status(), "geocode request rejected");
            return None;
        }
        let hits: Vec<LookupHit> = match response.json().await {
            Ok(hits) => hits,
            Err(err) => {
                warn!(%query, %err, "geocode response unreadable");
                return None;
            }
        };
        let hit = hits.into_iter().next()?;
        let lat = hit.lat.parse::<f64>().ok()?;
        let lon = hit.lon.parse::<f64>().ok()?;
        Some(Coordinates { lat, lon })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn raw(title: &str, company: &str, location: &str, description: &str) -> RawPosting {
        RawPosting {
            source: "acra".to_string(),
            title: title.to_string(),
            company: company.to_string(),
            location: location.to_string(),
            date_text: None,
            url: format!("https://example.com/{}", title.to_lowercase().replace(' ', "-")),
            description: description.to_string(),
        }
    }

    fn taxonomy() -> SkillTaxonomy {
        let entry = |alias: &str, canonical: &str| TaxonomyEntry {
            alias: alias.to_string(),
            canonical: canonical.to_string(),
            category: None,
        };
        SkillTaxonomy::from_entries(vec![
            entry("ArcGIS", "ArcGIS"),
            entry("ArcGIS Pro", "ArcGIS Pro"),
            entry("GIS", "GIS"),
            entry("Section 106", "Section 106"),
            entry("NEPA", "NEPA"),
            entry("esri arcgis", "ArcGIS"),
        ])
    }

    #[test]
    fn clean_text_strips_markup_and_collapses_whitespace() {
        let normalizer = Normalizer::new();
        let cleaned = normalizer.clean_text("<p>Field&nbsp;work   with <b>GIS</b> &amp; survey</p>");
        assert_eq!(cleaned, "Field work with GIS & survey");
    }

    #[test]
    fn salary_range_with_dollar_sign() {
        let normalizer = Normalizer::new();
        let (bounds, currency) =
            normalizer.extract_salary("Salary: $65,000-$80,000 per year plus benefits");
        assert_eq!(bounds.min, Some(65000.0));
        assert_eq!(bounds.max, Some(80000.0));
        assert_eq!(currency.as_deref(), Some("USD"));
    }

    #[test]
    fn salary_single_value() {
        let normalizer = Normalizer::new();
        let (bounds, currency) = normalizer.extract_salary("Starting at $50,000");
        assert_eq!(bounds.min, Some(50000.0));
        assert_eq!(bounds.max, None);
        assert_eq!(currency.as_deref(), Some("USD"));
    }

    #[test]
    fn bare_numbers_are_not_salaries() {
        let normalizer = Normalizer::new();
        let (bounds, currency) =
            normalizer.extract_salary("OSHA 10 certification and a crew of 12 required");
        assert_eq!(bounds.min, None);
        assert_eq!(bounds.max, None);
        assert_eq!(currency, None);
    }

    #[test]
    fn no_salary_stays_none() {
        let normalizer = Normalizer::new();
        let (bounds, currency) =
            normalizer.extract_salary("Great benefits and growth opportunities");
        assert_eq!(bounds.min, None);
        assert_eq!(bounds.max, None);
        assert_eq!(currency, None);
    }

    #[test]
    fn city_state_comma_separated() {
        assert_eq!(
            parse_city_state("Phoenix, AZ"),
            (Some("Phoenix".to_string()), Some("AZ".to_string()))
        );
    }

    #[test]
    fn city_state_full_name_resolves_to_abbreviation() {
        assert_eq!(
            parse_city_state("Denver, Colorado"),
            (Some("Denver".to_string()), Some("CO".to_string()))
        );
    }

    #[test]
    fn unparsed_location_leaves_both_halves_none() {
        assert_eq!(parse_city_state("Phoenix, Planet Mars"), (None, None));
        assert_eq!(parse_city_state(""), (None, None));
    }

    #[test]
    fn bare_token_reads_as_city() {
        assert_eq!(parse_city_state("Remote"), (Some("Remote".to_string()), None));
    }

    #[test]
    fn fingerprint_ignores_description_tail_edits() {
        let body = "Supervise excavation crews across multiple project areas. ".repeat(10);
        let a = fingerprint("Field Tech", "Heritage Inc", &format!("{body} Apply by June 1."));
        let b = fingerprint("Field Tech", "Heritage Inc", &format!("{body} Apply by July 9."));
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_is_case_insensitive() {
        assert_eq!(
            fingerprint("Field Tech", "Company A", "Description"),
            fingerprint("FIELD TECH", "COMPANY A", "DESCRIPTION")
        );
    }

    #[test]
    fn fingerprint_changes_with_leading_description() {
        assert_ne!(
            fingerprint("Field Tech", "Company A", "Survey work in Arizona"),
            fingerprint("Field Tech", "Company A", "Lab analysis in Colorado")
        );
    }

    #[test]
    fn dedup_collapses_matching_urls_and_fingerprints() {
        let normalizer = Normalizer::new();
        let mut deduper = Deduper::new();

        let first = normalizer.normalize(&raw("Field Tech", "Heritage Inc", "Phoenix, AZ", "Survey work."));
        assert!(deduper.admit(&first));

        // Same URL, same fingerprint.
        assert!(!deduper.admit(&first));

        // Different URL, identical content fingerprint.
        let mut same_content = first.clone();
        same_content.url = "https://example.com/mirror/field-tech".to_string();
        assert!(!deduper.admit(&same_content));

        assert_eq!(deduper.duplicates_dropped(), 2);
    }

    #[test]
    fn dedup_is_seeded_by_persisted_history() {
        let normalizer = Normalizer::new();
        let clean = normalizer.normalize(&raw("Field Tech", "Heritage Inc", "Phoenix, AZ", "Survey work."));

        let mut deduper = Deduper::new();
        deduper.seed_history(vec![clean.url.clone()], Vec::new());
        assert!(!deduper.admit(&clean));
    }

    #[test]
    fn compound_alias_wins_over_its_prefix() {
        let skills = taxonomy().match_skills("Experience with ArcGIS Pro required.");
        assert_eq!(skills, vec!["ArcGIS Pro".to_string()]);
    }

    #[test]
    fn aliases_collapse_to_one_canonical_name() {
        let skills = taxonomy().match_skills("We use esri arcgis daily; ArcGIS experience a plus.");
        assert_eq!(skills, vec!["ArcGIS".to_string()]);
    }

    #[test]
    fn matching_is_case_insensitive_and_boundary_aware() {
        let tax = taxonomy();
        assert_eq!(tax.match_skills("nepa compliance"), vec!["NEPA".to_string()]);
        // "GIS" inside another word must not match.
        assert!(tax.match_skills("registered logistics firm").is_empty());
    }

    #[test]
    fn skill_output_is_deterministic_and_sorted() {
        let tax = taxonomy();
        let text = "Section 106 reviews, NEPA work, and ArcGIS Pro mapping.";
        let first = tax.match_skills(text);
        let second = tax.match_skills(text);
        assert_eq!(first, second);
        assert_eq!(
            first,
            vec![
                "ArcGIS Pro".to_string(),
                "NEPA".to_string(),
                "Section 106".to_string()
            ]
        );
    }

    #[test]
    fn heuristic_recognizer_finds_orgs_and_places() {
        let recognizer = HeuristicRecognizer::default();
        let entities = recognizer
            .extract("Heritage Research Inc seeks crews near Flagstaff, AZ for work across Arizona.")
            .expect("heuristic recognizer is infallible");
        assert!(entities.orgs.contains(&"Heritage Research Inc".to_string()));
        assert!(entities.places.contains(&"Flagstaff, AZ".to_string()));
        assert!(entities.places.contains(&"Arizona".to_string()));
    }

    #[test]
    fn sentiment_scores_sign_and_range() {
        let lexicon = SentimentLexicon::default();
        assert!(lexicon.score("Excellent benefits and great growth") > 0.0);
        assert!(lexicon.score("Stressful, hazardous, demanding work") < 0.0);
        assert_eq!(lexicon.score(""), 0.0);
        assert_eq!(lexicon.score("shovel bucket trowel"), 0.0);
    }

    #[test]
    fn enrich_posting_attaches_skills_and_sentiment() {
        let normalizer = Normalizer::new();
        let clean = normalizer.normalize(&raw(
            "Field Technician",
            "Heritage Research Inc",
            "Phoenix, AZ",
            "ArcGIS Pro mapping with excellent benefits. Section 106 compliance.",
        ));
        let enriched = enrich_posting(
            clean,
            &taxonomy(),
            &HeuristicRecognizer::default(),
            &SentimentLexicon::default(),
        );
        assert_eq!(
            enriched.skills,
            vec!["ArcGIS Pro".to_string(), "Section 106".to_string()]
        );
        assert!(enriched.sentiment > 0.0);
        assert!(enriched.coords.is_none());
    }

    #[test]
    fn missing_contact_is_a_configuration_error() {
        let dir = tempdir().expect("tempdir");
        let cache = CacheStore::new(dir.path());
        let err = Geocoder::new(GeocoderConfig::default(), cache).err();
        assert!(matches!(err, Some(EnrichError::MissingContact)));
    }

    fn offline_geocoder(cache: CacheStore) -> Geocoder {
        // Unroutable endpoint: any network attempt fails fast, so these
        // tests prove the cache short-circuit.
        Geocoder::new(
            GeocoderConfig {
                endpoint: "http://127.0.0.1:9/search".to_string(),
                contact: "ops@example.org".to_string(),
                min_interval: Duration::from_millis(1),
                timeout: Duration::from_millis(200),
            },
            cache,
        )
        .expect("contact configured")
    }

    #[tokio::test]
    async fn geocode_positive_cache_hit_skips_network() {
        let dir = tempdir().expect("tempdir");
        let cache = CacheStore::new(dir.path());
        cache
            .put(
                Namespace::Geocode,
                "phoenix, az",
                r#"{"resolved":true,"lat":33.45,"lon":-112.07}"#,
            )
            .await
            .expect("seed cache");

        let geocoder = offline_geocoder(cache);
        let coords = geocoder.lookup("  Phoenix,   AZ ").await.expect("cached hit");
        assert_eq!(coords.lat, 33.45);
        assert_eq!(coords.lon, -112.07);
    }

    #[tokio::test]
    async fn geocode_negative_marker_is_not_requeried() {
        let dir = tempdir().expect("tempdir");
        let cache = CacheStore::new(dir.path());
        cache
            .put(
                Namespace::Geocode,
                "atlantis",
                r#"{"resolved":false,"lat":null,"lon":null}"#,
            )
            .await
            .expect("seed cache");

        let geocoder = offline_geocoder(cache);
        assert!(geocoder.lookup("Atlantis").await.is_none());
    }

    #[tokio::test]
    async fn geocode_failure_writes_negative_marker() {
        let dir = tempdir().expect("tempdir");
        let cache = CacheStore::new(dir.path());
        let geocoder = offline_geocoder(cache.clone());

        assert!(geocoder.lookup("Nowhere, AZ").await.is_none());

        let entry = cache
            .get(Namespace::Geocode, "nowhere, az")
            .await
            .expect("negative marker written");
        let value: GeocodeCacheValue = serde_json::from_str(&entry.value).expect("marker json");
        assert!(!value.resolved);
    }

    #[test]
    fn taxonomy_loads_from_csv() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("skills.csv");
        std::fs::write(
            &path,
            "alias,canonical,category\nArcGIS Pro,ArcGIS Pro,GIS\nesri arcgis,ArcGIS,GIS\nNEPA,,compliance\n",
        )
        .expect("write taxonomy");

        let tax = SkillTaxonomy::from_csv_path(&path).expect("load taxonomy");
        assert_eq!(tax.len(), 3);
        // Blank canonical falls back to the alias itself.
        assert_eq!(tax.match_skills("NEPA review"), vec!["NEPA".to_string()]);
    }
}
