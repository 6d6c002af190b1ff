//! Staged domain model for the CHMM ingestion pipeline.
//!
//! Records move through the pipeline as distinct types, one per lifecycle
//! stage: a [`RawPosting`] comes off the wire, a [`CleanPosting`] is the
//! normalizer's output, and an [`EnrichedPosting`] is what the persistence
//! layer stores. Each stage's output is the next stage's input, so a record
//! can never skip a stage.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "chmm-core";

/// A posting as scraped from a listing or detail page. Fields are whatever
/// the source markup yielded; nothing here is trusted or normalized yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawPosting {
    pub source: String,
    pub title: String,
    pub company: String,
    pub location: String,
    pub date_text: Option<String>,
    pub url: String,
    pub description: String,
}

/// Salary bounds extracted from free text. All fields stay `None` unless
/// the extractor found a confident match; absent is never zero.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct SalaryBounds {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

/// Normalized posting: cleaned text, parsed location, classification
/// buckets, salary bounds, and the content fingerprint used for dedup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanPosting {
    pub source: String,
    pub title: String,
    pub company: String,
    pub location: String,
    pub city: Option<String>,
    pub state: Option<String>,
    pub date_posted: Option<NaiveDate>,
    pub job_type: String,
    pub seniority: String,
    pub salary: SalaryBounds,
    pub currency: Option<String>,
    pub url: String,
    pub description: String,
    pub fingerprint: String,
}

/// Latitude/longitude pair from the geocoder.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lon: f64,
}

/// Named entities surfaced by the recognizer, restricted to organizations
/// and places. Advisory only; downstream stages never depend on them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TopEntities {
    pub orgs: Vec<String>,
    pub places: Vec<String>,
}

/// Fully enriched posting, terminal pipeline form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedPosting {
    #[serde(flatten)]
    pub posting: CleanPosting,
    pub skills: Vec<String>,
    pub entities: TopEntities,
    pub sentiment: f64,
    pub coords: Option<Coordinates>,
}

/// An industry report extracted from an uploaded document. Identity is
/// (name, content_hash): the same bytes are never reprocessed, new bytes
/// under the same name are a new version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportRecord {
    pub name: String,
    pub content_hash: String,
    pub word_count: usize,
    pub skills: Vec<String>,
    pub entities: TopEntities,
    pub text: String,
}

/// Aggregate over non-null salary minimums. `count` is how many postings
/// carried a salary at all, never the total posting count.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SalarySummary {
    pub count: usize,
    pub mean_min: f64,
}

/// Derived market summary, recomputed from the persisted record set on
/// every run. Only `run_timestamp` and `run_id` vary between identical
/// runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisSnapshot {
    pub run_id: Uuid,
    pub run_timestamp: DateTime<Utc>,
    pub num_jobs: usize,
    pub unique_employers: usize,
    pub geocoded: usize,
    pub top_skills: Vec<(String, usize)>,
    pub top_employers: Vec<(String, usize)>,
    pub salary_summary: Option<SalarySummary>,
}

impl EnrichedPosting {
    /// Delimited skill cell for tabular export.
    pub fn skills_joined(&self) -> String {
        self.skills.join(";")
    }
}

impl ReportRecord {
    pub fn skills_joined(&self) -> String {
        self.skills.join(";")
    }

    pub fn entities_joined(&self) -> String {
        let mut all = self.entities.orgs.clone();
        all.extend(self.entities.places.iter().cloned());
        all.join(";")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clean() -> CleanPosting {
        CleanPosting {
            source: "acra".into(),
            title: "Field Technician".into(),
            company: "Heritage Research Inc".into(),
            location: "Phoenix, AZ".into(),
            city: Some("Phoenix".into()),
            state: Some("AZ".into()),
            date_posted: None,
            job_type: "field-tech".into(),
            seniority: "entry".into(),
            salary: SalaryBounds::default(),
            currency: None,
            url: "https://example.com/job/1".into(),
            description: "Shovel testing and survey.".into(),
            fingerprint: "abc".into(),
        }
    }

    #[test]
    fn skills_join_is_semicolon_delimited() {
        let enriched = EnrichedPosting {
            posting: clean(),
            skills: vec!["ArcGIS".into(), "Section 106".into()],
            entities: TopEntities::default(),
            sentiment: 0.0,
            coords: None,
        };
        assert_eq!(enriched.skills_joined(), "ArcGIS;Section 106");
    }

    #[test]
    fn enriched_posting_flattens_clean_fields_in_json() {
        let enriched = EnrichedPosting {
            posting: clean(),
            skills: vec![],
            entities: TopEntities::default(),
            sentiment: 0.1,
            coords: Some(Coordinates { lat: 33.4, lon: -112.1 }),
        };
        let value = serde_json::to_value(&enriched).unwrap();
        assert_eq!(value["title"], "Field Technician");
        assert_eq!(value["coords"]["lat"], 33.4);
    }
}
