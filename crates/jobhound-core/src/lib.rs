//! Core domain model for jobhound leads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobhound-core";

/// Lifecycle state of a stored lead.
///
/// Transitions only move forward: `New -> Old` when a later run supersedes
/// the lead, `New -> BestArchived` during the end-of-day archive sweep.
/// Neither transition is ever reversed by the reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeadStatus {
    New,
    Old,
    #[serde(rename = "Best_Archived")]
    BestArchived,
}

impl LeadStatus {
    pub fn is_new(self) -> bool {
        matches!(self, LeadStatus::New)
    }
}

/// One persisted job-posting lead.
///
/// `url` is the primary key for deduplication; `found_at` is set once at
/// insertion and never updated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lead {
    pub id: Uuid,
    pub url: String,
    pub title: String,
    pub company: String,
    pub status: LeadStatus,
    pub found_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub posted_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<u8>,
}

/// Raw candidate handed over by a search provider.
///
/// Only `url` and `title` can be assumed to exist upstream; every other
/// field is best-effort. Missing fields never reject the draft — the
/// reconciler filters or defaults them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LeadDraft {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub snippet: Option<String>,
    #[serde(default)]
    pub posted_hint: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub score: Option<u8>,
}

/// Deterministic lead id derived from the URL, so a re-discovered posting
/// maps to the same identity across runs and store rewrites.
pub fn lead_id_for_url(url: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, url.as_bytes())
}

/// Best-effort employer extraction from a posting title.
///
/// `"Data Analyst at Acme Corp"` yields `Some("Acme Corp")`;
/// `"Acme Corp | Data Analyst"` also yields `Some("Acme Corp")`.
/// Titles carrying neither delimiter yield `None` and the caller applies
/// its configured placeholder.
pub fn company_from_title(title: &str) -> Option<String> {
    if let Some((_, after)) = title.split_once(" at ") {
        let company = after.trim();
        if !company.is_empty() {
            return Some(company.to_string());
        }
    }
    if let Some((before, _)) = title.split_once(" | ") {
        let company = before.trim();
        if !company.is_empty() {
            return Some(company.to_string());
        }
    }
    None
}

/// Pulls a `"3 days ago"`-style recency phrase out of a result snippet.
/// Informational only; the reconciler never parses it back into a date.
pub fn posted_hint_from_snippet(snippet: &str) -> Option<String> {
    let words: Vec<&str> = snippet.split_whitespace().collect();
    for (i, word) in words.iter().enumerate() {
        if !word
            .trim_matches(|c: char| !c.is_ascii_alphanumeric())
            .eq_ignore_ascii_case("ago")
        {
            continue;
        }
        if i < 2 {
            continue;
        }
        let count = words[i - 2].trim_matches(|c: char| !c.is_ascii_alphanumeric());
        if count.is_empty() || !count.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        return Some(format!("{} {} ago", count, words[i - 1]));
    }
    None
}

/// Clamps a raw qualifier score into the `[0, 100]` range the store carries.
pub fn clamp_score(raw: i64) -> u8 {
    raw.clamp(0, 100) as u8
}
