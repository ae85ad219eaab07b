//! Core data models.
//!
//! These types represent services, background processes, per-tag statistics,
//! and similarity edges as they flow through the lifecycle
//! (Prepare → Activate → Index → IndexPartial → queries).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What kind of statistical service this is.
///
/// Only `Prc` (probabilistic recommendation/content-similarity) services are
/// built by this crate; the other kinds exist so their records round-trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    Classifier,
    Prc,
    Search,
}

/// Lifecycle status of a service. A service has exactly one status at a
/// time; transitions are gated by the currently-running process kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    New,
    Prepared,
    Busy,
    Active,
}

impl ServiceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Classifier => "classifier",
            ServiceKind::Prc => "prc",
            ServiceKind::Search => "search",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "classifier" => Some(ServiceKind::Classifier),
            "prc" => Some(ServiceKind::Prc),
            "search" => Some(ServiceKind::Search),
            _ => None,
        }
    }
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::New => "new",
            ServiceStatus::Prepared => "prepared",
            ServiceStatus::Busy => "busy",
            ServiceStatus::Active => "active",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "new" => Some(ServiceStatus::New),
            "prepared" => Some(ServiceStatus::Prepared),
            "busy" => Some(ServiceStatus::Busy),
            "active" => Some(ServiceStatus::Active),
            _ => None,
        }
    }
}

/// Settings recorded when a PRC service is prepared.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrcSettings {
    /// Tag ids the service covers.
    pub tag_ids: Vec<String>,
    /// Document fields fed to the word-occurrence statistics.
    #[serde(default = "default_fields")]
    pub fields: Vec<String>,
    /// N-gram size used when building subsets. Valid range 1..=3.
    #[serde(default = "default_n_gram")]
    pub n_gram: u8,
    /// Fraction of the lowest-weighted dictionary words dropped when the
    /// weighted dictionary is built. Valid range [0.0, 1.0).
    #[serde(default)]
    pub compression: f64,
}

fn default_fields() -> Vec<String> {
    vec!["body".to_string()]
}

fn default_n_gram() -> u8 {
    1
}

impl PrcSettings {
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.tag_ids.is_empty() {
            return Err(crate::error::Error::Validation(
                "settings must name at least one tag".into(),
            ));
        }
        if self.fields.is_empty() {
            return Err(crate::error::Error::Validation(
                "settings must name at least one field".into(),
            ));
        }
        if !(1..=3).contains(&self.n_gram) {
            return Err(crate::error::Error::Validation(format!(
                "n_gram must be between 1 and 3, got {}",
                self.n_gram
            )));
        }
        if !(0.0..1.0).contains(&self.compression) {
            return Err(crate::error::Error::Validation(format!(
                "compression must be in [0.0, 1.0), got {}",
                self.compression
            )));
        }
        Ok(())
    }
}

/// Tag/query filter recorded by a full `Index` run. The watermark scopes the
/// next partial run's "changed since" query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexFilter {
    pub tag_ids: Vec<String>,
    #[serde(default)]
    pub query: Option<String>,
    /// Start time of the last index run that completed for this filter.
    pub indexed_at: DateTime<Utc>,
}

/// A registered service and its lifecycle state.
#[derive(Debug, Clone)]
pub struct Service {
    pub id: String,
    pub kind: ServiceKind,
    pub status: ServiceStatus,
    pub alias: Option<String>,
    pub settings: Option<PrcSettings>,
    pub index_filter: Option<IndexFilter>,
    /// Ids of every process ever run against this service, oldest first.
    pub process_ids: Vec<Uuid>,
}

/// Operation kinds a background process can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    Prepare,
    Activate,
    Index,
    IndexPartial,
    ExportDictionaries,
}

impl ProcessKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessKind::Prepare => "prepare",
            ProcessKind::Activate => "activate",
            ProcessKind::Index => "index",
            ProcessKind::IndexPartial => "index_partial",
            ProcessKind::ExportDictionaries => "export_dictionaries",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "prepare" => Some(ProcessKind::Prepare),
            "activate" => Some(ProcessKind::Activate),
            "index" => Some(ProcessKind::Index),
            "index_partial" => Some(ProcessKind::IndexPartial),
            "export_dictionaries" => Some(ProcessKind::ExportDictionaries),
            _ => None,
        }
    }
}

/// Status of a background process.
///
/// `Cancelling` is an externally-observed intermediate state; the job body
/// decides at its checkpoints when to honor it and move to `Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    InProgress,
    Cancelling,
    Cancelled,
    Finished,
    Error,
}

impl ProcessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessStatus::InProgress => "in_progress",
            ProcessStatus::Cancelling => "cancelling",
            ProcessStatus::Cancelled => "cancelled",
            ProcessStatus::Finished => "finished",
            ProcessStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "in_progress" => Some(ProcessStatus::InProgress),
            "cancelling" => Some(ProcessStatus::Cancelling),
            "cancelled" => Some(ProcessStatus::Cancelled),
            "finished" => Some(ProcessStatus::Finished),
            "error" => Some(ProcessStatus::Error),
            _ => None,
        }
    }

    /// Terminal states never change again and set `ended_at` exactly once.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessStatus::Cancelled | ProcessStatus::Finished | ProcessStatus::Error
        )
    }
}

/// A durable record of one long-running operation.
#[derive(Debug, Clone)]
pub struct Process {
    pub id: Uuid,
    pub kind: ProcessKind,
    /// Id of the service (or other object) the process runs against.
    pub object_id: String,
    pub description: String,
    pub status: ProcessStatus,
    /// Percent complete, monotonically non-decreasing while InProgress.
    pub percent: u8,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub errors: Vec<String>,
    pub result: Option<String>,
    /// Opaque snapshot of the request that started the process.
    pub init_snapshot: serde_json::Value,
}

/// Occurrence counts for one word within one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WordStats {
    /// Occurrences across the whole corpus.
    pub corpus_count: u64,
    /// Occurrences inside this document.
    pub local_count: u64,
}

/// Per-tag word-occurrence statistics used to build a weighted dictionary.
///
/// BTreeMap keeps artifact files and dictionary builds deterministic.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TagSubset {
    pub words: BTreeMap<String, TagWordStats>,
}

/// Occurrence counts for one word within one tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagWordStats {
    pub corpus_count: u64,
    pub tag_count: u64,
}

impl TagSubset {
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

/// One directional, score-ranked similarity edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityEntry {
    pub neighbor_id: String,
    pub score: f64,
}

/// A document as seen by the recommendation queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub tag_id: String,
    pub title: Option<String>,
    pub body: String,
    pub modified_at: DateTime<Utc>,
}
