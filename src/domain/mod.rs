// Core domain models for CaseStrainer
// Citation occurrences, clusters, jobs, and results with serde serialization

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Version prefix written into every persisted record so stored values are
/// self-describing across schema changes.
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CitationKind {
    Case,
    Statute,
    Regulation,
    Unknown,
}

/// One textual appearance of a citation in the source document.
///
/// Offsets are byte offsets into the exact text handed to the extractor and
/// always fall on character boundaries. `raw_text` preserves the original
/// bytes; `normalized_text` carries canonical spacing, punctuation, and
/// reporter spelling.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CitationOccurrence {
    pub raw_text: String,
    pub normalized_text: String,
    pub reporter: String,
    pub volume: u32,
    pub page: u32,
    pub pin_cite: Option<u32>,
    pub start_offset: usize,
    pub end_offset: usize,
    pub kind: CitationKind,
    /// Signal phrase ("see", "citing", ...) found immediately before the
    /// citation, lowercased. Anchors context isolation downstream.
    pub signal: Option<String>,
    /// True when the citation sits wholly inside a parenthetical attached to
    /// a preceding citation. Parallel candidate, never a name-extraction
    /// starting point.
    pub parenthetical: bool,
}

impl CitationOccurrence {
    pub fn is_case(&self) -> bool {
        self.kind == CitationKind::Case
    }

    pub fn span_len(&self) -> usize {
        self.end_offset - self.start_offset
    }
}

/// A short-form reference ("id.", "supra") pointing back at an earlier
/// authority. Not a citation occurrence itself; the isolator uses these to
/// keep a following citation's window from swallowing the referenced text.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReferenceKind {
    Id,
    Supra,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReferenceMarker {
    pub start: usize,
    pub end: usize,
    pub kind: ReferenceKind,
}

/// The bounded text window used to extract the case name for one occurrence.
/// Built during extraction, discarded after case-name extraction.
#[derive(Debug, Clone, PartialEq)]
pub struct IsolatedContext {
    pub occurrence_index: usize,
    /// Start of the backward window in the source text.
    pub window_start: usize,
    /// End of the backward window; equals the occurrence's start offset.
    pub window_end: usize,
    /// Text of the backward window.
    pub before: String,
    /// Short forward window kept only for parenthetical date detection.
    pub after: String,
}

/// Which ranked pattern produced a case-name extraction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NamePattern {
    StateVersus,
    UnitedStatesVersus,
    InRe,
    GenericVersus,
}

impl NamePattern {
    /// Base confidence carried by each pattern; more specific patterns score
    /// higher.
    pub fn base_confidence(&self) -> f64 {
        match self {
            Self::StateVersus => 0.95,
            Self::UnitedStatesVersus => 0.95,
            Self::InRe => 0.9,
            Self::GenericVersus => 0.85,
        }
    }
}

/// Result of case-name extraction for one occurrence. A null `case_name` is
/// a valid outcome, not an error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtractedName {
    pub case_name: Option<String>,
    pub date: Option<i32>,
    pub confidence: f64,
    pub pattern_id: Option<NamePattern>,
}

impl ExtractedName {
    pub fn empty() -> Self {
        Self {
            case_name: None,
            date: None,
            confidence: 0.0,
            pattern_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Verified,
    VerifiedByParallel,
    Unverified,
    Failed,
}

/// A set of citation occurrences asserted to refer to the same case.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Cluster {
    pub cluster_id: String,
    /// Members ordered by first appearance in the source.
    pub occurrences: Vec<CitationOccurrence>,
    pub extracted_name: Option<String>,
    pub extracted_date: Option<i32>,
    pub canonical_name: Option<String>,
    pub canonical_date: Option<String>,
    pub canonical_url: Option<String>,
    pub verification_status: VerificationStatus,
    pub failure_reason: Option<String>,
}

impl Cluster {
    /// The earliest occurrence by offset; verification starts here.
    pub fn primary_citation(&self) -> &CitationOccurrence {
        &self.occurrences[0]
    }

    pub fn earliest_offset(&self) -> usize {
        self.occurrences[0].start_offset
    }
}

/// How the input text was obtained. File uploads are decoded to UTF-8 at
/// the submission boundary, so a job record re-read by any worker carries
/// everything needed to run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum InputDescriptor {
    Text { text: String },
    Url { url: String },
    File { name: String, text: String },
}

impl InputDescriptor {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Url { .. } => "url",
            Self::File { .. } => "file",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Job states move only forward, except that queued and running jobs may
    /// be cancelled.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        match (self, next) {
            (Self::Queued, Self::Running) => true,
            (Self::Queued, Self::Cancelled) => true,
            // A queued job whose claim expired past the retry cap fails
            // without ever running.
            (Self::Queued, Self::Failed) => true,
            (Self::Running, Self::Completed) => true,
            (Self::Running, Self::Failed) => true,
            (Self::Running, Self::Cancelled) => true,
            // Claim expiry re-queues a running job for another attempt.
            (Self::Running, Self::Queued) => true,
            _ => false,
        }
    }
}

/// Pipeline step currently executing, reported through job status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStep {
    Queued,
    Extraction,
    NameExtraction,
    Clustering,
    Verification,
    Done,
}

impl JobStep {
    /// Fixed share of overall progress attributed to each step.
    pub fn weight(&self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::Extraction => 10,
            Self::NameExtraction => 20,
            Self::Clustering => 10,
            Self::Verification => 60,
            Self::Done => 0,
        }
    }

    /// Progress accumulated by all steps before this one.
    pub fn completed_weight_before(&self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::Extraction => 0,
            Self::NameExtraction => 10,
            Self::Clustering => 30,
            Self::Verification => 40,
            Self::Done => 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub job_id: String,
    pub input_descriptor: InputDescriptor,
    pub state: JobState,
    pub progress: u8,
    pub current_step: JobStep,
    pub eta_seconds: Option<u64>,
    pub total_citations: usize,
    pub processed_citations: usize,
    pub result: Option<JobResult>,
    pub error: Option<String>,
    /// Delivery attempt count; claims that expire re-queue the job until the
    /// retry cap is reached.
    pub attempt: u32,
    pub claim_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(job_id: String, input_descriptor: InputDescriptor) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            input_descriptor,
            state: JobState::Queued,
            progress: 0,
            current_step: JobStep::Queued,
            eta_seconds: None,
            total_citations: 0,
            processed_citations: 0,
            result: None,
            error: None,
            attempt: 0,
            claim_expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Counts reported alongside every completed result. Internally consistent:
/// verified + verified_by_parallel + unverified + failed == total_clusters.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResultMetadata {
    pub total: usize,
    pub total_clusters: usize,
    pub verified: usize,
    pub verified_by_parallel: usize,
    pub unverified: usize,
    pub failed: usize,
    pub statutes_excluded: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StepTiming {
    pub extraction_seconds: f64,
    pub name_extraction_seconds: f64,
    pub clustering_seconds: f64,
    pub verification_seconds: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobResult {
    pub clusters: Vec<Cluster>,
    /// Flat occurrence view for clients that ignore clustering. Includes
    /// statutes and regulations excluded from the clusters.
    pub citations: Vec<CitationOccurrence>,
    pub metadata: ResultMetadata,
    pub timing: StepTiming,
}

/// Canonical record returned by the citation database for a found citation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CitationLookup {
    pub found: bool,
    pub canonical_name: Option<String>,
    pub canonical_date: Option<String>,
    pub court: Option<String>,
    pub docket: Option<String>,
    pub url: Option<String>,
}

impl CitationLookup {
    pub fn not_found() -> Self {
        Self {
            found: false,
            canonical_name: None,
            canonical_date: None,
            court: None,
            docket: None,
            url: None,
        }
    }
}
