// CaseStrainer - legal citation extraction, clustering, and verification
// Library root shared by the server and CLI binaries

pub mod api;
pub mod config;
pub mod domain;
pub mod providers;
pub mod services;
pub mod utils;

pub use config::AppConfig;
pub use domain::{
    CitationKind, CitationLookup, CitationOccurrence, Cluster, InputDescriptor, Job, JobResult,
    JobState, VerificationStatus,
};
pub use services::pipeline::CitationPipeline;
