// Citation pipeline for CaseStrainer
// Pure stage façade: extraction -> isolation -> name extraction -> clustering

use crate::domain::{CitationOccurrence, Cluster, ExtractedName, StepTiming};
use crate::services::case_name::CaseNameExtractor;
use crate::services::clustering::ClusterBuilder;
use crate::services::extractor::{CitationExtractor, ExtractionResult};
use crate::services::isolator::ContextIsolator;
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, info, instrument};

/// Everything the synchronous stages produce. Deterministic for a given
/// input text; verification mutates the clusters afterwards.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PipelineOutput {
    pub occurrences: Vec<CitationOccurrence>,
    pub names: Vec<ExtractedName>,
    pub clusters: Vec<Cluster>,
    pub statutes_excluded: usize,
    pub warnings: Vec<String>,
    pub timing: StepTiming,
}

pub struct CitationPipeline {
    extractor: CitationExtractor,
    isolator: ContextIsolator,
    name_extractor: CaseNameExtractor,
    cluster_builder: ClusterBuilder,
}

impl CitationPipeline {
    pub fn new() -> Self {
        Self {
            extractor: CitationExtractor::new(),
            isolator: ContextIsolator::new(),
            name_extractor: CaseNameExtractor::new(),
            cluster_builder: ClusterBuilder::new(),
        }
    }

    /// Stage 1: scan the text for citation occurrences.
    pub fn extract(&self, text: &str) -> ExtractionResult {
        self.extractor.extract(text)
    }

    /// Stage 2: isolate contexts and extract case names. Parenthetical
    /// citations keep their parenthetical date but never start a name
    /// extraction.
    pub fn extract_names(&self, text: &str, extraction: &ExtractionResult) -> Vec<ExtractedName> {
        let contexts =
            self.isolator
                .isolate(text, &extraction.occurrences, &extraction.references);
        contexts
            .iter()
            .zip(&extraction.occurrences)
            .map(|(context, occurrence)| {
                let mut name = self.name_extractor.extract_name(context);
                if occurrence.parenthetical {
                    name.case_name = None;
                    name.pattern_id = None;
                    name.confidence = 0.0;
                }
                name
            })
            .collect()
    }

    /// Stage 3: group parallel citations into clusters.
    pub fn cluster(
        &self,
        text: &str,
        occurrences: &[CitationOccurrence],
        names: &[ExtractedName],
    ) -> Vec<Cluster> {
        self.cluster_builder.cluster(text, occurrences, names)
    }

    /// Run all synchronous stages. Never fails: pathological input yields an
    /// empty output with warnings in the metadata.
    #[instrument(skip(self, text), fields(len = text.len()))]
    pub fn run(&self, text: &str) -> PipelineOutput {
        let started = Instant::now();
        let extraction = self.extract(text);
        let extraction_seconds = started.elapsed().as_secs_f64();
        debug!("Extracted {} occurrences", extraction.occurrences.len());

        let started = Instant::now();
        let names = self.extract_names(text, &extraction);
        let name_extraction_seconds = started.elapsed().as_secs_f64();

        let started = Instant::now();
        let clusters = self.cluster(text, &extraction.occurrences, &names);
        let clustering_seconds = started.elapsed().as_secs_f64();

        let statutes_excluded = extraction
            .occurrences
            .iter()
            .filter(|o| !o.is_case())
            .count();

        info!(
            occurrences = extraction.occurrences.len(),
            clusters = clusters.len(),
            statutes_excluded,
            "Pipeline stages complete"
        );

        PipelineOutput {
            occurrences: extraction.occurrences,
            names,
            clusters,
            statutes_excluded,
            warnings: extraction.warnings,
            timing: StepTiming {
                extraction_seconds,
                name_extraction_seconds,
                clustering_seconds,
                verification_seconds: 0.0,
            },
        }
    }
}

impl Default for CitationPipeline {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::CitationKind;

    #[test]
    fn test_run_produces_consistent_output() {
        let pipeline = CitationPipeline::new();
        let out = pipeline.run("Roe v. Wade, 410 U.S. 113 (1973) and 42 U.S.C. § 1983.");

        assert_eq!(out.occurrences.len(), 2);
        assert_eq!(out.names.len(), 2);
        assert_eq!(out.clusters.len(), 1);
        assert_eq!(out.statutes_excluded, 1);
    }

    #[test]
    fn test_empty_text() {
        let out = CitationPipeline::new().run("");
        assert!(out.occurrences.is_empty());
        assert!(out.clusters.is_empty());
        assert_eq!(out.statutes_excluded, 0);
    }

    #[test]
    fn test_deterministic_across_runs() {
        let pipeline = CitationPipeline::new();
        let text = "See Brown v. Board of Educ., 347 U.S. 483, 495, 74 S. Ct. 686 (1954); \
                    Roe v. Wade, 410 U.S. 113 (1973); 42 U.S.C. § 1983.";
        let a = pipeline.run(text);
        let b = pipeline.run(text);
        assert_eq!(a.occurrences, b.occurrences);
        assert_eq!(a.clusters, b.clusters);
    }

    #[test]
    fn test_statute_in_flat_view_not_clusters() {
        let out = CitationPipeline::new().run("42 U.S.C. § 1983 and 347 U.S. 483 (1954).");
        assert!(out
            .occurrences
            .iter()
            .any(|o| o.kind == CitationKind::Statute));
        assert_eq!(out.clusters.len(), 1);
        assert!(out.clusters[0].occurrences.iter().all(|o| o.is_case()));
    }
}
