// Parallel-citation clustering for CaseStrainer
// Streaming single pass grouping occurrences that denote the same case

use crate::domain::{
    CitationOccurrence, Cluster, ExtractedName, VerificationStatus,
};
use regex::Regex;
use std::collections::HashMap;
use tracing::{debug, instrument};

/// Two citations further apart than this are never adjacency-clustered.
const ADJACENCY_WINDOW: usize = 200;

struct ClusterDraft {
    indices: Vec<usize>,
    last_end: usize,
    date: Option<i32>,
}

pub struct ClusterBuilder {
    separator_re: Regex,
}

impl ClusterBuilder {
    pub fn new() -> Self {
        Self {
            // Whitespace, commas, semicolons, and the word "and" are the
            // only things allowed between adjacent parallel citations.
            separator_re: Regex::new(r"^(?:[\s,;]|and\b)*$").expect("separator pattern"),
        }
    }

    /// Group case occurrences into clusters. Statutes and regulations are
    /// excluded entirely; they appear only in the flat citation list. The
    /// result is stable: it depends only on the occurrence list, never on
    /// iteration order, and clustering a flattened result reproduces it.
    #[instrument(skip(self, text, occurrences, names), fields(count = occurrences.len()))]
    pub fn cluster(
        &self,
        text: &str,
        occurrences: &[CitationOccurrence],
        names: &[ExtractedName],
    ) -> Vec<Cluster> {
        debug_assert_eq!(occurrences.len(), names.len());

        let mut drafts: Vec<ClusterDraft> = Vec::new();
        let mut cluster_of: HashMap<usize, usize> = HashMap::new();
        let mut name_index: HashMap<String, Vec<usize>> = HashMap::new();
        // Drafts still within adjacency reach of the scan position. Starts
        // are monotonic, so a draft that falls out of the window can never
        // re-enter it; pruning keeps the pass linear instead of all-pairs.
        let mut active: Vec<usize> = Vec::new();

        for (i, occurrence) in occurrences.iter().enumerate() {
            if !occurrence.is_case() {
                continue;
            }

            let name = &names[i];
            let name_key = name.case_name.as_deref().map(name_key);

            active.retain(|&ci| {
                drafts[ci].last_end + ADJACENCY_WINDOW >= occurrence.start_offset
            });

            let mut eligible: Vec<usize> = Vec::new();

            // Adjacency: separated from a cluster's tail only by
            // whitespace, commas, semicolons, or "and".
            for &ci in &active {
                let draft = &drafts[ci];
                if occurrence.start_offset < draft.last_end {
                    continue;
                }
                if self
                    .separator_re
                    .is_match(&text[draft.last_end..occurrence.start_offset])
                {
                    eligible.push(ci);
                }
            }

            // Parenthetical citations attach to the citation they follow.
            if occurrence.parenthetical && i > 0 {
                if let Some(&ci) = cluster_of.get(&(i - 1)) {
                    if !eligible.contains(&ci) {
                        eligible.push(ci);
                    }
                }
            }

            // Same extracted name elsewhere in the document, with both
            // reporter and page differing (the parallel-citation pattern).
            if let Some(key) = &name_key {
                if let Some(candidates) = name_index.get(key) {
                    for &ci in candidates {
                        if eligible.contains(&ci) {
                            continue;
                        }
                        let primary = &occurrences[drafts[ci].indices[0]];
                        if primary.reporter != occurrence.reporter
                            && primary.page != occurrence.page
                        {
                            eligible.push(ci);
                        }
                    }
                }
            }

            // Conflicting dates always keep citations apart.
            eligible.retain(|&ci| {
                !matches!(
                    (drafts[ci].date, name.date),
                    (Some(a), Some(b)) if a != b
                )
            });

            let chosen = eligible
                .into_iter()
                .min_by_key(|&ci| occurrence.start_offset.saturating_sub(drafts[ci].last_end));

            match chosen {
                Some(ci) => {
                    let draft = &mut drafts[ci];
                    draft.indices.push(i);
                    draft.last_end = occurrence.end_offset;
                    if draft.date.is_none() {
                        draft.date = name.date;
                    }
                    cluster_of.insert(i, ci);
                    if !active.contains(&ci) {
                        active.push(ci);
                    }
                }
                None => {
                    let ci = drafts.len();
                    drafts.push(ClusterDraft {
                        indices: vec![i],
                        last_end: occurrence.end_offset,
                        date: name.date,
                    });
                    cluster_of.insert(i, ci);
                    active.push(ci);
                }
            }

            if let Some(key) = name_key {
                let entry = name_index.entry(key).or_default();
                let ci = cluster_of[&i];
                if !entry.contains(&ci) {
                    entry.push(ci);
                }
            }
        }

        debug!("Built {} clusters from {} occurrences", drafts.len(), occurrences.len());
        self.finish(drafts, occurrences, names)
    }

    /// Turn drafts into domain clusters: pick the canonical extraction and
    /// assign stable ids in order of earliest member offset.
    fn finish(
        &self,
        drafts: Vec<ClusterDraft>,
        occurrences: &[CitationOccurrence],
        names: &[ExtractedName],
    ) -> Vec<Cluster> {
        let mut clusters: Vec<Cluster> = drafts
            .into_iter()
            .map(|draft| {
                // Highest-confidence non-null extraction wins; earlier
                // offsets win ties because iteration is in source order.
                let mut best: Option<&ExtractedName> = None;
                for &i in &draft.indices {
                    let candidate = &names[i];
                    if candidate.case_name.is_none() {
                        continue;
                    }
                    if best.map_or(true, |b| candidate.confidence > b.confidence) {
                        best = Some(candidate);
                    }
                }

                let extracted_date = best
                    .and_then(|b| b.date)
                    .or_else(|| draft.indices.iter().find_map(|&i| names[i].date));

                Cluster {
                    cluster_id: String::new(),
                    occurrences: draft
                        .indices
                        .iter()
                        .map(|&i| occurrences[i].clone())
                        .collect(),
                    extracted_name: best.and_then(|b| b.case_name.clone()),
                    extracted_date,
                    canonical_name: None,
                    canonical_date: None,
                    canonical_url: None,
                    verification_status: VerificationStatus::Unverified,
                    failure_reason: None,
                }
            })
            .collect();

        clusters.sort_by_key(|c| c.earliest_offset());
        for (i, cluster) in clusters.iter_mut().enumerate() {
            cluster.cluster_id = format!("cluster-{:04}", i + 1);
        }
        clusters
    }
}

impl Default for ClusterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Case-insensitive key used to match extracted names across the document.
fn name_key(name: &str) -> String {
    crate::utils::text::collapse_whitespace(&name.to_lowercase())
}
