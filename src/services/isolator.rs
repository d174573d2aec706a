// Context isolation for CaseStrainer
// Bounds the text window around each citation so adjacent citations never
// contaminate each other's case-name extraction

use crate::domain::{CitationOccurrence, IsolatedContext, ReferenceMarker};
use regex::Regex;
use tracing::instrument;

/// Hard cap on the backward window. A shorter window is never widened.
const MAX_BACKWARD_WINDOW: usize = 200;

/// Forward window kept only for parenthetical date detection.
const MAX_FORWARD_WINDOW: usize = 80;

/// Abbreviations that end in a period without ending a sentence.
const ABBREVIATIONS: &[&str] = &[
    "Mr.", "Mrs.", "Ms.", "Dr.", "Hon.", "Esq.", "Jr.", "Sr.", "St.", "Ave.", "v.", "vs.", "No.",
    "Nos.", "Inc.", "Co.", "Corp.", "Ltd.", "L.L.C.", "U.S.", "U.S.C.", "C.F.R.", "Cir.", "Ct.",
    "Supp.", "Ed.", "Educ.", "Dep't.", "Fed.", "Gov't.", "Stat.", "art.", "cl.", "ch.", "cf.",
    "e.g.", "i.e.", "id.", "et.", "al.",
];

pub struct ContextIsolator {
    sentence_re: Regex,
}

impl ContextIsolator {
    pub fn new() -> Self {
        Self {
            // Terminator, whitespace, then a capital or an opening quote
            // before a capital.
            sentence_re: Regex::new(r#"[.?!]["')\]]*\s+["'(\[]?[A-Z]"#)
                .expect("sentence boundary pattern"),
        }
    }

    /// Build one isolated context per occurrence. Backward windows of
    /// adjacent occurrences are disjoint or share at most one boundary
    /// character; a window never crosses the previous citation's span or an
    /// id./supra reference, which points at a different authority.
    #[instrument(skip(self, text, occurrences, references), fields(count = occurrences.len()))]
    pub fn isolate(
        &self,
        text: &str,
        occurrences: &[CitationOccurrence],
        references: &[ReferenceMarker],
    ) -> Vec<IsolatedContext> {
        let mut contexts = Vec::with_capacity(occurrences.len());

        for (i, occurrence) in occurrences.iter().enumerate() {
            let start = occurrence.start_offset;
            let prev_end = if i > 0 {
                occurrences[i - 1].end_offset
            } else {
                0
            };

            let reference_floor = references
                .iter()
                .filter(|r| r.end <= start)
                .map(|r| r.end)
                .next_back()
                .unwrap_or(0);

            let floor = snap_forward(text, start.saturating_sub(MAX_BACKWARD_WINDOW));
            let sentence_floor = self.last_sentence_boundary(text, floor, start);
            let window_start = prev_end
                .max(sentence_floor)
                .max(reference_floor)
                .max(floor)
                .min(start);

            let next_start = occurrences
                .get(i + 1)
                .map(|o| o.start_offset)
                .unwrap_or(text.len());
            let forward_end = snap_backward(text, next_start.min(occurrence.end_offset + MAX_FORWARD_WINDOW))
                .max(occurrence.end_offset);

            contexts.push(IsolatedContext {
                occurrence_index: i,
                window_start,
                window_end: start,
                before: text[window_start..start].to_string(),
                after: text[occurrence.end_offset..forward_end].to_string(),
            });
        }

        contexts
    }

    /// Offset just after the last sentence boundary in `[floor, limit)`, or
    /// `floor` when none is found.
    fn last_sentence_boundary(&self, text: &str, floor: usize, limit: usize) -> usize {
        let slice = &text[floor..limit];
        let mut best = floor;

        for m in self.sentence_re.find_iter(slice) {
            let terminator_at = floor + m.start();
            if self.is_abbreviation(text, terminator_at) {
                continue;
            }
            // The boundary sits after the terminator and trailing quotes,
            // before the whitespace-led capital.
            let after_punct = floor
                + m.start()
                + slice[m.start()..m.end()]
                    .find(char::is_whitespace)
                    .unwrap_or(1);
            best = best.max(after_punct);
        }

        // A blank line is always a boundary.
        if let Some(pos) = slice.rfind("\n\n") {
            best = best.max(floor + pos + 2);
        }

        best
    }

    /// True when the terminator at `pos` ends a known abbreviation rather
    /// than a sentence. The abbreviation must start at a word boundary so
    /// "said." is never read as "id.".
    fn is_abbreviation(&self, text: &str, pos: usize) -> bool {
        let head = &text[..=pos.min(text.len().saturating_sub(1))];
        ABBREVIATIONS.iter().any(|abbr| {
            head.ends_with(abbr)
                && head[..head.len() - abbr.len()]
                    .chars()
                    .next_back()
                    .map_or(true, |c| !c.is_alphanumeric())
        })
    }
}

impl Default for ContextIsolator {
    fn default() -> Self {
        Self::new()
    }
}

fn snap_forward(text: &str, mut pos: usize) -> usize {
    while pos < text.len() && !text.is_char_boundary(pos) {
        pos += 1;
    }
    pos
}

fn snap_backward(text: &str, mut pos: usize) -> usize {
    while pos > 0 && !text.is_char_boundary(pos) {
        pos -= 1;
    }
    pos
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::extractor::CitationExtractor;

    fn isolate(text: &str) -> Vec<IsolatedContext> {
        let extraction = CitationExtractor::new().extract(text);
        ContextIsolator::new().isolate(text, &extraction.occurrences, &extraction.references)
    }

    #[test]
    fn test_single_citation_window() {
        let text = "The Court ruled in Roe v. Wade, 410 U.S. 113 (1973).";
        let contexts = isolate(text);
        assert_eq!(contexts.len(), 1);
        assert!(contexts[0].before.contains("Roe v. Wade"));
        assert!(contexts[0].after.contains("(1973)"));
    }

    #[test]
    fn test_window_never_crosses_previous_citation() {
        let text = "citing Raines v. Byrd, 521 U.S. 811 (1997); see also Clinton v. City of New York, 524 U.S. 417 (1998).";
        let contexts = isolate(text);
        assert_eq!(contexts.len(), 2);

        // The second window must start at or after the first citation's end.
        assert!(!contexts[1].before.contains("Raines"));
        assert!(contexts[1].before.contains("Clinton v. City of New York"));
    }

    #[test]
    fn test_windows_disjoint() {
        let text = "A v. B, 100 F.3d 200 (1999). C v. D, 200 F.3d 300 (2000). E v. F, 300 F.3d 400 (2001).";
        let contexts = isolate(text);
        assert_eq!(contexts.len(), 3);
        for pair in contexts.windows(2) {
            assert!(pair[0].window_end <= pair[1].window_start);
        }
    }

    #[test]
    fn test_window_capped_at_200() {
        let filler = "x".repeat(500);
        let text = format!("{} Smith v. Jones, 100 F.3d 200 (1999)", filler);
        let contexts = isolate(&text);
        assert_eq!(contexts.len(), 1);
        assert!(contexts[0].window_end - contexts[0].window_start <= 200);
    }

    #[test]
    fn test_sentence_boundary_bounds_window() {
        let text = "The prior case ended here. Smith v. Jones, 100 F.3d 200 (1999)";
        let contexts = isolate(text);
        assert_eq!(contexts.len(), 1);
        assert!(!contexts[0].before.contains("prior case"));
        assert!(contexts[0].before.contains("Smith v. Jones"));
    }

    #[test]
    fn test_abbreviation_does_not_split() {
        let text = "As Mr. Smith argued in Smith v. Jones, 100 F.3d 200 (1999)";
        let contexts = isolate(text);
        assert_eq!(contexts.len(), 1);
        // "Mr." must not be treated as a sentence end.
        assert!(contexts[0].before.contains("Smith argued"));
    }

    #[test]
    fn test_word_ending_in_abbreviation_still_splits() {
        // "said." ends with the "id." abbreviation but is an ordinary word;
        // the sentence break after it must hold.
        let text = "That is what the witness said. Smith v. Jones, 100 F.3d 200 (1999)";
        let contexts = isolate(text);
        assert!(!contexts[0].before.contains("witness"));
        assert!(contexts[0].before.contains("Smith v. Jones"));
    }

    #[test]
    fn test_versus_abbreviation_preserved() {
        let text = "See Smith v. Jones, 100 F.3d 200 (1999)";
        let contexts = isolate(text);
        assert!(contexts[0].before.contains("Smith v. Jones"));
    }

    #[test]
    fn test_citation_at_offset_zero_empty_context() {
        let text = "410 U.S. 113 (1973) opened the opinion.";
        let contexts = isolate(text);
        assert_eq!(contexts.len(), 1);
        assert_eq!(contexts[0].before, "");
        assert_eq!(contexts[0].window_start, 0);
        assert_eq!(contexts[0].window_end, 0);
    }

    #[test]
    fn test_blank_line_is_boundary() {
        let text = "HEADING TEXT\n\nSmith v. Jones, 100 F.3d 200 (1999)";
        let contexts = isolate(text);
        assert!(!contexts[0].before.contains("HEADING"));
    }

    #[test]
    fn test_id_reference_anchors_window() {
        let text = "See id.; see also Clinton v. City of New York, 524 U.S. 417 (1998)";
        let contexts = isolate(text);
        assert_eq!(contexts.len(), 1);
        assert!(!contexts[0].before.contains("id."));
        assert!(contexts[0].before.contains("Clinton v. City of New York"));
    }

    #[test]
    fn test_forward_window_stops_at_next_citation() {
        let text = "A v. B, 100 F.3d 200 (1999); C v. D, 200 F.3d 300 (2000)";
        let contexts = isolate(text);
        assert_eq!(contexts.len(), 2);
        assert!(!contexts[0].after.contains("200 F.3d"));
    }
}
