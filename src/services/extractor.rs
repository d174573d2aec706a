// Citation extraction for CaseStrainer
// Single-pass scan producing ordered, non-overlapping citation occurrences

use crate::domain::{CitationKind, CitationOccurrence, ReferenceKind, ReferenceMarker};
use crate::services::reporters;
use crate::utils::text::{ascii_fold, collapse_whitespace};
use regex::Regex;
use tracing::{debug, instrument, warn};

/// Everything the extractor produces for one input text. Offsets in the
/// occurrences index into exactly the text given to [`CitationExtractor::extract`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractionResult {
    pub occurrences: Vec<CitationOccurrence>,
    /// id./supra short-form references, for context anchoring downstream.
    pub references: Vec<ReferenceMarker>,
    pub warnings: Vec<String>,
}

impl ExtractionResult {
    /// Rebuild a minimal text carrying every occurrence in order. Feeding
    /// the reassembly back through the extractor yields the same citation
    /// sequence.
    pub fn reassemble(&self) -> String {
        self.occurrences
            .iter()
            .map(|o| o.raw_text.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

struct RawMatch {
    start: usize,
    end: usize,
    kind: CitationKind,
    volume: u32,
    reporter: String,
    page: u32,
    normalized: String,
}

pub struct CitationExtractor {
    case_re: Regex,
    statute_re: Regex,
    regulation_re: Regex,
    pin_re: Regex,
    signal_re: Regex,
    id_re: Regex,
    supra_re: Regex,
}

impl CitationExtractor {
    pub fn new() -> Self {
        let case_pattern = format!(
            r"\b(?P<vol>\d{{1,4}})\s+(?P<rep>{})\s+(?P<page>\d{{1,5}})\b",
            reporters::variant_alternation()
        );

        Self {
            case_re: Regex::new(&case_pattern).expect("case citation pattern"),
            statute_re: Regex::new(
                r"\b(?P<title>\d{1,3})\s+U\.\s?S\.\s?C\.\s*§{1,2}\s*(?P<sec>\d[0-9A-Za-z.\-]*(?:\([0-9A-Za-z]+\))*)",
            )
            .expect("statute pattern"),
            regulation_re: Regex::new(
                r"\b(?P<title>\d{1,3})\s+C\.\s?F\.\s?R\.\s*§{1,2}\s*(?P<sec>\d[0-9A-Za-z.\-]*(?:\([0-9A-Za-z]+\))*)",
            )
            .expect("regulation pattern"),
            pin_re: Regex::new(r"^\s*,\s*(?P<pin>\d{1,5})").expect("pincite pattern"),
            signal_re: Regex::new(
                r"(?i)\b(see also|but see|see, e\.g\.|see|citing|quoting|compare|accord|cf\.|e\.g\.)[,\s]*$",
            )
            .expect("signal pattern"),
            id_re: Regex::new(r"\b[Ii]d\.(?:\s+at\s+\d{1,5})?").expect("id pattern"),
            supra_re: Regex::new(r"\b[Ss]upra(?:\s+note\s+\d{1,4})?(?:,?\s+at\s+\d{1,5})?")
                .expect("supra pattern"),
        }
    }

    /// Scan the text once and return occurrences sorted by start offset with
    /// no overlaps. Never fails: pathological input yields an empty result
    /// plus a warning.
    #[instrument(skip(self, text), fields(len = text.len()))]
    pub fn extract(&self, text: &str) -> ExtractionResult {
        if text.is_empty() {
            return ExtractionResult::default();
        }

        let mut matches = Vec::new();
        self.collect_cases(text, &mut matches);
        self.collect_statutory(text, &self.statute_re, CitationKind::Statute, "U.S.C.", &mut matches);
        self.collect_statutory(text, &self.regulation_re, CitationKind::Regulation, "C.F.R.", &mut matches);

        // Earlier match wins an overlap; at equal starts the longer one does.
        matches.sort_by(|a, b| a.start.cmp(&b.start).then(b.end.cmp(&a.end)));
        let mut kept: Vec<RawMatch> = Vec::with_capacity(matches.len());
        for m in matches {
            match kept.last() {
                Some(prev) if m.start < prev.end => {
                    debug!(
                        "Dropping overlapping citation match at {}..{}",
                        m.start, m.end
                    );
                }
                _ => kept.push(m),
            }
        }

        let mut occurrences = Vec::with_capacity(kept.len());
        for i in 0..kept.len() {
            let next_start = kept.get(i + 1).map(|m| m.start);
            let prev_end = if i > 0 { Some(kept[i - 1].end) } else { None };
            occurrences.push(self.finish_occurrence(text, &kept[i], prev_end, next_start));
        }

        let references = self.collect_references(text, &occurrences);

        let mut warnings = Vec::new();
        if occurrences.is_empty() {
            debug!("No citations found in {} bytes of text", text.len());
        }
        if occurrences.len() > 50_000 {
            warn!("Unusually dense input: {} citations", occurrences.len());
            warnings.push(format!(
                "input contains {} citation occurrences",
                occurrences.len()
            ));
        }

        ExtractionResult {
            occurrences,
            references,
            warnings,
        }
    }

    /// Find id./supra short-form references outside citation spans. These
    /// point back at earlier authorities; the isolator anchors backward
    /// windows on them so a later citation's context never swallows text
    /// that belongs to a reference.
    fn collect_references(
        &self,
        text: &str,
        occurrences: &[CitationOccurrence],
    ) -> Vec<ReferenceMarker> {
        let mut references = Vec::new();
        for (re, kind) in [
            (&self.id_re, ReferenceKind::Id),
            (&self.supra_re, ReferenceKind::Supra),
        ] {
            for m in re.find_iter(text) {
                let inside_citation = occurrences
                    .iter()
                    .any(|o| m.start() >= o.start_offset && m.start() < o.end_offset);
                if !inside_citation {
                    references.push(ReferenceMarker {
                        start: m.start(),
                        end: m.end(),
                        kind,
                    });
                }
            }
        }
        references.sort_by_key(|r| r.start);
        references
    }

    fn collect_cases(&self, text: &str, out: &mut Vec<RawMatch>) {
        for caps in self.case_re.captures_iter(text) {
            let whole = caps.get(0).unwrap();
            let rep_token = caps.name("rep").unwrap().as_str();
            let Some(canonical) = reporters::canonicalize(rep_token) else {
                // Alternation and table are built from the same data; a miss
                // would mean they drifted apart.
                warn!("Reporter token {:?} missing from table", rep_token);
                continue;
            };

            let volume: u32 = match caps.name("vol").unwrap().as_str().parse() {
                Ok(v) => v,
                Err(_) => continue,
            };
            let page: u32 = match caps.name("page").unwrap().as_str().parse() {
                Ok(v) => v,
                Err(_) => continue,
            };

            out.push(RawMatch {
                start: whole.start(),
                end: whole.end(),
                kind: CitationKind::Case,
                volume,
                reporter: canonical.to_string(),
                page,
                normalized: format!("{} {} {}", volume, canonical, page),
            });
        }
    }

    fn collect_statutory(
        &self,
        text: &str,
        re: &Regex,
        kind: CitationKind,
        reporter: &str,
        out: &mut Vec<RawMatch>,
    ) {
        for caps in re.captures_iter(text) {
            let whole = caps.get(0).unwrap();
            let title: u32 = match caps.name("title").unwrap().as_str().parse() {
                Ok(v) => v,
                Err(_) => continue,
            };
            let section = collapse_whitespace(&ascii_fold(caps.name("sec").unwrap().as_str()));
            // Sections can carry subsection letters; the numeric page field
            // keeps the leading digits only.
            let page: u32 = section
                .chars()
                .take_while(|c| c.is_ascii_digit())
                .collect::<String>()
                .parse()
                .unwrap_or(0);

            out.push(RawMatch {
                start: whole.start(),
                end: whole.end(),
                kind,
                volume: title,
                reporter: reporter.to_string(),
                page,
                normalized: format!("{} {} § {}", title, reporter, section),
            });
        }
    }

    fn finish_occurrence(
        &self,
        text: &str,
        m: &RawMatch,
        prev_end: Option<usize>,
        next_start: Option<usize>,
    ) -> CitationOccurrence {
        let mut end = m.end;
        let mut pin_cite = None;

        // A trailing ", <n>" that is not the volume of the next citation is
        // this occurrence's pincite.
        if m.kind == CitationKind::Case {
            let gap_end = next_start.unwrap_or(text.len()).min(m.end + 40);
            if gap_end > m.end {
                if let Some(caps) = self.pin_re.captures(&text[m.end..gap_end]) {
                    let pin_match = caps.get(0).unwrap();
                    if m.end + pin_match.end() <= next_start.unwrap_or(usize::MAX) {
                        pin_cite = caps.name("pin").unwrap().as_str().parse().ok();
                        end = m.end + pin_match.end();
                    }
                }
            }
        }

        let signal = self.find_signal(text, m.start, prev_end);
        let parenthetical = is_parenthetical(text, m.start, prev_end);

        CitationOccurrence {
            raw_text: text[m.start..end].to_string(),
            normalized_text: m.normalized.clone(),
            reporter: m.reporter.clone(),
            volume: m.volume,
            page: m.page,
            pin_cite,
            start_offset: m.start,
            end_offset: end,
            kind: m.kind,
            signal,
            parenthetical,
        }
    }

    /// Look for a signal phrase in the short backward window before the
    /// citation (which usually holds the case name too). The window never
    /// crosses the previous citation. The rightmost signal wins.
    fn find_signal(&self, text: &str, start: usize, prev_end: Option<usize>) -> Option<String> {
        let floor = prev_end.unwrap_or(0).max(start.saturating_sub(80));
        let window_start = snap_to_char_boundary(text, floor);
        let window = text[window_start..start].to_lowercase();

        // Trailing signal directly before the citation ("see 410 U.S. 113").
        if let Some(m) = self.signal_re.find(&window) {
            return Some(m.as_str().trim().trim_end_matches(',').to_string());
        }

        // Signal before the case name ("citing Raines v. Byrd, 521 U.S. ...").
        let mut best: Option<(usize, &str)> = None;
        for word in [
            "see also", "but see", "citing", "quoting", "compare", "accord", "see", "cf.", "e.g.",
        ] {
            if let Some(pos) = window.rfind(word) {
                let at_word_start = pos == 0
                    || window[..pos]
                        .chars()
                        .next_back()
                        .map_or(true, |c| !c.is_alphanumeric());
                if at_word_start && best.map_or(true, |(p, _)| pos > p) {
                    best = Some((pos, word));
                }
            }
        }
        best.map(|(_, word)| word.to_string())
    }
}

impl Default for CitationExtractor {
    fn default() -> Self {
        Self::new()
    }
}

/// A citation is parenthetical when an unclosed "(" sits between the end of
/// the previous citation and this one's start.
fn is_parenthetical(text: &str, start: usize, prev_end: Option<usize>) -> bool {
    let Some(prev_end) = prev_end else {
        return false;
    };
    if start.saturating_sub(prev_end) > 200 {
        return false;
    }
    let mut depth: i32 = 0;
    for ch in text[prev_end..start].chars() {
        match ch {
            '(' => depth += 1,
            ')' => depth -= 1,
            _ => {}
        }
    }
    depth > 0
}

fn snap_to_char_boundary(text: &str, mut pos: usize) -> usize {
    while pos > 0 && !text.is_char_boundary(pos) {
        pos -= 1;
    }
    pos
}
