// Case-name extraction for CaseStrainer
// Ranked pattern matching over an isolated context, with contamination
// cleaning and confidence scoring

use crate::domain::{ExtractedName, IsolatedContext, NamePattern};
use regex::Regex;
use tracing::instrument;

/// Leading words that introduce a citation without being part of the name.
const SIGNAL_WORDS: &[&str] = &[
    "see, e.g.,", "see also", "but see", "citing", "quoting", "see", "compare", "accord", "cf.",
    "e.g.,", "e.g.",
];

/// A name starting with one of these is a sentence fragment about a case,
/// not a case name.
const ACTION_WORDS: &[&str] = &["vacated", "affirmed", "reversed", "overruled", "held"];

/// Words kept lowercase by title-casing, matching legal citation style.
const SMALL_WORDS: &[&str] = &[
    "v.", "of", "the", "and", "for", "in", "on", "at", "by", "de", "la", "ex", "re", "rel.",
];

/// Closed abbreviation table applied to extracted names. Corporate suffixes
/// that convention keeps abbreviated (Co., Inc., Corp., Ltd.) are absent.
const NAME_ABBREVIATIONS: &[(&str, &str)] = &[
    ("R.R.", "Railroad"),
    ("Ry.", "Railway"),
    ("Educ.", "Education"),
    ("Bd.", "Board"),
    ("Univ.", "University"),
    ("Ass'n", "Association"),
    ("Dep't", "Department"),
    ("Comm'n", "Commission"),
    ("Nat'l", "National"),
    ("Int'l", "International"),
    ("Sav.", "Savings"),
];

pub struct CaseNameExtractor {
    patterns: Vec<(NamePattern, Regex)>,
    year_re: Regex,
    caps_run_re: Regex,
    normalize_abbreviations: bool,
}

impl CaseNameExtractor {
    pub fn new() -> Self {
        Self::with_options(true)
    }

    pub fn with_options(normalize_abbreviations: bool) -> Self {
        // One party name: capitalized words, joined by small words or
        // ampersands, ending in a capitalized word or corporate suffix.
        let word = r"[A-Z][A-Za-z'’.&\-]*";
        let side = format!(r"{w}(?:\s+(?:{w}|of|the|and|for|&|de|la|van|von))*", w = word);

        let patterns = vec![
            (
                NamePattern::StateVersus,
                Regex::new(&format!(
                    r"(?:^|[\s(])(?P<name>(?:State|People|Commonwealth)\s+v\.\s+{side})[,\s]*$"
                ))
                .expect("state-versus pattern"),
            ),
            (
                NamePattern::UnitedStatesVersus,
                Regex::new(&format!(
                    r"(?:^|[\s(])(?P<name>United\s+States\s+v\.\s+{side})[,\s]*$"
                ))
                .expect("united-states pattern"),
            ),
            (
                NamePattern::InRe,
                Regex::new(&format!(
                    r"(?:^|[\s(])(?P<name>(?:In\s+re|Matter\s+of|Estate\s+of)\s+{side})[,\s]*$"
                ))
                .expect("in-re pattern"),
            ),
            (
                NamePattern::GenericVersus,
                Regex::new(&format!(
                    r"(?P<name>{side}\s+v\.\s+{side})[,\s]*$"
                ))
                .expect("generic-versus pattern"),
            ),
        ];

        Self {
            patterns,
            year_re: Regex::new(r"\((?P<year>1[6-9]\d{2}|20\d{2})\)").expect("year pattern"),
            caps_run_re: Regex::new(r"(?:\b[A-Z][A-Z'&.\-]+\s+){3,}[A-Z][A-Z'&.\-]+\b")
                .expect("caps-run pattern"),
            normalize_abbreviations,
        }
    }

    /// Run the ranked pattern list against one isolated context. The first
    /// pattern to match wins. A null name is a valid result; the
    /// parenthetical date is captured either way.
    #[instrument(skip(self, context))]
    pub fn extract_name(&self, context: &IsolatedContext) -> ExtractedName {
        let date = self.find_date(&context.after);
        let candidate = context.before.trim_end_matches([' ', ',', '\n', '\t']);

        for (pattern_id, regex) in &self.patterns {
            let Some(caps) = regex.captures(candidate) else {
                continue;
            };
            let matched = caps.name("name").unwrap().as_str();

            let (cleaned, was_cleaned) = self.clean(matched);
            let Some(cleaned) = cleaned else {
                // Rejected outright (action word); fall through to lower
                // ranked patterns rather than giving up on the context.
                continue;
            };

            let mut confidence = pattern_id.base_confidence();
            if was_cleaned {
                confidence *= 0.85;
            }
            if cleaned.chars().count() < 6 {
                confidence *= 0.7;
            }

            if confidence < 0.4 {
                return ExtractedName {
                    case_name: None,
                    date,
                    confidence,
                    pattern_id: Some(*pattern_id),
                };
            }

            return ExtractedName {
                case_name: Some(self.finish(&cleaned)),
                date,
                confidence,
                pattern_id: Some(*pattern_id),
            };
        }

        ExtractedName {
            case_name: None,
            date,
            confidence: 0.0,
            pattern_id: None,
        }
    }

    /// Strip contamination. Returns (None, _) when the result is rejected.
    fn clean(&self, raw: &str) -> (Option<String>, bool) {
        let original = crate::utils::text::collapse_whitespace(raw);
        let mut name = original.clone();

        // Leading signal words, repeatedly. The word must end at a
        // boundary so "Seeley" is never mistaken for "see".
        loop {
            let lower = name.to_lowercase();
            let mut stripped = false;
            for word in SIGNAL_WORDS {
                if let Some(rest) = lower.strip_prefix(word) {
                    if rest.is_empty() || rest.starts_with([' ', ',']) {
                        name = name[word.len()..].trim_start_matches([' ', ',']).to_string();
                        stripped = true;
                        break;
                    }
                }
            }
            if !stripped {
                break;
            }
        }

        // Document-title contamination: runs of four or more all-caps tokens.
        name = self.caps_run_re.replace_all(&name, " ").to_string();
        name = crate::utils::text::collapse_whitespace(&name);

        // Leading articles and stray punctuation.
        loop {
            let trimmed = name
                .trim_start_matches(['.', ',', ';', ':', ')', '(', '"', '\'', ' '])
                .to_string();
            let lower = trimmed.to_lowercase();
            let without_article = if let Some(rest) = lower
                .strip_prefix("the ")
                .map(|r| trimmed[trimmed.len() - r.len()..].to_string())
            {
                rest
            } else if lower.starts_with("a ") {
                trimmed[2..].to_string()
            } else if lower.starts_with("an ") {
                trimmed[3..].to_string()
            } else {
                trimmed.clone()
            };
            if without_article == name {
                break;
            }
            name = without_article;
        }

        let leading = name
            .split_whitespace()
            .next()
            .unwrap_or("")
            .to_lowercase();
        if ACTION_WORDS.contains(&leading.as_str()) {
            return (None, true);
        }

        let was_cleaned = name != original;
        (Some(name), was_cleaned)
    }

    /// Abbreviation normalization plus title casing.
    fn finish(&self, name: &str) -> String {
        let mut words: Vec<String> = name.split_whitespace().map(str::to_string).collect();

        if self.normalize_abbreviations {
            for word in words.iter_mut() {
                if let Some((_, full)) = NAME_ABBREVIATIONS
                    .iter()
                    .find(|(abbr, _)| word == abbr || word.trim_end_matches(',') == *abbr)
                {
                    *word = full.to_string();
                }
            }
        }

        let mut out = Vec::with_capacity(words.len());
        for (i, word) in words.iter().enumerate() {
            let lower = word.to_lowercase();
            if i > 0 && SMALL_WORDS.contains(&lower.as_str()) {
                out.push(lower);
            } else {
                out.push(capitalize_first(word));
            }
        }
        out.join(" ")
    }

    fn find_date(&self, after: &str) -> Option<i32> {
        self.year_re
            .captures(after)
            .and_then(|c| c.name("year").unwrap().as_str().parse().ok())
    }
}

impl Default for CaseNameExtractor {
    fn default() -> Self {
        Self::new()
    }
}

fn capitalize_first(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(before: &str, after: &str) -> IsolatedContext {
        IsolatedContext {
            occurrence_index: 0,
            window_start: 0,
            window_end: before.len(),
            before: before.to_string(),
            after: after.to_string(),
        }
    }

    fn extract(before: &str, after: &str) -> ExtractedName {
        CaseNameExtractor::new().extract_name(&context(before, after))
    }

    #[test]
    fn test_generic_versus() {
        let name = extract("The Court ruled in Roe v. Wade, ", " (1973), that...");
        assert_eq!(name.case_name.as_deref(), Some("Roe v. Wade"));
        assert_eq!(name.date, Some(1973));
        assert_eq!(name.pattern_id, Some(NamePattern::GenericVersus));
        assert!(name.confidence >= 0.4);
    }

    #[test]
    fn test_state_versus_outranks_generic() {
        let name = extract("In State v. Miller, ", " (2005)");
        assert_eq!(name.case_name.as_deref(), Some("State v. Miller"));
        assert_eq!(name.pattern_id, Some(NamePattern::StateVersus));
    }

    #[test]
    fn test_united_states_versus() {
        let name = extract("United States v. Nixon, ", " (1974)");
        assert_eq!(name.case_name.as_deref(), Some("United States v. Nixon"));
        assert_eq!(name.pattern_id, Some(NamePattern::UnitedStatesVersus));
    }

    #[test]
    fn test_in_re() {
        let name = extract("In re Gault, ", " (1967)");
        assert_eq!(name.case_name.as_deref(), Some("In re Gault"));
        assert_eq!(name.pattern_id, Some(NamePattern::InRe));
    }

    #[test]
    fn test_signal_word_stripped_and_confidence_reduced() {
        // A capitalized signal gets swept into the pattern match and must be
        // cleaned away; a lowercase one never enters the match at all.
        let name = extract("See Raines v. Byrd, ", " (1997)");
        assert_eq!(name.case_name.as_deref(), Some("Raines v. Byrd"));
        assert!(name.confidence < NamePattern::GenericVersus.base_confidence());

        let name = extract("citing Raines v. Byrd, ", " (1997)");
        assert_eq!(name.case_name.as_deref(), Some("Raines v. Byrd"));
    }

    #[test]
    fn test_name_starting_with_see_prefix_preserved() {
        let name = extract("Seeley v. Johnson, ", " (1984)");
        assert_eq!(name.case_name.as_deref(), Some("Seeley v. Johnson"));
    }

    #[test]
    fn test_no_bleed_from_previous_citation() {
        // The isolator hands over only the bounded window; the extractor
        // must not reach past a signal phrase into the previous case name.
        let name = extract("; see also Clinton v. City of New York, ", " (1998)");
        assert_eq!(
            name.case_name.as_deref(),
            Some("Clinton v. City of New York")
        );
    }

    #[test]
    fn test_abbreviation_normalization() {
        let name = extract("See Brown v. Board of Educ., ", " (1954)");
        assert_eq!(
            name.case_name.as_deref(),
            Some("Brown v. Board of Education")
        );
    }

    #[test]
    fn test_railroad_normalization() {
        let name = extract("Erie R.R. v. Tompkins, ", " (1938)");
        assert_eq!(name.case_name.as_deref(), Some("Erie Railroad v. Tompkins"));
    }

    #[test]
    fn test_corporate_suffix_preserved() {
        let name = extract("Smith v. Acme Widget Co., ", " (1990)");
        assert_eq!(name.case_name.as_deref(), Some("Smith v. Acme Widget Co."));
    }

    #[test]
    fn test_action_word_rejected() {
        let name = extract("vacated. Jones v. Smith, ", "");
        // "vacated. Jones v. Smith" never survives as a name; the generic
        // pattern still finds "Jones v. Smith" after the sentence break.
        if let Some(n) = &name.case_name {
            assert!(!n.to_lowercase().starts_with("vacated"));
        }
    }

    #[test]
    fn test_document_title_contamination_stripped() {
        let name = extract("IN THE SUPREME COURT OF THE UNITED STATES Roe v. Wade, ", " (1973)");
        assert_eq!(name.case_name.as_deref(), Some("Roe v. Wade"));
    }

    #[test]
    fn test_null_name_on_empty_context() {
        let name = extract("", " (1973)");
        assert_eq!(name.case_name, None);
        assert_eq!(name.date, Some(1973));
        assert_eq!(name.confidence, 0.0);
        assert_eq!(name.pattern_id, None);
    }

    #[test]
    fn test_date_without_name() {
        let name = extract("as previously noted, ", " (1988)");
        assert_eq!(name.case_name, None);
        assert_eq!(name.date, Some(1988));
    }

    #[test]
    fn test_no_date_in_forward_window() {
        let name = extract("Roe v. Wade, ", ", cert. granted");
        assert_eq!(name.case_name.as_deref(), Some("Roe v. Wade"));
        assert_eq!(name.date, None);
    }

    #[test]
    fn test_minimal_name_keeps_base_confidence() {
        // "A v. B" is six characters, the shortest well-formed caption;
        // the short-result penalty only hits degenerate cleaned output.
        let name = extract("A v. B, ", "");
        assert_eq!(name.case_name.as_deref(), Some("A v. B"));
        assert!((name.confidence - NamePattern::GenericVersus.base_confidence()).abs() < 1e-9);
    }

    #[test]
    fn test_normalization_disabled() {
        let extractor = CaseNameExtractor::with_options(false);
        let name = extractor.extract_name(&context("Brown v. Board of Educ., ", " (1954)"));
        assert_eq!(name.case_name.as_deref(), Some("Brown v. Board of Educ."));
    }
}
