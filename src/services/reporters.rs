// Reporter table for CaseStrainer
// Closed set of recognized case reporters with canonical spellings

/// One recognized reporter. `variants` are the accepted spellings, all of
/// which normalize to `canonical`.
pub struct ReporterEntry {
    pub canonical: &'static str,
    pub variants: &'static [&'static str],
}

/// The closed reporter table shipped with the code. Ordering is irrelevant;
/// the alternation built from it is sorted longest-first.
pub const REPORTERS: &[ReporterEntry] = &[
    // Supreme Court
    ReporterEntry { canonical: "U.S.", variants: &["U.S.", "U. S."] },
    ReporterEntry { canonical: "S. Ct.", variants: &["S. Ct.", "S.Ct."] },
    ReporterEntry { canonical: "L. Ed. 2d", variants: &["L. Ed. 2d", "L.Ed.2d", "L. Ed.2d"] },
    ReporterEntry { canonical: "L. Ed.", variants: &["L. Ed.", "L.Ed."] },
    // Federal appellate
    ReporterEntry { canonical: "F.4th", variants: &["F.4th", "F. 4th"] },
    ReporterEntry { canonical: "F.3d", variants: &["F.3d", "F. 3d"] },
    ReporterEntry { canonical: "F.2d", variants: &["F.2d", "F. 2d"] },
    ReporterEntry { canonical: "F.", variants: &["F."] },
    // Federal district
    ReporterEntry { canonical: "F. Supp. 3d", variants: &["F. Supp. 3d", "F.Supp.3d", "F. Supp.3d"] },
    ReporterEntry { canonical: "F. Supp. 2d", variants: &["F. Supp. 2d", "F.Supp.2d", "F. Supp.2d"] },
    ReporterEntry { canonical: "F. Supp.", variants: &["F. Supp.", "F.Supp."] },
    // Regional reporters
    ReporterEntry { canonical: "A.3d", variants: &["A.3d", "A. 3d"] },
    ReporterEntry { canonical: "A.2d", variants: &["A.2d", "A. 2d"] },
    ReporterEntry { canonical: "A.", variants: &["A."] },
    ReporterEntry { canonical: "P.3d", variants: &["P.3d", "P. 3d"] },
    ReporterEntry { canonical: "P.2d", variants: &["P.2d", "P. 2d"] },
    ReporterEntry { canonical: "P.", variants: &["P."] },
    ReporterEntry { canonical: "N.E.3d", variants: &["N.E.3d", "N.E. 3d"] },
    ReporterEntry { canonical: "N.E.2d", variants: &["N.E.2d", "N.E. 2d"] },
    ReporterEntry { canonical: "N.E.", variants: &["N.E."] },
    ReporterEntry { canonical: "N.W.2d", variants: &["N.W.2d", "N.W. 2d"] },
    ReporterEntry { canonical: "N.W.", variants: &["N.W."] },
    ReporterEntry { canonical: "S.E.2d", variants: &["S.E.2d", "S.E. 2d"] },
    ReporterEntry { canonical: "S.E.", variants: &["S.E."] },
    ReporterEntry { canonical: "S.W.3d", variants: &["S.W.3d", "S.W. 3d"] },
    ReporterEntry { canonical: "S.W.2d", variants: &["S.W.2d", "S.W. 2d"] },
    ReporterEntry { canonical: "S.W.", variants: &["S.W."] },
    ReporterEntry { canonical: "So. 3d", variants: &["So. 3d", "So.3d"] },
    ReporterEntry { canonical: "So. 2d", variants: &["So. 2d", "So.2d"] },
    ReporterEntry { canonical: "So.", variants: &["So."] },
    // State reporters
    ReporterEntry { canonical: "Pa.", variants: &["Pa."] },
    ReporterEntry { canonical: "Cal. 4th", variants: &["Cal. 4th", "Cal.4th"] },
    ReporterEntry { canonical: "Cal. 3d", variants: &["Cal. 3d", "Cal.3d"] },
    ReporterEntry { canonical: "Cal.", variants: &["Cal."] },
    ReporterEntry { canonical: "N.Y.2d", variants: &["N.Y.2d", "N.Y. 2d"] },
    ReporterEntry { canonical: "N.Y.", variants: &["N.Y."] },
    ReporterEntry { canonical: "Mass.", variants: &["Mass."] },
    ReporterEntry { canonical: "Ill. 2d", variants: &["Ill. 2d", "Ill.2d"] },
    ReporterEntry { canonical: "Ill.", variants: &["Ill."] },
    ReporterEntry { canonical: "Ohio St. 3d", variants: &["Ohio St. 3d", "Ohio St.3d"] },
    ReporterEntry { canonical: "Ohio St.", variants: &["Ohio St."] },
    ReporterEntry { canonical: "Tex.", variants: &["Tex."] },
    ReporterEntry { canonical: "Wash. 2d", variants: &["Wash. 2d", "Wash.2d"] },
    ReporterEntry { canonical: "Wash.", variants: &["Wash."] },
];

/// Map one matched reporter token to its canonical spelling. The token is
/// compared with runs of whitespace collapsed to single spaces.
pub fn canonicalize(token: &str) -> Option<&'static str> {
    let collapsed = collapse_spaces(token);
    for entry in REPORTERS {
        for variant in entry.variants {
            if collapsed == *variant {
                return Some(entry.canonical);
            }
        }
    }
    None
}

/// Build a regex alternation matching every variant, longest spellings
/// first so "L. Ed. 2d" wins over "L. Ed.". Dots are escaped and spaces
/// accept any horizontal whitespace run.
pub fn variant_alternation() -> String {
    let mut variants: Vec<&str> = REPORTERS
        .iter()
        .flat_map(|e| e.variants.iter().copied())
        .collect();
    variants.sort_by_key(|v| std::cmp::Reverse(v.len()));

    let parts: Vec<String> = variants.iter().map(|v| variant_pattern(v)).collect();
    parts.join("|")
}

fn variant_pattern(variant: &str) -> String {
    let mut pattern = String::new();
    for ch in variant.chars() {
        match ch {
            '.' => pattern.push_str(r"\."),
            ' ' => pattern.push_str(r"\s+"),
            c => pattern.push(c),
        }
    }
    pattern
}

fn collapse_spaces(token: &str) -> String {
    token.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonicalize_exact() {
        assert_eq!(canonicalize("U.S."), Some("U.S."));
        assert_eq!(canonicalize("F.3d"), Some("F.3d"));
        assert_eq!(canonicalize("So. 2d"), Some("So. 2d"));
    }

    #[test]
    fn test_canonicalize_variants() {
        assert_eq!(canonicalize("U. S."), Some("U.S."));
        assert_eq!(canonicalize("S.Ct."), Some("S. Ct."));
        assert_eq!(canonicalize("F. 3d"), Some("F.3d"));
        assert_eq!(canonicalize("L.Ed.2d"), Some("L. Ed. 2d"));
        assert_eq!(canonicalize("F.Supp.2d"), Some("F. Supp. 2d"));
    }

    #[test]
    fn test_canonicalize_collapses_whitespace() {
        assert_eq!(canonicalize("S.  Ct."), Some("S. Ct."));
    }

    #[test]
    fn test_unknown_reporter() {
        assert_eq!(canonicalize("X.Y.Z."), None);
        assert_eq!(canonicalize("U.S.C."), None);
    }

    #[test]
    fn test_alternation_prefers_longest() {
        let alternation = variant_alternation();
        let led2d = alternation.find(r"L\.\s+Ed\.\s+2d").unwrap();
        let led = alternation.find(r"L\.\s+Ed\.|").unwrap();
        assert!(led2d < led);
    }

    #[test]
    fn test_alternation_compiles() {
        let re = regex::Regex::new(&variant_alternation()).unwrap();
        assert!(re.is_match("F.3d"));
        assert!(re.is_match("L. Ed. 2d"));
    }
}
