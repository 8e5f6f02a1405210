//! Canonical-name matchers for free text.

use std::collections::BTreeSet;

use regex::{Regex, RegexBuilder};
use tracing::warn;

/// Product-line keywords that imply an equipment category even when no
/// canonical name is present. Matched as case-sensitive substrings.
pub const CATEGORY_LOOKUP: &[(&str, &str)] = &[
    ("FortiGate", "Firewall"),
    ("FortiWeb", "Web Application Firewall"),
    ("FortiAnalyzer", "Log Management"),
    ("Catalyst", "Switch"),
    ("Nexus", "Switch"),
    ("PowerEdge", "Server"),
    ("ProLiant", "Server"),
    ("ThinkSystem", "Server"),
    ("BIG-IP", "Load Balancer"),
    ("Thunder ADC", "Load Balancer"),
    ("PRTG", "Network Monitoring"),
    ("Falcon Sensor", "Endpoint Protection"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchOptions {
    pub case_sensitive: bool,
    pub whole_word: bool,
    /// Whitespace inside a name matches zero or more whitespace characters.
    pub flexible_spacing: bool,
    /// A parenthetical inside a name is also matched on its own.
    pub match_partial: bool,
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self {
            case_sensitive: false,
            whole_word: true,
            flexible_spacing: true,
            match_partial: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FindOptions {
    pub matching: MatchOptions,
    /// Fold [`CATEGORY_LOOKUP`] hits into the result.
    pub use_category_lookup: bool,
}

impl Default for FindOptions {
    fn default() -> Self {
        Self {
            matching: MatchOptions::default(),
            use_category_lookup: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompiledPattern {
    /// Canonical name reported for any hit, including parenthetical sub-matches.
    pub name: String,
    pub regex: Regex,
}

fn parenthetical(name: &str) -> Option<&str> {
    let open = name.find('(')?;
    let rest = &name[open + 1..];
    let close = rest.find(')')?;
    Some(&rest[..close]).filter(|inner| !inner.is_empty())
}

fn pattern_source(literal: &str, options: MatchOptions) -> String {
    let body = if options.flexible_spacing {
        literal
            .split_whitespace()
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(r"\s*")
    } else {
        regex::escape(literal)
    };
    if options.whole_word {
        format!(r"\b{body}\b")
    } else {
        body
    }
}

pub fn compile_patterns<S: AsRef<str>>(
    names: &[S],
    options: MatchOptions,
) -> Result<Vec<CompiledPattern>, regex::Error> {
    let mut compiled = Vec::with_capacity(names.len());
    for name in names {
        let name = name.as_ref();
        let mut literals = vec![name];
        if options.match_partial {
            if let Some(inner) = parenthetical(name) {
                literals.push(inner);
            }
        }
        for literal in literals {
            let regex = RegexBuilder::new(&pattern_source(literal, options))
                .case_insensitive(!options.case_sensitive)
                .build()?;
            compiled.push(CompiledPattern {
                name: name.to_string(),
                regex,
            });
        }
    }
    Ok(compiled)
}

/// Reusable set of compiled canonical-name patterns.
#[derive(Debug, Clone, Default)]
pub struct PatternMatcher {
    patterns: Vec<CompiledPattern>,
}

impl PatternMatcher {
    pub fn compile<S: AsRef<str>>(names: &[S], options: MatchOptions) -> Result<Self, regex::Error> {
        Ok(Self {
            patterns: compile_patterns(names, options)?,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Every canonical name with at least one hit in `text`.
    pub fn matches(&self, text: &str) -> BTreeSet<String> {
        self.patterns
            .iter()
            .filter(|p| p.regex.is_match(text))
            .map(|p| p.name.clone())
            .collect()
    }

    pub fn first_match(&self, text: &str) -> Option<&str> {
        self.patterns
            .iter()
            .find(|p| p.regex.is_match(text))
            .map(|p| p.name.as_str())
    }
}

fn lookup_hits(text: &str) -> impl Iterator<Item = &'static str> + '_ {
    CATEGORY_LOOKUP
        .iter()
        .filter(move |(needle, _)| text.contains(needle))
        .map(|(_, category)| *category)
}

fn compile_for_find<S: AsRef<str>>(patterns: &[S], options: FindOptions) -> Option<PatternMatcher> {
    match PatternMatcher::compile(patterns, options.matching) {
        Ok(matcher) => Some(matcher),
        Err(err) => {
            warn!(error = %err, "pattern compilation failed");
            None
        }
    }
}

/// Distinct canonical names (plus lookup categories) found in `text`.
pub fn find_matches<S: AsRef<str>>(text: &str, patterns: &[S], options: FindOptions) -> BTreeSet<String> {
    if text.is_empty() || patterns.is_empty() {
        return BTreeSet::new();
    }
    let Some(matcher) = compile_for_find(patterns, options) else {
        return BTreeSet::new();
    };

    let mut found = matcher.matches(text);
    if options.use_category_lookup {
        found.extend(lookup_hits(text).map(str::to_string));
    }
    found
}

/// First canonical name found in `text`, checking the lookup table last.
pub fn find_first<S: AsRef<str>>(text: &str, patterns: &[S], options: FindOptions) -> Option<String> {
    if text.is_empty() || patterns.is_empty() {
        return None;
    }
    let matcher = compile_for_find(patterns, options)?;

    if let Some(name) = matcher.first_match(text) {
        return Some(name.to_string());
    }
    if options.use_category_lookup {
        return lookup_hits(text).next().map(str::to_string);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loose() -> FindOptions {
        FindOptions {
            matching: MatchOptions {
                whole_word: false,
                ..MatchOptions::default()
            },
            use_category_lookup: true,
        }
    }

    #[test]
    fn parenthetical_matches_alone_under_canonical_name() {
        let found = find_matches(
            "Gia hạn bản quyền Palo Alto cho cụm tường lửa",
            &["Firewall (Palo Alto)"],
            FindOptions::default(),
        );
        assert_eq!(found, BTreeSet::from(["Firewall (Palo Alto)".to_string()]));
    }

    #[test]
    fn partial_matching_can_be_disabled() {
        let options = FindOptions {
            matching: MatchOptions {
                match_partial: false,
                ..MatchOptions::default()
            },
            use_category_lookup: false,
        };
        assert!(find_matches("Palo Alto", &["Firewall (Palo Alto)"], options).is_empty());
    }

    #[test]
    fn empty_inputs_yield_nothing() {
        let none: [&str; 0] = [];
        assert!(find_matches("", &["Cisco"], FindOptions::default()).is_empty());
        assert!(find_matches("Cisco Catalyst", &none, FindOptions::default()).is_empty());
        assert_eq!(find_first("", &["Cisco"], FindOptions::default()), None);
        assert_eq!(find_first("Cisco Catalyst", &none, FindOptions::default()), None);
    }

    #[test]
    fn flexible_spacing_tolerates_collapsed_whitespace() {
        let found = find_matches("thiết bị CheckPoint 6200", &["Check Point"], loose());
        assert_eq!(found, BTreeSet::from(["Check Point".to_string()]));

        let strict = FindOptions {
            matching: MatchOptions {
                flexible_spacing: false,
                whole_word: false,
                ..MatchOptions::default()
            },
            use_category_lookup: false,
        };
        assert!(find_matches("CheckPoint", &["Check Point"], strict).is_empty());
    }

    #[test]
    fn whole_word_rejects_embedded_names() {
        let options = FindOptions {
            use_category_lookup: false,
            ..FindOptions::default()
        };
        assert!(find_matches("giải pháp F5000X", &["F5"], options).is_empty());
        assert_eq!(
            find_matches("thiết bị F5 BIG-IP", &["F5"], options),
            BTreeSet::from(["F5".to_string()])
        );
    }

    #[test]
    fn special_characters_are_literal() {
        let options = FindOptions {
            matching: MatchOptions {
                whole_word: false,
                ..MatchOptions::default()
            },
            use_category_lookup: false,
        };
        assert!(find_matches("A10 Networks", &["A1.*"], options).is_empty());
        assert_eq!(
            find_matches("license for C++ tools", &["C++"], options),
            BTreeSet::from(["C++".to_string()])
        );
    }

    #[test]
    fn case_sensitivity_is_optional() {
        let sensitive = FindOptions {
            matching: MatchOptions {
                case_sensitive: true,
                ..MatchOptions::default()
            },
            use_category_lookup: false,
        };
        assert!(find_matches("cisco switch", &["Cisco"], sensitive).is_empty());
        assert_eq!(
            find_first("cisco switch", &["Cisco"], loose()),
            Some("Cisco".to_string())
        );
    }

    #[test]
    fn lookup_table_is_folded_in_unless_disabled() {
        let text = "Mua sắm 02 FortiGate 600E";
        let found = find_matches(text, &["Cisco"], loose());
        assert_eq!(found, BTreeSet::from(["Firewall".to_string()]));
        assert_eq!(find_first(text, &["Cisco"], loose()), Some("Firewall".to_string()));

        let without = FindOptions {
            use_category_lookup: false,
            ..loose()
        };
        assert!(find_matches(text, &["Cisco"], without).is_empty());
    }

    #[test]
    fn title_with_direct_vendor_name() {
        let options = FindOptions {
            matching: MatchOptions {
                whole_word: false,
                flexible_spacing: true,
                ..MatchOptions::default()
            },
            ..FindOptions::default()
        };
        let found = find_matches(
            "Mua thiết bị tường lửa Palo Alto (PA-Series)",
            &["Palo Alto"],
            options,
        );
        assert_eq!(found, BTreeSet::from(["Palo Alto".to_string()]));
    }
}
