//! Content checks for generated children's stories.

use std::collections::HashSet;

use serde::Serialize;

use crate::config::SafetySettings;

/// Flagged on a case-insensitive substring match. Ordinary adventure words
/// (monster, danger, villain, dragon, ghost) are not listed.
pub const DISALLOWED_TERMS: &[&str] = &[
    "murder",
    "suicide",
    "torture",
    "abuse",
    "rape",
    "drug",
    "alcohol",
    "hate speech",
    "racist",
    "sexist",
    "explicit",
    "pornographic",
    "violent death",
    "graphic violence",
    "blood and gore",
];

/// Sentences this short are ignored by the repetition check.
const MIN_SENTENCE_CHARS: usize = 6;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SafetyVerdict {
    pub safe: bool,
    pub issues: Vec<String>,
}

impl Default for SafetyVerdict {
    fn default() -> Self {
        Self {
            safe: true,
            issues: Vec::new(),
        }
    }
}

impl SafetyVerdict {
    fn from_issues(issues: Vec<String>) -> Self {
        Self {
            safe: issues.is_empty(),
            issues,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SafetyValidator {
    settings: SafetySettings,
}

impl Default for SafetyValidator {
    fn default() -> Self {
        Self::new(SafetySettings::default())
    }
}

impl SafetyValidator {
    pub fn new(settings: SafetySettings) -> Self {
        Self { settings }
    }

    /// Runs every check and reports all issues found.
    pub fn validate(&self, text: &str) -> SafetyVerdict {
        let mut issues = term_issues(text);

        let length = text.chars().count();
        if length > self.settings.max_chars {
            issues.push("Story is too long for target age group".to_string());
        }
        if length < self.settings.min_chars {
            issues.push("Story is too short to be meaningful".to_string());
        }

        if let Some(ratio) = unique_sentence_ratio(text) {
            if ratio < self.settings.min_unique_ratio {
                issues.push("Story contains excessive repetition".to_string());
            }
        }

        SafetyVerdict::from_issues(issues)
    }

    /// Validates a story body and also scans its choices for disallowed terms.
    pub fn validate_segment<'a, I>(&self, story: &str, choices: I) -> SafetyVerdict
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut verdict = self.validate(story);
        for choice in choices {
            for issue in term_issues(choice) {
                if !verdict.issues.contains(&issue) {
                    verdict.issues.push(issue);
                }
            }
        }
        SafetyVerdict::from_issues(verdict.issues)
    }
}

/// One issue per disallowed term present in `text`.
pub fn term_issues(text: &str) -> Vec<String> {
    let lowered = text.to_lowercase();
    DISALLOWED_TERMS
        .iter()
        .filter(|term| lowered.contains(*term))
        .map(|term| format!("Contains inappropriate content: {}", term))
        .collect()
}

/// Unique over total sentences, case-folded. `None` when there are no
/// sentences long enough to judge.
pub fn unique_sentence_ratio(text: &str) -> Option<f64> {
    let sentences: Vec<String> = text
        .split(['.', '!', '?'])
        .map(str::trim)
        .filter(|s| s.chars().count() >= MIN_SENTENCE_CHARS)
        .map(str::to_lowercase)
        .collect();
    if sentences.is_empty() {
        return None;
    }
    let unique: HashSet<&String> = sentences.iter().collect();
    Some(unique.len() as f64 / sentences.len() as f64)
}
