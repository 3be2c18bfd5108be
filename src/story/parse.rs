//! Turns free-text model replies into a story body plus choices.
//!
//! Nothing here fails: malformed replies degrade to "whole text is the story"
//! and missing or unusable choices are backfilled from a fixed generic set.

use std::sync::OnceLock;

use regex::Regex;

use super::prompt::CHOICE_SENTINEL;

pub const MAX_CHOICES: usize = 3;

/// Substituted, in order, for missing or rejected choices.
pub const FALLBACK_CHOICES: [&str; MAX_CHOICES] = [
    "Continue exploring the area and discover what lies ahead",
    "Talk to someone nearby to learn more about the situation",
    "Try a different approach to solve the current challenge",
];

/// Markers that mean formatting or template text leaked into a choice.
const LEAKAGE_MARKERS: &[&str] = &["**", "__", "```", "##", "[choice", "[first choice", "accessor"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedReply {
    pub story: String,
    /// Extracted choices, at most three, before any backfilling.
    pub choices: Vec<String>,
}

/// Story text and the raw choices section, if one was located.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extraction<'a> {
    pub story: &'a str,
    pub choices: Option<&'a str>,
}

type Strategy = for<'a> fn(&'a str) -> Option<Extraction<'a>>;

/// Tried in order; the first to return `Some` wins.
const STRATEGIES: [(&str, Strategy); 3] = [
    ("labeled-sections", labeled_sections),
    ("marker-split", marker_split),
    ("whole-text", whole_text),
];

fn story_label() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^[\s*#]*story\s*:\**").expect("valid regex"))
}

fn choices_label() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?im)^[\s*#]*choices\s*:\**").expect("valid regex"))
}

fn choice_label() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)(?:^|[ \t])[*_]{0,2}\(?([ABC])[:)][*_]{0,2}[ \t]*").expect("valid regex"))
}

fn sentinel() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(&format!("(?i){}", regex::escape(CHOICE_SENTINEL))).expect("valid regex"))
}

fn trailing_sentinel() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(&format!(r"(?i){}[\s*_]*$", regex::escape(CHOICE_SENTINEL))).expect("valid regex"))
}

fn first_choice_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^[ \t]*[*_]{0,2}\(?A[:)]").expect("valid regex"))
}

fn list_bullet() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?:[-*•]|\d+[.)])\s+").expect("valid regex"))
}

/// `STORY: ... CHOICES: ...`, with or without the STORY label.
pub fn labeled_sections(raw: &str) -> Option<Extraction<'_>> {
    let label = choices_label().find(raw)?;
    Some(Extraction {
        story: &raw[..label.start()],
        choices: Some(&raw[label.end()..]),
    })
}

/// Story up to the last "What do you choose?", or up to a line opening with `A)`.
pub fn marker_split(raw: &str) -> Option<Extraction<'_>> {
    if let Some(last) = sentinel().find_iter(raw).last() {
        return Some(Extraction {
            story: &raw[..last.start()],
            choices: Some(&raw[last.end()..]),
        });
    }
    let first = first_choice_line().find(raw)?;
    Some(Extraction {
        story: &raw[..first.start()],
        choices: Some(&raw[first.start()..]),
    })
}

pub fn whole_text(raw: &str) -> Option<Extraction<'_>> {
    Some(Extraction {
        story: raw,
        choices: None,
    })
}

pub fn extract(raw: &str) -> Extraction<'_> {
    STRATEGIES
        .iter()
        .find_map(|(name, strategy)| {
            let found = strategy(raw)?;
            log::debug!("Reply parsed with {} strategy", name);
            Some(found)
        })
        .unwrap_or(Extraction {
            story: raw,
            choices: None,
        })
}

/// Splits a choices section on its A/B/C labels. Falls back to bulleted or
/// numbered lines when no labels are present. Empty result means no choices.
pub fn extract_choices(section: &str) -> Vec<String> {
    let labels: Vec<_> = choice_label().find_iter(section).collect();

    let fragments: Vec<&str> = if labels.is_empty() {
        section
            .lines()
            .map(str::trim)
            .filter_map(|line| list_bullet().find(line).map(|bullet| &line[bullet.end()..]))
            .collect()
    } else {
        labels
            .iter()
            .enumerate()
            .map(|(i, m)| {
                let end = labels.get(i + 1).map(|next| next.start()).unwrap_or(section.len());
                &section[m.end()..end]
            })
            .collect()
    };

    fragments
        .into_iter()
        .filter_map(|fragment| fragment.lines().map(str::trim).find(|line| !line.is_empty()))
        .map(|line| trim_choice(line).to_string())
        .filter(|line| !line.is_empty())
        .take(MAX_CHOICES)
        .collect()
}

fn trim_emphasis(text: &str) -> &str {
    text.trim_matches(|c: char| c == '*' || c == '_' || c == '#' || c.is_whitespace())
}

/// Choices also lose wrapping quotes; story text keeps them.
fn trim_choice(text: &str) -> &str {
    text.trim_matches(|c: char| c == '*' || c == '_' || c == '"' || c.is_whitespace())
}

/// Story text without section labels, stray emphasis, or a dangling sentinel.
pub fn clean_story(story: &str) -> String {
    let story = story.trim();
    let story = match story_label().find(story) {
        Some(label) => &story[label.end()..],
        None => story,
    };
    let story = trim_emphasis(story);
    match trailing_sentinel().find(story) {
        Some(dangling) => trim_emphasis(&story[..dangling.start()]).to_string(),
        None => story.to_string(),
    }
}

/// A choice is unusable when it is empty or carries format leakage.
pub fn is_usable_choice(choice: &str) -> bool {
    let lowered = choice.to_lowercase();
    !choice.trim().is_empty() && !LEAKAGE_MARKERS.iter().any(|m| lowered.contains(m))
}

/// Drops unusable choices and tops the list up to exactly three from
/// [`FALLBACK_CHOICES`], skipping fallbacks already present.
pub fn backfill_choices(choices: Vec<String>) -> Vec<String> {
    let mut kept: Vec<String> = choices
        .into_iter()
        .filter(|c| is_usable_choice(c))
        .take(MAX_CHOICES)
        .collect();

    for fallback in FALLBACK_CHOICES {
        if kept.len() >= MAX_CHOICES {
            break;
        }
        if !kept.iter().any(|c| c.eq_ignore_ascii_case(fallback)) {
            kept.push(fallback.to_string());
        }
    }
    kept
}

/// Parses a reply without substituting any choices.
pub fn parse(raw: &str) -> ParsedReply {
    let extraction = extract(raw);
    ParsedReply {
        story: clean_story(extraction.story),
        choices: extraction.choices.map(extract_choices).unwrap_or_default(),
    }
}

/// Parses a reply and, when choices were asked for, guarantees exactly three.
/// When they were not, the choice list is empty.
pub fn parse_with_choices(raw: &str, want_choices: bool) -> ParsedReply {
    let parsed = parse(raw);
    ParsedReply {
        story: parsed.story,
        choices: if want_choices {
            backfill_choices(parsed.choices)
        } else {
            Vec::new()
        },
    }
}
