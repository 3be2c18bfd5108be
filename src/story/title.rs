use std::sync::OnceLock;

use regex::Regex;

use super::StoryType;

const MAX_TITLE_CHARS: usize = 60;

fn opener() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^(once upon a time,?|there was|in a|long ago,?)").expect("valid regex"))
}

fn type_word(story_type: StoryType) -> &'static str {
    match story_type {
        StoryType::Adventure => "Adventure",
        StoryType::Mystery => "Mystery",
        StoryType::Fantasy => "Magic",
        StoryType::Friendship => "Friends",
        StoryType::Educational => "Discovery",
    }
}

/// Derives a short title from the story's opening sentence.
pub fn story_title(story: &str, story_type: StoryType, interactive: bool) -> String {
    let first_sentence = story
        .split('.')
        .map(str::trim)
        .find(|s| !s.is_empty())
        .unwrap_or_default();

    let words: Vec<&str> = first_sentence.split_whitespace().take(6).collect();
    let joined = words.join(" ");
    let mut title = opener().replace(&joined, "").trim().to_string();

    if title.chars().count() < 10 {
        title = format!("The {} of {}", type_word(story_type), title).trim().to_string();
    }
    if interactive {
        title.push_str(" - Choose Your Adventure");
    }

    let mut chars = title.chars();
    let mut title: String = match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    };

    if title.chars().count() > MAX_TITLE_CHARS {
        title = title.chars().take(MAX_TITLE_CHARS - 3).collect::<String>() + "...";
    }
    title
}
