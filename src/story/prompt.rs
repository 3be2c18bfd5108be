//! Prompt rendering for continuations and new stories.
//!
//! Each (age band, story type) pair has a registered guide: writing
//! guidelines for the band plus one line of genre focus. The guide is rendered
//! through a Tera template chosen by [`PromptStyle`].

use std::collections::HashMap;

use serde::Serialize;
use tera::{Context, Tera};
use thiserror::Error;

use crate::config::{WordRanges, DEFAULT_TARGET_WORDS};

use super::request::{AdventureTurn, GenerationRequest, NewStoryRequest};
use super::{AgeBand, Character, StoryLength, StoryType, Tone};

/// Phrase the model is asked to put in front of the A/B/C choices.
pub const CHOICE_SENTINEL: &str = "What do you choose?";

const CONTINUE_FULL: &str = "continue_full";
const CONTINUE_COMPACT: &str = "continue_compact";
const NEW_STORY: &str = "new_story";
const ADVENTURE_FULL: &str = "adventure_full";
const ADVENTURE_COMPACT: &str = "adventure_compact";

const CONTINUE_FULL_TEMPLATE: &str = r#"Continue this {{ genre }} story for {{ audience }} aged {{ age_band }}{% if with_choices %} and add new choice points{% endif %}. The story should:
{% for line in guidelines %}- {{ line }}
{% endfor %}- Be about {{ target_word_count }} words long
- Keep the same tone: {{ tone }}
- Build naturally from the chosen action
{% if with_choices %}- MUST end with "What do you choose?" followed by exactly 3 choices formatted as:
  A) [First choice]
  B) [Second choice]
  C) [Third choice]
{% endif %}
Previous story context:
{{ previous_story }}

The reader chose: "{{ chosen_option }}"
{% if characters %}
Characters to keep consistent:
{% for character in characters %}- {{ character }}
{% endfor %}{% endif %}{% if setting %}Setting: {{ setting }}
{% endif %}{% if theme %}Theme: {{ theme }}
{% endif %}
{% if with_choices %}IMPORTANT: End this continuation with new choice points for the reader.

Continue the story from this choice. Write the continuation, then end with "What do you choose?" and provide exactly 3 choices marked as A), B), and C):{% else %}This should be a complete story segment that flows from the chosen action, with no further choices.

Continue the story from this choice:{% endif %}"#;

const CONTINUE_COMPACT_TEMPLATE: &str = r#"You are creating a {{ genre }} story for {{ audience }} aged {{ age_band }}.
{% if characters %}
Characters: {{ characters | join(sep="; ") }}
{% endif %}{% if setting %}Setting: {{ setting }}
{% endif %}{% if theme %}Theme: {{ theme }}
{% endif %}Previous Story: {{ previous_story }}
Current Situation: the reader chose "{{ chosen_option }}"

Write the next part of this story (about {{ target_word_count }} words, tone: {{ tone }}){% if with_choices %} and provide exactly 3 choices for what happens next{% endif %}.

Format:
STORY: [story text]{% if with_choices %}
CHOICES:
A: [choice 1]
B: [choice 2]
C: [choice 3]{% endif %}"#;

const NEW_STORY_TEMPLATE: &str = r#"Write a {{ genre }} story for {{ audience }} aged {{ age_band }}. The story should:
{% for line in guidelines %}- {{ line }}
{% endfor %}- Be about {{ word_limit }} words long
- Tone: {{ tone }}

Story prompt: {{ prompt }}
{% if characters %}Characters:
{% for character in characters %}- {{ character }}
{% endfor %}{% endif %}{% if setting %}Setting: {{ setting }}
{% endif %}{% if theme %}Theme: {{ theme }}
{% endif %}{% if custom_instructions %}Additional Instructions: {{ custom_instructions }}
{% endif %}{% if interactive %}
IMPORTANT: This is a choose-your-adventure story. Build toward {{ choice_points }} decision moments for the reader, and end at the final one with "What do you choose?" followed by exactly 3 choices marked as A), B), and C).
{% endif %}
Story:"#;

const ADVENTURE_FULL_TEMPLATE: &str = r#"You are a helpful AI assistant that creates engaging, age-appropriate adventure stories for children aged 9-12.

Characters: {{ characters }}

Story History: {{ story_history }}

Current Situation: {{ situation }}

Create the next part of this adventure story (200-250 words) and provide exactly 3 different choices for what could happen next. The story should be exciting but safe for children.

Format your response as:
STORY: [your story continuation here]

CHOICES:
A: [first choice]
B: [second choice]
C: [third choice]"#;

const ADVENTURE_COMPACT_TEMPLATE: &str = r#"You are creating a children's adventure story for ages 9-12.

Characters: {{ characters }}
Previous Story: {{ story_history }}
Current Situation: {{ situation }}

Write the next part of this adventure (200-250 words) and provide exactly 3 choices for what happens next.

Format:
STORY: [story text]
CHOICES:
A: [choice 1]
B: [choice 2]
C: [choice 3]"#;

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("No template found for age group {age_band} and story type {story_type}")]
    TemplateNotFound { age_band: AgeBand, story_type: StoryType },

    #[error("Failed to render prompt: {0}")]
    Render(#[from] tera::Error),
}

/// Which template family to render a continuation with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptStyle {
    /// Detailed guidelines, choices after the sentinel phrase.
    Full,
    /// Short STORY:/CHOICES: format for smaller models.
    Compact,
}

#[derive(Debug, Clone)]
pub struct StoryGuide {
    pub guidelines: &'static [&'static str],
    pub focus: &'static str,
}

const YOUNG_GUIDELINES: &[&str] = &[
    "Be easy to understand with simple vocabulary",
    "Be positive, safe and appropriate for young children",
];
const MIDDLE_GUIDELINES: &[&str] = &[
    "Use age-appropriate vocabulary and complexity",
    "Include character development and consequences",
];
const TEEN_GUIDELINES: &[&str] = &[
    "Include sophisticated themes and character development",
    "Feature realistic consequences and character growth",
];

fn focus_for(band: AgeBand, story_type: StoryType) -> &'static str {
    use AgeBand::*;
    use StoryType::*;
    match (band, story_type) {
        (Young, Adventure) => "Include friendship and problem-solving with a happy ending",
        (Young, Mystery) => "Keep the mystery gentle with clues children can follow",
        (Young, Fantasy) => "Feature friendly magic and kind magical creatures",
        (Young, Friendship) => "Show characters sharing, caring and helping each other",
        (Young, Educational) => "Teach something new in a fun, clear way",
        (Middle, Adventure) => "Include challenges that require courage and teamwork",
        (Middle, Mystery) => "Include clues and red herrings that reward logical deduction",
        (Middle, Fantasy) => "Build a magical world whose magic follows clear rules",
        (Middle, Friendship) => "Explore loyalty and trust through realistic friendship challenges",
        (Middle, Educational) => "Make scientific, historical or cultural facts exciting to discover",
        (Teen, Adventure) => "Explore identity and personal growth through real tension",
        (Teen, Mystery) => "Use plot twists, layered motives and a clever resolution",
        (Teen, Fantasy) => "Face characters with moral dilemmas about power and responsibility",
        (Teen, Friendship) => "Handle loyalty, peer pressure and forgiveness with honesty",
        (Teen, Educational) => "Connect advanced concepts to real-world applications",
    }
}

fn default_guides() -> HashMap<(AgeBand, StoryType), StoryGuide> {
    let mut guides = HashMap::new();
    for band in AgeBand::ALL {
        let guidelines = match band {
            AgeBand::Young => YOUNG_GUIDELINES,
            AgeBand::Middle => MIDDLE_GUIDELINES,
            AgeBand::Teen => TEEN_GUIDELINES,
        };
        for story_type in StoryType::ALL {
            guides.insert(
                (*band, *story_type),
                StoryGuide {
                    guidelines,
                    focus: focus_for(*band, *story_type),
                },
            );
        }
    }
    guides
}

/// Sampling temperature for a continuation: later rules win.
pub fn continuation_temperature(story_type: StoryType, tone: Tone) -> f32 {
    let mut temperature = 0.75;
    if story_type == StoryType::Fantasy {
        temperature = 0.8;
    }
    if tone == Tone::Funny {
        temperature = 0.85;
    }
    if tone == Tone::Educational {
        temperature = 0.65;
    }
    temperature
}

pub fn new_story_temperature(story_type: StoryType, tone: Tone) -> f32 {
    let mut temperature = 0.7;
    if story_type == StoryType::Fantasy {
        temperature = 0.8;
    }
    if tone == Tone::Funny {
        temperature = 0.85;
    }
    if tone == Tone::Educational {
        temperature = 0.6;
    }
    temperature
}

/// Backend context budget: one and a half tokens per word, capped.
pub fn token_budget(words: usize, cap: usize) -> u32 {
    (words * 3 / 2).min(cap) as u32
}

pub fn default_word_limit(band: AgeBand, length: StoryLength) -> usize {
    match (band, length) {
        (AgeBand::Young, StoryLength::Short) => 300,
        (AgeBand::Young, StoryLength::Medium) => 500,
        (AgeBand::Young, StoryLength::Long) => 800,
        (AgeBand::Middle, StoryLength::Short) => 500,
        (AgeBand::Middle, StoryLength::Medium) => 800,
        (AgeBand::Middle, StoryLength::Long) => 1200,
        (AgeBand::Teen, StoryLength::Short) => 800,
        (AgeBand::Teen, StoryLength::Medium) => 1200,
        (AgeBand::Teen, StoryLength::Long) => 1800,
    }
}

pub fn format_character(character: &Character) -> String {
    if character.description.is_empty() {
        format!("{} ({})", character.name, character.role)
    } else {
        format!("{} ({}): {}", character.name, character.role, character.description)
    }
}

/// Keeps the last `max_chars` characters of `text`, starting on a word boundary.
pub fn story_tail(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    let start = text
        .char_indices()
        .nth(total - max_chars)
        .map(|(i, _)| i)
        .unwrap_or(0);
    let tail = &text[start..];
    let tail = match tail.find(char::is_whitespace) {
        Some(ws) if ws < tail.len() / 2 => &tail[ws..],
        _ => tail,
    };
    format!("...{}", tail.trim_start())
}

#[derive(Serialize)]
struct ContinuationVars<'a> {
    genre: &'static str,
    audience: &'static str,
    age_band: &'static str,
    guidelines: Vec<&'static str>,
    target_word_count: usize,
    tone: &'static str,
    previous_story: String,
    chosen_option: &'a str,
    characters: Vec<String>,
    setting: &'a str,
    theme: &'a str,
    with_choices: bool,
}

#[derive(Serialize)]
struct NewStoryVars<'a> {
    genre: &'static str,
    audience: &'static str,
    age_band: &'static str,
    guidelines: Vec<&'static str>,
    word_limit: usize,
    tone: &'static str,
    prompt: &'a str,
    characters: Vec<String>,
    setting: &'a str,
    theme: &'a str,
    custom_instructions: &'a str,
    interactive: bool,
    choice_points: u32,
}

#[derive(Serialize)]
struct AdventureVars<'a> {
    characters: &'a str,
    story_history: String,
    situation: &'a str,
}

pub struct PromptBuilder {
    tera: Tera,
    guides: HashMap<(AgeBand, StoryType), StoryGuide>,
    word_ranges: WordRanges,
    max_context_chars: usize,
}

impl PromptBuilder {
    pub fn new(word_ranges: WordRanges, max_context_chars: usize) -> Result<Self, PromptError> {
        Self::with_guides(default_guides(), word_ranges, max_context_chars)
    }

    pub fn with_guides(
        guides: HashMap<(AgeBand, StoryType), StoryGuide>,
        word_ranges: WordRanges,
        max_context_chars: usize,
    ) -> Result<Self, PromptError> {
        let mut tera = Tera::default();
        tera.add_raw_templates(vec![
            (CONTINUE_FULL, CONTINUE_FULL_TEMPLATE),
            (CONTINUE_COMPACT, CONTINUE_COMPACT_TEMPLATE),
            (NEW_STORY, NEW_STORY_TEMPLATE),
            (ADVENTURE_FULL, ADVENTURE_FULL_TEMPLATE),
            (ADVENTURE_COMPACT, ADVENTURE_COMPACT_TEMPLATE),
        ])?;
        Ok(Self {
            tera,
            guides,
            word_ranges,
            max_context_chars,
        })
    }

    /// The requested target, or the default, clamped into the band's range.
    pub fn target_words(&self, request: &GenerationRequest) -> usize {
        self.word_ranges
            .for_band(request.age_band)
            .clamp(request.target_word_count.unwrap_or(DEFAULT_TARGET_WORDS))
    }

    pub fn build(&self, request: &GenerationRequest) -> Result<String, PromptError> {
        self.build_styled(request, PromptStyle::Full)
    }

    pub fn build_styled(&self, request: &GenerationRequest, style: PromptStyle) -> Result<String, PromptError> {
        let guide = self.guide(request.age_band, request.story_type)?;

        let vars = ContinuationVars {
            genre: request.story_type.as_str(),
            audience: request.age_band.audience(),
            age_band: request.age_band.as_str(),
            guidelines: guide_lines(guide),
            target_word_count: self.target_words(request),
            tone: request.tone.as_str(),
            previous_story: story_tail(&request.previous_story, self.max_context_chars),
            chosen_option: &request.chosen_option,
            characters: request.characters.iter().map(format_character).collect(),
            setting: request.setting.as_deref().unwrap_or_default(),
            theme: request.theme.as_deref().unwrap_or_default(),
            with_choices: request.add_more_choices,
        };

        let template = match style {
            PromptStyle::Full => CONTINUE_FULL,
            PromptStyle::Compact => CONTINUE_COMPACT,
        };
        Ok(self.tera.render(template, &Context::from_serialize(&vars)?)?)
    }

    pub fn build_new_story(&self, request: &NewStoryRequest) -> Result<String, PromptError> {
        let guide = self.guide(request.age_band, request.story_type)?;

        let vars = NewStoryVars {
            genre: request.story_type.as_str(),
            audience: request.age_band.audience(),
            age_band: request.age_band.as_str(),
            guidelines: guide_lines(guide),
            word_limit: request
                .word_limit
                .unwrap_or_else(|| default_word_limit(request.age_band, request.length)),
            tone: request.tone.as_str(),
            prompt: &request.prompt,
            characters: request.characters.iter().map(format_character).collect(),
            setting: request.setting.as_deref().unwrap_or_default(),
            theme: request.theme.as_deref().unwrap_or_default(),
            custom_instructions: request.custom_instructions.as_deref().unwrap_or_default(),
            interactive: request.interactive,
            choice_points: request.choice_points,
        };
        Ok(self.tera.render(NEW_STORY, &Context::from_serialize(&vars)?)?)
    }

    /// Adventure turns carry no age band or genre; the audience is fixed at 9-12.
    pub fn build_adventure(&self, turn: &AdventureTurn, style: PromptStyle) -> Result<String, PromptError> {
        let vars = AdventureVars {
            characters: &turn.characters,
            story_history: story_tail(&turn.story_history, self.max_context_chars),
            situation: &turn.situation,
        };
        let template = match style {
            PromptStyle::Full => ADVENTURE_FULL,
            PromptStyle::Compact => ADVENTURE_COMPACT,
        };
        Ok(self.tera.render(template, &Context::from_serialize(&vars)?)?)
    }

    fn guide(&self, age_band: AgeBand, story_type: StoryType) -> Result<&StoryGuide, PromptError> {
        self.guides
            .get(&(age_band, story_type))
            .ok_or(PromptError::TemplateNotFound { age_band, story_type })
    }
}

fn guide_lines(guide: &StoryGuide) -> Vec<&'static str> {
    let mut lines = guide.guidelines.to_vec();
    lines.push(guide.focus);
    lines
}
