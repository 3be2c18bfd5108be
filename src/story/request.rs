use crate::error::StoryError;
use crate::web::models::{AdventureRequest, CharacterInput, ContinueStoryRequest, GenerateStoryRequest};

use super::{AgeBand, Character, Role, StoryLength, StoryType, Tone};

pub const MAX_STORY_PROMPT_CHARS: usize = 1000;
pub const MIN_WORD_LIMIT: usize = 100;
pub const MAX_WORD_LIMIT: usize = 3000;
pub const DEFAULT_CHOICE_POINTS: u32 = 2;
pub const MAX_CHOSEN_OPTION_CHARS: usize = 500;
pub const MAX_DETAIL_CHARS: usize = 300;
pub const MAX_ADVENTURE_PROMPT_CHARS: usize = 500;

/// A validated continuation request. Built once per call and never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub previous_story: String,
    pub chosen_option: String,
    pub age_band: AgeBand,
    pub story_type: StoryType,
    pub tone: Tone,
    pub characters: Vec<Character>,
    pub setting: Option<String>,
    pub theme: Option<String>,
    pub add_more_choices: bool,
    /// Requested target; the prompt builder clamps it to the band's range.
    pub target_word_count: Option<usize>,
}

impl GenerationRequest {
    pub fn from_input(input: &ContinueStoryRequest) -> Result<Self, StoryError> {
        let previous_story = input
            .previous_story
            .as_ref()
            .map(|s| s.joined())
            .filter(|s| !s.is_empty());
        let chosen_option = non_blank(input.chosen_option.as_deref());
        let age_group = non_blank(input.age_group.as_deref());
        let story_type = non_blank(input.story_type.as_deref());

        let (Some(previous_story), Some(chosen_option), Some(age_group), Some(story_type)) =
            (previous_story, chosen_option, age_group, story_type)
        else {
            return Err(StoryError::bad_request(
                "Missing required fields: previousStory, chosenOption, ageGroup, and storyType are required",
            ));
        };

        if chosen_option.chars().count() > MAX_CHOSEN_OPTION_CHARS {
            return Err(StoryError::bad_request(format!(
                "Chosen option is too long. Maximum {} characters allowed.",
                MAX_CHOSEN_OPTION_CHARS
            )));
        }

        Ok(Self {
            previous_story,
            chosen_option,
            age_band: parse_field(&age_group)?,
            story_type: parse_field(&story_type)?,
            tone: parse_tone(input.tone.as_deref())?,
            characters: parse_characters(input.characters.as_deref())?,
            setting: bounded_detail("setting", input.setting.as_deref())?,
            theme: bounded_detail("theme", input.theme.as_deref())?,
            add_more_choices: input.add_more_choices,
            target_word_count: input.target_word_count,
        })
    }
}

/// A validated request for a brand-new story.
#[derive(Debug, Clone, PartialEq)]
pub struct NewStoryRequest {
    pub prompt: String,
    pub age_band: AgeBand,
    pub story_type: StoryType,
    pub length: StoryLength,
    pub tone: Tone,
    pub characters: Vec<Character>,
    pub setting: Option<String>,
    pub theme: Option<String>,
    pub word_limit: Option<usize>,
    pub custom_instructions: Option<String>,
    pub interactive: bool,
    pub choice_points: u32,
}

impl NewStoryRequest {
    pub fn from_input(input: &GenerateStoryRequest) -> Result<Self, StoryError> {
        let prompt = non_blank(input.prompt.as_deref());
        let age_group = non_blank(input.age_group.as_deref());
        let story_type = non_blank(input.story_type.as_deref());

        let (Some(prompt), Some(age_group), Some(story_type)) = (prompt, age_group, story_type) else {
            return Err(StoryError::bad_request(
                "Missing required fields: prompt, ageGroup, and storyType are required",
            ));
        };

        if prompt.chars().count() > MAX_STORY_PROMPT_CHARS {
            return Err(StoryError::bad_request(format!(
                "Prompt is too long. Maximum {} characters allowed.",
                MAX_STORY_PROMPT_CHARS
            )));
        }

        if let Some(limit) = input.word_limit {
            if !(MIN_WORD_LIMIT..=MAX_WORD_LIMIT).contains(&limit) {
                return Err(StoryError::bad_request(format!(
                    "Word limit must be between {} and {} words.",
                    MIN_WORD_LIMIT, MAX_WORD_LIMIT
                )));
            }
        }

        let length = match non_blank(input.length.as_deref()) {
            Some(raw) => parse_field(&raw)?,
            None => StoryLength::Medium,
        };

        Ok(Self {
            prompt,
            age_band: parse_field(&age_group)?,
            story_type: parse_field(&story_type)?,
            length,
            tone: parse_tone(input.tone.as_deref())?,
            characters: parse_characters(input.characters.as_deref())?,
            setting: non_blank(input.setting.as_deref()),
            theme: non_blank(input.theme.as_deref()),
            word_limit: input.word_limit,
            custom_instructions: non_blank(input.custom_instructions.as_deref()),
            interactive: input.is_interactive,
            choice_points: input.choice_points.filter(|n| *n > 0).unwrap_or(DEFAULT_CHOICE_POINTS),
        })
    }
}

/// A validated adventure turn. Characters and history are free text and may be empty.
#[derive(Debug, Clone, PartialEq)]
pub struct AdventureTurn {
    pub situation: String,
    pub characters: String,
    pub story_history: String,
}

impl AdventureTurn {
    pub fn from_input(input: &AdventureRequest) -> Result<Self, StoryError> {
        let Some(situation) = non_blank(input.prompt.as_deref()) else {
            return Err(StoryError::bad_request("Prompt is required"));
        };
        if situation.chars().count() > MAX_ADVENTURE_PROMPT_CHARS {
            return Err(StoryError::bad_request(format!(
                "Prompt is too long. Maximum {} characters allowed.",
                MAX_ADVENTURE_PROMPT_CHARS
            )));
        }
        Ok(Self {
            situation,
            characters: bounded_detail("characters", input.characters.as_deref())?.unwrap_or_default(),
            story_history: non_blank(input.story_history.as_deref()).unwrap_or_default(),
        })
    }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|v| !v.is_empty()).map(str::to_string)
}

fn bounded_detail(field: &str, value: Option<&str>) -> Result<Option<String>, StoryError> {
    let value = non_blank(value);
    if value.as_ref().is_some_and(|v| v.chars().count() > MAX_DETAIL_CHARS) {
        return Err(StoryError::bad_request(format!(
            "{} is too long. Maximum {} characters allowed.",
            field, MAX_DETAIL_CHARS
        )));
    }
    Ok(value)
}

fn parse_field<T>(raw: &str) -> Result<T, StoryError>
where
    T: std::str::FromStr<Err = super::UnknownVariant>,
{
    raw.parse::<T>().map_err(|e| StoryError::BadRequest(e.to_string()))
}

fn parse_tone(raw: Option<&str>) -> Result<Tone, StoryError> {
    match non_blank(raw) {
        Some(tone) => parse_field(&tone),
        None => Ok(Tone::default()),
    }
}

fn parse_characters(raw: Option<&[CharacterInput]>) -> Result<Vec<Character>, StoryError> {
    raw.unwrap_or_default()
        .iter()
        .map(|c| {
            let name = c.name.trim();
            if name.is_empty() {
                return Err(StoryError::bad_request("Character name cannot be empty"));
            }
            if c.description.chars().count() > MAX_DETAIL_CHARS {
                return Err(StoryError::bad_request(format!(
                    "Character description is too long. Maximum {} characters allowed.",
                    MAX_DETAIL_CHARS
                )));
            }
            Ok(Character {
                name: name.to_string(),
                description: c.description.trim().to_string(),
                role: parse_field::<Role>(c.role.as_deref().unwrap_or_default())?,
            })
        })
        .collect()
}
