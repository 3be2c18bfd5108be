//! Story-continuation pipeline: prompt building, reply parsing, safety
//! checks, and the orchestrator that strings them together.

pub mod orchestrator;
pub mod parse;
pub mod prompt;
pub mod request;
pub mod safety;
pub mod title;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use orchestrator::Orchestrator;
pub use request::{AdventureTurn, GenerationRequest, NewStoryRequest};

/// Placeholder consequence attached to every generated choice.
pub const CHOICE_CONSEQUENCE: &str = "Continue the adventure based on your choice!";

/// Error produced when a wire value does not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub allowed: &'static [&'static str],
}

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid {}. Must be one of: {}", self.kind, self.allowed.join(", "))
    }
}

impl std::error::Error for UnknownVariant {}

macro_rules! wire_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];
            const NAMES: &'static [&'static str] = &[$($text),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim() {
                    $($text => Ok($name::$variant),)+
                    _ => Err(UnknownVariant { kind: $kind, allowed: Self::NAMES }),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

wire_enum!(AgeBand, "age group", {
    Young => "5-8",
    Middle => "9-12",
    Teen => "13-16",
});

wire_enum!(StoryType, "story type", {
    Adventure => "adventure",
    Mystery => "mystery",
    Fantasy => "fantasy",
    Friendship => "friendship",
    Educational => "educational",
});

wire_enum!(Tone, "tone", {
    Exciting => "exciting",
    Mysterious => "mysterious",
    Funny => "funny",
    Heartwarming => "heartwarming",
    Educational => "educational",
});

wire_enum!(Role, "character role", {
    Protagonist => "protagonist",
    Sidekick => "sidekick",
    Mentor => "mentor",
    Villain => "villain",
    Helper => "helper",
});

wire_enum!(StoryLength, "length", {
    Short => "short",
    Medium => "medium",
    Long => "long",
});

impl Default for Tone {
    fn default() -> Self {
        Tone::Exciting
    }
}

impl AgeBand {
    /// Who the prompt addresses: "children" for the younger bands, "teens" above.
    pub fn audience(&self) -> &'static str {
        match self {
            AgeBand::Young | AgeBand::Middle => "children",
            AgeBand::Teen => "teens",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Character {
    pub name: String,
    pub description: String,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Choice {
    pub text: String,
    pub consequence: String,
}

impl Choice {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            consequence: CHOICE_CONSEQUENCE.to_string(),
        }
    }
}

/// One generated story segment. `story` is never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratedSegment {
    pub story: String,
    pub choices: Vec<Choice>,
}

pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Minutes to read at 200 words per minute, rounded up.
pub fn reading_minutes(words: usize) -> usize {
    words.div_ceil(200)
}
