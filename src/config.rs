use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::story::AgeBand;

/// Inclusive word-count bounds for one age band.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WordRange {
    pub min: usize,
    pub max: usize,
}

impl WordRange {
    pub fn clamp(&self, words: usize) -> usize {
        words.clamp(self.min, self.max)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WordRanges {
    pub young: WordRange,
    pub middle: WordRange,
    pub teen: WordRange,
}

impl WordRanges {
    pub fn for_band(&self, band: AgeBand) -> WordRange {
        match band {
            AgeBand::Young => self.young,
            AgeBand::Middle => self.middle,
            AgeBand::Teen => self.teen,
        }
    }
}

impl Default for WordRanges {
    fn default() -> Self {
        Self {
            young: WordRange { min: 100, max: 300 },
            middle: WordRange { min: 150, max: 500 },
            teen: WordRange { min: 200, max: 800 },
        }
    }
}

pub const DEFAULT_TARGET_WORDS: usize = 250;

#[derive(Debug, Clone)]
pub struct RateLimitSettings {
    pub limit: u32,
    pub window: Duration,
    pub sweep_every: Duration,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            limit: 10,
            window: Duration::from_secs(60),
            sweep_every: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SafetySettings {
    pub max_chars: usize,
    pub min_chars: usize,
    pub min_unique_ratio: f64,
}

impl Default for SafetySettings {
    fn default() -> Self {
        Self {
            max_chars: 10_000,
            min_chars: 30,
            min_unique_ratio: 0.7,
        }
    }
}

/// Static configuration for the whole service, read once at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_addr: String,
    pub port: u16,
    pub ollama_url: String,
    pub primary_model: String,
    pub fallback_model: String,
    pub max_concurrent_requests: usize,
    pub max_context_chars: usize,
    pub rate_limit: RateLimitSettings,
    pub safety: SafetySettings,
    pub word_ranges: WordRanges,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1".to_string(),
            port: 8080,
            ollama_url: "http://localhost:11434".to_string(),
            primary_model: "storyforge-qwen-fine-tuned:latest".to_string(),
            fallback_model: "deepseek-r1:1.5b".to_string(),
            max_concurrent_requests: 5,
            max_context_chars: 2000,
            rate_limit: RateLimitSettings::default(),
            safety: SafetySettings::default(),
            word_ranges: WordRanges::default(),
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds settings from an arbitrary key lookup, falling back to defaults
    /// for missing keys. Present but unparsable values are errors.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Settings::default();

        let ollama_url = lookup("OLLAMA_BASE_URL")
            .unwrap_or(defaults.ollama_url)
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            bind_addr: lookup("BIND_ADDR").unwrap_or(defaults.bind_addr),
            port: parse_or(&lookup, "PORT", defaults.port)?,
            ollama_url,
            primary_model: lookup("PRIMARY_MODEL").unwrap_or(defaults.primary_model),
            fallback_model: lookup("FALLBACK_MODEL").unwrap_or(defaults.fallback_model),
            max_concurrent_requests: positive_or(
                &lookup,
                "MAX_CONCURRENT_REQUESTS",
                defaults.max_concurrent_requests,
            )?,
            max_context_chars: parse_or(&lookup, "MAX_CONTEXT_CHARS", defaults.max_context_chars)?,
            rate_limit: RateLimitSettings {
                limit: positive_or(&lookup, "RATE_LIMIT_REQUESTS", defaults.rate_limit.limit)?,
                window: Duration::from_secs(positive_or(
                    &lookup,
                    "RATE_LIMIT_WINDOW_SECS",
                    defaults.rate_limit.window.as_secs(),
                )?),
                sweep_every: Duration::from_secs(positive_or(
                    &lookup,
                    "RATE_LIMIT_SWEEP_SECS",
                    defaults.rate_limit.sweep_every.as_secs(),
                )?),
            },
            safety: SafetySettings {
                max_chars: parse_or(&lookup, "SAFETY_MAX_CHARS", defaults.safety.max_chars)?,
                min_chars: parse_or(&lookup, "SAFETY_MIN_CHARS", defaults.safety.min_chars)?,
                min_unique_ratio: parse_or(
                    &lookup,
                    "SAFETY_REPETITION_RATIO",
                    defaults.safety.min_unique_ratio,
                )?,
            },
            word_ranges: defaults.word_ranges,
        })
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("invalid value for {key}: {raw:?}")),
        None => Ok(default),
    }
}

/// Like [`parse_or`], but zero is rejected.
fn positive_or<T, F>(lookup: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr + Default + PartialEq,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    let value = parse_or(lookup, key, default)?;
    if value == T::default() {
        bail!("{key} must be greater than zero");
    }
    Ok(value)
}
