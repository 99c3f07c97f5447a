//! Pure text classification for incoming comments.

use crate::config::CommentConfig;
use crate::error::PalResult;
use regex::Regex;

/// Scores comments and recognizes greetings, thanks and spam.
#[derive(Debug, Clone)]
pub struct RelevanceScorer {
    ignore_prefixes: Vec<String>,
    ignore_substrings: Vec<String>,
    bonus_keywords: Vec<String>,
    links: Regex,
    greetings: Option<Regex>,
    thanks: Option<Regex>,
}

/// Case-insensitive whole-word alternation; `None` for an empty vocabulary.
fn vocabulary(words: &[String]) -> PalResult<Option<Regex>> {
    let alternatives: Vec<String> = words
        .iter()
        .map(|w| w.trim())
        .filter(|w| !w.is_empty())
        .map(regex::escape)
        .collect();
    if alternatives.is_empty() {
        return Ok(None);
    }
    Ok(Some(Regex::new(&format!(r"(?i)\b(?:{})\b", alternatives.join("|")))?))
}

fn lowered(items: &[String]) -> Vec<String> {
    items
        .iter()
        .map(|s| s.to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

impl RelevanceScorer {
    pub fn new(config: &CommentConfig) -> PalResult<Self> {
        Ok(Self {
            ignore_prefixes: lowered(&config.ignore_if_startswith),
            ignore_substrings: lowered(&config.ignore_contains),
            bonus_keywords: lowered(&config.keywords_bonus),
            links: Regex::new(r"(?i)https?://|\bdiscord\.gg\b")?,
            greetings: vocabulary(&config.greetings)?,
            thanks: vocabulary(&config.thanks)?,
        })
    }

    /// Commands, links and blocked substrings.
    pub fn is_ignored(&self, text: &str) -> bool {
        let low = text.trim().to_lowercase();
        self.ignore_prefixes.iter().any(|p| low.starts_with(p.as_str()))
            || self.ignore_substrings.iter().any(|s| low.contains(s.as_str()))
            || self.links.is_match(&low)
    }

    pub fn is_greeting(&self, text: &str) -> bool {
        self.greetings.as_ref().map(|re| re.is_match(text)).unwrap_or(false)
    }

    pub fn is_thanks(&self, text: &str) -> bool {
        self.thanks.as_ref().map(|re| re.is_match(text)).unwrap_or(false)
    }

    /// Question mark 0.6, bonus keyword 0.35, at least 7 chars 0.1, any of `:;!` 0.05; capped at 1.0.
    pub fn score(&self, text: &str) -> f64 {
        let low = text.trim().to_lowercase();
        let mut score = 0.0;
        if low.contains('?') {
            score += 0.6;
        }
        if self.bonus_keywords.iter().any(|k| low.contains(k.as_str())) {
            score += 0.35;
        }
        if low.chars().count() >= 7 {
            score += 0.1;
        }
        if low.contains(&[':', ';', '!'][..]) {
            score += 0.05;
        }
        f64::min(1.0, score)
    }
}
