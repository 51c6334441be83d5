//! Text clean-up passes, applied to each page's final text.
//!
//! Every pass is total: if it can't improve the text, it returns the text
//! unchanged.

use std::sync::{Arc, LazyLock};

use regex::Regex;

use crate::{config::PostProcessingConfig, prelude::*};

use super::lexicon::Lexicons;

/// A single clean-up pass.
pub trait PostProcessPass: Send + Sync {
    /// A short name, for logging.
    fn name(&self) -> &'static str;

    /// Transform `text`. `language` is the page's language, if known.
    fn apply(&self, text: String, language: Option<&str>) -> String;
}

/// Runs the configured passes in order.
pub struct PostProcessor {
    passes: Vec<Box<dyn PostProcessPass>>,
}

impl PostProcessor {
    /// Create a post-processor with explicit passes.
    pub fn new(passes: Vec<Box<dyn PostProcessPass>>) -> Self {
        Self { passes }
    }

    /// Create the passes enabled in `config`.
    pub fn from_config(config: &PostProcessingConfig, lexicons: Arc<Lexicons>) -> Self {
        let mut passes: Vec<Box<dyn PostProcessPass>> = vec![];
        if config.normalize_whitespace {
            passes.push(Box::new(NormalizeWhitespace));
        }
        if config.join_hyphenated_lines {
            passes.push(Box::new(JoinHyphenatedLines));
        }
        if config.correct_confusions {
            passes.push(Box::new(CorrectConfusions { lexicons }));
        }
        Self::new(passes)
    }

    /// Run every pass over `text`.
    pub fn process(&self, text: String, language: Option<&str>) -> String {
        self.passes.iter().fold(text, |text, pass| {
            trace!(pass = pass.name(), "Post-processing");
            pass.apply(text, language)
        })
    }
}

/// Clean up line endings, control characters and runs of blank space.
pub struct NormalizeWhitespace;

static HORIZONTAL_SPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[ \t]+").expect("invalid regex"));
static EXTRA_BLANK_LINES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("invalid regex"));

impl PostProcessPass for NormalizeWhitespace {
    fn name(&self) -> &'static str {
        "normalize_whitespace"
    }

    fn apply(&self, text: String, _language: Option<&str>) -> String {
        let text = text.replace("\r\n", "\n").replace('\r', "\n");
        let text = text
            .chars()
            .filter(|c| !c.is_control() || matches!(c, '\t' | '\n' | '\x0C'))
            .collect::<String>();
        let lines = text
            .lines()
            .map(|line| {
                HORIZONTAL_SPACE
                    .replace_all(line, " ")
                    .trim_end_matches([' ', '\t'])
                    .to_owned()
            })
            .collect::<Vec<_>>();
        let text = lines.join("\n");
        EXTRA_BLANK_LINES
            .replace_all(&text, "\n\n")
            .trim()
            .to_owned()
    }
}

/// Join words hyphenated across a line break.
pub struct JoinHyphenatedLines;

static HYPHENATED_BREAK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\p{Ll})-[ \t]*\n[ \t]*(\p{Ll})").expect("invalid regex"));

impl PostProcessPass for JoinHyphenatedLines {
    fn name(&self) -> &'static str {
        "join_hyphenated_lines"
    }

    fn apply(&self, text: String, _language: Option<&str>) -> String {
        HYPHENATED_BREAK.replace_all(&text, "$1$2").into_owned()
    }
}

/// Fix common digit/letter confusions, when the fixed word is in the
/// lexicon.
pub struct CorrectConfusions {
    lexicons: Arc<Lexicons>,
}

static WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\p{L}0-9|]+").expect("invalid regex"));

impl CorrectConfusions {
    fn correct(&self, token: &str, language: &str) -> Option<String> {
        let has_letter = token.chars().any(char::is_alphabetic);
        let has_confusable = token.chars().any(|c| "0158|".contains(c));
        if !has_letter || !has_confusable {
            return None;
        }
        let corrected = token
            .chars()
            .map(|c| match c {
                '0' => 'o',
                '1' | '|' => 'l',
                '5' => 's',
                '8' => 'b',
                c => c,
            })
            .collect::<String>();
        let lexicon = self.lexicons.get(language)?;
        lexicon
            .contains(&corrected.to_lowercase())
            .then_some(corrected)
    }
}

impl PostProcessPass for CorrectConfusions {
    fn name(&self) -> &'static str {
        "correct_confusions"
    }

    fn apply(&self, text: String, language: Option<&str>) -> String {
        let Some(language) = language else {
            return text;
        };
        WORD.replace_all(&text, |caps: &regex::Captures| {
            let token = &caps[0];
            self.correct(token, language)
                .unwrap_or_else(|| token.to_owned())
        })
        .into_owned()
    }
}
