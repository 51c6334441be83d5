//! Word lists, used to score dictionary coverage and to guess the language of
//! a text.

use std::collections::{BTreeMap, HashSet};

use schemars::JsonSchema;

use crate::prelude::*;

/// Built-in English words.
const BUILTIN_EN: &str = include_str!("lexicon/en.txt");

/// Built-in German words.
const BUILTIN_DE: &str = include_str!("lexicon/de.txt");

/// Minimum share of tokens that must be found before we'll call a language.
const MIN_DETECTION_HIT_RATE: f32 = 0.15;

/// Minimum number of word tokens before we'll try to detect a language.
const MIN_DETECTION_TOKENS: usize = 3;

/// A configured word list for one language.
#[derive(Clone, Debug, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct LexiconConfig {
    /// A file with one word per line. Lines starting with `#` are ignored.
    pub path: PathBuf,

    /// Replace the built-in list for this language instead of extending it.
    #[serde(default)]
    pub replace: bool,
}

/// A set of known words for one language.
#[derive(Clone, Debug, Default)]
pub struct Lexicon {
    words: HashSet<String>,
}

impl Lexicon {
    /// Parse a word list.
    pub fn parse(list: &str) -> Self {
        let mut lexicon = Self::default();
        lexicon.extend_from_list(list);
        lexicon
    }

    /// Add the words in `list`.
    pub fn extend_from_list(&mut self, list: &str) {
        self.words.extend(
            list.lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(str::to_lowercase),
        );
    }

    /// Is `word` (already lowercase) in this lexicon?
    pub fn contains(&self, word: &str) -> bool {
        self.words.contains(word)
    }

    /// The number of words we know.
    pub fn len(&self) -> usize {
        self.words.len()
    }

    /// Fraction of `tokens` found in this lexicon. Purely numeric tokens count
    /// as found.
    pub fn coverage(&self, tokens: &[String]) -> Option<f32> {
        if tokens.is_empty() {
            return None;
        }
        let hits = tokens
            .iter()
            .filter(|token| is_numeric(token) || self.contains(token))
            .count();
        Some(hits as f32 / tokens.len() as f32)
    }
}

/// All our lexicons, keyed by language code.
#[derive(Clone, Debug, Default)]
pub struct Lexicons {
    by_language: BTreeMap<String, Lexicon>,
}

impl Lexicons {
    /// The built-in English and German lexicons.
    pub fn builtin() -> Self {
        let mut by_language = BTreeMap::new();
        by_language.insert("de".to_owned(), Lexicon::parse(BUILTIN_DE));
        by_language.insert("en".to_owned(), Lexicon::parse(BUILTIN_EN));
        Self { by_language }
    }

    /// The built-in lexicons, extended or replaced by configured word lists.
    #[instrument(level = "debug", skip_all)]
    pub async fn load(configs: &BTreeMap<String, LexiconConfig>) -> Result<Self> {
        let mut lexicons = Self::builtin();
        for (language, config) in configs {
            let list = tokio::fs::read_to_string(&config.path)
                .await
                .with_context(|| {
                    format!("cannot read {language} word list {:?}", config.path)
                })?;
            lexicons.add_list(language, &list, config.replace);
        }
        Ok(lexicons)
    }

    /// Add a word list for `language`.
    pub fn add_list(&mut self, language: &str, list: &str, replace: bool) {
        let lexicon = self.by_language.entry(language.to_owned()).or_default();
        if replace {
            *lexicon = Lexicon::default();
        }
        lexicon.extend_from_list(list);
        debug!(language, words = lexicon.len(), "Loaded lexicon");
    }

    /// Look up the lexicon for a language.
    pub fn get(&self, language: &str) -> Option<&Lexicon> {
        self.by_language.get(language)
    }

    /// Guess the language of `text`, if we can.
    ///
    /// Ties go to the alphabetically first language code, so the answer never
    /// depends on hash order.
    pub fn detect_language(&self, text: &str) -> Option<&str> {
        let tokens = tokenize(text)
            .filter(|token| !is_numeric(token))
            .collect::<Vec<_>>();
        if tokens.len() < MIN_DETECTION_TOKENS {
            return None;
        }
        let mut best: Option<(&str, f32)> = None;
        for (language, lexicon) in &self.by_language {
            let Some(rate) = lexicon.coverage(&tokens) else {
                continue;
            };
            if rate >= MIN_DETECTION_HIT_RATE && best.is_none_or(|(_, best)| rate > best) {
                best = Some((language.as_str(), rate));
            }
        }
        best.map(|(language, _)| language)
    }
}

/// Split text into lowercase word tokens.
pub fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .map(|token| token.trim_matches('\''))
        .filter(|token| !token.is_empty())
        .map(str::to_lowercase)
}

/// Is this token made entirely of digits?
fn is_numeric(token: &str) -> bool {
    token.chars().all(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize() {
        let tokens = tokenize("Dear Sir, it's 2024 -- 'quoted' Straße!").collect::<Vec<_>>();
        assert_eq!(tokens, vec!["dear", "sir", "it's", "2024", "quoted", "straße"]);
    }

    #[test]
    fn test_detect_language() {
        let lexicons = Lexicons::builtin();
        assert_eq!(
            lexicons.detect_language("Thank you for your letter of the first of May."),
            Some("en")
        );
        assert_eq!(
            lexicons.detect_language("Vielen Dank für Ihre Rechnung vom ersten Mai."),
            Some("de")
        );
        assert_eq!(lexicons.detect_language("qwxz vbnm plkj"), None);
        assert_eq!(lexicons.detect_language("the end"), None);
    }

    #[test]
    fn test_custom_lists_extend_or_replace() {
        let mut lexicons = Lexicons::builtin();
        lexicons.add_list("en", "# legal terms\nplaintiff\nDefendant\n", false);
        let en = lexicons.get("en").unwrap();
        assert!(en.contains("plaintiff"));
        assert!(en.contains("defendant"));
        assert!(en.contains("the"));

        lexicons.add_list("en", "plaintiff\n", true);
        assert!(!lexicons.get("en").unwrap().contains("the"));
    }

    #[test]
    fn test_coverage_counts_numbers() {
        let lexicon = Lexicon::parse("total\ndue\n");
        let tokens = tokenize("Total due 1250 xyzzy").collect::<Vec<_>>();
        assert_eq!(lexicon.coverage(&tokens), Some(0.75));
        assert_eq!(lexicon.coverage(&[]), None);
    }
}
