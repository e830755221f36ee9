//! Keyword-triggered template responder.
//!
//! The response table is TOML content (see `templates/medibot.toml`):
//! an ordered list of categories, each with trigger keywords and response
//! templates, plus a single fixed fallback. The built-in table is embedded
//! at compile time; a different table can be loaded from disk.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

/// Compile-time embedded default response table.
const BUILTIN_TABLE: &str = include_str!("../templates/medibot.toml");

/// Placeholder substituted with the user's display name.
const NAME_PLACEHOLDER: &str = "{name}";

/// Keyword words of at least this length also match any word they start
/// ("pain" → "painful"); shorter ones must match exactly ("hi" ≠ "his").
const MIN_PREFIX_LEN: usize = 4;

#[derive(Error, Debug)]
pub enum TemplateError {
    #[error("failed to read template table {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid template TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid template table: {0}")]
    Invalid(String),
}

/// Response category, in the order they appear in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CategoryKind {
    Greeting,
    Symptoms,
    Appointment,
    Prescription,
    Thanks,
    Goodbye,
}

/// Bot identity strings from the `[bot]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct BotProfile {
    pub name: String,
    pub role: String,
    /// Opening line for a freshly registered user.
    pub registration_welcome: String,
}

/// One `[[categories]]` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct Category {
    pub kind: CategoryKind,
    pub keywords: Vec<String>,
    pub templates: Vec<String>,
}

/// Top-level template table.
#[derive(Debug, Clone, Deserialize)]
pub struct TemplateTable {
    pub version: u32,
    pub fallback: String,
    pub bot: BotProfile,
    pub categories: Vec<Category>,
}

impl TemplateTable {
    pub fn from_toml_str(src: &str) -> Result<Self, TemplateError> {
        let table: TemplateTable = toml::from_str(src)?;
        table.validate()?;
        Ok(table)
    }

    fn validate(&self) -> Result<(), TemplateError> {
        if self.fallback.trim().is_empty() {
            return Err(TemplateError::Invalid("fallback response is empty".into()));
        }
        let mut seen = Vec::with_capacity(self.categories.len());
        for category in &self.categories {
            if seen.contains(&category.kind) {
                return Err(TemplateError::Invalid(format!(
                    "category {:?} defined twice",
                    category.kind
                )));
            }
            seen.push(category.kind);

            if category.keywords.iter().all(|k| k.trim().is_empty()) {
                return Err(TemplateError::Invalid(format!(
                    "category {:?} has no keywords",
                    category.kind
                )));
            }
            if category.templates.is_empty() {
                return Err(TemplateError::Invalid(format!(
                    "category {:?} has no templates",
                    category.kind
                )));
            }
        }
        if !seen.contains(&CategoryKind::Greeting) {
            return Err(TemplateError::Invalid("greeting category is required".into()));
        }
        Ok(())
    }

    pub fn category(&self, kind: CategoryKind) -> Option<&Category> {
        self.categories.iter().find(|c| c.kind == kind)
    }
}

/// A category with its keywords pre-split into lowercase words.
struct CompiledCategory {
    kind: CategoryKind,
    keywords: Vec<Vec<String>>,
}

/// Maps free text to a category and renders a random template from it.
pub struct Responder {
    table: TemplateTable,
    compiled: Vec<CompiledCategory>,
}

impl Responder {
    pub fn new(table: TemplateTable) -> Self {
        let compiled = table
            .categories
            .iter()
            .map(|c| CompiledCategory {
                kind: c.kind,
                keywords: c
                    .keywords
                    .iter()
                    .map(|k| tokenize(k))
                    .filter(|words| !words.is_empty())
                    .collect(),
            })
            .collect();
        Self { table, compiled }
    }

    /// Responder over the embedded default table.
    pub fn builtin() -> Result<Self, TemplateError> {
        Ok(Self::new(TemplateTable::from_toml_str(BUILTIN_TABLE)?))
    }

    /// Responder over a table loaded from a TOML file.
    pub fn from_path(path: &Path) -> Result<Self, TemplateError> {
        let src = std::fs::read_to_string(path).map_err(|source| TemplateError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let table = TemplateTable::from_toml_str(&src)?;
        tracing::info!(
            path = %path.display(),
            version = table.version,
            categories = table.categories.len(),
            "loaded template table"
        );
        Ok(Self::new(table))
    }

    pub fn table(&self) -> &TemplateTable {
        &self.table
    }

    pub fn bot_name(&self) -> &str {
        &self.table.bot.name
    }

    pub fn bot_role(&self) -> &str {
        &self.table.bot.role
    }

    /// First category (in table order) with a keyword present in `text`.
    pub fn classify(&self, text: &str) -> Option<CategoryKind> {
        let words = tokenize(text);
        self.compiled
            .iter()
            .find(|c| c.keywords.iter().any(|kw| contains_keyword(&words, kw)))
            .map(|c| c.kind)
    }

    /// Produce the bot's reply to `text`.
    pub fn respond<R: Rng + ?Sized>(&self, text: &str, user_name: &str, rng: &mut R) -> String {
        let kind = self.classify(text);
        tracing::debug!(category = ?kind, "classified message");
        match kind {
            Some(kind) => self.render(kind, user_name, rng),
            None => self.table.fallback.clone(),
        }
    }

    /// Random greeting for a returning user.
    pub fn greeting<R: Rng + ?Sized>(&self, user_name: &str, rng: &mut R) -> String {
        self.render(CategoryKind::Greeting, user_name, rng)
    }

    /// Opening line for a newly registered user.
    pub fn registration_welcome(&self, user_name: &str) -> String {
        fill(&self.table.bot.registration_welcome, user_name)
    }

    fn render<R: Rng + ?Sized>(&self, kind: CategoryKind, user_name: &str, rng: &mut R) -> String {
        self.table
            .category(kind)
            .and_then(|c| c.templates.choose(rng))
            .map(|t| fill(t, user_name))
            .unwrap_or_else(|| self.table.fallback.clone())
    }
}

fn fill(template: &str, user_name: &str) -> String {
    template.replace(NAME_PLACEHOLDER, user_name)
}

/// Lowercase words, split on anything but letters, digits and apostrophes.
fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .filter(|w| !w.is_empty())
        .map(str::to_owned)
        .collect()
}

fn word_matches(word: &str, keyword: &str) -> bool {
    if word == keyword {
        return true;
    }
    keyword.chars().count() >= MIN_PREFIX_LEN && word.starts_with(keyword)
}

fn contains_keyword(words: &[String], keyword: &[String]) -> bool {
    if keyword.is_empty() || words.len() < keyword.len() {
        return false;
    }
    words
        .windows(keyword.len())
        .any(|window| window.iter().zip(keyword).all(|(w, k)| word_matches(w, k)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn responder() -> Responder {
        Responder::builtin().expect("builtin table must parse")
    }

    fn templates_of(r: &Responder, kind: CategoryKind, name: &str) -> Vec<String> {
        r.table()
            .category(kind)
            .unwrap()
            .templates
            .iter()
            .map(|t| fill(t, name))
            .collect()
    }

    #[test]
    fn test_builtin_table_is_valid() {
        let r = responder();
        assert_eq!(r.bot_name(), "MediBot");
        assert_eq!(r.bot_role(), "Medical Assistant");
        assert_eq!(r.table().categories.len(), 6);
        assert_eq!(r.table().categories[0].kind, CategoryKind::Greeting);
    }

    #[test]
    fn test_priority_order() {
        let r = responder();
        assert_eq!(r.classify("Hello there"), Some(CategoryKind::Greeting));
        assert_eq!(r.classify("I have a headache"), Some(CategoryKind::Symptoms));
        assert_eq!(r.classify("Can I book an appointment?"), Some(CategoryKind::Appointment));
        assert_eq!(r.classify("I need a refill"), Some(CategoryKind::Prescription));
        assert_eq!(r.classify("thank you so much"), Some(CategoryKind::Thanks));
        assert_eq!(r.classify("ok bye"), Some(CategoryKind::Goodbye));
        assert_eq!(r.classify("what is the weather"), None);
    }

    #[test]
    fn test_symptoms_outrank_later_categories() {
        let r = responder();
        let mut rng = StdRng::seed_from_u64(7);
        let symptoms = templates_of(&r, CategoryKind::Symptoms, "Alice");
        for text in [
            "I have a headache",
            "I have a headache, thanks doctor",
            "my fever needs a prescription refill, bye",
            "Coughing all night, can I schedule an appointment?",
            "SORE throat and I want to see a doctor",
        ] {
            for _ in 0..20 {
                let reply = r.respond(text, "Alice", &mut rng);
                assert!(symptoms.contains(&reply), "{text:?} -> {reply:?}");
            }
        }
    }

    #[test]
    fn test_greeting_outranks_symptoms() {
        let r = responder();
        assert_eq!(r.classify("hi, I have a fever"), Some(CategoryKind::Greeting));
    }

    #[test]
    fn test_short_keywords_need_whole_word() {
        let r = responder();
        // "this" contains "hi", "weekend" contains "end", "his" is "hi" + "s"
        assert_eq!(r.classify("this weekend his plans"), None);
    }

    #[test]
    fn test_long_keywords_match_word_prefix() {
        let r = responder();
        for text in [
            "It's painful",
            "my back is aching",
            "I feel feverish",
            "this sickness won't go away",
            "I've been coughing since Monday",
        ] {
            assert_eq!(r.classify(text), Some(CategoryKind::Symptoms), "{text:?}");
        }
        assert_eq!(r.classify("rescheduling please"), None);
    }

    #[test]
    fn test_inflections_match() {
        let r = responder();
        assert_eq!(r.classify("my symptoms got worse"), Some(CategoryKind::Symptoms));
        assert_eq!(r.classify("it hurts"), Some(CategoryKind::Symptoms));
        assert_eq!(r.classify("pills ran out"), Some(CategoryKind::Prescription));
        assert_eq!(r.classify("thanks!"), Some(CategoryKind::Thanks));
    }

    #[test]
    fn test_multi_word_keywords() {
        let r = responder();
        assert_eq!(r.classify("see you later"), Some(CategoryKind::Goodbye));
        assert_eq!(r.classify("I'd like to see a specialist"), Some(CategoryKind::Appointment));
        assert_eq!(r.classify("you see"), None);
    }

    #[test]
    fn test_name_substitution() {
        let r = responder();
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..20 {
            let reply = r.respond("goodbye", "Bob", &mut rng);
            assert!(reply.contains("Bob"), "{reply}");
            assert!(!reply.contains(NAME_PLACEHOLDER));
        }
    }

    #[test]
    fn test_fallback_is_fixed() {
        let r = responder();
        let mut rng = StdRng::seed_from_u64(3);
        let first = r.respond("qwerty", "Alice", &mut rng);
        assert_eq!(first, r.table().fallback);
        for _ in 0..10 {
            assert_eq!(r.respond("the sky is blue", "Alice", &mut rng), first);
        }
    }

    #[test]
    fn test_same_seed_same_reply() {
        let r = responder();
        let a = r.respond("hello", "Alice", &mut StdRng::seed_from_u64(42));
        let b = r.respond("hello", "Alice", &mut StdRng::seed_from_u64(42));
        assert_eq!(a, b);
    }

    #[test]
    fn test_registration_welcome() {
        let r = responder();
        assert_eq!(
            r.registration_welcome("Alice"),
            "Hello Alice! I'm MediBot, your medical assistant. How can I help you today?"
        );
    }

    #[test]
    fn test_rejects_duplicate_category() {
        let src = r#"
            version = 1
            fallback = "?"
            [bot]
            name = "B"
            role = "r"
            registration_welcome = "hi {name}"
            [[categories]]
            kind = "greeting"
            keywords = ["hi"]
            templates = ["Hi"]
            [[categories]]
            kind = "greeting"
            keywords = ["hey"]
            templates = ["Hey"]
        "#;
        assert!(matches!(
            TemplateTable::from_toml_str(src),
            Err(TemplateError::Invalid(_))
        ));
    }

    #[test]
    fn test_rejects_category_without_templates() {
        let src = r#"
            version = 1
            fallback = "?"
            [bot]
            name = "B"
            role = "r"
            registration_welcome = "hi {name}"
            [[categories]]
            kind = "greeting"
            keywords = ["hi"]
            templates = []
        "#;
        assert!(matches!(
            TemplateTable::from_toml_str(src),
            Err(TemplateError::Invalid(_))
        ));
    }

    #[test]
    fn test_rejects_unknown_category() {
        let src = r#"
            version = 1
            fallback = "?"
            [bot]
            name = "B"
            role = "r"
            registration_welcome = "hi"
            [[categories]]
            kind = "weather"
            keywords = ["rain"]
            templates = ["Bring an umbrella"]
        "#;
        assert!(matches!(
            TemplateTable::from_toml_str(src),
            Err(TemplateError::Parse(_))
        ));
    }

    #[test]
    fn test_from_path_missing_file() {
        let err = Responder::from_path(Path::new("/nonexistent/medibot.toml"))
            .err()
            .unwrap();
        assert!(matches!(err, TemplateError::Io { .. }));
    }
}
