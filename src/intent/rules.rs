//! Deterministic keyword classifier used whenever the model path fails.

use std::sync::LazyLock;

use regex::Regex;

use super::ClassifierContext;
use super::types::{ClassificationResult, ClassificationSource, Entities, IterationMode};

static LINK_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(link|links|linking|connect|connecting|integrate|hook up|wire up)\b").unwrap()
});

static LINK_TARGET_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:to|with)\s+(?:the\s+|a\s+|an\s+|my\s+|our\s+)?([^.,;!?\n]+)").unwrap()
});

static FIX_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(error|errors|fix|fixes|bug|bugs|broken|crash|crashes|fails?|failing|exception|not working|doesn't work|does not work)\b",
    )
    .unwrap()
});

static QUESTION_OPENER_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^\s*(what|why|how|where|when|which|who|can|could|does|do|is|are|should|would|explain)\b",
    )
    .unwrap()
});

static MODIFY_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(update|change|edit|refactor|modify|rename|replace|move|remove|delete|adjust|tweak|make it)\b",
    )
    .unwrap()
});

static FILE_TOKEN_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b[\w./-]+\.(?:ts|tsx|js|jsx|mjs|css|scss|html|json|md|py|rs|go|java|rb|vue|svelte|toml|yaml|yml)\b",
    )
    .unwrap()
});

const LINK_TARGET_MAX_CHARS: usize = 80;

#[derive(Debug, Default, Clone, Copy)]
pub struct RuleClassifier;

impl RuleClassifier {
    pub fn new() -> Self {
        Self
    }

    pub fn classify(&self, prompt: &str, ctx: &ClassifierContext) -> ClassificationResult {
        let trimmed = prompt.trim();
        if trimmed.is_empty() {
            return ClassificationResult {
                mode: IterationMode::Create,
                confidence: 0.6,
                task_list: vec![],
                entities: Entities::default(),
                warnings: vec!["Empty prompt; defaulting to CREATE".to_string()],
                source: ClassificationSource::Rules,
            };
        }

        let (mode, confidence) = Self::detect_mode(trimmed);

        let entities = match mode {
            IterationMode::CreateAndLink => Entities {
                to_create: new_file_mentions(trimmed, &ctx.existing_files),
                to_modify: vec![],
                link: link_target(trimmed),
            },
            IterationMode::Modify | IterationMode::FixError => Entities {
                to_create: vec![],
                to_modify: mentioned_files(trimmed, &ctx.existing_files),
                link: None,
            },
            IterationMode::Create => Entities {
                to_create: new_file_mentions(trimmed, &ctx.existing_files),
                ..Entities::default()
            },
            IterationMode::Question => Entities::default(),
        };

        ClassificationResult {
            mode,
            confidence,
            task_list: vec![trimmed.to_string()],
            entities,
            warnings: vec![],
            source: ClassificationSource::Rules,
        }
    }

    /// Fixed priority: link → fix → question → modify → create.
    fn detect_mode(prompt: &str) -> (IterationMode, f64) {
        if LINK_REGEX.is_match(prompt) {
            return (IterationMode::CreateAndLink, 0.75);
        }
        if FIX_REGEX.is_match(prompt) {
            return (IterationMode::FixError, 0.8);
        }
        let opener = QUESTION_OPENER_REGEX.is_match(prompt);
        let trailing = prompt.ends_with('?');
        if opener || trailing {
            let confidence = if opener && trailing { 0.8 } else { 0.7 };
            return (IterationMode::Question, confidence);
        }
        if MODIFY_REGEX.is_match(prompt) {
            return (IterationMode::Modify, 0.7);
        }
        (IterationMode::Create, 0.6)
    }
}

/// Existing files referenced by path, file name, or stem.
fn mentioned_files(prompt: &str, existing: &[String]) -> Vec<String> {
    let lower = prompt.to_lowercase();
    existing
        .iter()
        .filter(|path| {
            let path_lower = path.to_lowercase();
            if lower.contains(&path_lower) {
                return true;
            }
            let name = path_lower.rsplit('/').next().unwrap_or(&path_lower);
            if lower.contains(name) {
                return true;
            }
            let stem = name.split('.').next().unwrap_or(name);
            stem.len() >= 3 && contains_word(&lower, stem)
        })
        .cloned()
        .collect()
}

fn new_file_mentions(prompt: &str, existing: &[String]) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    for m in FILE_TOKEN_REGEX.find_iter(prompt) {
        let token = m.as_str().trim_start_matches("./").to_string();
        if !existing.iter().any(|e| e == &token) && !found.contains(&token) {
            found.push(token);
        }
    }
    found
}

fn link_target(prompt: &str) -> Option<String> {
    let caps = LINK_TARGET_REGEX.captures(prompt)?;
    let target: String = caps
        .get(1)?
        .as_str()
        .trim()
        .chars()
        .take(LINK_TARGET_MAX_CHARS)
        .collect();
    (!target.is_empty()).then_some(target)
}

fn contains_word(haystack: &str, word: &str) -> bool {
    Regex::new(&format!(r"\b{}\b", regex::escape(word)))
        .map(|re| re.is_match(haystack))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(files: &[&str]) -> ClassifierContext {
        ClassifierContext {
            history: vec![],
            existing_files: files.iter().map(|f| f.to_string()).collect(),
        }
    }

    fn mode_of(prompt: &str) -> IterationMode {
        RuleClassifier::new().classify(prompt, &ctx(&[])).mode
    }

    #[test]
    fn test_priority_order() {
        // link wins over fix and question
        assert_eq!(
            mode_of("Can you connect the broken form to Stripe?"),
            IterationMode::CreateAndLink
        );
        // fix wins over question
        assert_eq!(mode_of("Why does the login fail?"), IterationMode::FixError);
        assert_eq!(mode_of("What does this component do?"), IterationMode::Question);
        assert_eq!(mode_of("the header uses flexbox?"), IterationMode::Question);
        assert_eq!(mode_of("Update the header color to blue"), IterationMode::Modify);
        assert_eq!(mode_of("Build a todo app"), IterationMode::Create);
    }

    #[test]
    fn test_confidence_within_fallback_range() {
        for prompt in [
            "link it",
            "fix it",
            "how?",
            "what is this",
            "is it done?",
            "refactor",
            "a landing page",
        ] {
            let result = RuleClassifier::new().classify(prompt, &ctx(&[]));
            assert!(
                (0.6..=0.8).contains(&result.confidence),
                "{} -> {}",
                prompt,
                result.confidence
            );
            assert_eq!(result.source, ClassificationSource::Rules);
        }
    }

    #[test]
    fn test_question_has_no_entities() {
        let result = RuleClassifier::new().classify("What is in app.ts?", &ctx(&["src/app.ts"]));
        assert_eq!(result.mode, IterationMode::Question);
        assert!(result.entities.is_empty());
    }

    #[test]
    fn test_modify_extracts_existing_files_by_stem() {
        let result = RuleClassifier::new().classify(
            "Change the Header so it is sticky",
            &ctx(&["src/components/Header.tsx", "src/Footer.tsx"]),
        );
        assert_eq!(result.mode, IterationMode::Modify);
        assert_eq!(result.entities.to_modify, vec!["src/components/Header.tsx"]);
    }

    #[test]
    fn test_link_extracts_target() {
        let result =
            RuleClassifier::new().classify("Link the signup form to the Mailchimp API.", &ctx(&[]));
        assert_eq!(result.mode, IterationMode::CreateAndLink);
        assert_eq!(result.entities.link.as_deref(), Some("Mailchimp API"));
    }

    #[test]
    fn test_create_lists_new_file_names() {
        let result = RuleClassifier::new()
            .classify("Add a pricing page in pricing.tsx", &ctx(&["index.ts"]));
        assert_eq!(result.mode, IterationMode::Create);
        assert_eq!(result.entities.to_create, vec!["pricing.tsx"]);
    }

    #[test]
    fn test_empty_prompt_defaults_to_create_with_warning() {
        let result = RuleClassifier::new().classify("   ", &ctx(&[]));
        assert_eq!(result.mode, IterationMode::Create);
        assert_eq!(result.warnings.len(), 1);
        assert!(result.task_list.is_empty());
    }

    #[test]
    fn test_rules_are_deterministic() {
        let a = RuleClassifier::new().classify("Fix the navbar", &ctx(&["navbar.tsx"]));
        let b = RuleClassifier::new().classify("Fix the navbar", &ctx(&["navbar.tsx"]));
        assert_eq!(a, b);
    }
}
