//! Row-level checks for curation stages 1 to 4.

use std::collections::HashSet;

use regex::Regex;
use sha2::{Digest, Sha256};

use crate::domain::Feedback;

/// Collapse whitespace runs, trim and lowercase.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<&str>>()
        .join(" ")
        .to_lowercase()
}

/// Why a row failed the structural stage, if it did.
pub fn structural_defect(feedback: &Feedback, min_chars: usize, max_chars: usize) -> Option<&'static str> {
    let prompt = feedback.prompt.trim();
    if prompt.is_empty() {
        return Some("empty prompt");
    }
    let output = match feedback.corrected_response.as_deref().map(str::trim) {
        Some(output) if !output.is_empty() => output,
        _ => return Some("missing correction"),
    };

    let len = output.chars().count();
    if len < min_chars || len > max_chars {
        return Some("correction length out of range");
    }
    if normalize_text(prompt) == normalize_text(output) {
        return Some("correction echoes prompt");
    }
    None
}

/// Regex detectors for personal data and credentials in corrected responses.
pub struct PiiDetector {
    patterns: Vec<Regex>,
}

impl PiiDetector {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, regex::Error> {
        let patterns = patterns
            .iter()
            .map(|p| Regex::new(p.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn detects(&self, text: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(text))
    }
}

/// Matches already-normalized text against normalized disallowed phrases.
pub struct PolicyFilter {
    phrases: Vec<String>,
}

impl PolicyFilter {
    pub fn new<S: AsRef<str>>(phrases: &[S]) -> Self {
        let phrases = phrases
            .iter()
            .map(|p| normalize_text(p.as_ref()))
            .filter(|p| !p.is_empty())
            .collect();
        Self { phrases }
    }

    pub fn violates(&self, text: &str) -> bool {
        let normalized = normalize_text(text);
        self.phrases.iter().any(|p| normalized.contains(p.as_str()))
    }
}

/// SHA-256 over the normalized (prompt, model_response, corrected_response) triple.
pub fn fingerprint(feedback: &Feedback) -> String {
    let payload = format!(
        "{}|{}|{}",
        normalize_text(&feedback.prompt),
        normalize_text(&feedback.model_response),
        normalize_text(feedback.corrected_response.as_deref().unwrap_or_default()),
    );
    hex::encode(Sha256::digest(payload.as_bytes()))
}

/// Keep the first row per fingerprint, preserving order.
pub fn deduplicate(rows: Vec<&Feedback>) -> Vec<&Feedback> {
    let mut seen = HashSet::new();
    rows.into_iter().filter(|fb| seen.insert(fingerprint(fb))).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curation::CurationConfig;
    use crate::domain::NewFeedback;
    use uuid::Uuid;

    fn feedback(prompt: &str, response: &str, corrected: Option<&str>) -> Feedback {
        NewFeedback {
            prompt: prompt.to_string(),
            model_response: response.to_string(),
            corrected_response: corrected.map(str::to_string),
            rating: -1,
            tags: vec![],
        }
        .into_feedback(Uuid::new_v4(), Uuid::new_v4())
        .unwrap()
    }

    #[test]
    fn test_normalize_text() {
        assert_eq!(normalize_text("  Hello,\n\tWORLD  again "), "hello, world again");
    }

    #[test]
    fn structural_rules() {
        let ok = feedback("Capital of France?", "Lyon", Some("Paris is the capital."));
        assert_eq!(structural_defect(&ok, 5, 5000), None);

        let blank = feedback("Capital of France?", "Lyon", Some("   "));
        assert_eq!(structural_defect(&blank, 5, 5000), Some("missing correction"));

        let missing = feedback("Capital of France?", "Lyon", None);
        assert_eq!(structural_defect(&missing, 5, 5000), Some("missing correction"));

        let short = feedback("Capital of France?", "Lyon", Some(" Pa  "));
        assert_eq!(structural_defect(&short, 5, 5000), Some("correction length out of range"));

        let long = feedback("Capital of France?", "Lyon", Some(&"x".repeat(5001)));
        assert_eq!(structural_defect(&long, 5, 5000), Some("correction length out of range"));

        let echo = feedback("Say  Hello World", "hi", Some("say hello   world"));
        assert_eq!(structural_defect(&echo, 5, 5000), Some("correction echoes prompt"));
    }

    #[test]
    fn default_pii_patterns() {
        let detector = PiiDetector::new(&CurationConfig::default().pii_patterns).unwrap();
        assert!(detector.detects("call me at 5551234567 tomorrow"));
        assert!(detector.detects("mail jane.doe@example.org for access"));
        assert!(detector.detects("set api_key=sk-123 in the env"));
        assert!(detector.detects("password: hunter2"));
        assert!(!detector.detects("the answer is 42 and order 123456789"));
    }

    #[test]
    fn policy_phrases_match_normalized_text() {
        let policy = PolicyFilter::new(&CurationConfig::default().disallowed_phrases);
        assert!(policy.violates("As an   AI, I think so."));
        assert!(!policy.violates("Paris is the capital."));
    }

    #[test]
    fn dedup_ignores_case_and_whitespace() {
        let a = feedback("What is Rust?", "A game", Some("A systems language."));
        let b = feedback("what  is rust?", "a GAME", Some("a systems\nlanguage."));
        let c = feedback("What is Go?", "A game", Some("A systems language."));
        assert_eq!(fingerprint(&a), fingerprint(&b));

        let kept = deduplicate(vec![&a, &b, &c]);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].id, a.id);
        assert_eq!(kept[1].id, c.id);
    }
}
