//! Denylist screening for process-spawning actions.
//!
//! Patterns are case-insensitive regexes. The built-in set is always active;
//! configuration can only add to it.

use regex::{Regex, RegexBuilder};
use serde_json::Value;

use crate::error::{ActionError, ConfigError};

/// Built-in destructive patterns.
const DEFAULT_DENYLIST: &[&str] = &[
    // recursive deletion of / , /* , ~ or $HOME, quoted or not
    r#"\brm\s+(?:-{1,2}[\w-]+\s+)*["']?(?:/\*?|~/?|\$HOME/?|\$\{HOME\}/?)["']?(?:\s|;|&|\||$)"#,
    r"--no-preserve-root",
    // fork bombs, the classic and the named-function form
    r":\s*\(\s*\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:",
    r"\b\w+\s*\(\s*\)\s*\{\s*\w+\s*\|\s*\w+\s*&\s*\}",
    // privilege escalation
    r"(?:^|[\s;&|(`])(?:sudo|doas|su|pkexec)(?:\s|$)",
    // raw device and filesystem destruction
    r"\bmkfs(?:\.\w+)?\b",
    r"\bdd\b[^;&|]*\bof=/dev/(?:sd|hd|nvme|xvd|vd|disk)",
    r">\s*/dev/(?:sd|hd|nvme|xvd|vd|disk)",
    r"\bchmod\s+(?:-\w+\s+)*0?777\s+/(?:\s|;|&|\||$)",
    // remote code piped into a shell
    r"\b(?:curl|wget)\b[^;&]*\|\s*(?:sudo\s+)?(?:ba|z|da|k)?sh\b",
];

/// Compiled denylist.
#[derive(Debug, Clone)]
pub struct CommandFilter {
    patterns: Vec<(String, Regex)>,
}

impl CommandFilter {
    /// Built-in patterns plus `extra`.
    pub fn new(extra: &[String]) -> Result<Self, ConfigError> {
        let sources = DEFAULT_DENYLIST
            .iter()
            .map(|s| s.to_string())
            .chain(extra.iter().cloned());

        let mut patterns = Vec::new();
        for source in sources {
            let regex = RegexBuilder::new(&source)
                .case_insensitive(true)
                .build()
                .map_err(|e| ConfigError::InvalidPattern {
                    pattern: source.clone(),
                    message: e.to_string(),
                })?;
            patterns.push((source, regex));
        }
        Ok(Self { patterns })
    }

    /// The pattern `text` matches, if any.
    pub fn find_match(&self, text: &str) -> Option<&str> {
        self.patterns
            .iter()
            .find(|(_, re)| re.is_match(text))
            .map(|(source, _)| source.as_str())
    }

    /// Fail with `SecurityViolation` when `text` matches.
    pub fn check(&self, text: &str) -> Result<(), ActionError> {
        match self.find_match(text) {
            Some(pattern) => Err(ActionError::SecurityViolation {
                pattern: pattern.to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Check every string nested anywhere in `value` (keys included).
    pub fn check_value(&self, value: &Value) -> Result<(), ActionError> {
        match value {
            Value::String(s) => self.check(s),
            Value::Array(items) => items.iter().try_for_each(|v| self.check_value(v)),
            Value::Object(map) => map.iter().try_for_each(|(k, v)| {
                self.check(k)?;
                self.check_value(v)
            }),
            Value::Null | Value::Bool(_) | Value::Number(_) => Ok(()),
        }
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}
