// System-message override pipeline
// Remove → replace → prepend/append, in that order. Patterns compile once
// at startup; the same pipeline is reused for tool_result strings.

use regex::{Regex, RegexBuilder};

use super::config::SystemMessageOverrides;
use super::error::ProxyError;

pub struct OverrideEngine {
    remove: Vec<Regex>,
    replacements: Vec<(String, String)>,
    prepend: String,
    append: String,
}

impl OverrideEngine {
    pub fn compile(overrides: &SystemMessageOverrides) -> Result<Self, ProxyError> {
        let mut remove = Vec::with_capacity(overrides.remove_patterns.len());
        for pattern in &overrides.remove_patterns {
            let regex = RegexBuilder::new(pattern)
                .multi_line(true)
                .case_insensitive(false)
                .build()
                .map_err(|e| ProxyError::InvalidPattern(format!("{}: {}", pattern, e)))?;
            remove.push(regex);
        }

        Ok(Self {
            remove,
            replacements: overrides
                .replacements
                .iter()
                .map(|r| (r.find.clone(), r.replace.clone()))
                .collect(),
            prepend: overrides.prepend.clone(),
            append: overrides.append.clone(),
        })
    }

    /// True when the pipeline would leave any input untouched.
    pub fn is_empty(&self) -> bool {
        self.remove.is_empty()
            && self.replacements.is_empty()
            && self.prepend.is_empty()
            && self.append.is_empty()
    }

    pub fn apply(&self, text: &str) -> String {
        let mut out = text.to_string();

        for regex in &self.remove {
            out = regex.replace_all(&out, "").into_owned();
        }
        for (find, replace) in &self.replacements {
            out = out.replace(find.as_str(), replace.as_str());
        }
        if !self.prepend.is_empty() {
            out = format!("{}{}", self.prepend, out);
        }
        if !self.append.is_empty() {
            out.push_str(&self.append);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::config::Replacement;

    fn engine(overrides: SystemMessageOverrides) -> OverrideEngine {
        OverrideEngine::compile(&overrides).unwrap()
    }

    #[test]
    fn test_remove_then_replace_then_affix() {
        let e = engine(SystemMessageOverrides {
            remove_patterns: vec!["^SECRET.*$".to_string()],
            replacements: vec![Replacement {
                find: "Claude".to_string(),
                replace: "the model".to_string(),
            }],
            prepend: ">> ".to_string(),
            append: " <<".to_string(),
        });

        let out = e.apply("SECRET line\nClaude answers here");
        assert_eq!(out, ">> \nthe model answers here <<");
    }

    #[test]
    fn test_multiline_anchors() {
        let e = engine(SystemMessageOverrides {
            remove_patterns: vec!["^drop me$".to_string()],
            ..Default::default()
        });
        let out = e.apply("keep\ndrop me\nkeep too");
        assert_eq!(out, "keep\n\nkeep too");
    }

    #[test]
    fn test_case_sensitive_removal() {
        let e = engine(SystemMessageOverrides {
            remove_patterns: vec!["^Remove$".to_string()],
            ..Default::default()
        });
        assert_eq!(e.apply("remove"), "remove");
        assert_eq!(e.apply("Remove"), "");
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let result = OverrideEngine::compile(&SystemMessageOverrides {
            remove_patterns: vec!["([unclosed".to_string()],
            ..Default::default()
        });
        assert!(matches!(result, Err(ProxyError::InvalidPattern(_))));
    }

    #[test]
    fn test_empty_pipeline_is_identity() {
        let e = engine(SystemMessageOverrides::default());
        assert!(e.is_empty());
        assert_eq!(e.apply("unchanged\ntext"), "unchanged\ntext");
    }
}
