//! Keyword scanning over fetched page bodies.
//!
//! Rules from keyword sets are compiled once per batch: `substring` rules
//! match case-insensitively, `regex` rules are compiled as written. Ad-hoc
//! keywords are always case-insensitive substrings.

use regex::Regex;

use crate::errors::ValidationError;
use crate::models::{KeywordRule, KeywordRuleType};

enum CompiledRule {
    Substring { original: String, lowered: String },
    Regex { original: String, regex: Regex },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanHits {
    pub from_sets: Vec<String>,
    pub ad_hoc: Vec<String>,
}

impl ScanHits {
    pub fn any(&self) -> bool {
        !self.from_sets.is_empty() || !self.ad_hoc.is_empty()
    }
}

pub struct KeywordScanner {
    rules: Vec<CompiledRule>,
    ad_hoc: Vec<(String, String)>,
}

impl KeywordScanner {
    /// Compile set rules and ad-hoc keywords. An invalid regex rejects the
    /// whole configuration — a half-scanning campaign would silently
    /// under-report leads.
    pub fn compile(rules: &[KeywordRule], ad_hoc: &[String]) -> Result<Self, ValidationError> {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            match rule.rule_type {
                KeywordRuleType::Substring => compiled.push(CompiledRule::Substring {
                    original: rule.pattern.clone(),
                    lowered: rule.pattern.to_lowercase(),
                }),
                KeywordRuleType::Regex => {
                    let regex = Regex::new(&rule.pattern).map_err(|e| {
                        ValidationError::InvalidKeywordRule {
                            pattern: rule.pattern.clone(),
                            detail: e.to_string(),
                        }
                    })?;
                    compiled.push(CompiledRule::Regex {
                        original: rule.pattern.clone(),
                        regex,
                    });
                }
            }
        }
        let ad_hoc = ad_hoc
            .iter()
            .filter(|keyword| !keyword.is_empty())
            .map(|keyword| (keyword.clone(), keyword.to_lowercase()))
            .collect();
        Ok(Self {
            rules: compiled,
            ad_hoc,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty() && self.ad_hoc.is_empty()
    }

    pub fn scan(&self, body: &str) -> ScanHits {
        let lowered = body.to_lowercase();
        let mut hits = ScanHits::default();
        for rule in &self.rules {
            match rule {
                CompiledRule::Substring { original, lowered: pattern } => {
                    if lowered.contains(pattern.as_str()) {
                        hits.from_sets.push(original.clone());
                    }
                }
                CompiledRule::Regex { original, regex } => {
                    if regex.is_match(body) {
                        hits.from_sets.push(original.clone());
                    }
                }
            }
        }
        for (original, pattern) in &self.ad_hoc {
            if lowered.contains(pattern.as_str()) {
                hits.ad_hoc.push(original.clone());
            }
        }
        hits
    }
}
