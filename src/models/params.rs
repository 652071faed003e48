//! Per-phase campaign parameter objects and their business-rule validation.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::ValidationError;
use crate::models::CampaignPhase;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    Prefix,
    Suffix,
    Both,
}

impl PatternType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prefix => "prefix",
            Self::Suffix => "suffix",
            Self::Both => "both",
        }
    }
}

/// Parameters driving the domain generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainGenerationParams {
    pub pattern_type: PatternType,
    pub variable_length: u32,
    pub character_set: String,
    pub constant_string: String,
    /// Stored without the leading dot; `validate` accepts either form.
    pub tld: String,
    pub num_domains_to_generate: i64,
}

impl DomainGenerationParams {
    /// Total number of distinct variable expansions this configuration spans.
    /// Saturates at `i64::MAX` for spaces too large to enumerate.
    pub fn combination_space(&self) -> i64 {
        let base = self.character_set.chars().count() as i64;
        match base.checked_pow(self.variable_length) {
            Some(n) => n,
            None => i64::MAX,
        }
    }

    /// The TLD without a leading dot.
    pub fn tld_label(&self) -> &str {
        self.tld.strip_prefix('.').unwrap_or(&self.tld)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.character_set.is_empty() {
            return Err(ValidationError::EmptyCharacterSet);
        }
        let mut seen = std::collections::HashSet::new();
        for c in self.character_set.chars() {
            if !(c.is_ascii_alphanumeric() || c == '-') {
                return Err(ValidationError::InvalidCharacterSet { found: c });
            }
            if !seen.insert(c) {
                return Err(ValidationError::DuplicateCharacter { found: c });
            }
        }
        if self.variable_length < 1 {
            return Err(ValidationError::VariableLengthOutOfRange {
                got: self.variable_length,
            });
        }
        if !is_valid_label_component(&self.constant_string) {
            return Err(ValidationError::InvalidConstantString {
                value: self.constant_string.clone(),
            });
        }
        let tld = self.tld_label();
        if tld.len() < 2 || !tld.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(ValidationError::InvalidTld {
                value: self.tld.clone(),
            });
        }
        if self.num_domains_to_generate <= 0 {
            return Err(ValidationError::NonPositiveDomainCount {
                got: self.num_domains_to_generate,
            });
        }
        let available = self.combination_space();
        if self.num_domains_to_generate > available {
            return Err(ValidationError::DomainCountExceedsSpace {
                requested: self.num_domains_to_generate,
                available,
            });
        }
        Ok(())
    }
}

/// A valid (possibly partial) DNS label: alphanumeric plus interior hyphens.
/// Empty is allowed — the variable component supplies the rest of the label.
fn is_valid_label_component(s: &str) -> bool {
    s.len() <= 63
        && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        && !s.starts_with('-')
        && !s.ends_with('-')
}

/// Parameters for the DNS validation phase. The source of domains is the
/// campaign's own generation phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DnsValidationParams {
    pub persona_ids: Vec<Uuid>,
    #[serde(default)]
    pub rotation_interval_seconds: Option<u64>,
    #[serde(default)]
    pub processing_speed_per_minute: Option<u32>,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub retry_attempts: Option<u32>,
}

impl DnsValidationParams {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.persona_ids.is_empty() {
            return Err(ValidationError::NoPersonas {
                phase: CampaignPhase::DnsValidation,
            });
        }
        if self.batch_size == Some(0) {
            return Err(ValidationError::NonPositiveBatchSize);
        }
        Ok(())
    }
}

/// Parameters for the HTTP + keyword validation phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpKeywordParams {
    pub persona_ids: Vec<Uuid>,
    #[serde(default)]
    pub keyword_set_ids: Vec<Uuid>,
    #[serde(default)]
    pub ad_hoc_keywords: Vec<String>,
    #[serde(default)]
    pub proxy_pool_id: Option<Uuid>,
    #[serde(default)]
    pub target_http_ports: Vec<u16>,
    #[serde(default)]
    pub rotation_interval_seconds: Option<u64>,
    #[serde(default)]
    pub processing_speed_per_minute: Option<u32>,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub retry_attempts: Option<u32>,
    /// Resume cursor, maintained by the batch processor.
    #[serde(default)]
    pub last_processed_domain_name: Option<String>,
}

impl HttpKeywordParams {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.persona_ids.is_empty() {
            return Err(ValidationError::NoPersonas {
                phase: CampaignPhase::HttpKeywordValidation,
            });
        }
        if self.batch_size == Some(0) {
            return Err(ValidationError::NonPositiveBatchSize);
        }
        Ok(())
    }

    /// Ports to probe, defaulting to plain HTTPS then HTTP.
    pub fn ports(&self) -> Vec<u16> {
        if self.target_http_ports.is_empty() {
            vec![443, 80]
        } else {
            self.target_http_ports.clone()
        }
    }
}

/// Tagged union persisted per `(campaign, phase)` in the params table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum PhaseParams {
    DomainGeneration(DomainGenerationParams),
    DnsValidation(DnsValidationParams),
    HttpKeywordValidation(HttpKeywordParams),
}

impl PhaseParams {
    pub fn phase(&self) -> CampaignPhase {
        match self {
            Self::DomainGeneration(_) => CampaignPhase::DomainGeneration,
            Self::DnsValidation(_) => CampaignPhase::DnsValidation,
            Self::HttpKeywordValidation(_) => CampaignPhase::HttpKeywordValidation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generation_params() -> DomainGenerationParams {
        DomainGenerationParams {
            pattern_type: PatternType::Prefix,
            variable_length: 2,
            character_set: "ab".to_string(),
            constant_string: "test".to_string(),
            tld: ".com".to_string(),
            num_domains_to_generate: 4,
        }
    }

    #[test]
    fn valid_generation_params_pass() {
        assert!(generation_params().validate().is_ok());
    }

    #[test]
    fn combination_space_is_charset_pow_length() {
        let p = generation_params();
        assert_eq!(p.combination_space(), 4);
    }

    #[test]
    fn combination_space_saturates_on_overflow() {
        let mut p = generation_params();
        p.character_set = "abcdefghijklmnopqrstuvwxyz0123456789".to_string();
        p.variable_length = 40;
        assert_eq!(p.combination_space(), i64::MAX);
    }

    #[test]
    fn empty_character_set_rejected() {
        let mut p = generation_params();
        p.character_set = String::new();
        assert!(matches!(
            p.validate(),
            Err(ValidationError::EmptyCharacterSet)
        ));
    }

    #[test]
    fn character_set_with_invalid_char_rejected() {
        let mut p = generation_params();
        p.character_set = "ab_".to_string();
        assert!(matches!(
            p.validate(),
            Err(ValidationError::InvalidCharacterSet { found: '_' })
        ));
    }

    #[test]
    fn duplicate_character_rejected() {
        let mut p = generation_params();
        p.character_set = "aba".to_string();
        assert!(matches!(
            p.validate(),
            Err(ValidationError::DuplicateCharacter { found: 'a' })
        ));
    }

    #[test]
    fn count_beyond_space_rejected() {
        let mut p = generation_params();
        p.num_domains_to_generate = 5;
        assert!(matches!(
            p.validate(),
            Err(ValidationError::DomainCountExceedsSpace {
                requested: 5,
                available: 4
            })
        ));
    }

    #[test]
    fn tld_accepts_with_and_without_dot() {
        let mut p = generation_params();
        p.tld = "com".to_string();
        assert!(p.validate().is_ok());
        assert_eq!(p.tld_label(), "com");
        p.tld = ".io".to_string();
        assert!(p.validate().is_ok());
        assert_eq!(p.tld_label(), "io");
    }

    #[test]
    fn single_letter_tld_rejected() {
        let mut p = generation_params();
        p.tld = "x".to_string();
        assert!(matches!(p.validate(), Err(ValidationError::InvalidTld { .. })));
    }

    #[test]
    fn hyphen_edges_rejected_in_constant_string() {
        let mut p = generation_params();
        p.constant_string = "-test".to_string();
        assert!(matches!(
            p.validate(),
            Err(ValidationError::InvalidConstantString { .. })
        ));
    }

    #[test]
    fn dns_params_require_personas() {
        let p = DnsValidationParams {
            persona_ids: vec![],
            rotation_interval_seconds: None,
            processing_speed_per_minute: None,
            batch_size: None,
            retry_attempts: None,
        };
        assert!(matches!(
            p.validate(),
            Err(ValidationError::NoPersonas {
                phase: CampaignPhase::DnsValidation
            })
        ));
    }

    #[test]
    fn http_params_default_ports_prefer_https() {
        let p = HttpKeywordParams {
            persona_ids: vec![Uuid::new_v4()],
            keyword_set_ids: vec![],
            ad_hoc_keywords: vec![],
            proxy_pool_id: None,
            target_http_ports: vec![],
            rotation_interval_seconds: None,
            processing_speed_per_minute: None,
            batch_size: None,
            retry_attempts: None,
            last_processed_domain_name: None,
        };
        assert_eq!(p.ports(), vec![443, 80]);
    }

    #[test]
    fn phase_params_tag_roundtrip() {
        let p = PhaseParams::DomainGeneration(generation_params());
        let json = serde_json::to_string(&p).unwrap();
        assert!(json.contains("\"phase\":\"domain_generation\""));
        let back: PhaseParams = serde_json::from_str(&json).unwrap();
        assert_eq!(back.phase(), CampaignPhase::DomainGeneration);
        assert_eq!(back, p);
    }
}
