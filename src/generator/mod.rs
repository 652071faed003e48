//! Deterministic offset → domain mapping and configuration fingerprinting.
//!
//! Every offset in `[0, |charset|^variable_length)` maps to exactly one
//! domain: the offset is written as a fixed-width base-`|charset|` numeral
//! (most significant digit first, `charset[0]` as padding) and combined
//! with the constant string according to the pattern type. Distinct offsets
//! therefore always yield distinct variable expansions.

use sha2::{Digest, Sha256};

use crate::models::{DomainGenerationParams, PatternType};

/// Stable fingerprint of the generator space. Campaigns sharing it share
/// one offset sequence, so only the parameters that shape the mapping are
/// hashed — the per-campaign domain budget is not part of the space.
pub fn config_hash(params: &DomainGenerationParams) -> String {
    let mut hasher = Sha256::new();
    hasher.update(params.pattern_type.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(params.variable_length.to_le_bytes());
    hasher.update([0u8]);
    hasher.update(params.character_set.as_bytes());
    hasher.update([0u8]);
    hasher.update(params.constant_string.as_bytes());
    hasher.update([0u8]);
    hasher.update(params.tld_label().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// The variable expansion for an offset: fixed-width base-N numeral over
/// the character set, most significant position first.
fn variable_component(params: &DomainGenerationParams, offset: i64) -> String {
    let charset: Vec<char> = params.character_set.chars().collect();
    let base = charset.len() as i64;
    let width = params.variable_length as usize;
    let mut digits = vec![charset[0]; width];
    let mut remaining = offset;
    for position in (0..width).rev() {
        digits[position] = charset[(remaining % base) as usize];
        remaining /= base;
        if remaining == 0 {
            break;
        }
    }
    digits.into_iter().collect()
}

/// The full domain for an offset. The caller guarantees
/// `0 <= offset < combination_space()`.
pub fn domain_at(params: &DomainGenerationParams, offset: i64) -> String {
    let variable = variable_component(params, offset);
    let constant = &params.constant_string;
    let tld = params.tld_label();
    let label = match params.pattern_type {
        PatternType::Prefix => format!("{variable}{constant}"),
        PatternType::Suffix => format!("{constant}{variable}"),
        PatternType::Both => {
            // Split the expansion across the constant: first half in front,
            // remainder behind. For odd widths the front gets the extra
            // character.
            let chars: Vec<char> = variable.chars().collect();
            let split = chars.len().div_ceil(2);
            let front: String = chars[..split].iter().collect();
            let back: String = chars[split..].iter().collect();
            format!("{front}{constant}{back}")
        }
    };
    format!("{label}.{tld}")
}
