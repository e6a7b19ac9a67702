//! One-way hashing and display masking for identifiers.
//!
//! Nothing here is encryption: hashes cannot be reversed and masks discard
//! most of the input.

use std::{fmt, str::FromStr};

use {
    hmac::{Hmac, Mac},
    sha2::Sha256,
};

use crate::error::KeyError;

type HmacSha256 = Hmac<Sha256>;

/// Deterministic keyed digest of `value`, as lowercase hex.
///
/// HMAC-SHA256 keyed by `salt`; equal inputs and salt always give the same
/// digest, so the result can be stored and queried for equality lookups.
pub fn hash_identifier(value: &str, salt: &[u8]) -> Result<String, KeyError> {
    if salt.is_empty() {
        return Err(KeyError::Parameter("hash salt must not be empty".into()));
    }
    let mut mac = HmacSha256::new_from_slice(salt)
        .map_err(|_| KeyError::Parameter("invalid hash salt".into()))?;
    mac.update(value.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskType {
    Email,
    Phone,
    Ssn,
    Generic,
}

impl MaskType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Phone => "phone",
            Self::Ssn => "ssn",
            Self::Generic => "generic",
        }
    }
}

impl fmt::Display for MaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MaskType {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email" => Ok(Self::Email),
            "phone" => Ok(Self::Phone),
            "ssn" => Ok(Self::Ssn),
            "generic" => Ok(Self::Generic),
            other => Err(KeyError::Parameter(format!("unknown mask type: {other}"))),
        }
    }
}

/// Mask `value` for display according to `mask_type`.
pub fn mask_for_display(value: &str, mask_type: MaskType) -> String {
    match mask_type {
        MaskType::Email => mask_email(value),
        MaskType::Phone => mask_phone(value),
        MaskType::Ssn => mask_ssn(value),
        MaskType::Generic => mask_generic(value),
    }
}

fn mask_email(value: &str) -> String {
    let Some((local, domain)) = value.rsplit_once('@') else {
        return mask_generic(value);
    };
    let visible: String = local.chars().take(2).collect();
    format!("{visible}***@{domain}")
}

fn mask_phone(value: &str) -> String {
    let digits: Vec<char> = value.chars().filter(char::is_ascii_digit).collect();
    if digits.len() < 7 {
        return "****".to_string();
    }
    let head: String = digits[..3].iter().collect();
    let tail: String = digits[digits.len() - 4..].iter().collect();
    format!("{head}****{tail}")
}

fn mask_ssn(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() < 4 {
        return "***-**-****".to_string();
    }
    let last4: String = chars[chars.len() - 4..].iter().collect();
    format!("***-**-{last4}")
}

fn mask_generic(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    let len = chars.len();
    if len <= 4 {
        return "****".to_string();
    }
    let mut out = String::with_capacity(value.len());
    out.extend(&chars[..2]);
    out.extend(std::iter::repeat_n('*', len - 4));
    out.extend(&chars[len - 2..]);
    out
}
