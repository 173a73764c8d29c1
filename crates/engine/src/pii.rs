//! Sensitive value detection and masking. Nothing leaves the engine.

use std::sync::OnceLock;

use regex::Regex;

fn email_like() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,}$").expect("email pattern"))
}

fn ssn_like() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\d{3}-\d{2}-\d{4}$").expect("ssn pattern"))
}

fn ipv4_like() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d{1,3}\.){3}\d{1,3}$").expect("ipv4 pattern"))
}

/// Kind of sensitive value recognized in a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PiiKind {
    Email,
    Ssn,
    CreditCard,
    Ipv4,
}

/// Classify a cell, trimming surrounding whitespace first.
pub fn detect(value: &str) -> Option<PiiKind> {
    let t = value.trim();
    if t.is_empty() {
        return None;
    }
    if email_like().is_match(t) {
        Some(PiiKind::Email)
    } else if ssn_like().is_match(t) {
        Some(PiiKind::Ssn)
    } else if is_ipv4(t) {
        Some(PiiKind::Ipv4)
    } else if looks_like_card(t) {
        Some(PiiKind::CreditCard)
    } else {
        None
    }
}

/// Masked replacement for a cell, or `None` when it holds nothing sensitive.
pub fn redact(value: &str) -> Option<String> {
    let kind = detect(value)?;
    let t = value.trim();
    Some(match kind {
        PiiKind::Email => mask_email(t),
        PiiKind::Ssn => "XXX-XX-XXXX".to_string(),
        PiiKind::Ipv4 => "0.0.0.0".to_string(),
        PiiKind::CreditCard => mask_card(t),
    })
}

fn is_ipv4(t: &str) -> bool {
    ipv4_like().is_match(t) && t.split('.').all(|octet| octet.parse::<u8>().is_ok())
}

/// 13 to 16 digits (spaces and dashes allowed) passing the Luhn check.
fn looks_like_card(t: &str) -> bool {
    if !t.chars().all(|c| c.is_ascii_digit() || c == ' ' || c == '-') {
        return false;
    }
    let digits: Vec<u32> = t.chars().filter_map(|c| c.to_digit(10)).collect();
    (13..=16).contains(&digits.len()) && luhn(&digits)
}

fn luhn(digits: &[u32]) -> bool {
    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(i, &d)| {
            if i % 2 == 1 {
                let doubled = d * 2;
                doubled / 10 + doubled % 10
            } else {
                d
            }
        })
        .sum();
    sum % 10 == 0
}

/// `jane@example.com` -> `j***@example.com`
fn mask_email(t: &str) -> String {
    match t.split_once('@') {
        Some((local, domain)) => match local.chars().next() {
            Some(first) => format!("{first}***@{domain}"),
            None => "[EMAIL_REDACTED]".to_string(),
        },
        None => "[EMAIL_REDACTED]".to_string(),
    }
}

/// Keep the last four digits.
fn mask_card(t: &str) -> String {
    let digits: String = t.chars().filter(|c| c.is_ascii_digit()).collect();
    let last4 = &digits[digits.len().saturating_sub(4)..];
    format!("****-****-****-{last4}")
}
