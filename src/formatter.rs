//! Reply formatting and phone extraction
//!
//! Turns raw lookup replies into the two strings each output row carries: a
//! comma-joined set of extracted phone numbers and a one-line human summary.
//! Also owns key validation and the fixed sentinel strings used for rows that
//! never produce a real reply.

use crate::types::{FieldValue, Record};
use regex::Regex;
use std::collections::BTreeSet;

/// Summary/extraction sentinel for rows skipped after the balance ran out
pub const EXHAUSTED_SENTINEL: &str = "balance exhausted";
/// Sentinel for rows whose key fails validation
pub const INVALID_KEY_SENTINEL: &str = "not a valid tax id";
/// Extraction sentinel for matched rows with no phone numbers anywhere
pub const NO_PHONES_SENTINEL: &str = "no phones found";
/// Summary sentinel for calls that succeeded but matched nothing
pub const NO_MATCHES_SENTINEL: &str = "no matches";
/// Sentinel for rows hit by a transient lookup failure
pub const LOOKUP_ERROR_SENTINEL: &str = "lookup error";

/// How many list items a summary shows before eliding the rest
const LIST_PREVIEW: usize = 3;

/// Phone-shaped token: optional +, leading 7 or 8, then 10+ phone characters
const PHONE_PATTERN: &str = r"\+?[78][\d\s\-()]{10,}";

/// Formats lookup replies into per-row output strings.
pub struct ResultFormatter {
    phone_re: Regex,
}

impl ResultFormatter {
    /// Build the formatter, compiling the phone pattern.
    pub fn new() -> crate::error::Result<Self> {
        let phone_re = Regex::new(PHONE_PATTERN)
            .map_err(|e| crate::error::Error::Other(format!("phone pattern: {e}")))?;
        Ok(Self { phone_re })
    }

    /// True if `key` looks like a valid lookup key: digits only, 10 or 12
    /// characters. Rows failing this never reach the network.
    pub fn is_valid_key(key: &str) -> bool {
        let key = key.trim();
        (key.len() == 10 || key.len() == 12) && key.chars().all(|c| c.is_ascii_digit())
    }

    /// Pull every phone number out of a set of matched records.
    ///
    /// Two passes per field: the phone pattern over every rendered value, and
    /// a field-name heuristic (names containing "phone" or its Russian
    /// equivalent) that accepts values the pattern alone would miss. Results
    /// are normalized to digits (with a leading `+` kept), deduplicated in
    /// sorted order and comma-joined. Empty string when nothing was found.
    pub fn extract_phones(&self, records: &[Record]) -> String {
        let mut phones = BTreeSet::new();
        for record in records {
            for (name, value) in &record.fields {
                let looks_like_phone_field = {
                    let lower = name.to_lowercase();
                    lower.contains("phone") || lower.contains("телефон")
                };
                for text in value_texts(value) {
                    for m in self.phone_re.find_iter(text) {
                        if let Some(p) = normalize_phone(m.as_str()) {
                            phones.insert(p);
                        }
                    }
                    if looks_like_phone_field {
                        if let Some(p) = normalize_phone(text) {
                            phones.insert(p);
                        }
                    }
                }
            }
        }
        phones.into_iter().collect::<Vec<_>>().join(", ")
    }

    /// Render matched records as a one-line summary.
    ///
    /// Each record becomes `source: field=value | field=value`; list values
    /// show their first few items with a `+N more` tail; records are joined
    /// with ` || `.
    pub fn summarize(&self, records: &[Record]) -> String {
        if records.is_empty() {
            return NO_MATCHES_SENTINEL.to_string();
        }
        records
            .iter()
            .map(summarize_record)
            .collect::<Vec<_>>()
            .join(" || ")
    }
}

fn summarize_record(record: &Record) -> String {
    let fields = record
        .fields
        .iter()
        .filter(|(_, value)| !value.is_empty())
        .map(|(name, value)| format!("{name}={}", render_value(value)))
        .collect::<Vec<_>>()
        .join(" | ");
    if fields.is_empty() {
        record.source.clone()
    } else {
        format!("{}: {}", record.source, fields)
    }
}

fn render_value(value: &FieldValue) -> String {
    match value {
        FieldValue::Text(s) => s.clone(),
        FieldValue::List(items) => {
            let mut shown = items
                .iter()
                .take(LIST_PREVIEW)
                .cloned()
                .collect::<Vec<_>>()
                .join(", ");
            if items.len() > LIST_PREVIEW {
                shown.push_str(&format!(", +{} more", items.len() - LIST_PREVIEW));
            }
            shown
        }
    }
}

fn value_texts(value: &FieldValue) -> Vec<&str> {
    match value {
        FieldValue::Text(s) => vec![s.as_str()],
        FieldValue::List(items) => items.iter().map(String::as_str).collect(),
    }
}

/// Strip separators from a phone candidate, keeping digits and a leading `+`.
/// Rejects anything left with fewer than 10 digits.
fn normalize_phone(raw: &str) -> Option<String> {
    let mut out = String::new();
    for (i, c) in raw.trim().chars().enumerate() {
        if c == '+' && i == 0 {
            out.push(c);
        } else if c.is_ascii_digit() {
            out.push(c);
        } else if !matches!(c, ' ' | '-' | '(' | ')') {
            return None;
        }
    }
    let digits = out.chars().filter(|c| c.is_ascii_digit()).count();
    if digits >= 10 { Some(out) } else { None }
}
