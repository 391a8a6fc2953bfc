//! Canonical token accounting.
//!
//! Providers name the same counters differently (`prompt_tokens`,
//! `promptTokenCount`, `total_input_tokens`, ...). Every logical field is
//! resolved through [`USAGE_ALIASES`], an ordered list of accepted source
//! keys; the first key present wins. Dotted keys address nested objects.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Logical usage counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UsageField {
    /// Prompt-side tokens.
    Input,
    /// Generated answer tokens.
    Output,
    /// Internal reasoning tokens.
    Reasoning,
    /// Prompt tokens served from cache.
    Cached,
    /// Provider-reported total.
    Total,
}

/// Accepted source keys per canonical field, in priority order.
pub const USAGE_ALIASES: &[(UsageField, &[&str])] = &[
    (
        UsageField::Input,
        &[
            "input_tokens",
            "total_input_tokens",
            "prompt_tokens",
            "promptTokenCount",
            "prompt_token_count",
            "inputTokens",
        ],
    ),
    (
        UsageField::Output,
        &[
            "output_tokens",
            "total_output_tokens",
            "completion_tokens",
            "candidatesTokenCount",
            "candidates_token_count",
            "outputTokens",
        ],
    ),
    (
        UsageField::Reasoning,
        &[
            "reasoning_tokens",
            "total_thought_tokens",
            "thoughtsTokenCount",
            "thoughts_token_count",
            "completion_tokens_details.reasoning_tokens",
            "output_tokens_details.reasoning_tokens",
        ],
    ),
    (
        UsageField::Cached,
        &[
            "cached_tokens",
            "total_cached_tokens",
            "cachedContentTokenCount",
            "cached_content_token_count",
            "prompt_tokens_details.cached_tokens",
            "cache_read_input_tokens",
        ],
    ),
    (
        UsageField::Total,
        &["total_tokens", "totalTokenCount", "total_token_count"],
    ),
];

/// Provider-independent token counts for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Prompt-side tokens.
    pub input_tokens: u64,
    /// Generated answer tokens.
    pub output_tokens: u64,
    /// Internal reasoning tokens.
    pub reasoning_tokens: u64,
    /// Prompt tokens served from cache.
    pub cached_tokens: u64,
    /// Total as reported, or the sum of input, output and reasoning.
    pub total_tokens: u64,
}

impl UsageRecord {
    /// Tokens billed at the output rate.
    pub fn billable_output(&self) -> u64 {
        self.output_tokens + self.reasoning_tokens
    }
}

/// Maps a raw provider usage object into a [`UsageRecord`].
///
/// Missing or malformed counters become zero; this never fails.
pub fn normalize_usage(raw: &Value) -> UsageRecord {
    let mut record = UsageRecord::default();
    let mut total = None;

    for (field, keys) in USAGE_ALIASES {
        let Some(count) = keys.iter().find_map(|key| lookup_count(raw, key)) else {
            continue;
        };
        match field {
            UsageField::Input => record.input_tokens = count,
            UsageField::Output => record.output_tokens = count,
            UsageField::Reasoning => record.reasoning_tokens = count,
            UsageField::Cached => record.cached_tokens = count,
            UsageField::Total => total = Some(count),
        }
    }

    record.total_tokens = total
        .unwrap_or(record.input_tokens + record.output_tokens + record.reasoning_tokens);
    record
}

fn lookup_count(raw: &Value, dotted_key: &str) -> Option<u64> {
    let mut cursor = raw;
    for segment in dotted_key.split('.') {
        cursor = cursor.get(segment)?;
    }
    match cursor {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
