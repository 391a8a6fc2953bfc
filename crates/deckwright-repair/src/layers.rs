//! The individual repair layers.
//!
//! Each layer takes the current candidate text and either produces a parsed
//! value or passes a (possibly cleaned) candidate on to the next layer.
//! Layers never fail loudly.

use crate::detector::DegenerationDetector;
use crate::scanner::{close_open_structures, scan, strip_preamble};
use crate::shape::ShapeHints;
use deckwright_core::excerpt;
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;
use tracing::{debug, warn};

const DISCARDED_EXCERPT_CHARS: usize = 200;

/// Result of one layer.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Step {
    Parsed(Value),
    Pass(String),
}

/// A regex rewrite of a dangling fragment at the end of truncated output.
struct FragmentFix {
    name: &'static str,
    pattern: Regex,
    replacement: &'static str,
    outside_string_only: bool,
}

impl FragmentFix {
    fn new(name: &'static str, pattern: &str, replacement: &'static str) -> Option<Self> {
        Some(Self {
            name,
            pattern: Regex::new(pattern).ok()?,
            replacement,
            outside_string_only: false,
        })
    }

    fn outside_strings(mut self) -> Self {
        self.outside_string_only = true;
        self
    }

    fn apply(&self, text: &str) -> Option<String> {
        if self.outside_string_only && scan(text).in_string {
            return None;
        }
        if !self.pattern.is_match(text) {
            return None;
        }
        Some(self.pattern.replace(text, self.replacement).into_owned())
    }
}

// Order matters: each fix is tried alone on the stripped text, and then all
// of them are applied cumulatively.
static FRAGMENT_FIXES: LazyLock<Vec<FragmentFix>> = LazyLock::new(|| {
    [
        FragmentFix::new("dangling_key", r#"([\{,])\s*"(?:[^"\\]|\\.)*\s*$"#, "$1"),
        FragmentFix::new("dangling_colon", r#",?\s*"(?:[^"\\]|\\.)*"\s*:\s*$"#, ""),
        FragmentFix::new("partial_escape", r"\\(?:u[0-9a-fA-F]{0,3})?$", ""),
        FragmentFix::new("trailing_comma", r",\s*$", ""),
        FragmentFix::new("trailing_open", r",?\s*[\{\[]\s*$", ""),
        FragmentFix::new("partial_true", r"([:\[,]\s*)t(?:r(?:u)?)?$", "${1}true")
            .map(FragmentFix::outside_strings),
        FragmentFix::new("partial_false", r"([:\[,]\s*)f(?:a(?:l(?:s)?)?)?$", "${1}false")
            .map(FragmentFix::outside_strings),
        FragmentFix::new("partial_null", r"([:\[,]\s*)n(?:u(?:l)?)?$", "${1}null")
            .map(FragmentFix::outside_strings),
        FragmentFix::new("partial_number", r"(\d)(?:\.|[eE][+-]?)$", "$1")
            .map(FragmentFix::outside_strings),
    ]
    .into_iter()
    .flatten()
    .collect()
});

static CLEANUPS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r",(?:\s*,)+", ","),
        (r#",\s*""\s*([}\]])"#, "$1"),
        (r",\s*([}\]])", "$1"),
    ]
    .into_iter()
    .filter_map(|(pattern, replacement)| Regex::new(pattern).ok().map(|re| (re, replacement)))
    .collect()
});

/// Parses `text` after appending its missing closers.
pub(crate) fn parse_closed(text: &str) -> Option<Value> {
    serde_json::from_str(&close_open_structures(text)).ok()
}

/// Keeps the longest balanced prefix and discards the rest.
pub(crate) fn prefix_extraction(candidate: &str) -> Step {
    let state = scan(candidate);
    let (Some(start), Some(end)) = (state.start, state.last_balanced_end) else {
        return Step::Pass(candidate.to_string());
    };
    if start >= end {
        return Step::Pass(candidate.to_string());
    }

    match serde_json::from_str(&candidate[start..end]) {
        Ok(value) => {
            let discarded = &candidate[end..];
            if !discarded.trim().is_empty() {
                warn!(
                    discarded_bytes = discarded.len(),
                    discarded = %excerpt(discarded, DISCARDED_EXCERPT_CHARS),
                    "Discarded text after the balanced JSON prefix"
                );
            }
            Step::Parsed(value)
        }
        Err(_) => Step::Pass(candidate.to_string()),
    }
}

/// Cuts the text where the earliest repetition loop starts, keeping one copy
/// of the repeated unit, then closes and parses what is left. Illegal enum
/// values in the salvaged value are replaced with a best guess.
pub(crate) fn degeneration_salvage(
    candidate: &str,
    detector: &DegenerationDetector,
    shape: &ShapeHints,
) -> Step {
    let cut = match detector.earliest(candidate) {
        Some(rep) => {
            debug!(
                strategy = %rep.strategy,
                start = rep.start,
                period = rep.period,
                "Cutting at repetition loop"
            );
            rep.cut_point()
        }
        None => candidate.len(),
    };
    let truncated = strip_preamble(&candidate[..cut]);

    let parsed = match parse_closed(truncated) {
        Some(value) => Some(value),
        None => match prefix_extraction(truncated) {
            Step::Parsed(value) => Some(value),
            Step::Pass(_) => None,
        },
    };

    match parsed {
        Some(mut value) => {
            let fixed = shape.correct_enums(&mut value);
            if fixed > 0 {
                debug!(fixed, "Replaced degenerate enum values");
            }
            Step::Parsed(value)
        }
        None => Step::Pass(truncated.to_string()),
    }
}

/// Strips preamble, then tries closers alone, each fragment fix alone, and
/// finally all fragment fixes together.
pub(crate) fn truncation_repair(candidate: &str) -> Step {
    let base = strip_preamble(candidate);
    if let Some(value) = parse_closed(base) {
        return Step::Parsed(value);
    }

    let mut cumulative = base.to_string();
    for fix in FRAGMENT_FIXES.iter() {
        if let Some(fixed) = fix.apply(base) {
            if let Some(value) = parse_closed(&fixed) {
                debug!(fix = fix.name, "Fragment fix closed the value");
                return Step::Parsed(value);
            }
        }
        if let Some(fixed) = fix.apply(&cumulative) {
            cumulative = fixed;
        }
    }

    match parse_closed(&cumulative) {
        Some(value) => Step::Parsed(value),
        None => Step::Pass(cumulative),
    }
}

/// Collapses junk idioms: repeated commas, empty-string artifacts and
/// trailing commas before a closer.
pub(crate) fn semantic_cleanup(candidate: &str) -> Step {
    let mut text = strip_preamble(candidate).to_string();
    for (pattern, replacement) in CLEANUPS.iter() {
        text = pattern.replace_all(&text, *replacement).into_owned();
    }
    match parse_closed(&text) {
        Some(value) => Step::Parsed(value),
        None => Step::Pass(text),
    }
}

/// Decodes a double-encoded payload.
pub(crate) fn unescape(candidate: &str) -> Step {
    let trimmed = candidate.trim();
    let inner = serde_json::from_str::<String>(trimmed)
        .unwrap_or_else(|_| manual_unescape(trimmed));
    match serde_json::from_str(inner.trim()) {
        Ok(value) => Step::Parsed(value),
        Err(_) => Step::Pass(inner),
    }
}

// For an outer string that is itself truncated and so not valid JSON.
fn manual_unescape(text: &str) -> String {
    let body = text.strip_prefix('"').unwrap_or(text);
    let body = body.strip_suffix('"').unwrap_or(body);
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

/// Parses a flat array of strings and wraps it into the expected root.
pub(crate) fn string_array_wrap(candidate: &str, shape: &ShapeHints) -> Step {
    match serde_json::from_str::<Value>(candidate.trim()) {
        Ok(Value::Array(items)) if items.iter().all(Value::is_string) => {
            Step::Parsed(shape.wrap_strings(items))
        }
        _ => Step::Pass(candidate.to_string()),
    }
}

/// Reshapes a well-formed value of the wrong shape.
pub(crate) fn shape_coercion(candidate: &str, shape: &ShapeHints) -> Step {
    let coerced = serde_json::from_str::<Value>(candidate.trim())
        .ok()
        .and_then(|value| shape.coerce(value));
    match coerced {
        Some(value) => Step::Parsed(value),
        None => Step::Pass(candidate.to_string()),
    }
}
