//! Repetition-loop detection.
//!
//! Degenerate completions come in several flavours: one character repeated
//! until the token budget runs out, an enum value concatenated onto itself,
//! a field name looping with underscores, or the same word over and over.
//! All of them are recognised here by one [`DegenerationDetector`] whose
//! named [`Strategy`] values share a single set of thresholds.
//!
//! Every strategy runs in linear time per candidate period, so even a
//! fully degenerate input near the repair size ceiling is cheap to scan.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A named way of recognising repetition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// One non-whitespace character repeated many times in a row.
    CharRun,
    /// A hyphen/underscore-joined phrase looping (enum or field-name loops).
    PhraseLoop,
    /// Any short substring repeated back to back.
    SubstringLoop,
    /// The same word repeated with only whitespace between occurrences.
    WordLoop,
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Strategy::CharRun => "char_run",
            Strategy::PhraseLoop => "phrase_loop",
            Strategy::SubstringLoop => "substring_loop",
            Strategy::WordLoop => "word_loop",
        };
        f.write_str(name)
    }
}

/// Where a repetition loop sits in the text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Repetition {
    /// Strategy that found the loop.
    pub strategy: Strategy,
    /// Byte offset of the first repeated unit.
    pub start: usize,
    /// Byte length of one repeated unit.
    pub period: usize,
    /// Byte offset one past the end of the repeating region.
    pub end: usize,
}

impl Repetition {
    /// Offset that keeps exactly one copy of the repeated unit.
    pub fn cut_point(&self) -> usize {
        (self.start + self.period).min(self.end)
    }
}

/// Thresholds shared by every strategy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Minimum length of a single-character run.
    pub char_run_min: usize,
    /// Minimum phrase length for [`Strategy::PhraseLoop`].
    pub phrase_min_len: usize,
    /// Maximum phrase length for [`Strategy::PhraseLoop`].
    pub phrase_max_len: usize,
    /// Consecutive repeats required for [`Strategy::PhraseLoop`].
    pub phrase_min_repeats: usize,
    /// Minimum unit length for [`Strategy::SubstringLoop`].
    pub substring_min_len: usize,
    /// Maximum unit length for [`Strategy::SubstringLoop`].
    pub substring_max_len: usize,
    /// Consecutive repeats required for [`Strategy::SubstringLoop`].
    pub substring_min_repeats: usize,
    /// Consecutive repeats required for [`Strategy::WordLoop`].
    pub word_min_repeats: usize,
    /// Size in bytes of the trailing window the tail strategies inspect.
    pub trailing_window: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            char_run_min: 10,
            phrase_min_len: 4,
            phrase_max_len: 40,
            phrase_min_repeats: 3,
            substring_min_len: 8,
            substring_max_len: 30,
            substring_min_repeats: 4,
            word_min_repeats: 4,
            trailing_window: 500,
        }
    }
}

/// Consolidated repetition detector.
#[derive(Debug, Clone, Default)]
pub struct DegenerationDetector {
    config: DetectorConfig,
}

impl DegenerationDetector {
    /// Creates a detector with custom thresholds.
    pub fn new(config: DetectorConfig) -> Self {
        Self { config }
    }

    /// The active thresholds.
    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// First loop found by the classification strategies, in priority
    /// order: character runs and phrase loops in the trailing window, then
    /// substring loops anywhere.
    pub fn detect(&self, text: &str) -> Option<Repetition> {
        let tail = tail_start(text, self.config.trailing_window);
        self.find(Strategy::CharRun, text, tail)
            .or_else(|| self.find(Strategy::PhraseLoop, text, tail))
            .or_else(|| self.find(Strategy::SubstringLoop, text, 0))
    }

    /// Earliest loop found by any strategy anywhere in the text.
    pub fn earliest(&self, text: &str) -> Option<Repetition> {
        [
            Strategy::CharRun,
            Strategy::PhraseLoop,
            Strategy::SubstringLoop,
            Strategy::WordLoop,
        ]
        .into_iter()
        .filter_map(|strategy| self.find(strategy, text, 0))
        .min_by_key(|rep| rep.start)
    }

    /// Runs a single strategy over `text[from..]`. Offsets in the result
    /// are relative to the whole text.
    pub fn find(&self, strategy: Strategy, text: &str, from: usize) -> Option<Repetition> {
        let from = floor_char_boundary(text, from);
        let found = match strategy {
            Strategy::CharRun => self.char_run(text, from),
            Strategy::PhraseLoop => self.phrase_loop(text, from),
            Strategy::SubstringLoop => self.substring_loop(text, from),
            Strategy::WordLoop => self.word_loop(text, from),
        }?;
        Some(align(text, found))
    }

    fn char_run(&self, text: &str, from: usize) -> Option<Repetition> {
        let min = self.config.char_run_min.max(2);
        let mut run: Option<(char, usize, usize)> = None;

        for (offset, ch) in text[from..].char_indices() {
            let pos = from + offset;
            match run {
                Some((c, start, count)) if c == ch => {
                    run = Some((c, start, count + 1));
                    continue;
                }
                Some((c, start, count)) if count >= min => {
                    return Some(Repetition {
                        strategy: Strategy::CharRun,
                        start,
                        period: c.len_utf8(),
                        end: pos,
                    });
                }
                _ => {}
            }
            run = (!ch.is_whitespace()).then_some((ch, pos, 1));
        }

        match run {
            Some((c, start, count)) if count >= min => Some(Repetition {
                strategy: Strategy::CharRun,
                start,
                period: c.len_utf8(),
                end: text.len(),
            }),
            _ => None,
        }
    }

    fn phrase_loop(&self, text: &str, from: usize) -> Option<Repetition> {
        let bytes = &text.as_bytes()[from..];
        let repeats = self.config.phrase_min_repeats.max(2);
        let mut best: Option<Repetition> = None;

        for period in self.config.phrase_min_len..=self.config.phrase_max_len {
            // The last repeat may lack its trailing separator.
            let min_matches = ((repeats - 1) * period).saturating_sub(1);
            let hit = first_periodic_run(bytes, period, min_matches, |region| {
                is_phrase_unit(&region[..period])
            });
            if let Some((start, end)) = hit {
                let candidate = Repetition {
                    strategy: Strategy::PhraseLoop,
                    start: from + start,
                    period,
                    end: from + end,
                };
                if best.map_or(true, |b| candidate.start < b.start) {
                    best = Some(candidate);
                }
            }
        }
        best
    }

    fn substring_loop(&self, text: &str, from: usize) -> Option<Repetition> {
        let bytes = &text.as_bytes()[from..];
        let repeats = self.config.substring_min_repeats.max(2);
        let mut best: Option<Repetition> = None;

        for period in self.config.substring_min_len..=self.config.substring_max_len {
            let min_matches = (repeats - 1) * period;
            let hit = first_periodic_run(bytes, period, min_matches, |region| {
                !is_json_filler(region)
            });
            if let Some((start, end)) = hit {
                let candidate = Repetition {
                    strategy: Strategy::SubstringLoop,
                    start: from + start,
                    period,
                    end: from + end,
                };
                if best.map_or(true, |b| candidate.start < b.start) {
                    best = Some(candidate);
                }
            }
        }
        best
    }

    fn word_loop(&self, text: &str, from: usize) -> Option<Repetition> {
        let min = self.config.word_min_repeats.max(2);
        let mut prev: Option<(&str, usize)> = None;
        let mut first_start = 0;
        let mut last_end = 0;
        let mut count = 0usize;
        let mut period = 0usize;

        for (start, word) in words(&text[from..]) {
            let start = from + start;
            let end = start + word.len();
            let continues = match prev {
                Some((w, prev_end)) => {
                    w.eq_ignore_ascii_case(word)
                        && text[prev_end..start].chars().all(char::is_whitespace)
                }
                None => false,
            };

            if continues {
                count += 1;
                if count == 2 {
                    period = start - first_start;
                }
            } else {
                if count >= min {
                    break;
                }
                first_start = start;
                count = 1;
            }
            last_end = end;
            prev = Some((word, end));
        }

        (count >= min).then_some(Repetition {
            strategy: Strategy::WordLoop,
            start: first_start,
            period,
            end: last_end,
        })
    }
}

/// First byte offset of the trailing window, on a char boundary.
pub(crate) fn tail_start(text: &str, window: usize) -> usize {
    let mut start = text.len().saturating_sub(window);
    while start < text.len() && !text.is_char_boundary(start) {
        start += 1;
    }
    start
}

fn floor_char_boundary(text: &str, mut pos: usize) -> usize {
    pos = pos.min(text.len());
    while pos > 0 && !text.is_char_boundary(pos) {
        pos -= 1;
    }
    pos
}

fn ceil_char_boundary(text: &str, mut pos: usize) -> usize {
    pos = pos.min(text.len());
    while pos < text.len() && !text.is_char_boundary(pos) {
        pos += 1;
    }
    pos
}

// Byte-level scans can land inside a multi-byte character.
fn align(text: &str, rep: Repetition) -> Repetition {
    let start = floor_char_boundary(text, rep.start);
    let end = ceil_char_boundary(text, rep.end);
    let cut = ceil_char_boundary(text, start + rep.period);
    Repetition {
        start,
        end,
        period: cut - start,
        ..rep
    }
}

/// Finds the first region of `bytes` that is periodic with `period` over at
/// least `min_matches` positions and that `accept` approves. Returns the
/// region's `(start, end)`.
fn first_periodic_run(
    bytes: &[u8],
    period: usize,
    min_matches: usize,
    accept: impl Fn(&[u8]) -> bool,
) -> Option<(usize, usize)> {
    if period == 0 || bytes.len() <= period {
        return None;
    }
    let min_matches = min_matches.max(1);
    let mut run = 0usize;

    for j in 0..=(bytes.len() - period) {
        let matches = j + period < bytes.len() && bytes[j] == bytes[j + period];
        if matches {
            run += 1;
            continue;
        }
        if run >= min_matches {
            let start = j - run;
            let end = j + period;
            if accept(&bytes[start..end]) {
                return Some((start, end));
            }
        }
        run = 0;
    }
    None
}

fn is_phrase_unit(unit: &[u8]) -> bool {
    let in_class = unit
        .iter()
        .all(|b| b.is_ascii_alphanumeric() || *b == b'-' || *b == b'_');
    let has_separator = unit.iter().any(|b| *b == b'-' || *b == b'_');
    let has_word = unit.iter().any(u8::is_ascii_alphabetic);
    in_class && has_separator && has_word
}

/// `true` when a region is nothing but JSON structure and literals, e.g. a
/// long run of `0, 0, ` or `null, null, ` or `"", "", `.
fn is_json_filler(region: &[u8]) -> bool {
    let text = String::from_utf8_lossy(region);
    let stripped = text
        .replace("null", "")
        .replace("true", "")
        .replace("false", "");
    stripped.bytes().all(|b| {
        b.is_ascii_whitespace()
            || b.is_ascii_digit()
            || matches!(b, b'{' | b'}' | b'[' | b']' | b',' | b':' | b'"' | b'.' | b'-' | b'+')
    })
}

fn words(text: &str) -> impl Iterator<Item = (usize, &str)> + '_ {
    let mut chars = text.char_indices().peekable();
    std::iter::from_fn(move || loop {
        let (start, ch) = chars.next()?;
        if !ch.is_alphabetic() {
            continue;
        }
        let mut end = start + ch.len_utf8();
        while let Some(&(pos, next)) = chars.peek() {
            if !next.is_alphabetic() {
                break;
            }
            end = pos + next.len_utf8();
            chars.next();
        }
        if end - start >= 2 {
            return Some((start, &text[start..end]));
        }
    })
}
