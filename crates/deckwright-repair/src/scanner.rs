//! String- and escape-aware bracket scanning.
//!
//! The same scan drives garbage-suffix detection, prefix extraction and the
//! closer synthesis used by truncation repair, so all three agree on where
//! strings and containers begin and end.

/// State of a text after a bracket-depth scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanState {
    /// Offset of the first `{` or `[`.
    pub start: Option<usize>,
    /// Offset one past the closer where depth last returned to zero.
    pub last_balanced_end: Option<usize>,
    /// Containers still open at the end of the text, outermost first.
    pub open: Vec<u8>,
    /// The text ends inside a string literal.
    pub in_string: bool,
    /// The text ends right after a backslash inside a string.
    pub dangling_escape: bool,
}

impl ScanState {
    /// `true` once depth has returned to zero at least once.
    pub fn ever_balanced(&self) -> bool {
        self.last_balanced_end.is_some()
    }

    /// Innermost open container, if any.
    pub fn innermost(&self) -> Option<u8> {
        self.open.last().copied()
    }
}

/// Scans `text` from its first `{` or `[`.
///
/// Strings before the first container are still tracked so that a bare
/// unterminated string is reported as such. Closers that do not match any
/// open container are ignored.
pub fn scan(text: &str) -> ScanState {
    let bytes = text.as_bytes();
    let start = bytes.iter().position(|b| *b == b'{' || *b == b'[');
    let mut state = ScanState {
        start,
        ..ScanState::default()
    };

    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate() {
        if state.in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                state.in_string = false;
            }
            continue;
        }

        match b {
            b'"' => state.in_string = true,
            b'{' | b'[' => state.open.push(b),
            b'}' | b']' if !state.open.is_empty() => {
                state.open.pop();
                if state.open.is_empty() {
                    state.last_balanced_end = Some(i + 1);
                }
            }
            _ => {}
        }
    }

    state.dangling_escape = state.in_string && escaped;
    state
}

/// Appends exactly the closers `text` is missing: an open string is
/// terminated (dropping a dangling backslash), a trailing `,` is removed, a
/// trailing `:` receives `null`, and open containers are closed innermost
/// first.
pub fn close_open_structures(text: &str) -> String {
    let state = scan(text);
    let mut out = String::with_capacity(text.len() + state.open.len() + 2);
    out.push_str(text);

    if state.in_string {
        if state.dangling_escape {
            out.pop();
        }
        out.push('"');
    }

    for opener in state.open.iter().rev() {
        trim_dangling_separator(&mut out);
        out.push(if *opener == b'{' { '}' } else { ']' });
    }
    if state.open.is_empty() {
        trim_dangling_separator(&mut out);
    }
    out
}

fn trim_dangling_separator(out: &mut String) {
    let trimmed_len = out.trim_end().len();
    out.truncate(trimmed_len);
    if out.ends_with(',') {
        out.pop();
    } else if out.ends_with(':') {
        out.push_str(" null");
    }
}

/// Strips Markdown code fences and any prose before the first container.
pub fn strip_preamble(text: &str) -> &str {
    let mut body = text.trim();
    if let Some(rest) = body.strip_prefix("```") {
        // Drop the info string (`json`, `JSON`, ...) on the fence line.
        body = rest.split_once('\n').map_or("", |(_, after)| after);
        if let Some(idx) = body.rfind("```") {
            body = &body[..idx];
        }
    }
    match scan(body).start {
        Some(start) => body[start..].trim_end(),
        None => body.trim(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_balanced_with_suffix() {
        let state = scan(r#"{"a":1,"b":2}, """#);
        assert_eq!(state.start, Some(0));
        assert_eq!(state.last_balanced_end, Some(13));
        assert!(state.open.is_empty());
        assert!(!state.in_string);
    }

    #[test]
    fn test_scan_ignores_brackets_in_strings() {
        let state = scan(r#"{"a": "}]{[", "b": "\"}"}"#);
        assert_eq!(state.last_balanced_end, Some(25));
    }

    #[test]
    fn test_scan_truncated() {
        let state = scan(r#"{"a": [1, {"b": "hel"#);
        assert!(!state.ever_balanced());
        assert_eq!(state.open, b"{[{".to_vec());
        assert!(state.in_string);
        assert_eq!(state.innermost(), Some(b'{'));
    }

    #[test]
    fn test_close_unterminated_string() {
        assert_eq!(close_open_structures(r#"{"a": "hello"#), r#"{"a": "hello"}"#);
    }

    #[test]
    fn test_close_drops_dangling_escape() {
        assert_eq!(close_open_structures(r#"["a\"#), r#"["a"]"#);
    }

    #[test]
    fn test_close_trailing_comma_and_colon() {
        assert_eq!(close_open_structures(r#"[1, 2, "#), "[1, 2]");
        assert_eq!(close_open_structures(r#"{"a": 1, "b":"#), r#"{"a": 1, "b": null}"#);
        assert_eq!(close_open_structures(r#"{"a": [1, {"b": 2},"#), r#"{"a": [1, {"b": 2}]}"#);
    }

    #[test]
    fn test_close_leaves_complete_text_alone() {
        assert_eq!(close_open_structures(r#"{"a": 1}"#), r#"{"a": 1}"#);
    }

    #[test]
    fn test_strip_preamble_and_fences() {
        assert_eq!(strip_preamble("Here you go:\n{\"a\": 1}"), "{\"a\": 1}");
        assert_eq!(strip_preamble("```json\n[1, 2]\n```"), "[1, 2]");
        assert_eq!(strip_preamble("```json\n{\"a\": "), "{\"a\":");
    }
}
