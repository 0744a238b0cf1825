//! Control-channel wire format helpers.
//!
//! Requests and responses are single-line, flat JSON-like objects. The
//! extraction helpers below scan for a literal `"key"` anywhere in the line
//! rather than parsing the structure; a key name reused at a different
//! nesting depth collides with the top-level one. That limitation is part of
//! the observable protocol behavior and is kept on purpose.

/// Longest request line accepted on the control socket; excess is truncated.
pub const MAX_LINE_LEN: usize = 4096;

/// Per-connection inbound buffer bound. Once exceeded, the oldest bytes are
/// discarded so a client that never sends a newline cannot grow memory.
pub const MAX_BUFFER_LEN: usize = MAX_LINE_LEN * 2;

fn find_field_key(line: &str, field: &str) -> Option<usize> {
    let needle = format!("\"{}\"", field);
    line.find(&needle)
}

fn skip_ws(bytes: &[u8], mut pos: usize) -> usize {
    while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
        pos += 1;
    }
    pos
}

/// Extract a string field value from a flat request line.
///
/// Returns `None` when the key is absent or the value is not a quoted string.
/// Handles the usual backslash escapes; unknown escapes keep the escaped
/// character.
pub fn extract_string_field(line: &str, field: &str) -> Option<String> {
    let key_pos = find_field_key(line, field)?;
    let bytes = line.as_bytes();
    let colon = line[key_pos..].find(':')? + key_pos;
    let mut pos = skip_ws(bytes, colon + 1);
    if pos >= bytes.len() || bytes[pos] != b'"' {
        return None;
    }
    pos += 1;

    let mut value = String::new();
    let mut escape = false;
    for ch in line[pos..].chars() {
        if escape {
            match ch {
                'n' => value.push('\n'),
                'r' => value.push('\r'),
                't' => value.push('\t'),
                other => value.push(other),
            }
            escape = false;
            continue;
        }
        match ch {
            '\\' => escape = true,
            '"' => return Some(value),
            other => value.push(other),
        }
    }
    None
}

/// Extract an integer field value from a flat request line.
///
/// Returns `None` when the key is absent, the value is not numeric, or the
/// digits do not fit an `i64` - this runs on unauthenticated socket input.
pub fn extract_int_field(line: &str, field: &str) -> Option<i64> {
    let key_pos = find_field_key(line, field)?;
    let bytes = line.as_bytes();
    let colon = line[key_pos..].find(':')? + key_pos;
    let mut pos = skip_ws(bytes, colon + 1);

    let neg = pos < bytes.len() && bytes[pos] == b'-';
    if neg {
        pos += 1;
    }
    if pos >= bytes.len() || !bytes[pos].is_ascii_digit() {
        return None;
    }

    let mut value: i64 = 0;
    while pos < bytes.len() && bytes[pos].is_ascii_digit() {
        let digit = i64::from(bytes[pos] - b'0');
        value = value.checked_mul(10)?.checked_add(digit)?;
        pos += 1;
    }
    Some(if neg { -value } else { value })
}

/// Extract a boolean field value (`true`/`false` literal) from a request line.
pub fn extract_bool_field(line: &str, field: &str) -> Option<bool> {
    let key_pos = find_field_key(line, field)?;
    let colon = line[key_pos..].find(':')? + key_pos;
    let rest = line[colon + 1..].trim_start();
    if rest.starts_with("true") {
        Some(true)
    } else if rest.starts_with("false") {
        Some(false)
    } else {
        None
    }
}

/// Returns the request `type` field, if any.
pub fn request_type(line: &str) -> Option<String> {
    extract_string_field(line, "type")
}

/// Returns true when the line's `type` equals `expected`.
pub fn is_request(line: &str, expected: &str) -> bool {
    request_type(line).as_deref() == Some(expected)
}

/// Escape a string for embedding in a hand-built JSON response.
pub fn json_escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_field_extraction() {
        let line = r#"{"type":"sysutil.debug.request","note":"hi there"}"#;
        assert_eq!(
            extract_string_field(line, "type").as_deref(),
            Some("sysutil.debug.request")
        );
        assert_eq!(extract_string_field(line, "note").as_deref(), Some("hi there"));
        assert_eq!(extract_string_field(line, "missing"), None);
    }

    #[test]
    fn string_field_escapes() {
        let line = r#"{"message":"a\nb\t\"quoted\""}"#;
        assert_eq!(
            extract_string_field(line, "message").as_deref(),
            Some("a\nb\t\"quoted\"")
        );
    }

    #[test]
    fn string_field_unterminated() {
        assert_eq!(extract_string_field(r#"{"state":"open"#, "state"), None);
    }

    #[test]
    fn int_field_extraction() {
        let line = r#"{"severity": 2,"offset":-17}"#;
        assert_eq!(extract_int_field(line, "severity"), Some(2));
        assert_eq!(extract_int_field(line, "offset"), Some(-17));
        assert_eq!(extract_int_field(line, "missing"), None);
        assert_eq!(extract_int_field(r#"{"severity":"high"}"#, "severity"), None);
    }

    #[test]
    fn int_field_overflow_is_rejected() {
        // Arbitrary producers reach this through the passive sink; a digit
        // run longer than i64 must come back as None, never panic or wrap.
        let line = r#"{"severity":99999999999999999999999999}"#;
        assert_eq!(extract_int_field(line, "severity"), None);
        assert_eq!(
            extract_int_field(r#"{"severity":9223372036854775807}"#, "severity"),
            Some(i64::MAX)
        );
    }

    #[test]
    fn bool_field_extraction() {
        let line = r#"{"debug":true,"verbose": false}"#;
        assert_eq!(extract_bool_field(line, "debug"), Some(true));
        assert_eq!(extract_bool_field(line, "verbose"), Some(false));
        assert_eq!(extract_bool_field(line, "missing"), None);
    }

    #[test]
    fn scan_is_not_structural() {
        // Documented limitation: a nested key shadows nothing, the first
        // occurrence in the line wins.
        let line = r#"{"outer":{"state":"inner"},"state":"top"}"#;
        assert_eq!(extract_string_field(line, "state").as_deref(), Some("inner"));
    }

    #[test]
    fn json_escape_specials() {
        assert_eq!(json_escape("a\"b\\c\nd"), "a\\\"b\\\\c\\nd");
        assert_eq!(json_escape("plain"), "plain");
    }
}
