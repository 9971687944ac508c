//! Structured-response parsing: recover JSON from free-form provider text.
//!
//! ## Why is repair necessary?
//!
//! Even when asked for "only JSON", vision models regularly return:
//!
//! - the object wrapped in ` ```json ... ``` ` fences, or preceded by
//!   "Here are the answers:"
//! - a BOM or zero-width characters copied from their training data
//! - `// question 37 is unclear` comments inside the object
//! - a list of objects without commas between them
//! - trailing commas, single-quoted strings, Python `None`
//!
//! [`repair`] applies five cheap text rules that fix these quirks without
//! touching content; [`parse`] then tries progressively more permissive
//! parses. Every rule is idempotent, so repairing already-clean text is a
//! no-op and `parse(repair(text)) == parse(text)`.
//!
//! The parser never changes the *shape* of the data: if a repair loses an
//! answer, the validator downstream reports the wrong count loudly.

use crate::error::ParseError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::debug;

/// Maximum number of characters of the raw reply kept in a [`ParseError`].
pub const RAW_EXCERPT_CHARS: usize = 500;

/// Parse a provider reply into JSON, repairing it as needed.
///
/// Attempts (in order):
/// 1. strict parse of the [`repair`]ed text
/// 2. strict parse after converting single-quoted strings to double-quoted
/// 3. lenient parse: bare keys and bare words quoted, Python/JS literals
///    mapped to JSON
pub fn parse(raw: &str) -> Result<Value, ParseError> {
    let repaired = repair(raw);

    let err = match serde_json::from_str::<Value>(&repaired) {
        Ok(v) => return Ok(v),
        Err(e) => e,
    };
    debug!("Strict parse failed ({}); normalising quotes", err);

    let double_quoted = normalise_quotes(&repaired);
    let err = match serde_json::from_str::<Value>(&double_quoted) {
        Ok(v) => {
            debug!("Reply parsed after quote normalisation");
            return Ok(v);
        }
        Err(e) => e,
    };

    let lenient = lenient_tokens(&double_quoted);
    match serde_json::from_str::<Value>(&lenient) {
        Ok(v) => {
            debug!("Reply parsed by lenient pass");
            Ok(v)
        }
        Err(last) => {
            let last = if last.line() == 0 { err } else { last };
            Err(ParseError {
                message: last.to_string(),
                line: last.line(),
                column: last.column(),
                raw_excerpt: excerpt(raw),
            })
        }
    }
}

/// Apply the text repair rules, in order:
///
/// 1. Strip BOM / zero-width characters and code fences
/// 2. Extract the first balanced JSON value (adjacent objects become an array)
/// 3. Strip `//` and `/* */` comments
/// 4. Insert missing commas between adjacent objects
/// 5. Remove trailing commas before `]` / `}`
pub fn repair(raw: &str) -> String {
    let s = remove_invisible_chars(raw);
    let s = strip_code_fences(&s);
    let s = extract_json(&s);
    let s = strip_comments(&s);
    let s = insert_missing_commas(&s);
    remove_trailing_commas(&s)
}

fn excerpt(raw: &str) -> String {
    let mut chars = raw.chars();
    let head: String = chars.by_ref().take(RAW_EXCERPT_CHARS).collect();
    if chars.next().is_some() {
        format!("{head}…")
    } else {
        head
    }
}

// ── Rule 1: Strip invisible characters and fences ────────────────────────

fn remove_invisible_chars(input: &str) -> String {
    input
        .chars()
        .filter(|c| !matches!(c, '\u{feff}' | '\u{200b}' | '\u{200c}' | '\u{200d}' | '\u{2060}'))
        .collect()
}

static RE_OPEN_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*```[A-Za-z]*[ \t]*\r?\n?").unwrap());
static RE_CLOSE_FENCE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\r?\n?```\s*$").unwrap());

fn strip_code_fences(input: &str) -> String {
    let s = RE_OPEN_FENCE.replace(input, "");
    RE_CLOSE_FENCE.replace(&s, "").to_string()
}

// ── Rule 2: Extract the first balanced value ─────────────────────────────

/// Extract the first balanced JSON value.
///
/// A `[` that opens before the first `{` and encloses it (or a `[` with no
/// `{` anywhere) yields the whole balanced array, so bare arrays keep their
/// shape. Otherwise extraction starts at the first `{`; further objects that
/// follow, separated only by whitespace, commas or comments, are kept and the
/// run is wrapped in `[...]`. Unbalanced input is returned from the opening
/// bracket to the end so the parse error points at the real problem.
fn extract_json(input: &str) -> String {
    let brace = input.find('{');
    let bracket = input.find('[');

    if let Some(open) = bracket.filter(|&b| brace.is_none_or(|o| b < o)) {
        match balanced_end(input, open) {
            Some(end) if brace.is_none_or(|o| o < end) => {
                return input[open..end].to_string();
            }
            // A bracket in the prose that closes before the object starts.
            Some(_) => {}
            None if brace.is_none() => return input[open..].trim_end().to_string(),
            None => {}
        }
    }

    let Some(start) = brace else {
        return input.trim().to_string();
    };
    let Some(first_end) = balanced_end(input, start) else {
        return input[start..].trim_end().to_string();
    };

    let bytes = input.as_bytes();
    let mut end = first_end;
    let mut objects = 1;
    loop {
        let next = skip_separators(bytes, end);
        if bytes.get(next) != Some(&b'{') {
            break;
        }
        match balanced_end(input, next) {
            Some(e) => {
                end = e;
                objects += 1;
            }
            None => break,
        }
    }

    if objects == 1 {
        input[start..first_end].to_string()
    } else {
        format!("[{}]", &input[start..end])
    }
}

/// Index of the first byte at or after `from` that is not whitespace, a
/// comma or part of a comment.
fn skip_separators(bytes: &[u8], from: usize) -> usize {
    let mut i = from;
    while i < bytes.len() {
        match bytes[i] {
            b',' => i += 1,
            b if b.is_ascii_whitespace() => i += 1,
            b'/' if bytes.get(i + 1) == Some(&b'/') => {
                i = bytes[i..]
                    .iter()
                    .position(|&b| b == b'\n')
                    .map_or(bytes.len(), |p| i + p);
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i = find_block_end(bytes, i + 2) + 1;
            }
            _ => break,
        }
    }
    i
}

/// Byte index just past the bracket that closes the one at `start`.
///
/// Brackets inside string literals and comments are ignored.
fn balanced_end(s: &str, start: usize) -> Option<usize> {
    let bytes = s.as_bytes();
    let mut depth = 0usize;
    let mut i = start;
    while i < bytes.len() {
        match bytes[i] {
            q @ (b'"' | b'\'') => i = skip_string(bytes, i, q),
            b'/' if bytes.get(i + 1) == Some(&b'/') => {
                i = bytes[i..]
                    .iter()
                    .position(|&b| b == b'\n')
                    .map_or(bytes.len(), |p| i + p);
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i = find_block_end(bytes, i + 2);
            }
            b'{' | b'[' => depth += 1,
            b'}' | b']' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

/// Index of the closing quote of the string opened at `open` (or the last byte).
fn skip_string(bytes: &[u8], open: usize, quote: u8) -> usize {
    let mut i = open + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b if b == quote => return i,
            _ => i += 1,
        }
    }
    bytes.len().saturating_sub(1)
}

/// Index of the `/` closing a block comment whose body starts at `from`.
fn find_block_end(bytes: &[u8], from: usize) -> usize {
    bytes[from.min(bytes.len())..]
        .windows(2)
        .position(|w| w == b"*/")
        .map_or(bytes.len().saturating_sub(1), |p| from + p + 1)
}

// ── Rule 3: Strip comments ───────────────────────────────────────────────

fn strip_comments(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            q @ (b'"' | b'\'') => {
                let end = skip_string(bytes, i, q);
                out.extend_from_slice(&bytes[i..=end]);
                i = end + 1;
            }
            b'/' if bytes.get(i + 1) == Some(&b'/') => {
                i = bytes[i..]
                    .iter()
                    .position(|&b| b == b'\n')
                    .map_or(bytes.len(), |p| i + p);
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i = find_block_end(bytes, i + 2) + 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    // Only ASCII bytes were removed, so the remainder is still UTF-8.
    String::from_utf8(out).unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned())
}

// ── Rules 4 and 5: Comma fixes outside strings ───────────────────────────

/// Copy `input`, letting `on_byte` decide what happens to every byte that is
/// not inside a string literal. `on_byte` returns `false` to drop the byte.
fn rewrite_outside_strings(
    input: &str,
    mut on_byte: impl FnMut(&[u8], usize, &mut Vec<u8>) -> bool,
) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len() + 8);
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            q @ (b'"' | b'\'') => {
                let end = skip_string(bytes, i, q);
                out.extend_from_slice(&bytes[i..=end]);
                i = end + 1;
            }
            b => {
                if on_byte(bytes, i, &mut out) {
                    out.push(b);
                }
                i += 1;
            }
        }
    }
    // Only ASCII bytes were added or removed.
    String::from_utf8(out).unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned())
}

/// First non-whitespace byte after `i`.
fn next_significant(bytes: &[u8], i: usize) -> Option<u8> {
    bytes[i + 1..].iter().copied().find(|b| !b.is_ascii_whitespace())
}

/// `}` followed (after whitespace) by `{` gets a comma.
fn insert_missing_commas(input: &str) -> String {
    rewrite_outside_strings(input, |bytes, i, out| {
        if bytes[i] == b'}' && next_significant(bytes, i) == Some(b'{') {
            out.extend_from_slice(b"},");
            return false;
        }
        true
    })
}

/// A comma followed (after whitespace) by `]` or `}` is dropped.
fn remove_trailing_commas(input: &str) -> String {
    rewrite_outside_strings(input, |bytes, i, _| {
        !(bytes[i] == b',' && matches!(next_significant(bytes, i), Some(b']' | b'}')))
    })
}

// ── Fallback: single → double quotes ─────────────────────────────────────

/// Rewrite `'single quoted'` strings as `"double quoted"` ones, escaping any
/// double quotes they contain. Double-quoted strings are copied verbatim.
fn normalise_quotes(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' => {
                out.push('"');
                while let Some(c) = chars.next() {
                    out.push(c);
                    match c {
                        '\\' => {
                            if let Some(n) = chars.next() {
                                out.push(n);
                            }
                        }
                        '"' => break,
                        _ => {}
                    }
                }
            }
            '\'' => {
                out.push('"');
                while let Some(c) = chars.next() {
                    match c {
                        '\\' if chars.peek() == Some(&'\'') => {
                            chars.next();
                            out.push('\'');
                        }
                        '\'' => break,
                        '"' => out.push_str("\\\""),
                        c => out.push(c),
                    }
                }
                out.push('"');
            }
            c => out.push(c),
        }
    }
    out
}

// ── Fallback: lenient tokens ─────────────────────────────────────────────

/// Quote bare identifiers outside strings.
///
/// `None`/`null`/`undefined`/`NaN` become `null`, `True`/`False` become
/// booleans, identifiers followed by `:` become keys and any other bare word
/// (an unquoted letter such as `B`) becomes a string.
fn lenient_tokens(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + 16);
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '"' {
            out.push(c);
            i += 1;
            while i < chars.len() {
                out.push(chars[i]);
                if chars[i] == '\\' && i + 1 < chars.len() {
                    out.push(chars[i + 1]);
                    i += 2;
                    continue;
                }
                i += 1;
                if chars[i - 1] == '"' {
                    break;
                }
            }
            continue;
        }
        if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect();
            let is_key = chars[i..]
                .iter()
                .find(|c| !c.is_whitespace())
                .is_some_and(|&c| c == ':');
            if is_key {
                out.push_str(&format!("\"{word}\""));
            } else {
                match word.as_str() {
                    "None" | "null" | "NULL" | "Null" | "undefined" | "NaN" => out.push_str("null"),
                    "True" | "true" => out.push_str("true"),
                    "False" | "false" => out.push_str("false"),
                    _ => out.push_str(&format!("\"{word}\"")),
                }
            }
            continue;
        }
        out.push(c);
        i += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_strip_fences() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```\n{\"a\":1}\n```  \n"), "{\"a\":1}");
        assert_eq!(strip_code_fences("{\"a\":1}"), "{\"a\":1}");
    }

    #[test]
    fn test_remove_invisible_chars() {
        assert_eq!(remove_invisible_chars("\u{feff}{\u{200b}}"), "{}");
    }

    #[test]
    fn test_extract_ignores_prose() {
        let raw = "Here are the answers: {\"a\": \"}\"} Hope this helps!";
        assert_eq!(extract_json(raw), "{\"a\": \"}\"}");
    }

    #[test]
    fn test_extract_bare_array() {
        assert_eq!(extract_json("Result: [\"A\", null] done"), "[\"A\", null]");
    }

    #[test]
    fn test_extract_wraps_adjacent_objects() {
        assert_eq!(extract_json("{\"a\":1}\n{\"a\":2}"), "[{\"a\":1}\n{\"a\":2}]");
    }

    #[test]
    fn test_extract_unbalanced_keeps_tail() {
        assert_eq!(extract_json("x {\"a\": [1, 2"), "{\"a\": [1, 2");
    }

    #[test]
    fn test_extract_single_element_array_keeps_shape() {
        let raw = "[{\"pregunta\": 1, \"respuesta\": \"A\"}]";
        assert_eq!(extract_json(raw), raw);
    }

    #[test]
    fn test_extract_skips_prose_brackets() {
        let raw = "Answers [see below]: {\"a\": 1}";
        assert_eq!(extract_json(raw), "{\"a\": 1}");
    }

    #[test]
    fn test_extract_object_run_across_comments() {
        let raw = "{\"a\":1} // faint\n{\"a\":2} /* x */ {\"a\":3}";
        assert_eq!(extract_json(raw), format!("[{raw}]"));
    }

    #[test]
    fn test_strip_comments_respects_strings() {
        let input = "{\"url\": \"http://x\", // note\n\"b\": 1 /* block */}";
        assert_eq!(strip_comments(input), "{\"url\": \"http://x\", \n\"b\": 1 }");
    }

    #[test]
    fn test_insert_missing_commas() {
        assert_eq!(insert_missing_commas("[{\"a\":1}\n  {\"a\":2}]"), "[{\"a\":1},\n  {\"a\":2}]");
    }

    #[test]
    fn test_remove_trailing_commas() {
        assert_eq!(remove_trailing_commas("{\"a\": [1, 2, ], }"), "{\"a\": [1, 2 ] }");
    }

    #[test]
    fn comma_fixes_leave_strings_alone() {
        let input = "{\"nota\": \"ver } { hoja\", \"b\": \"1, ]\"}";
        assert_eq!(insert_missing_commas(input), input);
        assert_eq!(remove_trailing_commas(input), input);
    }

    #[test]
    fn test_normalise_quotes() {
        assert_eq!(
            normalise_quotes("{'a': 'say \"hi\"', \"b\": \"it's\"}"),
            "{\"a\": \"say \\\"hi\\\"\", \"b\": \"it's\"}"
        );
    }

    #[test]
    fn test_lenient_tokens() {
        assert_eq!(
            lenient_tokens("{pregunta: 1, respuesta: B, ok: True, x: None}"),
            "{\"pregunta\": 1, \"respuesta\": \"B\", \"ok\": true, \"x\": null}"
        );
    }

    #[test]
    fn parses_fenced_reply() {
        let raw = "```json\n{\"respuestas\":[{\"pregunta\":1,\"respuesta\":\"a\"}]}\n```";
        let v = parse(raw).unwrap();
        assert_eq!(v, json!({"respuestas": [{"pregunta": 1, "respuesta": "a"}]}));
    }

    #[test]
    fn adjacent_objects_become_array() {
        let v = parse("{\"a\":1}\n{\"a\":2}").unwrap();
        assert_eq!(v, json!([{"a": 1}, {"a": 2}]));
    }

    #[test]
    fn missing_commas_inside_array_are_fixed() {
        let raw = "{\"respuestas\": [\n{\"pregunta\": 1, \"respuesta\": \"A\"}\n{\"pregunta\": 2, \"respuesta\": null}\n]}";
        let v = parse(raw).unwrap();
        assert_eq!(v["respuestas"].as_array().map(Vec::len), Some(2));
    }

    #[test]
    fn single_object_array_stays_an_array() {
        let v = parse("[{\"pregunta\": 1, \"respuesta\": \"A\"}]").unwrap();
        assert_eq!(v, json!([{"pregunta": 1, "respuesta": "A"}]));
    }

    #[test]
    fn comment_inside_bare_array_keeps_every_item() {
        let items: Vec<String> = (1..=100)
            .map(|q| {
                let item = format!("{{\"pregunta\": {q}, \"respuesta\": \"A\"}}");
                if q == 37 {
                    format!("{item}, // faint mark\n")
                } else if q < 100 {
                    format!("{item}, ")
                } else {
                    item
                }
            })
            .collect();
        let raw = format!("[{}]", items.concat());
        let v = parse(&raw).unwrap();
        assert_eq!(v.as_array().map(Vec::len), Some(100));
        assert_eq!(v[99]["pregunta"], json!(100));
    }

    #[test]
    fn braces_inside_notes_survive_repair() {
        let v = parse("{\"nota\": \"ver } { hoja\", \"respuestas\": [\"A\",]}").unwrap();
        assert_eq!(v, json!({"nota": "ver } { hoja", "respuestas": ["A"]}));
    }

    #[test]
    fn python_style_reply_parses() {
        let v = parse("{'respuestas': ['A', None, 'c',]}").unwrap();
        assert_eq!(v, json!({"respuestas": ["A", null, "c"]}));
    }

    #[test]
    fn unquoted_letters_parse_leniently() {
        let v = parse("{respuestas: [A, B, null]}").unwrap();
        assert_eq!(v, json!({"respuestas": ["A", "B", null]}));
    }

    #[test]
    fn hopeless_reply_errors_with_excerpt() {
        let raw = format!("I could not read the sheet. {}", "x".repeat(600));
        let err = parse(&raw).unwrap_err();
        assert!(err.raw_excerpt.starts_with("I could not read"));
        assert!(err.raw_excerpt.chars().count() <= RAW_EXCERPT_CHARS + 1);
    }

    #[test]
    fn truncated_reply_errors_with_location() {
        let err = parse("{\"respuestas\": [{\"pregunta\": 1, \"respuesta\": \"A\"},").unwrap_err();
        assert!(err.line >= 1);
        assert!(!err.message.is_empty());
    }

    #[test]
    fn repair_is_idempotent() {
        let samples = [
            "```json\n{\"a\": [1, 2,], // c\n}\n```",
            "{\"a\":1}\n{\"a\":2}",
            "noise {'k': 'v'} noise",
            "[{\"x\": 1}, {\"x\": 2}]",
            "\u{feff}{\"respuestas\": [\"A\", null]}",
        ];
        for s in samples {
            let once = repair(s);
            assert_eq!(repair(&once), once, "not idempotent for {s:?}");
            assert_eq!(parse(&once).ok(), parse(s).ok(), "parse differs for {s:?}");
        }
    }
}
