//! Text-level repair of reassembled record fragments.
//!
//! The producer writes free-text messages without escaping them, so a message may contain
//! ampersands, generic type signatures (`List<Foo>`), anonymous-function names
//! (`<lambda_3f2a>`) and other angle-bracket tokens. `sanitize` turns everything that is not
//! one of the producer's structural tags into escaped text so the fragment parses as XML.
//!
//! Rules run in this order:
//! 1. raw `&` becomes `&amp;` (existing entity references are left alone)
//! 2. `<>` becomes `&lt;&gt;`
//! 3. `<lambda_[a-z0-9]+>` becomes `&lt;lambda&gt;`
//! 4. any `<...>` token not mentioning a structural tag name is escaped, applied twice so
//!    tokens uncovered by the first pass (`<Foo<Bar>>`) are caught as well
//! 5. `<class ` becomes `&lt;class `

/// Tag names the producer emits. A bracketed token that contains any of these words anywhere
/// inside it is left untouched by rule 4.
pub const STRUCTURAL_TAGS: [&str; 10] = [
    "record", "date", "millis", "sequence", "logger", "level", "class", "method", "thread",
    "message",
];

const PREDEFINED_ENTITIES: [&str; 5] = ["amp", "lt", "gt", "quot", "apos"];
const MAX_ENTITY_LEN: usize = 12;
const LAMBDA_PREFIX: &str = "<lambda_";
const LAMBDA_PLACEHOLDER: &str = "&lt;lambda&gt;";

pub fn sanitize(fragment: &str) -> String {
    let text = escape_ampersands(fragment);
    let text = text.replace("<>", "&lt;&gt;");
    let text = collapse_lambdas(&text);
    let text = escape_unknown_tags(&text);
    let text = escape_unknown_tags(&text);
    text.replace("<class ", "&lt;class ")
}

fn escape_ampersands(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for (idx, ch) in input.char_indices() {
        if ch == '&' && !starts_entity(&input[idx..]) {
            out.push_str("&amp;");
        } else {
            out.push(ch);
        }
    }
    out
}

/// `text` starts with `&`.
fn starts_entity(text: &str) -> bool {
    let Some(end) = text
        .bytes()
        .skip(1)
        .take(MAX_ENTITY_LEN)
        .position(|b| b == b';')
    else {
        return false;
    };
    let name = &text[1..1 + end];

    if PREDEFINED_ENTITIES.contains(&name) {
        return true;
    }
    if let Some(hex) = name.strip_prefix("#x").or_else(|| name.strip_prefix("#X")) {
        return !hex.is_empty() && hex.chars().all(|c| c.is_ascii_hexdigit());
    }
    if let Some(dec) = name.strip_prefix('#') {
        return !dec.is_empty() && dec.chars().all(|c| c.is_ascii_digit());
    }
    false
}

fn collapse_lambdas(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut cursor = 0usize;
    let mut search = 0usize;

    while let Some(offset) = input[search..].find(LAMBDA_PREFIX) {
        let start = search + offset;
        let id_start = start + LAMBDA_PREFIX.len();
        let id_len = input[id_start..]
            .bytes()
            .take_while(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
            .count();
        let close = id_start + id_len;

        if id_len > 0 && input[close..].starts_with('>') {
            out.push_str(&input[cursor..start]);
            out.push_str(LAMBDA_PLACEHOLDER);
            cursor = close + 1;
            search = close + 1;
        } else {
            search = start + 1;
        }
    }

    out.push_str(&input[cursor..]);
    out
}

fn escape_unknown_tags(input: &str) -> String {
    let mut out = String::with_capacity(input.len() + 16);
    let mut cursor = 0usize;
    let mut search = 0usize;

    while let Some(offset) = input[search..].find('<') {
        let start = search + offset;
        match unknown_tag_end(input, start) {
            Some(end) => {
                out.push_str(&input[cursor..start]);
                out.push_str("&lt;");
                out.push_str(&input[start + 1..end]);
                out.push_str("&gt;");
                cursor = end + 1;
                search = end + 1;
            }
            None => search = start + 1,
        }
    }

    out.push_str(&input[cursor..]);
    out
}

/// Finds the `>` closing the shortest token that starts at `start`, holds at least one
/// character, stays on one line and never contains a structural tag name.
fn unknown_tag_end(input: &str, start: usize) -> Option<usize> {
    let mut pos = start + 1;
    let mut consumed = false;

    loop {
        let rest = &input[pos..];
        if consumed && rest.starts_with('>') {
            return Some(pos);
        }
        if STRUCTURAL_TAGS.iter().any(|tag| rest.starts_with(tag)) {
            return None;
        }
        let ch = rest.chars().next()?;
        if is_line_break(ch) {
            return None;
        }
        pos += ch.len_utf8();
        consumed = true;
    }
}

fn is_line_break(ch: char) -> bool {
    matches!(ch, '\n' | '\r' | '\u{85}' | '\u{2028}' | '\u{2029}')
}
