// =============================================================================
// template.rs — PERSONALIZED MESSAGE RENDERING
// =============================================================================
//
// A template is plain text with `{token}` placeholders. Each token is trimmed
// and lower-cased, then looked up on the recipient. Unknown or empty fields
// leave the placeholder exactly as written, braces and all.
//
// Scanning jumps between braces with memchr instead of walking every char,
// which matters when a 100-recipient batch renders the same template 100
// times.
// =============================================================================

use memchr::memchr;

use crate::models::Recipient;

/// Render `template` for one recipient.
pub fn render(template: &str, recipient: &Recipient) -> String {
    render_with(template, |token| recipient.field(token))
}

/// Render with an arbitrary field lookup. The lookup receives the trimmed,
/// lower-cased token.
pub fn render_with<F>(template: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(template.len() + 32);
    let mut cursor = 0;

    while let Some((open, close)) = next_placeholder(template.as_bytes(), cursor) {
        out.push_str(&template[cursor..open]);
        let raw_token = &template[open + 1..close];
        let value = if raw_token.trim().is_empty() {
            None
        } else {
            lookup(&raw_token.trim().to_lowercase())
        };
        match value {
            Some(value) => out.push_str(&value),
            None => out.push_str(&template[open..=close]),
        }
        cursor = close + 1;
    }

    out.push_str(&template[cursor..]);
    out
}

/// Byte offsets of the next `{...}` at or after `from`. A `{` that is
/// followed by another `{` before any `}` is plain text.
fn next_placeholder(bytes: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut open = from + memchr(b'{', &bytes[from..])?;
    loop {
        let close = open + 1 + memchr(b'}', &bytes[open + 1..])?;
        match memchr(b'{', &bytes[open + 1..close]) {
            Some(rel_inner) => open = open + 1 + rel_inner,
            None => return Some((open, close)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn al() -> Recipient {
        let mut attributes = BTreeMap::new();
        attributes.insert("totalspend".to_string(), serde_json::json!(120));
        Recipient {
            id: "cu1".into(),
            name: "Al".into(),
            email: "al@example.com".into(),
            attributes,
        }
    }

    #[test]
    fn test_renders_known_fields() {
        assert_eq!(
            render("Hi {name}, you spent {totalspend}", &al()),
            "Hi Al, you spent 120"
        );
    }

    #[test]
    fn test_unknown_token_stays_literal() {
        assert_eq!(render("Hello {foo}!", &al()), "Hello {foo}!");
    }

    #[test]
    fn test_token_is_trimmed_and_lowercased() {
        assert_eq!(render("Dear { NAME }", &al()), "Dear Al");
    }

    #[test]
    fn test_unbalanced_braces_pass_through() {
        assert_eq!(render("50% off {name", &al()), "50% off {name");
        assert_eq!(render("{{name}}", &al()), "{Al}");
        assert_eq!(render("empty {} here", &al()), "empty {} here");
    }

    #[test]
    fn test_repeated_and_non_ascii() {
        assert_eq!(
            render("¡Hola {name}! {name}, ¿qué tal?", &al()),
            "¡Hola Al! Al, ¿qué tal?"
        );
    }

    #[test]
    fn test_empty_field_stays_literal() {
        let mut recipient = al();
        recipient.name.clear();
        assert_eq!(render("Hi {name}", &recipient), "Hi {name}");
    }
}
