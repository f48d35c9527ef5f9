//! IRCv3 message tags.

use std::fmt;

/// A single IRCv3 message tag.
///
/// `has_value` is tracked separately from `value` because IRCv3 allows
/// value-less tags (`@+typing`) which are distinct from a tag whose value is
/// the empty string (`@+typing=`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tag {
    /// Tag key, e.g. `time` or a vendor-prefixed `+draft/reply`.
    pub key: String,
    /// Tag value, if the wire form had an `=`.
    pub value: Option<String>,
    /// Whether the tag carried an `=` at all (may be true with an empty value).
    pub has_value: bool,
}

impl Tag {
    /// Construct a value-less tag.
    #[must_use]
    pub fn flag(key: impl Into<String>) -> Self {
        Tag { key: key.into(), value: None, has_value: false }
    }

    /// Construct a tag with a value.
    #[must_use]
    pub fn with_value(key: impl Into<String>, value: impl Into<String>) -> Self {
        Tag { key: key.into(), value: Some(value.into()), has_value: true }
    }
}

/// Escape a tag value for the wire per the IRCv3 message-tags spec.
pub fn escape_tag_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            ';' => out.push_str("\\:"),
            ' ' => out.push_str("\\s"),
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out
}

/// Reverse [`escape_tag_value`].
pub fn unescape_tag_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some(':') => out.push(';'),
            Some('s') => out.push(' '),
            Some('\\') => out.push('\\'),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some(other) => out.push(other),
            None => break,
        }
    }
    out
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key)?;
        if self.has_value {
            write!(f, "={}", escape_tag_value(self.value.as_deref().unwrap_or("")))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_round_trips() {
        let raw = "a;b c\\d\r\n";
        let escaped = escape_tag_value(raw);
        assert_eq!(unescape_tag_value(&escaped), raw);
    }

    #[test]
    fn value_less_tag_has_no_equals() {
        let t = Tag::flag("+typing");
        assert_eq!(t.to_string(), "+typing");
    }

    #[test]
    fn empty_value_tag_keeps_equals() {
        let t = Tag::with_value("msgid", "");
        assert_eq!(t.to_string(), "msgid=");
    }
}
