//! RPL_ISUPPORT (005) line construction.

/// Accumulates `key[=value]` ISUPPORT tokens and renders them as one or more
/// 005 parameter lists, each terminated by the standard trailing note.
#[derive(Debug, Default, Clone)]
pub struct IsupportBuilder {
    tokens: Vec<String>,
}

const MAX_TOKENS_PER_LINE: usize = 13;
const TRAILING_NOTE: &str = "are supported by this server";

impl IsupportBuilder {
    /// Start an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a value-less token (e.g. `BOUNCER`).
    pub fn flag(&mut self, key: impl Into<String>) -> &mut Self {
        self.tokens.push(key.into());
        self
    }

    /// Add a `key=value` token.
    pub fn kv(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.tokens.push(format!("{}={}", key.into(), value.into()));
        self
    }

    /// Add a raw, already-formatted token string.
    pub fn raw(&mut self, token: impl Into<String>) -> &mut Self {
        self.tokens.push(token.into());
        self
    }

    /// Render into one `params` vec per 005 line (the nick goes in params[0]
    /// by convention; callers prepend it).
    #[must_use]
    pub fn build_lines(&self) -> Vec<Vec<String>> {
        if self.tokens.is_empty() {
            return Vec::new();
        }
        self.tokens
            .chunks(MAX_TOKENS_PER_LINE)
            .map(|chunk| {
                let mut params: Vec<String> = chunk.to_vec();
                params.push(TRAILING_NOTE.to_string());
                params
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_token_single_line() {
        let mut b = IsupportBuilder::new();
        b.flag("BOUNCER");
        let lines = b.build_lines();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0], vec!["BOUNCER", TRAILING_NOTE]);
    }

    #[test]
    fn chunks_long_token_lists() {
        let mut b = IsupportBuilder::new();
        for i in 0..20 {
            b.kv(format!("TOK{i}"), "1");
        }
        let lines = b.build_lines();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].len(), MAX_TOKENS_PER_LINE + 1);
    }
}
