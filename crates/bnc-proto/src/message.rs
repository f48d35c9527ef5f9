//! IRC message parsing and serialization.
//!
//! A message is the generic `{tags, prefix, command, params}` tuple IRC
//! lines decompose into. Unlike a typed-command protocol library, `bncd`
//! mostly forwards lines verbatim between upstream and attached clients, so
//! the command and params stay as raw strings rather than a closed enum —
//! the bouncer only inspects a handful of commands (NICK, CAP, PING, the
//! registration numerics) and forwards everything else unexamined.

use std::fmt;
use std::str::FromStr;

use nom::branch::alt;
use nom::bytes::complete::{tag, take_while, take_while1};
use nom::character::complete::char as nom_char;
use nom::combinator::{map, opt};
use nom::multi::separated_list0;
use nom::sequence::preceded;
use nom::IResult;

use crate::error::ProtocolError;
use crate::prefix::Prefix;
use crate::response::Response;
use crate::tags::{escape_tag_value, unescape_tag_value, Tag};

/// A parsed IRC line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IrcMessage {
    /// IRCv3 message tags, if the line carried any.
    pub tags: Option<Vec<Tag>>,
    /// Source of the message (`:nick!user@host` or `:server`).
    pub prefix: Option<Prefix>,
    /// Command name or three-digit numeric, always upper-cased for names.
    pub command: String,
    /// Positional parameters, including the trailing parameter (if any)
    /// with its leading `:` stripped.
    pub params: Vec<String>,
}

impl IrcMessage {
    /// Build a message with no tags or prefix.
    #[must_use]
    pub fn new(command: impl Into<String>, params: Vec<String>) -> Self {
        IrcMessage { tags: None, prefix: None, command: command.into(), params }
    }

    /// Build a message from a source and a numeric reply.
    #[must_use]
    pub fn numeric(prefix: Prefix, response: Response, params: Vec<String>) -> Self {
        IrcMessage {
            tags: None,
            prefix: Some(prefix),
            command: format!("{response}"),
            params,
        }
    }

    /// Attach or replace a tag.
    #[must_use]
    pub fn with_tag(mut self, tag: Tag) -> Self {
        self.tags.get_or_insert_with(Vec::new).retain(|t| t.key != tag.key);
        self.tags.get_or_insert_with(Vec::new).push(tag);
        self
    }

    /// Look up a tag's value by key.
    #[must_use]
    pub fn tag_value(&self, key: &str) -> Option<&str> {
        self.tags.as_ref()?.iter().find(|t| t.key == key).and_then(|t| t.value.as_deref())
    }

    /// Remove a tag by key, if present.
    pub fn remove_tag(&mut self, key: &str) {
        if let Some(tags) = &mut self.tags {
            tags.retain(|t| t.key != key);
        }
    }

    /// The nickname in the prefix, if any.
    #[must_use]
    pub fn source_nick(&self) -> Option<&str> {
        self.prefix.as_ref().and_then(Prefix::nick)
    }
}

// ---------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------

fn parse_tags(input: &str) -> IResult<&str, Vec<Tag>> {
    map(
        preceded(
            nom_char('@'),
            separated_list0(nom_char(';'), parse_one_tag),
        ),
        |tags| tags,
    )(input)
}

fn parse_one_tag(input: &str) -> IResult<&str, Tag> {
    let (input, key) = take_while1(|c: char| c != '=' && c != ';' && c != ' ')(input)?;
    let (input, value) = opt(preceded(nom_char('='), take_while(|c: char| c != ';' && c != ' ')))(input)?;
    let has_value = value.is_some();
    Ok((
        input,
        Tag {
            key: key.to_string(),
            value: value.map(unescape_tag_value),
            has_value,
        },
    ))
}

fn parse_prefix(input: &str) -> IResult<&str, Prefix> {
    map(preceded(nom_char(':'), take_while1(|c: char| c != ' ')), Prefix::parse)(input)
}

fn spaces1(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c == ' ')(input)
}

fn parse_command(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c != ' ')(input)
}

fn parse_middle_param(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c != ' ' && c != '\r' && c != '\n')(input)
}

fn parse_trailing_param(input: &str) -> IResult<&str, &str> {
    preceded(nom_char(':'), take_while(|c: char| c != '\r' && c != '\n'))(input)
}

fn parse_params(mut input: &str) -> IResult<&str, Vec<String>> {
    let mut params = Vec::new();
    loop {
        input = input.trim_start_matches(' ');
        if input.is_empty() {
            break;
        }
        if let Ok((rest, trailing)) = parse_trailing_param(input) {
            params.push(trailing.to_string());
            input = rest;
            break;
        }
        match parse_middle_param(input) {
            Ok((rest, middle)) => {
                params.push(middle.to_string());
                input = rest;
            }
            Err(_) => break,
        }
    }
    Ok((input, params))
}

fn parse_line(input: &str) -> IResult<&str, IrcMessage> {
    let (input, tags) = opt(parse_tags)(input)?;
    let (input, _) = if tags.is_some() { spaces1(input)? } else { (input, "") };
    let (input, prefix) = opt(parse_prefix)(input)?;
    let (input, _) = if prefix.is_some() { spaces1(input)? } else { (input, "") };
    let (input, command) = parse_command(input)?;
    let (input, _) = alt((spaces1, |i| Ok((i, ""))))(input)?;
    let (input, params) = parse_params(input)?;

    Ok((
        input,
        IrcMessage {
            tags,
            prefix,
            command: command.to_ascii_uppercase(),
            params,
        },
    ))
}

impl FromStr for IrcMessage {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            return Err(ProtocolError::Malformed("empty line".into()));
        }
        match parse_line(trimmed) {
            Ok((rest, msg)) if rest.is_empty() => {
                if msg.command.is_empty() {
                    return Err(ProtocolError::Malformed("missing command".into()));
                }
                Ok(msg)
            }
            _ => Err(ProtocolError::Malformed(trimmed.to_string())),
        }
    }
}

impl fmt::Display for IrcMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(tags) = &self.tags {
            if !tags.is_empty() {
                write!(f, "@")?;
                for (i, tag) in tags.iter().enumerate() {
                    if i > 0 {
                        write!(f, ";")?;
                    }
                    write!(f, "{tag}")?;
                }
                write!(f, " ")?;
            }
        }
        if let Some(prefix) = &self.prefix {
            write!(f, ":{prefix} ")?;
        }
        write!(f, "{}", self.command)?;
        let n = self.params.len();
        for (i, param) in self.params.iter().enumerate() {
            let is_last = i == n - 1;
            if is_last && (param.is_empty() || param.contains(' ') || param.starts_with(':')) {
                write!(f, " :{}", escape_trailing(param))?;
            } else {
                write!(f, " {param}")?;
            }
        }
        Ok(())
    }
}

fn escape_trailing(s: &str) -> &str {
    // Trailing params are sent verbatim; only the tag escaper folds
    // characters. Nothing to do here besides return as-is.
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_basic_privmsg() {
        let m: IrcMessage = ":nick!u@h PRIVMSG #chan :hello world".parse().unwrap();
        assert_eq!(m.command, "PRIVMSG");
        assert_eq!(m.params, vec!["#chan", "hello world"]);
        assert_eq!(m.source_nick(), Some("nick"));
    }

    #[test]
    fn parses_tags() {
        let m: IrcMessage = "@time=2023-01-01T00:00:00Z;+draft/typing NICK newnick".parse().unwrap();
        let tags = m.tags.unwrap();
        assert_eq!(tags.len(), 2);
        assert_eq!(tags[0].key, "time");
        assert_eq!(tags[0].value.as_deref(), Some("2023-01-01T00:00:00Z"));
        assert!(!tags[1].has_value);
    }

    #[test]
    fn rejects_empty_line() {
        assert!("".parse::<IrcMessage>().is_err());
        assert!("\r\n".parse::<IrcMessage>().is_err());
    }

    #[test]
    fn round_trips_through_display() {
        let raw = ":bob!u@h AWAY :lunch";
        let m: IrcMessage = raw.parse().unwrap();
        assert_eq!(m.to_string(), raw);
    }

    #[test]
    fn no_params_command_serializes_without_trailing_space() {
        let m = IrcMessage::new("CAP", vec!["END".into()]);
        assert_eq!(m.to_string(), "CAP END");
    }

    #[test]
    fn middle_params_without_colon() {
        let m: IrcMessage = "USER u 0 * :r".parse().unwrap();
        assert_eq!(m.params, vec!["u", "0", "*", "r"]);
    }
}
