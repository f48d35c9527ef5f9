//! IRC message prefix (the `:nick!user@host` or `:server.name` source).

use std::fmt;

/// Message prefix — identifies the origin of a line.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Prefix {
    /// A server name, e.g. `irc.example.com`.
    ServerName(String),
    /// A user mask: nick, username, host.
    Nickname(String, String, String),
}

impl Prefix {
    /// Parse a prefix string (without the leading `:`) leniently.
    ///
    /// A `.` before any `!`/`@` marks the prefix as a server name, matching
    /// how real networks distinguish `irc.example.com` from `nick!u@h`.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        enum Part {
            Name,
            User,
            Host,
        }
        let mut name = String::new();
        let mut user = String::new();
        let mut host = String::new();
        let mut part = Part::Name;
        let mut is_server = false;

        for c in s.chars() {
            if c == '.' && matches!(part, Part::Name) {
                is_server = true;
            }
            match c {
                '!' if matches!(part, Part::Name) => {
                    is_server = false;
                    part = Part::User;
                }
                '@' if !matches!(part, Part::Host) => {
                    is_server = false;
                    part = Part::Host;
                }
                _ => match part {
                    Part::Name => name.push(c),
                    Part::User => user.push(c),
                    Part::Host => host.push(c),
                },
            }
        }

        if is_server {
            Prefix::ServerName(name)
        } else {
            Prefix::Nickname(name, user, host)
        }
    }

    /// The nickname, if this is a user prefix.
    #[must_use]
    pub fn nick(&self) -> Option<&str> {
        match self {
            Prefix::Nickname(n, _, _) => Some(n),
            Prefix::ServerName(_) => None,
        }
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Prefix::ServerName(s) => write!(f, "{s}"),
            Prefix::Nickname(n, u, h) => {
                if u.is_empty() && h.is_empty() {
                    write!(f, "{n}")
                } else if h.is_empty() {
                    write!(f, "{n}!{u}")
                } else {
                    write!(f, "{n}!{u}@{h}")
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_user_mask() {
        let p = Prefix::parse("alice!ident@host.example");
        assert_eq!(p, Prefix::Nickname("alice".into(), "ident".into(), "host.example".into()));
        assert_eq!(p.nick(), Some("alice"));
    }

    #[test]
    fn parses_server_name() {
        let p = Prefix::parse("irc.example.com");
        assert_eq!(p, Prefix::ServerName("irc.example.com".into()));
    }

    #[test]
    fn round_trips_through_display() {
        let p = Prefix::Nickname("bob".into(), "u".into(), "h".into());
        assert_eq!(p.to_string(), "bob!u@h");
    }
}
