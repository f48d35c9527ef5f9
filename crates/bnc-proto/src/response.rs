//! IRC numeric response codes used by the bouncer.
//!
//! Only the numerics the bouncer actually emits or captures are named here;
//! this is not a complete RFC 2812 numeric table.

#![allow(non_camel_case_types)]

/// A three-digit IRC server numeric.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
#[non_exhaustive]
pub enum Response {
    /// 001 - Welcome to the IRC network.
    RPL_WELCOME = 1,
    /// 002 - Your host is running version.
    RPL_YOURHOST = 2,
    /// 003 - Server was created.
    RPL_CREATED = 3,
    /// 004 - Server info.
    RPL_MYINFO = 4,
    /// 005 - ISUPPORT tokens.
    RPL_ISUPPORT = 5,
    /// 250 - Highest connection count.
    RPL_STATSCONN = 250,
    /// 251 - There are N users.
    RPL_LUSERCLIENT = 251,
    /// 252 - N operators online.
    RPL_LUSEROP = 252,
    /// 254 - N channels formed.
    RPL_LUSERCHANNELS = 254,
    /// 255 - I have N clients and N servers.
    RPL_LUSERME = 255,
    /// 265 - Local users.
    RPL_LOCALUSERS = 265,
    /// 266 - Global users.
    RPL_GLOBALUSERS = 266,
    /// 353 - NAMES reply.
    RPL_NAMREPLY = 353,
    /// 366 - End of NAMES.
    RPL_ENDOFNAMES = 366,
    /// 372 - MOTD line.
    RPL_MOTD = 372,
    /// 375 - Start of MOTD.
    RPL_MOTDSTART = 375,
    /// 376 - End of MOTD.
    RPL_ENDOFMOTD = 376,
    /// 400 - Unknown error (generic catch-all).
    ERR_UNKNOWNERROR = 400,
    /// 422 - MOTD file missing.
    ERR_NOMOTD = 422,
    /// 431 - No nickname given.
    ERR_NONICKNAMEGIVEN = 431,
    /// 432 - Erroneous nickname.
    ERR_ERRONEUSNICKNAME = 432,
    /// 433 - Nickname already in use.
    ERR_NICKNAMEINUSE = 433,
    /// 451 - Not registered.
    ERR_NOTREGISTERED = 451,
    /// 461 - Not enough parameters.
    ERR_NEEDMOREPARAMS = 461,
    /// 462 - Already registered.
    ERR_ALREADYREGISTERED = 462,
    /// 464 - Invalid password.
    ERR_PASSWDMISMATCH = 464,
    /// 501 - Unknown MODE flag (used generically for bouncer protocol errors).
    ERR_UMODEUNKNOWNFLAG = 501,
}

impl Response {
    /// The three-digit wire form, zero-padded.
    #[must_use]
    pub fn code(self) -> u16 {
        self as u16
    }
}

impl std::fmt::Display for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:03}", self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numerics_are_zero_padded() {
        assert_eq!(Response::RPL_WELCOME.to_string(), "001");
        assert_eq!(Response::RPL_ENDOFMOTD.to_string(), "376");
        assert_eq!(Response::ERR_NICKNAMEINUSE.to_string(), "433");
    }
}
