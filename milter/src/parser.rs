use super::*;
use nom::{
    bytes::complete::{tag, take_until},
    combinator::{map, rest},
    multi::{many0, many1},
    number::complete::{be_u16, be_u32, be_u8},
    sequence::terminated,
    IResult, Parser,
};

/// Commands the MTA sends to the filter (`SMFIC_*` in libmilter).
#[derive(Debug, PartialEq)]
pub(crate) enum Command {
    /// Option negotiation, always the first packet of a connection
    OptNeg {
        version: u32,
        actions: u32,
        protocol: u32,
    },
    /// Macros for the command identified by `stage`
    Macro { stage: u8, macros: Macros },
    /// SMTP connection info
    Connect {
        hostname: String,
        family: Family,
        port: u16,
        address: String,
    },
    /// HELO/EHLO name
    Helo(String),
    /// MAIL FROM address followed by ESMTP arguments
    Mail(Vec<String>),
    /// RCPT TO address followed by ESMTP arguments
    Rcpt(Vec<String>),
    Data,
    Header {
        name: String,
        value: String,
    },
    EndOfHeaders,
    Body(Vec<u8>),
    EndOfBody(Vec<u8>),
    Abort,
    Quit,
    /// Quit, but keep the socket for a new SMTP connection
    QuitNewConnection,
    /// SMTP command the MTA did not recognize
    Unknown(String),
}

/// Address family of the SMTP client, as sent in the connect packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Unknown,
    Unix,
    Inet,
    Inet6,
}

impl From<u8> for Family {
    fn from(b: u8) -> Self {
        match b {
            b'L' => Family::Unix,
            b'4' => Family::Inet,
            b'6' => Family::Inet6,
            _ => Family::Unknown,
        }
    }
}

impl Family {
    /// Network name in the style of a socket dial string.
    pub fn network(&self) -> &'static str {
        match self {
            Family::Unknown => "unknown",
            Family::Unix => "unix",
            Family::Inet => "tcp4",
            Family::Inet6 => "tcp6",
        }
    }

    /// Formats the client address the way it would be dialed.
    pub fn dial_address(&self, port: u16, address: &str) -> String {
        match self {
            Family::Unknown => String::new(),
            Family::Unix => address.to_string(),
            Family::Inet => format!("{address}:{port}"),
            Family::Inet6 => {
                let address = address.strip_prefix("IPv6:").unwrap_or(address);
                format!("[{address}]:{port}")
            }
        }
    }
}

/// Parses the payload of a packet with command byte `code`.
pub(crate) fn parse_command(code: u8, payload: &[u8]) -> Result<Command, MilterError> {
    let parse_result: IResult<&[u8], Command> = match code {
        b'O' => parse_optneg(payload),
        b'D' => parse_macro(payload),
        b'C' => parse_connect(payload),
        b'H' => map(cstring, Command::Helo).parse(payload),
        b'M' => map(many1(cstring), Command::Mail).parse(payload),
        b'R' => map(many1(cstring), Command::Rcpt).parse(payload),
        b'T' => Ok((payload, Command::Data)),
        b'L' => map((cstring, cstring), |(name, value)| Command::Header {
            name,
            value,
        })
        .parse(payload),
        b'N' => Ok((payload, Command::EndOfHeaders)),
        b'B' => map(rest, |chunk: &[u8]| Command::Body(chunk.to_vec())).parse(payload),
        b'E' => map(rest, |chunk: &[u8]| Command::EndOfBody(chunk.to_vec())).parse(payload),
        b'A' => Ok((payload, Command::Abort)),
        b'Q' => Ok((payload, Command::Quit)),
        b'K' => Ok((payload, Command::QuitNewConnection)),
        b'U' => map(cstring, Command::Unknown).parse(payload),
        other => return Err(MilterError::UnknownCommand(other as char)),
    };

    parse_result
        .map(|(_, cmd)| cmd)
        .map_err(|e| MilterError::ParseError {
            message: format!("malformed '{}' packet: {}", code as char, e),
            span: (0, payload.len()).into(),
        })
}

/// Whether the MTA waits for a reply after sending command `code`.
pub(crate) fn expects_reply(code: u8) -> bool {
    !matches!(code, b'D' | b'A' | b'Q' | b'K')
}

/// Strips the `<>` around an envelope address.
pub(crate) fn strip_brackets(address: &str) -> &str {
    let address = address.trim();
    address
        .strip_prefix('<')
        .and_then(|a| a.strip_suffix('>'))
        .unwrap_or(address)
}

fn parse_optneg(input: &[u8]) -> IResult<&[u8], Command> {
    map((be_u32, be_u32, be_u32), |(version, actions, protocol)| {
        Command::OptNeg {
            version,
            actions,
            protocol,
        }
    })
    .parse(input)
}

fn parse_macro(input: &[u8]) -> IResult<&[u8], Command> {
    map((be_u8, many0((cstring, cstring))), |(stage, pairs)| {
        Command::Macro {
            stage,
            macros: pairs.into_iter().collect(),
        }
    })
    .parse(input)
}

fn parse_connect(input: &[u8]) -> IResult<&[u8], Command> {
    let (input, (hostname, family)) =
        (cstring, map(be_u8, |b: u8| Family::from(b))).parse(input)?;
    if family == Family::Unknown {
        return Ok((
            input,
            Command::Connect {
                hostname,
                family,
                port: 0,
                address: String::new(),
            },
        ));
    }

    let (input, (port, address)) = (be_u16, cstring).parse(input)?;
    Ok((
        input,
        Command::Connect {
            hostname,
            family,
            port,
            address,
        },
    ))
}

/// A NUL-terminated string. Invalid UTF-8 is replaced rather than rejected.
fn cstring(input: &[u8]) -> IResult<&[u8], String> {
    map(
        terminated(take_until(&b"\0"[..]), tag(&b"\0"[..])),
        |raw: &[u8]| String::from_utf8_lossy(raw).into_owned(),
    )
    .parse(input)
}
