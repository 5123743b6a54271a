use async_trait::async_trait;
use miette::{Diagnostic, SourceSpan};
use std::collections::HashMap;
use thiserror::Error;

mod parser;
mod server;
pub use parser::Family;
pub use server::*;

/// Highest milter protocol version this engine speaks.
pub const PROTOCOL_VERSION: u32 = 6;

/// Modification actions a filter may request during option negotiation
/// (`SMFIF_*` in libmilter).
pub mod actions {
    pub const ADD_HEADERS: u32 = 0x01;
    pub const CHANGE_BODY: u32 = 0x02;
    pub const ADD_RECIPIENT: u32 = 0x04;
    pub const DELETE_RECIPIENT: u32 = 0x08;
    pub const CHANGE_HEADERS: u32 = 0x10;
    pub const QUARANTINE: u32 = 0x20;
}

#[derive(Debug, Error, Diagnostic)]
pub enum MilterError {
    #[error("IO error")]
    #[diagnostic(code(milter::io_error))]
    IoError(#[from] std::io::Error),

    #[error("Parse error: {message}")]
    #[diagnostic(code(milter::parse_error))]
    ParseError {
        message: String,
        #[label("This bit here")]
        span: SourceSpan,
    },

    #[error("Unknown milter command '{0}'")]
    #[diagnostic(code(milter::unknown_command))]
    UnknownCommand(char),

    #[error("Invalid packet length {0}")]
    #[diagnostic(
        code(milter::invalid_length),
        help("packets carry at least a command byte and stay within 1 MiB")
    )]
    InvalidLength(u32),

    #[error("The MTA did not negotiate the '{0}' action")]
    #[diagnostic(code(milter::action_not_negotiated))]
    ActionNotNegotiated(&'static str),

    #[error("Invalid header: {0}")]
    #[diagnostic(code(milter::invalid_header))]
    InvalidHeader(String),
}

/// The verdict a callback hands back to the MTA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Keep going with the next stage of this message.
    Continue,
    /// Accept the message; the MTA stops calling the filter for it.
    Accept,
    Reject,
    TempFail,
    /// Accept the message but silently drop it.
    Discard,
}

impl Action {
    pub(crate) fn code(self) -> u8 {
        match self {
            Action::Continue => b'c',
            Action::Accept => b'a',
            Action::Reject => b'r',
            Action::TempFail => b't',
            Action::Discard => b'd',
        }
    }
}

/// Macro name to value, as sent by the MTA for a single stage.
pub type Macros = HashMap<String, String>;

/// Message headers in the order the MTA sent them.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HeaderFields {
    fields: Vec<(String, String)>,
}

impl HeaderFields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.push((name.into(), value.into()));
    }

    /// First value of the header `name`, compared case-insensitively.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(field, _)| field.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Every value of the header `name`, compared case-insensitively.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.fields
            .iter()
            .filter(move |(field, _)| field.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn clear(&mut self) {
        self.fields.clear();
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for HeaderFields {
    fn from_iter<T: IntoIterator<Item = (N, V)>>(iter: T) -> Self {
        HeaderFields {
            fields: iter
                .into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
        }
    }
}

/// Whether `value` can be sent as a header value: no NUL, CR or LF.
pub fn is_valid_header_value(value: &str) -> bool {
    !value.bytes().any(|b| matches!(b, b'\0' | b'\r' | b'\n'))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Modification {
    AddHeader { name: String, value: String },
}

/// Handle given to [`Milter::body`] for altering the message before delivery.
///
/// Modifications are queued and written to the MTA ahead of the final action.
#[derive(Debug)]
pub struct Modifier {
    actions: u32,
    modifications: Vec<Modification>,
}

impl Modifier {
    /// Creates a modifier allowed to perform the negotiated `actions`.
    pub fn new(actions: u32) -> Self {
        Modifier {
            actions,
            modifications: Vec::new(),
        }
    }

    pub fn add_header(&mut self, name: &str, value: &str) -> Result<(), MilterError> {
        if self.actions & actions::ADD_HEADERS == 0 {
            return Err(MilterError::ActionNotNegotiated("add header"));
        }
        if name.is_empty() || !name.bytes().all(|b| b.is_ascii_graphic() && b != b':') {
            return Err(MilterError::InvalidHeader(format!("bad header name {name:?}")));
        }
        if !is_valid_header_value(value) {
            return Err(MilterError::InvalidHeader(format!(
                "bad value for header {name}"
            )));
        }
        self.modifications.push(Modification::AddHeader {
            name: name.to_string(),
            value: value.to_string(),
        });
        Ok(())
    }

    pub fn modifications(&self) -> &[Modification] {
        &self.modifications
    }

    pub(crate) fn into_modifications(self) -> Vec<Modification> {
        self.modifications
    }
}

/// Per-connection callbacks driven by [`MilterServer`].
///
/// One instance serves exactly one MTA connection. Callbacks are invoked in
/// protocol order and never concurrently, so implementations keep their
/// session state in `self`.
#[async_trait]
pub trait Milter: Send {
    /// Modification actions ([`actions`]) requested during negotiation.
    fn actions(&self) -> u32 {
        0
    }

    async fn connect(
        &mut self,
        hostname: &str,
        network: &str,
        address: &str,
        macros: &Macros,
    ) -> Action;
    async fn helo(&mut self, name: &str, macros: &Macros) -> Action;
    /// The sender is passed without `<>` brackets.
    async fn mail_from(&mut self, sender: &str, macros: &Macros) -> Action;
    /// Called once per recipient. A rejection only rejects that recipient.
    async fn rcpt_to(&mut self, recipient: &str, macros: &Macros) -> Action;
    async fn headers(&mut self, headers: &HeaderFields) -> Action;
    async fn body(&mut self, body: &[u8], modifier: &mut Modifier) -> Action;

    /// The MTA abandoned the current message; the connection stays open.
    async fn abort(&mut self) {}
}
