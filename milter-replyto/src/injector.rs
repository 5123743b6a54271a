use milter::{MilterError, Modifier};

use crate::handler::SessionState;

pub const REPLY_TO: &str = "Reply-To";

/// Adds the configured `Reply-To` header to messages that lack one.
#[derive(Debug, Clone)]
pub struct HeaderInjector {
    value: String,
}

impl HeaderInjector {
    pub fn new(value: impl Into<String>) -> Self {
        HeaderInjector {
            value: value.into(),
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// Queues the header on `modifier` unless the message already carries
    /// one. Returns whether a header was added.
    ///
    /// Must run once per message: a second call on the same state would add
    /// the header twice.
    pub fn inject(
        &self,
        state: &SessionState,
        modifier: &mut Modifier,
    ) -> Result<bool, MilterError> {
        if state.has_reply_to() {
            return Ok(false);
        }
        modifier.add_header(REPLY_TO, &self.value)?;
        Ok(true)
    }
}
