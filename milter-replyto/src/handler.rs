//! Per-session milter callbacks enforcing the Reply-To policy.
//!
//! The engine creates one `ReplyToMilter` per MTA connection through
//! [`factory`] and drives it in protocol order. Messages from senders outside
//! the policy are accepted at MAIL FROM; the rest get a `Reply-To` header at
//! end of body unless they already carry a non-empty one.
use std::sync::Arc;

use async_trait::async_trait;
use milter::{actions, Action, HeaderFields, Macros, Milter, Modifier};
use tracing::{debug, info, warn};

use crate::injector::{HeaderInjector, REPLY_TO};
use crate::policy::SenderPolicy;

/// Where the current message stands in the protocol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Stage {
    #[default]
    Idle,
    Connected,
    Greeted,
    SenderSeen,
    RecipientSeen,
    HeadersSeen,
    /// Terminal: the verdict for the message has been given.
    BodySeen,
    /// Terminal: the sender is outside the policy and the message was
    /// accepted without inspection.
    Accepted,
}

/// Mutable state of one session. Reset whenever a new message begins.
#[derive(Debug, Default)]
pub struct SessionState {
    stage: Stage,
    has_reply_to: bool,
    sender: Option<String>,
}

impl SessionState {
    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn has_reply_to(&self) -> bool {
        self.has_reply_to
    }

    pub(crate) fn set_has_reply_to(&mut self, present: bool) {
        self.has_reply_to = present;
    }

    fn begin_message(&mut self, stage: Stage) {
        self.stage = stage;
        self.has_reply_to = false;
        self.sender = None;
    }
}

pub struct ReplyToMilter {
    policy: Arc<SenderPolicy>,
    injector: Arc<HeaderInjector>,
    state: SessionState,
}

impl ReplyToMilter {
    pub fn new(policy: Arc<SenderPolicy>, injector: Arc<HeaderInjector>) -> Self {
        ReplyToMilter {
            policy,
            injector,
            state: SessionState::default(),
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    fn out_of_order(&self, event: &'static str) -> Action {
        warn!(stage = ?self.state().stage(), event, "event out of protocol order");
        Action::TempFail
    }
}

/// Returns a factory producing a fresh handler for every MTA connection.
pub fn factory(
    policy: Arc<SenderPolicy>,
    injector: Arc<HeaderInjector>,
) -> impl Fn() -> ReplyToMilter + Send + Sync + 'static {
    move || ReplyToMilter::new(policy.clone(), injector.clone())
}

#[async_trait]
impl Milter for ReplyToMilter {
    fn actions(&self) -> u32 {
        actions::ADD_HEADERS
    }

    async fn connect(
        &mut self,
        hostname: &str,
        network: &str,
        address: &str,
        _macros: &Macros,
    ) -> Action {
        debug!(%hostname, %network, %address, "client connected");
        self.state = SessionState::default();
        self.state.stage = Stage::Connected;
        Action::Continue
    }

    async fn helo(&mut self, name: &str, _macros: &Macros) -> Action {
        debug!(%name, "helo");
        self.state.begin_message(Stage::Greeted);
        Action::Continue
    }

    async fn mail_from(&mut self, sender: &str, macros: &Macros) -> Action {
        let queue_id = macros.get("i").map(String::as_str).unwrap_or("-");

        if !self.policy.matches(sender) {
            debug!(%sender, queue_id, "sender outside policy, accepting");
            self.state.begin_message(Stage::Accepted);
            return Action::Accept;
        }

        debug!(%sender, queue_id, "sender matches policy");
        self.state.begin_message(Stage::SenderSeen);
        self.state.sender = Some(sender.to_string());
        Action::Continue
    }

    async fn rcpt_to(&mut self, _recipient: &str, _macros: &Macros) -> Action {
        match self.state.stage {
            Stage::SenderSeen | Stage::RecipientSeen => {
                self.state.stage = Stage::RecipientSeen;
                Action::Continue
            }
            Stage::Accepted => Action::Accept,
            _ => self.out_of_order("rcpt_to"),
        }
    }

    async fn headers(&mut self, headers: &HeaderFields) -> Action {
        match self.state.stage {
            Stage::SenderSeen | Stage::RecipientSeen => {
                if headers
                    .get_all(REPLY_TO)
                    .any(|value| !value.trim().is_empty())
                {
                    self.state.set_has_reply_to(true);
                }
                self.state.stage = Stage::HeadersSeen;
                Action::Continue
            }
            Stage::Accepted => Action::Accept,
            _ => self.out_of_order("headers"),
        }
    }

    async fn body(&mut self, _body: &[u8], modifier: &mut Modifier) -> Action {
        match self.state.stage {
            Stage::HeadersSeen => {
                self.state.stage = Stage::BodySeen;
                let sender = self.state.sender.as_deref().unwrap_or_default();
                match self.injector.inject(&self.state, modifier) {
                    Ok(true) => {
                        info!(
                            %sender,
                            reply_to = self.injector.value(),
                            "added Reply-To header"
                        );
                        Action::Accept
                    }
                    Ok(false) => {
                        debug!(%sender, "Reply-To already present");
                        Action::Accept
                    }
                    Err(e) => {
                        warn!(%sender, error = %e, "could not add Reply-To header");
                        Action::TempFail
                    }
                }
            }
            // The verdict is already given, never inject twice
            Stage::BodySeen | Stage::Accepted => Action::Accept,
            _ => self.out_of_order("body"),
        }
    }

    async fn abort(&mut self) {
        debug!(stage = ?self.state().stage(), "message aborted");
        self.state.begin_message(Stage::Greeted);
    }
}
