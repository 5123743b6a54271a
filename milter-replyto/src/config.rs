use config::{Config, Environment, File};
use miette::{Diagnostic, IntoDiagnostic, Result};
use serde::Deserialize;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

const DEFAULT_SOCKET: &str = "/var/run/milter-replyto/milter-replyto.sock";

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("Invalid socket mode '{0}'")]
    #[diagnostic(
        code(config::socket_mode),
        help("use octal permission bits such as 0660")
    )]
    InvalidSocketMode(String),

    #[error("policy.reply_to must not be empty")]
    #[diagnostic(code(config::reply_to))]
    EmptyReplyTo,

    #[error("policy.reply_to must be a single line without NUL bytes")]
    #[diagnostic(code(config::reply_to))]
    InvalidReplyTo,

    #[error("Invalid log level '{0}'")]
    #[diagnostic(
        code(config::log_level),
        help("use an EnvFilter directive such as info or milter=debug")
    )]
    InvalidLogLevel(String),

    #[error("Invalid sender pattern '{0}'")]
    #[diagnostic(
        code(config::pattern),
        help("patterns are bare domains or suffixes such as .lan, without '@'")
    )]
    InvalidPattern(String),

    #[error("No sender domains or suffixes configured")]
    #[diagnostic(code(config::empty_policy))]
    EmptyPolicy,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Cfg {
    pub log: CfgLog,
    pub server: CfgServer,
    pub policy: CfgPolicy,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CfgLog {
    /// `EnvFilter` directive; `RUST_LOG` takes precedence.
    pub level: String,
    pub format: LogFormat,
}

impl Default for CfgLog {
    fn default() -> Self {
        CfgLog {
            level: "info".to_string(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CfgServer {
    pub proto: BindProto,
    /// Socket path for `unix`, `host:port` for `tcp`.
    pub addr: String,
    pub socket_mode: String,
}

impl Default for CfgServer {
    fn default() -> Self {
        CfgServer {
            proto: BindProto::default(),
            addr: DEFAULT_SOCKET.to_string(),
            socket_mode: "0660".to_string(),
        }
    }
}

impl CfgServer {
    /// Permission bits for the unix domain socket.
    pub fn socket_mode(&self) -> Result<u32, ConfigError> {
        u32::from_str_radix(&self.socket_mode, 8)
            .ok()
            .filter(|mode| *mode <= 0o777)
            .ok_or_else(|| ConfigError::InvalidSocketMode(self.socket_mode.clone()))
    }
}

#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BindProto {
    #[default]
    Unix,
    Tcp,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CfgPolicy {
    /// Sender domains matched exactly.
    pub domains: Vec<String>,
    /// Sender domain suffixes, e.g. `.lan`.
    pub suffixes: Vec<String>,
    /// Value of the `Reply-To` header added to matching mail.
    pub reply_to: String,
}

impl Default for CfgPolicy {
    fn default() -> Self {
        CfgPolicy {
            domains: vec!["livid.pp.ru".to_string()],
            suffixes: vec![".lan".to_string()],
            reply_to: "root@livid.pp.ru".to_string(),
        }
    }
}

/// Command line values. They win over the file and the environment.
#[derive(Debug, Default)]
pub struct Overrides {
    pub proto: Option<String>,
    pub addr: Option<String>,
    pub socket_mode: Option<String>,
    pub reply_to: Option<String>,
    pub log_level: Option<String>,
}

impl Cfg {
    pub fn load(cfg_path: Option<&str>, overrides: &Overrides) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = cfg_path {
            builder = builder.add_source(File::with_name(path));
        }

        let settings = builder
            .add_source(
                Environment::with_prefix("MILTER_REPLYTO")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .set_override_option("server.proto", overrides.proto.clone())
            .into_diagnostic()?
            .set_override_option("server.addr", overrides.addr.clone())
            .into_diagnostic()?
            .set_override_option("server.socket_mode", overrides.socket_mode.clone())
            .into_diagnostic()?
            .set_override_option("policy.reply_to", overrides.reply_to.clone())
            .into_diagnostic()?
            .set_override_option("log.level", overrides.log_level.clone())
            .into_diagnostic()?
            .build()
            .into_diagnostic()?;

        let cfg: Cfg = settings.try_deserialize().into_diagnostic()?;
        cfg.validate()?;

        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.socket_mode()?;
        if self.policy.reply_to.trim().is_empty() {
            return Err(ConfigError::EmptyReplyTo);
        }
        if !milter::is_valid_header_value(&self.policy.reply_to) {
            return Err(ConfigError::InvalidReplyTo);
        }
        EnvFilter::try_new(&self.log.level)
            .map_err(|_| ConfigError::InvalidLogLevel(self.log.level.clone()))?;
        Ok(())
    }
}
