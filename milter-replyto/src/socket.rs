use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;

use miette::{Context, IntoDiagnostic, Result};
use milter::Listener;
use tokio::net::{TcpListener, UnixListener};
use tracing::warn;

use crate::config::{BindProto, CfgServer};

/// Binds the listening socket the MTA connects to.
///
/// A unix socket left behind by a previous run is removed first, and the new
/// one gets the configured permission bits.
pub async fn bind(cfg: &CfgServer) -> Result<Listener> {
    match cfg.proto {
        BindProto::Tcp => {
            let listener = TcpListener::bind(&cfg.addr)
                .await
                .into_diagnostic()
                .wrap_err_with(|| format!("failed to bind {}", cfg.addr))?;
            Ok(listener.into())
        }
        BindProto::Unix => {
            let mode = cfg.socket_mode()?;
            remove_socket(&cfg.addr);

            let listener = UnixListener::bind(&cfg.addr)
                .into_diagnostic()
                .wrap_err_with(|| format!("failed to bind {}", cfg.addr))?;
            fs::set_permissions(&cfg.addr, fs::Permissions::from_mode(mode))
                .into_diagnostic()
                .wrap_err_with(|| format!("failed to set mode {:o} on {}", mode, cfg.addr))?;
            Ok(listener.into())
        }
    }
}

/// Removes the unix socket on shutdown.
pub fn cleanup(cfg: &CfgServer) {
    if cfg.proto == BindProto::Unix {
        remove_socket(&cfg.addr);
    }
}

fn remove_socket(path: &str) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(%path, error = %e, "could not remove socket"),
    }
}
