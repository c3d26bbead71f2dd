// Connection settings shared by every subcommand: flags layered over
// `~/.caseroom/config.toml`.

use std::fmt;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Args;

use caseroom_client::config::ClientConfig;
use caseroom_client::connection::ws::WsConnector;
use caseroom_client::credentials::{CredentialProvider, EnvCredential, UrlTemplateResolver};
use caseroom_client::session::Session;

#[derive(Debug, Clone, Args)]
pub struct ConnectArgs {
    /// Case to open.
    #[arg(long)]
    pub case: String,
    /// Base websocket URL (overrides `server_url` in the config file).
    #[arg(long)]
    pub server: Option<String>,
    /// Environment variable holding the token (overrides `token_env`).
    #[arg(long)]
    pub token_env: Option<String>,
    /// Force JSON output.
    #[arg(long)]
    pub json: bool,
}

/// The token variable is unset or blank.
#[derive(Debug)]
pub struct MissingCredential {
    var: String,
}

impl fmt::Display for MissingCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no token found: set ${} or pass --token-env", self.var)
    }
}

impl std::error::Error for MissingCredential {}

/// Fully resolved connection settings.
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoint {
    pub server_url: String,
    pub token_env: String,
    pub connect_timeout: Duration,
}

impl Endpoint {
    pub fn resolve(args: &ConnectArgs, config: &ClientConfig) -> Result<Self> {
        let server_url = args
            .server
            .clone()
            .or_else(|| config.server_url.clone())
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| {
                anyhow!("no server configured: pass --server or set server_url in config.toml")
            })?;
        let token_env = args.token_env.clone().unwrap_or_else(|| config.token_env.clone());
        Ok(Self { server_url, token_env, connect_timeout: config.connect_timeout() })
    }

    /// Build a session for `case_id`. Must run inside a tokio runtime; the
    /// session starts connecting immediately.
    pub fn open_session(&self, case_id: &str) -> Result<Session<WsConnector>> {
        let credentials = EnvCredential::new(&self.token_env);
        if credentials.credential().is_none() {
            return Err(MissingCredential { var: self.token_env.clone() }.into());
        }
        let resolver = UrlTemplateResolver::new(&self.server_url)
            .with_context(|| format!("unusable server URL `{}`", self.server_url))?;
        let connector = WsConnector::default().with_connect_timeout(self.connect_timeout);
        Ok(Session::new(connector, resolver, credentials, Some(case_id.to_string())))
    }
}

/// Drive a future to completion on a fresh current-thread runtime.
pub fn block_on<F: std::future::Future>(future: F) -> Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    Ok(runtime.block_on(future))
}
