// Capabilities injected into a session: where the credential comes from and
// how a case id turns into a stream address.

use std::net::IpAddr;

use anyhow::{anyhow, Result};
use url::Url;

/// Source of the authentication credential.
///
/// Returning `None` (or a blank string) means "not signed in yet"; the
/// session stays disconnected until a credential shows up.
pub trait CredentialProvider: Send + Sync {
    fn credential(&self) -> Option<String>;
}

/// Maps a case id to the address of its event stream.
///
/// An error is treated the same as a missing credential.
pub trait AddressResolver: Send + Sync {
    fn resolve(&self, case_id: &str, credential: &str) -> Result<Url>;
}

/// A fixed credential, mostly for tests and one-shot CLI use.
#[derive(Debug, Clone, Default)]
pub struct StaticCredential(Option<String>);

impl StaticCredential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Some(token.into()))
    }

    pub fn none() -> Self {
        Self(None)
    }
}

impl CredentialProvider for StaticCredential {
    fn credential(&self) -> Option<String> {
        normalize(self.0.clone())
    }
}

/// Reads the credential from an environment variable on every call, so a
/// refreshed token is picked up by `Session::credentials_changed`.
#[derive(Debug, Clone)]
pub struct EnvCredential {
    var: String,
}

impl EnvCredential {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl CredentialProvider for EnvCredential {
    fn credential(&self) -> Option<String> {
        normalize(std::env::var(&self.var).ok())
    }
}

fn normalize(token: Option<String>) -> Option<String> {
    token.filter(|token| !token.trim().is_empty())
}

/// Builds `<base>/ws/cases/<case_id>?token=<credential>`.
#[derive(Debug, Clone)]
pub struct UrlTemplateResolver {
    base: Url,
}

impl UrlTemplateResolver {
    pub fn new(base_url: &str) -> Result<Self> {
        let mut base = validate_ws_url(base_url)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self { base })
    }
}

impl AddressResolver for UrlTemplateResolver {
    fn resolve(&self, case_id: &str, credential: &str) -> Result<Url> {
        let case_id = case_id.trim();
        if case_id.is_empty() || case_id.contains(['/', '?', '#']) || case_id.contains("..") {
            return Err(anyhow!("invalid case id `{case_id}`"));
        }
        let mut url = self
            .base
            .join(&format!("ws/cases/{case_id}"))
            .map_err(|error| anyhow!("cannot build stream address for `{case_id}`: {error}"))?;
        url.query_pairs_mut().append_pair("token", credential);
        Ok(url)
    }
}

fn validate_ws_url(value: &str) -> Result<Url> {
    let parsed =
        Url::parse(value).map_err(|error| anyhow!("invalid server_url `{value}`: {error}"))?;
    match parsed.scheme() {
        "wss" => Ok(parsed),
        "ws" if is_loopback_host(parsed.host_str()) => Ok(parsed),
        _ => Err(anyhow!("server_url must use wss (ws is allowed only for localhost testing)")),
    }
}

fn is_loopback_host(host: Option<&str>) -> bool {
    let Some(host) = host else {
        return false;
    };
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .is_ok_and(|addr| addr.is_loopback())
}
