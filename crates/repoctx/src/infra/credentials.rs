//! Access tokens for remote hosting providers.

use std::collections::HashMap;
use std::env;
use std::fmt;

use crate::infra::config::Config;

/// Remote hosting provider a credential belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Host {
    GitHub,
    GitLab,
}

impl Host {
    pub fn as_str(&self) -> &'static str {
        match self {
            Host::GitHub => "github",
            Host::GitLab => "gitlab",
        }
    }

    /// Environment variables consulted for this host, highest priority first.
    pub fn env_vars(&self) -> &'static [&'static str] {
        match self {
            Host::GitHub => &["REPOCTX_GITHUB_TOKEN", "GITHUB_TOKEN"],
            Host::GitLab => &["REPOCTX_GITLAB_TOKEN", "GITLAB_TOKEN"],
        }
    }

    /// Page where the user can create a personal access token.
    pub fn token_page(&self) -> &'static str {
        match self {
            Host::GitHub => "https://github.com/settings/tokens/new?description=repoctx&scopes=repo",
            Host::GitLab => "https://gitlab.com/-/user_settings/personal_access_tokens",
        }
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Credential handed to a provider.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub token: Option<String>,
}

impl Credentials {
    pub fn token(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.token.as_deref().is_none_or(str::is_empty)
    }
}

// Keep tokens out of logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Resolves credentials per host: explicit override, then environment, then config.
#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    overrides: HashMap<Host, Credentials>,
    configured: HashMap<Host, Credentials>,
    read_env: bool,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self {
            read_env: true,
            ..Self::default()
        }
    }

    /// Store seeded from the `[auth]` config section.
    pub fn from_config(config: &Config) -> Self {
        let mut store = Self::new();
        if let Some(token) = &config.auth.github_token {
            store.configured.insert(Host::GitHub, Credentials::token(token));
        }
        if let Some(token) = &config.auth.gitlab_token {
            store.configured.insert(Host::GitLab, Credentials::token(token));
        }
        store
    }

    /// Skip environment lookups; used by tests and embedders.
    pub fn without_env(mut self) -> Self {
        self.read_env = false;
        self
    }

    /// Explicit credential (e.g. `--token`), winning over every other layer.
    pub fn set(&mut self, host: Host, credentials: Credentials) {
        self.overrides.insert(host, credentials);
    }

    pub fn get(&self, host: Host) -> Credentials {
        if let Some(found) = self.overrides.get(&host).filter(|c| !c.is_empty()) {
            return found.clone();
        }
        if self.read_env
            && let Some(token) = host
                .env_vars()
                .iter()
                .find_map(|name| env::var(name).ok().filter(|v| !v.trim().is_empty()))
        {
            return Credentials::token(token.trim());
        }
        self.configured
            .get(&host)
            .filter(|c| !c.is_empty())
            .cloned()
            .unwrap_or_default()
    }
}
