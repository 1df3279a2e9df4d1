//! Shared plumbing for remote Git hosting providers.
//!
//! Host specific URL layouts and endpoints live in [`super::github`] and [`super::gitlab`];
//! this module owns the request/classification layer and the ref disambiguation rule both
//! hosts depend on.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::de::DeserializeOwned;
use url::Url;

use super::{DiscoverOptions, Discovery, ParsedLocation, SourceMetadata, github, gitlab};
use crate::domain::errors::{SourceError, SourceErrorKind};
use crate::domain::model::{FetchRef, FileContent, PathEntry};
use crate::infra::credentials::{Credentials, Host};
use crate::infra::http::{HttpResponse, HttpTransport, get_async};

/// Remote hosting backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteHost {
    GitHub,
    /// gitlab.com or a self-managed instance, identified by its origin.
    GitLab { origin: String },
}

impl RemoteHost {
    /// Recognise a hosting provider from a parsed URL.
    pub fn from_url(url: &Url) -> Option<Self> {
        let host = url.host_str()?.to_ascii_lowercase();
        if host == "github.com" || host == "www.github.com" {
            Some(RemoteHost::GitHub)
        } else if host.contains("gitlab") {
            Some(RemoteHost::GitLab {
                origin: url.origin().ascii_serialization(),
            })
        } else {
            None
        }
    }

    pub fn credential_host(&self) -> Host {
        match self {
            RemoteHost::GitHub => Host::GitHub,
            RemoteHost::GitLab { .. } => Host::GitLab,
        }
    }

    pub fn token_page(&self) -> String {
        match self {
            RemoteHost::GitHub => Host::GitHub.token_page().to_owned(),
            RemoteHost::GitLab { origin } => {
                format!("{origin}/-/user_settings/personal_access_tokens")
            }
        }
    }

    fn auth_headers(&self, credentials: &Credentials) -> Vec<(String, String)> {
        let mut headers = Vec::new();
        match self {
            RemoteHost::GitHub => {
                headers.push(("Accept".into(), "application/vnd.github+json".into()));
                headers.push(("X-GitHub-Api-Version".into(), "2022-11-28".into()));
                if let Some(token) = credentials.token.as_deref().filter(|t| !t.is_empty()) {
                    headers.push(("Authorization".into(), format!("Bearer {token}")));
                }
            }
            RemoteHost::GitLab { .. } => {
                if let Some(token) = credentials.token.as_deref().filter(|t| !t.is_empty()) {
                    headers.push(("PRIVATE-TOKEN".into(), token.to_owned()));
                }
            }
        }
        headers
    }

    fn is_rate_limited(&self, response: &HttpResponse) -> bool {
        match (self, response.status) {
            (_, 429) => true,
            (RemoteHost::GitHub, 403) => response.header("x-ratelimit-remaining") == Some("0"),
            _ => false,
        }
    }
}

/// Accept `github.com/owner/repo` style shorthands by adding the scheme.
pub fn normalize_identifier(identifier: &str) -> String {
    let trimmed = identifier.trim();
    let lower = trimmed.to_ascii_lowercase();
    let shorthand = ["github.com/", "www.github.com/", "gitlab.com/"]
        .iter()
        .any(|prefix| lower.starts_with(prefix));
    if shorthand {
        format!("https://{trimmed}")
    } else {
        trimmed.to_owned()
    }
}

/// Pick the longest ref that equals `segment` or prefixes it at a `/` boundary.
///
/// Returns the ref and the remaining sub-path, if any.
pub fn disambiguate_ref<S: AsRef<str>>(refs: &[S], segment: &str) -> Option<(String, Option<String>)> {
    let segment = segment.trim_matches('/');
    refs.iter()
        .map(AsRef::as_ref)
        .filter(|candidate| {
            !candidate.is_empty()
                && (segment == *candidate
                    || segment
                        .strip_prefix(candidate)
                        .is_some_and(|rest| rest.starts_with('/')))
        })
        .max_by_key(|candidate| candidate.len())
        .map(|candidate| {
            let rest = segment[candidate.len()..].trim_matches('/');
            (candidate.to_owned(), (!rest.is_empty()).then(|| rest.to_owned()))
        })
}

/// Resolve a `ref/path` URL segment against known branch and tag names.
///
/// When nothing matches, the first path segment is taken as the ref (commit permalinks) and the
/// commit lookup decides whether it exists.
pub(crate) fn resolve_ref<S: AsRef<str>>(refs: &[S], segment: &str) -> (String, Option<String>) {
    if let Some(resolved) = disambiguate_ref(refs, segment) {
        return resolved;
    }
    let segment = segment.trim_matches('/');
    let (git_ref, rest) = segment.split_once('/').unwrap_or((segment, ""));
    let rest = rest.trim_matches('/');
    tracing::debug!(git_ref, "no branch or tag matched; treating first segment as a commit");
    (git_ref.to_owned(), (!rest.is_empty()).then(|| rest.to_owned()))
}

/// Resolve a `--ref` given on the command line against an optional `ref/path` URL segment.
pub(crate) fn explicit_ref(requested: &str, segment: Option<&str>) -> (String, Option<String>) {
    let path = segment
        .and_then(|segment| disambiguate_ref(&[requested], segment))
        .and_then(|(_, path)| path);
    (requested.to_owned(), path)
}

/// Keep entries equal to or beneath `scope`.
pub(crate) fn scope_entries(entries: Vec<PathEntry>, scope: Option<&str>) -> Vec<PathEntry> {
    let Some(scope) = scope.map(|s| s.trim_matches('/')).filter(|s| !s.is_empty()) else {
        return entries;
    };
    entries
        .into_iter()
        .filter(|entry| {
            entry.path == scope
                || entry
                    .path
                    .strip_prefix(scope)
                    .is_some_and(|rest| rest.starts_with('/'))
        })
        .collect()
}

/// Percent-encode one URL path or query component, including `/`.
pub(crate) fn encode_component(raw: &str) -> String {
    url::form_urlencoded::byte_serialize(raw.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

/// Map a non-success response onto the error taxonomy.
pub fn classify_status(
    host: &RemoteHost,
    response: &HttpResponse,
    token_sent: bool,
    context: &str,
) -> SourceError {
    let detail = response
        .json::<serde_json::Value>()
        .ok()
        .and_then(|body| body.get("message").and_then(|m| m.as_str()).map(str::to_owned))
        .unwrap_or_else(|| format!("HTTP {}", response.status));
    let message = format!("{context}: {detail}");
    let auth_kind = if token_sent {
        SourceErrorKind::AuthFailed
    } else {
        SourceErrorKind::AuthRequired
    };

    let error = if host.is_rate_limited(response) {
        SourceError::new(SourceErrorKind::RateLimited, message).with_token_page(host.token_page())
    } else {
        match response.status {
            401 | 403 => SourceError::new(auth_kind, message).with_token_page(host.token_page()),
            404 => SourceError::not_found(message),
            409 => SourceError::not_found(format!("{context}: repository is empty")),
            500..=599 => SourceError::network(message),
            _ => SourceError::new(SourceErrorKind::Unknown, message),
        }
    };
    error.with_status(response.status)
}

/// Authenticated request helper handed to the host modules.
pub(crate) struct RemoteClient<'a> {
    host: &'a RemoteHost,
    transport: &'a Arc<dyn HttpTransport>,
    credentials: &'a Credentials,
    auth_required: &'a AtomicBool,
}

impl RemoteClient<'_> {
    pub(crate) fn host(&self) -> &RemoteHost {
        self.host
    }

    pub(crate) async fn get(&self, url: &str, context: &str) -> Result<HttpResponse, SourceError> {
        let headers = self.host.auth_headers(self.credentials);
        tracing::debug!(url, "remote request");
        let response = get_async(Arc::clone(self.transport), url.to_owned(), headers).await?;
        if response.is_success() {
            return Ok(response);
        }

        let error = classify_status(self.host, &response, !self.credentials.is_empty(), context);
        if matches!(
            error.kind,
            SourceErrorKind::AuthRequired | SourceErrorKind::AuthFailed
        ) {
            self.auth_required.store(true, Ordering::Relaxed);
        }
        Err(error)
    }

    pub(crate) async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        context: &str,
    ) -> Result<T, SourceError> {
        self.get(url, context).await?.json()
    }
}

/// Repository hosted on GitHub or GitLab.
#[derive(Debug)]
pub struct RemoteSource {
    host: RemoteHost,
    transport: Arc<dyn HttpTransport>,
    credentials: Credentials,
    metadata: Option<SourceMetadata>,
    auth_required: AtomicBool,
}

impl RemoteSource {
    pub fn new(host: RemoteHost, transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            host,
            transport,
            credentials: Credentials::default(),
            metadata: None,
            auth_required: AtomicBool::new(false),
        }
    }

    pub fn host(&self) -> &RemoteHost {
        &self.host
    }

    pub fn parse_url(&self, identifier: &str) -> ParsedLocation {
        let identifier = normalize_identifier(identifier);
        match &self.host {
            RemoteHost::GitHub => github::parse_url(&identifier),
            RemoteHost::GitLab { .. } => gitlab::parse_url(&identifier),
        }
    }

    pub async fn discover_tree(
        &mut self,
        identifier: &str,
        options: &DiscoverOptions,
    ) -> Result<Vec<PathEntry>, SourceError> {
        let location = self.parse_url(identifier);
        if let Some(error) = location.error.clone().filter(|_| !location.valid) {
            return Err(error);
        }

        let client = self.client();
        let Discovery { entries, metadata } = match &self.host {
            RemoteHost::GitHub => github::discover(&client, &location, options).await?,
            RemoteHost::GitLab { .. } => gitlab::discover(&client, &location, options).await?,
        };
        tracing::info!(
            host = self.host.credential_host().as_str(),
            repo = %metadata.name,
            git_ref = metadata.git_ref.as_deref().unwrap_or_default(),
            entries = entries.len(),
            "discovered remote tree"
        );
        self.metadata = Some(metadata);
        Ok(entries)
    }

    pub async fn fetch_file(&self, entry: &PathEntry) -> Result<FileContent, SourceError> {
        let FetchRef::Url(url) = &entry.fetch_ref else {
            return Err(SourceError::parse(format!(
                "{} has no remote location",
                entry.path
            )));
        };
        let client = self.client();
        match &self.host {
            RemoteHost::GitHub => github::fetch_file(&client, &entry.path, url).await,
            RemoteHost::GitLab { .. } => gitlab::fetch_file(&client, &entry.path, url).await,
        }
    }

    pub fn requires_auth(&self) -> bool {
        self.auth_required.load(Ordering::Relaxed)
    }

    pub fn set_credentials(&mut self, credentials: Credentials) {
        self.credentials = credentials;
        self.auth_required.store(false, Ordering::Relaxed);
    }

    pub fn metadata(&self) -> Option<&SourceMetadata> {
        self.metadata.as_ref()
    }

    fn client(&self) -> RemoteClient<'_> {
        RemoteClient {
            host: &self.host,
            transport: &self.transport,
            credentials: &self.credentials,
            auth_required: &self.auth_required,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longest_ref_wins() {
        let refs = ["main", "feature", "feature/test"];
        assert_eq!(
            disambiguate_ref(&refs, "feature/test/sub/dir"),
            Some(("feature/test".into(), Some("sub/dir".into())))
        );
        assert_eq!(
            disambiguate_ref(&refs, "feature/other"),
            Some(("feature".into(), Some("other".into())))
        );
        assert_eq!(disambiguate_ref(&refs, "main"), Some(("main".into(), None)));
    }

    #[test]
    fn prefix_must_end_at_segment_boundary() {
        let refs = ["dev"];
        assert_eq!(disambiguate_ref(&refs, "develop/src"), None);
    }

    #[test]
    fn unmatched_segment_falls_back_to_first_component() {
        let refs = ["main"];
        assert_eq!(
            resolve_ref(&refs, "0123456789abcdef0123456789abcdef01234567/src/app"),
            (
                "0123456789abcdef0123456789abcdef01234567".into(),
                Some("src/app".into())
            )
        );
        assert_eq!(resolve_ref(&refs, "main/docs"), ("main".into(), Some("docs".into())));
        assert_eq!(resolve_ref(&refs, "v1.2.3"), ("v1.2.3".into(), None));
    }

    #[test]
    fn explicit_ref_strips_matching_segment() {
        assert_eq!(
            explicit_ref("release/1.0", Some("release/1.0/docs")),
            ("release/1.0".into(), Some("docs".into()))
        );
        assert_eq!(explicit_ref("main", Some("dev/docs")), ("main".into(), None));
    }

    #[test]
    fn scope_keeps_entries_beneath_path() {
        let entries = vec![
            PathEntry::directory("src"),
            PathEntry::file("src/lib.rs", FetchRef::None),
            PathEntry::file("srcx/other.rs", FetchRef::None),
            PathEntry::file("README.md", FetchRef::None),
        ];
        let scoped: Vec<String> = scope_entries(entries, Some("src/"))
            .into_iter()
            .map(|e| e.path)
            .collect();
        assert_eq!(scoped, vec!["src", "src/lib.rs"]);
    }

    #[test]
    fn classifies_statuses() {
        let github = RemoteHost::GitHub;
        let limited = HttpResponse::new(403, "{}").with_header("X-RateLimit-Remaining", "0");
        assert_eq!(
            classify_status(&github, &limited, false, "x").kind,
            SourceErrorKind::RateLimited
        );
        let forbidden = HttpResponse::new(403, "{}").with_header("X-RateLimit-Remaining", "12");
        assert_eq!(
            classify_status(&github, &forbidden, true, "x").kind,
            SourceErrorKind::AuthFailed
        );
        let unauthorized = HttpResponse::new(401, r#"{"message":"Bad credentials"}"#);
        let err = classify_status(&github, &unauthorized, false, "repo");
        assert_eq!(err.kind, SourceErrorKind::AuthRequired);
        assert_eq!(err.message, "repo: Bad credentials");
        assert_eq!(err.status, Some(401));
        assert_eq!(
            classify_status(&github, &HttpResponse::new(502, ""), false, "x").kind,
            SourceErrorKind::NetworkError
        );
        assert_eq!(
            classify_status(&github, &HttpResponse::new(404, ""), false, "x").kind,
            SourceErrorKind::NotFound
        );
    }

    #[test]
    fn encodes_path_separators() {
        assert_eq!(encode_component("group/sub project"), "group%2Fsub%20project");
    }

    #[test]
    fn shorthand_identifiers_gain_a_scheme() {
        assert_eq!(
            normalize_identifier("github.com/rust-lang/rust"),
            "https://github.com/rust-lang/rust"
        );
        assert_eq!(normalize_identifier("./local"), "./local");
    }
}
