//! Repository sources: remote hosting APIs, local directories, and zip archives behind one
//! discovery and fetch contract.

pub mod archive;
pub mod github;
pub mod gitlab;
pub mod local;
pub mod remote;

use std::path::Path;
use std::sync::Arc;

use futures::stream::{Stream, StreamExt};
use url::Url;

use crate::app::export::OutputFormat;
use crate::app::fetcher::BoundedFetcher;
use crate::domain::errors::{FetchFailure, SourceError};
use crate::domain::model::{FileContent, PathEntry};
use crate::infra::config::Config;
use crate::infra::credentials::{Credentials, Host};
use crate::infra::http::HttpTransport;

pub use archive::ArchiveSource;
pub use local::LocalSource;
pub use remote::{RemoteHost, RemoteSource};

/// Knobs for tree discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoverOptions {
    /// Branch, tag, or commit to list instead of the one named in the URL.
    pub git_ref: Option<String>,
    pub show_hidden: bool,
    /// Honour `.gitignore` files while walking local directories.
    pub respect_gitignore: bool,
    /// Files larger than this are left out of the listing.
    pub max_file_size: Option<u64>,
}

impl Default for DiscoverOptions {
    fn default() -> Self {
        Self {
            git_ref: None,
            show_hidden: false,
            respect_gitignore: true,
            max_file_size: None,
        }
    }
}

impl DiscoverOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            show_hidden: config.defaults.show_hidden(),
            max_file_size: (config.defaults.max_file_size > 0)
                .then_some(config.defaults.max_file_size),
            ..Self::default()
        }
    }

    /// Directories always pass; files pass when their size is unknown or within the limit.
    pub fn within_size_limit(&self, entry: &PathEntry) -> bool {
        entry.kind.is_dir()
            || self
                .max_file_size
                .is_none_or(|max| entry.size.is_none_or(|size| size <= max))
    }
}

/// Result of parsing a source identifier without any I/O.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedLocation {
    pub owner: Option<String>,
    pub repo: Option<String>,
    /// First segment of a `ref/path` URL tail; branch names with `/` are resolved at discovery.
    pub git_ref: Option<String>,
    pub path: Option<String>,
    /// Unsplit `ref/path` tail as it appeared in the URL.
    pub ref_and_path: Option<String>,
    pub valid: bool,
    pub error: Option<SourceError>,
}

impl ParsedLocation {
    pub fn invalid(error: SourceError) -> Self {
        Self {
            valid: false,
            error: Some(error),
            ..Self::default()
        }
    }

    pub(crate) fn remote(owner: &str, repo: &str, ref_and_path: Option<String>) -> Self {
        let (git_ref, path) = match ref_and_path.as_deref().map(|tail| tail.split_once('/')) {
            Some(Some((git_ref, path))) => (Some(git_ref.to_owned()), Some(path.to_owned())),
            Some(None) => (ref_and_path.clone(), None),
            None => (None, None),
        };
        Self {
            owner: Some(owner.to_owned()),
            repo: Some(repo.to_owned()),
            git_ref,
            path,
            ref_and_path,
            valid: true,
            error: None,
        }
    }
}

/// Descriptive information recorded by the last successful discovery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceMetadata {
    pub name: String,
    pub owner: Option<String>,
    pub git_ref: Option<String>,
    pub path: Option<String>,
}

pub(crate) struct Discovery {
    pub entries: Vec<PathEntry>,
    pub metadata: SourceMetadata,
}

/// Closed set of supported backends.
#[derive(Debug)]
pub enum RepositorySource {
    Remote(RemoteSource),
    Filesystem(LocalSource),
    Archive(ArchiveSource),
}

impl RepositorySource {
    /// Pick a backend: `*.zip` is an archive, a GitHub or GitLab URL is remote, anything else
    /// is treated as a local directory.
    pub fn detect(identifier: &str, transport: Arc<dyn HttpTransport>) -> Self {
        let trimmed = identifier.trim();
        if trimmed.to_ascii_lowercase().ends_with(".zip") && !is_url(trimmed) {
            return RepositorySource::Archive(ArchiveSource::new());
        }
        let normalized = remote::normalize_identifier(trimmed);
        if let Ok(url) = Url::parse(&normalized)
            && let Some(host) = RemoteHost::from_url(&url)
        {
            return RepositorySource::Remote(RemoteSource::new(host, transport));
        }
        RepositorySource::Filesystem(LocalSource::new())
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            RepositorySource::Remote(source) => match source.host() {
                RemoteHost::GitHub => "github",
                RemoteHost::GitLab { .. } => "gitlab",
            },
            RepositorySource::Filesystem(_) => "filesystem",
            RepositorySource::Archive(_) => "archive",
        }
    }

    /// Host whose credentials this source uses, if any.
    pub fn credential_host(&self) -> Option<Host> {
        match self {
            RepositorySource::Remote(source) => Some(source.host().credential_host()),
            RepositorySource::Filesystem(_) | RepositorySource::Archive(_) => None,
        }
    }

    /// Cheap, format-only check.
    pub fn validate_url(&self, identifier: &str) -> bool {
        self.parse_url(identifier).valid
    }

    /// Parse an identifier without touching the network or disk.
    pub fn parse_url(&self, identifier: &str) -> ParsedLocation {
        let trimmed = identifier.trim();
        match self {
            RepositorySource::Remote(source) => source.parse_url(trimmed),
            RepositorySource::Filesystem(_) => {
                if trimmed.is_empty() || is_url(trimmed) {
                    return ParsedLocation::invalid(SourceError::invalid_url(
                        "expected a local directory path",
                    ));
                }
                ParsedLocation {
                    repo: file_name(trimmed),
                    valid: true,
                    ..ParsedLocation::default()
                }
            }
            RepositorySource::Archive(_) => {
                if !trimmed.to_ascii_lowercase().ends_with(".zip") {
                    return ParsedLocation::invalid(SourceError::invalid_url(
                        "expected a path ending in .zip",
                    ));
                }
                ParsedLocation {
                    repo: Path::new(trimmed)
                        .file_stem()
                        .map(|stem| stem.to_string_lossy().into_owned()),
                    valid: true,
                    ..ParsedLocation::default()
                }
            }
        }
    }

    /// List every entry in scope. Metadata is recorded for later file naming.
    pub async fn discover_tree(
        &mut self,
        identifier: &str,
        options: &DiscoverOptions,
    ) -> Result<Vec<PathEntry>, SourceError> {
        let location = self.parse_url(identifier);
        if !location.valid {
            return Err(location
                .error
                .unwrap_or_else(|| SourceError::invalid_url(identifier.to_owned())));
        }
        match self {
            RepositorySource::Remote(source) => source.discover_tree(identifier, options).await,
            RepositorySource::Filesystem(source) => source.discover_tree(identifier, options).await,
            RepositorySource::Archive(source) => source.discover_tree(identifier, options).await,
        }
    }

    pub async fn fetch_file(&self, entry: &PathEntry) -> Result<FileContent, SourceError> {
        match self {
            RepositorySource::Remote(source) => source.fetch_file(entry).await,
            RepositorySource::Filesystem(source) => source.fetch_file(entry).await,
            RepositorySource::Archive(source) => source.fetch_file(entry).await,
        }
    }

    /// Fetch many files through `fetcher`, yielding each result as soon as it completes.
    ///
    /// A failed entry is reported as a [`FetchFailure`] and never ends the stream.
    pub fn fetch_many<'a>(
        &'a self,
        entries: Vec<PathEntry>,
        fetcher: &BoundedFetcher,
    ) -> impl Stream<Item = Result<FileContent, FetchFailure>> + use<'a> {
        fetcher
            .run(entries, move |entry: PathEntry| async move {
                self.fetch_file(&entry).await
            })
            .map(|(entry, result)| {
                result.map_err(|error| {
                    tracing::warn!(path = %entry.path, error = %error, "file fetch failed");
                    FetchFailure {
                        path: entry.path,
                        error,
                    }
                })
            })
    }

    pub fn requires_auth(&self) -> bool {
        match self {
            RepositorySource::Remote(source) => source.requires_auth(),
            RepositorySource::Filesystem(_) | RepositorySource::Archive(_) => false,
        }
    }

    pub fn set_credentials(&mut self, credentials: Credentials) {
        match self {
            RepositorySource::Remote(source) => source.set_credentials(credentials),
            RepositorySource::Filesystem(_) | RepositorySource::Archive(_) => {
                tracing::debug!("credentials ignored for non-remote source");
            }
        }
    }

    pub fn metadata(&self) -> Option<&SourceMetadata> {
        match self {
            RepositorySource::Remote(source) => source.metadata(),
            RepositorySource::Filesystem(source) => source.metadata(),
            RepositorySource::Archive(source) => source.metadata(),
        }
    }

    /// File name for the rendered output, e.g. `acme-widgets-main-src.md`.
    pub fn suggested_file_name(&self, format: OutputFormat) -> String {
        let stem = match self.metadata() {
            Some(meta) => [
                meta.owner.as_deref(),
                Some(meta.name.as_str()),
                meta.git_ref.as_deref(),
                meta.path.as_deref(),
            ]
            .into_iter()
            .flatten()
            .map(sanitize)
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join("-"),
            None => String::new(),
        };
        let stem = if stem.is_empty() {
            "repoctx-output".to_owned()
        } else {
            stem
        };
        format!("{stem}.{}", format.extension())
    }
}

fn is_url(identifier: &str) -> bool {
    identifier.contains("://")
}

fn file_name(identifier: &str) -> Option<String> {
    Path::new(identifier)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
}

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect::<String>()
        .trim_matches('-')
        .to_owned()
}
