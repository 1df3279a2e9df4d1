//! GitHub REST API backend.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use url::Url;

use super::remote::{RemoteClient, explicit_ref, resolve_ref, scope_entries};
use super::{DiscoverOptions, Discovery, ParsedLocation, SourceMetadata};
use crate::domain::errors::SourceError;
use crate::domain::model::{FetchRef, FileContent, PathEntry};

const API_BASE: &str = "https://api.github.com";
const PER_PAGE: usize = 100;
const MAX_REF_PAGES: usize = 50;

#[derive(Debug, Deserialize)]
struct RepoInfo {
    default_branch: String,
}

#[derive(Debug, Deserialize)]
struct NamedRef {
    name: String,
}

#[derive(Debug, Deserialize)]
struct CommitInfo {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct TreeResponse {
    #[serde(default)]
    tree: Vec<TreeItem>,
    #[serde(default)]
    truncated: bool,
}

#[derive(Debug, Deserialize)]
struct TreeItem {
    path: String,
    #[serde(rename = "type")]
    kind: String,
    url: Option<String>,
    size: Option<u64>,
}

/// `https://github.com/{owner}/{repo}[.git][/(tree|blob)/{ref-and-path}]`
pub fn parse_url(identifier: &str) -> ParsedLocation {
    let invalid = |message: &str| ParsedLocation::invalid(SourceError::invalid_url(message));

    let Ok(url) = Url::parse(identifier) else {
        return invalid("not a valid URL");
    };
    if !matches!(url.scheme(), "http" | "https") {
        return invalid("GitHub URLs must use http or https");
    }
    let segments: Vec<&str> = url
        .path_segments()
        .map(|segments| segments.filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();
    let [owner, repo, rest @ ..] = segments.as_slice() else {
        return invalid("expected https://github.com/<owner>/<repo>");
    };

    let repo = repo.strip_suffix(".git").unwrap_or(*repo);
    let ref_and_path = match rest {
        [kind, tail @ ..] if matches!(*kind, "tree" | "blob") && !tail.is_empty() => {
            Some(tail.join("/"))
        }
        _ => None,
    };

    ParsedLocation::remote(owner, repo, ref_and_path)
}

pub(crate) async fn discover(
    client: &RemoteClient<'_>,
    location: &ParsedLocation,
    options: &DiscoverOptions,
) -> Result<Discovery, SourceError> {
    let owner = location.owner.as_deref().unwrap_or_default();
    let repo = location.repo.as_deref().unwrap_or_default();
    let base = format!("{API_BASE}/repos/{owner}/{repo}");

    let (git_ref, scope) = match (options.git_ref.as_deref(), location.ref_and_path.as_deref()) {
        (Some(requested), segment) => explicit_ref(requested, segment),
        (None, Some(segment)) => {
            let refs = list_refs(client, &base).await?;
            resolve_ref(&refs, segment)
        }
        (None, None) => {
            let info: RepoInfo = client.get_json(&base, "repository").await?;
            (info.default_branch, None)
        }
    };

    let commit: CommitInfo = client
        .get_json(&format!("{base}/commits/{git_ref}"), "commit")
        .await?;
    let tree: TreeResponse = client
        .get_json(
            &format!("{base}/git/trees/{}?recursive=1", commit.sha),
            "tree",
        )
        .await?;
    if tree.truncated {
        tracing::warn!(
            repo = %format!("{owner}/{repo}"),
            "GitHub truncated the recursive tree listing; some files are missing"
        );
    }

    let entries = tree
        .tree
        .into_iter()
        .filter_map(|item| match item.kind.as_str() {
            "blob" => {
                let url = item.url?;
                let entry = PathEntry::file(item.path, FetchRef::Url(url));
                Some(match item.size {
                    Some(size) => entry.with_size(size),
                    None => entry,
                })
            }
            "tree" => Some(PathEntry::directory(item.path)),
            other => {
                tracing::debug!(path = %item.path, kind = other, "skipping tree item");
                None
            }
        })
        .filter(|entry| options.within_size_limit(entry))
        .collect();

    Ok(Discovery {
        entries: scope_entries(entries, scope.as_deref()),
        metadata: SourceMetadata {
            name: repo.to_owned(),
            owner: Some(owner.to_owned()),
            git_ref: Some(git_ref),
            path: scope,
        },
    })
}

async fn list_refs(client: &RemoteClient<'_>, base: &str) -> Result<Vec<String>, SourceError> {
    let mut names = Vec::new();
    for kind in ["branches", "tags"] {
        for page in 1..=MAX_REF_PAGES {
            let batch: Vec<NamedRef> = client
                .get_json(&format!("{base}/{kind}?per_page={PER_PAGE}&page={page}"), kind)
                .await?;
            let done = batch.len() < PER_PAGE;
            names.extend(batch.into_iter().map(|r| r.name));
            if done {
                break;
            }
        }
    }
    tracing::debug!(count = names.len(), "listed branches and tags");
    Ok(names)
}

pub(crate) async fn fetch_file(
    client: &RemoteClient<'_>,
    path: &str,
    url: &str,
) -> Result<FileContent, SourceError> {
    let response = client.get(url, path).await?;
    let bytes = decode_blob(&response.body)?;
    Ok(FileContent::from_bytes(path, &bytes))
}

/// Decode a blob response: a JSON envelope with base64 `content`, or raw text.
pub fn decode_blob(body: &[u8]) -> Result<Vec<u8>, SourceError> {
    #[derive(Deserialize)]
    struct Envelope {
        content: String,
        encoding: Option<String>,
    }

    let Ok(envelope) = serde_json::from_slice::<Envelope>(body) else {
        return Ok(body.to_vec());
    };
    match envelope.encoding.as_deref() {
        Some("base64") => {
            let compact: String = envelope
                .content
                .chars()
                .filter(|c| !c.is_whitespace())
                .collect();
            Ok(STANDARD.decode(compact)?)
        }
        _ => Ok(envelope.content.into_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::domain::errors::SourceErrorKind;
    use crate::infra::http::{HttpResponse, MemoryTransport};
    use crate::providers::RepositorySource;
    use crate::providers::remote::{RemoteHost, RemoteSource};

    const REPO: &str = "https://api.github.com/repos/acme/widgets";

    fn tree_body() -> serde_json::Value {
        json!({
            "sha": "abc123",
            "truncated": false,
            "tree": [
                {"path": "README.md", "type": "blob", "url": format!("{REPO}/git/blobs/1"), "size": 12},
                {"path": "src", "type": "tree", "url": format!("{REPO}/git/trees/2")},
                {"path": "src/index.ts", "type": "blob", "url": format!("{REPO}/git/blobs/3"), "size": 20},
                {"path": "vendor/lib", "type": "commit"}
            ]
        })
    }

    #[test]
    fn parses_repository_urls() {
        let plain = parse_url("https://github.com/acme/widgets.git");
        assert!(plain.valid);
        assert_eq!(plain.owner.as_deref(), Some("acme"));
        assert_eq!(plain.repo.as_deref(), Some("widgets"));
        assert!(plain.ref_and_path.is_none());

        let deep = parse_url("https://github.com/acme/widgets/tree/feature/x/src/app");
        assert_eq!(deep.ref_and_path.as_deref(), Some("feature/x/src/app"));

        let bad = parse_url("https://github.com/acme");
        assert!(!bad.valid);
        assert_eq!(bad.error.map(|e| e.kind), Some(SourceErrorKind::InvalidUrl));
    }

    #[test]
    fn decodes_base64_envelopes_with_line_breaks() {
        let body = json!({"content": "aGVs\nbG8=\n", "encoding": "base64"}).to_string();
        assert_eq!(decode_blob(body.as_bytes()).unwrap(), b"hello");
        assert_eq!(decode_blob(b"plain text").unwrap(), b"plain text");

        let broken = json!({"content": "@@@", "encoding": "base64"}).to_string();
        assert_eq!(
            decode_blob(broken.as_bytes()).unwrap_err().kind,
            SourceErrorKind::ParseError
        );
    }

    #[tokio::test]
    async fn discovers_default_branch_tree() {
        let transport = MemoryTransport::new()
            .json(REPO, json!({"default_branch": "main"}))
            .json(format!("{REPO}/commits/main"), json!({"sha": "abc123"}))
            .json(format!("{REPO}/git/trees/abc123?recursive=1"), tree_body())
            .json(
                format!("{REPO}/git/blobs/1"),
                json!({"content": "IyBXaWRnZXRz\n", "encoding": "base64"}),
            );
        let mut source = RemoteSource::new(RemoteHost::GitHub, Arc::new(transport));

        let entries = source
            .discover_tree("https://github.com/acme/widgets", &DiscoverOptions::default())
            .await
            .unwrap();
        let paths: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["README.md", "src", "src/index.ts"]);

        let metadata = source.metadata().unwrap();
        assert_eq!(metadata.git_ref.as_deref(), Some("main"));
        assert_eq!(metadata.owner.as_deref(), Some("acme"));

        let readme = source.fetch_file(&entries[0]).await.unwrap();
        assert_eq!(readme.text, "# Widgets");
    }

    #[tokio::test]
    async fn resolves_slashed_branch_and_scopes_path() {
        let transport = MemoryTransport::new()
            .json(
                format!("{REPO}/branches?per_page=100&page=1"),
                json!([{"name": "main"}, {"name": "feature"}, {"name": "feature/test"}]),
            )
            .json(format!("{REPO}/tags?per_page=100&page=1"), json!([]))
            .json(format!("{REPO}/commits/feature/test"), json!({"sha": "abc123"}))
            .json(format!("{REPO}/git/trees/abc123?recursive=1"), tree_body());
        let mut source = RemoteSource::new(RemoteHost::GitHub, Arc::new(transport));

        let entries = source
            .discover_tree(
                "https://github.com/acme/widgets/tree/feature/test/src",
                &DiscoverOptions::default(),
            )
            .await
            .unwrap();
        let paths: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["src", "src/index.ts"]);
        let metadata = source.metadata().unwrap();
        assert_eq!(metadata.git_ref.as_deref(), Some("feature/test"));
        assert_eq!(metadata.path.as_deref(), Some("src"));
    }

    #[tokio::test]
    async fn commit_permalink_resolves_without_matching_ref() {
        let sha = "0123456789abcdef0123456789abcdef01234567";
        let transport = MemoryTransport::new()
            .json(format!("{REPO}/branches?per_page=100&page=1"), json!([{"name": "main"}]))
            .json(format!("{REPO}/tags?per_page=100&page=1"), json!([]))
            .json(format!("{REPO}/commits/{sha}"), json!({"sha": "abc123"}))
            .json(format!("{REPO}/git/trees/abc123?recursive=1"), tree_body());
        let mut source = RemoteSource::new(RemoteHost::GitHub, Arc::new(transport));

        let entries = source
            .discover_tree(
                &format!("https://github.com/acme/widgets/tree/{sha}/src"),
                &DiscoverOptions::default(),
            )
            .await
            .unwrap();
        let paths: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["src", "src/index.ts"]);
        assert_eq!(source.metadata().unwrap().git_ref.as_deref(), Some(sha));
    }

    #[tokio::test]
    async fn unknown_ref_is_not_found() {
        let transport = MemoryTransport::new()
            .json(format!("{REPO}/branches?per_page=100&page=1"), json!([{"name": "main"}]))
            .json(format!("{REPO}/tags?per_page=100&page=1"), json!([]))
            .route(
                format!("{REPO}/commits/nope"),
                HttpResponse::new(404, r#"{"message":"No commit found for SHA: nope"}"#),
            );
        let mut source = RemoteSource::new(RemoteHost::GitHub, Arc::new(transport));

        let err = source
            .discover_tree(
                "https://github.com/acme/widgets/tree/nope/src",
                &DiscoverOptions::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, SourceErrorKind::NotFound);
    }

    #[tokio::test]
    async fn batch_fetch_retries_transient_failures() {
        use std::time::Duration;

        use futures::StreamExt;

        use crate::app::fetcher::{BoundedFetcher, FetchConfig};

        let readme = format!("{REPO}/git/blobs/1");
        let index = format!("{REPO}/git/blobs/3");
        let transport = Arc::new(
            MemoryTransport::new()
                .json(REPO, json!({"default_branch": "main"}))
                .json(format!("{REPO}/commits/main"), json!({"sha": "abc123"}))
                .json(format!("{REPO}/git/trees/abc123?recursive=1"), tree_body())
                .sequence(
                    readme.clone(),
                    [
                        Err(SourceError::network("connection reset")),
                        Ok(HttpResponse::new(502, "")),
                        Ok(HttpResponse::new(
                            200,
                            json!({"content": "IyBXaWRnZXRz\n", "encoding": "base64"}).to_string(),
                        )),
                    ],
                )
                .route(index.clone(), HttpResponse::new(503, "")),
        );
        let mut source = RepositorySource::detect(
            "https://github.com/acme/widgets",
            Arc::clone(&transport) as Arc<dyn crate::infra::http::HttpTransport>,
        );
        let entries: Vec<PathEntry> = source
            .discover_tree("https://github.com/acme/widgets", &DiscoverOptions::default())
            .await
            .unwrap()
            .into_iter()
            .filter(|entry| !entry.kind.is_dir())
            .collect();

        let fetcher = BoundedFetcher::new(FetchConfig {
            max_concurrent: 2,
            retries: 2,
            retry_delay: Duration::from_millis(1),
            min_start_interval: None,
        });
        let results: Vec<_> = source.fetch_many(entries, &fetcher).collect().await;
        assert_eq!(results.len(), 2);

        let fetched: Vec<&FileContent> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].path, "README.md");
        assert_eq!(fetched[0].text, "# Widgets");

        let failed: Vec<_> = results.iter().filter_map(|r| r.as_ref().err()).collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].path, "src/index.ts");
        assert_eq!(failed[0].error.kind, SourceErrorKind::NetworkError);

        let requests = transport.requests();
        let hits = |url: &str| requests.iter().filter(|r| r.url == url).count();
        assert_eq!(hits(&readme), 3);
        assert_eq!(hits(&index), 3);
    }

    #[tokio::test]
    async fn private_repository_requires_auth() {
        let transport = MemoryTransport::new().route(
            REPO,
            HttpResponse::new(401, r#"{"message":"Requires authentication"}"#),
        );
        let mut source =
            RepositorySource::detect("https://github.com/acme/widgets", Arc::new(transport));

        let err = source
            .discover_tree("https://github.com/acme/widgets", &DiscoverOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind, SourceErrorKind::AuthRequired);
        assert!(source.requires_auth());
        assert!(err.report().contains("github.com/settings/tokens"));
    }

    #[tokio::test]
    async fn sends_bearer_token() {
        let transport = Arc::new(
            MemoryTransport::new().json(REPO, json!({"default_branch": "main"})),
        );
        let mut source = RemoteSource::new(RemoteHost::GitHub, transport.clone());
        source.set_credentials(crate::infra::credentials::Credentials::token("ghp_x"));
        let _ = source
            .discover_tree("https://github.com/acme/widgets", &DiscoverOptions::default())
            .await;

        let first = &transport.requests()[0];
        assert!(first
            .headers
            .iter()
            .any(|(k, v)| k == "Authorization" && v == "Bearer ghp_x"));
    }
}
