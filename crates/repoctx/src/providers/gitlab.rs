//! GitLab REST API (v4) backend, for gitlab.com and self-managed instances.

use serde::Deserialize;
use serde::de::DeserializeOwned;
use url::Url;

use super::remote::{
    RemoteClient, RemoteHost, encode_component, explicit_ref, resolve_ref, scope_entries,
};
use super::{DiscoverOptions, Discovery, ParsedLocation, SourceMetadata};
use crate::domain::errors::SourceError;
use crate::domain::model::{FetchRef, FileContent, PathEntry};

const PER_PAGE: usize = 100;
const MAX_PAGES: usize = 200;

#[derive(Debug, Deserialize)]
struct ProjectInfo {
    default_branch: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NamedRef {
    name: String,
}

#[derive(Debug, Deserialize)]
struct CommitInfo {
    id: String,
}

#[derive(Debug, Deserialize)]
struct TreeItem {
    path: String,
    #[serde(rename = "type")]
    kind: String,
}

/// `https://{host}/{namespace...}/{project}[.git][/-/(tree|blob)/{ref-and-path}]`
pub fn parse_url(identifier: &str) -> ParsedLocation {
    let invalid = |message: &str| ParsedLocation::invalid(SourceError::invalid_url(message));

    let Ok(url) = Url::parse(identifier) else {
        return invalid("not a valid URL");
    };
    if !matches!(url.scheme(), "http" | "https") {
        return invalid("GitLab URLs must use http or https");
    }
    let segments: Vec<&str> = url
        .path_segments()
        .map(|segments| segments.filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();

    let (project, rest) = match segments.iter().position(|s| *s == "-") {
        Some(index) => (&segments[..index], &segments[index + 1..]),
        None => (segments.as_slice(), &segments[segments.len()..]),
    };
    let [namespace @ .., name] = project else {
        return invalid("expected https://gitlab.com/<namespace>/<project>");
    };
    if namespace.is_empty() {
        return invalid("expected https://gitlab.com/<namespace>/<project>");
    }

    let name = name.strip_suffix(".git").unwrap_or(*name);
    let ref_and_path = match rest {
        [kind, tail @ ..] if matches!(*kind, "tree" | "blob") && !tail.is_empty() => {
            Some(tail.join("/"))
        }
        _ => None,
    };

    ParsedLocation::remote(&namespace.join("/"), name, ref_and_path)
}

fn api_base(client: &RemoteClient<'_>, location: &ParsedLocation) -> String {
    let origin = match client.host() {
        RemoteHost::GitLab { origin } => origin.as_str(),
        RemoteHost::GitHub => "https://gitlab.com",
    };
    let full_path = format!(
        "{}/{}",
        location.owner.as_deref().unwrap_or_default(),
        location.repo.as_deref().unwrap_or_default()
    );
    format!("{origin}/api/v4/projects/{}", encode_component(&full_path))
}

pub(crate) async fn discover(
    client: &RemoteClient<'_>,
    location: &ParsedLocation,
    options: &DiscoverOptions,
) -> Result<Discovery, SourceError> {
    let base = api_base(client, location);
    let name = location.repo.clone().unwrap_or_default();

    let (git_ref, scope) = match (options.git_ref.as_deref(), location.ref_and_path.as_deref()) {
        (Some(requested), segment) => explicit_ref(requested, segment),
        (None, Some(segment)) => {
            let mut refs = Vec::new();
            for kind in ["branches", "tags"] {
                let batch: Vec<NamedRef> =
                    paged(client, &format!("{base}/repository/{kind}"), kind).await?;
                refs.extend(batch.into_iter().map(|r| r.name));
            }
            resolve_ref(&refs, segment)
        }
        (None, None) => {
            let info: ProjectInfo = client.get_json(&base, "project").await?;
            let branch = info
                .default_branch
                .ok_or_else(|| SourceError::not_found(format!("{name}: repository is empty")))?;
            (branch, None)
        }
    };

    let commit: CommitInfo = client
        .get_json(
            &format!("{base}/repository/commits/{}", encode_component(&git_ref)),
            "commit",
        )
        .await?;

    let items: Vec<TreeItem> = paged(
        client,
        &format!("{base}/repository/tree?recursive=true&ref={}", commit.id),
        "tree",
    )
    .await?;

    let entries = items
        .into_iter()
        .filter_map(|item| match item.kind.as_str() {
            "blob" => {
                let url = format!(
                    "{base}/repository/files/{}/raw?ref={}",
                    encode_component(&item.path),
                    commit.id
                );
                Some(PathEntry::file(item.path, FetchRef::Url(url)))
            }
            "tree" => Some(PathEntry::directory(item.path)),
            other => {
                tracing::debug!(path = %item.path, kind = other, "skipping tree item");
                None
            }
        })
        .collect();

    Ok(Discovery {
        entries: scope_entries(entries, scope.as_deref()),
        metadata: SourceMetadata {
            name,
            owner: location.owner.clone(),
            git_ref: Some(git_ref),
            path: scope,
        },
    })
}

/// Follow `x-next-page` until the listing is exhausted.
async fn paged<T: DeserializeOwned>(
    client: &RemoteClient<'_>,
    url: &str,
    context: &str,
) -> Result<Vec<T>, SourceError> {
    let separator = if url.contains('?') { '&' } else { '?' };
    let mut items = Vec::new();
    let mut page = 1usize;

    for _ in 0..MAX_PAGES {
        let response = client
            .get(&format!("{url}{separator}per_page={PER_PAGE}&page={page}"), context)
            .await?;
        let batch: Vec<T> = response.json()?;
        items.extend(batch);

        match response
            .header("x-next-page")
            .and_then(|next| next.trim().parse::<usize>().ok())
        {
            Some(next) if next > page => page = next,
            _ => return Ok(items),
        }
    }

    tracing::warn!(context, pages = MAX_PAGES, "GitLab listing truncated at page limit");
    Ok(items)
}

pub(crate) async fn fetch_file(
    client: &RemoteClient<'_>,
    path: &str,
    url: &str,
) -> Result<FileContent, SourceError> {
    let response = client.get(url, path).await?;
    Ok(FileContent::from_bytes(path, &response.body))
}
