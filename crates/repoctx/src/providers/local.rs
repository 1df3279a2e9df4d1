//! Local directory backend.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use ignore::{DirEntry, WalkBuilder, WalkState};

use super::{DiscoverOptions, SourceMetadata};
use crate::domain::errors::{SourceError, SourceErrorKind};
use crate::domain::model::{FetchRef, FileContent, PathEntry};

/// Repository checked out on disk.
#[derive(Debug, Default)]
pub struct LocalSource {
    root: Option<PathBuf>,
    metadata: Option<SourceMetadata>,
}

impl LocalSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    pub fn metadata(&self) -> Option<&SourceMetadata> {
        self.metadata.as_ref()
    }

    pub async fn discover_tree(
        &mut self,
        identifier: &str,
        options: &DiscoverOptions,
    ) -> Result<Vec<PathEntry>, SourceError> {
        let root = PathBuf::from(identifier.trim());
        let metadata = tokio::fs::metadata(&root).await.map_err(|err| {
            SourceError::new(
                SourceErrorKind::InvalidUrl,
                format!("cannot open {}: {err}", root.display()),
            )
        })?;
        if !metadata.is_dir() {
            return Err(SourceError::invalid_url(format!(
                "{} is not a directory",
                root.display()
            )));
        }

        let walk_root = root.clone();
        let options = options.clone();
        let entries = tokio::task::spawn_blocking(move || walk(&walk_root, &options))
            .await
            .map_err(|err| {
                SourceError::new(SourceErrorKind::Unknown, format!("directory walk failed: {err}"))
            })?;

        let name = root
            .canonicalize()
            .ok()
            .as_deref()
            .and_then(Path::file_name)
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "repository".to_owned());
        tracing::info!(root = %root.display(), entries = entries.len(), "scanned local directory");

        self.metadata = Some(SourceMetadata {
            name,
            owner: None,
            git_ref: None,
            path: None,
        });
        self.root = Some(root);
        Ok(entries)
    }

    pub async fn fetch_file(&self, entry: &PathEntry) -> Result<FileContent, SourceError> {
        let FetchRef::Local(location) = &entry.fetch_ref else {
            return Err(SourceError::parse(format!(
                "{} has no local location",
                entry.path
            )));
        };
        let bytes = tokio::fs::read(location).await?;
        Ok(FileContent::from_bytes(&entry.path, &bytes))
    }
}

fn walk(root: &Path, options: &DiscoverOptions) -> Vec<PathEntry> {
    let mut builder = WalkBuilder::new(root);
    builder
        .hidden(!options.show_hidden)
        .git_ignore(options.respect_gitignore)
        .git_global(options.respect_gitignore)
        .git_exclude(options.respect_gitignore)
        .require_git(false)
        .filter_entry(|entry| entry.file_name() != ".git");

    let found = Mutex::new(Vec::new());
    builder.build_parallel().run(|| {
        let found = &found;
        Box::new(move |result| {
            match result {
                Ok(entry) => {
                    if let Some(path_entry) = to_path_entry(root, &entry, options)
                        && let Ok(mut guard) = found.lock()
                    {
                        guard.push(path_entry);
                    }
                }
                Err(err) => tracing::warn!(error = %err, "directory walk error"),
            }
            WalkState::Continue
        })
    });

    let mut entries = found.into_inner().unwrap_or_default();
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    entries
}

fn to_path_entry(root: &Path, entry: &DirEntry, options: &DiscoverOptions) -> Option<PathEntry> {
    if entry.depth() == 0 {
        return None;
    }
    let relative = relative_path(root, entry.path())?;
    let file_type = entry.file_type()?;

    if file_type.is_dir() {
        return Some(PathEntry::directory(relative));
    }
    if !file_type.is_file() {
        return None;
    }

    let size = entry.metadata().ok().map(|meta| meta.len());
    let path_entry = PathEntry::file(relative, FetchRef::Local(entry.path().to_path_buf()));
    let path_entry = match size {
        Some(size) => path_entry.with_size(size),
        None => path_entry,
    };
    if !options.within_size_limit(&path_entry) {
        tracing::debug!(path = %path_entry.path, size, "skipping file above size limit");
        return None;
    }
    Some(path_entry)
}

fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy().into_owned())
        .collect();
    (!parts.is_empty()).then(|| parts.join("/"))
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn paths(entries: &[PathEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.path.as_str()).collect()
    }

    #[tokio::test]
    async fn walks_directory_respecting_gitignore() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let root = temp.path();
        fs::create_dir_all(root.join("src"))?;
        fs::create_dir_all(root.join(".git"))?;
        fs::create_dir_all(root.join("generated"))?;
        fs::write(root.join("src/lib.rs"), "pub fn lib() {}\n")?;
        fs::write(root.join("README.md"), "# demo\n")?;
        fs::write(root.join("generated/out.txt"), "skip")?;
        fs::write(root.join(".git/HEAD"), "ref: refs/heads/main")?;
        fs::write(root.join(".gitignore"), "generated/\n")?;

        let mut source = LocalSource::new();
        let entries = source
            .discover_tree(&root.display().to_string(), &DiscoverOptions::default())
            .await?;

        assert_eq!(paths(&entries), vec!["README.md", "src", "src/lib.rs"]);
        let lib = source.fetch_file(&entries[2]).await?;
        assert_eq!(lib.text, "pub fn lib() {}\n");
        assert!(source.metadata().is_some());
        Ok(())
    }

    #[tokio::test]
    async fn hidden_files_and_size_limit_follow_options() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let root = temp.path();
        fs::write(root.join(".env.example"), "KEY=value\n")?;
        fs::write(root.join("big.txt"), "x".repeat(2048))?;
        fs::write(root.join("small.txt"), "ok")?;

        let options = DiscoverOptions {
            show_hidden: true,
            max_file_size: Some(1024),
            ..DiscoverOptions::default()
        };
        let entries = LocalSource::new()
            .discover_tree(&root.display().to_string(), &options)
            .await?;
        assert_eq!(paths(&entries), vec![".env.example", "small.txt"]);
        Ok(())
    }

    #[tokio::test]
    async fn missing_directory_is_invalid_input() {
        let err = LocalSource::new()
            .discover_tree("/definitely/not/here", &DiscoverOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind, SourceErrorKind::InvalidUrl);
    }
}
