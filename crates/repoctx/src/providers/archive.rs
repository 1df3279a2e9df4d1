//! Zip archive backend. The archive is held in memory and entries are addressed by index.

use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::Arc;

use zip::ZipArchive;

use super::{DiscoverOptions, SourceMetadata};
use crate::domain::errors::{SourceError, SourceErrorKind};
use crate::domain::model::{FetchRef, FileContent, PathEntry, normalize_path};

#[derive(Debug, Clone)]
struct SharedBytes(Arc<Vec<u8>>);

impl AsRef<[u8]> for SharedBytes {
    fn as_ref(&self) -> &[u8] {
        self.0.as_slice()
    }
}

type Archive = ZipArchive<Cursor<SharedBytes>>;

/// Raw listing row before root stripping.
struct RawEntry {
    index: usize,
    path: String,
    is_dir: bool,
    size: u64,
}

/// Zip file loaded into memory.
#[derive(Debug, Default)]
pub struct ArchiveSource {
    archive: Option<Archive>,
    metadata: Option<SourceMetadata>,
}

impl ArchiveSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn metadata(&self) -> Option<&SourceMetadata> {
        self.metadata.as_ref()
    }

    pub async fn discover_tree(
        &mut self,
        identifier: &str,
        options: &DiscoverOptions,
    ) -> Result<Vec<PathEntry>, SourceError> {
        let path = Path::new(identifier.trim());
        let bytes = tokio::fs::read(path).await.map_err(|err| {
            SourceError::invalid_url(format!("cannot read archive {}: {err}", path.display()))
        })?;
        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| "archive".to_owned());
        self.load(name, bytes, options).await
    }

    /// Index an archive already in memory.
    pub async fn load(
        &mut self,
        name: impl Into<String>,
        bytes: Vec<u8>,
        options: &DiscoverOptions,
    ) -> Result<Vec<PathEntry>, SourceError> {
        let data = SharedBytes(Arc::new(bytes));
        let (archive, raw) = tokio::task::spawn_blocking(move || index_archive(data))
            .await
            .map_err(|err| {
                SourceError::new(SourceErrorKind::Unknown, format!("archive task failed: {err}"))
            })??;

        let entries = to_entries(raw, options);
        let name = name.into();
        tracing::info!(archive = %name, entries = entries.len(), "indexed zip archive");

        self.archive = Some(archive);
        self.metadata = Some(SourceMetadata {
            name,
            owner: None,
            git_ref: None,
            path: None,
        });
        Ok(entries)
    }

    pub async fn fetch_file(&self, entry: &PathEntry) -> Result<FileContent, SourceError> {
        let FetchRef::Archive(index) = entry.fetch_ref else {
            return Err(SourceError::parse(format!(
                "{} has no archive location",
                entry.path
            )));
        };
        let mut archive = self
            .archive
            .clone()
            .ok_or_else(|| SourceError::new(SourceErrorKind::Unknown, "archive not loaded"))?;
        let path = entry.path.clone();

        tokio::task::spawn_blocking(move || -> Result<FileContent, SourceError> {
            let mut file = archive.by_index(index)?;
            let mut bytes = Vec::with_capacity(usize::try_from(file.size()).unwrap_or_default());
            file.read_to_end(&mut bytes)?;
            Ok(FileContent::from_bytes(path, &bytes))
        })
        .await
        .map_err(|err| {
            SourceError::new(SourceErrorKind::Unknown, format!("archive task failed: {err}"))
        })?
    }
}

fn index_archive(data: SharedBytes) -> Result<(Archive, Vec<RawEntry>), SourceError> {
    let mut archive = ZipArchive::new(Cursor::new(data))?;
    let mut raw = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        let file = archive.by_index_raw(index)?;
        let path = normalize_path(file.name());
        if path.is_empty() || path.split('/').any(|segment| segment == "..") {
            continue;
        }
        raw.push(RawEntry {
            index,
            path,
            is_dir: file.is_dir(),
            size: file.size(),
        });
    }
    Ok((archive, raw))
}

fn is_os_junk(path: &str) -> bool {
    path == "__MACOSX" || path.starts_with("__MACOSX/") || path.ends_with(".DS_Store")
}

/// Folder shared by every entry, as produced by hosted "download zip" exports.
fn common_root(raw: &[RawEntry]) -> Option<String> {
    let first = raw.first()?.path.split('/').next()?.to_owned();
    let mut has_nested = false;
    for entry in raw {
        match entry.path.strip_prefix(first.as_str()) {
            Some("") if entry.is_dir => {}
            Some(rest) if rest.starts_with('/') => has_nested = true,
            _ => return None,
        }
    }
    has_nested.then_some(first)
}

fn to_entries(raw: Vec<RawEntry>, options: &DiscoverOptions) -> Vec<PathEntry> {
    let raw: Vec<RawEntry> = raw.into_iter().filter(|e| !is_os_junk(&e.path)).collect();
    let root = common_root(&raw);

    let mut entries: Vec<PathEntry> = raw
        .into_iter()
        .filter_map(|entry| {
            let path = match &root {
                Some(root) => entry
                    .path
                    .strip_prefix(root.as_str())?
                    .trim_start_matches('/')
                    .to_owned(),
                None => entry.path,
            };
            if path.is_empty() {
                return None;
            }
            if !options.show_hidden && path.split('/').any(|segment| segment.starts_with('.')) {
                return None;
            }
            let path_entry = if entry.is_dir {
                PathEntry::directory(path)
            } else {
                PathEntry::file(path, FetchRef::Archive(entry.index)).with_size(entry.size)
            };
            options.within_size_limit(&path_entry).then_some(path_entry)
        })
        .collect();
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    entries
}
