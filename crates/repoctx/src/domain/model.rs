//! Domain models shared by providers, the selection tree, and the formatter.

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

/// Whether a repository entry is a file or a directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
}

impl EntryKind {
    pub fn is_dir(&self) -> bool {
        matches!(self, EntryKind::Directory)
    }
}

/// Provider-specific coordinates used to retrieve an entry's contents.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FetchRef {
    /// API or raw URL on a remote hosting provider.
    Url(String),
    /// Absolute location of a file on the local filesystem.
    Local(PathBuf),
    /// Index of the entry inside an in-memory zip archive.
    Archive(usize),
    /// Nothing to fetch (synthesized directories).
    None,
}

/// One file or directory produced by a repository source.
///
/// `path` is repository-relative, forward-slash separated, and never carries a leading slash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathEntry {
    pub path: String,
    pub kind: EntryKind,
    pub size: Option<u64>,
    pub fetch_ref: FetchRef,
}

impl PathEntry {
    pub fn file(path: impl Into<String>, fetch_ref: FetchRef) -> Self {
        Self {
            path: normalize_path(&path.into()),
            kind: EntryKind::File,
            size: None,
            fetch_ref,
        }
    }

    pub fn directory(path: impl Into<String>) -> Self {
        Self {
            path: normalize_path(&path.into()),
            kind: EntryKind::Directory,
            size: None,
            fetch_ref: FetchRef::None,
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    /// Final path segment.
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// Number of `/`-separated segments below the root.
    pub fn depth(&self) -> usize {
        self.path.split('/').filter(|s| !s.is_empty()).count()
    }
}

/// Normalize a provider path: backslashes become `/`, `.` and empty segments are dropped.
pub fn normalize_path(raw: &str) -> String {
    raw.replace('\\', "/")
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Tri-state selection flag of a tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckState {
    #[default]
    Checked,
    Unchecked,
    Indeterminate,
}

impl CheckState {
    pub fn from_bool(selected: bool) -> Self {
        if selected {
            CheckState::Checked
        } else {
            CheckState::Unchecked
        }
    }

    pub fn is_checked(&self) -> bool {
        matches!(self, CheckState::Checked)
    }

    /// Marker used by the `--list` view.
    pub fn marker(&self) -> &'static str {
        match self {
            CheckState::Checked => "[x]",
            CheckState::Unchecked => "[ ]",
            CheckState::Indeterminate => "[~]",
        }
    }
}

impl fmt::Display for CheckState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.marker())
    }
}

/// Text of one fetched file.
///
/// `token_count` stays `None` until the formatter fills it in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileContent {
    pub path: String,
    pub text: String,
    pub line_count: usize,
    pub token_count: Option<usize>,
}

impl FileContent {
    pub fn new(path: impl Into<String>, text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            path: normalize_path(&path.into()),
            line_count: count_lines(&text),
            text,
            token_count: None,
        }
    }

    /// Decode raw bytes as UTF-8, replacing invalid sequences.
    pub fn from_bytes(path: impl Into<String>, bytes: &[u8]) -> Self {
        Self::new(path, String::from_utf8_lossy(bytes).into_owned())
    }
}

pub fn count_lines(text: &str) -> usize {
    text.lines().count()
}

/// Final rendered artifact. A new render always produces a new value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FormattedOutput {
    pub directory_tree: String,
    pub file_contents: String,
    pub token_count: usize,
    pub line_count: usize,
    pub files: Vec<FileContent>,
}

impl FormattedOutput {
    /// Full artifact: directory section followed by the file section.
    pub fn text(&self) -> String {
        format!("{}\n{}", self.directory_tree, self.file_contents)
    }
}
