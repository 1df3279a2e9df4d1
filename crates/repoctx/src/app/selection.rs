//! Hierarchical, tri-state selection over a flat set of repository entries.

use std::cmp::Ordering;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;

use crate::app::gitignore::GitignoreMatcher;
use crate::domain::model::{CheckState, EntryKind, PathEntry, normalize_path};

/// One node of the selection tree. Directory states are derived from their children and can
/// only change through [`SelectionTree`] operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeNode {
    name: String,
    path: String,
    kind: EntryKind,
    selected: CheckState,
    visible: bool,
    excluded: bool,
    children: Vec<TreeNode>,
}

impl TreeNode {
    /// Final path segment.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Normalized repository-relative path.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }

    /// Own state for files; the aggregate of the children for directories.
    pub fn selected(&self) -> CheckState {
        self.selected
    }

    /// False when the extension filter hides this file, or every file below this directory.
    pub fn is_visible(&self) -> bool {
        self.visible
    }

    /// True when an ignore pattern matches this node or one of its ancestors.
    pub fn is_excluded(&self) -> bool {
        self.excluded
    }

    /// Children in display order (directories first, then by name).
    pub fn children(&self) -> &[TreeNode] {
        &self.children
    }

    /// Extension including the leading dot, lowercased; empty when the name has none.
    pub fn extension(&self) -> String {
        extension_of(&self.name)
    }

    fn set_all(&mut self, state: CheckState) {
        self.selected = state;
        for child in &mut self.children {
            child.set_all(state);
        }
    }

    fn recompute(&mut self) -> CheckState {
        if self.children.is_empty() {
            return self.selected;
        }
        let states: Vec<CheckState> = self.children.iter_mut().map(TreeNode::recompute).collect();
        self.selected = aggregate(&states);
        self.selected
    }
}

/// Per-extension statistics used by the extension filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExtensionFilter {
    pub extension: String,
    pub count: usize,
    pub selected: bool,
}

/// Navigable, selectable view over a repository listing.
#[derive(Debug, Clone, Default)]
pub struct SelectionTree {
    roots: Vec<TreeNode>,
    entries: Arc<HashMap<String, PathEntry>>,
    extensions: Vec<ExtensionFilter>,
}

impl SelectionTree {
    /// Build a tree from a flat listing. Every file starts selected.
    ///
    /// Entries are attached shallowest first so intermediate directories exist before their
    /// children. Duplicate paths and files that would need to act as directories are dropped
    /// with a warning.
    pub fn build(entries: &[PathEntry]) -> Self {
        let mut sorted: Vec<&PathEntry> = entries.iter().collect();
        sorted.sort_by(|a, b| {
            a.depth()
                .cmp(&b.depth())
                .then_with(|| a.path.cmp(&b.path))
        });

        let mut root = Draft::directory();
        let mut by_path: HashMap<String, PathEntry> = HashMap::with_capacity(sorted.len());

        for entry in sorted {
            let path = normalize_path(&entry.path);
            if path.is_empty() {
                continue;
            }
            if by_path.contains_key(&path) {
                tracing::warn!(path = %path, "duplicate path in listing; keeping the first entry");
                continue;
            }
            if !root.insert(&path, entry.kind) {
                tracing::warn!(path = %path, "entry conflicts with an existing file; skipping");
                continue;
            }
            let mut normalized = entry.clone();
            normalized.path = path.clone();
            by_path.insert(path, normalized);
        }

        let mut roots = root.into_nodes("");
        for node in &mut roots {
            node.recompute();
        }

        let extensions = extension_stats(&roots);
        Self {
            roots,
            entries: Arc::new(by_path),
            extensions,
        }
    }

    /// Top-level nodes in display order.
    pub fn roots(&self) -> &[TreeNode] {
        &self.roots
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Extension statistics sorted by extension.
    pub fn extension_filters(&self) -> &[ExtensionFilter] {
        &self.extensions
    }

    /// Look up a node by path; leading slashes and `./` are ignored.
    pub fn node(&self, path: &str) -> Option<&TreeNode> {
        let path = normalize_path(path);
        let mut segments = path.split('/');
        let first = segments.next()?;
        let mut node = self.roots.iter().find(|n| n.name == first)?;
        for segment in segments {
            node = node.children.iter().find(|n| n.name == segment)?;
        }
        Some(node)
    }

    /// Provider entry backing a path, if the listing contained one.
    pub fn entry(&self, path: &str) -> Option<&PathEntry> {
        self.entries.get(path)
    }

    /// Flip a node. Files toggle between checked and unchecked; directories check every
    /// descendant unless they are fully checked, in which case everything is unchecked.
    /// Returns `false` when the path is unknown.
    pub fn toggle(&mut self, path: &str) -> bool {
        let Some(node) = find_mut(&mut self.roots, &normalize_path(path)) else {
            return false;
        };
        let target = CheckState::from_bool(!node.selected.is_checked());
        node.set_all(target);
        self.recompute();
        true
    }

    /// Set a node and all of its descendants to an explicit value. Returns `false` when the
    /// path is unknown.
    pub fn set_selected(&mut self, path: &str, selected: bool) -> bool {
        let Some(node) = find_mut(&mut self.roots, &normalize_path(path)) else {
            return false;
        };
        node.set_all(CheckState::from_bool(selected));
        self.recompute();
        true
    }

    /// Check or uncheck every node.
    pub fn select_all(&mut self, selected: bool) {
        let state = CheckState::from_bool(selected);
        for node in &mut self.roots {
            node.set_all(state);
        }
        self.recompute();
    }

    /// Return a copy where only files with one of `extensions` are visible. An empty list shows
    /// everything.
    pub fn filter_by_extension<S: AsRef<str>>(&self, extensions: &[S]) -> Self {
        let wanted: HashSet<String> = extensions
            .iter()
            .map(|ext| normalize_extension(ext.as_ref()))
            .collect();
        let show_all = wanted.is_empty();

        let mut next = self.clone();
        for node in &mut next.roots {
            apply_visibility(node, &wanted, show_all);
        }
        for filter in &mut next.extensions {
            filter.selected = show_all || wanted.contains(&filter.extension);
        }
        next
    }

    /// Return a copy whose exclusion flags reflect `patterns`, replacing any previous ones.
    pub fn apply_gitignore<S: AsRef<str>>(&self, patterns: &[S]) -> Self {
        self.apply_matcher(&GitignoreMatcher::new(patterns))
    }

    /// Like [`SelectionTree::apply_gitignore`] with an already compiled matcher.
    pub fn apply_matcher(&self, matcher: &GitignoreMatcher) -> Self {
        let mut next = self.clone();
        for node in &mut next.roots {
            apply_exclusion(node, matcher, false);
        }
        next
    }

    /// Every node in display order (pre-order, directories before files).
    pub fn flatten(&self) -> Vec<&TreeNode> {
        let mut out = Vec::new();
        for node in &self.roots {
            collect(node, &mut out);
        }
        out
    }

    /// Files that will be fetched: checked, visible and not excluded, in display order.
    pub fn selected_files(&self) -> Vec<&TreeNode> {
        self.flatten()
            .into_iter()
            .filter(|node| {
                !node.is_dir() && node.selected.is_checked() && node.visible && !node.excluded
            })
            .collect()
    }

    /// Provider entries for [`SelectionTree::selected_files`].
    pub fn selected_entries(&self) -> Vec<PathEntry> {
        self.selected_files()
            .into_iter()
            .filter_map(|node| self.entries.get(&node.path).cloned())
            .collect()
    }

    fn recompute(&mut self) {
        for node in &mut self.roots {
            node.recompute();
        }
    }
}

/// Aggregate child states: all checked, all unchecked, or indeterminate.
pub fn aggregate(states: &[CheckState]) -> CheckState {
    if states.iter().all(|s| *s == CheckState::Checked) {
        CheckState::Checked
    } else if states.iter().all(|s| *s == CheckState::Unchecked) {
        CheckState::Unchecked
    } else {
        CheckState::Indeterminate
    }
}

/// Directories before files, then by name.
pub fn display_order(a: &TreeNode, b: &TreeNode) -> Ordering {
    b.is_dir()
        .cmp(&a.is_dir())
        .then_with(|| a.name.cmp(&b.name))
}

pub fn extension_of(name: &str) -> String {
    match name.rfind('.') {
        Some(idx) if idx > 0 && idx + 1 < name.len() => name[idx..].to_ascii_lowercase(),
        _ => String::new(),
    }
}

/// `rs`, `.rs` and `.RS` all become `.rs`; an empty string stays empty (extensionless files).
pub fn normalize_extension(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    let lower = trimmed.to_ascii_lowercase();
    if lower.starts_with('.') {
        lower
    } else {
        format!(".{lower}")
    }
}

#[derive(Debug)]
struct Draft {
    kind: EntryKind,
    children: BTreeMap<String, Draft>,
}

impl Draft {
    fn directory() -> Self {
        Self {
            kind: EntryKind::Directory,
            children: BTreeMap::new(),
        }
    }

    fn insert(&mut self, path: &str, kind: EntryKind) -> bool {
        let segments: Vec<&str> = path.split('/').collect();
        let Some((leaf, parents)) = segments.split_last() else {
            return false;
        };

        let mut cursor = self;
        for segment in parents {
            cursor = cursor
                .children
                .entry((*segment).to_owned())
                .or_insert_with(Draft::directory);
            if !cursor.kind.is_dir() {
                return false;
            }
        }

        match cursor.children.entry((*leaf).to_owned()) {
            Entry::Vacant(slot) => {
                slot.insert(Draft {
                    kind,
                    children: BTreeMap::new(),
                });
                true
            }
            // A directory synthesized for a deeper entry can still be claimed explicitly.
            Entry::Occupied(existing) => existing.get().kind.is_dir() && kind.is_dir(),
        }
    }

    fn into_nodes(self, parent: &str) -> Vec<TreeNode> {
        let mut nodes: Vec<TreeNode> = self
            .children
            .into_iter()
            .map(|(name, draft)| {
                let path = if parent.is_empty() {
                    name.clone()
                } else {
                    format!("{parent}/{name}")
                };
                let kind = draft.kind;
                let children = draft.into_nodes(&path);
                TreeNode {
                    name,
                    path,
                    kind,
                    selected: CheckState::Checked,
                    visible: true,
                    excluded: false,
                    children,
                }
            })
            .collect();
        nodes.sort_by(display_order);
        nodes
    }
}

fn find_mut<'a>(nodes: &'a mut [TreeNode], path: &str) -> Option<&'a mut TreeNode> {
    let mut segments = path.split('/');
    let first = segments.next()?;
    let mut node = nodes.iter_mut().find(|n| n.name == first)?;
    for segment in segments {
        node = node.children.iter_mut().find(|n| n.name == segment)?;
    }
    Some(node)
}

fn collect<'a>(node: &'a TreeNode, out: &mut Vec<&'a TreeNode>) {
    out.push(node);
    for child in &node.children {
        collect(child, out);
    }
}

fn apply_visibility(node: &mut TreeNode, wanted: &HashSet<String>, show_all: bool) -> bool {
    node.visible = if node.is_dir() {
        let mut any = false;
        for child in &mut node.children {
            any |= apply_visibility(child, wanted, show_all);
        }
        any || (node.children.is_empty() && show_all)
    } else {
        show_all || wanted.contains(&node.extension())
    };
    node.visible
}

fn apply_exclusion(node: &mut TreeNode, matcher: &GitignoreMatcher, parent_excluded: bool) {
    node.excluded = parent_excluded || matcher.excludes_entry(&node.path, node.is_dir());
    let excluded = node.excluded;
    for child in &mut node.children {
        apply_exclusion(child, matcher, excluded);
    }
}

fn extension_stats(roots: &[TreeNode]) -> Vec<ExtensionFilter> {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    let mut stack: Vec<&TreeNode> = roots.iter().collect();
    while let Some(node) = stack.pop() {
        if node.is_dir() {
            stack.extend(node.children.iter());
        } else {
            *counts.entry(node.extension()).or_default() += 1;
        }
    }
    counts
        .into_iter()
        .map(|(extension, count)| ExtensionFilter {
            extension,
            count,
            selected: true,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::domain::model::FetchRef;

    fn file(path: &str) -> PathEntry {
        PathEntry::file(path, FetchRef::None)
    }

    fn dir(path: &str) -> PathEntry {
        PathEntry::directory(path)
    }

    fn sample() -> SelectionTree {
        SelectionTree::build(&[
            file("src/app/main.rs"),
            file("src/app/util.rs"),
            file("src/lib.rs"),
            dir("src"),
            file("README.md"),
            file("Makefile"),
            dir("docs"),
        ])
    }

    fn paths(tree: &SelectionTree) -> Vec<&str> {
        tree.flatten().into_iter().map(TreeNode::path).collect()
    }

    #[test]
    fn builds_intermediate_directories_in_display_order() {
        let tree = sample();
        assert_eq!(
            paths(&tree),
            vec![
                "docs",
                "src",
                "src/app",
                "src/app/main.rs",
                "src/app/util.rs",
                "src/lib.rs",
                "Makefile",
                "README.md",
            ]
        );
        assert!(tree.node("src/app").is_some_and(TreeNode::is_dir));
        assert!(tree.entry("src/app").is_none());
    }

    #[test]
    fn toggling_a_leaf_updates_every_ancestor() {
        let mut tree = sample();
        assert!(tree.toggle("src/app/main.rs"));

        let state = |p: &str| tree.node(p).unwrap().selected();
        assert_eq!(state("src/app/main.rs"), CheckState::Unchecked);
        assert_eq!(state("src/app"), CheckState::Indeterminate);
        assert_eq!(state("src"), CheckState::Indeterminate);

        tree.toggle("src/app/util.rs");
        assert_eq!(tree.node("src/app").unwrap().selected(), CheckState::Unchecked);
        assert_eq!(tree.node("src").unwrap().selected(), CheckState::Indeterminate);
    }

    #[test]
    fn toggling_a_directory_sets_all_descendants() {
        let mut tree = sample();
        tree.toggle("src/app/main.rs");
        tree.toggle("src");
        assert!(
            ["src", "src/app", "src/app/main.rs", "src/lib.rs"]
                .iter()
                .all(|p| tree.node(p).unwrap().selected() == CheckState::Checked)
        );

        tree.toggle("src");
        assert_eq!(tree.node("src/lib.rs").unwrap().selected(), CheckState::Unchecked);
        assert_eq!(tree.selected_files().len(), 2);
    }

    #[test]
    fn unknown_paths_are_ignored() {
        let mut tree = sample();
        assert!(!tree.toggle("missing/file.rs"));
        assert!(!tree.set_selected("src/nope", false));
    }

    #[test]
    fn empty_extension_filter_shows_everything() {
        let tree = sample().filter_by_extension::<&str>(&[]);
        assert!(tree.flatten().iter().all(|n| n.is_visible()));
    }

    #[test]
    fn extension_filter_returns_a_new_tree() {
        let original = sample();
        let filtered = original.filter_by_extension(&["rs"]);

        assert!(!filtered.node("README.md").unwrap().is_visible());
        assert!(!filtered.node("docs").unwrap().is_visible());
        assert!(filtered.node("src/app").unwrap().is_visible());
        assert!(original.node("README.md").unwrap().is_visible());

        let selected: Vec<_> = filtered
            .extension_filters()
            .iter()
            .filter(|f| f.selected)
            .map(|f| f.extension.as_str())
            .collect();
        assert_eq!(selected, vec![".rs"]);
    }

    #[test]
    fn extensionless_files_filter_on_empty_extension() {
        let tree = sample().filter_by_extension(&[""]);
        assert!(tree.node("Makefile").unwrap().is_visible());
        assert!(!tree.node("src/lib.rs").unwrap().is_visible());
    }

    #[test]
    fn extension_stats_count_files() {
        let tree = sample();
        let stats: Vec<_> = tree
            .extension_filters()
            .iter()
            .map(|f| (f.extension.as_str(), f.count))
            .collect();
        assert_eq!(stats, vec![("", 1), (".md", 1), (".rs", 3)]);
    }

    #[test]
    fn gitignore_excludes_descendants_and_is_idempotent() {
        let tree = sample();
        let once = tree.apply_gitignore(&["app/"]);
        let twice = once.apply_gitignore(&["app/"]);

        assert!(once.node("src/app").unwrap().is_excluded());
        assert!(once.node("src/app/main.rs").unwrap().is_excluded());
        assert!(!once.node("src/lib.rs").unwrap().is_excluded());

        let flags = |t: &SelectionTree| {
            t.flatten()
                .iter()
                .map(|n| n.is_excluded())
                .collect::<Vec<_>>()
        };
        assert_eq!(flags(&once), flags(&twice));

        let cleared = once.apply_gitignore::<&str>(&[]);
        assert!(cleared.flatten().iter().all(|n| !n.is_excluded()));
    }

    #[test]
    fn selected_entries_skip_excluded_and_hidden_files() {
        let tree = sample()
            .apply_gitignore(&["*.md"])
            .filter_by_extension(&[".rs", ".md"]);
        let selected: Vec<_> = tree
            .selected_entries()
            .into_iter()
            .map(|entry| entry.path)
            .collect();
        assert_eq!(selected, vec!["src/app/main.rs", "src/app/util.rs", "src/lib.rs"]);
    }

    #[test]
    fn duplicates_and_conflicts_are_dropped() {
        let tree = SelectionTree::build(&[
            file("a.txt"),
            file("/a.txt"),
            file("a.txt/inner.txt"),
        ]);
        assert_eq!(paths(&tree), vec!["a.txt"]);
    }

    #[test]
    fn empty_input_builds_empty_tree() {
        let tree = SelectionTree::build(&[]);
        assert!(tree.is_empty());
        assert!(tree.selected_entries().is_empty());
    }
}
