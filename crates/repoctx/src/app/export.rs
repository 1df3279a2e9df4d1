//! Rendering of the selected subset into the final text artifact.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use clap::ValueEnum;
use minijinja::{Environment, context};
use serde::{Deserialize, Serialize};

use crate::app::selection::{SelectionTree, TreeNode};
use crate::app::tokens::{TokenInput, TokenPipeline, TokenProgress};
use crate::domain::model::{FileContent, FormattedOutput};
use crate::infra::config::Config;

/// Supported output formats.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
#[value(rename_all = "kebab-case")]
pub enum OutputFormat {
    /// Box-drawing tree followed by delimited file blocks.
    #[default]
    Plain,
    /// Markdown document with fenced code blocks.
    Markdown,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Plain => "plain",
            OutputFormat::Markdown => "markdown",
        }
    }

    /// Recommended file extension for the format.
    pub fn extension(&self) -> &'static str {
        match self {
            OutputFormat::Plain => "txt",
            OutputFormat::Markdown => "md",
        }
    }
}

impl FromStr for OutputFormat {
    type Err = OutputFormatParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "markdown" | "md" => Ok(OutputFormat::Markdown),
            "plain" | "text" | "txt" => Ok(OutputFormat::Plain),
            other => Err(OutputFormatParseError::UnknownFormat(other.to_string())),
        }
    }
}

/// Error returned when parsing an [`OutputFormat`] fails.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum OutputFormatParseError {
    #[error("unknown output format '{0}'")]
    UnknownFormat(String),
}

/// Runtime options controlling rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatOptions {
    pub format: OutputFormat,
    pub include_token_counts: bool,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            format: OutputFormat::Plain,
            include_token_counts: true,
        }
    }
}

impl FormatOptions {
    /// Build options from configuration defaults.
    pub fn from_config(config: &Config) -> Self {
        let format = config.defaults.format.parse().unwrap_or_else(|err| {
            tracing::warn!(error = %err, "falling back to plain output");
            OutputFormat::Plain
        });
        Self {
            format,
            include_token_counts: config.defaults.include_token_counts(),
        }
    }
}

/// Renders trees and file contents, delegating token counting to a shared pipeline.
pub struct AssemblyFormatter {
    pipeline: Arc<TokenPipeline>,
    options: FormatOptions,
    env: Environment<'static>,
}

impl std::fmt::Debug for AssemblyFormatter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AssemblyFormatter")
            .field("pipeline", &self.pipeline)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl AssemblyFormatter {
    /// Create a formatter with the built-in templates loaded.
    pub fn new(pipeline: Arc<TokenPipeline>, options: FormatOptions) -> Result<Self> {
        Ok(Self {
            pipeline,
            options,
            env: default_environment()?,
        })
    }

    pub fn options(&self) -> FormatOptions {
        self.options
    }

    pub fn set_options(&mut self, options: FormatOptions) {
        self.options = options;
    }

    pub fn pipeline(&self) -> &Arc<TokenPipeline> {
        &self.pipeline
    }

    /// Render the visible, non-excluded part of the tree that holds selected files.
    pub fn render_directory_tree(&self, tree: &SelectionTree) -> Result<String> {
        let lines = tree_lines(tree);
        match self.options.format {
            OutputFormat::Plain => {
                let mut out = String::from("Directory Structure:\n---\n");
                for line in &lines {
                    out.push_str(line);
                    out.push('\n');
                }
                Ok(out)
            }
            OutputFormat::Markdown => {
                let rendered = self
                    .env
                    .get_template("markdown_tree")
                    .and_then(|template| template.render(context! { tree => lines.join("\n") }))
                    .map_err(|err| anyhow!("failed to render directory tree: {err}"))?;
                Ok(format!("{rendered}\n"))
            }
        }
    }

    /// Render file blocks in the order given; text is emitted unmodified.
    pub fn render_file_contents(&self, contents: &[FileContent]) -> Result<String> {
        match self.options.format {
            OutputFormat::Plain => Ok(plain_file_contents(
                contents,
                self.options.include_token_counts,
            )),
            OutputFormat::Markdown => {
                let files: Vec<MarkdownFile> = contents
                    .iter()
                    .map(|file| MarkdownFile::new(file, self.options.include_token_counts))
                    .collect();
                self.env
                    .get_template("markdown_files")
                    .and_then(|template| template.render(context! { files => files }))
                    .map_err(|err| anyhow!("failed to render file contents: {err}"))
            }
        }
    }

    /// Produce a fresh [`FormattedOutput`] for the tree's selected files.
    ///
    /// `contents` may arrive in any order; files the tree does not select are dropped and the
    /// rest are sorted by path. Token counts are filled in here, reporting progress per file;
    /// the render is suspended while the pipeline's workers count.
    pub async fn render(
        &self,
        tree: &SelectionTree,
        contents: Vec<FileContent>,
        on_progress: impl FnMut(&TokenProgress),
    ) -> Result<FormattedOutput> {
        let mut files = selected_contents(tree, contents);
        let directory_tree = self.render_directory_tree(tree)?;

        let header_tokens = if self.options.include_token_counts {
            let mut batch = Vec::with_capacity(files.len() + 1);
            batch.push(TokenInput {
                path: String::new(),
                text: directory_tree.clone(),
            });
            batch.extend(files.iter().map(|file| TokenInput {
                path: file.path.clone(),
                text: file.text.clone(),
            }));

            let counts = self.pipeline.count_batch(batch, on_progress).await;
            for (file, tokens) in files.iter_mut().zip(counts.iter().skip(1)) {
                file.token_count = Some(*tokens);
            }
            counts.first().copied().unwrap_or_default()
        } else {
            0
        };

        let file_contents = self.render_file_contents(&files)?;
        let line_count: usize = files.iter().map(|file| file.line_count).sum();
        let token_count = header_tokens
            + files
                .iter()
                .filter_map(|file| file.token_count)
                .sum::<usize>();

        tracing::info!(
            files = files.len(),
            lines = line_count,
            tokens = token_count,
            "rendered output"
        );

        Ok(FormattedOutput {
            directory_tree,
            file_contents,
            token_count,
            line_count,
            files,
        })
    }
}

fn default_environment() -> Result<Environment<'static>> {
    let mut env = Environment::new();
    env.set_trim_blocks(true);
    env.set_lstrip_blocks(true);
    env.add_template("markdown_tree", MARKDOWN_TREE_TEMPLATE)
        .map_err(|err| anyhow!("failed to register markdown tree template: {err}"))?;
    env.add_template("markdown_files", MARKDOWN_FILES_TEMPLATE)
        .map_err(|err| anyhow!("failed to register markdown files template: {err}"))?;
    Ok(env)
}

/// Keep files the tree selects, first occurrence wins, sorted by path. Paths the tree does not
/// know are dropped so the file section never lists something the directory tree omits.
fn selected_contents(tree: &SelectionTree, contents: Vec<FileContent>) -> Vec<FileContent> {
    let mut seen = HashSet::new();
    let mut files: Vec<FileContent> = contents
        .into_iter()
        .filter(|file| {
            tree.node(&file.path).is_some_and(|node| {
                node.selected().is_checked() && node.is_visible() && !node.is_excluded()
            })
        })
        .filter(|file| seen.insert(file.path.clone()))
        .collect();
    files.sort_by(|a, b| a.path.cmp(&b.path));
    files
}

/// Box-drawing lines for the rendered subset of `tree`.
pub fn tree_lines(tree: &SelectionTree) -> Vec<String> {
    let mut lines = Vec::new();
    push_level(tree.roots(), "", &mut lines);
    lines
}

fn push_level(nodes: &[TreeNode], prefix: &str, lines: &mut Vec<String>) {
    let shown: Vec<&TreeNode> = nodes.iter().filter(|node| is_rendered(node)).collect();
    for (index, node) in shown.iter().enumerate() {
        let last = index + 1 == shown.len();
        let connector = if last { "└── " } else { "├── " };
        let icon = if node.is_dir() { "📁 " } else { "📄 " };
        lines.push(format!("{prefix}{connector}{icon}{}", node.name()));
        if node.is_dir() {
            let child_prefix = format!("{prefix}{}", if last { "    " } else { "│   " });
            push_level(node.children(), &child_prefix, lines);
        }
    }
}

fn is_rendered(node: &TreeNode) -> bool {
    if !node.is_visible() || node.is_excluded() {
        return false;
    }
    if !node.is_dir() {
        return node.selected().is_checked();
    }
    node.children().is_empty() || node.children().iter().any(is_rendered)
}

fn plain_file_contents(contents: &[FileContent], include_tokens: bool) -> String {
    let mut out = String::from("File Contents:\n---\n");
    for file in contents {
        let _ = write!(out, "\nFile: {}\nLines: {}\n", file.path, file.line_count);
        if include_tokens {
            let _ = writeln!(out, "Tokens: {}", file.token_count.unwrap_or_default());
        }
        out.push_str("---\n");
        out.push_str(&file.text);
        if !file.text.is_empty() && !file.text.ends_with('\n') {
            out.push('\n');
        }
    }
    out
}

#[derive(Serialize)]
struct MarkdownFile {
    path: String,
    lines: usize,
    tokens: Option<usize>,
    language: &'static str,
    fence: String,
    text: String,
}

impl MarkdownFile {
    fn new(file: &FileContent, include_tokens: bool) -> Self {
        let mut text = file.text.clone();
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        Self {
            path: file.path.clone(),
            lines: file.line_count,
            tokens: if include_tokens {
                Some(file.token_count.unwrap_or_default())
            } else {
                None
            },
            language: language_for(&file.path),
            fence: fence_for(&file.text),
            text,
        }
    }
}

/// Backtick fence one longer than the longest backtick run in `text`, at least three.
pub fn fence_for(text: &str) -> String {
    let longest = text
        .split(|c| c != '`')
        .map(str::len)
        .max()
        .unwrap_or_default();
    "`".repeat((longest + 1).max(3))
}

/// Code-fence language tag derived from a file name.
pub fn language_for(path: &str) -> &'static str {
    let name = path.rsplit('/').next().unwrap_or(path);
    match name {
        "Dockerfile" => return "dockerfile",
        "Makefile" | "makefile" => return "makefile",
        _ => {}
    }
    let Some((_, ext)) = name.rsplit_once('.') else {
        return "";
    };
    match ext.to_ascii_lowercase().as_str() {
        "rs" => "rust",
        "ts" => "typescript",
        "tsx" => "tsx",
        "js" | "mjs" | "cjs" => "javascript",
        "jsx" => "jsx",
        "py" => "python",
        "go" => "go",
        "rb" => "ruby",
        "java" => "java",
        "kt" | "kts" => "kotlin",
        "c" | "h" => "c",
        "cc" | "cpp" | "cxx" | "hpp" => "cpp",
        "cs" => "csharp",
        "swift" => "swift",
        "php" => "php",
        "sh" | "bash" | "zsh" => "bash",
        "md" | "markdown" => "markdown",
        "json" => "json",
        "toml" => "toml",
        "yaml" | "yml" => "yaml",
        "html" | "htm" => "html",
        "css" => "css",
        "scss" => "scss",
        "sql" => "sql",
        "xml" => "xml",
        "vue" => "vue",
        "svelte" => "svelte",
        _ => "",
    }
}

const MARKDOWN_TREE_TEMPLATE: &str = r#"## Directory Structure

```text
{{ tree }}
```
"#;

const MARKDOWN_FILES_TEMPLATE: &str = r#"## File Contents
{% for file in files %}

### `{{ file.path }}`

- Lines: {{ file.lines }}
{% if file.tokens is not none %}
- Tokens: {{ file.tokens }}
{% endif %}

{{ file.fence }}{{ file.language }}
{{ file.text }}{{ file.fence }}
{% endfor %}
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::tokens::{TokenCounter, TokenModel};
    use crate::domain::model::{FetchRef, PathEntry};

    fn formatter(format: OutputFormat) -> AssemblyFormatter {
        let counter = TokenCounter::new(TokenModel::CharacterFallback);
        let pipeline = Arc::new(TokenPipeline::inline(counter));
        AssemblyFormatter::new(
            pipeline,
            FormatOptions {
                format,
                include_token_counts: true,
            },
        )
        .expect("formatter")
    }

    fn sample_tree() -> SelectionTree {
        SelectionTree::build(&[
            PathEntry::file("b.txt", FetchRef::None),
            PathEntry::directory("a"),
            PathEntry::file("a/c.txt", FetchRef::None),
        ])
    }

    #[test]
    fn parse_format_aliases() {
        assert_eq!("md".parse::<OutputFormat>(), Ok(OutputFormat::Markdown));
        assert_eq!("TEXT".parse::<OutputFormat>(), Ok(OutputFormat::Plain));
        assert!("pdf".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn directories_render_before_files() {
        let rendered = formatter(OutputFormat::Plain)
            .render_directory_tree(&sample_tree())
            .unwrap();
        assert_eq!(
            rendered,
            "Directory Structure:\n---\n├── 📁 a\n│   └── 📄 c.txt\n└── 📄 b.txt\n"
        );
    }

    #[test]
    fn unselected_and_excluded_nodes_are_hidden() {
        let mut tree = sample_tree();
        tree.toggle("a/c.txt");
        let lines = tree_lines(&tree);
        assert_eq!(lines, vec!["└── 📄 b.txt"]);

        let ignored = sample_tree().apply_gitignore(&["*.txt"]);
        assert!(tree_lines(&ignored).is_empty());
    }

    #[test]
    fn plain_blocks_carry_counts_and_raw_text() {
        let mut file = FileContent::new("src/a.rs", "fn a() {}");
        file.token_count = Some(4);
        let rendered = formatter(OutputFormat::Plain)
            .render_file_contents(&[file])
            .unwrap();
        assert_eq!(
            rendered,
            "File Contents:\n---\n\nFile: src/a.rs\nLines: 1\nTokens: 4\n---\nfn a() {}\n"
        );
    }

    #[test]
    fn markdown_uses_language_and_long_fences() {
        let mut file = FileContent::new("docs/guide.md", "```sh\nls\n```\n");
        file.token_count = Some(7);
        let rendered = formatter(OutputFormat::Markdown)
            .render_file_contents(&[file])
            .unwrap();
        assert!(rendered.starts_with("## File Contents\n\n### `docs/guide.md`\n"));
        assert!(rendered.contains("- Tokens: 7\n"));
        assert!(rendered.contains("````markdown\n```sh\nls\n```\n````"));
    }

    #[tokio::test]
    async fn render_sorts_and_totals() {
        let formatter = formatter(OutputFormat::Plain);
        let tree = sample_tree();
        let contents = vec![
            FileContent::new("b.txt", "bee\n"),
            FileContent::new("a/c.txt", "sea\nsea\n"),
        ];
        let mut progress = Vec::new();
        let output = formatter
            .render(&tree, contents, |p| progress.push(p.current))
            .await
            .unwrap();

        let order: Vec<&str> = output.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(order, vec!["a/c.txt", "b.txt"]);
        assert_eq!(output.line_count, 3);
        assert!(output.files.iter().all(|f| f.token_count.is_some()));
        let file_tokens: usize = output.files.iter().filter_map(|f| f.token_count).sum();
        assert!(output.token_count > file_tokens);
        assert_eq!(progress, vec![1, 2, 3]);
        assert!(output.text().contains("\n\nFile Contents:\n---\n"));
    }

    #[tokio::test]
    async fn contents_missing_from_tree_are_dropped() {
        let output = formatter(OutputFormat::Plain)
            .render(
                &sample_tree(),
                vec![
                    FileContent::new("b.txt", "bee\n"),
                    FileContent::new("stray/d.txt", "not in tree\n"),
                ],
                |_| {},
            )
            .await
            .unwrap();
        let order: Vec<&str> = output.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(order, vec!["b.txt"]);
        assert!(!output.file_contents.contains("stray/d.txt"));
        assert_eq!(output.line_count, 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn executor_keeps_running_while_tokens_are_counted() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let pipeline = Arc::new(TokenPipeline::new(
            TokenCounter::new(TokenModel::OpenAiGpt4o),
            2,
        ));
        let formatter = AssemblyFormatter::new(
            pipeline,
            FormatOptions {
                format: OutputFormat::Plain,
                include_token_counts: true,
            },
        )
        .unwrap();

        let entries: Vec<PathEntry> = (0..400)
            .map(|i| PathEntry::file(format!("src/file{i}.rs"), FetchRef::None))
            .collect();
        let tree = SelectionTree::build(&entries);
        let contents: Vec<FileContent> = (0..400)
            .map(|i| {
                FileContent::new(
                    format!("src/file{i}.rs"),
                    format!("pub fn item_{i}(x: u32) -> u32 {{ x * {i} }}\n").repeat(40),
                )
            })
            .collect();

        let ticks = Arc::new(AtomicUsize::new(0));
        let ticker = tokio::spawn({
            let ticks = Arc::clone(&ticks);
            async move {
                loop {
                    ticks.fetch_add(1, Ordering::Relaxed);
                    tokio::task::yield_now().await;
                }
            }
        });

        let output = formatter.render(&tree, contents, |_| {}).await.unwrap();
        ticker.abort();

        assert_eq!(output.files.len(), 400);
        assert!(ticks.load(Ordering::Relaxed) > 0);
    }

    #[test]
    fn fence_grows_with_content() {
        assert_eq!(fence_for("plain"), "```");
        assert_eq!(fence_for("````"), "`````");
        assert_eq!(language_for("web/App.tsx"), "tsx");
        assert_eq!(language_for("LICENSE"), "");
    }
}
