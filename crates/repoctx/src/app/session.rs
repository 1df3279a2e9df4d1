//! One packing session: discover a source, refine the selection, fetch and render.

use std::pin::pin;
use std::sync::Arc;

use anyhow::Result;
use futures::StreamExt;

use crate::app::export::{AssemblyFormatter, FormatOptions, OutputFormat};
use crate::app::fetcher::{BoundedFetcher, FetchConfig};
use crate::app::selection::SelectionTree;
use crate::app::tokens::{TokenCounter, TokenPipeline, TokenProgress};
use crate::domain::errors::{FetchFailure, SourceError};
use crate::domain::model::{FileContent, FormattedOutput};
use crate::infra::config::Config;
use crate::infra::credentials::CredentialStore;
use crate::infra::http::HttpTransport;
use crate::providers::{DiscoverOptions, RepositorySource};

/// Files gathered by [`Session::fetch_selected`].
#[derive(Debug, Default)]
pub struct FetchOutcome {
    pub contents: Vec<FileContent>,
    pub failures: Vec<FetchFailure>,
}

impl FetchOutcome {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Owns everything a single source needs between discovery and rendering.
///
/// The discovered tree is kept unfiltered so ignore patterns can be replaced without another
/// round trip to the source.
#[derive(Debug)]
pub struct Session {
    identifier: String,
    source: RepositorySource,
    fetcher: BoundedFetcher,
    formatter: AssemblyFormatter,
    options: DiscoverOptions,
    ignore_patterns: Vec<String>,
    discovered: SelectionTree,
    tree: SelectionTree,
}

impl Session {
    pub fn new(
        identifier: impl Into<String>,
        source: RepositorySource,
        fetcher: BoundedFetcher,
        formatter: AssemblyFormatter,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            source,
            fetcher,
            formatter,
            options: DiscoverOptions::default(),
            ignore_patterns: Vec::new(),
            discovered: SelectionTree::default(),
            tree: SelectionTree::default(),
        }
    }

    /// Wire a session from layered configuration. Remote sources pick up credentials for their
    /// host from `credentials`.
    pub fn from_config(
        identifier: impl Into<String>,
        config: &Config,
        credentials: &CredentialStore,
        transport: Arc<dyn HttpTransport>,
    ) -> Result<Self> {
        let identifier = identifier.into();
        let mut source = RepositorySource::detect(&identifier, transport);
        if let Some(host) = source.credential_host() {
            let creds = credentials.get(host);
            if !creds.is_empty() {
                tracing::debug!(host = %host, "using configured token");
                source.set_credentials(creds);
            }
        }

        let pipeline = Arc::new(TokenPipeline::new(
            TokenCounter::from_config(config),
            config.tokens.workers,
        ));
        let formatter = AssemblyFormatter::new(pipeline, FormatOptions::from_config(config))?;
        let fetcher = BoundedFetcher::new(FetchConfig::from_config(config));

        let mut session = Self::new(identifier, source, fetcher, formatter);
        session.options = DiscoverOptions::from_config(config);
        session.ignore_patterns = config.ignore.patterns.clone();
        Ok(session)
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn source(&self) -> &RepositorySource {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut RepositorySource {
        &mut self.source
    }

    pub fn options_mut(&mut self) -> &mut DiscoverOptions {
        &mut self.options
    }

    pub fn formatter(&self) -> &AssemblyFormatter {
        &self.formatter
    }

    pub fn formatter_mut(&mut self) -> &mut AssemblyFormatter {
        &mut self.formatter
    }

    pub fn ignore_patterns(&self) -> &[String] {
        &self.ignore_patterns
    }

    /// List the source and rebuild the tree. Previous selections are discarded.
    pub async fn discover(&mut self) -> Result<&SelectionTree, SourceError> {
        let entries = self
            .source
            .discover_tree(&self.identifier, &self.options)
            .await?;
        tracing::info!(
            source = self.source.kind_name(),
            identifier = %self.identifier,
            entries = entries.len(),
            "discovered source tree"
        );
        self.discovered = SelectionTree::build(&entries);
        self.tree = self.discovered.apply_gitignore(&self.ignore_patterns);
        Ok(&self.tree)
    }

    pub fn tree(&self) -> &SelectionTree {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut SelectionTree {
        &mut self.tree
    }

    pub fn replace_tree(&mut self, tree: SelectionTree) {
        self.tree = tree;
    }

    /// Swap the ignore patterns and recompute exclusions on the current tree.
    pub fn set_ignore_patterns(&mut self, patterns: Vec<String>) {
        self.ignore_patterns = patterns;
        self.tree = self.tree.apply_gitignore(&self.ignore_patterns);
    }

    /// Limit visible files to `extensions`; an empty list shows everything again.
    pub fn filter_by_extension<S: AsRef<str>>(&mut self, extensions: &[S]) {
        self.tree = self.tree.filter_by_extension(extensions);
    }

    /// Back to the freshly discovered tree with the current ignore patterns.
    pub fn reset_selection(&mut self) {
        self.tree = self.discovered.apply_gitignore(&self.ignore_patterns);
    }

    /// Fetch every selected file. `on_item` sees each result as it completes; failures are
    /// collected rather than aborting the batch.
    pub async fn fetch_selected(
        &self,
        mut on_item: impl FnMut(&Result<FileContent, FetchFailure>),
    ) -> FetchOutcome {
        let entries = self.tree.selected_entries();
        tracing::info!(files = entries.len(), "fetching selected files");

        let mut outcome = FetchOutcome::default();
        let mut stream = pin!(self.source.fetch_many(entries, &self.fetcher));
        while let Some(result) = stream.next().await {
            on_item(&result);
            match result {
                Ok(content) => outcome.contents.push(content),
                Err(failure) => outcome.failures.push(failure),
            }
        }
        outcome
    }

    /// Render the current selection; token counting runs on the pipeline's workers.
    pub async fn render(
        &self,
        contents: Vec<FileContent>,
        on_progress: impl FnMut(&TokenProgress),
    ) -> Result<FormattedOutput> {
        self.formatter
            .render(&self.tree, contents, on_progress)
            .await
    }

    /// File name for the current source in the active output format.
    pub fn suggested_file_name(&self) -> String {
        self.source
            .suggested_file_name(self.formatter.options().format)
    }

    pub fn format(&self) -> OutputFormat {
        self.formatter.options().format
    }
}
