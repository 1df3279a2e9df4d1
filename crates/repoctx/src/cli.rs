//! Command line front end.

use std::fmt::Write as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};

use crate::app::export::OutputFormat;
use crate::app::selection::SelectionTree;
use crate::app::session::Session;
use crate::app::tokens::TokenModel;
use crate::infra::config::Config;
use crate::infra::credentials::{CredentialStore, Credentials};
use crate::infra::http::UreqTransport;
use crate::infra::logging;

const BAR_TEMPLATE: &str = "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}";

#[derive(Debug, Parser)]
#[command(name = "repoctx", version, author)]
#[command(about = "Pack files from a GitHub/GitLab repository, local directory or zip archive into one LLM-ready document")]
pub struct Cli {
    /// Repository URL, local directory or `.zip` archive
    #[arg(value_name = "SOURCE")]
    pub source: String,

    /// Branch, tag or commit to read instead of the one in the URL
    #[arg(long = "ref", value_name = "REF")]
    pub git_ref: Option<String>,

    /// Only include files with these extensions (repeatable)
    #[arg(short = 'e', long = "ext", value_name = "EXT")]
    pub extensions: Vec<String>,

    /// Extra gitignore-style pattern (repeatable)
    #[arg(short = 'i', long = "ignore", value_name = "PATTERN")]
    pub ignore: Vec<String>,

    /// Drop the configured ignore patterns before applying `--ignore`
    #[arg(long)]
    pub no_default_ignore: bool,

    /// Toggle a file or directory off (repeatable)
    #[arg(short = 'x', long = "deselect", value_name = "PATH")]
    pub deselect: Vec<String>,

    #[arg(short, long, value_enum)]
    pub format: Option<OutputFormat>,

    /// Write to this file instead of stdout
    #[arg(short, long, value_name = "FILE", conflicts_with = "output_dir")]
    pub output: Option<PathBuf>,

    /// Write into this directory using a name derived from the source
    #[arg(long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Tokenizer, e.g. `openai:gpt-4o` or `anthropic:claude-3.5-sonnet`
    #[arg(long, value_name = "MODEL")]
    pub model: Option<String>,

    /// Access token for the remote host
    #[arg(long, value_name = "TOKEN")]
    pub token: Option<String>,

    /// Skip token counting
    #[arg(long)]
    pub no_tokens: bool,

    /// Print the selection tree and extension statistics without fetching
    #[arg(long)]
    pub list: bool,

    /// Maximum simultaneous fetches
    #[arg(long, value_name = "N")]
    pub concurrency: Option<usize>,

    /// Retries for transient fetch failures
    #[arg(long, value_name = "N")]
    pub retries: Option<u32>,

    /// Ignore `.gitignore` files when walking local directories
    #[arg(long)]
    pub no_gitignore: bool,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    /// Fold command line overrides into the loaded configuration.
    pub fn apply(&self, config: &mut Config) -> Result<()> {
        if let Some(model) = &self.model {
            model
                .parse::<TokenModel>()
                .map_err(|err| anyhow!("--model {model}: {err}"))?;
            config.defaults.model = model.clone();
        }
        if let Some(format) = self.format {
            config.defaults.format = format.as_str().to_owned();
        }
        if let Some(concurrency) = self.concurrency {
            config.fetch.max_concurrent = concurrency.max(1);
        }
        if let Some(retries) = self.retries {
            config.fetch.retries = retries;
        }
        if self.no_default_ignore {
            config.ignore.patterns.clear();
        }
        config.ignore.patterns.extend(self.ignore.iter().cloned());
        Ok(())
    }
}

pub async fn run(cli: Cli) -> Result<()> {
    logging::init(cli.verbose);

    let mut config = Config::load().context("failed to load configuration")?;
    cli.apply(&mut config)?;

    let transport = Arc::new(UreqTransport::default());
    let credentials = CredentialStore::from_config(&config);
    let mut session = Session::from_config(&cli.source, &config, &credentials, transport)?;
    if let Some(token) = &cli.token {
        session.source_mut().set_credentials(Credentials::token(token.clone()));
    }
    if cli.no_tokens {
        let mut options = session.formatter().options();
        options.include_token_counts = false;
        session.formatter_mut().set_options(options);
    }
    {
        let options = session.options_mut();
        options.git_ref = cli.git_ref.clone();
        options.respect_gitignore = !cli.no_gitignore;
    }

    let spinner = ProgressBar::new_spinner();
    spinner.set_message(format!("reading {}", session.source().kind_name()));
    spinner.enable_steady_tick(Duration::from_millis(100));
    let discovered = session.discover().await.map(|_| ());
    spinner.finish_and_clear();
    if let Err(err) = discovered {
        if session.source().requires_auth() {
            tracing::info!("pass --token or set the host token variable to authenticate");
        }
        bail!(err.report());
    }

    for path in &cli.deselect {
        if !session.tree_mut().set_selected(path, false) {
            tracing::warn!(path = %path, "--deselect path not found in tree");
        }
    }
    if !cli.extensions.is_empty() {
        session.filter_by_extension(&cli.extensions);
    }

    if cli.list {
        print!("{}", render_listing(session.tree()));
        return Ok(());
    }

    let selected = session.tree().selected_files().len();
    if selected == 0 {
        bail!("no files selected");
    }

    let bar = progress_bar(selected as u64);
    let outcome = session
        .fetch_selected(|result| {
            match result {
                Ok(content) => bar.set_message(content.path.clone()),
                Err(failure) => bar.println(format!("skipped {}: {}", failure.path, failure.error)),
            }
            bar.inc(1);
        })
        .await;
    bar.finish_and_clear();

    for failure in &outcome.failures {
        eprintln!("{}\n", failure.error.report());
    }
    if outcome.contents.is_empty() {
        bail!("every selected file failed to download");
    }

    let bar = progress_bar(0);
    bar.set_message("counting tokens");
    let output = session
        .render(outcome.contents, |progress| {
            bar.set_length(progress.total as u64);
            bar.set_position(progress.current as u64);
        })
        .await?;
    bar.finish_and_clear();

    let text = output.text();
    let destination = match (&cli.output, &cli.output_dir) {
        (Some(path), _) => Some(path.clone()),
        (None, Some(dir)) => Some(dir.join(session.suggested_file_name())),
        (None, None) => None,
    };
    match destination {
        Some(path) => {
            std::fs::write(&path, &text)
                .with_context(|| format!("failed to write {}", path.display()))?;
            eprintln!("wrote {}", path.display());
        }
        None => print!("{text}"),
    }

    eprintln!(
        "{} files, {} lines, {} tokens ({})",
        output.files.len(),
        output.line_count,
        output.token_count,
        config.defaults.model
    );
    Ok(())
}

fn progress_bar(len: u64) -> ProgressBar {
    let bar = ProgressBar::new(len);
    let style = ProgressStyle::default_bar()
        .template(BAR_TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    bar.set_style(style);
    bar
}

/// Visible nodes with tri-state markers, followed by extension statistics.
pub fn render_listing(tree: &SelectionTree) -> String {
    let mut out = String::new();
    for node in tree.flatten().into_iter().filter(|node| node.is_visible()) {
        let depth = node.path().matches('/').count();
        let suffix = if node.is_dir() { "/" } else { "" };
        let ignored = if node.is_excluded() { " (ignored)" } else { "" };
        let _ = writeln!(
            out,
            "{}{} {}{suffix}{ignored}",
            "  ".repeat(depth),
            node.selected(),
            node.name()
        );
    }

    let filters = tree.extension_filters();
    if !filters.is_empty() {
        out.push_str("\nExtensions:\n");
        for filter in filters {
            let label = if filter.extension.is_empty() {
                "(none)"
            } else {
                filter.extension.as_str()
            };
            let mark = if filter.selected { "x" } else { " " };
            let _ = writeln!(out, "  [{mark}] {label} {}", filter.count);
        }
    }
    out
}
