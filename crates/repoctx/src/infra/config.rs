//! Configuration management utilities.

use std::collections::BTreeSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use dirs_next::config_dir;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

static DEFAULT_CONFIG: Lazy<&'static str> =
    Lazy::new(|| include_str!("../../assets/default-config.toml"));
static DEFAULT_WORKSPACE_CONFIG_PATH: &str = ".repoctx/config.toml";

/// Layered configuration loaded from defaults, user, workspace, and env.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub defaults: Defaults,
    #[serde(default)]
    pub fetch: Fetch,
    #[serde(default)]
    pub ignore: Ignore,
    #[serde(default)]
    pub tokens: Tokens,
    #[serde(default)]
    pub auth: Auth,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Defaults {
    #[serde(default = "Defaults::default_model")]
    pub model: String,
    #[serde(default = "Defaults::default_format")]
    pub format: String,
    #[serde(default)]
    show_hidden: Option<bool>,
    #[serde(default = "Defaults::default_max_file_size")]
    pub max_file_size: u64,
    #[serde(default)]
    include_token_counts: Option<bool>,
}

impl Defaults {
    fn default_model() -> String {
        "openai:gpt-4o-mini".to_owned()
    }

    fn default_format() -> String {
        "plain".into()
    }

    fn default_max_file_size() -> u64 {
        1024 * 1024
    }

    pub fn include_token_counts(&self) -> bool {
        self.include_token_counts.unwrap_or(true)
    }

    /// Whether dot files are listed; the last layer that sets it wins.
    pub fn show_hidden(&self) -> bool {
        self.show_hidden.unwrap_or(false)
    }
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            model: Self::default_model(),
            format: Self::default_format(),
            show_hidden: None,
            max_file_size: Self::default_max_file_size(),
            include_token_counts: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fetch {
    #[serde(default = "Fetch::default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "Fetch::default_retries")]
    pub retries: u32,
    #[serde(default = "Fetch::default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default)]
    pub min_start_interval_ms: u64,
}

impl Fetch {
    fn default_max_concurrent() -> usize {
        6
    }

    fn default_retries() -> u32 {
        2
    }

    fn default_retry_delay_ms() -> u64 {
        500
    }
}

impl Default for Fetch {
    fn default() -> Self {
        Self {
            max_concurrent: Self::default_max_concurrent(),
            retries: Self::default_retries(),
            retry_delay_ms: Self::default_retry_delay_ms(),
            min_start_interval_ms: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ignore {
    /// Gitignore-style patterns applied to every source.
    #[serde(default)]
    pub patterns: Vec<String>,
}

impl Default for Ignore {
    fn default() -> Self {
        Self {
            patterns: vec![
                ".git/".into(),
                "node_modules/".into(),
                "target/".into(),
                "dist/".into(),
                "*.lock".into(),
                "*.min.js".into(),
            ],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tokens {
    /// Worker threads for token counting; 0 lets rayon decide.
    #[serde(default)]
    pub workers: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Auth {
    #[serde(default)]
    pub github_token: Option<String>,
    #[serde(default)]
    pub gitlab_token: Option<String>,
}

/// Environment overrides for critical settings.
#[derive(Debug, Default, Clone)]
pub struct EnvOverrides {
    model: Option<String>,
    format: Option<String>,
}

impl EnvOverrides {
    fn from_env() -> Self {
        Self {
            model: env::var("REPOCTX_MODEL").ok(),
            format: env::var("REPOCTX_FORMAT").ok(),
        }
    }

    #[cfg(test)]
    fn for_tests(model: &str, format: &str) -> Self {
        Self {
            model: Some(model.to_owned()),
            format: Some(format.to_owned()),
        }
    }
}

impl Config {
    /// Load configuration from defaults, user/global config, workspace config, and env overrides.
    pub fn load() -> Result<Self> {
        let env = EnvOverrides::from_env();
        let global = global_config_path();
        let workspace = workspace_config_path()?;
        Self::load_with_layers(global, workspace, env)
    }

    /// Load from an explicit file layered over the built-in defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        Self::load_with_layers(None, Some(path.to_path_buf()), EnvOverrides::from_env())
    }

    fn load_with_layers(
        global: Option<PathBuf>,
        workspace: Option<PathBuf>,
        env_overrides: EnvOverrides,
    ) -> Result<Self> {
        let mut layers: Vec<Config> = vec![Self::from_str(&DEFAULT_CONFIG)?];

        if let Some(global_path) = global.filter(|path| path.exists()) {
            layers.push(Self::from_file(&global_path)?);
        }

        if let Some(workspace_path) = workspace.filter(|path| path.exists()) {
            layers.push(Self::from_file(&workspace_path)?);
        }

        let merged = layers.into_iter().reduce(Config::merge).unwrap_or_default();
        Ok(apply_env_overrides(merged, env_overrides))
    }

    fn from_file(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        Self::from_str(&data)
            .with_context(|| format!("invalid config file: {}", path.display()))
    }

    fn from_str(contents: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(contents).with_context(|| "failed to parse TOML config".to_string())?;
        Ok(config)
    }

    fn merge(self, other: Self) -> Self {
        Self {
            defaults: merge_defaults(self.defaults, other.defaults),
            fetch: merge_fetch(self.fetch, other.fetch),
            ignore: merge_ignore(self.ignore, other.ignore),
            tokens: Tokens {
                workers: if other.tokens.workers != 0 {
                    other.tokens.workers
                } else {
                    self.tokens.workers
                },
            },
            auth: Auth {
                github_token: other.auth.github_token.or(self.auth.github_token),
                gitlab_token: other.auth.gitlab_token.or(self.auth.gitlab_token),
            },
        }
    }
}

fn merge_defaults(base: Defaults, overlay: Defaults) -> Defaults {
    Defaults {
        model: if overlay.model != Defaults::default_model() {
            overlay.model
        } else {
            base.model
        },
        format: if overlay.format != Defaults::default_format() {
            overlay.format
        } else {
            base.format
        },
        show_hidden: overlay.show_hidden.or(base.show_hidden),
        max_file_size: if overlay.max_file_size != Defaults::default_max_file_size() {
            overlay.max_file_size
        } else {
            base.max_file_size
        },
        include_token_counts: overlay.include_token_counts.or(base.include_token_counts),
    }
}

fn merge_fetch(base: Fetch, overlay: Fetch) -> Fetch {
    let pick = |base: u64, overlay: u64, default: u64| if overlay != default { overlay } else { base };
    Fetch {
        max_concurrent: pick(
            base.max_concurrent as u64,
            overlay.max_concurrent as u64,
            Fetch::default_max_concurrent() as u64,
        ) as usize,
        retries: pick(
            base.retries.into(),
            overlay.retries.into(),
            Fetch::default_retries().into(),
        ) as u32,
        retry_delay_ms: pick(
            base.retry_delay_ms,
            overlay.retry_delay_ms,
            Fetch::default_retry_delay_ms(),
        ),
        min_start_interval_ms: pick(base.min_start_interval_ms, overlay.min_start_interval_ms, 0),
    }
}

fn merge_ignore(base: Ignore, overlay: Ignore) -> Ignore {
    let mut patterns: BTreeSet<String> = base.patterns.into_iter().collect();
    patterns.extend(overlay.patterns);
    Ignore {
        patterns: patterns.into_iter().collect(),
    }
}

fn global_config_path() -> Option<PathBuf> {
    config_dir().map(|base| base.join("repoctx/config.toml"))
}

fn workspace_config_path() -> Result<Option<PathBuf>> {
    let cwd = env::current_dir()?;
    let root = find_repo_root(&cwd).unwrap_or(cwd);
    Ok(Some(root.join(DEFAULT_WORKSPACE_CONFIG_PATH)))
}

fn find_repo_root(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(".git").exists())
        .map(Path::to_path_buf)
}

fn apply_env_overrides(mut config: Config, env: EnvOverrides) -> Config {
    if let Some(model) = env.model {
        config.defaults.model = model;
    }
    if let Some(format) = env.format {
        config.defaults.format = format;
    }
    config
}
