//! Token counting and the background tokenization pipeline.
//!
//! Counting is CPU bound, so batches run on a dedicated rayon pool and report progress over a
//! channel that async callers await. When the pool cannot be created the same batch is counted
//! inline and yields the same messages.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tiktoken_rs::{CoreBPE, cl100k_base, o200k_base};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

use crate::infra::config::Config;

/// Supported token estimation models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TokenModel {
    /// OpenAI GPT-4o (o200k vocabulary).
    OpenAiGpt4o,
    /// OpenAI GPT-4o mini (o200k vocabulary).
    #[default]
    OpenAiGpt4oMini,
    /// Anthropic Claude 3 Haiku, approximated with cl100k.
    AnthropicClaude3Haiku,
    /// Anthropic Claude 3.5 Sonnet, approximated with cl100k.
    AnthropicClaude35Sonnet,
    /// Character/word heuristic, no vocabulary needed.
    CharacterFallback,
}

impl TokenModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenModel::OpenAiGpt4o => "openai:gpt-4o",
            TokenModel::OpenAiGpt4oMini => "openai:gpt-4o-mini",
            TokenModel::AnthropicClaude3Haiku => "anthropic:claude-3-haiku",
            TokenModel::AnthropicClaude35Sonnet => "anthropic:claude-3.5-sonnet",
            TokenModel::CharacterFallback => "fallback:characters",
        }
    }

    pub fn context_window(&self) -> usize {
        match self {
            TokenModel::OpenAiGpt4o | TokenModel::OpenAiGpt4oMini => 128_000,
            TokenModel::AnthropicClaude3Haiku | TokenModel::AnthropicClaude35Sonnet => 200_000,
            TokenModel::CharacterFallback => 120_000,
        }
    }

    fn is_anthropic(&self) -> bool {
        matches!(
            self,
            TokenModel::AnthropicClaude3Haiku | TokenModel::AnthropicClaude35Sonnet
        )
    }
}

impl fmt::Display for TokenModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TokenModel {
    type Err = TokenModelParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai:gpt-4o" | "gpt-4o" => Ok(TokenModel::OpenAiGpt4o),
            "openai:gpt-4o-mini" | "gpt-4o-mini" => Ok(TokenModel::OpenAiGpt4oMini),
            "anthropic:claude-3-haiku" => Ok(TokenModel::AnthropicClaude3Haiku),
            "anthropic:claude-3.5-sonnet" | "claude" => Ok(TokenModel::AnthropicClaude35Sonnet),
            "fallback:characters" | "heuristic" | "fallback" => Ok(TokenModel::CharacterFallback),
            other => Err(TokenModelParseError::UnknownModel(other.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum TokenModelParseError {
    #[error("unknown token model '{0}'")]
    UnknownModel(String),
}

/// Heuristic used when no BPE vocabulary is available.
#[derive(Debug, Clone)]
pub struct HeuristicConfig {
    pub default_chars_per_token: f32,
    pub anthropic_chars_per_token: f32,
    pub tokens_per_word: f32,
    /// Multiplier applied to source code, which tokenizes denser than prose.
    pub code_token_multiplier: f32,
}

impl Default for HeuristicConfig {
    fn default() -> Self {
        Self {
            default_chars_per_token: 4.0,
            anthropic_chars_per_token: 3.2,
            tokens_per_word: 1.0,
            code_token_multiplier: 1.25,
        }
    }
}

impl HeuristicConfig {
    fn estimate(&self, text: &str, model: TokenModel, is_code: bool) -> usize {
        let chars_per_token = if model.is_anthropic() {
            self.anthropic_chars_per_token
        } else {
            self.default_chars_per_token
        };
        let by_chars = (text.chars().count() as f32 / chars_per_token).ceil();
        let by_words = (text.split_whitespace().count() as f32 * self.tokens_per_word).ceil();
        let mut estimate = by_chars.max(by_words);
        if is_code {
            estimate = (estimate * self.code_token_multiplier).ceil();
        }
        (estimate as usize).max(1)
    }
}

/// Counts tokens for one model. Owns its vocabulary and a content-addressed cache.
pub struct TokenCounter {
    model: TokenModel,
    heuristics: HeuristicConfig,
    bpe: Option<Arc<CoreBPE>>,
    cache: DashMap<u64, usize>,
}

impl fmt::Debug for TokenCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCounter")
            .field("model", &self.model)
            .field("bpe", &self.bpe.is_some())
            .field("cached", &self.cache.len())
            .finish()
    }
}

impl Default for TokenCounter {
    fn default() -> Self {
        Self::new(TokenModel::default())
    }
}

impl TokenCounter {
    pub fn new(model: TokenModel) -> Self {
        Self {
            model,
            heuristics: HeuristicConfig::default(),
            bpe: load_bpe(model),
            cache: DashMap::new(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let model = config.defaults.model.parse().unwrap_or_else(|err| {
            tracing::warn!(error = %err, "falling back to the default token model");
            TokenModel::default()
        });
        Self::new(model)
    }

    pub fn model(&self) -> TokenModel {
        self.model
    }

    pub fn set_heuristics(&mut self, heuristics: HeuristicConfig) {
        self.heuristics = heuristics;
        self.cache.clear();
    }

    /// Count tokens in free text (headers, prompts).
    pub fn count(&self, text: &str) -> usize {
        self.count_with_hint(text, false)
    }

    /// Count tokens in a file body; the path only tunes the heuristic fallback.
    pub fn count_file(&self, path: &str, text: &str) -> usize {
        self.count_with_hint(text, is_probably_code(path))
    }

    fn count_with_hint(&self, text: &str, is_code: bool) -> usize {
        if text.trim().is_empty() {
            return 0;
        }

        let mut hasher = DefaultHasher::new();
        text.hash(&mut hasher);
        is_code.hash(&mut hasher);
        let key = hasher.finish();
        if let Some(hit) = self.cache.get(&key) {
            return *hit;
        }

        let tokens = match &self.bpe {
            Some(bpe) => bpe.encode_ordinary(text).len(),
            None => self.heuristics.estimate(text, self.model, is_code),
        };
        self.cache.insert(key, tokens);
        tokens
    }
}

fn load_bpe(model: TokenModel) -> Option<Arc<CoreBPE>> {
    let loaded = match model {
        TokenModel::OpenAiGpt4o | TokenModel::OpenAiGpt4oMini => o200k_base(),
        TokenModel::AnthropicClaude3Haiku | TokenModel::AnthropicClaude35Sonnet => cl100k_base(),
        TokenModel::CharacterFallback => return None,
    };
    match loaded {
        Ok(bpe) => Some(Arc::new(bpe)),
        Err(err) => {
            tracing::warn!(model = %model, error = %err, "tokenizer unavailable; using heuristic");
            None
        }
    }
}

fn is_probably_code(path: &str) -> bool {
    let ext = path.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("");
    matches!(
        ext,
        "rs" | "ts"
            | "js"
            | "jsx"
            | "tsx"
            | "py"
            | "java"
            | "c"
            | "cpp"
            | "cc"
            | "h"
            | "hpp"
            | "go"
            | "rb"
            | "php"
            | "cs"
            | "swift"
            | "kt"
            | "sh"
    )
}

/// One file submitted for counting.
#[derive(Debug, Clone)]
pub struct TokenInput {
    pub path: String,
    pub text: String,
}

/// Progress envelope emitted after each counted file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenProgress {
    pub request_id: u64,
    pub index: usize,
    pub path: String,
    pub tokens: usize,
    pub current: usize,
    pub total: usize,
}

impl TokenProgress {
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.current as f64 / self.total as f64
        }
    }
}

/// Messages sent from a tokenization worker back to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenMessage {
    Progress(TokenProgress),
    Complete { request_id: u64, counts: Vec<usize> },
}

/// Handle for a submitted batch.
#[derive(Debug)]
pub struct TokenJob {
    request_id: u64,
    total: usize,
    receiver: UnboundedReceiver<TokenMessage>,
}

impl TokenJob {
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// Non-blocking poll for the next message.
    pub fn try_next(&mut self) -> Option<TokenMessage> {
        self.receiver.try_recv().ok()
    }

    /// Await the batch, forwarding progress in arrival order. The caller's task is suspended
    /// between messages, so the executor keeps running while workers count.
    ///
    /// Files whose result never arrives count as zero.
    pub async fn wait(mut self, mut on_progress: impl FnMut(&TokenProgress)) -> Vec<usize> {
        let mut partial = vec![0usize; self.total];
        let mut seen = 0usize;
        while let Some(message) = self.receiver.recv().await {
            match message {
                TokenMessage::Progress(mut progress) => {
                    seen += 1;
                    progress.current = seen;
                    if let Some(slot) = partial.get_mut(progress.index) {
                        *slot = progress.tokens;
                    }
                    on_progress(&progress);
                }
                TokenMessage::Complete { counts, .. } => return counts,
            }
        }
        tracing::warn!(
            request_id = self.request_id,
            "tokenization worker stopped early; missing files count as zero"
        );
        partial
    }
}

/// Owns the tokenization workers for one session.
pub struct TokenPipeline {
    counter: Arc<TokenCounter>,
    pool: Option<ThreadPool>,
    next_request: AtomicU64,
}

impl fmt::Debug for TokenPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPipeline")
            .field("counter", &self.counter)
            .field("threaded", &self.pool.is_some())
            .finish()
    }
}

impl TokenPipeline {
    /// Create a pipeline with `workers` threads (0 picks rayon's default). Falls back to inline
    /// counting if the pool cannot be started.
    pub fn new(counter: TokenCounter, workers: usize) -> Self {
        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("repoctx-tokens-{i}"))
            .build()
            .map_err(|err| {
                tracing::warn!(error = %err, "token worker pool unavailable; counting inline");
            })
            .ok();
        Self {
            counter: Arc::new(counter),
            pool,
            next_request: AtomicU64::new(1),
        }
    }

    /// Pipeline that always counts on the calling thread.
    pub fn inline(counter: TokenCounter) -> Self {
        Self {
            counter: Arc::new(counter),
            pool: None,
            next_request: AtomicU64::new(1),
        }
    }

    pub fn counter(&self) -> &TokenCounter {
        &self.counter
    }

    pub fn is_threaded(&self) -> bool {
        self.pool.is_some()
    }

    /// Submit a batch. With a worker pool this returns immediately; inline pipelines finish the
    /// work before returning and the job replays the buffered messages.
    pub fn submit(&self, batch: Vec<TokenInput>) -> TokenJob {
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let total = batch.len();
        let (sender, receiver) = unbounded_channel();

        match &self.pool {
            Some(pool) => {
                let counter = Arc::clone(&self.counter);
                pool.spawn(move || run_batch(request_id, &counter, batch, &sender, true));
            }
            None => run_batch(request_id, &self.counter, batch, &sender, false),
        }

        TokenJob {
            request_id,
            total,
            receiver,
        }
    }

    /// Submit and await in one call.
    pub async fn count_batch(
        &self,
        batch: Vec<TokenInput>,
        on_progress: impl FnMut(&TokenProgress),
    ) -> Vec<usize> {
        self.submit(batch).wait(on_progress).await
    }
}

fn run_batch(
    request_id: u64,
    counter: &TokenCounter,
    batch: Vec<TokenInput>,
    sender: &UnboundedSender<TokenMessage>,
    parallel: bool,
) {
    let total = batch.len();
    let done = AtomicUsize::new(0);

    let count_one = |sender: &UnboundedSender<TokenMessage>, (index, input): (usize, &TokenInput)| {
        let tokens = count_guarded(counter, input);
        let current = done.fetch_add(1, Ordering::Relaxed) + 1;
        let _ = sender.send(TokenMessage::Progress(TokenProgress {
            request_id,
            index,
            path: input.path.clone(),
            tokens,
            current,
            total,
        }));
        tokens
    };

    let counts: Vec<usize> = if parallel {
        batch
            .par_iter()
            .enumerate()
            .map_with(sender.clone(), |sender, item| count_one(sender, item))
            .collect()
    } else {
        batch
            .iter()
            .enumerate()
            .map(|item| count_one(sender, item))
            .collect()
    };

    let _ = sender.send(TokenMessage::Complete { request_id, counts });
}

fn count_guarded(counter: &TokenCounter, input: &TokenInput) -> usize {
    panic::catch_unwind(AssertUnwindSafe(|| {
        counter.count_file(&input.path, &input.text)
    }))
    .unwrap_or_else(|_| {
        tracing::warn!(path = %input.path, "token counting failed; recording zero");
        0
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch() -> Vec<TokenInput> {
        (0..12)
            .map(|i| TokenInput {
                path: format!("src/file{i}.rs"),
                text: format!("fn f{i}() {{ println!(\"{i}\"); }}\n").repeat(i + 1),
            })
            .collect()
    }

    #[test]
    fn parses_token_models_from_strings() {
        assert_eq!(
            TokenModel::from_str("openai:gpt-4o").unwrap(),
            TokenModel::OpenAiGpt4o
        );
        assert_eq!(
            TokenModel::from_str("OPENAI:GPT-4O-MINI").unwrap(),
            TokenModel::OpenAiGpt4oMini
        );
        assert!(TokenModel::from_str("unknown").is_err());
    }

    #[test]
    fn counts_with_openai_tokenizer() {
        let counter = TokenCounter::new(TokenModel::OpenAiGpt4o);
        assert_eq!(counter.count("Hello world!"), 3);
        assert_eq!(counter.count("   \n"), 0);
    }

    #[test]
    fn heuristic_counts_are_positive() {
        let counter = TokenCounter::new(TokenModel::CharacterFallback);
        assert!(counter.count("Approximate counting is good enough.") > 0);
        let prose = counter.count("x = 1 + 2 and more words here");
        assert!(counter.count_file("main.rs", "x = 1 + 2 and more words here") >= prose);
    }

    #[tokio::test]
    async fn threaded_and_inline_pipelines_agree() {
        let threaded = TokenPipeline::new(TokenCounter::new(TokenModel::OpenAiGpt4oMini), 2);
        let inline = TokenPipeline::inline(TokenCounter::new(TokenModel::OpenAiGpt4oMini));

        let a = threaded.count_batch(batch(), |_| {}).await;
        let b = inline.count_batch(batch(), |_| {}).await;
        assert_eq!(a, b);
        assert!(a.iter().all(|count| *count > 0));
    }

    #[tokio::test]
    async fn reports_progress_after_each_file() {
        let pipeline = TokenPipeline::new(TokenCounter::default(), 3);
        let mut seen = Vec::new();
        let counts = pipeline
            .count_batch(batch(), |progress| {
                seen.push((progress.current, progress.total));
            })
            .await;

        assert_eq!(counts.len(), 12);
        assert_eq!(seen.len(), 12);
        assert_eq!(seen.last(), Some(&(12, 12)));
        assert!(seen.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[tokio::test]
    async fn empty_batch_completes() {
        let pipeline = TokenPipeline::inline(TokenCounter::default());
        let job = pipeline.submit(Vec::new());
        assert_eq!(job.total(), 0);
        assert!(job.wait(|_| {}).await.is_empty());
    }
}
