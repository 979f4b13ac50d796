//! Token counting and context-budget helpers.
//!
//! Every model name resolves to one of the tiktoken BPE encodings through an
//! explicit rules table (exact names first, then family prefixes, longest
//! prefix wins). Unknown models are a [`ConfigurationError`] rather than a
//! silent default, so a budget check never runs against the wrong tokenizer.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use tiktoken_rs::CoreBPE;
use tracing::debug;

use crate::error::ConfigurationError;
use crate::types::ChatMessage;

// ============================================================================
// Encodings
// ============================================================================

/// A BPE encoding understood by the counter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Encoding {
    O200kBase,
    Cl100kBase,
    P50kBase,
    R50kBase,
}

impl Encoding {
    pub fn name(self) -> &'static str {
        match self {
            Encoding::O200kBase => "o200k_base",
            Encoding::Cl100kBase => "cl100k_base",
            Encoding::P50kBase => "p50k_base",
            Encoding::R50kBase => "r50k_base",
        }
    }

    fn bpe(self) -> Result<&'static CoreBPE, ConfigurationError> {
        let slot: &'static Result<CoreBPE, String> = match self {
            Encoding::O200kBase => &O200K,
            Encoding::Cl100kBase => &CL100K,
            Encoding::P50kBase => &P50K,
            Encoding::R50kBase => &R50K,
        };
        slot.as_ref().map_err(|message| ConfigurationError::Tokenizer {
            encoding: self.name().to_string(),
            message: message.clone(),
        })
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Encoding {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "o200k_base" => Ok(Encoding::O200kBase),
            "cl100k_base" => Ok(Encoding::Cl100kBase),
            "p50k_base" => Ok(Encoding::P50kBase),
            "r50k_base" => Ok(Encoding::R50kBase),
            other => Err(ConfigurationError::UnknownEncoding {
                encoding: other.to_string(),
            }),
        }
    }
}

// Built once per process, on first use.
static O200K: LazyLock<Result<CoreBPE, String>> =
    LazyLock::new(|| tiktoken_rs::o200k_base().map_err(|e| e.to_string()));
static CL100K: LazyLock<Result<CoreBPE, String>> =
    LazyLock::new(|| tiktoken_rs::cl100k_base().map_err(|e| e.to_string()));
static P50K: LazyLock<Result<CoreBPE, String>> =
    LazyLock::new(|| tiktoken_rs::p50k_base().map_err(|e| e.to_string()));
static R50K: LazyLock<Result<CoreBPE, String>> =
    LazyLock::new(|| tiktoken_rs::r50k_base().map_err(|e| e.to_string()));

// ============================================================================
// Rules tables
// ============================================================================

/// Tokens added per chat message (`<|start|>{role}\n{content}<|end|>`).
const MESSAGE_OVERHEAD: usize = 3;

/// Tokens priming the assistant reply in chat-format models.
const REPLY_PRIMING: usize = 3;

/// Longest run of characters counted as one segment.
const SEGMENT_CHARS: usize = 32;

#[derive(Clone, Copy, Debug)]
struct Rule {
    encoding: Encoding,
    /// Chat-format model: the reply priming overhead applies.
    chat: bool,
}

const fn chat(encoding: Encoding) -> Rule {
    Rule { encoding, chat: true }
}

const fn plain(encoding: Encoding) -> Rule {
    Rule { encoding, chat: false }
}

const EXACT_RULES: &[(&str, Rule)] = &[
    ("gpt-3.5-turbo-instruct", plain(Encoding::Cl100kBase)),
    ("text-embedding-ada-002", plain(Encoding::Cl100kBase)),
    ("text-embedding-3-small", plain(Encoding::Cl100kBase)),
    ("text-embedding-3-large", plain(Encoding::Cl100kBase)),
    ("text-davinci-003", plain(Encoding::P50kBase)),
    ("text-davinci-002", plain(Encoding::P50kBase)),
    ("text-davinci-001", plain(Encoding::R50kBase)),
    ("text-curie-001", plain(Encoding::R50kBase)),
    ("text-babbage-001", plain(Encoding::R50kBase)),
    ("text-ada-001", plain(Encoding::R50kBase)),
    ("davinci", plain(Encoding::R50kBase)),
    ("curie", plain(Encoding::R50kBase)),
    ("babbage", plain(Encoding::R50kBase)),
    ("ada", plain(Encoding::R50kBase)),
    ("code-davinci-002", plain(Encoding::P50kBase)),
    ("code-davinci-001", plain(Encoding::P50kBase)),
    ("code-cushman-002", plain(Encoding::P50kBase)),
    ("code-cushman-001", plain(Encoding::P50kBase)),
    ("davinci-codex", plain(Encoding::P50kBase)),
    ("cushman-codex", plain(Encoding::P50kBase)),
    ("o200k_base", plain(Encoding::O200kBase)),
    ("cl100k_base", plain(Encoding::Cl100kBase)),
    ("p50k_base", plain(Encoding::P50kBase)),
    ("r50k_base", plain(Encoding::R50kBase)),
];

const PREFIX_RULES: &[(&str, Rule)] = &[
    ("gpt-4o", chat(Encoding::O200kBase)),
    ("gpt-4.1", chat(Encoding::O200kBase)),
    ("gpt-4.5", chat(Encoding::O200kBase)),
    ("gpt-5", chat(Encoding::O200kBase)),
    ("o1", chat(Encoding::O200kBase)),
    ("o3", chat(Encoding::O200kBase)),
    ("o4", chat(Encoding::O200kBase)),
    ("gpt-4", chat(Encoding::Cl100kBase)),
    ("gpt-35-turbo", chat(Encoding::Cl100kBase)),
    ("gpt-3.5-turbo", chat(Encoding::Cl100kBase)),
    ("text-embedding-", plain(Encoding::Cl100kBase)),
    // Approximation for vendors without a public BPE.
    ("claude-", chat(Encoding::Cl100kBase)),
    ("deepseek-", chat(Encoding::Cl100kBase)),
];

const CONTEXT_WINDOWS: &[(&str, u32)] = &[
    ("gpt-4o", 128_000),
    ("gpt-4.1", 1_047_576),
    ("gpt-4-turbo", 128_000),
    ("gpt-4-0125-preview", 128_000),
    ("gpt-4-1106-preview", 128_000),
    ("gpt-4-vision-preview", 128_000),
    ("gpt-4-32k", 32_768),
    ("gpt-4", 8_192),
    ("gpt-3.5-turbo-0301", 4_096),
    ("gpt-3.5-turbo-0613", 4_096),
    ("gpt-3.5-turbo-instruct", 4_096),
    ("gpt-3.5-turbo", 16_385),
    ("gpt-35-turbo", 16_385),
    ("o1", 200_000),
    ("o3", 200_000),
    ("o4", 200_000),
    ("text-davinci-003", 4_097),
    ("text-davinci-002", 4_097),
    ("text-davinci-001", 2_049),
    ("text-curie-001", 2_049),
    ("text-babbage-001", 2_049),
    ("text-ada-001", 2_049),
    ("davinci", 2_049),
    ("curie", 2_049),
    ("babbage", 2_049),
    ("ada", 2_049),
    ("text-embedding-", 8_191),
    ("claude-2.1", 200_000),
    ("claude-2", 100_000),
    ("claude-instant-1", 100_000),
    ("claude-", 200_000),
    ("deepseek-", 64_000),
];

/// Find the longest prefix entry matching `model`.
fn longest_prefix<'a, T: Copy>(table: &'a [(&'a str, T)], model: &str) -> Option<T> {
    table
        .iter()
        .filter(|(prefix, _)| model.starts_with(prefix))
        .max_by_key(|(prefix, _)| prefix.len())
        .map(|(_, value)| *value)
}

/// Drop a routing prefix such as `openai/` or `azure/`.
fn bare_model(model: &str) -> &str {
    model.rsplit('/').next().unwrap_or(model)
}

// ============================================================================
// Token Counter
// ============================================================================

/// Token totals for a conversation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MessageTokenCount {
    /// Sum of `per_message` plus the reply priming overhead.
    pub total: usize,
    /// One entry per input message, in order.
    pub per_message: Vec<usize>,
}

/// Model-aware token counter.
#[derive(Clone, Debug)]
pub struct TokenCounter {
    default_model: String,
    registered: HashMap<String, Rule>,
}

impl Default for TokenCounter {
    fn default() -> Self {
        Self::new("gpt-3.5-turbo")
    }
}

impl TokenCounter {
    /// Create a counter whose fallback model is `default_model`.
    pub fn new(default_model: impl Into<String>) -> Self {
        Self {
            default_model: default_model.into(),
            registered: HashMap::new(),
        }
    }

    /// Model used when the caller has no specific model to count against.
    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    /// Map an additional model name to an encoding.
    pub fn register_model(&mut self, model: &str, encoding: &str) -> Result<(), ConfigurationError> {
        if model.trim().is_empty() {
            return Err(ConfigurationError::Invalid("model name must not be empty".into()));
        }
        let encoding: Encoding = encoding.parse()?;
        let rule = Rule {
            encoding,
            chat: matches!(encoding, Encoding::O200kBase | Encoding::Cl100kBase),
        };
        self.registered.insert(model.to_string(), rule);
        debug!(model, encoding = %encoding, "registered tokenizer rule");
        Ok(())
    }

    fn rule(&self, model: &str) -> Result<Rule, ConfigurationError> {
        if let Some(rule) = self.registered.get(model) {
            return Ok(*rule);
        }
        let bare = bare_model(model);
        if let Some(rule) = self.registered.get(bare) {
            return Ok(*rule);
        }
        EXACT_RULES
            .iter()
            .find(|(name, _)| *name == bare)
            .map(|(_, rule)| *rule)
            .or_else(|| longest_prefix(PREFIX_RULES, bare))
            .ok_or_else(|| ConfigurationError::UnknownModel {
                model: model.to_string(),
            })
    }

    /// Encoding used for `model`.
    pub fn encoding_for(&self, model: &str) -> Result<Encoding, ConfigurationError> {
        self.rule(model).map(|r| r.encoding)
    }

    /// Whether `model` has a tokenization rule.
    pub fn knows(&self, model: &str) -> bool {
        self.rule(model).is_ok()
    }

    /// Count tokens in a string.
    pub fn count_tokens(&self, text: &str, model: &str) -> Result<usize, ConfigurationError> {
        let bpe = self.rule(model)?.encoding.bpe()?;
        if text.is_empty() {
            return Ok(0);
        }
        Ok(count_segments(bpe, text))
    }

    /// Count tokens in a conversation, with a per-message breakdown.
    ///
    /// Each message costs its role and content tokens plus a fixed framing
    /// overhead; chat-format models add the reply priming tokens to the total.
    pub fn count_message_tokens(
        &self,
        messages: &[ChatMessage],
        model: &str,
    ) -> Result<MessageTokenCount, ConfigurationError> {
        let rule = self.rule(model)?;
        let bpe = rule.encoding.bpe()?;
        if messages.is_empty() {
            return Ok(MessageTokenCount::default());
        }

        let per_message: Vec<usize> = messages
            .iter()
            .map(|m| {
                count_segments(bpe, m.role.as_str())
                    + count_segments(bpe, &m.content)
                    + MESSAGE_OVERHEAD
            })
            .collect();

        let mut total: usize = per_message.iter().sum();
        if rule.chat {
            total += REPLY_PRIMING;
        }

        Ok(MessageTokenCount { total, per_message })
    }

    /// Maximum context size for `model`, if known.
    pub fn context_window(&self, model: &str) -> Option<u32> {
        longest_prefix(CONTEXT_WINDOWS, bare_model(model))
    }

    /// Longest prefix of `text` (on a char boundary) that fits in `limit` tokens.
    pub fn truncate_to_limit<'t>(
        &self,
        text: &'t str,
        limit: usize,
        model: &str,
    ) -> Result<&'t str, ConfigurationError> {
        if limit == 0 || text.is_empty() {
            // Still validate the model.
            self.rule(model)?;
            return Ok("");
        }
        if self.count_tokens(text, model)? <= limit {
            return Ok(text);
        }

        let boundaries: Vec<usize> = text
            .char_indices()
            .map(|(i, _)| i)
            .skip(1)
            .chain(std::iter::once(text.len()))
            .collect();

        // boundaries[i] is the byte end of the first i+1 chars.
        let (mut low, mut high) = (0usize, boundaries.len());
        while low < high {
            let mid = (low + high) / 2;
            if self.count_tokens(&text[..boundaries[mid]], model)? <= limit {
                low = mid + 1;
            } else {
                high = mid;
            }
        }

        Ok(match low {
            0 => "",
            n => &text[..boundaries[n - 1]],
        })
    }
}

/// Token count of caller text.
///
/// Text is split into segments that start at a whitespace run following
/// non-whitespace, or after `SEGMENT_CHARS` characters. Appending to the text
/// only ever extends the last segment or opens a new one, and each segment
/// counts as the largest ordinary encoding of any of its prefixes, so the total
/// never shrinks as the text grows. Special-token markup such as
/// `<|endoftext|>` is encoded as plain text.
fn count_segments(bpe: &CoreBPE, text: &str) -> usize {
    let mut total = 0;
    let mut start = 0;
    let mut chars_in_segment = 0;
    let mut prev_is_space = false;

    for (i, c) in text.char_indices() {
        let is_space = c.is_whitespace();
        let word_start = is_space && !prev_is_space && i > start;
        if word_start || chars_in_segment == SEGMENT_CHARS {
            total += segment_tokens(bpe, &text[start..i]);
            start = i;
            chars_in_segment = 0;
        }
        chars_in_segment += 1;
        prev_is_space = is_space;
    }
    if start < text.len() {
        total += segment_tokens(bpe, &text[start..]);
    }
    total
}

fn segment_tokens(bpe: &CoreBPE, segment: &str) -> usize {
    segment
        .char_indices()
        .map(|(i, c)| bpe.encode_ordinary(&segment[..i + c.len_utf8()]).len())
        .max()
        .unwrap_or(0)
}
