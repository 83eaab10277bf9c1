//! Tokenizer loading and chat-template rendering.
//!
//! The tokenizer algorithm itself comes from the `tokenizers` crate; this
//! module only resolves, wraps, and drives it.

use std::path::Path;

use serde::Deserialize;
use tokenizers::Tokenizer;

use crate::request::ChatMessage;

pub struct TokenizerWrapper {
    inner: Tokenizer,
}

impl TokenizerWrapper {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let inner =
            Tokenizer::from_file(path).map_err(|e| anyhow::anyhow!("tokenizer load: {e}"))?;
        Ok(Self { inner })
    }

    /// Word-level tokenizer with vocabulary `t0..tN`, for tests that need
    /// stable, inspectable ids.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn for_testing(vocab_size: usize) -> Self {
        use tokenizers::models::wordlevel::WordLevel;
        use tokenizers::pre_tokenizers::whitespace::Whitespace;

        let mut vocab = ahash::AHashMap::new();
        for i in 0..vocab_size {
            vocab.insert(format!("t{i}"), i as u32);
        }
        let model = WordLevel::builder()
            .vocab(vocab)
            .unk_token("t0".into())
            .build()
            .expect("build test tokenizer model");
        let mut tokenizer = Tokenizer::new(model);
        tokenizer.with_pre_tokenizer(Some(Whitespace {}));
        Self { inner: tokenizer }
    }

    #[cfg(any(test, feature = "test-utils"))]
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        self.inner
            .save(path, false)
            .map_err(|e| anyhow::anyhow!("tokenizer save: {e}"))
    }

    pub fn encode(&self, text: &str) -> anyhow::Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| anyhow::anyhow!("encode: {e}"))?;
        Ok(encoding.get_ids().to_vec())
    }

    pub fn decode(&self, ids: &[u32]) -> anyhow::Result<String> {
        self.inner
            .decode(ids, true)
            .map_err(|e| anyhow::anyhow!("decode: {e}"))
    }
}

// ─── Chat Template ────────────────────────────────────────────────────────

/// Zephyr-style layout used when the tokenizer ships no template of its own.
const FALLBACK_TEMPLATE: &str = "{% for message in messages %}<|{{ message.role }}|>\n{{ message.content }}{{ eos_token }}\n{% endfor %}{% if add_generation_prompt %}<|assistant|>\n{% endif %}";

pub struct ChatTemplateEngine {
    template_source: String,
    bos_token: String,
    eos_token: String,
}

#[derive(Deserialize)]
struct TokenizerConfig {
    chat_template: Option<String>,
    #[serde(default)]
    bos_token: SpecialToken,
    #[serde(default)]
    eos_token: SpecialToken,
}

#[derive(Deserialize, Default)]
#[serde(untagged)]
enum SpecialToken {
    Plain(String),
    Dict {
        content: String,
    },
    #[default]
    None,
}

impl SpecialToken {
    fn as_str(&self) -> &str {
        match self {
            SpecialToken::Plain(s) => s,
            SpecialToken::Dict { content } => content,
            SpecialToken::None => "",
        }
    }
}

impl ChatTemplateEngine {
    pub fn new(template_source: String, bos_token: String, eos_token: String) -> Self {
        Self {
            template_source,
            bos_token,
            eos_token,
        }
    }

    /// Built-in Zephyr/Mistral layout.
    pub fn fallback() -> Self {
        Self::new(
            FALLBACK_TEMPLATE.to_string(),
            "<s>".to_string(),
            "</s>".to_string(),
        )
    }

    pub fn from_tokenizer_config(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: TokenizerConfig = serde_json::from_str(&content)?;
        let template_source = config
            .chat_template
            .ok_or_else(|| anyhow::anyhow!("no chat_template field in tokenizer_config.json"))?;
        Ok(Self {
            template_source,
            bos_token: config.bos_token.as_str().to_string(),
            eos_token: config.eos_token.as_str().to_string(),
        })
    }

    pub fn apply(
        &self,
        messages: &[ChatMessage],
        add_generation_prompt: bool,
    ) -> anyhow::Result<String> {
        let mut env = minijinja::Environment::new();
        env.add_template("chat", &self.template_source)?;
        let tmpl = env.get_template("chat")?;
        let rendered = tmpl.render(minijinja::context! {
            messages => messages,
            bos_token => &self.bos_token,
            eos_token => &self.eos_token,
            add_generation_prompt => add_generation_prompt,
        })?;
        Ok(rendered)
    }
}
