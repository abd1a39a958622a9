//! Tokenizer contract.
//!
//! Tokenization is an external collaborator: the engine only ever sees
//! token IDs. This wrapper adapts the `tokenizers` crate to the engine's
//! signed token IDs and reads the EOS/BOS tokens and chat template from the
//! sidecar `tokenizer_config.json`.

use std::path::Path;

use serde::Deserialize;
use tokenizers::Tokenizer;

use crate::core::sequence::TokenId;
use crate::error::{Error, Result};

/// Sidecar configuration shipped next to `tokenizer.json`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TokenizerSidecarConfig {
    /// End-of-sequence token string.
    #[serde(default)]
    pub eos_token: Option<String>,
    /// Beginning-of-sequence token string.
    #[serde(default)]
    pub bos_token: Option<String>,
    /// Jinja chat template, if the model ships one.
    #[serde(default)]
    pub chat_template: Option<String>,
}

/// Thin wrapper over a HuggingFace tokenizer.
pub struct TokenizerWrapper {
    tokenizer: Tokenizer,
    eos_token_id: Option<TokenId>,
    bos_token: Option<String>,
    chat_template: Option<String>,
}

impl TokenizerWrapper {
    /// Load `tokenizer.json` and, if present, its sidecar config.
    pub fn from_files(
        tokenizer_path: &Path,
        sidecar_path: Option<&Path>,
    ) -> Result<Self> {
        let tokenizer =
            Tokenizer::from_file(tokenizer_path).map_err(|e| Error::Tokenization(e.to_string()))?;
        let sidecar = match sidecar_path {
            Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
            None => TokenizerSidecarConfig::default(),
        };

        // Resolve the EOS id from the sidecar, falling back to the usual
        // suspects.
        let eos_token_id = sidecar
            .eos_token
            .as_deref()
            .and_then(|token| tokenizer.token_to_id(token))
            .or_else(|| tokenizer.token_to_id("<|endoftext|>"))
            .or_else(|| tokenizer.token_to_id("</s>"))
            .or_else(|| tokenizer.token_to_id("<|im_end|>"))
            .map(TokenId::from);

        Ok(Self {
            tokenizer,
            eos_token_id,
            bos_token: sidecar.bos_token,
            chat_template: sidecar.chat_template,
        })
    }

    /// Encode text into token IDs.
    pub fn encode(&self, text: &str) -> Result<Vec<TokenId>> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| Error::Tokenization(e.to_string()))?;
        Ok(encoding.get_ids().iter().map(|&id| TokenId::from(id)).collect())
    }

    /// Decode token IDs back into text.
    pub fn decode(&self, token_ids: &[TokenId]) -> Result<String> {
        let ids: Vec<u32> = token_ids
            .iter()
            .map(|&id| {
                u32::try_from(id)
                    .map_err(|_| Error::Tokenization(format!("token id {id} out of range")))
            })
            .collect::<Result<_>>()?;
        self.tokenizer
            .decode(&ids, true)
            .map_err(|e| Error::Tokenization(e.to_string()))
    }

    /// End-of-sequence token ID, if known.
    pub fn eos_token_id(&self) -> Option<TokenId> {
        self.eos_token_id
    }

    /// Beginning-of-sequence token string, if configured.
    pub fn bos_token(&self) -> Option<&str> {
        self.bos_token.as_deref()
    }

    /// Chat template, if the model ships one.
    pub fn chat_template(&self) -> Option<&str> {
        self.chat_template.as_deref()
    }
}
