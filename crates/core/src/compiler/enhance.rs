//! Optional docstring enhancement pass. A stateless, best-effort rewrite of
//! the generated module through an OpenAI-compatible chat completions
//! endpoint; any failure falls back to the unenhanced text. Hashing always
//! runs on post-enhancement content, so the manifest reflects what was
//! actually written.

use crate::config::MfpConfig;
use async_trait::async_trait;
use mfp_shared::{MfpError, MfpResult};
use std::time::Duration;

/// Seam for the enhancement pass. Implementations must be best-effort:
/// `enhance` returns the text to write, never an error.
#[async_trait]
pub trait DocEnhancer: Send + Sync {
    async fn enhance(&self, server_name: &str, code: &str) -> String;
}

pub struct LlmEnhancer {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
}

impl LlmEnhancer {
    pub fn from_config(config: &MfpConfig) -> MfpResult<Self> {
        let api_key = config.llm_api_key.clone().ok_or_else(|| {
            MfpError::Config("MFP_LLM_API_KEY must be set when --llm-enhance is used".into())
        })?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| MfpError::Internal(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_url: config.llm_api_url.clone(),
            api_key,
            model: config.llm_model.clone(),
        })
    }

    async fn request_rewrite(&self, code: &str) -> anyhow::Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "stream": false,
            "messages": [
                {
                    "role": "system",
                    "content": "You improve docstrings in generated Python API client modules. \
                        Rewrite only docstring text to be clearer and more helpful. \
                        Do not change any code, signatures, imports, or the header banner. \
                        Reply with the complete module, nothing else."
                },
                { "role": "user", "content": code }
            ]
        });

        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;

        let json: serde_json::Value = response.json().await?;
        if let Some(error) = json.get("error") {
            let msg = error
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown error");
            anyhow::bail!("LLM API error: {msg}");
        }

        json.get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|v| v.as_str())
            .map(ToString::to_string)
            .ok_or_else(|| anyhow::anyhow!("missing choices[0].message.content"))
    }
}

#[async_trait]
impl DocEnhancer for LlmEnhancer {
    async fn enhance(&self, server_name: &str, code: &str) -> String {
        match self.request_rewrite(code).await {
            Ok(rewritten) => {
                // Reject rewrites that touched more than prose: the banner
                // and every def line must survive verbatim.
                let defs_intact = code
                    .lines()
                    .filter(|l| l.starts_with("def "))
                    .all(|l| rewritten.contains(l));
                if rewritten.contains("GENERATED — DO NOT EDIT") && defs_intact {
                    tracing::info!(server = %server_name, "docstrings enhanced");
                    rewritten
                } else {
                    tracing::warn!(server = %server_name, "enhanced output failed validation, keeping original");
                    code.to_string()
                }
            }
            Err(e) => {
                tracing::warn!(server = %server_name, error = %e, "docstring enhancement failed, keeping original");
                code.to_string()
            }
        }
    }
}
