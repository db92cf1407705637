//! Ollama client over `POST {endpoint}/api/generate`
//!
//! `stream=false` for completions, `stream=true` for generation. Streamed
//! responses are NDJSON frames `{ "response": "...", "done": bool }`.

use crate::config::LlmConfig;
use crate::llm::{FragmentStream, GenerationParams, LanguageModel, LlmError};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, instrument, warn};

const STREAM_CHANNEL_CAPACITY: usize = 64;

/// Thin client for one Ollama chat model
#[derive(Clone)]
pub struct OllamaClient {
    client: reqwest::Client,
    url_generate: String,
    model: String,
    context_window: usize,
    system: Option<String>,
}

impl OllamaClient {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        let endpoint = config.endpoint.trim();
        if endpoint.is_empty()
            || !(endpoint.starts_with("http://") || endpoint.starts_with("https://"))
        {
            return Err(LlmError::InvalidEndpoint(config.endpoint.clone()));
        }

        let timeout = config
            .request_timeout()
            .map_err(|e| LlmError::InvalidEndpoint(e.to_string()))?;

        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            url_generate: format!("{}/api/generate", endpoint.trim_end_matches('/')),
            model: config.model.clone(),
            context_window: config.context_window,
            system: config.system.clone(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn request<'a>(
        &'a self,
        prompt: &'a str,
        stream: bool,
        params: Option<&GenerationParams>,
    ) -> GenerateRequest<'a> {
        GenerateRequest {
            model: &self.model,
            prompt,
            stream,
            system: self.system.as_deref(),
            options: GenerateOptions {
                num_ctx: Some(self.context_window),
                temperature: params.map(|p| p.temperature),
                num_predict: params.map(|p| p.max_output_tokens),
                num_gpu: params.and_then(|p| p.compute_hint),
            },
        }
    }

    async fn post(&self, body: &GenerateRequest<'_>) -> Result<reqwest::Response, LlmError> {
        debug!("POST {}", self.url_generate);
        let resp = self.client.post(&self.url_generate).json(body).send().await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            let snippet = text.chars().take(240).collect::<String>();
            return Err(LlmError::HttpStatus {
                status,
                url: self.url_generate.clone(),
                snippet,
            });
        }

        Ok(resp)
    }
}

#[async_trait]
impl LanguageModel for OllamaClient {
    #[instrument(skip_all, fields(model = %self.model))]
    async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        let resp = self.post(&self.request(prompt, false, None)).await?;

        let frame: GenerateFrame = resp.json().await.map_err(|e| {
            LlmError::Decode(format!("serde error: {e}; ensure `stream=false` is used"))
        })?;

        match frame.error {
            Some(message) => Err(LlmError::Upstream(message)),
            None => Ok(frame.response),
        }
    }

    #[instrument(skip_all, fields(model = %self.model))]
    async fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
    ) -> Result<FragmentStream, LlmError> {
        let resp = self.post(&self.request(prompt, true, Some(params))).await?;
        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);

        tokio::spawn(pump_frames(resp.bytes_stream(), tx));

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

/// Forward NDJSON frames as text fragments until `done`, an error, or the
/// receiver goes away
async fn pump_frames(
    mut body: impl futures_util::Stream<Item = reqwest::Result<bytes::Bytes>> + Unpin,
    tx: mpsc::Sender<Result<String, LlmError>>,
) {
    let mut lines = LineBuffer::default();

    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                let _ = tx.send(Err(LlmError::Transport(e))).await;
                return;
            }
        };

        for line in lines.push(&chunk) {
            match decode_frame(&line) {
                Ok(None) => continue,
                Ok(Some(frame)) => {
                    if let Some(message) = frame.error {
                        let _ = tx.send(Err(LlmError::Upstream(message))).await;
                        return;
                    }
                    if !frame.response.is_empty() && tx.send(Ok(frame.response)).await.is_err() {
                        debug!("Generation consumer dropped; closing stream");
                        return;
                    }
                    if frame.done {
                        return;
                    }
                }
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            }
        }
    }

    warn!("Generation stream ended without a completion frame");
    let _ = tx
        .send(Err(LlmError::Decode(
            "stream ended before completion".to_string(),
        )))
        .await;
}

fn decode_frame(line: &[u8]) -> Result<Option<GenerateFrame>, LlmError> {
    let text = std::str::from_utf8(line).map_err(|e| LlmError::Decode(e.to_string()))?;
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(text)
        .map(Some)
        .map_err(|e| LlmError::Decode(format!("invalid stream frame: {e}")))
}

/// Splits an incoming byte stream into complete `\n`-terminated lines
#[derive(Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
            line.pop();
            lines.push(line);
        }
        lines
    }
}

/* ==========================
HTTP payloads & options
========================== */

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<&'a str>,
    options: GenerateOptions,
}

/// Subset of Ollama `options`
#[derive(Debug, Default, Serialize)]
struct GenerateOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    num_ctx: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_gpu: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct GenerateFrame {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}
