use crate::llm::{GenerationParams, LanguageModel};
use crate::pipeline::ProgressEvent;
use crate::retrieval::ErrorKind;
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Text produced by one generation
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOutcome {
    pub text: String,
    /// Why the stream broke off, if it did
    pub interrupted: Option<String>,
}

/// Streams an answer and republishes the growing text as `Partial` events
#[derive(Clone)]
pub struct GenerationStreamer {
    llm: Arc<dyn LanguageModel>,
}

impl GenerationStreamer {
    pub fn new(llm: Arc<dyn LanguageModel>) -> Self {
        Self { llm }
    }

    /// Returns `None` if the event receiver went away mid-stream
    ///
    /// A failure to start or continue the stream is not an error here: the
    /// text accumulated so far comes back with `interrupted` set.
    pub async fn stream(
        &self,
        prompt: &str,
        params: &GenerationParams,
        events: &mpsc::Sender<ProgressEvent>,
    ) -> Option<GenerationOutcome> {
        let mut text = String::new();

        let mut fragments = match self.llm.generate(prompt, params).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(kind = %ErrorKind::GenerationFailure, error = %e, "Generation failed to start");
                return Some(GenerationOutcome {
                    text,
                    interrupted: Some(e.to_string()),
                });
            }
        };

        while let Some(fragment) = fragments.next().await {
            match fragment {
                Ok(fragment) => {
                    if fragment.is_empty() {
                        continue;
                    }
                    text.push_str(&fragment);
                    if events.send(ProgressEvent::Partial(text.clone())).await.is_err() {
                        debug!("Answer consumer dropped; stopping generation");
                        return None;
                    }
                }
                Err(e) => {
                    warn!(
                        kind = %ErrorKind::GenerationFailure,
                        error = %e,
                        received_chars = text.len(),
                        "Generation stream broke off"
                    );
                    return Some(GenerationOutcome {
                        text,
                        interrupted: Some(e.to_string()),
                    });
                }
            }
        }

        Some(GenerationOutcome {
            text,
            interrupted: None,
        })
    }
}
