use serde_json::Value;

use crate::core::error::TaskError;
use crate::llm::{BackendError, ChunkStream, LlmResponse, ResponseChunk};

/// Deferred work run once the stream ends: it receives the assembled answer, or the backend
/// error that cut the stream short. Whatever error it returns is what the iterator yields.
pub type Completion =
    Box<dyn FnOnce(Result<&LlmResponse, TaskError>) -> Result<Value, TaskError> + Send>;

/// A streamed answer.
///
/// Iterating pulls chunks from the backend one blocking call at a time. When the terminal
/// chunk arrives (or the backend stops yielding) the completion runs (history append,
/// parsing, `after` hooks) before the iterator reports exhaustion. A backend error mid-stream
/// hands the error to the completion instead. Dropping the stream early skips the completion.
pub struct ResponseStream {
    chunks: Option<ChunkStream>,
    response: LlmResponse,
    on_complete: Option<Completion>,
    outcome: Option<Result<Value, TaskError>>,
}

impl ResponseStream {
    pub fn new(chunks: ChunkStream, on_complete: Completion) -> Self {
        Self {
            chunks: Some(chunks),
            response: LlmResponse::default(),
            on_complete: Some(on_complete),
            outcome: None,
        }
    }

    /// A stream with no chunks whose outcome is already known.
    pub fn ready(outcome: Result<Value, TaskError>, on_complete: Box<dyn FnOnce() + Send>) -> Self {
        let mut outcome = Some(outcome);
        Self::new(
            Box::new(std::iter::empty()),
            Box::new(move |_: Result<&LlmResponse, TaskError>| {
                on_complete();
                outcome.take().unwrap_or(Ok(Value::Null))
            }),
        )
    }

    /// Text received so far.
    pub fn text(&self) -> &str {
        &self.response.text
    }

    pub fn is_complete(&self) -> bool {
        self.chunks.is_none()
    }

    /// Drain the remaining chunks and return the parsed result.
    pub fn finish(mut self) -> Result<Value, TaskError> {
        for chunk in self.by_ref() {
            chunk?;
        }
        self.outcome.take().unwrap_or_else(|| {
            Err(TaskError::Backend(BackendError::StreamError(
                "stream ended without a result".to_string(),
            )))
        })
    }

    fn complete(&mut self) {
        self.chunks = None;
        if let Some(on_complete) = self.on_complete.take() {
            self.outcome = Some(on_complete(Ok(&self.response)));
        }
    }
}

impl Iterator for ResponseStream {
    type Item = Result<ResponseChunk, TaskError>;

    fn next(&mut self) -> Option<Self::Item> {
        let chunks = self.chunks.as_mut()?;
        match chunks.next() {
            Some(Ok(chunk)) => {
                self.response.text.push_str(&chunk.delta);
                if chunk.model.is_some() {
                    self.response.model = chunk.model.clone();
                }
                if chunk.usage.is_some() {
                    self.response.usage = chunk.usage;
                }
                if chunk.done {
                    self.complete();
                }
                Some(Ok(chunk))
            }
            Some(Err(err)) => {
                log::error!(
                    "Stream failed after {} bytes: {}",
                    self.response.text.len(),
                    err
                );
                self.chunks = None;
                let err = TaskError::Backend(err);
                let Some(on_complete) = self.on_complete.take() else {
                    return Some(Err(err));
                };
                match on_complete(Err(err)) {
                    Ok(value) => {
                        self.outcome = Some(Ok(value));
                        None
                    }
                    Err(err) => Some(Err(err)),
                }
            }
            None => {
                self.complete();
                None
            }
        }
    }
}

impl std::fmt::Debug for ResponseStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseStream")
            .field("text", &self.response.text)
            .field("complete", &self.is_complete())
            .finish()
    }
}
