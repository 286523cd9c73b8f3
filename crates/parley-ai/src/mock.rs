use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use parley_core::errors::ProviderError;
use parley_core::message::ToolCall;
use parley_core::provider::{ChatProvider, GenerateOptions, ProviderReply, ProviderTurn};

/// Pre-programmed replies for deterministic testing without API calls.
pub enum MockReply {
    Reply(ProviderReply),
    /// Return an error from the generate() call itself.
    Error(ProviderError),
}

impl MockReply {
    /// Convenience: a plain text assistant reply.
    pub fn text(text: &str) -> Self {
        Self::Reply(ProviderReply {
            content: Some(text.to_string()),
            tool_calls: Vec::new(),
            usage: None,
        })
    }

    /// Convenience: a reply that invokes a single tool.
    pub fn tool_call(call: ToolCall) -> Self {
        Self::Reply(ProviderReply {
            content: None,
            tool_calls: vec![call],
            usage: None,
        })
    }
}

/// Record of one generate() invocation, kept so tests can assert on the
/// prompt window and tool availability the caller passed in.
pub struct RecordedCall {
    pub turns: Vec<ProviderTurn>,
    pub system_prompt: Option<String>,
    pub model: String,
    pub tools_offered: usize,
}

/// Mock provider that returns pre-programmed replies in sequence.
pub struct MockProvider {
    replies: Mutex<Vec<MockReply>>,
    calls: Mutex<Vec<RecordedCall>>,
    call_count: AtomicUsize,
}

impl MockProvider {
    pub fn new(replies: Vec<MockReply>) -> Self {
        Self {
            replies: Mutex::new(replies),
            calls: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    pub fn recorded_calls(&self) -> Vec<RecordedCall> {
        std::mem::take(&mut *self.calls.lock())
    }
}

#[async_trait]
impl ChatProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn generate(
        &self,
        turns: &[ProviderTurn],
        system_prompt: Option<&str>,
        model: &str,
        options: &GenerateOptions,
    ) -> Result<ProviderReply, ProviderError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);

        self.calls.lock().push(RecordedCall {
            turns: turns.to_vec(),
            system_prompt: system_prompt.map(str::to_string),
            model: model.to_string(),
            tools_offered: options.tools.len(),
        });

        let mut replies = self.replies.lock();
        if replies.is_empty() {
            return Err(ProviderError::InvalidRequest(format!(
                "MockProvider: no reply configured for call {idx}"
            )));
        }

        match replies.remove(0) {
            MockReply::Reply(reply) => Ok(reply),
            MockReply::Error(error) => Err(error),
        }
    }
}
