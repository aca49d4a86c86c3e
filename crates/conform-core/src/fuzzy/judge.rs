//! The judge seam: one prompt in, one completion out.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use super::error::{JudgeError, JudgeResult};

/// A language-model completion endpoint.
///
/// Implementations should be configured for low-variance output (low
/// temperature); callers still treat every answer as advisory.
#[async_trait]
pub trait Judge: Send + Sync {
    /// Provider and model, e.g. `openai/gpt-4o`.
    fn describe(&self) -> String;

    /// Return the raw completion text for `prompt`.
    async fn complete(&self, prompt: &str) -> JudgeResult<String>;
}

/// Scripted reply for [`ScriptedJudge`].
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// Return this completion text
    Text(String),
    /// Never answer
    Hang,
    /// Fail with this error
    Fail(JudgeError),
}

type Responder = dyn Fn(&str) -> ScriptedReply + Send + Sync;

/// Deterministic in-process judge for tests. Replies are chosen by a
/// closure over the prompt text.
pub struct ScriptedJudge {
    responder: Box<Responder>,
    calls: AtomicUsize,
}

impl ScriptedJudge {
    pub fn new(responder: impl Fn(&str) -> ScriptedReply + Send + Sync + 'static) -> Self {
        Self {
            responder: Box::new(responder),
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of `complete` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Judge for ScriptedJudge {
    fn describe(&self) -> String {
        "scripted/test".to_string()
    }

    async fn complete(&self, prompt: &str) -> JudgeResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match (self.responder)(prompt) {
            ScriptedReply::Text(text) => Ok(text),
            ScriptedReply::Fail(err) => Err(err),
            ScriptedReply::Hang => std::future::pending().await,
        }
    }
}
