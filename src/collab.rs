//! Interfaces of the collaborators the orchestrator calls out to

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::dialog::DialogSnapshot;
use crate::log::LogEntry;
use crate::team::ModelBinding;
use crate::types::{CallId, CallKind, DialogId};

/// Who produced the input of a turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "from", rename_all = "snake_case")]
pub enum InputSource {
    /// The human driving the mainline
    User,
    /// Another dialog's call
    Caller {
        dialog_id: DialogId,
        agent_id: String,
        kind: CallKind,
    },
}

/// Input that starts a dialog's next reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnInput {
    pub source: InputSource,
    pub text: String,
}

impl TurnInput {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            source: InputSource::User,
            text: text.into(),
        }
    }

    pub fn from_caller(
        dialog_id: DialogId,
        agent_id: impl Into<String>,
        kind: CallKind,
        text: impl Into<String>,
    ) -> Self {
        Self {
            source: InputSource::Caller {
                dialog_id,
                agent_id: agent_id.into(),
                kind,
            },
            text: text.into(),
        }
    }
}

/// Raw generated text, in chunks of any size
pub type TextStream = BoxStream<'static, anyhow::Result<String>>;

/// Stream over already-known chunks
pub fn text_stream<I, S>(chunks: I) -> TextStream
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let chunks: Vec<anyhow::Result<String>> = chunks.into_iter().map(|c| Ok(c.into())).collect();
    stream::iter(chunks).boxed()
}

/// Everything the generation collaborator gets for one response
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub dialog: DialogSnapshot,
    pub binding: ModelBinding,
    /// Dialog history, oldest first
    pub history: Vec<LogEntry>,
}

/// Produces the streamed response of a dialog's member
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, request: GenerationRequest) -> anyhow::Result<TextStream>;
}

/// Question routed out of the tree to a human
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HumanQuestion {
    pub call_id: CallId,
    /// The dialog asking
    pub dialog: DialogSnapshot,
    pub headline: String,
    pub body: Vec<String>,
}

/// Human interface; may take arbitrarily long to answer
#[async_trait]
pub trait HumanInterface: Send + Sync {
    async fn ask(&self, question: &HumanQuestion) -> anyhow::Result<String>;
}
