//! Scripted collaborators shared by the integration tests

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use tellask::{
    text_stream, EventStream, GenerationRequest, Generator, HumanInterface, HumanQuestion,
    Orchestrator, OrchestratorBuilder, Team, TextStream, ToolCatalog, ToolRegistry,
};

pub const ROSTER: &str = r#"
member_defaults:
  provider: test
  model: scripted
members:
  alice:
    name: Alice
    tools: [write_file]
    write_dirs: [src]
    no_write_dirs: [src/vendor]
  bob: {}
  carol: {}
  dave: {}
"#;

/// Generator replaying per-member response queues in small chunks
#[derive(Default)]
pub struct ScriptedGenerator {
    scripts: Mutex<HashMap<String, VecDeque<String>>>,
    gates: Mutex<HashMap<String, oneshot::Receiver<()>>>,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue responses for a member, consumed one per generation
    pub fn script<I, S>(self, agent: &str, responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scripts
            .lock()
            .entry(agent.to_string())
            .or_default()
            .extend(responses.into_iter().map(Into::into));
        self
    }

    /// Hold the member's next generation until the returned sender fires
    pub fn gate(&self, agent: &str) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.gates.lock().insert(agent.to_string(), rx);
        tx
    }

    pub fn requests_for(&self, agent: &str) -> Vec<GenerationRequest> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.dialog.agent_id == agent)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(&self, request: GenerationRequest) -> anyhow::Result<TextStream> {
        let agent = request.dialog.agent_id.clone();
        self.requests.lock().push(request);

        let gate = self.gates.lock().remove(&agent);
        if let Some(gate) = gate {
            gate.await?;
        }

        let text = self
            .scripts
            .lock()
            .get_mut(&agent)
            .and_then(VecDeque::pop_front)
            .ok_or_else(|| anyhow::anyhow!("no script left for @{agent}"))?;

        Ok(text_stream(chunked(&text, 3)))
    }
}

/// Split on char boundaries into pieces of at most `size` chars
pub fn chunked(text: &str, size: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    chars.chunks(size).map(|c| c.iter().collect()).collect()
}

/// Human interface answering with a fixed text
pub struct ScriptedHuman {
    answer: String,
    pub questions: Mutex<Vec<HumanQuestion>>,
}

impl ScriptedHuman {
    pub fn new(answer: &str) -> Self {
        Self {
            answer: answer.to_string(),
            questions: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl HumanInterface for ScriptedHuman {
    async fn ask(&self, question: &HumanQuestion) -> anyhow::Result<String> {
        self.questions.lock().push(question.clone());
        Ok(self.answer.clone())
    }
}

pub fn team() -> Team {
    Team::from_yaml_str(ROSTER, &ToolCatalog::new().with_tool("write_file"))
        .unwrap()
        .team
}

pub fn orchestrator(
    generator: Arc<ScriptedGenerator>,
    human: Arc<ScriptedHuman>,
    tools: ToolRegistry,
) -> (Orchestrator, EventStream) {
    OrchestratorBuilder::new(team(), generator, human)
        .tools(tools)
        .build_with_channel()
        .unwrap()
}
