//! Main orchestrator - drives dialogs through generation and dispatch

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tracing::{debug, info, instrument, warn};

use crate::access::AccessEvaluator;
use crate::channel::{event_channel, DialogEvent, EventSink, EventStream};
use crate::collab::{GenerationRequest, Generator, HumanInterface, HumanQuestion, TurnInput};
use crate::config::OrchestratorConfig;
use crate::dialog::{DialogHandle, PendingCall};
use crate::dispatcher::{Deliver, Delivery, DeliveryTarget, Dispatcher};
use crate::error::OrchestratorError;
use crate::hierarchy::DialogTree;
use crate::log::{DialogLog, LogEntry, MemoryLog};
use crate::session::SessionRegistry;
use crate::team::Team;
use crate::tellask::{ParsedMessage, TellaskEvent, TellaskParser};
use crate::tools::{ToolContext, ToolError, ToolRegistry};
use crate::types::{CallKind, DialogId, DialogStatus};

/// Assembles an [`Orchestrator`] from its collaborators
pub struct OrchestratorBuilder {
    team: Team,
    generator: Arc<dyn Generator>,
    human: Arc<dyn HumanInterface>,
    config: OrchestratorConfig,
    tools: ToolRegistry,
    log: Arc<dyn DialogLog>,
    events: EventSink,
}

impl OrchestratorBuilder {
    pub fn new(team: Team, generator: Arc<dyn Generator>, human: Arc<dyn HumanInterface>) -> Self {
        Self {
            team,
            generator,
            human,
            config: OrchestratorConfig::default(),
            tools: ToolRegistry::new(),
            log: Arc::new(MemoryLog::new()),
            events: EventSink::disconnected(),
        }
    }

    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn log(mut self, log: Arc<dyn DialogLog>) -> Self {
        self.log = log;
        self
    }

    pub fn events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn build(self) -> Result<Orchestrator, OrchestratorError> {
        self.config.validate()?;

        let team = Arc::new(self.team);
        let tree = Arc::new(DialogTree::new(self.events.clone(), self.config.max_depth));
        let sessions = Arc::new(SessionRegistry::new());
        let dispatcher = Dispatcher::new(
            Arc::clone(&team),
            Arc::clone(&tree),
            Arc::clone(&sessions),
            Arc::clone(&self.log),
            self.events.clone(),
        );

        info!(
            members = team.len(),
            tools = self.tools.len(),
            max_depth = self.config.max_depth,
            "Orchestrator ready"
        );

        Ok(Orchestrator {
            access: AccessEvaluator::new(self.config.reserved.clone()),
            config: self.config,
            team,
            tree,
            sessions,
            dispatcher,
            tools: self.tools,
            log: self.log,
            generator: self.generator,
            human: self.human,
            events: self.events,
        })
    }

    /// Build with a fresh event channel and return its receiving half
    pub fn build_with_channel(self) -> Result<(Orchestrator, EventStream), OrchestratorError> {
        let (sink, stream) = event_channel();
        Ok((self.events(sink).build()?, stream))
    }
}

/// The orchestrator
///
/// Owns the dialog tree and session registry, runs each dialog's generation
/// loop and routes its calls through the dispatcher.
pub struct Orchestrator {
    config: OrchestratorConfig,
    team: Arc<Team>,
    tree: Arc<DialogTree>,
    sessions: Arc<SessionRegistry>,
    dispatcher: Dispatcher,
    access: AccessEvaluator,
    tools: ToolRegistry,
    log: Arc<dyn DialogLog>,
    generator: Arc<dyn Generator>,
    human: Arc<dyn HumanInterface>,
    events: EventSink,
}

impl Orchestrator {
    /// Open a new dialog tree for a member
    pub fn start_mainline(&self, agent_id: &str) -> Result<DialogHandle, OrchestratorError> {
        if !self.team.contains(agent_id) {
            return Err(OrchestratorError::MemberNotFound(agent_id.to_string()));
        }
        let dialog = self.tree.create_mainline(agent_id);
        info!(dialog_id = %dialog.id(), agent_id, "Mainline started");
        Ok(dialog)
    }

    /// Feed input to a dialog and run it until it produces a reply
    ///
    /// Calls issued along the way are dispatched and joined before the dialog
    /// generates again; the first response without calls is the reply.
    #[instrument(skip(self, input))]
    pub async fn run(&self, dialog_id: DialogId, input: TurnInput) -> Result<String, OrchestratorError> {
        let dialog = self.tree.get_or_err(&dialog_id)?;
        self.drive(&dialog, input).await
    }

    async fn drive(&self, dialog: &DialogHandle, input: TurnInput) -> Result<String, OrchestratorError> {
        let mut input = Some(input);

        let limit = self.config.max_turns_per_reply;
        for turn in 1..=limit {
            let message = {
                let _turn = dialog.lock_turn().await;
                if dialog.is_completed() {
                    return Err(OrchestratorError::InvalidTransition {
                        dialog: dialog.id(),
                        status: DialogStatus::Completed,
                        action: "generate",
                    });
                }
                // input and response land next to each other in the log
                if let Some(input) = input.take() {
                    self.log.append(dialog.id(), LogEntry::Input(input));
                }
                self.generate(dialog).await?
            };

            if !message.has_calls() {
                debug!(dialog_id = %dialog.id(), turn, "Reply ready");
                return Ok(message.prose());
            }

            let replies = self
                .dispatcher
                .dispatch(dialog, message.into_calls(), self)
                .await?;
            debug!(dialog_id = %dialog.id(), turn, replies = replies.len(), "Turn joined");
        }

        warn!(dialog_id = %dialog.id(), limit, "Turn limit reached");
        Err(OrchestratorError::TurnLimit {
            dialog: dialog.id(),
            limit,
        })
    }

    /// Stream one response through the parser, reporting as it goes
    async fn generate(&self, dialog: &DialogHandle) -> Result<ParsedMessage, OrchestratorError> {
        let member = self
            .team
            .get(&dialog.agent_id)
            .ok_or_else(|| OrchestratorError::MemberNotFound(dialog.agent_id.clone()))?;

        let request = GenerationRequest {
            dialog: dialog.snapshot(),
            binding: member.binding.clone(),
            history: self.log.read(dialog.id()),
        };

        let mut stream = self
            .generator
            .generate(request)
            .await
            .map_err(OrchestratorError::Generation)?;

        let mut parser = TellaskParser::new();
        let mut message = ParsedMessage::default();
        let mut text = String::new();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(OrchestratorError::Generation)?;
            text.push_str(&chunk);
            let events = parser.push(&chunk);
            self.report(dialog.id(), &events);
            message.extend(events);
        }
        let events = parser.finish();
        self.report(dialog.id(), &events);
        message.extend(events);

        self.log.append(dialog.id(), LogEntry::Response { text });
        Ok(message)
    }

    fn report(&self, dialog_id: DialogId, events: &[TellaskEvent]) {
        for event in events {
            let event = match event {
                TellaskEvent::Prose(line) => DialogEvent::Prose {
                    dialog_id,
                    line: line.clone(),
                },
                TellaskEvent::Call(call) => DialogEvent::CallParsed {
                    dialog_id,
                    call: call.clone(),
                },
            };
            self.events.emit(event);
        }
    }

    /// Mark a dialog completed; a mainline also releases its tree's sessions
    pub fn complete_dialog(&self, dialog_id: DialogId) -> Result<bool, OrchestratorError> {
        let dialog = self.tree.get_or_err(&dialog_id)?;
        let changed = self.tree.complete(&dialog_id)?;
        if dialog.is_mainline() {
            self.sessions.release_tree(dialog.root_id);
        }
        Ok(changed)
    }

    /// Calls a dialog is still waiting on
    pub fn pending_calls(&self, dialog_id: DialogId) -> Result<Vec<PendingCall>, OrchestratorError> {
        Ok(self.tree.get_or_err(&dialog_id)?.pending_calls())
    }

    /// Run a tool on behalf of a dialog, after every guard passes
    #[instrument(skip(self, args))]
    pub async fn invoke_tool(
        &self,
        dialog_id: DialogId,
        tool_name: &str,
        args: serde_json::Value,
    ) -> Result<String, ToolError> {
        let dialog = self
            .tree
            .get(&dialog_id)
            .ok_or(ToolError::UnknownDialog { dialog: dialog_id })?;

        if dialog.toolless {
            return Err(ToolError::Toolless { dialog: dialog_id });
        }
        let status = dialog.status();
        if status != DialogStatus::Active {
            return Err(ToolError::NotActive {
                dialog: dialog_id,
                status,
            });
        }

        let not_permitted = || ToolError::NotPermitted {
            member: dialog.agent_id.clone(),
            tool: tool_name.to_string(),
        };
        let member = self.team.get(&dialog.agent_id).ok_or_else(not_permitted)?;
        if !member.has_capability(tool_name) {
            return Err(not_permitted());
        }

        let tool = self.tools.get(tool_name).ok_or_else(|| ToolError::UnknownTool {
            tool: tool_name.to_string(),
        })?;

        for access in tool.footprint(&args) {
            self.access
                .check(member, &access.path, access.mode, tool.bypasses_reserved())
                .map_err(ToolError::Denied)?;
        }

        let ctx = ToolContext {
            dialog_id,
            member_id: member.id.clone(),
        };
        debug!(dialog_id = %dialog_id, tool = tool_name, "Invoking tool");
        tool.invoke(&ctx, args).await.map_err(|e| ToolError::Failed {
            message: format!("{e:#}"),
        })
    }

    pub fn tree(&self) -> &DialogTree {
        &self.tree
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn team(&self) -> &Team {
        &self.team
    }

    pub fn log(&self) -> &dyn DialogLog {
        self.log.as_ref()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn access(&self) -> &AccessEvaluator {
        &self.access
    }
}

#[async_trait]
impl Deliver for Orchestrator {
    async fn deliver(&self, delivery: Delivery) -> anyhow::Result<String> {
        match &delivery.target {
            DeliveryTarget::Human => {
                let question = HumanQuestion {
                    call_id: delivery.call_id,
                    dialog: delivery.issuer.snapshot(),
                    headline: delivery.headline.clone(),
                    body: delivery.body.clone(),
                };
                info!(dialog_id = %delivery.issuer.id(), call_id = %delivery.call_id, "Asking human");
                self.human.ask(&question).await
            }
            DeliveryTarget::Dialog { dialog, created } => {
                debug!(
                    call_id = %delivery.call_id,
                    target = %dialog.id(),
                    kind = %delivery.kind,
                    created,
                    "Delivering call"
                );
                let input = TurnInput::from_caller(
                    delivery.issuer.id(),
                    delivery.issuer.agent_id.clone(),
                    delivery.kind,
                    delivery.text(),
                );
                let reply = self.drive(dialog, input).await;

                let ephemeral = delivery.session_slug.is_none() && delivery.kind != CallKind::AskBack;
                if ephemeral {
                    if let Err(e) = self.tree.complete(&dialog.id()) {
                        warn!(dialog_id = %dialog.id(), error = %e, "Ephemeral sideline left open");
                    }
                }

                Ok(reply?)
            }
        }
    }
}
