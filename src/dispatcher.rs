//! Call dispatch for one response turn
//!
//! Calls are planned in source order: validated, expanded per target, and
//! bound to callee dialogs. Every accepted delivery then starts at once and
//! the issuer waits on the whole set; replies land in the issuer's log only
//! after the last one settles, in source order.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::channel::{DialogEvent, EventSink};
use crate::dialog::{DialogHandle, PendingCall};
use crate::error::{CallError, OrchestratorError};
use crate::hierarchy::DialogTree;
use crate::log::{DialogLog, LogEntry};
use crate::session::{SessionKey, SessionRegistry};
use crate::team::Team;
use crate::tellask::{is_reserved_target, TellaskCall, HUMAN_TARGET, TELLASKER_TARGET};
use crate::types::{CallId, CallKind};

/// Where a delivery goes
#[derive(Clone)]
pub enum DeliveryTarget {
    /// A dialog in the tree; `created` is false when a session was resumed
    Dialog { dialog: DialogHandle, created: bool },
    Human,
}

/// One target's share of a call
#[derive(Clone)]
pub struct Delivery {
    pub call_id: CallId,
    pub kind: CallKind,
    pub issuer: DialogHandle,
    pub target: DeliveryTarget,
    pub headline: String,
    pub body: Vec<String>,
    pub session_slug: Option<String>,
}

impl Delivery {
    /// Member id of the callee, or `human`
    pub fn target_name(&self) -> &str {
        match &self.target {
            DeliveryTarget::Human => HUMAN_TARGET,
            DeliveryTarget::Dialog { dialog, .. } => &dialog.agent_id,
        }
    }

    /// Headline and body as the callee reads them
    pub fn text(&self) -> String {
        if self.body.is_empty() {
            self.headline.clone()
        } else {
            format!("{}\n{}", self.headline, self.body.join("\n"))
        }
    }

    fn pending(&self) -> PendingCall {
        let target = match self.kind {
            CallKind::AskBack => TELLASKER_TARGET.to_string(),
            _ => self.target_name().to_string(),
        };
        PendingCall {
            call_id: self.call_id,
            kind: self.kind,
            target,
        }
    }
}

/// Outcome of one call (or one target of a collective call)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallReply {
    pub call_id: CallId,
    pub kind: CallKind,
    /// Absent when the call was refused before a target was known
    pub target: Option<String>,
    pub headline: String,
    pub outcome: Result<String, CallError>,
}

impl CallReply {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Runs a delivery to completion and returns the reply text
#[async_trait]
pub trait Deliver: Send + Sync {
    async fn deliver(&self, delivery: Delivery) -> anyhow::Result<String>;
}

/// A call turned into work, or refused
enum Planned {
    Deliver(Delivery),
    Reject(CallReply),
}

/// Validates and fans out calls, then joins on their replies
pub struct Dispatcher {
    team: Arc<Team>,
    tree: Arc<DialogTree>,
    sessions: Arc<SessionRegistry>,
    log: Arc<dyn DialogLog>,
    events: EventSink,
}

impl Dispatcher {
    pub fn new(
        team: Arc<Team>,
        tree: Arc<DialogTree>,
        sessions: Arc<SessionRegistry>,
        log: Arc<dyn DialogLog>,
        events: EventSink,
    ) -> Self {
        Self {
            team,
            tree,
            sessions,
            log,
            events,
        }
    }

    /// Deliver every call of one turn and wait for all replies
    ///
    /// Refused calls come back as error replies alongside the delivered ones,
    /// in source order.
    #[instrument(skip_all, fields(dialog_id = %issuer.id(), calls = calls.len()))]
    pub async fn dispatch<D>(
        &self,
        issuer: &DialogHandle,
        calls: Vec<TellaskCall>,
        deliver: &D,
    ) -> Result<Vec<CallReply>, OrchestratorError>
    where
        D: Deliver + ?Sized,
    {
        let planned = self.plan(issuer, &calls);

        let pending: Vec<PendingCall> = planned
            .iter()
            .filter_map(|p| match p {
                Planned::Deliver(d) => Some(d.pending()),
                Planned::Reject(_) => None,
            })
            .collect();
        if !pending.is_empty() {
            issuer.begin_calls(&pending)?;
        }

        info!(
            deliveries = pending.len(),
            rejected = planned.len() - pending.len(),
            "Dispatching turn"
        );

        let replies = join_all(planned.into_iter().map(|item| async move {
            match item {
                Planned::Reject(reply) => reply,
                Planned::Deliver(delivery) => self.run_delivery(issuer, delivery, deliver).await,
            }
        }))
        .await;

        for reply in &replies {
            self.log.append(issuer.id(), LogEntry::Reply(reply.clone()));
        }

        Ok(replies)
    }

    async fn run_delivery<D>(&self, issuer: &DialogHandle, delivery: Delivery, deliver: &D) -> CallReply
    where
        D: Deliver + ?Sized,
    {
        let call_id = delivery.call_id;
        let kind = delivery.kind;
        let target = delivery.target_name().to_string();
        let headline = delivery.headline.clone();

        let outcome = deliver
            .deliver(delivery)
            .await
            .map_err(|e| CallError::DeliveryFailed {
                reason: format!("{e:#}"),
            });

        if let Err(e) = issuer.deliver_reply(call_id) {
            warn!(call_id = %call_id, error = %e, "Reply for a call that was not pending");
        }

        debug!(call_id = %call_id, target = %target, ok = outcome.is_ok(), "Reply received");
        self.events.emit(DialogEvent::ReplyDelivered {
            dialog_id: issuer.id(),
            call_id,
            target: target.clone(),
            ok: outcome.is_ok(),
        });

        CallReply {
            call_id,
            kind,
            target: Some(target),
            headline,
            outcome,
        }
    }

    /// Validate and bind every call, in source order
    fn plan(&self, issuer: &DialogHandle, calls: &[TellaskCall]) -> Vec<Planned> {
        let mut planned = Vec::new();
        let mut ask_back_seen = issuer.has_pending_ask_back();

        for call in calls {
            if let Err(error) = self.validate(issuer, call, ask_back_seen) {
                planned.push(self.reject(issuer, call, None, error));
                continue;
            }

            match call.kind {
                CallKind::AskHuman => {
                    planned.push(self.accept(issuer, call, DeliveryTarget::Human));
                }
                CallKind::AskBack => match self.tree.parent(&issuer.id()) {
                    Some(parent) if !parent.is_completed() => {
                        ask_back_seen = true;
                        planned.push(self.accept(
                            issuer,
                            call,
                            DeliveryTarget::Dialog {
                                dialog: parent,
                                created: false,
                            },
                        ));
                    }
                    Some(_) => planned.push(self.reject(
                        issuer,
                        call,
                        Some(TELLASKER_TARGET.to_string()),
                        CallError::usage("supdialog is completed"),
                    )),
                    None => planned.push(self.reject(
                        issuer,
                        call,
                        Some(TELLASKER_TARGET.to_string()),
                        CallError::usage("supdialog no longer exists"),
                    )),
                },
                CallKind::SelfRoute => {
                    let agent_id = issuer.agent_id.clone();
                    planned.push(self.plan_sideline(issuer, call, &agent_id));
                }
                CallKind::Teammate => {
                    for agent_id in &call.mentions {
                        planned.push(self.plan_sideline(issuer, call, agent_id));
                    }
                }
            }
        }

        planned
    }

    fn validate(
        &self,
        issuer: &DialogHandle,
        call: &TellaskCall,
        ask_back_seen: bool,
    ) -> Result<(), CallError> {
        if call.malformed {
            return Err(CallError::MalformedCall {
                headline: call.headline.clone(),
            });
        }
        if call.session_directives > 1 {
            return Err(CallError::usage("at most one session directive per call"));
        }
        if call.session_directives == 1 && call.session_slug.is_none() {
            return Err(CallError::usage("session directive is missing its slug"));
        }
        if call.mentions.len() > 1 && call.mentions.iter().any(|m| is_reserved_target(m)) {
            return Err(CallError::usage(
                "@human, @tellasker and @self cannot be combined with other targets",
            ));
        }
        if call.session_slug.is_some() && !call.kind.allows_session() {
            return Err(CallError::usage(format!("{} calls cannot carry a session", call.kind)));
        }
        if call.kind == CallKind::AskBack {
            if issuer.is_mainline() {
                return Err(CallError::usage("the mainline dialog has no supdialog to ask back"));
            }
            if ask_back_seen {
                return Err(CallError::usage("an ask-back is already awaiting its reply"));
            }
        }
        Ok(())
    }

    fn plan_sideline(&self, issuer: &DialogHandle, call: &TellaskCall, agent_id: &str) -> Planned {
        if !self.team.contains(agent_id) {
            return self.reject(
                issuer,
                call,
                Some(agent_id.to_string()),
                CallError::UnknownTarget {
                    agent: agent_id.to_string(),
                },
            );
        }

        match self.bind_sideline(issuer, call, agent_id) {
            Ok((dialog, created)) => self.accept(issuer, call, DeliveryTarget::Dialog { dialog, created }),
            Err(error) => self.reject(issuer, call, Some(agent_id.to_string()), error),
        }
    }

    /// New sideline, or the live dialog of an existing session
    fn bind_sideline(
        &self,
        issuer: &DialogHandle,
        call: &TellaskCall,
        agent_id: &str,
    ) -> Result<(DialogHandle, bool), CallError> {
        let toolless = call.kind == CallKind::SelfRoute;

        let slug = match &call.session_slug {
            None => {
                let dialog = self.tree.create_sideline(issuer, agent_id, toolless, None)?;
                return Ok((dialog, true));
            }
            Some(slug) => slug,
        };

        let key = SessionKey::new(issuer.root_id, call.kind, issuer.agent_id.clone(), agent_id, slug.clone());
        let (dialog_id, created) = self.sessions.resolve_or_bind(
            &key,
            |id| self.tree.is_live(&id),
            || {
                self.tree
                    .create_sideline(issuer, agent_id, toolless, Some(slug.clone()))
                    .map(|d| d.id())
            },
        )?;

        let dialog = self.tree.get(&dialog_id).ok_or_else(|| CallError::DeliveryFailed {
            reason: format!("session dialog {dialog_id} vanished"),
        })?;

        debug!(session = %key, dialog_id = %dialog_id, created, "Session bound");
        Ok((dialog, created))
    }

    fn accept(&self, issuer: &DialogHandle, call: &TellaskCall, target: DeliveryTarget) -> Planned {
        let delivery = Delivery {
            call_id: CallId::new(),
            kind: call.kind,
            issuer: issuer.clone(),
            target,
            headline: call.headline.clone(),
            body: call.body.clone(),
            session_slug: call.session_slug.clone(),
        };

        self.events.emit(DialogEvent::CallDispatched {
            dialog_id: issuer.id(),
            call_id: delivery.call_id,
            kind: delivery.kind,
            target: delivery.target_name().to_string(),
        });

        Planned::Deliver(delivery)
    }

    fn reject(
        &self,
        issuer: &DialogHandle,
        call: &TellaskCall,
        target: Option<String>,
        error: CallError,
    ) -> Planned {
        debug!(dialog_id = %issuer.id(), target = ?target, error = %error, "Call rejected");
        self.events.emit(DialogEvent::CallRejected {
            dialog_id: issuer.id(),
            target: target.clone(),
            error: error.clone(),
        });

        Planned::Reject(CallReply {
            call_id: CallId::new(),
            kind: call.kind,
            target,
            headline: call.headline.clone(),
            outcome: Err(error),
        })
    }
}
