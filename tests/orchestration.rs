mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use tellask::{
    CallError, CallKind, DeniedScope, DialogEvent, DialogStatus, EventStream, InputSource, LogEntry,
    OrchestratorBuilder, OrchestratorConfig, OrchestratorError, PathAccess, Tool, ToolContext,
    ToolError, ToolRegistry, TurnInput,
};

use common::{orchestrator, team, ScriptedGenerator, ScriptedHuman};

fn replies(log: Vec<LogEntry>) -> Vec<tellask::CallReply> {
    log.into_iter()
        .filter_map(|e| match e {
            LogEntry::Reply(reply) => Some(reply),
            _ => None,
        })
        .collect()
}

fn last_input(request: &tellask::GenerationRequest) -> TurnInput {
    request
        .history
        .iter()
        .rev()
        .find_map(|e| match e {
            LogEntry::Input(input) => Some(input.clone()),
            _ => None,
        })
        .unwrap()
}

async fn wait_for<F>(stream: &mut EventStream, mut pred: F) -> DialogEvent
where
    F: FnMut(&DialogEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = stream.recv().await.unwrap();
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn test_collective_call_fans_out_to_sessions() {
    let generator = Arc::new(
        ScriptedGenerator::new()
            .script(
                "alice",
                ["!?@bob @carol @dave !tellaskSession review\n!?Check the patch.\n", "all reviewed"],
            )
            .script("bob", ["bob ok"])
            .script("carol", ["carol ok"])
            .script("dave", ["dave ok"]),
    );
    let (orch, _events) = orchestrator(generator.clone(), Arc::new(ScriptedHuman::new("")), ToolRegistry::new());
    let main = orch.start_mainline("alice").unwrap();

    let reply = orch.run(main.id(), TurnInput::user("review it")).await.unwrap();
    assert_eq!(reply, "all reviewed");

    let payloads: Vec<String> = ["bob", "carol", "dave"]
        .iter()
        .map(|agent| last_input(&generator.requests_for(agent)[0]).text)
        .collect();
    assert_eq!(payloads[0], "@bob @carol @dave !tellaskSession review\nCheck the patch.");
    assert!(payloads.iter().all(|p| *p == payloads[0]));

    let children = orch.tree().children(&main.id());
    assert_eq!(children.len(), 3);
    for child in &children {
        let child = orch.tree().get(child).unwrap();
        assert_eq!(child.status(), DialogStatus::Active);
        assert_eq!(child.session_slug.as_deref(), Some("review"));
    }
    assert_eq!(orch.sessions().sessions_in(main.id()).len(), 3);

    let targets: Vec<Option<String>> = replies(orch.log().read(main.id()))
        .into_iter()
        .map(|r| r.target)
        .collect();
    assert_eq!(
        targets,
        vec![Some("bob".into()), Some("carol".into()), Some("dave".into())]
    );
    assert_eq!(main.status(), DialogStatus::Active);
}

#[tokio::test]
async fn test_session_resumes_same_sideline() {
    let generator = Arc::new(
        ScriptedGenerator::new()
            .script(
                "alice",
                [
                    "!?@bob !tellaskSession plan\n!?step one\n",
                    "first done",
                    "!?@bob !tellaskSession plan\n!?step two\n",
                    "second done",
                ],
            )
            .script("bob", ["one ok", "two ok"]),
    );
    let (orch, _events) = orchestrator(generator.clone(), Arc::new(ScriptedHuman::new("")), ToolRegistry::new());
    let main = orch.start_mainline("alice").unwrap();

    assert_eq!(orch.run(main.id(), TurnInput::user("one")).await.unwrap(), "first done");
    assert_eq!(orch.run(main.id(), TurnInput::user("two")).await.unwrap(), "second done");

    let children = orch.tree().children(&main.id());
    assert_eq!(children.len(), 1);
    assert_eq!(orch.tree().parent(&children[0]).unwrap().id(), main.id());

    let bob_requests = generator.requests_for("bob");
    assert_eq!(bob_requests.len(), 2);
    assert_eq!(bob_requests[0].dialog.id, bob_requests[1].dialog.id);
    // input, response, input
    assert_eq!(bob_requests[1].history.len(), 3);
}

#[tokio::test]
async fn test_ephemeral_sideline_completes_after_reply() {
    let generator = Arc::new(
        ScriptedGenerator::new()
            .script("alice", ["!?@bob quick question\n", "thanks"])
            .script("bob", ["answer"]),
    );
    let (orch, _events) = orchestrator(generator, Arc::new(ScriptedHuman::new("")), ToolRegistry::new());
    let main = orch.start_mainline("alice").unwrap();

    orch.run(main.id(), TurnInput::user("go")).await.unwrap();

    let child = orch.tree().children(&main.id())[0];
    assert_eq!(orch.tree().get(&child).unwrap().status(), DialogStatus::Completed);
    assert!(orch.sessions().is_empty());
}

#[tokio::test]
async fn test_self_route_runs_toolless() {
    let generator = Arc::new(
        ScriptedGenerator::new().script("alice", ["!?@self weigh the options\n", "thought it over", "decided"]),
    );
    let (orch, _events) = orchestrator(generator.clone(), Arc::new(ScriptedHuman::new("")), ToolRegistry::new());
    let main = orch.start_mainline("alice").unwrap();

    assert_eq!(orch.run(main.id(), TurnInput::user("choose")).await.unwrap(), "decided");

    let requests = generator.requests_for("alice");
    assert_eq!(requests.len(), 3);
    assert!(requests[1].dialog.toolless);
    assert_eq!(requests[1].dialog.parent_id, Some(main.id()));

    let reply = &replies(orch.log().read(main.id()))[0];
    assert_eq!(reply.kind, CallKind::SelfRoute);
    assert_eq!(reply.outcome, Ok("thought it over".to_string()));
}

#[tokio::test]
async fn test_ask_back_answered_by_supdialog() {
    let generator = Arc::new(
        ScriptedGenerator::new()
            .script("alice", ["!?@bob fix the bug\n", "src/main.rs", "final"])
            .script("bob", ["!?@tellasker which file?\n", "fixed src/main.rs"]),
    );
    let (orch, _events) = orchestrator(generator.clone(), Arc::new(ScriptedHuman::new("")), ToolRegistry::new());
    let main = orch.start_mainline("alice").unwrap();

    assert_eq!(orch.run(main.id(), TurnInput::user("go")).await.unwrap(), "final");

    let alice_requests = generator.requests_for("alice");
    let question = last_input(&alice_requests[1]);
    assert_eq!(question.text, "@tellasker which file?");
    assert!(matches!(
        question.source,
        InputSource::Caller { kind: CallKind::AskBack, .. }
    ));

    let bob_reply = replies(generator.requests_for("bob")[1].history.clone()).remove(0);
    assert_eq!(bob_reply.kind, CallKind::AskBack);
    assert_eq!(bob_reply.outcome, Ok("src/main.rs".to_string()));

    let alice_reply = replies(orch.log().read(main.id())).remove(0);
    assert_eq!(alice_reply.outcome, Ok("fixed src/main.rs".to_string()));
    assert_eq!(main.status(), DialogStatus::Active);
}

#[tokio::test]
async fn test_ask_back_from_mainline_rejected() {
    let generator = Arc::new(ScriptedGenerator::new().script("alice", ["!?@tellasker what now?\n", "never mind"]));
    let (orch, mut events) = orchestrator(generator, Arc::new(ScriptedHuman::new("")), ToolRegistry::new());
    let main = orch.start_mainline("alice").unwrap();

    assert_eq!(orch.run(main.id(), TurnInput::user("go")).await.unwrap(), "never mind");

    let reply = replies(orch.log().read(main.id())).remove(0);
    assert!(matches!(reply.outcome, Err(CallError::InvalidCallUsage { .. })));
    assert!(events
        .drain()
        .iter()
        .any(|e| matches!(e, DialogEvent::CallRejected { .. })));
    assert!(orch.tree().children(&main.id()).is_empty());
}

#[tokio::test]
async fn test_ask_back_with_session_rejected() {
    let generator = Arc::new(
        ScriptedGenerator::new()
            .script("alice", ["!?@bob look\n", "done"])
            .script("bob", ["!?@tellasker !tellaskSession s which?\n", "gave up"]),
    );
    let (orch, _events) = orchestrator(generator.clone(), Arc::new(ScriptedHuman::new("")), ToolRegistry::new());
    let main = orch.start_mainline("alice").unwrap();

    assert_eq!(orch.run(main.id(), TurnInput::user("go")).await.unwrap(), "done");

    assert_eq!(generator.requests_for("alice").len(), 2);
    let bob_reply = replies(generator.requests_for("bob")[1].history.clone()).remove(0);
    assert!(matches!(bob_reply.outcome, Err(CallError::InvalidCallUsage { .. })));
}

#[tokio::test]
async fn test_resumed_session_cannot_ask_back_into_completed_supdialog() {
    let generator = Arc::new(
        ScriptedGenerator::new()
            .script("alice", ["!?@carol first\n", "a1", "!?@carol second\n", "a2"])
            .script(
                "carol",
                [
                    "!?@bob !tellaskSession s\n!?start\n",
                    "c1 done",
                    "!?@bob !tellaskSession s\n!?again\n",
                    "c2 done",
                ],
            )
            .script("bob", ["bob one", "!?@tellasker which?\n", "bob two"]),
    );
    let (orch, _events) = orchestrator(generator.clone(), Arc::new(ScriptedHuman::new("")), ToolRegistry::new());
    let main = orch.start_mainline("alice").unwrap();

    assert_eq!(orch.run(main.id(), TurnInput::user("one")).await.unwrap(), "a1");
    let first_carol = generator.requests_for("carol")[0].dialog.id;
    let first_carol_log = orch.log().read(first_carol).len();
    assert_eq!(orch.tree().get(&first_carol).unwrap().status(), DialogStatus::Completed);

    assert_eq!(orch.run(main.id(), TurnInput::user("two")).await.unwrap(), "a2");

    // second carol is a fresh sideline, bob's session outlived the first one
    let carol_requests = generator.requests_for("carol");
    assert_ne!(carol_requests[2].dialog.id, first_carol);
    let bob_requests = generator.requests_for("bob");
    assert_eq!(bob_requests.len(), 3);
    assert!(bob_requests.iter().all(|r| r.dialog.id == bob_requests[0].dialog.id));
    assert_eq!(orch.tree().parent(&bob_requests[0].dialog.id).unwrap().id(), first_carol);

    let ask_back = replies(bob_requests[2].history.clone()).pop().unwrap();
    assert_eq!(ask_back.kind, CallKind::AskBack);
    assert_eq!(ask_back.outcome, Err(CallError::usage("supdialog is completed")));

    assert_eq!(orch.log().read(first_carol).len(), first_carol_log);
    assert_eq!(orch.tree().get(&first_carol).unwrap().status(), DialogStatus::Completed);
    assert_eq!(generator.requests_for("carol").len(), 4);
}

#[tokio::test]
async fn test_ask_human() {
    let generator = Arc::new(
        ScriptedGenerator::new().script("alice", ["!?@human approve the plan?\n!?It touches prod.\n", "proceeding"]),
    );
    let human = Arc::new(ScriptedHuman::new("yes"));
    let (orch, _events) = orchestrator(generator, human.clone(), ToolRegistry::new());
    let main = orch.start_mainline("alice").unwrap();

    assert_eq!(orch.run(main.id(), TurnInput::user("go")).await.unwrap(), "proceeding");

    let questions = human.questions.lock();
    assert_eq!(questions.len(), 1);
    assert_eq!(questions[0].headline, "@human approve the plan?");
    assert_eq!(questions[0].body, vec!["It touches prod."]);
    assert_eq!(questions[0].dialog.id, main.id());

    let reply = replies(orch.log().read(main.id())).remove(0);
    assert_eq!(reply.kind, CallKind::AskHuman);
    assert_eq!(reply.outcome, Ok("yes".to_string()));
}

#[tokio::test]
async fn test_unknown_target_fails_only_that_target() {
    let generator = Arc::new(
        ScriptedGenerator::new()
            .script("alice", ["!?@bob @zed hello\n", "done"])
            .script("bob", ["hey"]),
    );
    let (orch, _events) = orchestrator(generator, Arc::new(ScriptedHuman::new("")), ToolRegistry::new());
    let main = orch.start_mainline("alice").unwrap();

    orch.run(main.id(), TurnInput::user("go")).await.unwrap();

    let replies = replies(orch.log().read(main.id()));
    assert_eq!(replies[0].outcome, Ok("hey".to_string()));
    assert_eq!(
        replies[1].outcome,
        Err(CallError::UnknownTarget { agent: "zed".into() })
    );
}

#[tokio::test]
async fn test_malformed_block_not_dispatched() {
    let generator = Arc::new(
        ScriptedGenerator::new().script("alice", ["!?hello there\n!?@bob body\n\nprose", "corrected"]),
    );
    let (orch, _events) = orchestrator(generator, Arc::new(ScriptedHuman::new("")), ToolRegistry::new());
    let main = orch.start_mainline("alice").unwrap();

    assert_eq!(orch.run(main.id(), TurnInput::user("go")).await.unwrap(), "corrected");

    assert!(orch.tree().children(&main.id()).is_empty());
    let reply = replies(orch.log().read(main.id())).remove(0);
    assert!(matches!(reply.outcome, Err(CallError::MalformedCall { .. })));
}

#[tokio::test]
async fn test_failed_delivery_becomes_reply() {
    // bob has no script, so its generation fails
    let generator = Arc::new(ScriptedGenerator::new().script("alice", ["!?@bob hi\n", "bob is down"]));
    let (orch, _events) = orchestrator(generator, Arc::new(ScriptedHuman::new("")), ToolRegistry::new());
    let main = orch.start_mainline("alice").unwrap();

    assert_eq!(orch.run(main.id(), TurnInput::user("go")).await.unwrap(), "bob is down");

    let reply = replies(orch.log().read(main.id())).remove(0);
    assert!(matches!(reply.outcome, Err(CallError::DeliveryFailed { .. })));
    assert!(main.pending_calls().is_empty());
}

#[tokio::test]
async fn test_turn_limit() {
    let generator = Arc::new(
        ScriptedGenerator::new()
            .script("alice", ["!?@bob a\n", "!?@bob b\n"])
            .script("bob", ["x", "y"]),
    );
    let config = OrchestratorConfig {
        max_turns_per_reply: 2,
        ..Default::default()
    };
    let orch = OrchestratorBuilder::new(team(), generator, Arc::new(ScriptedHuman::new("")))
        .config(config)
        .build()
        .unwrap();
    let main = orch.start_mainline("alice").unwrap();

    assert!(matches!(
        orch.run(main.id(), TurnInput::user("go")).await,
        Err(OrchestratorError::TurnLimit { limit: 2, .. })
    ));
}

/// Release the gated replies in the given order and report the issuer's state
async fn join_in_order(first: &str, second: &str) -> (DialogStatus, usize, Vec<Option<String>>) {
    let generator = Arc::new(
        ScriptedGenerator::new()
            .script("alice", ["!?@bob @carol go\n", "joined"])
            .script("bob", ["from bob"])
            .script("carol", ["from carol"]),
    );
    let first_gate = generator.gate(first);
    let second_gate = generator.gate(second);

    let (orch, mut events) = orchestrator(generator, Arc::new(ScriptedHuman::new("")), ToolRegistry::new());
    let orch = Arc::new(orch);
    let main = orch.start_mainline("alice").unwrap();

    let runner = {
        let orch = Arc::clone(&orch);
        let id = main.id();
        tokio::spawn(async move { orch.run(id, TurnInput::user("go")).await })
    };

    first_gate.send(()).unwrap();
    wait_for(&mut events, |e| {
        matches!(e, DialogEvent::ReplyDelivered { target, .. } if target == first)
    })
    .await;
    assert_eq!(main.status(), DialogStatus::AwaitingReplies);
    assert_eq!(main.pending_calls().len(), 1);
    assert_eq!(main.pending_calls()[0].target, second);

    second_gate.send(()).unwrap();
    assert_eq!(runner.await.unwrap().unwrap(), "joined");

    let targets = replies(orch.log().read(main.id()))
        .into_iter()
        .map(|r| r.target)
        .collect();
    (main.status(), main.pending_calls().len(), targets)
}

#[tokio::test]
async fn test_join_before_continue_in_both_orders() {
    let a = join_in_order("bob", "carol").await;
    let b = join_in_order("carol", "bob").await;

    assert_eq!(a, b);
    assert_eq!(a.0, DialogStatus::Active);
    assert_eq!(a.1, 0);
    assert_eq!(a.2, vec![Some("bob".into()), Some("carol".into())]);
}

struct WriteFile;

#[async_trait]
impl Tool for WriteFile {
    fn name(&self) -> &str {
        "write_file"
    }

    fn footprint(&self, args: &serde_json::Value) -> Vec<PathAccess> {
        args["path"].as_str().map(PathAccess::write).into_iter().collect()
    }

    async fn invoke(&self, ctx: &ToolContext, args: serde_json::Value) -> anyhow::Result<String> {
        Ok(format!("{} wrote {}", ctx.member_id, args["path"].as_str().unwrap_or_default()))
    }
}

#[tokio::test]
async fn test_tool_access_from_roster_scopes() {
    let generator = Arc::new(ScriptedGenerator::new());
    let mut tools = ToolRegistry::new();
    tools.register(Arc::new(WriteFile));
    let (orch, _events) = orchestrator(generator, Arc::new(ScriptedHuman::new("")), tools);

    let alice = orch.start_mainline("alice").unwrap();
    let bob = orch.start_mainline("bob").unwrap();

    assert_eq!(
        orch.invoke_tool(alice.id(), "write_file", serde_json::json!({ "path": "./src/lib.rs" }))
            .await,
        Ok("alice wrote ./src/lib.rs".to_string())
    );

    let denied = orch
        .invoke_tool(alice.id(), "write_file", serde_json::json!({ "path": "src/vendor/dep.rs" }))
        .await;
    assert!(matches!(
        denied,
        Err(ToolError::Denied(ref d)) if matches!(d.scope, DeniedScope::DenyList { .. })
    ));

    let escaped = orch
        .invoke_tool(alice.id(), "write_file", serde_json::json!({ "path": "src/../../etc/passwd" }))
        .await;
    assert!(matches!(
        escaped,
        Err(ToolError::Denied(ref d)) if d.scope == DeniedScope::OutsideWorkspace
    ));

    assert!(matches!(
        orch.invoke_tool(bob.id(), "write_file", serde_json::json!({ "path": "src/lib.rs" }))
            .await,
        Err(ToolError::NotPermitted { .. })
    ));
}
