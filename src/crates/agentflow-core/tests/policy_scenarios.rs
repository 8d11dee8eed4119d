//! Policy behavior observed through whole runs: retry, rate limits, cost,
//! permissions, masking, deadlines, cancellation.

mod util;

use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use agentflow_core::{RunOptions, RunStatus};
use util::*;

#[tokio::test(start_paused = true)]
async fn retry_with_backoff_and_provider_rate_limit() {
    let doc = r#"
meta: {version: 2, name: flaky-llm}
providers:
  - id: p
    type: mock
components:
  - id: wobbly
    type: flaky
    provider: p
    config: {fail_times: 2, model: m-small}
  - id: steady
    type: flaky
    provider: p
    config: {fail_times: 0, model: m-small}
graph:
  entry: s
  nodes:
    - id: s
      kind: parallel
      next: [a, b]
    - id: a
      kind: llm
      component: wobbly
      outputs: {text: $.text}
    - id: b
      kind: llm
      component: steady
      outputs: {text: $.text}
policies:
  retry:
    overrides:
      a: {strategy: exponential, max_attempts: 3, interval: 0.01}
  rate_limit:
    providers:
      p: {capacity: 1, refill_per_sec: 100}
"#;
    let (engine, sink) = engine_with_sink(doc);
    let result = engine.run(json!({})).await;

    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(result.node_outputs["a"]["text"], "ok");
    assert_eq!(result.node_outputs["b"]["text"], "ok");

    let retries = sink.named("retry.attempt");
    assert_eq!(retries.len(), 2);
    assert_eq!(retries[0].data["attempt"], 1);
    assert_eq!(retries[1].data["attempt"], 2);
    let delay = |e: &agentflow_core::Event| e.data["delay"].as_f64().unwrap();
    assert!((delay(&retries[0]) - 0.01).abs() < 1e-9);
    assert!((delay(&retries[1]) - 0.02).abs() < 1e-9);

    // Two nodes burst into a capacity-1 bucket: someone waited.
    let waits = sink.named("rate.limit.wait");
    assert!(!waits.is_empty());
    assert_eq!(waits[0].data["scope"], "provider");
    assert_eq!(waits[0].data["target"], "p");

    // The flaky node called the model three times.
    let llm_calls: Vec<_> = sink
        .named("llm.call")
        .into_iter()
        .filter(|e| e.data["node_id"] == "a")
        .collect();
    assert_eq!(llm_calls.len(), 1, "llm.call only fires for the successful call");
    assert_eq!(llm_calls[0].data["provider_id"], "p");
    assert_eq!(llm_calls[0].data["model"], "m-small");

    assert_eq!(sink.named("graph.finish")[0].data["status"], "success");
    assert_start_finish_balance(&sink.snapshot());
}

#[tokio::test]
async fn cost_limit_aborts_before_the_next_node() {
    let doc = r#"
meta: {version: 2, name: pricey}
providers:
  - id: p
    type: mock
components:
  - id: chatty
    type: flaky
    provider: p
    config: {fail_times: 0}
graph:
  entry: a
  nodes:
    - id: a
      kind: llm
      component: chatty
      next: b
    - id: b
      kind: llm
      component: chatty
      next: c
    - id: c
      kind: llm
      component: chatty
policies:
  cost: {per_run_tokens: 10}
"#;
    // Each call costs 8 tokens (3 in + 5 out): a passes (0 used), b passes
    // (8 used), c is gated at 16 > 10.
    let (engine, sink) = engine_with_sink(doc);
    let result = engine.run(json!({})).await;

    assert_eq!(result.status, RunStatus::Error);
    assert!(result.tokens_used >= 10);
    assert_eq!(result.error.unwrap().kind, "COST_LIMIT_EXCEEDED");

    let llm_calls = sink.named("llm.call");
    let spent: u64 = llm_calls
        .iter()
        .map(|e| {
            e.data["tokens_in"].as_u64().unwrap() + e.data["tokens_out"].as_u64().unwrap()
        })
        .sum();
    assert!(spent >= 10, "emitted llm.call usage must cover the limit");

    // Node c was gated: it started, finished with an error, and never
    // reached the model.
    assert!(sink
        .named("llm.call")
        .iter()
        .all(|e| e.data["node_id"] != "c"));
    assert_start_finish_balance(&sink.snapshot());
}

fn permissions_doc(grant: Option<&str>) -> String {
    let policy = match grant {
        Some(grant) => format!("policies:\n  permissions:\n    default_allow: [{grant}]\n"),
        None => String::new(),
    };
    format!(
        r#"
meta: {{version: 2, name: guarded}}
tools:
  - id: disk
    type: noop_tool
    permissions: [fs.write]
components:
  - id: writer
    type: echo
    tool: disk
graph:
  entry: t
  nodes:
    - id: t
      kind: tool
      component: writer
      inputs: {{path: const:/tmp/out}}
{policy}"#
    )
}

#[tokio::test]
async fn missing_permission_denies_and_never_retries() {
    let (engine, sink) = engine_with_sink(&permissions_doc(None));
    let result = engine.run(json!({})).await;

    assert_eq!(result.status, RunStatus::Error);
    assert_eq!(result.error.unwrap().kind, "TOOL_PERMISSION_DENIED");
    assert!(sink.named("retry.attempt").is_empty());
    assert!(sink.named("tool.call").is_empty());
}

#[tokio::test]
async fn granted_permission_executes_and_reports_the_tool_call() {
    let (engine, sink) = engine_with_sink(&permissions_doc(Some("fs.write")));
    let result = engine.run(json!({})).await;

    assert_eq!(result.status, RunStatus::Success);
    let calls = sink.named("tool.call");
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].data["tool_id"], "disk");
    assert_eq!(calls[0].data["component_id"], "writer");
    assert_eq!(calls[0].data["required_permissions"], json!(["fs.write"]));
    assert_eq!(calls[0].data["inputs"]["path"], "/tmp/out");
}

#[tokio::test]
async fn masking_hides_fields_and_rotated_diff_values() {
    let doc = r#"
meta: {version: 2, name: secretive}
components:
  - id: first
    type: static
    config: {value: {secret: sk-live, token: tok-1}}
  - id: second
    type: static
    config: {value: {secret: sk-live, token: tok-2}}
graph:
  entry: a
  nodes:
    - id: a
      kind: component
      component: first
      next: b
    - id: b
      kind: component
      component: second
policies:
  masking:
    fields: [outputs.secret]
    diff_fields: [outputs.token]
"#;
    let (engine, sink) = engine_with_sink(doc);
    let result = engine.run(json!({})).await;
    assert_eq!(result.status, RunStatus::Success);

    let finishes = sink.named("node.finish");
    assert_eq!(finishes[0].data["outputs"]["secret"], "***");
    assert_eq!(finishes[1].data["outputs"]["secret"], "***");
    // First token value passes; the rotated one is masked.
    assert_eq!(finishes[0].data["outputs"]["token"], "tok-1");
    assert_eq!(finishes[1].data["outputs"]["token"], "***");
}

#[tokio::test(start_paused = true)]
async fn deadline_fires_timeout_exactly_once() {
    let doc = r#"
meta: {version: 2, name: sleepy}
components:
  - id: nap
    type: sleeper
    config: {seconds: 10}
graph:
  entry: z
  nodes:
    - id: z
      kind: component
      component: nap
"#;
    let (engine, sink) = engine_with_sink(doc);
    let result = engine
        .run_with(json!({}), RunOptions::default().with_timeout(0.1))
        .await;

    assert_eq!(result.status, RunStatus::Timeout);

    let timeouts = sink.named("timeout");
    assert_eq!(timeouts.len(), 1);
    assert!((timeouts[0].data["timeout"].as_f64().unwrap() - 0.1).abs() < 1e-9);

    // The sleeping node never finished successfully.
    let finishes = sink.named("node.finish");
    assert_eq!(finishes.len(), 1);
    assert_eq!(finishes[0].data["status"], "cancelled");

    let events = sink.snapshot();
    assert_stream_invariants(&events);
    assert_eq!(events.last().unwrap().data["status"], "timeout");
}

#[tokio::test(start_paused = true)]
async fn external_cancellation_is_monotonic() {
    let doc = r#"
meta: {version: 2, name: cancellable}
components:
  - id: nap
    type: sleeper
    config: {seconds: 5}
graph:
  entry: a
  nodes:
    - id: a
      kind: component
      component: nap
      next: b
    - id: b
      kind: component
      component: nap
"#;
    let (engine, sink) = engine_with_sink(doc);
    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let result = engine
        .run_with(json!({}), RunOptions::default().with_cancel_token(token))
        .await;

    assert_eq!(result.status, RunStatus::Cancelled);
    assert_eq!(sink.named("cancelled").len(), 1);

    let events = sink.snapshot();
    assert_stream_invariants(&events);

    // Once the token fired, no node.start follows the cancelled event.
    let cancel_seq = sink.named("cancelled")[0].sequence;
    assert!(sink
        .named("node.start")
        .iter()
        .all(|e| e.sequence < cancel_seq));
    // Node b never started at all.
    assert!(sink
        .named("node.start")
        .iter()
        .all(|e| e.data["node_id"] != "b"));
}

#[tokio::test(start_paused = true)]
async fn zero_refill_bucket_permits_capacity_then_waits_until_deadline() {
    let doc = r#"
meta: {version: 2, name: starved}
providers:
  - id: p
    type: mock
components:
  - id: chatty
    type: flaky
    provider: p
    config: {fail_times: 0}
graph:
  entry: a
  nodes:
    - id: a
      kind: llm
      component: chatty
      next: b
    - id: b
      kind: llm
      component: chatty
      next: c
    - id: c
      kind: llm
      component: chatty
policies:
  rate_limit:
    providers:
      p: {capacity: 2, refill_per_sec: 0}
"#;
    let (engine, sink) = engine_with_sink(doc);
    let result = engine
        .run_with(json!({}), RunOptions::default().with_timeout(0.5))
        .await;

    // Two immediate calls pass; the third waits forever until the deadline.
    assert_eq!(result.status, RunStatus::Timeout);
    assert_eq!(sink.named("llm.call").len(), 2);
    assert_eq!(sink.named("timeout").len(), 1);

    let waits = sink.named("rate.limit.wait");
    assert!(!waits.is_empty());
    assert!(waits[0].data["wait_time"].as_f64().unwrap() > 1_000_000.0);
}

#[tokio::test(start_paused = true)]
async fn shared_alias_throttles_both_providers() {
    let doc = r#"
meta: {version: 2, name: shared-bucket}
providers:
  - id: p1
    type: mock
  - id: p2
    type: mock
components:
  - id: c1
    type: flaky
    provider: p1
    config: {fail_times: 0}
  - id: c2
    type: flaky
    provider: p2
    config: {fail_times: 0}
graph:
  entry: s
  nodes:
    - id: s
      kind: parallel
      next: [a, b]
    - id: a
      kind: llm
      component: c1
    - id: b
      kind: llm
      component: c2
policies:
  rate_limit:
    shared:
      acct: {providers: [p1, p2], capacity: 1, refill_per_sec: 50}
"#;
    let (engine, sink) = engine_with_sink(doc);
    let result = engine.run(json!({})).await;

    assert_eq!(result.status, RunStatus::Success);

    // Different providers, one bucket: the second call in the burst waits,
    // and the wait is attributed to the alias.
    let waits = sink.named("rate.limit.wait");
    assert!(!waits.is_empty());
    assert_eq!(waits[0].data["scope"], "provider");
    assert_eq!(waits[0].data["target"], "acct");
    assert_eq!(sink.named("llm.call").len(), 2);
}

#[tokio::test]
async fn components_share_history_through_registries() {
    use agentflow_core::registry::ComponentDeps;
    use agentflow_core::{ComponentFn, EngineError, ErrorKind};
    use serde_json::Value;

    let doc = r#"
meta: {version: 2, name: remembered}
histories:
  - id: chat
    backend: memory
components:
  - id: note
    type: remember
  - id: summary
    type: recall
graph:
  entry: a
  nodes:
    - id: a
      kind: component
      component: note
      inputs: {text: graph.inputs.text}
      next: b
    - id: b
      kind: component
      component: summary
      outputs: {count: $.count, last: $.last}
  outputs:
    - {key: count, node: b, output: count}
    - {key: last, node: b, output: last}
"#;

    let mut factories = scenario_factories();
    factories.register_component(
        "remember",
        |_spec: &agentflow_core::ir::ComponentIr, _deps: ComponentDeps| {
            Ok(ComponentFn::boxed_any(ComponentFn::new(
                |_state, inputs, ctx| async move {
                    let history = ctx.registries.history("chat").ok_or_else(|| {
                        EngineError::new(ErrorKind::HistoryBackendNotFound, "history 'chat' missing")
                    })?;
                    let text = inputs.get("text").and_then(Value::as_str).unwrap_or_default();
                    history.append_message(&ctx.session_id, "user", text).await?;
                    Ok(json!({"noted": true}))
                },
            )))
        },
    );
    factories.register_component(
        "recall",
        |_spec: &agentflow_core::ir::ComponentIr, _deps: ComponentDeps| {
            Ok(ComponentFn::boxed_any(ComponentFn::new(
                |_state, _inputs, ctx| async move {
                    let history = ctx.registries.history("chat").ok_or_else(|| {
                        EngineError::new(ErrorKind::HistoryBackendNotFound, "history 'chat' missing")
                    })?;
                    let messages = history.get_history(&ctx.session_id).await?;
                    Ok(json!({
                        "count": messages.len(),
                        "last": messages.last().map(|m| m.content.clone()),
                    }))
                },
            )))
        },
    );

    let (engine, _sink) = engine_with_factories(doc, factories);
    let result = engine
        .run_with(
            json!({"text": "hello there"}),
            RunOptions::default().with_session_id("s-1"),
        )
        .await;

    assert_eq!(result.status, RunStatus::Success);
    assert_eq!(result.outputs["count"], 1);
    assert_eq!(result.outputs["last"], "hello there");
}

#[tokio::test]
async fn llm_json_mode_parses_or_fails() {
    let doc = r#"
meta: {version: 2, name: json-mode}
providers:
  - id: p
    type: mock
components:
  - id: object_speaker
    type: static
    provider: p
    config: {value: {text: "{\"answer\": 42}", usage: {tokens_in: 1, tokens_out: 2}}}
  - id: rambler
    type: static
    provider: p
    config: {value: {text: "not json", usage: {tokens_in: 1, tokens_out: 2}}}
graph:
  entry: good
  nodes:
    - id: good
      kind: llm
      component: object_speaker
      config: {parse_json: true}
      outputs: {answer: $.json.answer}
      next: bad
    - id: bad
      kind: llm
      component: rambler
      config: {parse_json: true}
  outputs:
    - {key: answer, node: good, output: answer}
"#;
    let (engine, sink) = engine_with_sink(doc);
    let result = engine.run(json!({})).await;

    assert_eq!(result.outputs["answer"], 42);
    assert_eq!(result.status, RunStatus::Error);
    assert_eq!(result.error.unwrap().kind, "LLM_JSON_PARSE");
    // The failed parse never reaches the model accounting.
    assert_eq!(sink.named("llm.call").len(), 1);
}
