//! End-to-end engine scenarios: linear runs, skip groups, async fan-out,
//! catch/defer recovery, goto and exit control flow.

mod common;

use common::{doc, runtime};
use conductor::engine::{RunRequest, SERVICE_ID};
use conductor::event::Event;
use serde_json::json;

fn run_request(yaml: &str) -> RunRequest {
    RunRequest {
        workflow: Some(doc(yaml)),
        ..RunRequest::default()
    }
}

#[tokio::test]
async fn test_linear_success() {
    let rt = runtime();
    let response = rt
        .engine
        .run(
            &rt.context,
            run_request(
                r#"
pipeline:
  - step1: {action: "logger:print", message: hi}
  - step2: {action: "logger:print", message: bye}
"#,
            ),
        )
        .await
        .unwrap();

    assert_eq!(
        response.data.get("step1"),
        Some(&json!({"printed": true})),
        "first action response should publish under its name"
    );
    assert_eq!(response.data.get("step2"), Some(&json!({"printed": true})));

    // Actions dispatched in declaration order.
    let events = rt.listener.events();
    let tasks: Vec<&str> = events
        .iter()
        .filter_map(|event| match event {
            Event::TaskStart { task, .. } => Some(task.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(tasks, vec!["step1", "step2"]);

    let activity_pairs = events
        .iter()
        .filter(|event| matches!(event, Event::ActivityEnd { status, .. } if status == "ok"))
        .count();
    assert_eq!(activity_pairs, 2);
}

#[tokio::test]
async fn test_event_pairing_and_process_balance() {
    let rt = runtime();
    assert_eq!(rt.context.process_depth(), 0);
    rt.engine
        .run(
            &rt.context,
            run_request(
                r#"
pipeline:
  - one: {action: "logger:print"}
"#,
            ),
        )
        .await
        .unwrap();
    assert_eq!(rt.context.process_depth(), 0, "push/pop must balance");

    let events = rt.listener.events();
    for event in &events {
        if let Some(handle) = event.handle() {
            let matching = events
                .iter()
                .filter(|candidate| candidate.start_handle() == Some(handle))
                .count();
            assert_eq!(matching, 1, "start {handle} must pair exactly once");
        }
    }
}

#[tokio::test]
async fn test_skip_tag_group() {
    let rt = runtime();
    let response = rt
        .engine
        .run(
            &rt.context,
            run_request(
                r#"
init:
  env: {skip: true}
pipeline:
  - group:
      multiaction: true
      first: {action: "logger:print", ":tag": g, skip: "${env.skip} = true"}
      second: {action: "logger:print", ":tag": g}
"#,
            ),
        )
        .await
        .unwrap();

    assert!(rt.logger.calls().is_empty(), "skipped group must not dispatch");
    assert!(response.data.is_empty());
    let activity_starts = rt
        .listener
        .events()
        .iter()
        .filter(|event| matches!(event, Event::ActivityStart { service, .. } if service == "logger"))
        .count();
    assert_eq!(activity_starts, 0);
}

#[tokio::test]
async fn test_async_actions_join_before_task_end() {
    let rt = runtime();
    rt.engine
        .run(
            &rt.context,
            run_request(
                r#"
pipeline:
  - fanout:
      multiaction: true
      a1: {action: "logger:print", async: true}
      a2: {action: "logger:print", async: true}
      a3: {action: "logger:print", async: true}
"#,
            ),
        )
        .await
        .unwrap();

    assert_eq!(rt.logger.calls().len(), 3);
    let events = rt.listener.events();

    let async_start = events
        .iter()
        .position(|event| matches!(event, Event::TaskAsyncStart { count: 3, .. }))
        .expect("async start event");
    let async_done = events
        .iter()
        .position(|event| matches!(event, Event::TaskAsyncDone { count: 3, .. }))
        .expect("async done event");
    let task_end = events
        .iter()
        .position(|event| matches!(event, Event::TaskEnd { task, .. } if task == "fanout"))
        .expect("task end event");

    let action_ends: Vec<usize> = events
        .iter()
        .enumerate()
        .filter_map(|(index, event)| match event {
            Event::ActivityEnd { service, .. } if service == "logger" => Some(index),
            _ => None,
        })
        .collect();
    assert_eq!(action_ends.len(), 3);
    for index in action_ends {
        assert!(index > async_start && index < async_done);
    }
    assert!(async_done < task_end, "join must complete before task end");
}

#[tokio::test]
async fn test_catch_resets_error() {
    let rt = runtime();
    let response = rt
        .engine
        .run(
            &rt.context,
            run_request(
                r#"
pipeline:
  - work:
      a: {action: "broken:run"}
      catch: {action: "logger:print", message: recovered}
"#,
            ),
        )
        .await;
    assert!(response.is_ok(), "caught error must not fail the workflow");

    let events = rt.listener.events();
    let error_at = events
        .iter()
        .position(|event| matches!(event, Event::Error { message, .. } if message.contains("always fails")))
        .expect("error event for the failing action");
    let reset_at = events
        .iter()
        .position(|event| matches!(event, Event::ResetError { .. }))
        .expect("reset event");
    let work_end_at = events
        .iter()
        .position(
            |event| matches!(event, Event::TaskEnd { task, status, .. } if task == "work" && status == "ok"),
        )
        .expect("work task ends ok");
    assert!(error_at < reset_at && reset_at < work_end_at);
}

#[tokio::test]
async fn test_failing_catch_propagates_combined_error() {
    let rt = runtime();
    let error = rt
        .engine
        .run(
            &rt.context,
            run_request(
                r#"
pipeline:
  - work:
      a: {action: "broken:run"}
      catch: {action: "broken:run", fail: true}
"#,
            ),
        )
        .await
        .unwrap_err();
    assert!(error.to_string().contains("failed to catch"));
    assert!(
        !rt.listener
            .events()
            .iter()
            .any(|event| matches!(event, Event::ResetError { .. })),
        "a fail:true catch task must not reset the error"
    );
    assert_eq!(rt.context.process_depth(), 0);
}

#[tokio::test]
async fn test_goto_schedules_task_after_loop() {
    let rt = runtime();
    rt.engine
        .run(
            &rt.context,
            run_request(
                r#"
pipeline:
  - t1:
      multiaction: true
      go: {action: "workflow:goto", task: t2}
      after: {action: "logger:print", message: tail}
  - t2: {action: "logger:print", message: two}
"#,
            ),
        )
        .await
        .unwrap();

    // t1's remaining action still runs, then the scheduled t2 runs once.
    assert_eq!(rt.logger.calls().len(), 2);
    let tasks: Vec<String> = rt
        .listener
        .events()
        .iter()
        .filter_map(|event| match event {
            Event::TaskStart { task, .. } => Some(task.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(tasks, vec!["t1".to_string(), "t2".to_string()]);
}

#[tokio::test]
async fn test_exit_stops_pipeline_but_runs_deferred() {
    let rt = runtime();
    let response = rt
        .engine
        .run(
            &rt.context,
            run_request(
                r#"
pipeline:
  - flow:
      multiaction: true
      a1: {action: "logger:print", message: one}
      a2: {action: "workflow:exit"}
      a3: {action: "logger:print", message: three}
  - skipped: {action: "logger:print", message: never}
  - defer: {action: "logger:print", message: cleanup}
"#,
            ),
        )
        .await;
    assert!(response.is_ok(), "exit terminates successfully");

    // a1 and the deferred cleanup dispatch; a3 and the next task do not.
    let calls = rt.logger.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].1.get("message"), Some(&json!("one")));
    assert_eq!(calls[1].1.get("message"), Some(&json!("cleanup")));
}

#[tokio::test]
async fn test_deferred_error_surfaces_only_on_success() {
    let rt = runtime();
    let error = rt
        .engine
        .run(
            &rt.context,
            run_request(
                r#"
pipeline:
  - main: {action: "logger:print"}
  - defer: {action: "broken:run"}
"#,
            ),
        )
        .await
        .unwrap_err();
    assert!(error.to_string().contains("always fails"));

    // With a failing main body, the main error wins over the deferred one.
    let rt = runtime();
    let error = rt
        .engine
        .run(
            &rt.context,
            run_request(
                r#"
pipeline:
  - main: {action: "broken:run"}
  - defer: {action: "broken:run"}
"#,
            ),
        )
        .await
        .unwrap_err();
    assert!(error.to_string().contains("main"));
}

#[tokio::test]
async fn test_task_selector_filters_and_validates() {
    let rt = runtime();
    let mut request = run_request(
        r#"
pipeline:
  - t1: {action: "logger:print", message: one}
  - t2: {action: "logger:print", message: two}
"#,
    );
    request.tasks = "t2".to_string();
    rt.engine.run(&rt.context, request).await.unwrap();
    let calls = rt.logger.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1.get("message"), Some(&json!("two")));

    let rt = runtime();
    let mut request = run_request(
        r#"
pipeline:
  - t1: {action: "logger:print"}
"#,
    );
    request.tasks = "missing".to_string();
    let error = rt.engine.run(&rt.context, request).await.unwrap_err();
    assert!(error.to_string().contains("failed to lookup task"));
    assert_eq!(rt.context.process_depth(), 0);
}

#[tokio::test]
async fn test_sub_workflow_state_isolation() {
    let rt = runtime();
    let sub = rt
        .engine
        .load(
            &doc(
                r#"
init:
  - "secret := hidden"
pipeline:
  - inner: {action: "logger:print"}
"#,
            ),
            "sub",
            conductor::state::State::new(),
        )
        .await
        .unwrap();
    rt.engine.register(sub).unwrap();

    let response = rt
        .engine
        .run(
            &rt.context,
            run_request(
                r#"
pipeline:
  - callsub: {workflow: "sub.yaml"}
"#,
            ),
        )
        .await
        .unwrap();

    // The sub-workflow's results surface only through the response data
    // merge; its own state stays isolated.
    let callsub = response.data.get("callsub").expect("sub response data");
    assert_eq!(callsub.pointer("/inner/printed"), Some(&json!(true)));
    assert!(!response.data.contains_key("secret"));
    assert!(!rt.context.state().has("secret"));
}

#[tokio::test]
async fn test_register_round_trip() {
    let rt = runtime();
    let workflow = rt
        .engine
        .load(
            &doc(
                r#"
pipeline:
  - build: {action: "logger:print"}
"#,
            ),
            "build-app",
            conductor::state::State::new(),
        )
        .await
        .unwrap();
    let expected = serde_json::to_value(&workflow).unwrap();
    rt.engine.register(workflow).unwrap();
    let loaded = rt.engine.workflow("build-app").unwrap();
    assert_eq!(serde_json::to_value(&loaded).unwrap(), expected);
}

#[tokio::test]
async fn test_async_run_returns_immediately() {
    let rt = runtime();
    let mut request = run_request(
        r#"
pipeline:
  - slow: {action: "logger:print"}
"#,
    );
    request.async_ = true;
    let response = rt.engine.run(&rt.context, request).await.unwrap();
    assert!(response.data.is_empty());

    rt.context.join_background().await;
    let events = rt.listener.events();
    assert!(events
        .iter()
        .any(|event| matches!(event, Event::SessionEnd { .. })));
    assert!(events
        .iter()
        .any(|event| matches!(event, Event::WorkflowEnd { status, .. } if status == "ok")));
    assert_eq!(rt.logger.calls().len(), 1);
}

#[tokio::test]
async fn test_when_guard_skips_body() {
    let rt = runtime();
    rt.engine
        .run(
            &rt.context,
            run_request(
                r#"
init:
  mode: fast
pipeline:
  - guarded:
      when: "${mode} = slow"
      inner: {action: "logger:print"}
  - open: {action: "logger:print", message: ran}
"#,
            ),
        )
        .await
        .unwrap();
    let calls = rt.logger.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1.get("message"), Some(&json!("ran")));
}

#[tokio::test]
async fn test_switch_dispatches_matching_task() {
    let rt = runtime();
    rt.engine
        .run(
            &rt.context,
            run_request(
                r#"
init:
  instanceState: running
pipeline:
  - decide:
      action: "workflow:switch"
      sourceKey: instanceState
      cases:
        - {value: stopped, task: start}
        - {value: running, task: stop}
  - branches:
      when: "${selected} = true"
      start: {action: "logger:print", message: starting}
      stop: {action: "logger:print", message: stopping}
"#,
            ),
        )
        .await
        .unwrap();
    // Only the switch-selected task dispatches; the guarded copies in the
    // normal loop stay idle.
    let calls = rt.logger.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1.get("message"), Some(&json!("stopping")));
}

#[tokio::test]
async fn test_workflow_data_exposed_in_state() {
    let rt = runtime();
    let response = rt
        .engine
        .run(
            &rt.context,
            run_request(
                r#"
data:
  region: us-west
pipeline:
  - report: {action: "workflow:print", message: "deploying to ${data.region}"}
  - confirm: {action: "logger:print", message: "${data.region}"}
"#,
            ),
        )
        .await
        .unwrap();
    let calls = rt.logger.calls();
    assert_eq!(calls[0].1.get("message"), Some(&json!("us-west")));
    assert!(rt
        .listener
        .events()
        .iter()
        .any(|event| matches!(event, Event::Stdout { message, .. } if message == "deploying to us-west")));
    assert_eq!(response.data.get("confirm"), Some(&json!({"printed": true})));
}

#[tokio::test]
async fn test_fail_action_fails_workflow() {
    let rt = runtime();
    let error = rt
        .engine
        .run(
            &rt.context,
            run_request(
                r#"
pipeline:
  - halt: {action: "workflow:fail", message: "deliberate stop"}
"#,
            ),
        )
        .await
        .unwrap_err();
    assert!(error.to_string().contains("deliberate stop"));
    let has_error_event = rt
        .listener
        .events()
        .iter()
        .any(|event| matches!(event, Event::Error { message, .. } if message.contains("deliberate stop")));
    assert!(has_error_event);
}

#[tokio::test]
async fn test_engine_reachable_as_service() {
    // The engine is dispatched through the same registry as any service.
    let rt = runtime();
    let services = rt.context.services();
    assert!(services.has(SERVICE_ID));
    let response = services
        .run(&rt.context, SERVICE_ID, "nop", json!({}))
        .await
        .unwrap();
    assert_eq!(response.status, "ok");
}
