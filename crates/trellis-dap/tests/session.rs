mod support;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::net::TcpListener;

use support::{
    arguments, capabilities, connect, session, session_with, two_frames, wait_for, FakeAdapter,
    Recorder, RecordingAnnotator, RecordingOutput, STEP,
};
use trellis_dap::protocol::{OutputCategory, StopReason};
use trellis_dap::{
    Breakpoint, BreakpointManager, Collaborators, DapError, LaunchRequest, SessionEvent,
    SessionOptions, SessionState, ThreadStatus,
};

// ── Handshake ────────────────────────────────────────────────────

#[tokio::test]
async fn handshake_reaches_running() {
    let (session, mut adapter) = session();
    let recorder = Recorder::attach(&session);

    let connecting = {
        let session = session.clone();
        tokio::spawn(async move { session.connect(LaunchRequest::launch(json!({}))).await })
    };

    let initialize = adapter.expect("initialize").await;
    let args = arguments(&initialize);
    assert_eq!(args["clientID"], "trellis");
    assert_eq!(args["linesStartAt1"], true);
    assert_eq!(args["columnsStartAt1"], true);
    assert_eq!(args["pathFormat"], "path");
    assert_eq!(args["supportsVariableType"], true);
    adapter.respond(&initialize, Some(capabilities())).await;

    let launch = adapter.expect("launch").await;
    adapter.respond(&launch, None).await;
    adapter.event("initialized", None).await;
    let pushed = adapter.configure().await;
    assert!(pushed.is_empty());

    connecting.await.unwrap().unwrap();
    assert_eq!(session.state(), SessionState::Running);
    assert!(session.capabilities().supports_terminate_debuggee);
    session.wait_initialized().await.unwrap();

    let events = recorder.events();
    let states: Vec<SessionState> = events
        .iter()
        .filter_map(|event| match event {
            SessionEvent::StateChanged(state) => Some(*state),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            SessionState::Initializing,
            SessionState::Configuring,
            SessionState::Running
        ]
    );
    assert!(events.contains(&SessionEvent::Initialized));
}

#[tokio::test]
async fn handshake_learns_thread_names() {
    let (session, mut adapter) = session();
    adapter.threads = json!([{"id": 1, "name": "main"}, {"id": 2, "name": "worker"}]);
    connect(&session, &mut adapter).await;
    adapter.assert_quiet(Duration::from_millis(50)).await;

    let snapshot = wait_for(&session, |s| s.threads.len() == 2).await;
    assert_eq!(snapshot.thread(2).unwrap().name.as_deref(), Some("worker"));
}

#[tokio::test]
async fn handshake_delay_launch_waits_for_configuration_done() {
    let options = SessionOptions {
        delay_launch: true,
        ..SessionOptions::default()
    };
    let (session, mut adapter) = session_with(
        options,
        Arc::new(BreakpointManager::new()),
        Collaborators::default(),
    );
    let connecting = {
        let session = session.clone();
        tokio::spawn(async move { session.connect(LaunchRequest::attach(json!({"pid": 7}))).await })
    };

    let initialize = adapter.expect("initialize").await;
    adapter.respond(&initialize, Some(capabilities())).await;
    adapter.event("initialized", None).await;
    adapter.configure().await;

    let attach = adapter.expect("attach").await;
    assert_eq!(arguments(&attach)["pid"], 7);
    session.wait_initialized().await.unwrap();
    assert!(!connecting.is_finished());

    adapter.respond(&attach, None).await;
    connecting.await.unwrap().unwrap();
}

#[tokio::test]
async fn handshake_early_initialized_event_is_remembered() {
    let (session, mut adapter) = session();
    let connecting = {
        let session = session.clone();
        tokio::spawn(async move { session.connect(LaunchRequest::launch(json!({}))).await })
    };

    let initialize = adapter.expect("initialize").await;
    adapter.event("initialized", None).await;
    adapter.respond(&initialize, Some(capabilities())).await;

    let launch = adapter.expect("launch").await;
    adapter.respond(&launch, None).await;
    adapter.configure().await;
    connecting.await.unwrap().unwrap();
}

#[tokio::test]
async fn handshake_without_configuration_done_support() {
    let (session, mut adapter) = session();
    let connecting = {
        let session = session.clone();
        tokio::spawn(async move { session.connect(LaunchRequest::launch(json!({}))).await })
    };

    let initialize = adapter.expect("initialize").await;
    adapter.respond(&initialize, Some(json!({}))).await;
    let launch = adapter.expect("launch").await;
    adapter.respond(&launch, None).await;
    adapter.event("initialized", None).await;

    connecting.await.unwrap().unwrap();
    assert_eq!(session.state(), SessionState::Running);
    adapter.assert_quiet(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn handshake_failed_launch_terminates() {
    let (session, mut adapter) = session();
    let connecting = {
        let session = session.clone();
        tokio::spawn(async move { session.connect(LaunchRequest::launch(json!({}))).await })
    };

    let initialize = adapter.expect("initialize").await;
    adapter.respond(&initialize, Some(capabilities())).await;
    let launch = adapter.expect("launch").await;
    adapter.respond_error(&launch, "no such program").await;

    let result = connecting.await.unwrap();
    assert_eq!(
        result,
        Err(DapError::Rejected {
            command: "launch".into(),
            message: "no such program".into()
        })
    );
    session.wait_terminated().await;
    assert_eq!(session.state(), SessionState::Terminated);
    assert!(session.wait_initialized().await.is_err());
}

#[tokio::test]
async fn handshake_transport_failure_fails_initialized() {
    let (session, mut adapter) = session();
    let connecting = {
        let session = session.clone();
        tokio::spawn(async move { session.connect(LaunchRequest::launch(json!({}))).await })
    };
    adapter.expect("initialize").await;
    drop(adapter);

    let initialized = tokio::time::timeout(STEP, session.wait_initialized())
        .await
        .expect("initialized never resolved");
    assert_eq!(initialized, Err(DapError::ConnectionClosed));
    assert_eq!(connecting.await.unwrap(), Err(DapError::ConnectionClosed));
    assert_eq!(session.state(), SessionState::Terminated);
}

#[tokio::test]
async fn broken_frame_after_handshake_terminates() {
    let (session, mut adapter) = session();
    let recorder = Recorder::attach(&session);
    connect(&session, &mut adapter).await;

    adapter
        .write_raw(b"Content-Length: 18446744073709551615\r\n\r\n{}")
        .await;

    tokio::time::timeout(STEP, session.wait_terminated())
        .await
        .expect("session never terminated");
    assert_eq!(session.state(), SessionState::Terminated);
    assert!(recorder.events().contains(&SessionEvent::Terminated));
}

#[tokio::test]
async fn handshake_times_out() {
    let options = SessionOptions {
        initialize_timeout: Duration::from_millis(50),
        ..SessionOptions::default()
    };
    let breakpoints = Arc::new(BreakpointManager::new());
    let (session, mut adapter) =
        session_with(options, breakpoints.clone(), Collaborators::default());
    let connecting = {
        let session = session.clone();
        tokio::spawn(async move { session.connect(LaunchRequest::launch(json!({}))).await })
    };
    adapter.expect("initialize").await;

    let expected = DapError::Timeout {
        command: "initialize".into(),
    };
    assert_eq!(connecting.await.unwrap(), Err(expected.clone()));
    assert_eq!(session.wait_initialized().await, Err(expected));
    assert_eq!(breakpoints.listener_count(), 0);
}

#[tokio::test]
async fn handshake_connect_twice_is_rejected() {
    let (session, mut adapter) = session();
    connect(&session, &mut adapter).await;
    let err = session
        .connect(LaunchRequest::launch(json!({})))
        .await
        .unwrap_err();
    assert!(matches!(err, DapError::InvalidState { .. }), "got {err:?}");
}

// ── Breakpoints ──────────────────────────────────────────────────

#[cfg(unix)]
#[tokio::test]
async fn breakpoints_pushed_during_configuration() {
    let breakpoints = Arc::new(BreakpointManager::new());
    breakpoints.add(Breakpoint::new("file:///b.js", 3).with_condition("n > 1"));
    breakpoints.add(Breakpoint::new("file:///a.js", 10));
    breakpoints.add(Breakpoint::new("file:///c.js", 1).disabled());
    breakpoints.add(Breakpoint::new("https://example.com/x.js", 4));

    let (session, mut adapter) = session_with(
        SessionOptions::default(),
        breakpoints,
        Collaborators::default(),
    );
    let recorder = Recorder::attach(&session);
    let pushed = connect(&session, &mut adapter).await;

    let paths: Vec<Value> = pushed
        .iter()
        .map(|request| arguments(request)["source"]["path"].clone())
        .collect();
    assert_eq!(paths, vec![json!("/a.js"), json!("/b.js")]);
    assert_eq!(arguments(&pushed[1])["breakpoints"][0]["condition"], "n > 1");
    assert_eq!(arguments(&pushed[0])["source"]["name"], "a.js");

    recorder
        .wait_for(|event| {
            matches!(event, SessionEvent::BreakpointsVerified { path: Some(p), .. } if p == "/b.js")
        })
        .await;
}

#[cfg(unix)]
#[tokio::test]
async fn breakpoints_added_send_only_affected_source() {
    let breakpoints = Arc::new(BreakpointManager::new());
    breakpoints.add(Breakpoint::new("file:///b.js", 3));
    let (session, mut adapter) = session_with(
        SessionOptions::default(),
        breakpoints.clone(),
        Collaborators::default(),
    );
    connect(&session, &mut adapter).await;

    breakpoints.add(Breakpoint::new("file:///a.js", 10));
    let request = adapter.expect("setBreakpoints").await;
    let args = arguments(&request);
    assert_eq!(args["source"]["path"], "/a.js");
    assert_eq!(args["breakpoints"], json!([{"line": 10}]));
    adapter.verify(&request).await;

    adapter.assert_quiet(Duration::from_millis(100)).await;
}

#[cfg(unix)]
#[tokio::test]
async fn breakpoints_removal_clears_source() {
    let breakpoints = Arc::new(BreakpointManager::new());
    let id = breakpoints.add(Breakpoint::new("file:///a.js", 10));
    let (session, mut adapter) = session_with(
        SessionOptions::default(),
        breakpoints.clone(),
        Collaborators::default(),
    );
    connect(&session, &mut adapter).await;

    assert!(breakpoints.remove(id));
    let request = adapter.expect("setBreakpoints").await;
    let args = arguments(&request);
    assert_eq!(args["source"]["path"], "/a.js");
    assert_eq!(args["breakpoints"], json!([]));
    adapter.verify(&request).await;
}

#[cfg(unix)]
#[tokio::test]
async fn breakpoints_same_set_yields_identical_payload() {
    let breakpoints = Arc::new(BreakpointManager::new());
    let id = breakpoints.add(Breakpoint::new("file:///a.js", 10).with_log_message("hit {n}"));
    breakpoints.add(Breakpoint::new("file:///a.js", 12));
    let (session, mut adapter) = session_with(
        SessionOptions::default(),
        breakpoints.clone(),
        Collaborators::default(),
    );
    let pushed = connect(&session, &mut adapter).await;
    assert_eq!(pushed.len(), 1);

    breakpoints.set_enabled(id, false);
    let disabled = adapter.expect("setBreakpoints").await;
    assert_eq!(arguments(&disabled)["breakpoints"], json!([{"line": 12}]));
    adapter.verify(&disabled).await;

    breakpoints.set_enabled(id, true);
    let restored = adapter.expect("setBreakpoints").await;
    assert_eq!(restored.arguments, pushed[0].arguments);
    adapter.verify(&restored).await;
}

#[cfg(unix)]
#[tokio::test]
async fn breakpoints_changed_after_finish_are_not_sent() {
    let breakpoints = Arc::new(BreakpointManager::new());
    let (session, mut adapter) = session_with(
        SessionOptions::default(),
        breakpoints.clone(),
        Collaborators::default(),
    );
    connect(&session, &mut adapter).await;

    let finishing = {
        let session = session.clone();
        tokio::spawn(async move { session.finish().await })
    };
    let disconnect = adapter.expect("disconnect").await;
    adapter.respond(&disconnect, None).await;
    finishing.await.unwrap();

    breakpoints.add(Breakpoint::new("file:///a.js", 1));
    assert_eq!(breakpoints.listener_count(), 0);
}

// ── Stops and execution control ──────────────────────────────────

#[tokio::test]
async fn stop_materializes_stack() {
    let annotator = Arc::new(RecordingAnnotator::default());
    let collaborators = Collaborators {
        annotator: annotator.clone(),
        ..Collaborators::default()
    };
    let (session, mut adapter) = session_with(
        SessionOptions::default(),
        Arc::new(BreakpointManager::new()),
        collaborators,
    );
    let recorder = Recorder::attach(&session);
    connect(&session, &mut adapter).await;

    adapter.stop(3, two_frames()).await;
    let snapshot = wait_for(&session, |s| s.current_frame().is_some()).await;

    assert_eq!(snapshot.state, SessionState::Suspended);
    assert_eq!(snapshot.current_thread, Some(3));
    assert_eq!(snapshot.thread(3).unwrap().status, ThreadStatus::Suspended);
    assert_eq!(snapshot.thread(3).unwrap().frames.len(), 2);
    assert_eq!(session.current_frame().unwrap().id, 100);
    assert!(session.is_suspended());

    recorder
        .wait_for(|event| matches!(event, SessionEvent::StackMaterialized { thread_id: 3 }))
        .await;
    let events = recorder.events();
    let suspended = events
        .iter()
        .position(|e| {
            matches!(e, SessionEvent::Suspended { thread_id: 3, reason } if *reason == StopReason::Breakpoint)
        })
        .unwrap();
    let materialized = events
        .iter()
        .position(|e| matches!(e, SessionEvent::StackMaterialized { .. }))
        .unwrap();
    assert!(suspended < materialized);
    assert_eq!(*annotator.calls.lock().unwrap(), vec![Some(100)]);
}

#[tokio::test]
async fn stop_failed_stack_fetch_is_reported() {
    let (session, mut adapter) = session();
    let recorder = Recorder::attach(&session);
    connect(&session, &mut adapter).await;

    adapter
        .event("stopped", Some(json!({"reason": "breakpoint", "threadId": 3})))
        .await;
    let request = adapter.expect("stackTrace").await;
    adapter.respond_error(&request, "no stack").await;

    recorder
        .wait_for(|event| {
            matches!(
                event,
                SessionEvent::StackUnavailable { thread_id: 3, error: DapError::Rejected { message, .. } }
                    if message == "no stack"
            )
        })
        .await;
    assert!(session.is_suspended());
    assert!(session.current_frame().is_none());
    assert!(!recorder
        .events()
        .iter()
        .any(|e| matches!(e, SessionEvent::StackMaterialized { .. })));

    // The thread can still be resumed
    let resuming = {
        let session = session.clone();
        tokio::spawn(async move { session.resume().await })
    };
    let request = adapter.expect("continue").await;
    assert_eq!(arguments(&request)["threadId"], 3);
    adapter.respond(&request, None).await;
    assert_eq!(resuming.await.unwrap(), Ok(()));
}

#[tokio::test]
async fn stop_resume_clears_frames_before_acknowledgement() {
    let (session, mut adapter) = session();
    connect(&session, &mut adapter).await;
    adapter.stop(3, two_frames()).await;
    wait_for(&session, |s| s.current_frame().is_some()).await;

    session.resume().await.unwrap();

    // The adapter has not even read the request yet.
    let snapshot = session.snapshot();
    assert_eq!(snapshot.state, SessionState::Running);
    assert!(snapshot.thread(3).unwrap().frames.is_empty());
    assert!(!session.is_suspended());

    let request = adapter.expect("continue").await;
    assert_eq!(arguments(&request)["threadId"], 3);
    adapter.respond(&request, None).await;
}

#[tokio::test]
async fn stop_step_commands_send_matching_requests() {
    let (session, mut adapter) = session();
    connect(&session, &mut adapter).await;

    for (command, expected) in [("over", "next"), ("into", "stepIn"), ("out", "stepOut")] {
        adapter.stop(1, two_frames()).await;
        wait_for(&session, |s| s.current_frame().is_some()).await;
        match command {
            "over" => session.step_over().await.unwrap(),
            "into" => session.step_into().await.unwrap(),
            _ => session.step_out().await.unwrap(),
        }
        let request = adapter.expect(expected).await;
        assert_eq!(arguments(&request)["threadId"], 1);
        adapter.respond(&request, None).await;
    }
}

#[tokio::test]
async fn stop_step_rejected_by_adapter_is_swallowed() {
    let (session, mut adapter) = session();
    connect(&session, &mut adapter).await;
    adapter.stop(1, two_frames()).await;
    wait_for(&session, |s| s.current_frame().is_some()).await;

    session.step_over().await.unwrap();
    let request = adapter.expect("next").await;
    adapter.respond_error(&request, "cannot step").await;

    adapter.assert_quiet(Duration::from_millis(50)).await;
    assert_eq!(session.state(), SessionState::Running);
}

#[tokio::test]
async fn stop_resume_when_running_is_rejected() {
    let (session, mut adapter) = session();
    connect(&session, &mut adapter).await;
    assert_eq!(session.resume().await, Err(DapError::NotSuspended));
    assert_eq!(session.step_into().await, Err(DapError::NotSuspended));
}

#[tokio::test]
async fn stop_continued_event_resumes() {
    let annotator = Arc::new(RecordingAnnotator::default());
    let collaborators = Collaborators {
        annotator: annotator.clone(),
        ..Collaborators::default()
    };
    let (session, mut adapter) = session_with(
        SessionOptions::default(),
        Arc::new(BreakpointManager::new()),
        collaborators,
    );
    let recorder = Recorder::attach(&session);
    connect(&session, &mut adapter).await;
    adapter.stop(1, two_frames()).await;
    wait_for(&session, |s| s.current_frame().is_some()).await;

    adapter
        .event(
            "continued",
            Some(json!({"threadId": 9, "allThreadsContinued": true})),
        )
        .await;
    let snapshot = wait_for(&session, |s| s.state == SessionState::Running).await;
    assert!(!snapshot.is_suspended());
    assert!(snapshot.thread(1).unwrap().frames.is_empty());
    recorder
        .wait_for(|event| matches!(event, SessionEvent::Resumed { thread_id: Some(9) }))
        .await;
    assert_eq!(*annotator.calls.lock().unwrap(), vec![Some(100), None]);
}

#[tokio::test]
async fn stop_at_most_one_thread_suspended() {
    let (session, mut adapter) = session();
    connect(&session, &mut adapter).await;

    adapter.stop(1, two_frames()).await;
    wait_for(&session, |s| s.current_frame().is_some()).await;
    adapter.stop(2, two_frames()).await;
    let snapshot = wait_for(&session, |s| {
        s.current_thread == Some(2) && s.current_frame().is_some()
    })
    .await;

    let suspended: Vec<i64> = snapshot
        .threads
        .iter()
        .filter(|t| t.status == ThreadStatus::Suspended)
        .map(|t| t.id)
        .collect();
    assert_eq!(suspended, vec![2]);
    assert!(snapshot.thread(1).unwrap().frames.is_empty());
}

#[tokio::test]
async fn stop_stale_stack_is_discarded() {
    let (session, mut adapter) = session();
    connect(&session, &mut adapter).await;

    adapter
        .event("stopped", Some(json!({"reason": "step", "threadId": 1})))
        .await;
    let first = adapter.expect("stackTrace").await;

    adapter.event("continued", Some(json!({"threadId": 1}))).await;
    adapter
        .event("stopped", Some(json!({"reason": "pause", "threadId": 2})))
        .await;
    let second = adapter.expect("stackTrace").await;
    assert_eq!(arguments(&second)["threadId"], 2);

    adapter
        .respond(&first, Some(json!({"stackFrames": two_frames()})))
        .await;
    let frame = json!([{"id": 7, "name": "main", "line": 1, "column": 1}]);
    adapter
        .respond(&second, Some(json!({"stackFrames": frame})))
        .await;

    let snapshot = wait_for(&session, |s| s.current_frame().is_some()).await;
    assert_eq!(snapshot.current_thread, Some(2));
    assert_eq!(snapshot.current_frame().unwrap().id, 7);
    assert!(snapshot.thread(1).unwrap().frames.is_empty());
}

#[tokio::test]
async fn stop_without_thread_and_no_current_thread_is_ignored() {
    let (session, mut adapter) = session();
    connect(&session, &mut adapter).await;

    adapter
        .event("stopped", Some(json!({"reason": "exception"})))
        .await;
    adapter.assert_quiet(Duration::from_millis(100)).await;
    assert_eq!(session.state(), SessionState::Running);
    assert_eq!(session.current_thread(), None);
}

#[tokio::test]
async fn stop_without_thread_targets_current_thread() {
    let (session, mut adapter) = session();
    connect(&session, &mut adapter).await;
    adapter.stop(4, two_frames()).await;
    wait_for(&session, |s| s.current_frame().is_some()).await;

    adapter
        .event("stopped", Some(json!({"reason": "exception"})))
        .await;
    let request = adapter.expect("stackTrace").await;
    assert_eq!(arguments(&request)["threadId"], 4);
}

#[tokio::test]
async fn stop_select_frame_moves_annotation() {
    let annotator = Arc::new(RecordingAnnotator::default());
    let collaborators = Collaborators {
        annotator: annotator.clone(),
        ..Collaborators::default()
    };
    let (session, mut adapter) = session_with(
        SessionOptions::default(),
        Arc::new(BreakpointManager::new()),
        collaborators,
    );
    connect(&session, &mut adapter).await;
    adapter.stop(1, two_frames()).await;
    let snapshot = wait_for(&session, |s| s.current_frame().is_some()).await;

    let outer = snapshot.thread(1).unwrap().frames[1].clone();
    let selected = session.select_frame(&outer).await.unwrap();
    assert_eq!(selected.id, 101);
    assert_eq!(session.current_frame().unwrap().id, 101);
    assert_eq!(*annotator.calls.lock().unwrap(), vec![Some(100), Some(101)]);
}

#[tokio::test]
async fn stop_pause_targets_every_live_thread() {
    let (session, mut adapter) = session();
    adapter.threads = json!([{"id": 1, "name": "main"}, {"id": 2, "name": "worker"}]);
    connect(&session, &mut adapter).await;
    adapter.assert_quiet(Duration::from_millis(50)).await;
    wait_for(&session, |s| s.threads.len() == 2).await;

    adapter
        .event("thread", Some(json!({"reason": "exited", "threadId": 2})))
        .await;
    wait_for(&session, |s| {
        s.thread(2).is_some_and(|t| t.status == ThreadStatus::Exited)
    })
    .await;

    adapter
        .event("thread", Some(json!({"reason": "started", "threadId": 5})))
        .await;
    wait_for(&session, |s| s.thread(5).is_some()).await;

    session.pause().await.unwrap();
    let mut paused = BTreeSet::new();
    for _ in 0..2 {
        let request = adapter.expect("pause").await;
        paused.insert(arguments(&request)["threadId"].as_i64().unwrap());
        adapter.respond(&request, None).await;
    }
    assert_eq!(paused, BTreeSet::from([1, 5]));
}

// ── Variables and evaluation ─────────────────────────────────────

#[tokio::test]
async fn variables_children_fetched_once() {
    let (session, mut adapter) = session();
    connect(&session, &mut adapter).await;
    adapter.stop(1, two_frames()).await;
    let frame = wait_for(&session, |s| s.current_frame().is_some())
        .await
        .current_frame()
        .unwrap();

    let scopes = {
        let session = session.clone();
        let frame = frame.clone();
        tokio::spawn(async move { session.frame_variables(&frame).await })
    };
    let request = adapter.expect("scopes").await;
    assert_eq!(arguments(&request)["frameId"], 100);
    adapter
        .respond(
            &request,
            Some(json!({"scopes": [
                {"name": "Locals", "variablesReference": 7},
                {"name": "Globals", "variablesReference": 8, "expensive": true}
            ]})),
        )
        .await;
    let scopes = scopes.await.unwrap().unwrap();
    assert_eq!(scopes.len(), 2);
    let locals = scopes[0].clone();
    assert_eq!(locals.name(), "Locals");
    assert!(locals.has_children());

    let first = {
        let session = session.clone();
        let locals = locals.clone();
        tokio::spawn(async move { session.variable_children(&locals, 0, 2).await })
    };
    let request = adapter.expect("variables").await;
    assert_eq!(arguments(&request)["variablesReference"], 7);
    adapter
        .respond(
            &request,
            Some(json!({"variables": [
                {"name": "a", "value": "1", "variablesReference": 0},
                {"name": "b", "value": "2", "type": "int", "variablesReference": 0},
                {"name": "c", "value": "{...}", "variablesReference": 12}
            ]})),
        )
        .await;
    let first = first.await.unwrap().unwrap();
    assert_eq!(
        first.iter().map(|v| v.name()).collect::<Vec<_>>(),
        vec!["a", "b"]
    );

    let second = session.variable_children(&locals, 1, 10).await.unwrap();
    assert_eq!(
        second.iter().map(|v| v.name()).collect::<Vec<_>>(),
        vec!["b", "c"]
    );
    assert_eq!(second[0].type_name(), Some("int"));
    assert!(Arc::ptr_eq(&second[1].parent().unwrap(), &locals));
    adapter.assert_quiet(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn variables_failed_fetch_can_be_retried() {
    let (session, mut adapter) = session();
    connect(&session, &mut adapter).await;
    adapter.stop(1, two_frames()).await;
    wait_for(&session, |s| s.current_frame().is_some()).await;

    let variable = Arc::new(trellis_dap::Variable::new("obj", "{...}", None, 5));
    let attempt = {
        let session = session.clone();
        let variable = variable.clone();
        tokio::spawn(async move { session.variable_children(&variable, 0, 10).await })
    };
    let request = adapter.expect("variables").await;
    adapter.respond_error(&request, "busy").await;
    assert!(matches!(
        attempt.await.unwrap(),
        Err(DapError::Rejected { .. })
    ));
    assert!(variable.cached_children().is_none());

    let retry = {
        let session = session.clone();
        let variable = variable.clone();
        tokio::spawn(async move { session.variable_children(&variable, 0, 10).await })
    };
    let request = adapter.expect("variables").await;
    adapter
        .respond(
            &request,
            Some(json!({"variables": [{"name": "x", "value": "1", "variablesReference": 0}]})),
        )
        .await;
    assert_eq!(retry.await.unwrap().unwrap().len(), 1);
}

#[tokio::test]
async fn evaluate_returns_independent_variables() {
    let (session, mut adapter) = session();
    connect(&session, &mut adapter).await;
    adapter.stop(1, two_frames()).await;
    let frame = wait_for(&session, |s| s.current_frame().is_some())
        .await
        .current_frame()
        .unwrap();

    let first = {
        let session = session.clone();
        let frame = frame.clone();
        tokio::spawn(async move { session.evaluate(Some(&frame), "x+1").await })
    };
    let request = adapter.expect("evaluate").await;
    let args = arguments(&request);
    assert_eq!(args["expression"], "x+1");
    assert_eq!(args["frameId"], 100);
    assert_eq!(args["context"], "repl");
    adapter
        .respond(
            &request,
            Some(json!({"result": "42", "type": "number", "variablesReference": 0})),
        )
        .await;
    let first = first.await.unwrap().unwrap();
    assert_eq!(first.name(), "x+1");
    assert_eq!(first.value(), "42");
    assert!(!first.has_children());

    let second = {
        let session = session.clone();
        tokio::spawn(async move { session.evaluate(None, "y").await })
    };
    let request = adapter.expect("evaluate").await;
    assert!(arguments(&request).get("frameId").is_none());
    adapter
        .respond(&request, Some(json!({"result": "7", "variablesReference": 0})))
        .await;
    let second = second.await.unwrap().unwrap();

    assert_eq!(second.value(), "7");
    assert_eq!(first.value(), "42");
    assert_eq!(first.name(), "x+1");
}

#[tokio::test]
async fn evaluate_error_is_surfaced() {
    let (session, mut adapter) = session();
    connect(&session, &mut adapter).await;

    let evaluating = {
        let session = session.clone();
        tokio::spawn(async move { session.evaluate(None, "nope").await })
    };
    let request = adapter.expect("evaluate").await;
    adapter.respond_error(&request, "nope is not defined").await;
    assert_eq!(
        evaluating.await.unwrap().unwrap_err(),
        DapError::Rejected {
            command: "evaluate".into(),
            message: "nope is not defined".into()
        }
    );
}

// ── Events and reverse requests ──────────────────────────────────

#[tokio::test]
async fn events_output_reaches_sink_and_subscribers() {
    let output = Arc::new(RecordingOutput::default());
    let collaborators = Collaborators {
        output: output.clone(),
        ..Collaborators::default()
    };
    let (session, mut adapter) = session_with(
        SessionOptions::default(),
        Arc::new(BreakpointManager::new()),
        collaborators,
    );
    let recorder = Recorder::attach(&session);
    connect(&session, &mut adapter).await;

    adapter
        .event(
            "output",
            Some(json!({"category": "telemetry", "output": "secret"})),
        )
        .await;
    adapter
        .event("output", Some(json!({"category": "stdout", "output": "hello\n"})))
        .await;
    adapter
        .event("output", Some(json!({"output": "note"})))
        .await;
    recorder
        .wait_for(|event| matches!(event, SessionEvent::Output { text, .. } if text == "note"))
        .await;

    assert_eq!(
        *output.lines.lock().unwrap(),
        vec![
            ("stdout".to_string(), "hello\n".to_string()),
            ("console".to_string(), "note".to_string())
        ]
    );
    assert!(!recorder.events().iter().any(|event| matches!(
        event,
        SessionEvent::Output { category: OutputCategory::Telemetry, .. }
    )));
}

#[tokio::test]
async fn events_exited_and_terminated() {
    let breakpoints = Arc::new(BreakpointManager::new());
    let (session, mut adapter) = session_with(
        SessionOptions::default(),
        breakpoints.clone(),
        Collaborators::default(),
    );
    let recorder = Recorder::attach(&session);
    connect(&session, &mut adapter).await;

    adapter.event("exited", Some(json!({"exitCode": 3}))).await;
    adapter.event("terminated", None).await;
    tokio::time::timeout(STEP, session.wait_terminated())
        .await
        .unwrap();

    let events = recorder.events();
    assert!(events.contains(&SessionEvent::Exited { exit_code: 3 }));
    assert_eq!(events.last(), Some(&SessionEvent::Terminated));
    assert_eq!(breakpoints.listener_count(), 0);
    assert_eq!(session.pause().await, Err(DapError::Terminated));
    assert_eq!(session.state(), SessionState::Terminated);
}

#[tokio::test]
async fn events_unsupported_reverse_request_is_answered() {
    let (session, mut adapter) = session();
    connect(&session, &mut adapter).await;

    let seq = adapter
        .reverse_request("runInTerminal", Some(json!({"args": ["app"]})))
        .await;
    let response = adapter.next_response().await;
    assert_eq!(response.request_seq, seq);
    assert!(!response.success);
    assert_eq!(response.message.as_deref(), Some("unsupported"));
    assert_eq!(session.state(), SessionState::Running);
}

#[tokio::test]
async fn events_start_debugging_opens_child_session() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let breakpoints = Arc::new(BreakpointManager::new());
    let (session, mut adapter) = session_with(
        SessionOptions::default(),
        breakpoints.clone(),
        Collaborators::default(),
    );
    let recorder = Recorder::attach(&session);
    connect(&session, &mut adapter).await;

    let seq = adapter
        .reverse_request(
            "startDebugging",
            Some(json!({"request": "attach", "configuration": {"port": port, "name": "child"}})),
        )
        .await;
    let response = adapter.next_response().await;
    assert_eq!(response.request_seq, seq);
    assert!(response.success);

    let (stream, _) = tokio::time::timeout(STEP, listener.accept())
        .await
        .unwrap()
        .unwrap();
    let mut child = FakeAdapter::over_tcp(stream);
    let initialize = child.expect("initialize").await;
    child.respond(&initialize, Some(capabilities())).await;
    let attach = child.expect("attach").await;
    assert_eq!(arguments(&attach)["name"], "child");
    child.respond(&attach, None).await;
    child.event("initialized", None).await;
    child.configure().await;

    recorder
        .wait_for(|event| matches!(event, SessionEvent::ChildSession { port: p, .. } if *p == port))
        .await;
    assert_eq!(breakpoints.listener_count(), 2);

    let finishing = {
        let session = session.clone();
        tokio::spawn(async move { session.finish().await })
    };
    let disconnect = adapter.expect("disconnect").await;
    adapter.respond(&disconnect, None).await;
    finishing.await.unwrap();

    let disconnect = child.expect("disconnect").await;
    child.respond(&disconnect, None).await;
    tokio::time::timeout(STEP, async {
        while breakpoints.listener_count() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("child session never terminated");
}

// ── Finish ───────────────────────────────────────────────────────

#[tokio::test]
async fn finish_twice_cleans_up_once() {
    let breakpoints = Arc::new(BreakpointManager::new());
    let (session, mut adapter) = session_with(
        SessionOptions::default(),
        breakpoints.clone(),
        Collaborators::default(),
    );
    let recorder = Recorder::attach(&session);
    connect(&session, &mut adapter).await;
    assert_eq!(breakpoints.listener_count(), 1);

    let first = {
        let session = session.clone();
        tokio::spawn(async move { session.finish().await })
    };
    let disconnect = adapter.expect("disconnect").await;
    assert_eq!(arguments(&disconnect)["terminateDebuggee"], true);
    adapter.respond(&disconnect, None).await;
    first.await.unwrap();
    session.finish().await;

    assert_eq!(session.state(), SessionState::Terminated);
    assert_eq!(breakpoints.listener_count(), 0);
    let terminated = recorder
        .events()
        .iter()
        .filter(|event| **event == SessionEvent::Terminated)
        .count();
    assert_eq!(terminated, 1);
    assert_eq!(session.resume().await, Err(DapError::Terminated));
    assert!(session.snapshot().current_thread.is_none());
}

#[tokio::test]
async fn finish_does_not_wait_forever_for_disconnect() {
    let options = SessionOptions {
        disconnect_timeout: Duration::from_millis(50),
        terminate_debuggee: false,
        ..SessionOptions::default()
    };
    let (session, mut adapter) = session_with(
        options,
        Arc::new(BreakpointManager::new()),
        Collaborators::default(),
    );
    connect(&session, &mut adapter).await;

    let finishing = {
        let session = session.clone();
        tokio::spawn(async move { session.finish().await })
    };
    let disconnect = adapter.expect("disconnect").await;
    assert_eq!(arguments(&disconnect)["terminateDebuggee"], false);

    tokio::time::timeout(STEP, finishing)
        .await
        .expect("finish hung")
        .unwrap();
    assert_eq!(session.state(), SessionState::Terminated);
}
