//! Combinator semantics tests.
//!
//! These tests verify ordering, cancellation, retry and recovery behaviour
//! of each combinator, and the tracker tree each one leaves behind.

use serde_json::{json, Value};
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::time::Instant;

use callflow::core::Status;
use callflow::orchestration::{Flow, RetryPolicy};
use callflow::transport::{Reply, SimulatedTransport};
use callflow::{CancelReason, Error, Failure};

use crate::fixtures::{delayed, engine, request, scripted, snapshot};

/// Test: Sequential abort
/// Given concat(a, b, c) where b fails
/// When the flow runs
/// Then c is never invoked and stays pending
#[tokio::test]
async fn test_concat_failure_leaves_later_members_pending() {
    let transport = SimulatedTransport::new()
        .respond("a", Reply::ok(json!("a")))
        .respond("b", Reply::err(500, "Internal Server Error"))
        .respond("c", Reply::ok(json!("c")));
    let engine = engine();
    let flow = Flow::concat(vec![
        request(&transport, "a", "a"),
        request(&transport, "b", "b"),
        request(&transport, "c", "c"),
    ]);

    let err = engine.execute(flow).await.unwrap_err();
    assert!(matches!(err, Error::Task(Failure::Transport { code: 500, .. })));

    assert_eq!(transport.calls("c"), 0, "c must not be invoked after b fails");
    let tree = snapshot(&engine);
    assert_eq!(tree.status_of("a"), Some(&Status::Done));
    assert_eq!(tree.status_of("b").and_then(|s| s.failure()).and_then(|f| f.code()), Some(500));
    assert_eq!(tree.status_of("c"), Some(&Status::Pending));
    assert_eq!(tree.status_of("concat").and_then(|s| s.failure()).and_then(|f| f.code()), Some(500));
}

/// Test: Concurrent child order
/// Given merge(slow, mid, fast)
/// When members complete in reverse order
/// Then values follow completion order but children keep declaration order
#[tokio::test(start_paused = true)]
async fn test_merge_children_follow_declaration_order() {
    let engine = engine();
    let flow = Flow::merge(vec![
        delayed("slow", 300, Ok(json!("slow"))),
        delayed("mid", 100, Ok(json!("mid"))),
        delayed("fast", 10, Ok(json!("fast"))),
    ]);

    let values = engine.execute(flow).await.unwrap();
    assert_eq!(values, vec![json!("fast"), json!("mid"), json!("slow")]);

    let tree = snapshot(&engine);
    let root = tree.root.as_ref().unwrap();
    assert_eq!(root.label, "merge");
    assert_eq!(root.child_labels(), vec!["slow", "mid", "fast"]);
    assert!(tree.iter().all(|n| n.status == Status::Done));
}

/// Test: Aggregate-All ordering
/// Given forkJoin(first, second) where second finishes first
/// When both succeed
/// Then one array is emitted in declaration order
#[tokio::test(start_paused = true)]
async fn test_fork_join_collects_in_declaration_order() {
    let engine = engine();
    let flow = Flow::fork_join(vec![
        delayed("first", 200, Ok(json!("first"))),
        delayed("second", 20, Ok(json!("second"))),
    ]);

    let values = engine.execute(flow).await.unwrap();
    assert_eq!(values, vec![json!(["first", "second"])]);
    assert_eq!(snapshot(&engine).status_of("forkJoin"), Some(&Status::Done));
}

/// Test: Aggregate-All failure
/// Given forkJoin(slow, bad) where bad fails at 50ms
/// When the flow runs
/// Then it fails without waiting for slow, which is cancelled
#[tokio::test(start_paused = true)]
async fn test_fork_join_failure_does_not_wait_for_stragglers() {
    let engine = engine();
    let flow = Flow::fork_join(vec![
        delayed("slow", 1000, Ok(json!("slow"))),
        delayed("bad", 50, Err(Failure::transport(503, "Service Unavailable"))),
    ]);

    let start = Instant::now();
    let err = engine.execute(flow).await.unwrap_err();
    let elapsed = start.elapsed();

    assert!(matches!(err, Error::Task(Failure::Transport { code: 503, .. })));
    assert!(elapsed >= Duration::from_millis(50));
    assert!(elapsed < Duration::from_millis(1000), "took {:?}", elapsed);

    let tree = snapshot(&engine);
    assert_eq!(
        tree.status_of("slow").and_then(|s| s.failure()),
        Some(&Failure::cancelled(CancelReason::SiblingFailed))
    );
}

/// Test: Retry success
/// Given a task that fails twice then succeeds, wrapped in retry(N = 2)
/// When the flow runs
/// Then it is invoked 3 times and succeeds
#[tokio::test]
async fn test_retry_succeeds_on_third_attempt() {
    let engine = engine();
    let (flaky, invocations) = scripted(
        "flaky",
        vec![
            Err(Failure::transport(503, "Service Unavailable")),
            Err(Failure::transport(503, "Service Unavailable")),
            Ok(json!("finally")),
        ],
    );

    let values = engine
        .execute(flaky.retry(RetryPolicy::fixed(2, Duration::ZERO)))
        .await
        .unwrap();

    assert_eq!(values, vec![json!("finally")]);
    assert_eq!(invocations.load(Ordering::SeqCst), 3);
    let tree = snapshot(&engine);
    let node = tree.find("flaky").unwrap();
    assert_eq!(node.attempts, 3);
    assert_eq!(node.status, Status::Done);
    assert_eq!(tree.status_of("retry"), Some(&Status::Done));
}

/// Test: Retry exhaustion
/// Given a task that always fails, wrapped in retry(N = 2, D = 2s)
/// When the flow runs
/// Then it is invoked 3 times, waits between attempts, and surfaces RetriesExhausted
#[tokio::test(start_paused = true)]
async fn test_retry_exhausts_after_n_plus_one_attempts() {
    let engine = engine();
    let (broken, invocations) = scripted("broken", vec![Err(Failure::transport(404, "Not Found"))]);

    let start = Instant::now();
    let err = engine
        .execute(broken.retry(RetryPolicy::fixed(2, Duration::from_secs(2))))
        .await
        .unwrap_err();

    assert!(start.elapsed() >= Duration::from_secs(4));
    assert_eq!(invocations.load(Ordering::SeqCst), 3);
    match err {
        Error::Task(Failure::RetriesExhausted { last, attempts }) => {
            assert_eq!(attempts, 3);
            assert_eq!(*last, Failure::transport(404, "Not Found"));
        }
        other => panic!("expected RetriesExhausted, got {:?}", other),
    }
    let tree = snapshot(&engine);
    assert!(matches!(
        tree.status_of("retry").and_then(|s| s.failure()),
        Some(Failure::RetriesExhausted { attempts: 3, .. })
    ));
}

/// Test: Retry re-arms cancelled members
/// Given retry(merge(flaky, steady)) where flaky fails once
/// When the first attempt cancels steady
/// Then the second attempt runs steady again to completion
#[tokio::test(start_paused = true)]
async fn test_retry_rearms_cancelled_members() {
    let engine = engine();
    let (flaky, _) = scripted(
        "flaky",
        vec![Err(Failure::transport(500, "boom")), Ok(json!("a"))],
    );
    let flow = Flow::merge(vec![flaky, delayed("steady", 100, Ok(json!("b")))])
        .retry(RetryPolicy::fixed(1, Duration::ZERO));

    let values = engine.execute(flow).await.unwrap();
    assert_eq!(values, vec![json!("a"), json!("b")]);

    let tree = snapshot(&engine);
    assert_eq!(tree.status_of("steady"), Some(&Status::Done));
    assert_eq!(tree.find("flaky").unwrap().attempts, 2);
    assert!(tree.iter().all(|n| n.status == Status::Done));
}

/// Test: Recover
/// Given forkJoin(users/2, catchError(users/5000, []))
/// When users/5000 fails
/// Then the fallback is emitted, catchError is done, and one diagnostic is recorded
#[tokio::test]
async fn test_recover_records_single_diagnostic() {
    let transport = SimulatedTransport::placeholder(Duration::ZERO);
    let engine = engine();
    let flow = Flow::fork_join(vec![
        request(&transport, "user", "users/2"),
        request(&transport, "missing", "users/5000").recover(json!([])),
    ]);

    let values = engine.execute(flow).await.unwrap();
    assert_eq!(values.len(), 1);
    assert_eq!(values[0][0]["id"], json!(2));
    assert_eq!(values[0][1], json!([]));

    let tree = snapshot(&engine);
    assert_eq!(tree.status_of("catchError"), Some(&Status::Done));
    assert_eq!(tree.status_of("forkJoin"), Some(&Status::Done));
    assert_eq!(
        tree.status_of("missing").and_then(|s| s.failure()).and_then(|f| f.code()),
        Some(404)
    );

    let entries = engine.diagnostics().entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].message, "Error caught: ");
    assert_eq!(entries[0].payload["code"], json!(404));
}

/// Test: Latest-Only-Flatten supersession
/// Given a source emitting 1 at 10ms and 2 at 20ms, each projected to a 100ms inner
/// When the second trigger arrives before the first inner settles
/// Then the first inner is cancelled and only the second's value surfaces
#[tokio::test(start_paused = true)]
async fn test_switch_map_supersedes_unfinished_inner() {
    let engine = engine();
    let source = Flow::concat(vec![
        delayed("t1", 10, Ok(json!(1))),
        delayed("t2", 10, Ok(json!(2))),
    ]);
    let flow = source.switch_map(|value: &Value| {
        let n = value.as_i64().unwrap_or(0);
        delayed(&format!("inner{}", n), 100, Ok(json!(n * 10)))
    });

    let values = engine.execute(flow).await.unwrap();
    assert_eq!(values, vec![json!(20)]);

    let tree = snapshot(&engine);
    let root = tree.root.as_ref().unwrap();
    assert_eq!(root.label, "switchMap");
    assert_eq!(root.child_labels(), vec!["concat", "inner1", "inner2"]);
    assert_eq!(
        tree.status_of("inner1").and_then(|s| s.failure()),
        Some(&Failure::cancelled(CancelReason::Superseded))
    );
    assert_eq!(tree.status_of("inner2"), Some(&Status::Done));
    assert_eq!(root.status, Status::Done);
}

/// Test: Latest-Only-Flatten inner failure
/// Given a source still running when its inner fails
/// When the inner fails
/// Then the source is cancelled and the failure surfaces immediately
#[tokio::test(start_paused = true)]
async fn test_switch_map_inner_failure_cancels_source() {
    let engine = engine();
    let source = Flow::concat(vec![
        delayed("t1", 10, Ok(json!(1))),
        delayed("t2", 500, Ok(json!(2))),
    ]);
    let flow = source.switch_map(|_| delayed("inner", 20, Err(Failure::transport(502, "Bad Gateway"))));

    let start = Instant::now();
    let err = engine.execute(flow).await.unwrap_err();
    assert!(start.elapsed() < Duration::from_millis(500));
    assert!(matches!(err, Error::Task(Failure::Transport { code: 502, .. })));

    let tree = snapshot(&engine);
    assert!(tree.status_of("concat").unwrap().is_cancelled());
    assert!(tree.status_of("t2").unwrap().is_cancelled());
    assert_eq!(tree.status_of("t1"), Some(&Status::Done));
}

/// Test: Flatten variants differ only in concurrency
/// Given the same three 100ms projections
/// When run through concatMap and mergeMap
/// Then concatMap takes three times as long
#[tokio::test(start_paused = true)]
async fn test_concat_map_is_sequential_and_merge_map_is_not() {
    let project = |value: &Value| delayed(&format!("c{}", value), 100, Ok(value.clone()));
    let inputs = vec![json!(1), json!(2), json!(3)];

    let sequential = engine();
    let start = Instant::now();
    let values = sequential
        .execute(Flow::concat_map(inputs.clone(), project))
        .await
        .unwrap();
    assert_eq!(values, inputs);
    assert!(start.elapsed() >= Duration::from_millis(300));

    let concurrent = engine();
    let start = Instant::now();
    let values = concurrent
        .execute(Flow::merge_map(inputs.clone(), project))
        .await
        .unwrap();
    assert_eq!(values.len(), 3);
    assert!(start.elapsed() < Duration::from_millis(200));
    assert_eq!(
        snapshot(&concurrent).root.unwrap().child_labels(),
        vec!["c1", "c2", "c3"]
    );
}

/// Test: Unstarted members stay pending
/// Given merge(bad, good) and forkJoin(bad, good) where bad fails on its first poll
/// When the flow runs
/// Then good is never invoked and stays pending rather than cancelled
#[tokio::test]
async fn test_concurrent_failure_leaves_unstarted_members_pending() {
    let combinators: [fn(Vec<Flow>) -> Flow; 2] = [|m| Flow::merge(m), |m| Flow::fork_join(m)];
    for flow_of in combinators {
        let engine = engine();
        let (bad, _) = scripted("bad", vec![Err(Failure::transport(500, "Internal Server Error"))]);
        let (good, invocations) = scripted("good", vec![Ok(json!("good"))]);

        let err = engine.execute(flow_of(vec![bad, good])).await.unwrap_err();
        assert!(matches!(err, Error::Task(Failure::Transport { code: 500, .. })));

        assert_eq!(invocations.load(Ordering::SeqCst), 0);
        let tree = snapshot(&engine);
        let good = tree.find("good").unwrap();
        assert_eq!(good.status, Status::Pending);
        assert_eq!(good.attempts, 0);
    }
}

/// Test: Retried switchMap keeps one inner node
/// Given retry(N = 2, switchMap(src, inner)) where inner fails twice then succeeds
/// When the flow runs
/// Then every attempt reuses the same inner node
#[tokio::test]
async fn test_retried_switch_map_reuses_inner_node() {
    let engine = engine();
    let (source, _) = scripted("src", vec![Ok(json!(1))]);
    let (inner, invocations) = scripted(
        "inner",
        vec![
            Err(Failure::transport(503, "Service Unavailable")),
            Err(Failure::transport(503, "Service Unavailable")),
            Ok(json!("done")),
        ],
    );
    let flow = source
        .switch_map(move |_| inner.clone())
        .retry(RetryPolicy::fixed(2, Duration::ZERO));

    let values = engine.execute(flow).await.unwrap();
    assert_eq!(values, vec![json!("done")]);
    assert_eq!(invocations.load(Ordering::SeqCst), 3);

    let tree = snapshot(&engine);
    assert_eq!(tree.iter().count(), 4);
    assert_eq!(tree.find("switchMap").unwrap().child_labels(), vec!["src", "inner"]);
    let inner = tree.find("inner").unwrap();
    assert_eq!(inner.attempts, 3);
    assert_eq!(inner.status, Status::Done);
}

/// Test: Sequential-Flatten abort
/// Given concatMap([1, 2, 3]) where the projection for 2 fails
/// When the flow runs
/// Then the projection for 3 never starts
#[tokio::test(start_paused = true)]
async fn test_concat_map_failure_leaves_later_projections_pending() {
    let engine = engine();
    let flow = Flow::concat_map(vec![json!(1), json!(2), json!(3)], |value: &Value| {
        let label = format!("c{}", value);
        if value == &json!(2) {
            delayed(&label, 10, Err(Failure::transport(500, "Internal Server Error")))
        } else {
            delayed(&label, 10, Ok(value.clone()))
        }
    });

    let err = engine.execute(flow).await.unwrap_err();
    assert!(matches!(err, Error::Task(Failure::Transport { code: 500, .. })));

    let tree = snapshot(&engine);
    assert_eq!(tree.status_of("c1"), Some(&Status::Done));
    assert_eq!(tree.status_of("c2").and_then(|s| s.failure()).and_then(|f| f.code()), Some(500));
    assert_eq!(tree.status_of("c3"), Some(&Status::Pending));
    assert_eq!(tree.find("c3").unwrap().attempts, 0);
    assert_eq!(
        tree.status_of("concatMap").and_then(|s| s.failure()).and_then(|f| f.code()),
        Some(500)
    );
}

/// Test: Concurrent-Flatten failure
/// Given mergeMap([1, 2, 3]) where the projection for 2 fails at 50ms
/// When the flow runs
/// Then the others are cancelled and the failure surfaces at ~50ms
#[tokio::test(start_paused = true)]
async fn test_merge_map_failure_cancels_other_projections() {
    let engine = engine();
    let flow = Flow::merge_map(vec![json!(1), json!(2), json!(3)], |value: &Value| {
        let label = format!("m{}", value);
        if value == &json!(2) {
            delayed(&label, 50, Err(Failure::transport(500, "Internal Server Error")))
        } else {
            delayed(&label, 200, Ok(value.clone()))
        }
    });

    let start = Instant::now();
    let err = engine.execute(flow).await.unwrap_err();
    assert!(start.elapsed() < Duration::from_millis(200), "took {:?}", start.elapsed());
    assert!(matches!(err, Error::Task(Failure::Transport { code: 500, .. })));

    let tree = snapshot(&engine);
    let cancelled = Failure::cancelled(CancelReason::SiblingFailed);
    assert_eq!(tree.status_of("m1").and_then(|s| s.failure()), Some(&cancelled));
    assert_eq!(tree.status_of("m3").and_then(|s| s.failure()), Some(&cancelled));
    assert_eq!(
        tree.status_of("mergeMap").and_then(|s| s.failure()).and_then(|f| f.code()),
        Some(500)
    );
}
