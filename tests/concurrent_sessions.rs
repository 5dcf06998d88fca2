//! Concurrency tests: many nodes, many sessions, racing completions.
//!
//! The engine is shared by clone across tokio tasks and plain threads; none
//! of these tests take any lock of their own.

use std::collections::HashSet;
use std::sync::Arc;

use fleet_exec::events::{ExecEvent, OutputStream};
use fleet_exec::session::ExecutionRequest;
use fleet_exec::ExecutionEngine;
use tokio::sync::Barrier;

const NODES: usize = 8;
const SESSIONS_PER_NODE: usize = 40;

fn request(node: &str) -> ExecutionRequest {
    ExecutionRequest::new(node, "ps", ["aux"])
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_lifecycles_across_nodes() {
    let engine = ExecutionEngine::default();
    let mut handles = Vec::new();

    for n in 0..NODES {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            let node = format!("mate-{n}");
            for i in 0..SESSIONS_PER_NODE {
                let id = engine.create_session(request(&node)).unwrap();
                let mut sub = engine.attach(&id).unwrap();
                engine.append_output(&id, OutputStream::Stdout, &format!("{i}:"));
                engine.append_output(&id, OutputStream::Stdout, "ok");
                engine.complete_execution(&id, 0).unwrap();

                let mut names = Vec::new();
                while let Some(event) = sub.recv().await {
                    names.push(event.name());
                }
                assert_eq!(names, vec!["start", "chunk", "chunk", "done"]);
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    assert!(engine.active_sessions().is_empty());
    assert!(engine.channels().is_empty());
    for n in 0..NODES {
        let history = engine.history(&format!("mate-{n}"));
        assert_eq!(history.len(), SESSIONS_PER_NODE);
        let newest = &history[0];
        assert_eq!(newest.output, format!("{}:ok", SESSIONS_PER_NODE - 1));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_same_node_concurrent_creates_get_distinct_ids() {
    let engine = ExecutionEngine::default();
    let barrier = Arc::new(Barrier::new(16));
    let mut handles = Vec::new();

    for _ in 0..16 {
        let engine = engine.clone();
        let barrier = barrier.clone();
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            (0..20)
                .map(|_| engine.create_session(request("mate-1")).unwrap())
                .collect::<Vec<_>>()
        }));
    }

    let mut ids = HashSet::new();
    for h in handles {
        for id in h.await.unwrap() {
            assert!(ids.insert(id.clone()), "duplicate session id {id}");
        }
    }
    assert_eq!(ids.len(), 320);
    assert_eq!(engine.active_sessions().len(), 320);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_completions_record_once() {
    let engine = ExecutionEngine::default();
    let id = engine.create_session(request("mate-1")).unwrap();
    let mut sub = engine.attach(&id).unwrap();
    engine.append_output(&id, OutputStream::Stdout, "x");

    let barrier = Arc::new(Barrier::new(8));
    let mut handles = Vec::new();
    for code in 0..8 {
        let engine = engine.clone();
        let id = id.clone();
        let barrier = barrier.clone();
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            engine.complete_execution(&id, code).is_some()
        }));
    }
    let mut winners = 0;
    for h in handles {
        if h.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
    assert_eq!(engine.history("mate-1").len(), 1);

    let mut terminal = 0;
    while let Some(event) = sub.recv().await {
        if event.is_terminal() {
            terminal += 1;
            assert!(matches!(event, ExecEvent::Done { ref output, .. } if output == "x"));
        }
    }
    assert_eq!(terminal, 1);
}

#[test]
fn test_same_node_completions_from_threads_keep_capacity() {
    let engine = ExecutionEngine::default();
    let ids: Vec<String> = (0..160)
        .map(|_| engine.create_session(request("mate-1")).unwrap())
        .collect();

    let chunks: Vec<Vec<String>> = ids.chunks(20).map(|c| c.to_vec()).collect();
    let threads: Vec<_> = chunks
        .into_iter()
        .map(|batch| {
            let engine = engine.clone();
            std::thread::spawn(move || {
                for id in batch {
                    engine.complete_execution(&id, 0);
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    let history = engine.history("mate-1");
    assert_eq!(history.len(), 100);
    let unique: HashSet<_> = history.iter().map(|e| e.session_id.clone()).collect();
    assert_eq!(unique.len(), 100);
    assert!(engine.active_sessions().is_empty());
}
