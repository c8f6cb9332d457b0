//! Integration tests for the collect and dump loops.
//!
//! Statuses are produced concurrently from several threads through the
//! channel returned by [`setup`], then observed through the recorder and the
//! dump directory.

use pfpstatus::dump::{dump_once, node_file};
use pfpstatus::{Params, RecordedStatus, RecorderConfig, Status, setup};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::tempdir;

fn dump_only_params(dir: &std::path::Path) -> Params {
    let mut params = Params::default();
    params.http.enabled = false;
    params.storage.enabled = true;
    params.storage.directory = dir.to_path_buf();
    params.storage.period = Duration::from_millis(20);
    params
}

#[test]
fn test_concurrent_producers_are_serialized() {
    let dir = tempdir().unwrap();
    let mut params = dump_only_params(dir.path());
    params.recorder = RecorderConfig::default()
        .with_max_nodes(4)
        .with_node_capacity(100);
    let collector = setup(params).unwrap().unwrap();

    let producers: Vec<_> = (0..4)
        .map(|p| {
            let sender = collector.sender();
            thread::spawn(move || {
                for i in 0..50 {
                    sender
                        .send(Status::new(format!("node-{p}")).with_expected(format!("v{i}")))
                        .unwrap();
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    let env = Arc::clone(collector.env());
    while env.lock().unwrap().len() < 200 {
        thread::sleep(Duration::from_millis(5));
    }
    let stats = collector.shutdown();
    assert_eq!(stats.accepted, 200);
    assert_eq!(stats.dropped, 0);

    let recorder = env.lock().unwrap();
    assert_eq!(recorder.count_nodes(), 4);
    for p in 0..4 {
        let (content, found) = recorder.content_for_node(&format!("node-{p}"));
        assert!(found);
        let tags: Vec<_> = content
            .iter()
            .map(|e| e.status.fingerprint_expected.clone())
            .collect();
        let expected: Vec<_> = (0..50).map(|i| format!("v{i}")).collect();
        assert_eq!(tags, expected, "per-producer order is preserved");
    }
}

#[test]
fn test_dump_loop_mirrors_recorder() {
    let dir = tempdir().unwrap();
    let collector = setup(dump_only_params(dir.path())).unwrap().unwrap();

    let sender = collector.sender();
    sender.send(Status::new("worker-0").with_expected("e1")).unwrap();
    sender.send(Status::new("worker-1").with_computed("c1")).unwrap();

    let file = node_file(dir.path(), "worker-1");
    while !file.exists() {
        thread::sleep(Duration::from_millis(5));
    }
    let entries: Vec<RecordedStatus> =
        serde_json::from_slice(&std::fs::read(&file).unwrap()).unwrap();
    assert_eq!(entries[0].status.fingerprint_computed, "c1");

    // an explicit dump rewrites the same files in place
    let env = Arc::clone(collector.env());
    collector.shutdown();
    assert_eq!(dump_once(&env, dir.path()).unwrap(), 2);
    let names: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    assert_eq!(names.len(), 2);
    assert!(names.iter().all(|n| !n.ends_with(".tmp")));
}
