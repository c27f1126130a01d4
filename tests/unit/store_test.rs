//! Tests for task persistence

use std::sync::Arc;

use batch_scheduler::core::action::{Action, Dummy};
use batch_scheduler::core::{SchedulerError, Status, Task};
use batch_scheduler::infra::store::{FileStore, JsonStore, MemoryStore, Store};
use uuid::Uuid;

fn task(owner: &str) -> Task {
    let mut task = Task::new(owner, Action::Dummy(Dummy::default()));
    task.id = Some(Uuid::new_v4());
    task
}

#[test]
fn test_file_store_reopens_with_latest_values() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tasks.jsonl");
    {
        let store = FileStore::open(&path).unwrap();
        store.put(b"a", b"1").unwrap();
        store.put(b"b", b"2").unwrap();
        store.put(b"a", b"3").unwrap();
        store.delete(b"b").unwrap();
        store.sync().unwrap();
    }
    let store = FileStore::open(&path).unwrap();
    assert_eq!(store.get(b"a").unwrap(), Some(b"3".to_vec()));
    assert_eq!(store.get(b"b").unwrap(), None);
    assert_eq!(store.length().unwrap(), 1);
}

#[test]
fn test_file_store_is_exclusive() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tasks.jsonl");
    let first = FileStore::open(&path).unwrap();
    assert!(matches!(FileStore::open(&path), Err(SchedulerError::InUse(_))));
    drop(first);
    assert!(FileStore::open(&path).is_ok());
}

#[test]
fn test_file_store_survives_compaction() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tasks.jsonl");
    {
        let store = FileStore::open(&path).unwrap();
        for i in 0..200u32 {
            store.put(b"hot", &i.to_be_bytes()).unwrap();
        }
        store.put(b"cold", b"x").unwrap();
    }
    let lines = std::fs::read_to_string(&path).unwrap().lines().count();
    assert!(lines < 200, "log was never compacted: {lines} lines");
    let store = FileStore::open(&path).unwrap();
    assert_eq!(store.get(b"hot").unwrap(), Some(199u32.to_be_bytes().to_vec()));
    assert_eq!(store.get(b"cold").unwrap(), Some(b"x".to_vec()));
}

#[test]
fn test_json_store_round_trips_tasks() {
    let store = JsonStore::new(Arc::new(MemoryStore::new()));
    let mut alice = task("alice");
    alice.status = Status::Done;
    let bob = task("bob");
    store.put(&alice).unwrap();
    store.put(&bob).unwrap();

    let loaded = store.get(alice.id.unwrap()).unwrap().unwrap();
    assert_eq!(loaded.owner, "alice");
    assert_eq!(loaded.status, Status::Done);
    assert_eq!(store.length().unwrap(), 2);

    store.delete(bob.id.unwrap()).unwrap();
    let owners: Vec<String> = store.tasks().unwrap().into_iter().map(|t| t.owner).collect();
    assert_eq!(owners, vec!["alice".to_string()]);
}

#[test]
fn test_json_store_needs_an_id() {
    let store = JsonStore::new(Arc::new(MemoryStore::new()));
    let anonymous = Task::new("alice", Action::Dummy(Dummy::default()));
    assert!(store.put(&anonymous).is_err());
}
