//! Tests for the transport-agnostic schedules API

use std::sync::Arc;
use std::time::Duration;

use batch_scheduler::core::validator::Validator;
use batch_scheduler::core::{Resources, Scheduler, Status, WorkdirRunner};
use batch_scheduler::runtime::api::{
    cancel_schedule, get_schedule, health, list_schedules, submit_schedule,
};
use batch_scheduler::runtime::{BodyFormat, Owner, TokioSpawner};
use serde_json::{json, Value};
use uuid::Uuid;

fn scheduler(home: &std::path::Path) -> Arc<Scheduler> {
    Arc::new(Scheduler::new(
        Resources::new(2, 2),
        Arc::new(WorkdirRunner::new(home)),
        TokioSpawner::current(),
    ))
}

fn owner(name: &str, admin: bool) -> Owner {
    Owner {
        name: name.to_string(),
        admin,
    }
}

fn later() -> String {
    (chrono::Utc::now() + chrono::TimeDelta::hours(1)).to_rfc3339()
}

#[tokio::test]
async fn test_submit_then_list_and_get() {
    let home = tempfile::tempdir().unwrap();
    let s = scheduler(home.path());
    let validator = Validator::standard().unwrap();
    let alice = owner("alice", false);

    let body = json!({"start": later(), "cpu": 2, "action": {"dummy": {"name": "job"}}});
    let created = submit_schedule(
        &s,
        &validator,
        &alice,
        None,
        BodyFormat::Json,
        body.to_string().as_bytes(),
    )
    .await;
    assert_eq!(created.status, 201);
    assert_eq!(created.body["owner"], "alice");
    assert_eq!(created.body["status"], "waiting");
    let id = created.body["id"].as_str().unwrap().to_string();

    let listed = list_schedules(&s, &alice, None);
    assert_eq!(listed.status, 200);
    assert_eq!(listed.body.as_array().unwrap().len(), 1);

    let bob = owner("bob", false);
    assert!(list_schedules(&s, &bob, None).body.as_array().unwrap().is_empty());
    assert_eq!(get_schedule(&s, &bob, &id).status, 401);
    assert_eq!(get_schedule(&s, &alice, &id).status, 200);
    assert_eq!(get_schedule(&s, &alice, "not-a-uuid").status, 400);
    assert_eq!(get_schedule(&s, &alice, &Uuid::new_v4().to_string()).status, 404);
}

#[tokio::test]
async fn test_only_admins_act_for_others() {
    let home = tempfile::tempdir().unwrap();
    let s = scheduler(home.path());
    let validator = Validator::standard().unwrap();
    let body = json!({"start": later(), "action": {"dummy": {}}}).to_string();

    let alice = owner("alice", false);
    assert_eq!(list_schedules(&s, &alice, Some("bob")).status, 401);
    let refused = submit_schedule(
        &s,
        &validator,
        &alice,
        Some("bob"),
        BodyFormat::Json,
        body.as_bytes(),
    )
    .await;
    assert_eq!(refused.status, 401);

    let root = owner("root", true);
    let created = submit_schedule(
        &s,
        &validator,
        &root,
        Some("bob"),
        BodyFormat::Json,
        body.as_bytes(),
    )
    .await;
    assert_eq!(created.status, 201);
    assert_eq!(created.body["owner"], "bob");
    assert_eq!(list_schedules(&s, &root, Some("bob")).body.as_array().unwrap().len(), 1);
    assert_eq!(list_schedules(&s, &root, None).body.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_submit_rejections() {
    let home = tempfile::tempdir().unwrap();
    let s = scheduler(home.path());
    let validator = Validator::standard().unwrap();
    let alice = owner("alice", false);

    let garbage = submit_schedule(
        &s,
        &validator,
        &alice,
        None,
        BodyFormat::Json,
        b"{not json",
    )
    .await;
    assert_eq!(garbage.status, 400);
    assert!(garbage.body["error"].is_string());

    let forbidden = json!({"action": {"compose": {"services": {
        "web": {"image": "nginx", "build": ".", "volumes": ["/etc:/etc"]},
    }}}});
    let refused = submit_schedule(
        &s,
        &validator,
        &alice,
        None,
        BodyFormat::Json,
        forbidden.to_string().as_bytes(),
    )
    .await;
    assert_eq!(refused.status, 400);
    let errors = refused.body.as_array().expect("array of violations");
    assert_eq!(errors.len(), 2);
    assert!(errors.iter().all(Value::is_string));

    let too_big = json!({"cpu": 3, "action": {"dummy": {}}});
    let refused = submit_schedule(
        &s,
        &validator,
        &alice,
        None,
        BodyFormat::Json,
        too_big.to_string().as_bytes(),
    )
    .await;
    assert_eq!(refused.status, 400);
    assert_eq!(s.length(), 0);
}

#[tokio::test]
async fn test_submit_compose_yaml() {
    let home = tempfile::tempdir().unwrap();
    let s = scheduler(home.path());
    let validator = Validator::standard().unwrap();
    let alice = owner("alice", false);
    let format = BodyFormat::from_content_type("application/x-yaml");

    let yaml = format!(
        "services:\n  job:\n    image: busybox\nx-batch:\n  start: '{}'\n  retry: 1\n  max_execution_time: 10m\n",
        later()
    );
    let created = submit_schedule(&s, &validator, &alice, None, format, yaml.as_bytes()).await;
    assert_eq!(created.status, 201);
    assert_eq!(created.body["retry"], 1);
    assert_eq!(created.body["action"]["compose"]["services"]["job"]["image"], "busybox");

    let forbidden = b"services:\n  web:\n    image: nginx\n    build: .\n    volumes:\n      - /etc:/etc\n";
    let refused = submit_schedule(&s, &validator, &alice, None, format, forbidden).await;
    assert_eq!(refused.status, 400);
    assert_eq!(refused.body.as_array().expect("array of violations").len(), 2);

    let garbage = submit_schedule(&s, &validator, &alice, None, format, b"services: [job").await;
    assert_eq!(garbage.status, 400);
    assert_eq!(s.length(), 1);
}

#[tokio::test]
async fn test_cancel_sync_and_async() {
    let home = tempfile::tempdir().unwrap();
    let s = scheduler(home.path());
    let validator = Validator::standard().unwrap();
    let alice = owner("alice", false);
    let body = json!({"start": later(), "action": {"dummy": {}}}).to_string();

    let first = submit_schedule(
        &s,
        &validator,
        &alice,
        None,
        BodyFormat::Json,
        body.as_bytes(),
    )
    .await;
    let first = first.body["id"].as_str().unwrap().to_string();
    let second = submit_schedule(
        &s,
        &validator,
        &alice,
        None,
        BodyFormat::Json,
        body.as_bytes(),
    )
    .await;
    let second = second.body["id"].as_str().unwrap().to_string();

    assert_eq!(cancel_schedule(&s, &owner("bob", false), &first, true).await.status, 401);
    assert_eq!(cancel_schedule(&s, &alice, &first, true).await.status, 204);
    let id = Uuid::parse_str(&first).unwrap();
    assert_eq!(s.get_task(id).unwrap().status, Status::Canceled);

    assert_eq!(cancel_schedule(&s, &alice, &second, false).await.status, 202);
    let id = Uuid::parse_str(&second).unwrap();
    for _ in 0..100 {
        if s.get_task(id).unwrap().status == Status::Canceled {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(s.get_task(id).unwrap().status, Status::Canceled);
}

#[test]
fn test_health() {
    let response = health();
    assert_eq!(response.status, 200);
    assert_eq!(response.body["ok"], true);
}
