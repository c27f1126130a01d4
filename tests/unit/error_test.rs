//! Tests for error types

use batch_scheduler::core::{ErrorKind, SchedulerError};
use uuid::Uuid;

#[test]
fn test_invalid_argument_error() {
    let err = SchedulerError::InvalidArgument("cpu must be positive".to_string());
    assert_eq!(format!("{}", err), "invalid argument: cpu must be positive");
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert_eq!(err.http_status(), 400);
}

#[test]
fn test_not_found_error() {
    let id = Uuid::nil();
    let err = SchedulerError::NotFound(id);
    assert_eq!(format!("{}", err), format!("task not found: {id}"));
    assert_eq!(err.http_status(), 404);
}

#[test]
fn test_validation_error_keeps_every_message() {
    let err = SchedulerError::Validation(vec!["no build".into(), "no privileged".into()]);
    assert_eq!(format!("{}", err), "validation failed: no build; no privileged");
    assert_eq!(err.messages(), vec!["no build".to_string(), "no privileged".to_string()]);
    assert_eq!(err.http_status(), 400);
}

#[test]
fn test_status_mapping() {
    assert_eq!(SchedulerError::Unauthorized("x".into()).http_status(), 401);
    assert_eq!(SchedulerError::Conflict("x".into()).http_status(), 409);
    assert_eq!(SchedulerError::Ambiguity("x".into()).http_status(), 400);
    assert_eq!(SchedulerError::ResourceCapacity("x".into()).http_status(), 400);
    assert_eq!(SchedulerError::Internal("x".into()).http_status(), 500);
}

#[test]
fn test_io_errors_are_internal() {
    let err: SchedulerError = std::io::Error::other("disk gone").into();
    assert_eq!(err.kind(), ErrorKind::Internal);
    assert_eq!(err.messages().len(), 1);
}
