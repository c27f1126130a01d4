//! Tests for the validator registry and composition checks

use batch_scheduler::core::action::{Action, ActionKind, Compose, Dummy};
use batch_scheduler::core::validator::{
    ActionValidator, RuleConfig, ValidatorRegistry, ValidatorsConfig,
};
use batch_scheduler::core::{SchedulerError, Task};
use serde_json::json;
use std::time::Duration;

struct NoFailures;

impl ActionValidator for NoFailures {
    fn validate_action(&self, action: &Action) -> Vec<String> {
        match action {
            Action::Dummy(dummy) if dummy.fail => vec![format!("{} is set up to fail", dummy.name)],
            _ => Vec::new(),
        }
    }
}

fn no_failures(_: &RuleConfig) -> Result<Box<dyn ActionValidator>, SchedulerError> {
    Ok(Box::new(NoFailures))
}

#[test]
fn test_custom_factory_replaces_builtin() {
    let mut registry = ValidatorRegistry::default();
    registry.register(ActionKind::Dummy, no_failures);
    let mut config = ValidatorsConfig::new();
    config.insert("dummy".into(), RuleConfig::new());
    let validator = registry.build(&config).unwrap();

    let ok = Action::Dummy(Dummy::new("ok", Duration::ZERO));
    let ko = Action::Dummy(Dummy::new("ko", Duration::ZERO).failing());
    assert!(validator.validate_action(&ok).is_empty());
    assert_eq!(validator.validate_action(&ko), vec!["ko is set up to fail".to_string()]);
}

#[test]
fn test_unknown_kind_in_config() {
    let mut config = ValidatorsConfig::new();
    config.insert("kubernetes".into(), RuleConfig::new());
    assert!(matches!(
        ValidatorRegistry::global().build(&config),
        Err(SchedulerError::InvalidArgument(_))
    ));
}

#[test]
fn test_submitted_composition_is_checked_end_to_end() {
    let validator = ValidatorRegistry::global()
        .build(&ValidatorRegistry::standard_config())
        .unwrap();
    let action: Action = serde_json::from_value(json!({"compose": {
        "version": "3",
        "services": {
            "db": {"image": "postgres", "volumes": ["./db:/var/lib/postgresql/data"]},
            "web": {"image": "nginx", "depends_on": ["db"], "privileged": true},
        },
    }}))
    .unwrap();
    let task = Task::new("alice", action);
    match validator.validate_task(&task) {
        Err(SchedulerError::Validation(errors)) => {
            assert_eq!(errors, vec!["the privileged config is not available".to_string()]);
        }
        other => panic!("expected a validation error, got {other:?}"),
    }
}

#[test]
fn test_main_service_resolution() {
    let compose: Compose = serde_json::from_value(json!({"services": {
        "db": {"image": "postgres"},
        "cache": {"image": "redis"},
        "web": {"image": "nginx", "depends_on": {"db": {}, "cache": {}}},
    }}))
    .unwrap();
    assert_eq!(compose.main_service().unwrap(), "web");

    let twins: Compose = serde_json::from_value(json!({"services": {
        "db": {"image": "postgres"},
        "a": {"image": "x", "depends_on": ["db"]},
        "b": {"image": "y", "depends_on": ["db"]},
    }}))
    .unwrap();
    assert!(matches!(twins.main_service(), Err(SchedulerError::Ambiguity(_))));

    let single: Compose = serde_json::from_value(json!({"services": {"only": {"image": "x"}}})).unwrap();
    assert_eq!(single.main_service().unwrap(), "only");
}
