//! Per-kind action validators and the registry building them.
//!
//! A validator returns every violation it finds; nothing short-circuits.
//! Compose rules are configured by name:
//!
//! - `VolumeInplace`: bind mounts must be relative (`./...`)
//! - `NoDotDot`: no path segment starting with `..`
//! - `NotAsDeep`: at most N path segments
//! - `No<Key>`: forbid a service key, e.g. `NoBuild`, `NoCapAdd`

use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

use serde_json::Value;

use crate::core::action::{Action, ActionKind, Compose};
use crate::core::task::Task;
use crate::core::SchedulerError;

/// Rule name to rule argument.
pub type RuleConfig = BTreeMap<String, Value>;

/// Configuration of every kind, keyed by registered name.
pub type ValidatorsConfig = BTreeMap<String, RuleConfig>;

/// Service keys a `No<Key>` rule may forbid.
pub const FORBIDDEN_KEYS: [&str; 12] = [
    "container_name",
    "cgroup_parent",
    "logging",
    "cap_add",
    "build",
    "domainname",
    "hostname",
    "ipc",
    "mac_address",
    "privileged",
    "stdin_open",
    "tty",
];

/// Depth limit of the standard rule set.
pub const STANDARD_DEPTH: u64 = 8;

/// Validator for one action kind.
pub trait ActionValidator: Send + Sync {
    /// Every violation found in `action`.
    fn validate_action(&self, action: &Action) -> Vec<String>;
}

/// Builds a validator from its rule configuration.
pub type ValidatorFactory =
    fn(&RuleConfig) -> Result<Box<dyn ActionValidator>, SchedulerError>;

/// `cap_add` → `CapAdd`.
pub fn snake_to_camel(text: &str) -> String {
    text.split('_')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            chars.next().map_or_else(String::new, |first| {
                first.to_uppercase().chain(chars).collect()
            })
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VolumeRule {
    Inplace,
    NoDotDot,
    NotAsDeep(usize),
}

impl VolumeRule {
    fn check(self, source: &str) -> Option<String> {
        match self {
            Self::Inplace if !source.starts_with("./") => {
                Some(format!("relative volume only: {source}"))
            }
            Self::NoDotDot if source.split('/').any(|slug| slug.starts_with("..")) => {
                Some(format!("path with ..: {source}"))
            }
            Self::NotAsDeep(deep) if source.split('/').count() > deep => {
                Some(format!("path is too deep {deep}: {source}"))
            }
            _ => None,
        }
    }
}

/// Rule-driven validator for compositions.
#[derive(Debug, Clone, Default)]
pub struct ComposeValidator {
    volume_rules: Vec<VolumeRule>,
    forbidden: Vec<&'static str>,
}

impl ComposeValidator {
    /// Build from rule names. Unknown rules are an invalid argument.
    pub fn from_config(config: &RuleConfig) -> Result<Self, SchedulerError> {
        let mut validator = Self::default();
        for (rule, argument) in config {
            match rule.as_str() {
                "VolumeInplace" => validator.volume_rules.push(VolumeRule::Inplace),
                "NoDotDot" => validator.volume_rules.push(VolumeRule::NoDotDot),
                "NotAsDeep" => {
                    let deep = argument
                        .as_u64()
                        .and_then(|d| usize::try_from(d).ok())
                        .ok_or_else(|| {
                            SchedulerError::InvalidArgument(format!(
                                "NotAsDeep argument must be an integer: {argument}"
                            ))
                        })?;
                    validator.volume_rules.push(VolumeRule::NotAsDeep(deep));
                }
                other => {
                    let key = other.strip_prefix("No").and_then(|camel| {
                        FORBIDDEN_KEYS
                            .iter()
                            .find(|key| snake_to_camel(key) == camel)
                            .copied()
                    });
                    match key {
                        Some(key) => validator.forbidden.push(key),
                        None => {
                            return Err(SchedulerError::InvalidArgument(format!(
                                "unknown validator rule: {other}"
                            )))
                        }
                    }
                }
            }
        }
        Ok(validator)
    }

    /// Every rule, with the standard depth limit.
    pub fn standard_rules() -> RuleConfig {
        let mut config = RuleConfig::new();
        config.insert("VolumeInplace".into(), Value::Null);
        config.insert("NoDotDot".into(), Value::Null);
        config.insert("NotAsDeep".into(), Value::from(STANDARD_DEPTH));
        for key in FORBIDDEN_KEYS {
            config.insert(format!("No{}", snake_to_camel(key)), Value::Null);
        }
        config
    }

    /// Violations of `compose`.
    pub fn validate(&self, compose: &Compose) -> Vec<String> {
        let mut errors = Vec::new();
        for (name, service) in &compose.services {
            let Some(fields) = service.as_object() else {
                errors.push(format!("service {name} must be an object"));
                continue;
            };
            for key in &self.forbidden {
                if fields.contains_key(*key) {
                    errors.push(format!("the {key} config is not available"));
                }
            }
            for mount in compose.volumes(name) {
                match mount {
                    Ok(mount) => {
                        if let Some(source) = &mount.source {
                            errors.extend(self.volume_rules.iter().filter_map(|r| r.check(source)));
                        }
                    }
                    Err(e) => errors.push(e),
                }
            }
        }
        errors
    }
}

impl ActionValidator for ComposeValidator {
    fn validate_action(&self, action: &Action) -> Vec<String> {
        match action {
            Action::Compose(compose) => self.validate(compose),
            other => vec![format!("compose validator got a {} action", other.kind())],
        }
    }
}

/// Accepts every dummy action.
#[derive(Debug, Clone, Copy, Default)]
pub struct DummyValidator;

impl ActionValidator for DummyValidator {
    fn validate_action(&self, action: &Action) -> Vec<String> {
        match action {
            Action::Dummy(_) => Vec::new(),
            other => vec![format!("dummy validator got a {} action", other.kind())],
        }
    }
}

fn compose_factory(config: &RuleConfig) -> Result<Box<dyn ActionValidator>, SchedulerError> {
    Ok(Box::new(ComposeValidator::from_config(config)?))
}

fn dummy_factory(_: &RuleConfig) -> Result<Box<dyn ActionValidator>, SchedulerError> {
    Ok(Box::new(DummyValidator))
}

static GLOBAL: LazyLock<ValidatorRegistry> = LazyLock::new(ValidatorRegistry::default);

/// Factories keyed by action kind.
#[derive(Clone)]
pub struct ValidatorRegistry {
    factories: HashMap<ActionKind, ValidatorFactory>,
}

impl std::fmt::Debug for ValidatorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidatorRegistry")
            .field("kinds", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for ValidatorRegistry {
    fn default() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register(ActionKind::Compose, compose_factory);
        registry.register(ActionKind::Dummy, dummy_factory);
        registry
    }
}

impl ValidatorRegistry {
    /// Process-wide registry with the built-in kinds.
    pub fn global() -> &'static Self {
        &GLOBAL
    }

    /// Register or replace the factory of `kind`.
    pub fn register(&mut self, kind: ActionKind, factory: ValidatorFactory) {
        self.factories.insert(kind, factory);
    }

    /// Standard configuration: all compose rules, dummy with no rules.
    pub fn standard_config() -> ValidatorsConfig {
        let mut config = ValidatorsConfig::new();
        config.insert(ActionKind::Compose.as_str().into(), ComposeValidator::standard_rules());
        config.insert(ActionKind::Dummy.as_str().into(), RuleConfig::new());
        config
    }

    /// Build a validator for every configured kind.
    pub fn build(&self, config: &ValidatorsConfig) -> Result<Validator, SchedulerError> {
        let mut validators = HashMap::new();
        for (name, rules) in config {
            let kind: ActionKind = name.parse()?;
            let factory = self.factories.get(&kind).ok_or_else(|| {
                SchedulerError::InvalidArgument(format!("no validator factory for {kind}"))
            })?;
            validators.insert(kind, factory(rules)?);
        }
        Ok(Validator { validators })
    }
}

/// Configured validators, one per kind.
pub struct Validator {
    validators: HashMap<ActionKind, Box<dyn ActionValidator>>,
}

impl std::fmt::Debug for Validator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Validator")
            .field("kinds", &self.validators.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Validator {
    /// The standard rule set from the global registry.
    pub fn standard() -> Result<Self, SchedulerError> {
        ValidatorRegistry::global().build(&ValidatorRegistry::standard_config())
    }

    /// Violations of `action` under its kind's rules.
    pub fn validate_action(&self, action: &Action) -> Vec<String> {
        match self.validators.get(&action.kind()) {
            Some(validator) => validator.validate_action(action),
            None => vec![format!("no config for {}", action.kind())],
        }
    }

    /// Full admission check of a submitted task.
    pub fn validate_task(&self, task: &Task) -> Result<(), SchedulerError> {
        task.validate()?;
        let action = task
            .action
            .as_ref()
            .ok_or_else(|| SchedulerError::Validation(vec!["task has no action".into()]))?;
        if let Err(err) = action.validate() {
            return Err(SchedulerError::Validation(err.messages()));
        }
        let errors = self.validate_action(action);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(SchedulerError::Validation(errors))
        }
    }
}
