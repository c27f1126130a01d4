//! Production rewrite of compositions: private network and project label.
//!
//! Each composition gets its own /24 from `172.18.0.0/16` to
//! `172.31.255.0/24`. The engine's live inventory tells which ones are
//! taken; the lowest free subnet wins, so holes are refilled first.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};

use crate::core::action::{Action, Compose};
use crate::core::orchestrator::exec;
use crate::core::SchedulerError;

static SUBNET_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^172\.(\d{1,3})\.(\d{1,3})\.0/24$").expect("subnet pattern compiles")
});

/// Label key stamped on services and networks.
pub const PROJECT_LABEL: &str = "batch";

/// A `172.a.b.0/24` subnet of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Subnet([u8; 2]);

impl Subnet {
    /// Lowest subnet of the pool.
    pub const FIRST: Self = Self([18, 0]);
    /// Highest subnet of the pool.
    pub const LAST: Self = Self([31, 255]);

    /// `172.a.b.0/24`, `a` within the pool.
    pub fn new(a: u8, b: u8) -> Result<Self, SchedulerError> {
        let subnet = Self([a, b]);
        if subnet < Self::FIRST || subnet > Self::LAST {
            return Err(SchedulerError::InvalidArgument(format!(
                "{subnet} is outside the pool"
            )));
        }
        Ok(subnet)
    }

    /// Second and third octets.
    pub const fn octets(self) -> [u8; 2] {
        self.0
    }

    /// Following subnet, failing past the end of the pool.
    pub fn next(self) -> Result<Self, SchedulerError> {
        if self >= Self::LAST {
            return Err(SchedulerError::ResourceCapacity(
                "no free subnet left in 172.18.0.0/16-172.31.255.0/24".into(),
            ));
        }
        let [a, b] = self.0;
        Ok(match b.checked_add(1) {
            Some(b) => Self([a, b]),
            None => Self([a + 1, 0]),
        })
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "172.{}.{}.0/24", self.0[0], self.0[1])
    }
}

impl FromStr for Subnet {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SchedulerError::InvalidArgument(format!("not a pool subnet: {s}"));
        let captures = SUBNET_PATTERN.captures(s).ok_or_else(invalid)?;
        let a: u8 = captures[1].parse().map_err(|_| invalid())?;
        let b: u8 = captures[2].parse().map_err(|_| invalid())?;
        Self::new(a, b)
    }
}

/// Subnets already taken.
#[derive(Debug, Clone, Default)]
pub struct SubnetPool {
    taken: BTreeSet<Subnet>,
}

impl FromIterator<Subnet> for SubnetPool {
    fn from_iter<I: IntoIterator<Item = Subnet>>(iter: I) -> Self {
        Self {
            taken: iter.into_iter().collect(),
        }
    }
}

impl SubnetPool {
    /// Mark `subnet` as taken. Returns `false` if it already was.
    pub fn insert(&mut self, subnet: Subnet) -> bool {
        self.taken.insert(subnet)
    }

    /// Free `subnet`.
    pub fn remove(&mut self, subnet: Subnet) -> bool {
        self.taken.remove(&subnet)
    }

    /// Lowest subnet not taken.
    pub fn next_free(&self) -> Result<Subnet, SchedulerError> {
        let mut candidate = Subnet::FIRST;
        for taken in &self.taken {
            match taken.cmp(&candidate) {
                std::cmp::Ordering::Less => {}
                std::cmp::Ordering::Equal => candidate = candidate.next()?,
                std::cmp::Ordering::Greater => break,
            }
        }
        Ok(candidate)
    }
}

/// Networks known to the container engine.
#[async_trait]
pub trait NetworkInventory: Send + Sync {
    /// Pool subnets used by existing networks.
    async fn subnets(&self) -> Result<Vec<Subnet>, SchedulerError>;

    /// Create a bridge network.
    async fn create(
        &self,
        name: &str,
        subnet: Subnet,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), SchedulerError>;

    /// Remove a network.
    async fn remove(&self, name: &str) -> Result<(), SchedulerError>;
}

/// Inventory backed by the `docker` CLI.
#[derive(Debug, Clone)]
pub struct DockerInventory {
    docker_bin: String,
}

impl DockerInventory {
    /// Use `docker_bin` for every call.
    pub fn new(docker_bin: impl Into<String>) -> Self {
        Self {
            docker_bin: docker_bin.into(),
        }
    }
}

/// Pool subnets found in `docker network inspect` output.
pub fn subnets_from_inspect(raw: &[u8]) -> Result<Vec<Subnet>, SchedulerError> {
    let networks: Vec<Value> = serde_json::from_slice(raw)?;
    Ok(networks
        .iter()
        .filter_map(|n| n.pointer("/IPAM/Config").and_then(Value::as_array))
        .flatten()
        .filter_map(|config| config.get("Subnet").and_then(Value::as_str))
        .filter_map(|subnet| subnet.parse().ok())
        .collect())
}

#[async_trait]
impl NetworkInventory for DockerInventory {
    async fn subnets(&self) -> Result<Vec<Subnet>, SchedulerError> {
        let listed = exec(
            &self.docker_bin,
            &["network", "ls", "--filter", "driver=bridge", "--format", "{{.Name}}"],
            None,
        )
        .await?;
        let names: Vec<String> = String::from_utf8_lossy(&listed.stdout)
            .lines()
            .map(str::trim)
            .filter(|name| !name.is_empty() && *name != "bridge")
            .map(str::to_string)
            .collect();
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let mut args = vec!["network", "inspect"];
        args.extend(names.iter().map(String::as_str));
        let inspected = exec(&self.docker_bin, &args, None).await?;
        subnets_from_inspect(&inspected.stdout)
    }

    async fn create(
        &self,
        name: &str,
        subnet: Subnet,
        labels: &BTreeMap<String, String>,
    ) -> Result<(), SchedulerError> {
        let subnet = subnet.to_string();
        let labels: Vec<String> = labels.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let mut args = vec!["network", "create", "--driver", "bridge", "--attachable", "--subnet", subnet.as_str()];
        for label in &labels {
            args.push("--label");
            args.push(label);
        }
        args.push(name);
        exec(&self.docker_bin, &args, None).await.map(|_| ())
    }

    async fn remove(&self, name: &str) -> Result<(), SchedulerError> {
        exec(&self.docker_bin, &["network", "rm", name], None)
            .await
            .map(|_| ())
    }
}

/// Rewrites compositions for production.
pub struct Recomposator {
    inventory: Arc<dyn NetworkInventory>,
    project: String,
    allocation: tokio::sync::Mutex<()>,
}

impl fmt::Debug for Recomposator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Recomposator")
            .field("project", &self.project)
            .finish_non_exhaustive()
    }
}

/// Production form of an action plus the network created for it.
#[derive(Debug, Clone)]
pub struct Recomposed {
    /// Rewritten action.
    pub action: Action,
    /// Network to remove on teardown.
    pub network: Option<String>,
}

impl Recomposator {
    /// Recomposator labelling with `project`.
    pub fn new(inventory: Arc<dyn NetworkInventory>, project: impl Into<String>) -> Self {
        Self {
            inventory,
            project: project.into(),
            allocation: tokio::sync::Mutex::new(()),
        }
    }

    /// Project label value.
    pub fn project(&self) -> &str {
        &self.project
    }

    /// Network name for `subnet`.
    pub fn network_name(&self, subnet: Subnet) -> String {
        let [a, b] = subnet.octets();
        format!("batch-{}-{a}-{b}", self.project)
    }

    /// Allocate a network and rewrite `compose` onto it.
    pub async fn recompose(&self, compose: &Compose) -> Result<(Compose, String), SchedulerError> {
        let network = {
            let _allocating = self.allocation.lock().await;
            let pool: SubnetPool = self.inventory.subnets().await?.into_iter().collect();
            let subnet = pool.next_free()?;
            let network = self.network_name(subnet);
            let labels = BTreeMap::from([(PROJECT_LABEL.to_string(), self.project.clone())]);
            self.inventory.create(&network, subnet, &labels).await?;
            tracing::info!(network = %network, subnet = %subnet, "allocated network");
            network
        };

        let mut production = compose.clone();
        production.networks.insert(
            "default".to_string(),
            json!({"external": true, "name": network}),
        );
        for service in production.services.values_mut() {
            stamp_label(service, &self.project);
        }
        Ok((production, network))
    }

    /// Production form of any action; only compositions change.
    pub async fn recompose_action(&self, action: &Action) -> Result<Recomposed, SchedulerError> {
        match action {
            Action::Compose(compose) => {
                let (production, network) = self.recompose(compose).await?;
                Ok(Recomposed {
                    action: Action::Compose(production),
                    network: Some(network),
                })
            }
            other => Ok(Recomposed {
                action: other.clone(),
                network: None,
            }),
        }
    }

    /// Remove a network created by [`Self::recompose`].
    pub async fn release(&self, network: &str) -> Result<(), SchedulerError> {
        self.inventory.remove(network).await
    }
}

fn stamp_label(service: &mut Value, project: &str) {
    let Some(fields) = service.as_object_mut() else {
        return;
    };
    let labels = fields
        .entry("labels")
        .or_insert_with(|| Value::Object(serde_json::Map::new()));
    match labels {
        Value::Object(map) => {
            map.insert(PROJECT_LABEL.to_string(), Value::from(project));
        }
        Value::Array(items) => {
            let prefix = format!("{PROJECT_LABEL}=");
            items.retain(|item| !item.as_str().is_some_and(|s| s.starts_with(&prefix)));
            items.push(Value::from(format!("{prefix}{project}")));
        }
        other => {
            let mut map = serde_json::Map::new();
            map.insert(PROJECT_LABEL.to_string(), Value::from(project));
            *other = Value::Object(map);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct FakeInventory {
        networks: Mutex<BTreeMap<String, Subnet>>,
    }

    #[async_trait]
    impl NetworkInventory for FakeInventory {
        async fn subnets(&self) -> Result<Vec<Subnet>, SchedulerError> {
            Ok(self.networks.lock().values().copied().collect())
        }

        async fn create(
            &self,
            name: &str,
            subnet: Subnet,
            _labels: &BTreeMap<String, String>,
        ) -> Result<(), SchedulerError> {
            self.networks.lock().insert(name.to_string(), subnet);
            Ok(())
        }

        async fn remove(&self, name: &str) -> Result<(), SchedulerError> {
            self.networks.lock().remove(name);
            Ok(())
        }
    }

    #[test]
    fn subnet_walks_the_pool() {
        assert_eq!(Subnet::FIRST.to_string(), "172.18.0.0/24");
        assert_eq!(Subnet::new(18, 255).unwrap().next().unwrap(), Subnet::new(19, 0).unwrap());
        assert!(matches!(
            Subnet::LAST.next(),
            Err(SchedulerError::ResourceCapacity(_))
        ));
        assert!(Subnet::new(17, 0).is_err());
        assert!(Subnet::new(32, 0).is_err());
    }

    #[test]
    fn subnet_parses_inspect_strings() {
        assert_eq!("172.20.3.0/24".parse::<Subnet>().unwrap(), Subnet::new(20, 3).unwrap());
        assert!("172.17.0.0/16".parse::<Subnet>().is_err());
        assert!("10.0.0.0/24".parse::<Subnet>().is_err());
        assert!("172.300.1.0/24".parse::<Subnet>().is_err());
    }

    #[test]
    fn pool_fills_holes_first() {
        let mut pool: SubnetPool = [Subnet::new(18, 0).unwrap(), Subnet::new(18, 2).unwrap()]
            .into_iter()
            .collect();
        assert_eq!(pool.next_free().unwrap(), Subnet::new(18, 1).unwrap());
        pool.insert(Subnet::new(18, 1).unwrap());
        assert_eq!(pool.next_free().unwrap(), Subnet::new(18, 3).unwrap());
        pool.remove(Subnet::FIRST);
        assert_eq!(pool.next_free().unwrap(), Subnet::FIRST);
    }

    #[test]
    fn exhausted_pool_is_capacity_error() {
        let mut pool = SubnetPool::default();
        let mut subnet = Subnet::FIRST;
        loop {
            pool.insert(subnet);
            match subnet.next() {
                Ok(next) => subnet = next,
                Err(_) => break,
            }
        }
        assert!(matches!(pool.next_free(), Err(SchedulerError::ResourceCapacity(_))));
    }

    #[test]
    fn inspect_output_is_filtered() {
        let raw = br#"[
            {"Name": "a", "IPAM": {"Config": [{"Subnet": "172.18.0.0/24"}]}},
            {"Name": "b", "IPAM": {"Config": [{"Subnet": "192.168.0.0/24"}]}},
            {"Name": "c", "IPAM": {"Config": []}}
        ]"#;
        assert_eq!(subnets_from_inspect(raw).unwrap(), vec![Subnet::FIRST]);
    }

    #[tokio::test]
    async fn recompose_binds_network_and_labels() {
        let inventory = Arc::new(FakeInventory::default());
        let recomposator = Recomposator::new(inventory.clone(), "demo");
        let compose: Compose = serde_json::from_value(json!({
            "services": {
                "web": {"image": "nginx", "labels": ["team=infra", "batch=old"]},
                "db": {"image": "postgres", "labels": {"tier": "data"}},
                "job": {"image": "busybox"},
            }
        }))
        .unwrap();

        let (first, network) = recomposator.recompose(&compose).await.unwrap();
        assert_eq!(network, "batch-demo-18-0");
        assert_eq!(first.networks["default"]["name"], "batch-demo-18-0");
        assert_eq!(first.networks["default"]["external"], true);
        assert_eq!(first.services["web"]["labels"], json!(["team=infra", "batch=demo"]));
        assert_eq!(first.services["db"]["labels"]["batch"], "demo");
        assert_eq!(first.services["job"]["labels"]["batch"], "demo");

        let (_, second) = recomposator.recompose(&compose).await.unwrap();
        assert_eq!(second, "batch-demo-18-1");

        recomposator.release(&network).await.unwrap();
        let (_, third) = recomposator.recompose(&compose).await.unwrap();
        assert_eq!(third, "batch-demo-18-0");
    }
}
