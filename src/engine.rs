//! Boundary to the orchestration engine.
//!
//! The engine owns remote transport, the inventory store and discovery
//! probing; the scripts in this crate only see the narrow traits below.
//! An [`ExecContext`] bundles the per-execution handles together with the
//! resolved-configuration cache.

use std::sync::Arc;

use crate::actions::{ActionCall, ActionRegistry, ActionResult};
use crate::config::schema::VmSpec;
use crate::config::ConfigMap;
use crate::error::{EntityKind, Result};
use crate::script::Lifecycle;

/// Which top-level command is being executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Apply,
    Revert,
}

/// A remote target the engine runs commands on.
pub trait Target {
    /// Target node name (used for generated VM names and log messages).
    fn name(&self) -> &str;

    /// Run a command with elevated privileges, capturing stdout.
    fn sudo(&mut self, cmd: &str) -> anyhow::Result<String>;

    /// Check whether a file exists on the target.
    fn file_exists(&mut self, path: &str) -> anyhow::Result<bool>;
}

/// Attributes of a managed host to be registered in the inventory.
#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub name: String,
    pub host: String,
    pub user: Option<String>,
    /// Opaque `vbox` metadata blob: the resolved VM configuration minus
    /// control flags.
    pub attrs: serde_json::Value,
}

impl std::fmt::Display for NodeRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.user {
            Some(user) => write!(f, "{}({}@{})", self.name, user, self.host),
            None => write!(f, "{}({})", self.name, self.host),
        }
    }
}

/// The external store of managed hosts and groups.
pub trait Inventory {
    /// Look up an entity by name, distinguishing nodes from groups.
    fn find(&self, name: &str) -> Option<EntityKind>;

    fn register(&mut self, node: NodeRecord) -> anyhow::Result<()>;

    fn create_group(&mut self, name: &str) -> anyhow::Result<()>;

    fn add_to_group(&mut self, node: &str, group: &str) -> anyhow::Result<()>;

    fn deregister(&mut self, name: &str) -> anyhow::Result<()>;

    /// Persist the store. Called after every mutating step so a crash
    /// mid-sequence leaves a well-defined intermediate state.
    fn save(&mut self) -> anyhow::Result<()>;
}

/// Host-discovery probe run against freshly registered nodes.
pub trait Sniffer {
    fn run(&mut self, node: &NodeRecord) -> anyhow::Result<()>;

    /// Re-establish the management connection between retry attempts.
    fn reconnect(&mut self) -> anyhow::Result<()>;
}

/// Registry the engine exposes for named scripts.
pub trait ScriptRegistry {
    fn add_script(&mut self, name: &str, script: Box<dyn Lifecycle>);
}

/// Per-execution state: the command being run, the engine handles, and the
/// configuration snapshot once resolved.
pub struct ExecContext<'a> {
    pub command: Command,
    pub target: &'a mut dyn Target,
    pub inventory: &'a mut dyn Inventory,
    pub sniffer: Option<&'a mut dyn Sniffer>,
    actions: ActionRegistry,
    overrides: Option<ConfigMap>,
    resolved: Option<Arc<VmSpec>>,
}

impl<'a> ExecContext<'a> {
    pub fn new(
        command: Command,
        target: &'a mut dyn Target,
        inventory: &'a mut dyn Inventory,
    ) -> Self {
        Self {
            command,
            target,
            inventory,
            sniffer: None,
            actions: ActionRegistry::builtin(),
            overrides: None,
            resolved: None,
        }
    }

    pub fn with_sniffer(mut self, sniffer: &'a mut dyn Sniffer) -> Self {
        self.sniffer = Some(sniffer);
        self
    }

    /// Execution-context configuration override, merged over the script's
    /// declared configuration at resolution time.
    pub fn with_overrides(mut self, overrides: ConfigMap) -> Self {
        self.overrides = Some(overrides);
        self
    }

    pub fn overrides(&self) -> Option<&ConfigMap> {
        self.overrides.as_ref()
    }

    /// The configuration snapshot, if this execution has resolved one.
    pub fn resolved(&self) -> Option<Arc<VmSpec>> {
        self.resolved.clone()
    }

    /// Install the resolved snapshot. The first resolution wins; later
    /// calls in the same execution keep the cached snapshot.
    pub fn cache_resolved(&mut self, spec: Arc<VmSpec>) {
        if self.resolved.is_none() {
            self.resolved = Some(spec);
        }
    }

    /// Invoke a named action synchronously against this execution's target.
    pub fn trigger(&mut self, call: ActionCall<'_>) -> Result<ActionResult> {
        self.actions.trigger(&call, self.target)
    }
}
