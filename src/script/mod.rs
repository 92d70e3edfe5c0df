//! Script lifecycle contract and the top-level VM provisioning script.
//!
//! A script exposes three phases to the orchestration engine: validate,
//! apply and revert. The engine runs validate for every script in the
//! plan first, then the apply or revert phases in plan order. `VBoxScript`
//! owns the two sub-scripts doing the real work and keeps them ordered:
//! the VM must exist before its node entry, and caller-declared
//! dependencies must never wait on the pair during teardown.

pub mod node;
pub mod vm;

use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::config::resolver::{self, ConfigureFn, ResolveCtx};
use crate::config::schema::VmSpec;
use crate::config::ConfigMap;
use crate::engine::{Command, ExecContext, ScriptRegistry};
use crate::error::Result;
use crate::poll::Poll;

pub use node::NodeScript;
pub use vm::VmScript;

/// Outcome of a validate phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validation {
    /// The resource is already in its desired state; apply is skipped.
    Satisfied,
    /// The resource needs work.
    Pending,
    /// The script is suppressed for this execution; neither apply nor
    /// revert may proceed.
    Suppressed,
}

/// The validate/apply/revert contract scripts expose to the engine.
pub trait Lifecycle {
    fn name(&self) -> &str;

    fn validate(&self, ctx: &mut ExecContext<'_>) -> Result<Validation>;

    fn apply(&self, ctx: &mut ExecContext<'_>) -> Result<()>;

    fn revert(&self, ctx: &mut ExecContext<'_>) -> Result<()>;
}

/// Shared definition of a VM script: its name, declared configuration and
/// optional configure hook.
#[derive(Clone)]
pub struct ScriptDef {
    pub name: String,
    pub config: ConfigMap,
    pub configure: Option<ConfigureFn>,
}

/// Resolve the script's configuration, at most once per execution. A
/// second call within the same execution returns the cached snapshot.
pub(crate) fn resolve_config(ctx: &mut ExecContext<'_>, def: &ScriptDef) -> Result<Arc<VmSpec>> {
    if let Some(spec) = ctx.resolved() {
        return Ok(spec);
    }
    let spec = Arc::new(resolver::resolve(
        &def.name,
        &def.config,
        ctx.overrides(),
        def.configure.as_ref(),
        ctx.command,
        ctx.target.name(),
    )?);
    ctx.cache_resolved(spec.clone());
    Ok(spec)
}

/// Top-level VM provisioning script: a VM install sub-script, a node
/// registration sub-script, and any caller-declared dependencies.
pub struct VBoxScript {
    def: ScriptDef,
    vm: VmScript,
    node: NodeScript,
    dependencies: Vec<Box<dyn Lifecycle>>,
}

impl VBoxScript {
    pub fn new(name: impl Into<String>) -> Self {
        let def = ScriptDef {
            name: name.into(),
            config: ConfigMap::new(),
            configure: None,
        };
        Self {
            vm: VmScript::new(def.clone()),
            node: NodeScript::new(def.clone()),
            def,
            dependencies: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.def.name
    }

    /// Declare the script's base configuration.
    pub fn configuration(mut self, config: ConfigMap) -> Self {
        self.def.config = config;
        self.sync_def();
        self
    }

    /// Hook run after defaults are applied but before name generation.
    pub fn configure(
        mut self,
        f: impl Fn(&mut ConfigMap, &ResolveCtx<'_>) -> Result<()> + 'static,
    ) -> Self {
        self.def.configure = Some(Rc::new(f));
        self.sync_def();
        self
    }

    /// Add a caller-declared dependency script.
    pub fn dependency(mut self, dep: Box<dyn Lifecycle>) -> Self {
        self.dependencies.push(dep);
        self
    }

    fn sync_def(&mut self) {
        self.vm.set_def(self.def.clone());
        self.node.set_def(self.def.clone());
    }

    /// Poll/retry budget tuning on the VM sub-script.
    pub fn vm_mut(&mut self) -> &mut VmScript {
        &mut self.vm
    }

    /// Poll/retry budget tuning on the node sub-script.
    pub fn node_mut(&mut self) -> &mut NodeScript {
        &mut self.node
    }

    /// Publish the two sub-scripts under the engine's registry.
    pub fn register(&self, registry: &mut dyn ScriptRegistry) {
        registry.add_script(&format!("{}#vm", self.def.name), Box::new(self.vm.clone()));
        registry.add_script(
            &format!("{}#node", self.def.name),
            Box::new(self.node.clone()),
        );
    }

    /// Phase execution order. Provisioning runs the VM install before the
    /// node registration and both before caller-declared dependencies;
    /// teardown reverses the priority so dependency reverts are never
    /// blocked by the pair.
    pub fn plan(&self, command: Command) -> Vec<&dyn Lifecycle> {
        let deps = self.dependencies.iter().map(|d| d.as_ref());
        match command {
            Command::Apply => [&self.vm as &dyn Lifecycle, &self.node]
                .into_iter()
                .chain(deps)
                .collect(),
            Command::Revert => deps
                .chain([&self.node as &dyn Lifecycle, &self.vm])
                .collect(),
        }
    }

    /// Run the apply command: validate everything in plan order, then
    /// apply the scripts still pending.
    pub fn run_apply(&self, ctx: &mut ExecContext<'_>) -> Result<()> {
        ctx.command = Command::Apply;
        let plan = self.plan(Command::Apply);
        let mut validations = Vec::with_capacity(plan.len());
        for script in &plan {
            validations.push(script.validate(ctx)?);
        }
        for (script, validation) in plan.iter().zip(validations) {
            match validation {
                Validation::Pending => script.apply(ctx)?,
                Validation::Satisfied => {
                    debug!(script = script.name(), "already in desired state, apply skipped");
                }
                Validation::Suppressed => {
                    debug!(script = script.name(), "suppressed, apply skipped");
                }
            }
        }
        Ok(())
    }

    /// Run the revert command: validate everything, then revert in plan
    /// order. Revert runs regardless of the resource's current state
    /// (each revert phase is individually idempotent); only suppression
    /// blocks it.
    pub fn run_revert(&self, ctx: &mut ExecContext<'_>) -> Result<()> {
        ctx.command = Command::Revert;
        let plan = self.plan(Command::Revert);
        let mut validations = Vec::with_capacity(plan.len());
        for script in &plan {
            validations.push(script.validate(ctx)?);
        }
        for (script, validation) in plan.iter().zip(validations) {
            match validation {
                Validation::Suppressed => {
                    debug!(script = script.name(), "suppressed, revert skipped");
                }
                _ => script.revert(ctx)?,
            }
        }
        Ok(())
    }
}

/// Default VM boot confirmation budget: 10 attempts, 1 s apart.
pub(crate) const BOOT_POLL: Poll = Poll::new(10, Duration::from_secs(1));
/// Default shutdown convergence budget: 30 attempts, 1 s apart.
pub(crate) const SHUTDOWN_POLL: Poll = Poll::new(30, Duration::from_secs(1));
/// Default address discovery budget: 150 attempts, 2 s apart (~5 min).
pub(crate) const ADDR_POLL: Poll = Poll::new(150, Duration::from_secs(2));

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_orders_vm_before_node_on_apply() {
        let script = VBoxScript::new("web");
        let names: Vec<&str> = script
            .plan(Command::Apply)
            .iter()
            .map(|s| s.name())
            .collect();
        assert_eq!(names, vec!["web#vm", "web#node"]);
    }

    #[test]
    fn test_plan_reverses_priority_on_revert() {
        let script = VBoxScript::new("web");
        let names: Vec<&str> = script
            .plan(Command::Revert)
            .iter()
            .map(|s| s.name())
            .collect();
        assert_eq!(names, vec!["web#node", "web#vm"]);
    }

    #[test]
    fn test_caller_dependencies_come_last_on_apply_first_on_revert() {
        struct Dep;
        impl Lifecycle for Dep {
            fn name(&self) -> &str {
                "post-install"
            }
            fn validate(&self, _ctx: &mut ExecContext<'_>) -> Result<Validation> {
                Ok(Validation::Pending)
            }
            fn apply(&self, _ctx: &mut ExecContext<'_>) -> Result<()> {
                Ok(())
            }
            fn revert(&self, _ctx: &mut ExecContext<'_>) -> Result<()> {
                Ok(())
            }
        }

        let script = VBoxScript::new("web").dependency(Box::new(Dep));
        let apply: Vec<&str> = script
            .plan(Command::Apply)
            .iter()
            .map(|s| s.name())
            .collect();
        assert_eq!(apply, vec!["web#vm", "web#node", "post-install"]);
        let revert: Vec<&str> = script
            .plan(Command::Revert)
            .iter()
            .map(|s| s.name())
            .collect();
        assert_eq!(revert, vec!["post-install", "web#node", "web#vm"]);
    }
}
