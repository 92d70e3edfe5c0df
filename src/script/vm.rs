//! VM install/teardown state machine.

use std::time::Duration;

use tracing::{info, warn};

use crate::actions::ActionCall;
use crate::engine::{Command, ExecContext};
use crate::error::{Error, Result};
use crate::poll::{Poll, Spinner};
use crate::script::{resolve_config, Lifecycle, ScriptDef, Validation, BOOT_POLL, SHUTDOWN_POLL};

/// The VM provisioning sub-script (`<script>#vm`).
///
/// Apply installs the VM with virt-install and waits for it to report
/// running; revert shuts it down (escalating to a hard kill) and
/// undefines it. Both directions tolerate finding the work already done.
#[derive(Clone)]
pub struct VmScript {
    full_name: String,
    def: ScriptDef,
    /// Boot confirmation budget. Exhausting it is tolerated: the install
    /// command's own exit status already vouched for the installation.
    pub boot_poll: Poll,
    /// Shutdown convergence budget before escalating to kill.
    pub shutdown_poll: Poll,
    /// Settle time after a hard kill.
    pub kill_wait: Duration,
}

impl VmScript {
    pub fn new(def: ScriptDef) -> Self {
        Self {
            full_name: format!("{}#vm", def.name),
            def,
            boot_poll: BOOT_POLL,
            shutdown_poll: SHUTDOWN_POLL,
            kill_wait: Duration::from_secs(1),
        }
    }

    pub(crate) fn set_def(&mut self, def: ScriptDef) {
        self.full_name = format!("{}#vm", def.name);
        self.def = def;
    }
}

impl Lifecycle for VmScript {
    fn name(&self) -> &str {
        &self.full_name
    }

    /// Resolve configuration, check for inventory name collisions on the
    /// apply path, and report whether the VM is already running.
    fn validate(&self, ctx: &mut ExecContext<'_>) -> Result<Validation> {
        let spec = resolve_config(ctx, &self.def)?;

        if ctx.command == Command::Apply && !spec.no_node {
            if let Some(kind) = ctx.inventory.find(&spec.name) {
                return Err(Error::Conflict {
                    name: spec.name.clone(),
                    kind,
                });
            }
        }

        let autostart = ctx.command == Command::Apply && spec.autostart;
        let running = ctx
            .trigger(ActionCall::Verify {
                vm: &spec.name,
                running: true,
                autostart,
            })?
            .verified();
        Ok(if running {
            Validation::Satisfied
        } else {
            Validation::Pending
        })
    }

    fn apply(&self, ctx: &mut ExecContext<'_>) -> Result<()> {
        let spec = resolve_config(ctx, &self.def)?;
        let image = spec.image.as_deref().ok_or_else(|| {
            Error::Configuration(format!("VM {} has no disk image configured", spec.name))
        })?;
        if !ctx.target.file_exists(image)? {
            return Err(Error::Precondition(image.to_string()));
        }

        info!(vm = %spec.name, image, "installing VM");
        ctx.trigger(ActionCall::Install { spec: &spec })?;

        let booted = self.boot_poll.run(|_| {
            let verified = ctx
                .trigger(ActionCall::Verify {
                    vm: &spec.name,
                    running: true,
                    autostart: spec.autostart,
                })?
                .verified();
            Ok(verified.then_some(()))
        })?;
        if !booted.is_ready() {
            // Tolerated: installation already succeeded, the VM is just
            // slow to report running.
            warn!(vm = %spec.name, "VM did not confirm running state within the boot budget");
        }
        Ok(())
    }

    fn revert(&self, ctx: &mut ExecContext<'_>) -> Result<()> {
        let spec = resolve_config(ctx, &self.def)?;
        let vm = spec.name.as_str();

        let running = ctx
            .trigger(ActionCall::Verify {
                vm,
                running: true,
                autostart: false,
            })?
            .verified();
        if running {
            ctx.trigger(ActionCall::Shutdown { vm })?;
            let mut spinner =
                Spinner::start(&format!("Waiting for shutdown of VM {vm}. Please wait"));
            let stopped = self.shutdown_poll.run(|attempt| {
                spinner.tick(attempt);
                let still_running = ctx
                    .trigger(ActionCall::Verify {
                        vm,
                        running: true,
                        autostart: false,
                    })?
                    .verified();
                Ok((!still_running).then_some(()))
            })?;
            if !stopped.is_ready() {
                warn!(vm, "VM still running after shutdown budget, killing it");
                ctx.trigger(ActionCall::Kill { vm })?;
                std::thread::sleep(self.kill_wait);
            }
            spinner.finish();
        }

        // Idempotent: a concurrent removal leaves nothing to undefine.
        let defined = ctx
            .trigger(ActionCall::Verify {
                vm,
                running: false,
                autostart: false,
            })?
            .verified();
        if defined {
            ctx.trigger(ActionCall::Delete { vm })?;
            info!(vm, "VM removed");
        }
        Ok(())
    }
}
