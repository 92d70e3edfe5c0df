//! Node registration state machine.
//!
//! Registers the freshly installed VM as a managed inventory node once
//! its network address can be discovered, and removes the entry again on
//! teardown. Registration is suppressed entirely by `no-node`.

use std::time::Duration;

use tracing::{info, warn};

use crate::actions::{ActionCall, IfAddr};
use crate::engine::{ExecContext, NodeRecord};
use crate::error::{EntityKind, Error, Result};
use crate::poll::{Poll, Spinner};
use crate::script::{resolve_config, Lifecycle, ScriptDef, Validation, ADDR_POLL};

/// The node registration sub-script (`<script>#node`).
#[derive(Clone)]
pub struct NodeScript {
    full_name: String,
    def: ScriptDef,
    /// Address discovery budget. Exhausting it is fatal: without an
    /// address there is no node to register.
    pub addr_poll: Poll,
    /// Discovery probe attempts; only the final failure propagates.
    pub sniff_attempts: u32,
    /// Delay between probe attempts.
    pub sniff_backoff: Duration,
}

impl NodeScript {
    pub fn new(def: ScriptDef) -> Self {
        Self {
            full_name: format!("{}#node", def.name),
            def,
            addr_poll: ADDR_POLL,
            sniff_attempts: 2,
            sniff_backoff: Duration::from_secs(1),
        }
    }

    pub(crate) fn set_def(&mut self, def: ScriptDef) {
        self.full_name = format!("{}#node", def.name);
        self.def = def;
    }

    fn sniff(&self, ctx: &mut ExecContext<'_>, record: &NodeRecord) -> Result<()> {
        let Some(sniffer) = ctx.sniffer.as_mut() else {
            return Ok(());
        };
        for attempt in 0..self.sniff_attempts {
            match sniffer.run(record) {
                Ok(()) => return Ok(()),
                Err(err) if attempt + 1 == self.sniff_attempts => return Err(err.into()),
                Err(err) => {
                    warn!(node = %record, %err, "discovery probe failed, retrying");
                    std::thread::sleep(self.sniff_backoff);
                    sniffer.reconnect()?;
                }
            }
        }
        Ok(())
    }
}

impl Lifecycle for NodeScript {
    fn name(&self) -> &str {
        &self.full_name
    }

    fn validate(&self, ctx: &mut ExecContext<'_>) -> Result<Validation> {
        let spec = resolve_config(ctx, &self.def)?;
        if spec.no_node {
            return Ok(Validation::Suppressed);
        }
        match ctx.inventory.find(&spec.name) {
            Some(EntityKind::Group) => Err(Error::Conflict {
                name: spec.name.clone(),
                kind: EntityKind::Group,
            }),
            Some(EntityKind::Node) => {
                info!(node = %spec.name, "node already registered");
                Ok(Validation::Satisfied)
            }
            None => Ok(Validation::Pending),
        }
    }

    fn apply(&self, ctx: &mut ExecContext<'_>) -> Result<()> {
        let spec = resolve_config(ctx, &self.def)?;
        if spec.no_node {
            return Ok(());
        }
        let vm = spec.name.as_str();

        let mut spinner =
            Spinner::start(&format!("Determining IP address for VM {vm}. Please wait"));
        let outcome = self.addr_poll.run(|attempt| {
            spinner.tick(attempt);
            Ok(ctx.trigger(ActionCall::IfAddr { vm })?.ifaddr())
        })?;
        spinner.finish();
        let IfAddr { mac, addr } = match outcome.into_ready() {
            Some(found) => found,
            None => return Err(Error::DiscoveryTimeout(vm.to_string())),
        };
        info!(vm, %mac, %addr, "discovered VM address");

        let record = NodeRecord {
            name: spec.name.clone(),
            host: spec.node.host.clone().unwrap_or(addr),
            user: spec.node.user.clone().or_else(|| spec.user.clone()),
            attrs: spec.vbox_attrs(),
        };
        ctx.inventory.register(record.clone())?;
        ctx.inventory.save()?;

        for group in &spec.node.groups {
            match ctx.inventory.find(group) {
                Some(EntityKind::Node) => {
                    return Err(Error::Conflict {
                        name: group.clone(),
                        kind: EntityKind::Node,
                    })
                }
                Some(EntityKind::Group) => {}
                None => ctx.inventory.create_group(group)?,
            }
            ctx.inventory.add_to_group(&spec.name, group)?;
            ctx.inventory.save()?;
        }

        if !spec.no_sniff {
            self.sniff(ctx, &record)?;
            ctx.inventory.save()?;
        }
        info!(node = %record, "added new node");
        Ok(())
    }

    fn revert(&self, ctx: &mut ExecContext<'_>) -> Result<()> {
        let spec = resolve_config(ctx, &self.def)?;
        if spec.no_node {
            return Ok(());
        }
        match ctx.inventory.find(&spec.name) {
            Some(EntityKind::Node) => {
                ctx.inventory.deregister(&spec.name)?;
                ctx.inventory.save()?;
                info!(node = %spec.name, "removed node");
            }
            _ => warn!(node = %spec.name, "no existing node found"),
        }
        Ok(())
    }
}
