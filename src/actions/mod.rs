//! Named remote actions wrapping the hypervisor CLI.
//!
//! Each action builds one command string, runs it with elevated privileges
//! on the target and parses the text output into a structured result.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::config::schema::{Cdrom, NetworkMode, VmSpec};
use crate::engine::Target;
use crate::error::{Error, Result};

/// MAC address and IP address of a VM interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfAddr {
    pub mac: String,
    pub addr: String,
}

/// An action invocation with its arguments.
#[derive(Debug, Clone, Copy)]
pub enum ActionCall<'a> {
    Shutdown { vm: &'a str },
    Kill { vm: &'a str },
    Start { vm: &'a str },
    Verify { vm: &'a str, running: bool, autostart: bool },
    Delete { vm: &'a str },
    IfAddr { vm: &'a str },
    Install { spec: &'a VmSpec },
}

impl ActionCall<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            ActionCall::Shutdown { .. } => "vm-shutdown",
            ActionCall::Kill { .. } => "vm-kill",
            ActionCall::Start { .. } => "vm-start",
            ActionCall::Verify { .. } => "vm-verify",
            ActionCall::Delete { .. } => "vm-delete",
            ActionCall::IfAddr { .. } => "vm-ifaddr",
            ActionCall::Install { .. } => "vm-install",
        }
    }
}

/// Structured outcome of a remote action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionResult {
    Done,
    Verified(bool),
    IfAddr(Option<IfAddr>),
}

impl ActionResult {
    /// Unwrap a verify result; any other result counts as not verified.
    pub fn verified(&self) -> bool {
        matches!(self, ActionResult::Verified(true))
    }

    pub fn ifaddr(self) -> Option<IfAddr> {
        match self {
            ActionResult::IfAddr(addr) => addr,
            _ => None,
        }
    }
}

type Handler = fn(&mut dyn Target, &ActionCall<'_>) -> Result<ActionResult>;

/// Registry of named actions. The built-in set covers the VM lifecycle;
/// callers may register additional handlers under their own names.
pub struct ActionRegistry {
    handlers: BTreeMap<&'static str, Handler>,
}

impl ActionRegistry {
    /// A registry with no actions; callers build custom sets with
    /// [`register`](Self::register).
    pub fn empty() -> Self {
        Self {
            handlers: BTreeMap::new(),
        }
    }

    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register("vm-shutdown", control_action);
        registry.register("vm-kill", control_action);
        registry.register("vm-start", control_action);
        registry.register("vm-verify", verify_action);
        registry.register("vm-delete", control_action);
        registry.register("vm-ifaddr", ifaddr_action);
        registry.register("vm-install", install_action);
        registry
    }

    pub fn register(&mut self, name: &'static str, handler: Handler) {
        self.handlers.insert(name, handler);
    }

    /// Invoke an action synchronously and return its parsed result.
    pub fn trigger(&self, call: &ActionCall<'_>, target: &mut dyn Target) -> Result<ActionResult> {
        let handler = self
            .handlers
            .get(call.name())
            .ok_or_else(|| Error::UnknownAction(call.name().to_string()))?;
        debug!(action = call.name(), target = target.name(), "trigger");
        handler(target, call)
    }
}

/// Fire-and-forget virsh lifecycle controls: no output parsing.
fn control_action(target: &mut dyn Target, call: &ActionCall<'_>) -> Result<ActionResult> {
    let cmd = match call {
        ActionCall::Shutdown { vm } => format!("virsh shutdown {vm}"),
        ActionCall::Kill { vm } => format!("virsh destroy {vm}"),
        ActionCall::Start { vm } => format!("virsh start {vm}"),
        ActionCall::Delete { vm } => format!("virsh undefine {vm}"),
        other => return Err(Error::UnknownAction(other.name().to_string())),
    };
    target.sudo(&cmd)?;
    Ok(ActionResult::Done)
}

fn verify_action(target: &mut dyn Target, call: &ActionCall<'_>) -> Result<ActionResult> {
    let ActionCall::Verify {
        vm,
        running,
        autostart,
    } = call
    else {
        return Err(Error::UnknownAction(call.name().to_string()));
    };
    let output = target.sudo(&format!("virsh dominfo {vm}"))?;
    Ok(ActionResult::Verified(verify_matches(
        &output, vm, *running, *autostart,
    )))
}

fn ifaddr_action(target: &mut dyn Target, call: &ActionCall<'_>) -> Result<ActionResult> {
    let ActionCall::IfAddr { vm } = call else {
        return Err(Error::UnknownAction(call.name().to_string()));
    };
    let output = target.sudo(&format!("virsh domifaddr {vm}"))?;
    Ok(ActionResult::IfAddr(parse_ifaddr(&output)))
}

fn install_action(target: &mut dyn Target, call: &ActionCall<'_>) -> Result<ActionResult> {
    let ActionCall::Install { spec } = call else {
        return Err(Error::UnknownAction(call.name().to_string()));
    };
    let os_supported = match &spec.os {
        Some(os) => os_variant_supported(target, os),
        None => false,
    };
    let cmd = install_cmdline(spec, os_supported)?;
    target.sudo(&cmd)?;
    Ok(ActionResult::Done)
}

/// Check the dominfo output for the VM. The name must match
/// case-insensitively; the running and autostart-enabled tokens are only
/// required when asked for. All conditions are ANDed.
pub fn verify_matches(output: &str, vm: &str, want_running: bool, want_autostart: bool) -> bool {
    let mut name_ok = false;
    let mut running = false;
    let mut autostart_on = false;
    for line in output.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim().to_ascii_lowercase();
        match key.trim().to_ascii_lowercase().as_str() {
            "name" => name_ok = value == vm.to_ascii_lowercase(),
            "state" => running = value.contains("running"),
            "autostart" => autostart_on = value.contains("enable"),
            _ => {}
        }
    }
    name_ok && (!want_running || running) && (!want_autostart || autostart_on)
}

/// Parse `virsh domifaddr` output: the last non-empty line either is the
/// "no entries" separator or holds `<if> <mac> <proto> <addr>/<prefix>`
/// columns. `None` means the address is not yet available.
pub fn parse_ifaddr(output: &str) -> Option<IfAddr> {
    let line = output.lines().rev().find(|l| !l.trim().is_empty())?.trim();
    if line.chars().all(|c| c == '-' || c.is_whitespace()) {
        return None;
    }
    let cols: Vec<&str> = line.split_whitespace().collect();
    if cols.len() < 4 {
        return None;
    }
    let addr = cols[3].split('/').next().unwrap_or(cols[3]);
    Some(IfAddr {
        mac: cols[1].to_string(),
        addr: addr.to_string(),
    })
}

/// Ask the target whether osinfo knows the configured variant. A failing
/// lookup omits the flag rather than failing the install.
fn os_variant_supported(target: &mut dyn Target, os: &str) -> bool {
    match target.sudo("osinfo-query os -f short-id") {
        Ok(output) => output
            .lines()
            .any(|line| line.split_whitespace().any(|token| token == os)),
        Err(err) => {
            warn!(os, %err, "os-variant lookup failed, omitting --os-variant");
            false
        }
    }
}

/// Assemble the virt-install command line for a resolved VM descriptor.
pub fn install_cmdline(spec: &VmSpec, os_supported: bool) -> Result<String> {
    let image = spec.image.as_deref().ok_or_else(|| {
        Error::Configuration(format!("VM {} has no disk image configured", spec.name))
    })?;

    let mut cmd =
        String::from("virt-install --connect qemu:///system --hvm --virt-type kvm --import --wait 0");
    if spec.autostart {
        cmd.push_str(" --autostart");
    }
    cmd.push_str(&format!(
        " --name {} --memory {} --vcpus {} --arch {}",
        spec.name, spec.memory, spec.cpus, spec.arch
    ));
    if let (Some(os), true) = (&spec.os, os_supported) {
        cmd.push_str(&format!(" --os-variant {os}"));
    }
    match spec.network {
        NetworkMode::HostNat => cmd.push_str(&format!(
            " --network network={}",
            spec.netname.as_deref().unwrap_or("default")
        )),
        NetworkMode::Bridge => cmd.push_str(&format!(
            " --network bridge={}",
            spec.netname.as_deref().unwrap_or("virbr0")
        )),
    }
    if let Some(nic) = &spec.nic {
        cmd.push_str(&format!(",model={nic}"));
    }
    cmd.push_str(&format!(
        " --graphics {}",
        spec.graphics.as_deref().unwrap_or("spice")
    ));
    cmd.push_str(&format!(" --disk path={image},device=disk,boot_order=1"));
    if let Some(bus) = &spec.diskbus {
        cmd.push_str(&format!(",bus={bus}"));
    }
    if let Some(format) = &spec.format {
        cmd.push_str(&format!(",format={format}"));
    }
    let cdrombus = spec.cdrombus.as_deref().unwrap_or("ide");
    match &spec.cdrom {
        Cdrom::Empty => cmd.push_str(&format!(" --disk device=cdrom,boot_order=2,bus={cdrombus}")),
        Cdrom::Media(path) => cmd.push_str(&format!(
            " --disk path={path},device=cdrom,boot_order=2,bus={cdrombus}"
        )),
        Cdrom::Disabled => {}
    }
    if let Some(kernel) = &spec.kernel {
        cmd.push_str(&format!(" --boot kernel={kernel}"));
        if let Some(args) = &spec.kernel_args {
            cmd.push_str(&format!(",kernel_args=\"{args}\""));
        }
    }
    if let Some(opts) = &spec.install_opts {
        cmd.push_str(&format!(" {opts}"));
    }
    Ok(cmd)
}
