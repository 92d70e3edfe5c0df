//! Resolved VM descriptor schema.

use serde::Serialize;

use crate::error::{Error, Result};

/// Network attachment mode for the VM's primary interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkMode {
    /// NAT through a libvirt-managed host network ("default" unless
    /// `netname` is set).
    HostNat,
    /// Attach to a host bridge ("virbr0" unless `netname` is set).
    Bridge,
}

impl NetworkMode {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "hostnet" | "host-nat" => Ok(NetworkMode::HostNat),
            "bridge" => Ok(NetworkMode::Bridge),
            other => Err(Error::Configuration(format!(
                "unknown network mode '{other}' (expected host-nat or bridge)"
            ))),
        }
    }
}

/// Secondary cdrom drive setting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Cdrom {
    /// Empty cdrom drive as second boot device.
    Empty,
    /// No cdrom clause at all.
    Disabled,
    /// Cdrom drive with the given media path attached.
    Media(String),
}

/// Explicit node attributes overriding discovered values.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NodeOverrides {
    pub host: Option<String>,
    pub user: Option<String>,
    pub groups: Vec<String>,
}

/// Resolved configuration projected to the fields the install command and
/// node registration need. Immutable once constructed for the execution.
#[derive(Debug, Clone, Serialize)]
pub struct VmSpec {
    pub name: String,
    /// Disk image path on the target; required for apply.
    pub image: Option<String>,
    pub memory: i64,
    pub cpus: i64,
    pub network: NetworkMode,
    pub netname: Option<String>,
    /// NIC model, e.g. "virtio".
    pub nic: Option<String>,
    pub graphics: Option<String>,
    /// os-variant hint; included only when the hypervisor recognizes it.
    pub os: Option<String>,
    pub arch: String,
    pub diskbus: Option<String>,
    pub format: Option<String>,
    pub cdrom: Cdrom,
    pub cdrombus: Option<String>,
    pub kernel: Option<String>,
    pub kernel_args: Option<String>,
    pub autostart: bool,
    /// Raw trailing install options, appended verbatim.
    pub install_opts: Option<String>,
    /// Suppress node registration.
    pub no_node: bool,
    /// Suppress the discovery probe after registration.
    pub no_sniff: bool,
    /// Login user for the resulting node.
    pub user: Option<String>,
    pub node: NodeOverrides,
    pub(crate) raw: serde_json::Value,
}

impl VmSpec {
    /// The full resolved configuration as JSON.
    pub fn raw(&self) -> &serde_json::Value {
        &self.raw
    }

    /// The `vbox` metadata blob persisted on the inventory node: the
    /// resolved configuration minus the control flags.
    pub fn vbox_attrs(&self) -> serde_json::Value {
        let mut attrs = self.raw.clone();
        if let Some(map) = attrs.as_object_mut() {
            map.remove("no-node");
            map.remove("no-sniff");
        }
        attrs
    }
}

impl Default for VmSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            image: None,
            memory: 1024,
            cpus: 1,
            network: NetworkMode::HostNat,
            netname: None,
            nic: None,
            graphics: None,
            os: None,
            arch: "x86_64".to_string(),
            diskbus: None,
            format: None,
            cdrom: Cdrom::Empty,
            cdrombus: None,
            kernel: None,
            kernel_args: None,
            autostart: false,
            install_opts: None,
            no_node: false,
            no_sniff: false,
            user: None,
            node: NodeOverrides::default(),
            raw: serde_json::Value::Object(serde_json::Map::new()),
        }
    }
}
