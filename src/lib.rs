//! virtprov - libvirt VM provisioning scripts
//!
//! A plugin library for declarative orchestration engines: provisions and
//! decommissions virtual machines through the hypervisor CLI
//! (virt-install/virsh) on a remote target and registers the resulting
//! host as a managed inventory node.

pub mod actions;
pub mod config;
pub mod engine;
pub mod error;
pub mod poll;
pub mod script;

// Re-export commonly used types
pub use config::resolver::ResolveCtx;
pub use config::schema::{NetworkMode, VmSpec};
pub use config::{ConfigMap, ConfigValue, Scalar};
pub use engine::{Command, ExecContext, Inventory, NodeRecord, Sniffer, Target};
pub use error::{EntityKind, Error, Result};
pub use script::{Lifecycle, NodeScript, VBoxScript, Validation, VmScript};
