//! Layered configuration resolution.
//!
//! Resolution happens exactly once per execution: the script-declared base
//! is merged with the execution-context override, deferred leaves are
//! evaluated in declaration order, defaults are filled in, the caller's
//! configure callback runs, a name is generated if none was set, and the
//! result is projected into an immutable [`VmSpec`].

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::schema::{Cdrom, NetworkMode, NodeOverrides, VmSpec};
use crate::config::{ConfigMap, ConfigValue, Scalar};
use crate::engine::Command;
use crate::error::{Error, Result};

/// Context visible to deferred leaves and the configure callback.
pub struct ResolveCtx<'a> {
    /// Name of the script being resolved.
    pub script: &'a str,
    /// Name of the target node this execution runs against.
    pub target: &'a str,
    pub command: Command,
    resolved: &'a ConfigMap,
}

impl ResolveCtx<'_> {
    /// Read an already-resolved field. Deferred leaves only see fields
    /// declared before them.
    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.resolved.get(key)
    }
}

/// Caller-supplied hook run after defaults are applied but before name
/// generation, receiving the in-progress configuration.
pub type ConfigureFn = std::rc::Rc<dyn Fn(&mut ConfigMap, &ResolveCtx<'_>) -> Result<()>>;

/// Resolve a script's layered configuration into a [`VmSpec`] snapshot.
pub fn resolve(
    script: &str,
    base: &ConfigMap,
    overrides: Option<&ConfigMap>,
    configure: Option<&ConfigureFn>,
    command: Command,
    target: &str,
) -> Result<VmSpec> {
    let merged = match overrides {
        Some(over) => base.merged_with(over),
        None => base.clone(),
    };
    let mut resolved = evaluate_deferred(merged, script, target, command)?;

    apply_defaults(&mut resolved);

    if let Some(configure) = configure {
        // The callback sees the map resolved so far via a read-only
        // context snapshot and mutates the map itself.
        let snapshot = resolved.clone();
        let ctx = ResolveCtx {
            script,
            target,
            command,
            resolved: &snapshot,
        };
        configure(&mut resolved, &ctx)?;
    }

    if !resolved.contains("name") {
        let name = generate_name(script, target);
        debug!(script, %name, "generated VM name");
        resolved.set("name", name);
    }

    project(script, resolved)
}

/// Replace every deferred leaf with its computed literal. Evaluation runs
/// in declaration order so each leaf can read earlier fields.
fn evaluate_deferred(
    map: ConfigMap,
    script: &str,
    target: &str,
    command: Command,
) -> Result<ConfigMap> {
    let mut out = ConfigMap::new();
    for (key, value) in map {
        let value = match value {
            ConfigValue::Deferred(f) => {
                let ctx = ResolveCtx {
                    script,
                    target,
                    command,
                    resolved: &out,
                };
                ConfigValue::Scalar(f(&ctx)?)
            }
            ConfigValue::Map(nested) => {
                ConfigValue::Map(evaluate_nested(nested, script, target, command, &out)?)
            }
            literal => literal,
        };
        out.set(key, value);
    }
    Ok(out)
}

fn evaluate_nested(
    map: ConfigMap,
    script: &str,
    target: &str,
    command: Command,
    root: &ConfigMap,
) -> Result<ConfigMap> {
    let mut out = ConfigMap::new();
    for (key, value) in map {
        let value = match value {
            ConfigValue::Deferred(f) => {
                let ctx = ResolveCtx {
                    script,
                    target,
                    command,
                    resolved: root,
                };
                ConfigValue::Scalar(f(&ctx)?)
            }
            ConfigValue::Map(nested) => {
                ConfigValue::Map(evaluate_nested(nested, script, target, command, root)?)
            }
            literal => literal,
        };
        out.set(key, value);
    }
    Ok(out)
}

fn apply_defaults(map: &mut ConfigMap) {
    if !map.contains("memory") {
        map.set("memory", 1024i64);
    }
    if !map.contains("cpus") {
        map.set("cpus", 1i64);
    }
    if !map.contains("network") {
        map.set("network", "host-nat");
    }
    if !map.contains("arch") {
        map.set("arch", "x86_64");
    }
}

/// Auto-generated VM name: `<script>_<hash of script, target and wall
/// clock>`. Uniqueness is best-effort, not guaranteed; the inventory
/// collision check at validate time catches clashes with existing entries.
fn generate_name(script: &str, target: &str) -> String {
    let now = chrono::Utc::now().timestamp_micros();
    let digest = Sha256::new()
        .chain_update(script.as_bytes())
        .chain_update(target.as_bytes())
        .chain_update(now.to_le_bytes())
        .finalize();
    let hash: String = digest.iter().take(6).map(|b| format!("{b:02x}")).collect();
    format!("{script}_{hash}")
}

fn project(script: &str, map: ConfigMap) -> Result<VmSpec> {
    let raw = map.to_json()?;

    let network = match require_str(&map, "network")? {
        Some(mode) => NetworkMode::parse(&mode)?,
        None => NetworkMode::HostNat,
    };

    let cdrom = match map.get("cdrom") {
        None => Cdrom::Empty,
        Some(ConfigValue::Scalar(Scalar::Bool(false))) => Cdrom::Disabled,
        Some(ConfigValue::Scalar(Scalar::Bool(true))) => Cdrom::Empty,
        Some(ConfigValue::Scalar(Scalar::Str(path))) => Cdrom::Media(path.clone()),
        Some(other) => {
            return Err(Error::Configuration(format!(
                "option cdrom must be a path or a bool, got {other:?}"
            )))
        }
    };

    let node = match map.get("node") {
        None => NodeOverrides::default(),
        Some(ConfigValue::Map(node)) => NodeOverrides {
            host: require_str(node, "host")?,
            user: require_str(node, "user")?,
            groups: require_str(node, "group")?
                .map(|g| {
                    g.split([',', ' '])
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        },
        Some(other) => {
            return Err(Error::Configuration(format!(
                "option node must be a mapping, got {other:?}"
            )))
        }
    };

    let spec = VmSpec {
        name: require_str(&map, "name")?.ok_or_else(|| {
            Error::Configuration(format!("script {script} resolved without a VM name"))
        })?,
        image: require_str(&map, "image")?,
        memory: require_int(&map, "memory")?.unwrap_or(1024),
        cpus: require_int(&map, "cpus")?.unwrap_or(1),
        network,
        netname: require_str(&map, "netname")?,
        nic: require_str(&map, "nic")?,
        graphics: require_str(&map, "graphics")?,
        os: require_str(&map, "os")?,
        arch: require_str(&map, "arch")?.unwrap_or_else(|| "x86_64".to_string()),
        diskbus: require_str(&map, "diskbus")?,
        format: require_str(&map, "format")?,
        cdrom,
        cdrombus: require_str(&map, "cdrombus")?,
        kernel: require_str(&map, "kernel")?,
        kernel_args: require_str(&map, "kernel-args")?,
        autostart: require_bool(&map, "autostart")?.unwrap_or(false),
        install_opts: require_str(&map, "install-opts")?,
        no_node: require_bool(&map, "no-node")?.unwrap_or(false),
        no_sniff: require_bool(&map, "no-sniff")?.unwrap_or(false),
        user: require_str(&map, "user")?,
        node,
        raw,
    };
    Ok(spec)
}

fn require_str(map: &ConfigMap, key: &str) -> Result<Option<String>> {
    match map.get(key) {
        None => Ok(None),
        Some(ConfigValue::Scalar(Scalar::Str(s))) => Ok(Some(s.clone())),
        Some(other) => Err(Error::Configuration(format!(
            "option {key} must be a string, got {other:?}"
        ))),
    }
}

fn require_int(map: &ConfigMap, key: &str) -> Result<Option<i64>> {
    match map.get(key) {
        None => Ok(None),
        Some(ConfigValue::Scalar(Scalar::Int(i))) => Ok(Some(*i)),
        Some(other) => Err(Error::Configuration(format!(
            "option {key} must be an integer, got {other:?}"
        ))),
    }
}

fn require_bool(map: &ConfigMap, key: &str) -> Result<Option<bool>> {
    match map.get(key) {
        None => Ok(None),
        Some(ConfigValue::Scalar(Scalar::Bool(b))) => Ok(Some(*b)),
        Some(other) => Err(Error::Configuration(format!(
            "option {key} must be a bool, got {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    fn resolve_plain(base: &ConfigMap) -> VmSpec {
        resolve("myvm", base, None, None, Command::Apply, "host1").unwrap()
    }

    #[test]
    fn test_empty_configuration_gets_defaults() {
        let spec = resolve_plain(&ConfigMap::new());
        assert_eq!(spec.arch, "x86_64");
        assert_eq!(spec.memory, 1024);
        assert_eq!(spec.cpus, 1);
        assert_eq!(spec.network, NetworkMode::HostNat);
        assert!(spec.image.is_none());
        assert!(spec.os.is_none());
        assert!(spec.graphics.is_none());
        assert!(!spec.autostart);
    }

    #[test]
    fn test_generated_name_pattern() {
        let spec = resolve_plain(&ConfigMap::new());
        let suffix = spec.name.strip_prefix("myvm_").unwrap();
        assert_eq!(suffix.len(), 12);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_declared_name_is_kept() {
        let base = ConfigMap::new().with("name", "web1");
        assert_eq!(resolve_plain(&base).name, "web1");
    }

    #[test]
    fn test_override_merges_over_base() {
        let base = ConfigMap::new().with("memory", 1024i64).with("cpus", 2i64);
        let over = ConfigMap::new().with("memory", 4096i64);
        let spec = resolve("myvm", &base, Some(&over), None, Command::Apply, "host1").unwrap();
        assert_eq!(spec.memory, 4096);
        assert_eq!(spec.cpus, 2);
    }

    #[test]
    fn test_deferred_leaf_evaluated_once_with_context() {
        let calls = Rc::new(Cell::new(0u32));
        let seen = calls.clone();
        let base = ConfigMap::new()
            .with("netname", "lab0")
            .with(
                "name",
                ConfigValue::deferred(move |ctx| {
                    seen.set(seen.get() + 1);
                    let net = ctx
                        .get("netname")
                        .and_then(|v| v.as_scalar())
                        .and_then(|s| s.as_str())
                        .unwrap();
                    Ok(Scalar::from(format!("{}-{}-{net}", ctx.script, ctx.target)))
                }),
            );
        let spec = resolve_plain(&base);
        assert_eq!(spec.name, "myvm-host1-lab0");
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_configure_runs_after_defaults_before_name_generation() {
        let configure: ConfigureFn = Rc::new(|map, _ctx| {
            // defaults are already visible here
            assert_eq!(map.get("memory").unwrap().as_scalar().unwrap().as_int(), Some(1024));
            map.set("name", "configured");
            Ok(())
        });
        let spec = resolve(
            "myvm",
            &ConfigMap::new(),
            None,
            Some(&configure),
            Command::Apply,
            "host1",
        )
        .unwrap();
        assert_eq!(spec.name, "configured");
    }

    #[test]
    fn test_wrong_scalar_kind_is_configuration_error() {
        let base = ConfigMap::new().with("memory", "lots");
        let err = resolve("myvm", &base, None, None, Command::Apply, "host1").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_non_map_node_section_is_configuration_error() {
        let base = ConfigMap::new().with("node", "host1");
        let err = resolve("myvm", &base, None, None, Command::Apply, "host1").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_node_group_list_parsing() {
        let base = ConfigMap::new().with(
            "node",
            ConfigMap::new()
                .with("user", "admin")
                .with("group", "web, lab dbs"),
        );
        let spec = resolve_plain(&base);
        assert_eq!(spec.node.user.as_deref(), Some("admin"));
        assert_eq!(spec.node.groups, vec!["web", "lab", "dbs"]);
    }

    #[test]
    fn test_cdrom_tristate() {
        assert_eq!(resolve_plain(&ConfigMap::new()).cdrom, Cdrom::Empty);
        let disabled = ConfigMap::new().with("cdrom", false);
        assert_eq!(resolve_plain(&disabled).cdrom, Cdrom::Disabled);
        let media = ConfigMap::new().with("cdrom", "/iso/boot.iso");
        assert_eq!(
            resolve_plain(&media).cdrom,
            Cdrom::Media("/iso/boot.iso".to_string())
        );
    }

    #[test]
    fn test_vbox_attrs_strips_control_flags() {
        let base = ConfigMap::new()
            .with("name", "web1")
            .with("no-node", true)
            .with("no-sniff", true);
        let attrs = resolve_plain(&base).vbox_attrs();
        let obj = attrs.as_object().unwrap();
        assert!(obj.contains_key("name"));
        assert!(!obj.contains_key("no-node"));
        assert!(!obj.contains_key("no-sniff"));
    }
}
