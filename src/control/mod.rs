//! Control-plane client: lifecycle commands against the hypervisor.
//!
//! The orchestrator only ever sees [`ControlPlane`]. Whether a backend
//! creates VMs through GUI scripting or a CLI verb is a property of the
//! backend ([`CreateVia`]), not something callers branch on.

pub mod applescript;
pub mod plist;
pub mod utm;

use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use crate::error::ScratchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    Stopped,
    Running,
    Unknown,
}

impl PowerState {
    /// Parse a status word as printed by the hypervisor CLI.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "started" | "running" | "starting" => PowerState::Running,
            "stopped" | "paused" | "suspended" | "stopping" | "shutdown" => PowerState::Stopped,
            _ => PowerState::Unknown,
        }
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PowerState::Stopped => "stopped",
            PowerState::Running => "running",
            PowerState::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkMode {
    Shared,
    Bridged,
    HostOnly,
}

impl NetworkMode {
    pub fn parse(s: &str) -> Result<Self, ScratchError> {
        match s.trim().to_ascii_lowercase().as_str() {
            "shared" => Ok(NetworkMode::Shared),
            "bridged" => Ok(NetworkMode::Bridged),
            "host" | "host-only" | "hostonly" => Ok(NetworkMode::HostOnly),
            other => Err(ScratchError::Validation {
                message: format!("unknown network mode '{other}' (use shared, bridged or host)"),
            }),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NetworkMode::Shared => "shared",
            NetworkMode::Bridged => "bridged",
            NetworkMode::HostOnly => "host",
        }
    }
}

/// Everything needed to create a fresh VM booting from install media.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmSpec {
    pub name: String,
    pub iso: PathBuf,
    pub memory_mib: u64,
    pub cpus: u32,
    pub disk_gib: u64,
    pub network: NetworkMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmRef {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmSummary {
    pub name: String,
    pub state: PowerState,
}

/// Point mutation of a VM's persisted configuration document.
///
/// The hypervisor caches that document in memory: after any edit the
/// caller must [`ControlPlane::restart`] before the next start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigPatch {
    /// Expose the first serial port as a TCP server on `port`.
    SerialConsole { port: u16 },
    MacAddress(String),
    MemoryMib(u64),
    CpuCount(u32),
    /// Remove the removable install drive created alongside the VM.
    DetachInstallMedia,
}

/// Which mechanism a backend uses for `create`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateVia {
    /// GUI scripting (AppleScript); the hypervisor has no CLI create verb.
    AppleScript,
    /// A `create` verb on the control CLI.
    Cli,
}

impl CreateVia {
    pub fn parse(s: &str) -> Result<Self, ScratchError> {
        match s {
            "applescript" => Ok(CreateVia::AppleScript),
            "cli" => Ok(CreateVia::Cli),
            other => Err(ScratchError::Validation {
                message: format!("unknown create mechanism '{other}'"),
            }),
        }
    }
}

#[allow(async_fn_in_trait)] // trait is internal-only
pub trait ControlPlane {
    /// Check that the control tooling is present. Runs before any mutation.
    async fn preflight(&self) -> Result<(), ScratchError>;

    async fn list(&self) -> Result<Vec<VmSummary>, ScratchError>;

    async fn exists(&self, name: &str) -> Result<bool, ScratchError> {
        Ok(self.list().await?.iter().any(|vm| vm.name == name))
    }

    async fn status(&self, name: &str) -> Result<PowerState, ScratchError>;

    /// Fails with `AlreadyExists` if `spec.name` is registered.
    async fn create(&self, spec: &VmSpec) -> Result<VmRef, ScratchError>;

    /// Fails with `NotFound` for a missing source and `AlreadyExists` for a
    /// taken target name.
    async fn clone_vm(&self, source: &str, new_name: &str) -> Result<VmRef, ScratchError>;

    async fn start(&self, name: &str) -> Result<(), ScratchError>;

    /// No-op for a VM that is already stopped.
    async fn stop(&self, name: &str) -> Result<(), ScratchError>;

    async fn delete(&self, name: &str) -> Result<(), ScratchError>;

    /// One query for the guest's addresses; may be empty or contain junk
    /// while the guest is still booting.
    async fn ip_addresses(&self, name: &str) -> Result<Vec<String>, ScratchError>;

    async fn mac_address(&self, name: &str) -> Result<Option<String>, ScratchError>;

    async fn edit_config(&self, name: &str, patch: &ConfigPatch) -> Result<(), ScratchError>;

    /// Restart the hypervisor process so edited config documents are reloaded.
    async fn restart(&self) -> Result<(), ScratchError>;

    /// Host-side network introspection fallback (e.g. the ARP table).
    async fn neighbor_ip(&self, _mac: &str) -> Result<Option<Ipv4Addr>, ScratchError> {
        Ok(None)
    }
}

/// `getIP`: bounded poll that reports absence instead of failing.
pub async fn get_ip<C: ControlPlane>(
    control: &C,
    name: &str,
    policy: crate::config::RetryPolicy,
) -> Option<Ipv4Addr> {
    crate::network::await_ip(control, name, policy).await.ok()
}

/// Stop (if needed) and delete a VM. Used by `--force` and `destroy`.
pub async fn remove_vm<C: ControlPlane>(control: &C, name: &str) -> Result<(), ScratchError> {
    if control.status(name).await? == PowerState::Running {
        control.stop(name).await?;
    }
    control.delete(name).await?;
    tracing::info!(name, "VM deleted");
    Ok(())
}
