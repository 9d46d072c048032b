use std::path::{Path, PathBuf};
use std::time::Duration;

use facet::Facet;

use crate::error::ScratchError;
use crate::paths;
use crate::util::validate_vm_name;

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct Config {
    #[facet(default)]
    pub hypervisor: HypervisorConfig,
    #[facet(default)]
    pub template: TemplateConfig,
    #[facet(default)]
    pub install: InstallConfig,
    #[facet(default)]
    pub ssh: SshConfig,
    #[facet(default)]
    pub probe: ProbeConfig,
    #[facet(default)]
    pub inject: InjectConfig,
    #[facet(default)]
    pub results: ResultsConfig,
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct HypervisorConfig {
    #[facet(default = "/Applications/UTM.app/Contents/MacOS/utmctl")]
    pub utmctl: String,
    #[facet(default = "UTM")]
    pub app: String,
    /// Directory holding `<name>.utm` bundles. Defaults to UTM's container.
    #[facet(default)]
    pub documents_dir: Option<String>,
    /// How VMs are created: `applescript` (GUI scripting) or `cli`.
    #[facet(default = "applescript")]
    pub create: String,
    /// Guest architecture passed to the creation script.
    #[facet(default = "aarch64")]
    pub architecture: String,
    /// Pause after quitting and after relaunching the hypervisor.
    #[facet(default = 5)]
    pub restart_settle_s: u64,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            utmctl: "/Applications/UTM.app/Contents/MacOS/utmctl".into(),
            app: "UTM".into(),
            documents_dir: None,
            create: "applescript".into(),
            architecture: "aarch64".into(),
            restart_settle_s: 5,
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct TemplateConfig {
    #[facet(default = "alpine-template")]
    pub name: String,
    #[facet(default)]
    pub iso: Option<String>,
    #[facet(default)]
    pub iso_url: Option<String>,
    #[facet(default = 2048)]
    pub ram_mb: u64,
    #[facet(default = 2)]
    pub cpus: u32,
    #[facet(default = 8)]
    pub disk_gb: u64,
    #[facet(default = "alpine")]
    pub password: String,
    #[facet(default = "shared")]
    pub network: String,
    #[facet(default = "alpine")]
    pub hostname: String,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            name: "alpine-template".into(),
            iso: None,
            iso_url: None,
            ram_mb: 2048,
            cpus: 2,
            disk_gb: 8,
            password: "alpine".into(),
            network: "shared".into(),
            hostname: "alpine".into(),
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct InstallConfig {
    #[facet(default = 4444)]
    pub serial_port: u16,
    #[facet(default = 8000)]
    pub answer_port: u16,
    /// Host address as seen from the guest network.
    #[facet(default = "192.168.64.1")]
    pub host_address: String,
    #[facet(default = 120)]
    pub prompt_timeout_s: u64,
    #[facet(default = 900)]
    pub completion_timeout_s: u64,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            serial_port: 4444,
            answer_port: 8000,
            host_address: "192.168.64.1".into(),
            prompt_timeout_s: 120,
            completion_timeout_s: 900,
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct SshConfig {
    /// Key pair file name under `key_dir`; the public half is `<key>.pub`.
    #[facet(default = "id_ed25519")]
    pub key: String,
    #[facet(default)]
    pub key_dir: Option<String>,
    #[facet(default = "root")]
    pub user: String,
    #[facet(default = 5)]
    pub connect_timeout_s: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            key: "id_ed25519".into(),
            key_dir: None,
            user: "root".into(),
            connect_timeout_s: 5,
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct ProbeConfig {
    #[facet(default = 10)]
    pub attempts: u32,
    #[facet(default = 2)]
    pub interval_s: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            attempts: 10,
            interval_s: 2,
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct InjectConfig {
    #[facet(default = 5)]
    pub attempts: u32,
    #[facet(default = 5)]
    pub backoff_s: u64,
}

impl Default for InjectConfig {
    fn default() -> Self {
        Self {
            attempts: 5,
            backoff_s: 5,
        }
    }
}

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct ResultsConfig {
    #[facet(default)]
    pub dir: Option<String>,
}

/// A fixed-budget polling schedule: `attempts` tries, `interval` apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval }
    }
}

impl Config {
    pub fn probe_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.probe.attempts,
            Duration::from_secs(self.probe.interval_s),
        )
    }

    pub fn inject_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.inject.attempts,
            Duration::from_secs(self.inject.backoff_s),
        )
    }

    pub fn ssh_key_dir(&self) -> PathBuf {
        match &self.ssh.key_dir {
            Some(dir) => paths::expand_home(dir),
            None => paths::ssh_dir(),
        }
    }

    pub fn documents_dir(&self) -> PathBuf {
        match &self.hypervisor.documents_dir {
            Some(dir) => paths::expand_home(dir),
            None => paths::utm_documents_dir(),
        }
    }

    pub fn results_dir(&self) -> PathBuf {
        match &self.results.dir {
            Some(dir) => paths::expand_home(dir),
            None => paths::results_dir(),
        }
    }
}

// ── validation ────────────────────────────────────────────

pub const MIN_CPUS: u32 = 1;
pub const MIN_MEMORY_MIB: u64 = 256;
pub const MIN_DISK_GIB: u64 = 1;

/// Resource floors for values given per invocation. `None` means the
/// value was not overridden.
pub fn validate_resources(
    memory_mib: Option<u64>,
    cpus: Option<u32>,
    disk_gib: Option<u64>,
) -> Result<(), ScratchError> {
    if let Some(cpus) = cpus
        && cpus < MIN_CPUS
    {
        return Err(ScratchError::Validation {
            message: format!("cpu count must be at least {MIN_CPUS} (got {cpus})"),
        });
    }
    if let Some(mib) = memory_mib
        && mib < MIN_MEMORY_MIB
    {
        return Err(ScratchError::Validation {
            message: format!("memory must be at least {MIN_MEMORY_MIB} MiB (got {mib} MiB)"),
        });
    }
    if let Some(gib) = disk_gib
        && gib < MIN_DISK_GIB
    {
        return Err(ScratchError::Validation {
            message: format!("disk must be at least {MIN_DISK_GIB} GiB (got {gib} GiB)"),
        });
    }
    Ok(())
}

pub fn validate_config(config: &Config) -> Result<(), ScratchError> {
    let template = &config.template;
    validate_vm_name(&template.name)?;
    if template.cpus < MIN_CPUS {
        return Err(ScratchError::Validation {
            message: "template.cpus must be at least 1".into(),
        });
    }
    if template.ram_mb < MIN_MEMORY_MIB {
        return Err(ScratchError::Validation {
            message: "template.ram_mb must be at least 256".into(),
        });
    }
    if template.disk_gb < MIN_DISK_GIB {
        return Err(ScratchError::Validation {
            message: "template.disk_gb must be at least 1".into(),
        });
    }
    if template.password.is_empty() {
        return Err(ScratchError::Validation {
            message: "template.password must not be empty".into(),
        });
    }
    if let Some(url) = &template.iso_url
        && !(url.starts_with("http://") || url.starts_with("https://"))
    {
        return Err(ScratchError::Validation {
            message: format!("template.iso_url must be an http(s) URL (got '{url}')"),
        });
    }

    let install = &config.install;
    if install.serial_port == 0 || install.answer_port == 0 {
        return Err(ScratchError::Validation {
            message: "install ports must be non-zero".into(),
        });
    }
    if install.serial_port == install.answer_port {
        return Err(ScratchError::Validation {
            message: format!(
                "install.serial_port and install.answer_port must differ (both {})",
                install.serial_port
            ),
        });
    }
    if install.host_address.trim().is_empty() {
        return Err(ScratchError::Validation {
            message: "install.host_address must not be empty".into(),
        });
    }

    if config.probe.attempts < 1 || config.inject.attempts < 1 {
        return Err(ScratchError::Validation {
            message: "probe.attempts and inject.attempts must be at least 1".into(),
        });
    }

    if config.ssh.key.is_empty() || config.ssh.user.is_empty() {
        return Err(ScratchError::Validation {
            message: "ssh.key and ssh.user must not be empty".into(),
        });
    }

    match config.hypervisor.create.as_str() {
        "applescript" | "cli" => {}
        other => {
            return Err(ScratchError::Validation {
                message: format!("hypervisor.create must be 'applescript' or 'cli' (got '{other}')"),
            });
        }
    }

    Ok(())
}

// ── public API ────────────────────────────────────────────

/// Load and validate the config at `path`.
///
/// A missing file falls back to built-in defaults unless the path was given
/// explicitly on the command line.
pub fn load_config(path: &Path, explicit: bool) -> Result<Config, ScratchError> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound && !explicit => {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            String::new()
        }
        Err(source) => {
            return Err(ScratchError::ConfigLoad {
                path: path.display().to_string(),
                source,
            });
        }
    };

    let config = parse_config(&contents).map_err(|message| ScratchError::ConfigParse {
        path: path.display().to_string(),
        message,
    })?;

    validate_config(&config)?;
    Ok(config)
}

fn parse_config(contents: &str) -> Result<Config, String> {
    if contents.trim().is_empty() {
        return Ok(Config::default());
    }
    facet_toml::from_str(contents).map_err(|e| e.to_string())
}
