use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::Config;
use crate::error::ScratchError;
use crate::runner::{CommandOutput, CommandRunner, program_exists};

use super::plist::{self, PLIST_BUDDY};
use super::{
    ConfigPatch, ControlPlane, CreateVia, PowerState, VmRef, VmSpec, VmSummary, applescript,
};

/// UTM driven through `utmctl`, AppleScript and the bundle's `config.plist`.
pub struct UtmControlPlane<R> {
    runner: R,
    utmctl: String,
    app: String,
    documents: PathBuf,
    create_via: CreateVia,
    architecture: String,
    settle: Duration,
}

impl<R: CommandRunner> UtmControlPlane<R> {
    pub fn new(runner: R, config: &Config) -> Result<Self, ScratchError> {
        Ok(Self {
            runner,
            utmctl: config.hypervisor.utmctl.clone(),
            app: config.hypervisor.app.clone(),
            documents: config.documents_dir(),
            create_via: CreateVia::parse(&config.hypervisor.create)?,
            architecture: config.hypervisor.architecture.clone(),
            settle: Duration::from_secs(config.hypervisor.restart_settle_s),
        })
    }

    async fn utmctl(&self, args: &[&str]) -> Result<CommandOutput, ScratchError> {
        self.runner.run(&self.utmctl, args).await
    }

    /// Run a `utmctl` verb against `name`, mapping "not found" output.
    async fn utmctl_on(&self, verb: &str, name: &str) -> Result<CommandOutput, ScratchError> {
        let output = self.utmctl(&[verb, name]).await?;
        if !output.success() && reports_not_found(&output) {
            return Err(ScratchError::NotFound { name: name.into() });
        }
        output.check(&format!("utmctl {verb} {name}"))
    }

    fn config_plist(&self, name: &str) -> PathBuf {
        crate::paths::vm_config_plist(&self.documents, name)
    }
}

impl<R: CommandRunner> ControlPlane for UtmControlPlane<R> {
    async fn preflight(&self) -> Result<(), ScratchError> {
        if !program_exists(&self.utmctl) {
            return Err(ScratchError::PrerequisiteMissing {
                what: format!("utmctl ({})", self.utmctl),
                hint: "install UTM or set hypervisor.utmctl in scratchvm.toml".into(),
            });
        }
        let mut tools = vec![PLIST_BUDDY];
        if self.create_via == CreateVia::AppleScript {
            tools.push("osascript");
        }
        for tool in tools {
            if !program_exists(tool) {
                return Err(ScratchError::PrerequisiteMissing {
                    what: format!("`{tool}`"),
                    hint: "scratchvm drives UTM and needs the macOS scripting tools".into(),
                });
            }
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<VmSummary>, ScratchError> {
        let output = self.utmctl(&["list"]).await?.check("utmctl list")?;
        Ok(parse_list(&output.stdout))
    }

    async fn status(&self, name: &str) -> Result<PowerState, ScratchError> {
        let output = self.utmctl_on("status", name).await?;
        Ok(PowerState::parse(&output.stdout))
    }

    async fn create(&self, spec: &VmSpec) -> Result<VmRef, ScratchError> {
        if self.exists(&spec.name).await? {
            return Err(ScratchError::AlreadyExists {
                name: spec.name.clone(),
            });
        }

        match self.create_via {
            CreateVia::AppleScript => {
                let script = applescript::create_vm(spec, &self.architecture);
                self.runner
                    .run("osascript", &["-e", &script])
                    .await?
                    .check("osascript (create VM)")?;
            }
            CreateVia::Cli => {
                let iso = spec.iso.to_string_lossy();
                let memory = spec.memory_mib.to_string();
                let cpus = spec.cpus.to_string();
                let disk = spec.disk_gib.to_string();
                self.utmctl(&[
                    "create",
                    &spec.name,
                    "--iso",
                    &iso,
                    "--memory",
                    &memory,
                    "--cpus",
                    &cpus,
                    "--disk",
                    &disk,
                    "--network",
                    spec.network.as_str(),
                ])
                .await?
                .check("utmctl create")?;
            }
        }

        tracing::info!(name = %spec.name, via = ?self.create_via, "VM created");
        Ok(VmRef {
            name: spec.name.clone(),
        })
    }

    async fn clone_vm(&self, source: &str, new_name: &str) -> Result<VmRef, ScratchError> {
        let registered = self.list().await?;
        if !registered.iter().any(|vm| vm.name == source) {
            return Err(ScratchError::NotFound {
                name: source.into(),
            });
        }
        if registered.iter().any(|vm| vm.name == new_name) {
            return Err(ScratchError::AlreadyExists {
                name: new_name.into(),
            });
        }

        self.utmctl(&["clone", source, "--name", new_name])
            .await?
            .check(&format!("utmctl clone {source}"))?;
        tracing::info!(source, name = new_name, "VM cloned");
        Ok(VmRef {
            name: new_name.into(),
        })
    }

    async fn start(&self, name: &str) -> Result<(), ScratchError> {
        self.utmctl_on("start", name).await?;
        tracing::info!(name, "VM started");
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<(), ScratchError> {
        if self.status(name).await? == PowerState::Stopped {
            tracing::debug!(name, "VM already stopped");
            return Ok(());
        }
        self.utmctl_on("stop", name).await?;
        tracing::info!(name, "VM stopped");
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), ScratchError> {
        self.utmctl_on("delete", name).await?;
        Ok(())
    }

    async fn ip_addresses(&self, name: &str) -> Result<Vec<String>, ScratchError> {
        let output = self.utmctl(&["ip-address", name]).await?;
        if !output.success() {
            if reports_not_found(&output) {
                return Err(ScratchError::NotFound { name: name.into() });
            }
            // The guest agent is not answering yet.
            tracing::debug!(name, stderr = %output.stderr.trim(), "no address reported");
            return Ok(Vec::new());
        }
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect())
    }

    async fn mac_address(&self, name: &str) -> Result<Option<String>, ScratchError> {
        let plist_path = self.config_plist(name);
        let path = plist_path.to_string_lossy();
        let output = self
            .runner
            .run(PLIST_BUDDY, &["-c", "Print :Network:0:MacAddress", &path])
            .await?;
        if !output.success() {
            return Ok(None);
        }
        Ok(plist::parse_print(&output.stdout))
    }

    async fn edit_config(&self, name: &str, patch: &ConfigPatch) -> Result<(), ScratchError> {
        let plist_path = self.config_plist(name);
        if !plist_path.exists() {
            return Err(ScratchError::NotFound { name: name.into() });
        }
        let path = plist_path.to_string_lossy();
        let edit = plist::edit_for(patch);

        for command in &edit.clear {
            let output = self.runner.run(PLIST_BUDDY, &["-c", command, &path]).await?;
            if !output.success() {
                tracing::debug!(name, command, "nothing to clear");
            }
        }

        let mut args: Vec<&str> = Vec::with_capacity(edit.apply.len() * 2 + 1);
        for command in &edit.apply {
            args.push("-c");
            args.push(command);
        }
        args.push(&path);
        self.runner
            .run(PLIST_BUDDY, &args)
            .await?
            .check(&format!("PlistBuddy ({name})"))?;

        tracing::info!(name, ?patch, "config document edited");
        Ok(())
    }

    async fn restart(&self) -> Result<(), ScratchError> {
        tracing::info!(app = %self.app, "restarting hypervisor to reload config");
        let quit = applescript::quit_app(&self.app);
        self.runner
            .run("osascript", &["-e", &quit])
            .await?
            .check("osascript (quit)")?;
        tokio::time::sleep(self.settle).await;

        self.runner
            .run("open", &["-a", &self.app])
            .await?
            .check(&format!("open -a {}", self.app))?;
        tokio::time::sleep(self.settle).await;
        Ok(())
    }

    async fn neighbor_ip(&self, mac: &str) -> Result<Option<Ipv4Addr>, ScratchError> {
        let output = self.runner.run("arp", &["-an"]).await?.check("arp -an")?;
        Ok(crate::network::parse_arp_table(&output.stdout, mac))
    }
}

fn reports_not_found(output: &CommandOutput) -> bool {
    let text = format!("{}{}", output.stdout, output.stderr).to_ascii_lowercase();
    text.contains("not found") || text.contains("cannot find") || text.contains("does not exist")
}

/// Parse `utmctl list`:
///
/// ```text
/// UUID                                 Status   Name
/// 5C1E7A8E-0D0B-4C55-9E58-6B6A3A1F2C11 stopped  alpine-template
/// ```
fn parse_list(stdout: &str) -> Vec<VmSummary> {
    stdout
        .lines()
        .filter(|line| !line.trim_start().starts_with("UUID"))
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let _uuid = fields.next()?;
            let state = PowerState::parse(fields.next()?);
            let name = fields.collect::<Vec<_>>().join(" ");
            if name.is_empty() {
                return None;
            }
            Some(VmSummary { name, state })
        })
        .collect()
}
