//! Clone + test: copy the template into a fresh VM, boot it, and
//! optionally provision it and run a test command.

use std::net::Ipv4Addr;

use crate::config::{Config, validate_resources};
use crate::control::{ConfigPatch, ControlPlane, PowerState, remove_vm};
use crate::credentials::SshCredential;
use crate::error::ScratchError;
use crate::network::discover_ip;
use crate::remote::bootstrap::TestRun;
use crate::remote::{RemoteTransport, Target};
use crate::report::ResultRecord;
use crate::util::{random_mac, validate_vm_name};

use super::provision::{ProvisioningSession, TestRequest, persist_run};
use super::{Cleanup, Stage, StageResult, Workflow, WorkflowReport, Workspace};

#[derive(Debug, Clone)]
pub struct CloneOptions {
    pub name: String,
    pub template: String,
    pub memory_mib: Option<u64>,
    pub cpus: Option<u32>,
    pub ssh_key: String,
    /// Delete an existing VM with the target name instead of failing.
    pub force: bool,
    pub test: Option<TestRequest>,
}

pub struct CloneWorkflow<'a, C, T> {
    control: &'a C,
    transport: &'a T,
    config: &'a Config,
    workspace: Workspace,
    options: CloneOptions,
    cleanup: Cleanup,
    credential: Option<SshCredential>,
    ip: Option<Ipv4Addr>,
    test_run: Option<TestRun>,
    record: Option<ResultRecord>,
}

impl<'a, C: ControlPlane, T: RemoteTransport> CloneWorkflow<'a, C, T> {
    pub fn new(
        control: &'a C,
        transport: &'a T,
        config: &'a Config,
        workspace: Workspace,
        options: CloneOptions,
    ) -> Self {
        Self {
            control,
            transport,
            config,
            workspace,
            options,
            cleanup: Cleanup::new(),
            credential: None,
            ip: None,
            test_run: None,
            record: None,
        }
    }

    async fn check_template(&mut self) -> Result<StageResult, ScratchError> {
        validate_vm_name(&self.options.name)?;
        validate_resources(self.options.memory_mib, self.options.cpus, None)?;
        self.control.preflight().await?;
        if self.options.test.is_some() {
            self.credential = Some(SshCredential::load(
                &self.workspace.key_dir,
                &self.options.ssh_key,
            )?);
        }
        if !self.control.exists(&self.options.template).await? {
            return Err(ScratchError::NotFound {
                name: self.options.template.clone(),
            });
        }
        Ok(StageResult::Done)
    }

    async fn check_target(&mut self) -> Result<StageResult, ScratchError> {
        let name = &self.options.name;
        if name == &self.options.template {
            return Err(ScratchError::Validation {
                message: format!("clone name '{name}' is the template's name"),
            });
        }
        if !self.control.exists(name).await? {
            return Ok(StageResult::Done);
        }
        if !self.options.force {
            return Err(ScratchError::AlreadyExists { name: name.clone() });
        }
        tracing::info!(%name, "replacing existing VM");
        remove_vm(self.control, name).await?;
        Ok(StageResult::Done)
    }

    async fn apply_overrides(&mut self) -> Result<StageResult, ScratchError> {
        let mut patches = Vec::new();
        if let Some(mib) = self.options.memory_mib {
            patches.push(ConfigPatch::MemoryMib(mib));
        }
        if let Some(cpus) = self.options.cpus {
            patches.push(ConfigPatch::CpuCount(cpus));
        }
        if patches.is_empty() {
            return Ok(StageResult::Skipped("template resources kept".into()));
        }
        for patch in &patches {
            self.control.edit_config(&self.options.name, patch).await?;
        }
        Ok(StageResult::Done)
    }

    async fn bootstrap_and_test(&mut self) -> Result<StageResult, ScratchError> {
        let Some(request) = self.options.test.clone() else {
            return Ok(StageResult::Skipped("no test requested".into()));
        };
        let Some(ip) = self.ip else {
            return Ok(StageResult::Skipped("guest IP unknown".into()));
        };
        let credential = match self.credential.clone() {
            Some(credential) => credential,
            None => SshCredential::load(&self.workspace.key_dir, &self.options.ssh_key)?,
        };

        let mut session = ProvisioningSession::new(
            self.transport,
            &self.options.name,
            Target::new(ip, self.config.ssh.user.clone()),
            credential,
            Some(self.config.template.password.clone()),
            request,
            self.config.inject_policy(),
        );
        let notes = session.run_all().await?;
        self.test_run = session.take_test_run();

        if notes.is_empty() {
            Ok(StageResult::Done)
        } else {
            Ok(StageResult::Degraded(notes.join("; ")))
        }
    }

    fn persist(&mut self) -> Result<StageResult, ScratchError> {
        let (Some(run), Some(request)) = (self.test_run.take(), self.options.test.as_ref()) else {
            return Ok(StageResult::Skipped("no test run to record".into()));
        };
        let record = persist_run(
            &self.workspace.results_dir,
            &self.options.name,
            self.ip,
            request,
            &run,
        )?;
        self.record = Some(record);
        Ok(StageResult::Done)
    }
}

impl<C: ControlPlane, T: RemoteTransport> Workflow for CloneWorkflow<'_, C, T> {
    fn name(&self) -> &'static str {
        "clone"
    }

    fn vm_name(&self) -> &str {
        &self.options.name
    }

    fn stages(&self) -> Vec<Stage> {
        vec![
            Stage::CheckTemplateExists,
            Stage::CheckTargetNameFree,
            Stage::StopTemplateIfRunning,
            Stage::Clone,
            Stage::RandomizeMac,
            Stage::ApplyResourceOverrides,
            Stage::RestartControlPlane,
            Stage::StartVm,
            Stage::AwaitIp,
            Stage::BootstrapAndTest,
            Stage::ReportAndPersistResult,
        ]
    }

    async fn run_stage(&mut self, stage: Stage) -> Result<StageResult, ScratchError> {
        let name = self.options.name.clone();
        match stage {
            Stage::CheckTemplateExists => self.check_template().await,
            Stage::CheckTargetNameFree => self.check_target().await,
            Stage::StopTemplateIfRunning => {
                if self.control.status(&self.options.template).await? == PowerState::Stopped {
                    return Ok(StageResult::Skipped("template already stopped".into()));
                }
                self.control.stop(&self.options.template).await?;
                Ok(StageResult::Done)
            }
            Stage::Clone => {
                self.control.clone_vm(&self.options.template, &name).await?;
                Ok(StageResult::Done)
            }
            Stage::RandomizeMac => {
                let mac = random_mac();
                tracing::info!(%name, %mac, "assigning MAC address");
                self.control
                    .edit_config(&name, &ConfigPatch::MacAddress(mac))
                    .await?;
                Ok(StageResult::Done)
            }
            Stage::ApplyResourceOverrides => self.apply_overrides().await,
            Stage::RestartControlPlane => {
                self.control.restart().await?;
                Ok(StageResult::Done)
            }
            Stage::StartVm => {
                self.control.start(&name).await?;
                Ok(StageResult::Done)
            }
            Stage::AwaitIp => match discover_ip(self.control, &name, self.config.probe_policy()).await {
                Ok(ip) => {
                    self.ip = Some(ip);
                    Ok(StageResult::Done)
                }
                Err(ScratchError::Timeout { attempts, .. }) => Ok(StageResult::Degraded(format!(
                    "no IP after {attempts} attempts; find it on the VM console"
                ))),
                Err(e) => Err(e),
            },
            Stage::BootstrapAndTest => self.bootstrap_and_test().await,
            Stage::ReportAndPersistResult => self.persist(),
            other => Err(ScratchError::Validation {
                message: format!("stage '{other}' is not part of the clone workflow"),
            }),
        }
    }

    fn cleanup(&self) -> &Cleanup {
        &self.cleanup
    }

    fn report(&mut self, warnings: Vec<String>) -> WorkflowReport {
        WorkflowReport {
            vm: self.options.name.clone(),
            ip: self.ip,
            record: self.record.take(),
            warnings,
        }
    }
}
