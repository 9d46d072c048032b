//! Template creation: unattended install of a fresh VM, then key
//! injection, leaving a stopped VM with its install media detached.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{Config, validate_resources};
use crate::control::{ConfigPatch, ControlPlane, NetworkMode, VmSpec, remove_vm};
use crate::credentials::SshCredential;
use crate::error::ScratchError;
use crate::install::answer_server::AnswerServer;
use crate::install::answerfile::{self, AnswerFileSpec};
use crate::install::console::ConsoleConnector;
use crate::install::media::ensure_iso;
use crate::install::run_install;
use crate::install::transcript::AlpineTranscript;
use crate::network::discover_ip;
use crate::paths;
use crate::remote::bootstrap::{Executor, inject_key};
use crate::remote::{Auth, RemoteTransport, Target};
use crate::util::validate_vm_name;

use super::{Cleanup, Stage, StageResult, Workflow, WorkflowReport, Workspace};

#[derive(Debug, Clone)]
pub struct TemplateOptions {
    pub name: String,
    /// Local path or URL; falls back to `template.iso_url`.
    pub iso: Option<String>,
    pub memory_mib: u64,
    pub cpus: u32,
    pub disk_gib: u64,
    pub password: String,
    pub ssh_key: String,
    pub network: NetworkMode,
    pub force: bool,
}

impl TemplateOptions {
    /// Options taken entirely from the `[template]` and `[ssh]` sections.
    pub fn from_config(config: &Config) -> Result<Self, ScratchError> {
        let template = &config.template;
        Ok(Self {
            name: template.name.clone(),
            iso: template.iso.clone(),
            memory_mib: template.ram_mb,
            cpus: template.cpus,
            disk_gib: template.disk_gb,
            password: template.password.clone(),
            ssh_key: config.ssh.key.clone(),
            network: NetworkMode::parse(&template.network)?,
            force: false,
        })
    }
}

pub struct TemplateWorkflow<'a, C, T, K> {
    control: &'a C,
    transport: &'a T,
    console: &'a K,
    config: &'a Config,
    workspace: Workspace,
    options: TemplateOptions,
    cleanup: Cleanup,
    credential: Option<SshCredential>,
    iso: Option<PathBuf>,
    answers: Option<String>,
    answer_url: Option<String>,
    created: bool,
    ip: Option<Ipv4Addr>,
}

impl<'a, C, T, K> TemplateWorkflow<'a, C, T, K>
where
    C: ControlPlane,
    T: RemoteTransport,
    K: ConsoleConnector,
{
    pub fn new(
        control: &'a C,
        transport: &'a T,
        console: &'a K,
        config: &'a Config,
        workspace: Workspace,
        options: TemplateOptions,
    ) -> Self {
        Self {
            control,
            transport,
            console,
            config,
            workspace,
            options,
            cleanup: Cleanup::new(),
            credential: None,
            iso: None,
            answers: None,
            answer_url: None,
            created: false,
            ip: None,
        }
    }

    fn answer_file_name(&self) -> String {
        format!("{}.answers", self.options.name)
    }

    fn credential(&self) -> Result<&SshCredential, ScratchError> {
        self.credential.as_ref().ok_or_else(|| ScratchError::Validation {
            message: "SSH credential not loaded".into(),
        })
    }

    /// Prerequisites and naming checks. Nothing external is mutated unless
    /// the caller asked for an existing VM to be replaced.
    async fn validate(&mut self) -> Result<StageResult, ScratchError> {
        validate_vm_name(&self.options.name)?;
        validate_resources(
            Some(self.options.memory_mib),
            Some(self.options.cpus),
            Some(self.options.disk_gib),
        )?;
        self.control.preflight().await?;
        self.credential = Some(SshCredential::load(
            &self.workspace.key_dir,
            &self.options.ssh_key,
        )?);

        // Name conflicts surface before any media download.
        let exists = self.control.exists(&self.options.name).await?;
        if exists && !self.options.force {
            return Err(ScratchError::AlreadyExists {
                name: self.options.name.clone(),
            });
        }

        self.iso = Some(
            ensure_iso(
                self.options.iso.as_deref(),
                self.config.template.iso_url.as_deref(),
                &self.workspace.iso_cache,
            )
            .await?,
        );

        if exists {
            tracing::info!(name = %self.options.name, "replacing existing VM");
            remove_vm(self.control, &self.options.name).await?;
        }
        Ok(StageResult::Done)
    }

    fn prepare_answer_file(&mut self) -> Result<StageResult, ScratchError> {
        let public_key = self.credential()?.public_openssh()?;
        let contents = answerfile::render(&AnswerFileSpec {
            hostname: &self.config.template.hostname,
            root_ssh_key: Some(&public_key),
            ..Default::default()
        });

        let path = paths::answer_file_path(&self.workspace.work_dir, &self.options.name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ScratchError::Io {
                context: format!("creating {}", parent.display()),
                source: e,
            })?;
        }
        std::fs::write(&path, &contents).map_err(|e| ScratchError::Io {
            context: format!("writing answer file {}", path.display()),
            source: e,
        })?;
        self.cleanup.register_file(path);
        self.answers = Some(contents);
        Ok(StageResult::Done)
    }

    async fn start_file_server(&mut self) -> Result<StageResult, ScratchError> {
        let contents = self.answers.clone().ok_or_else(|| ScratchError::Validation {
            message: "answer file not prepared".into(),
        })?;
        let bind = SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.config.install.answer_port));
        let server = AnswerServer::start(bind, &self.answer_file_name(), contents).await?;
        self.answer_url = Some(server.url(&self.config.install.host_address));
        self.cleanup.register_server(server);
        Ok(StageResult::Done)
    }

    async fn install(&mut self) -> Result<StageResult, ScratchError> {
        let answer_url = self.answer_url.clone().ok_or_else(|| ScratchError::Validation {
            message: "answer-file server not started".into(),
        })?;
        let transcript = AlpineTranscript {
            answer_url,
            root_password: self.options.password.clone(),
            prompt_timeout: Duration::from_secs(self.config.install.prompt_timeout_s),
            completion_timeout: Duration::from_secs(self.config.install.completion_timeout_s),
        }
        .build()?;

        let result = run_install(self.console, &transcript).await;
        // the installer has fetched its answers either way
        self.cleanup.release_server().await;
        result?;
        Ok(StageResult::Done)
    }

    async fn inject_key(&mut self) -> Result<StageResult, ScratchError> {
        let Some(ip) = self.ip else {
            return Ok(StageResult::Skipped("guest IP unknown".into()));
        };
        let public_key = self.credential()?.public_openssh()?;
        let executor = Executor::new(
            self.transport,
            Target::new(ip, self.config.ssh.user.clone()),
            Auth::Password(self.options.password.clone()),
        );
        let result = inject_key(&executor, &public_key, self.config.inject_policy()).await;
        if result.installed {
            Ok(StageResult::Done)
        } else {
            Ok(StageResult::Degraded(format!(
                "key not installed after {} attempts; template is password-only",
                result.attempts
            )))
        }
    }
}

impl<C, T, K> Workflow for TemplateWorkflow<'_, C, T, K>
where
    C: ControlPlane,
    T: RemoteTransport,
    K: ConsoleConnector,
{
    fn name(&self) -> &'static str {
        "create-template"
    }

    fn vm_name(&self) -> &str {
        &self.options.name
    }

    fn stages(&self) -> Vec<Stage> {
        vec![
            Stage::Validate,
            Stage::PrepareAnswerFile,
            Stage::StartFileServer,
            Stage::CreateVm,
            Stage::ConfigureSerialConsole,
            Stage::RestartControlPlane,
            Stage::StartVm,
            Stage::RunInstallDriver,
            Stage::StopVm,
            Stage::DetachInstallMedia,
            Stage::RestartControlPlane,
            Stage::StartVm,
            Stage::AwaitIp,
            Stage::InjectSshKey,
            Stage::StopVm,
        ]
    }

    async fn run_stage(&mut self, stage: Stage) -> Result<StageResult, ScratchError> {
        let name = self.options.name.clone();
        match stage {
            Stage::Validate => self.validate().await,
            Stage::PrepareAnswerFile => self.prepare_answer_file(),
            Stage::StartFileServer => self.start_file_server().await,
            Stage::CreateVm => {
                let iso = self.iso.clone().ok_or_else(|| ScratchError::Validation {
                    message: "install media not resolved".into(),
                })?;
                let spec = VmSpec {
                    name: name.clone(),
                    iso,
                    memory_mib: self.options.memory_mib,
                    cpus: self.options.cpus,
                    disk_gib: self.options.disk_gib,
                    network: self.options.network,
                };
                self.control.create(&spec).await?;
                self.created = true;
                Ok(StageResult::Done)
            }
            Stage::ConfigureSerialConsole => {
                let port = self.config.install.serial_port;
                self.control
                    .edit_config(&name, &ConfigPatch::SerialConsole { port })
                    .await?;
                Ok(StageResult::Done)
            }
            Stage::RestartControlPlane => {
                self.control.restart().await?;
                Ok(StageResult::Done)
            }
            Stage::StartVm => {
                self.control.start(&name).await?;
                Ok(StageResult::Done)
            }
            Stage::RunInstallDriver => self.install().await,
            Stage::StopVm => {
                self.control.stop(&name).await?;
                Ok(StageResult::Done)
            }
            Stage::DetachInstallMedia => {
                self.control
                    .edit_config(&name, &ConfigPatch::DetachInstallMedia)
                    .await?;
                Ok(StageResult::Done)
            }
            Stage::AwaitIp => match discover_ip(self.control, &name, self.config.probe_policy()).await {
                Ok(ip) => {
                    self.ip = Some(ip);
                    Ok(StageResult::Done)
                }
                Err(ScratchError::Timeout { attempts, .. }) => Ok(StageResult::Degraded(format!(
                    "no IP after {attempts} attempts; key injection skipped"
                ))),
                Err(e) => Err(e),
            },
            Stage::InjectSshKey => self.inject_key().await,
            other => Err(ScratchError::Validation {
                message: format!("stage '{other}' is not part of template creation"),
            }),
        }
    }

    fn cleanup(&self) -> &Cleanup {
        &self.cleanup
    }

    fn on_failure(&mut self, stage: Stage, _cause: &ScratchError) {
        if self.created {
            tracing::warn!(
                vm = %self.options.name,
                %stage,
                "partially built VM left registered; remove it with `scratchvm destroy {}`",
                self.options.name
            );
        }
    }

    fn report(&mut self, warnings: Vec<String>) -> WorkflowReport {
        WorkflowReport {
            vm: self.options.name.clone(),
            ip: self.ip,
            record: None,
            warnings,
        }
    }
}
