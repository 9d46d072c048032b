//! Pipeline orchestrator.
//!
//! A workflow is a fixed list of [`Stage`]s executed strictly in order by
//! [`drive`]. Each stage either completes, is skipped, or completes in a
//! degraded way (a warning, not a failure). The first error ends the run
//! as [`Outcome::Failed`] with the failing stage; the workflow's cleanup
//! handle runs on every exit path.

pub mod cleanup;
pub mod clone;
pub mod provision;
pub mod template;

use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use crate::config::Config;
use crate::error::ScratchError;
use crate::paths;
use crate::report::ResultRecord;

pub use cleanup::Cleanup;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    // template creation
    Validate,
    PrepareAnswerFile,
    StartFileServer,
    CreateVm,
    ConfigureSerialConsole,
    RestartControlPlane,
    StartVm,
    RunInstallDriver,
    StopVm,
    DetachInstallMedia,
    AwaitIp,
    InjectSshKey,
    // clone + test
    CheckTemplateExists,
    CheckTargetNameFree,
    StopTemplateIfRunning,
    Clone,
    RandomizeMac,
    ApplyResourceOverrides,
    BootstrapAndTest,
    // provisioning
    ConnectivityPreflight,
    BootstrapPackages,
    CloneRepository,
    InstallToolchains,
    RunTestCommand,
    ReportAndPersistResult,
}

impl Stage {
    pub fn label(self) -> &'static str {
        match self {
            Stage::Validate => "Validate inputs",
            Stage::PrepareAnswerFile => "Prepare answer file",
            Stage::StartFileServer => "Start answer-file server",
            Stage::CreateVm => "Create VM",
            Stage::ConfigureSerialConsole => "Configure serial console",
            Stage::RestartControlPlane => "Restart hypervisor",
            Stage::StartVm => "Start VM",
            Stage::RunInstallDriver => "Run unattended install",
            Stage::StopVm => "Stop VM",
            Stage::DetachInstallMedia => "Detach install media",
            Stage::AwaitIp => "Wait for IP address",
            Stage::InjectSshKey => "Inject SSH key",
            Stage::CheckTemplateExists => "Check template",
            Stage::CheckTargetNameFree => "Check target name",
            Stage::StopTemplateIfRunning => "Stop template",
            Stage::Clone => "Clone template",
            Stage::RandomizeMac => "Randomize MAC address",
            Stage::ApplyResourceOverrides => "Apply resource overrides",
            Stage::BootstrapAndTest => "Bootstrap and test",
            Stage::ConnectivityPreflight => "Check SSH connectivity",
            Stage::BootstrapPackages => "Install base packages",
            Stage::CloneRepository => "Clone repository",
            Stage::InstallToolchains => "Install toolchains",
            Stage::RunTestCommand => "Run test command",
            Stage::ReportAndPersistResult => "Record result",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// How a stage that did not fail ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageResult {
    Done,
    Skipped(String),
    /// Completed without its goal; the pipeline continues with a warning.
    Degraded(String),
}

#[derive(Debug)]
pub struct WorkflowReport {
    pub vm: String,
    pub ip: Option<Ipv4Addr>,
    pub record: Option<ResultRecord>,
    pub warnings: Vec<String>,
}

#[derive(Debug)]
pub enum Outcome {
    Succeeded(WorkflowReport),
    Failed {
        stage: Stage,
        vm: String,
        cause: ScratchError,
    },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Succeeded(_))
    }
}

/// Host-side locations a workflow reads and writes.
#[derive(Debug, Clone)]
pub struct Workspace {
    /// Scratch files such as rendered answer files.
    pub work_dir: PathBuf,
    pub iso_cache: PathBuf,
    pub results_dir: PathBuf,
    pub key_dir: PathBuf,
}

impl Workspace {
    pub fn from_config(config: &Config) -> Self {
        Self {
            work_dir: paths::work_dir(),
            iso_cache: paths::iso_cache_dir(),
            results_dir: config.results_dir(),
            key_dir: config.ssh_key_dir(),
        }
    }
}

/// Receives stage progress from [`drive`].
pub trait Observer {
    fn workflow_started(&mut self, _workflow: &str, _vm: &str, _stages: &[Stage]) {}
    fn stage_started(&mut self, _index: usize, _stage: Stage) {}
    fn stage_finished(&mut self, _index: usize, _stage: Stage, _result: &StageResult) {}
    fn stage_failed(&mut self, _index: usize, _stage: Stage, _cause: &ScratchError) {}
}

#[allow(async_fn_in_trait)] // trait is internal-only
pub trait Workflow {
    fn name(&self) -> &'static str;

    fn vm_name(&self) -> &str;

    /// The full stage plan, fixed at construction.
    fn stages(&self) -> Vec<Stage>;

    async fn run_stage(&mut self, stage: Stage) -> Result<StageResult, ScratchError>;

    /// Scoped resources (servers, temp files) released on every exit path.
    fn cleanup(&self) -> &Cleanup;

    /// Hook for workflow-specific reporting before cleanup runs.
    fn on_failure(&mut self, _stage: Stage, _cause: &ScratchError) {}

    fn report(&mut self, warnings: Vec<String>) -> WorkflowReport;
}

/// Run every stage of `workflow` in order.
pub async fn drive<W: Workflow, O: Observer>(workflow: &mut W, observer: &mut O) -> Outcome {
    let stages = workflow.stages();
    tracing::info!(workflow = workflow.name(), vm = workflow.vm_name(), stages = stages.len(), "workflow started");
    observer.workflow_started(workflow.name(), workflow.vm_name(), &stages);

    let mut warnings = Vec::new();
    for (index, stage) in stages.iter().copied().enumerate() {
        tracing::info!(%stage, "stage started");
        observer.stage_started(index, stage);

        match workflow.run_stage(stage).await {
            Ok(result) => {
                match &result {
                    StageResult::Degraded(reason) => {
                        tracing::warn!(%stage, %reason, "stage degraded");
                        warnings.push(format!("{stage}: {reason}"));
                    }
                    StageResult::Skipped(reason) => tracing::info!(%stage, %reason, "stage skipped"),
                    StageResult::Done => tracing::debug!(%stage, "stage done"),
                }
                observer.stage_finished(index, stage, &result);
            }
            Err(cause) => {
                let vm = workflow.vm_name().to_string();
                tracing::error!(%stage, %vm, error = %cause, "stage failed");
                observer.stage_failed(index, stage, &cause);
                workflow.on_failure(stage, &cause);
                workflow.cleanup().run().await;
                return Outcome::Failed { stage, vm, cause };
            }
        }
    }

    workflow.cleanup().run().await;
    tracing::info!(workflow = workflow.name(), vm = workflow.vm_name(), "workflow succeeded");
    Outcome::Succeeded(workflow.report(warnings))
}
