//! Provisioning a running guest for a test run.
//!
//! Used on its own by `provision-for-testing`, and as the body of the
//! clone workflow's `BootstrapAndTest` stage.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use crate::config::RetryPolicy;
use crate::credentials::SshCredential;
use crate::error::ScratchError;
use crate::remote::bootstrap::{Executor, TestRun, Toolchain, inject_key};
use crate::remote::{Auth, RemoteTransport, Target};
use crate::report::{self, ResultRecord, RunContext};

use super::{Cleanup, Stage, StageResult, Workflow, WorkflowReport};

pub const DEFAULT_TEST_COMMAND: &str = "make test";

/// Directory on the guest holding repository checkouts.
pub const GUEST_WORK_DIR: &str = "/root/work";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestRequest {
    pub repo: Option<String>,
    pub command: String,
}

impl TestRequest {
    pub fn new(repo: Option<String>, command: Option<String>) -> Self {
        Self {
            repo,
            command: command.unwrap_or_else(|| DEFAULT_TEST_COMMAND.to_string()),
        }
    }
}

/// `/root/work/<repo name>` for a repository URL.
pub fn checkout_dir(repo: &str) -> String {
    let name = repo
        .trim_end_matches('/')
        .rsplit(['/', ':'])
        .next()
        .unwrap_or_default()
        .trim_end_matches(".git");
    let name = if name.is_empty() { "repo" } else { name };
    format!("{GUEST_WORK_DIR}/{name}")
}

/// Everything one provisioning run needs. Discarded after the run; nothing
/// carries over between invocations.
pub struct ProvisioningSession<'a, T> {
    executor: Executor<'a, T>,
    vm: String,
    credential: SshCredential,
    password: Option<String>,
    request: TestRequest,
    inject_policy: RetryPolicy,
    toolchains: Vec<Toolchain>,
    test_run: Option<TestRun>,
}

impl<'a, T: RemoteTransport> ProvisioningSession<'a, T> {
    pub const STAGES: [Stage; 6] = [
        Stage::ConnectivityPreflight,
        Stage::InjectSshKey,
        Stage::BootstrapPackages,
        Stage::CloneRepository,
        Stage::InstallToolchains,
        Stage::RunTestCommand,
    ];

    /// Sessions start with key auth. A known password is only used when
    /// the guest rejects the key, and then the key is injected.
    pub fn new(
        transport: &'a T,
        vm: &str,
        target: Target,
        credential: SshCredential,
        password: Option<String>,
        request: TestRequest,
        inject_policy: RetryPolicy,
    ) -> Self {
        let auth = Auth::Key(credential.private_key.clone());
        Self {
            executor: Executor::new(transport, target, auth),
            vm: vm.to_string(),
            credential,
            password,
            request,
            inject_policy,
            toolchains: Vec::new(),
            test_run: None,
        }
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.executor.target().host
    }

    pub fn request(&self) -> &TestRequest {
        &self.request
    }

    pub fn take_test_run(&mut self) -> Option<TestRun> {
        self.test_run.take()
    }

    fn project_dir(&self) -> String {
        match &self.request.repo {
            Some(repo) => checkout_dir(repo),
            None => GUEST_WORK_DIR.to_string(),
        }
    }

    pub async fn run_stage(&mut self, stage: Stage) -> Result<StageResult, ScratchError> {
        match stage {
            Stage::ConnectivityPreflight => match self.executor.preflight().await {
                Ok(()) => Ok(StageResult::Done),
                Err(key_err @ ScratchError::ConnectivityFailure { .. }) => {
                    let Some(password) = self.password.clone() else {
                        return Err(key_err);
                    };
                    tracing::info!(vm = %self.vm, error = %key_err, "key access failed, trying password");
                    self.executor.set_auth(Auth::Password(password));
                    self.executor.preflight().await?;
                    Ok(StageResult::Done)
                }
                Err(e) => Err(e),
            },
            Stage::InjectSshKey => {
                if matches!(self.executor.auth(), Auth::Key(_)) {
                    return Ok(StageResult::Skipped("already using key access".into()));
                }
                let public_key = self.credential.public_openssh()?;
                let result = inject_key(&self.executor, &public_key, self.inject_policy).await;
                if result.installed {
                    self.executor
                        .set_auth(Auth::Key(self.credential.private_key.clone()));
                    Ok(StageResult::Done)
                } else {
                    Ok(StageResult::Degraded(format!(
                        "key not installed after {} attempts ({}); using password access",
                        result.attempts,
                        result.last_error.unwrap_or_else(|| "unknown error".into())
                    )))
                }
            }
            Stage::BootstrapPackages => {
                self.executor.bootstrap_packages().await?;
                Ok(StageResult::Done)
            }
            Stage::CloneRepository => {
                let Some(repo) = self.request.repo.clone() else {
                    return Ok(StageResult::Skipped("no repository given".into()));
                };
                self.executor
                    .clone_repository(&repo, &checkout_dir(&repo))
                    .await?;
                Ok(StageResult::Done)
            }
            Stage::InstallToolchains => {
                let dir = self.project_dir();
                self.toolchains = self.executor.detect_toolchains(&dir).await?;
                if self.toolchains.is_empty() {
                    return Ok(StageResult::Skipped("no known project manifests".into()));
                }
                for toolchain in self.toolchains.clone() {
                    self.executor.install_toolchain(toolchain, &dir).await?;
                }
                Ok(StageResult::Done)
            }
            Stage::RunTestCommand => {
                let dir = self.project_dir();
                let run = self.executor.run_test(&dir, &self.request.command).await?;
                self.test_run = Some(run);
                Ok(StageResult::Done)
            }
            other => Err(ScratchError::Validation {
                message: format!("stage '{other}' is not a provisioning stage"),
            }),
        }
    }

    /// Run every provisioning stage in order, collecting degraded notes.
    pub async fn run_all(&mut self) -> Result<Vec<String>, ScratchError> {
        let mut notes = Vec::new();
        for stage in Self::STAGES {
            tracing::info!(vm = %self.vm, %stage, "provisioning");
            match self.run_stage(stage).await? {
                StageResult::Degraded(reason) => {
                    tracing::warn!(%stage, %reason, "provisioning stage degraded");
                    notes.push(format!("{stage}: {reason}"));
                }
                StageResult::Skipped(reason) => tracing::info!(%stage, %reason, "skipped"),
                StageResult::Done => {}
            }
        }
        Ok(notes)
    }

    /// Persist the captured test run, if any.
    pub fn persist(&mut self, results_dir: &std::path::Path) -> Result<Option<ResultRecord>, ScratchError> {
        let Some(run) = self.test_run.take() else {
            return Ok(None);
        };
        persist_run(results_dir, &self.vm, Some(self.ip()), &self.request, &run).map(Some)
    }
}

pub(crate) fn persist_run(
    results_dir: &std::path::Path,
    vm: &str,
    ip: Option<Ipv4Addr>,
    request: &TestRequest,
    run: &TestRun,
) -> Result<ResultRecord, ScratchError> {
    report::persist(
        results_dir,
        &RunContext {
            vm,
            ip,
            repo: request.repo.as_deref(),
            command: &request.command,
        },
        run,
    )
}

/// `provision-for-testing`: provision an already-running guest by IP.
pub struct ProvisionWorkflow<'a, T> {
    session: ProvisioningSession<'a, T>,
    results_dir: PathBuf,
    cleanup: Cleanup,
    record: Option<ResultRecord>,
}

impl<'a, T: RemoteTransport> ProvisionWorkflow<'a, T> {
    pub fn new(session: ProvisioningSession<'a, T>, results_dir: PathBuf) -> Self {
        Self {
            session,
            results_dir,
            cleanup: Cleanup::new(),
            record: None,
        }
    }
}

impl<T: RemoteTransport> Workflow for ProvisionWorkflow<'_, T> {
    fn name(&self) -> &'static str {
        "provision-for-testing"
    }

    fn vm_name(&self) -> &str {
        &self.session.vm
    }

    fn stages(&self) -> Vec<Stage> {
        let mut stages = ProvisioningSession::<T>::STAGES.to_vec();
        stages.push(Stage::ReportAndPersistResult);
        stages
    }

    async fn run_stage(&mut self, stage: Stage) -> Result<StageResult, ScratchError> {
        match stage {
            Stage::ReportAndPersistResult => match self.session.persist(&self.results_dir)? {
                Some(record) => {
                    self.record = Some(record);
                    Ok(StageResult::Done)
                }
                None => Ok(StageResult::Skipped("no test run to record".into())),
            },
            other => self.session.run_stage(other).await,
        }
    }

    fn cleanup(&self) -> &Cleanup {
        &self.cleanup
    }

    fn report(&mut self, warnings: Vec<String>) -> WorkflowReport {
        WorkflowReport {
            vm: self.session.vm.clone(),
            ip: Some(self.session.ip()),
            record: self.record.take(),
            warnings,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::pipeline::{Outcome, drive};
    use crate::remote::ExecOutput;
    use crate::report::TestStatus;
    use crate::testing::{FakeTransport, Recorder, write_key_pair};

    fn ok(output: &str) -> Result<ExecOutput, ScratchError> {
        Ok(ExecOutput {
            exit_code: 0,
            output: output.into(),
        })
    }

    fn session<'a>(
        transport: &'a FakeTransport,
        keys: &std::path::Path,
        password: Option<&str>,
        request: TestRequest,
    ) -> ProvisioningSession<'a, FakeTransport> {
        write_key_pair(keys, "id_ed25519");
        let credential = SshCredential::load(keys, "id_ed25519").unwrap();
        ProvisioningSession::new(
            transport,
            "ci-1",
            Target::new(Ipv4Addr::new(192, 168, 64, 5), "root"),
            credential,
            password.map(str::to_string),
            request,
            RetryPolicy::new(5, Duration::ZERO),
        )
    }

    #[test]
    fn checkout_dir_uses_repo_basename() {
        assert_eq!(checkout_dir("https://github.com/acme/widget.git"), "/root/work/widget");
        assert_eq!(checkout_dir("git@github.com:acme/widget"), "/root/work/widget");
        assert_eq!(checkout_dir("https://example.com/acme/widget/"), "/root/work/widget");
    }

    #[tokio::test]
    async fn failing_test_is_recorded_and_pipeline_succeeds() {
        let keys = tempfile::tempdir().unwrap();
        let results = tempfile::tempdir().unwrap();
        let transport = FakeTransport::new(|script, _| {
            if script.contains("( exit 7 )") {
                return Ok(ExecOutput {
                    exit_code: 7,
                    output: "FAIL: widget_test\n".into(),
                });
            }
            if script.starts_with("test -f") {
                return Ok(ExecOutput { exit_code: 1, output: String::new() });
            }
            ok("")
        });
        let session = session(
            &transport,
            keys.path(),
            Some("alpine"),
            TestRequest::new(Some("https://example.com/acme/widget.git".into()), Some("exit 7".into())),
        );
        let mut workflow = ProvisionWorkflow::new(session, results.path().to_path_buf());
        let mut recorder = Recorder::default();

        let outcome = drive(&mut workflow, &mut recorder).await;
        let Outcome::Succeeded(report) = outcome else {
            panic!("pipeline should succeed even when the test fails");
        };
        let record = report.record.unwrap();
        assert_eq!(record.exit_code, 7);
        assert_eq!(record.status, TestStatus::Failed);
        assert_eq!(
            std::fs::read_to_string(record.dir.join("status")).unwrap(),
            "FAILED\n"
        );
        assert_eq!(
            std::fs::read_to_string(record.dir.join("exit_code")).unwrap(),
            "7\n"
        );
        assert_eq!(
            std::fs::read_to_string(record.dir.join("output.log")).unwrap(),
            "FAIL: widget_test\n"
        );
        assert_eq!(recorder.finished().len(), 7);
    }

    #[tokio::test]
    async fn key_access_is_preferred_over_a_known_password() {
        let keys = tempfile::tempdir().unwrap();
        let transport = FakeTransport::new(|_, _| ok("")).accepting(|auth| matches!(auth, Auth::Key(_)));
        let mut session = session(&transport, keys.path(), Some("not-the-guest-password"), TestRequest::new(None, None));

        assert_eq!(session.run_stage(Stage::ConnectivityPreflight).await.unwrap(), StageResult::Done);
        assert_eq!(
            session.run_stage(Stage::InjectSshKey).await.unwrap(),
            StageResult::Skipped("already using key access".into())
        );
        session.run_stage(Stage::BootstrapPackages).await.unwrap();

        assert!(transport.auths().iter().all(|a| matches!(a, Auth::Key(_))));
        assert_eq!(transport.count_matching("authorized_keys"), 0);
    }

    #[tokio::test]
    async fn rejected_key_falls_back_to_password_then_injects() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicBool, Ordering};

        let keys = tempfile::tempdir().unwrap();
        let installed = Arc::new(AtomicBool::new(false));
        let transport = {
            let installed_by_script = installed.clone();
            let installed_for_gate = installed.clone();
            FakeTransport::new(move |script, _| {
                if script.contains("authorized_keys") {
                    installed_by_script.store(true, Ordering::SeqCst);
                }
                ok("")
            })
            .accepting(move |auth| match auth {
                Auth::Key(_) => installed_for_gate.load(Ordering::SeqCst),
                Auth::Password(p) => p == "alpine",
            })
        };
        let mut session = session(&transport, keys.path(), Some("alpine"), TestRequest::new(None, None));

        session.run_stage(Stage::ConnectivityPreflight).await.unwrap();
        assert_eq!(session.run_stage(Stage::InjectSshKey).await.unwrap(), StageResult::Done);
        session.run_stage(Stage::BootstrapPackages).await.unwrap();

        let auths = transport.auths();
        assert!(matches!(auths[0], Auth::Key(_)));
        assert!(matches!(auths[1], Auth::Password(_)));
        assert!(matches!(auths.last(), Some(Auth::Key(_))));
        assert!(installed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn rejected_key_without_password_fails_preflight() {
        let keys = tempfile::tempdir().unwrap();
        let transport = FakeTransport::new(|_, _| ok("")).accepting(|_| false);
        let mut session = session(&transport, keys.path(), None, TestRequest::new(None, None));

        let err = session.run_stage(Stage::ConnectivityPreflight).await.unwrap_err();
        assert!(matches!(err, ScratchError::ConnectivityFailure { .. }));
        assert_eq!(transport.auths().len(), 1);
    }

    #[tokio::test]
    async fn unreachable_guest_fails_at_preflight() {
        let keys = tempfile::tempdir().unwrap();
        let results = tempfile::tempdir().unwrap();
        let transport = FakeTransport::new(|_, _| {
            Err(ScratchError::ConnectivityFailure {
                target: "root@192.168.64.5:22".into(),
                message: "connection refused".into(),
            })
        });
        let session = session(&transport, keys.path(), None, TestRequest::new(None, None));
        let mut workflow = ProvisionWorkflow::new(session, results.path().to_path_buf());

        let outcome = drive(&mut workflow, &mut Recorder::default()).await;
        match outcome {
            Outcome::Failed { stage, vm, cause } => {
                assert_eq!(stage, Stage::ConnectivityPreflight);
                assert_eq!(vm, "ci-1");
                assert_eq!(cause.exit_code(), 2);
            }
            Outcome::Succeeded(_) => panic!("expected failure"),
        }
        assert_eq!(transport.calls().len(), 1);
        assert!(std::fs::read_dir(results.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn injection_exhaustion_is_a_warning() {
        let keys = tempfile::tempdir().unwrap();
        let results = tempfile::tempdir().unwrap();
        let transport = FakeTransport::new(|script, _| {
            if script.contains("authorized_keys") {
                return Ok(ExecOutput { exit_code: 1, output: "read-only file system".into() });
            }
            if script.starts_with("test -f") {
                return Ok(ExecOutput { exit_code: 1, output: String::new() });
            }
            ok("all green\n")
        })
        .accepting(|auth| matches!(auth, Auth::Password(_)));
        let session = session(&transport, keys.path(), Some("alpine"), TestRequest::new(None, None));
        let mut workflow = ProvisionWorkflow::new(session, results.path().to_path_buf());

        let Outcome::Succeeded(report) = drive(&mut workflow, &mut Recorder::default()).await else {
            panic!("expected success");
        };
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("Inject SSH key"));
        assert_eq!(report.record.unwrap().status, TestStatus::Passed);
        // the key was refused once, then every session stayed on password auth
        let auths = transport.auths();
        assert!(matches!(auths[0], Auth::Key(_)));
        assert!(auths[1..].iter().all(|a| matches!(a, Auth::Password(_))));
    }

    #[tokio::test]
    async fn detected_toolchains_are_all_installed() {
        let keys = tempfile::tempdir().unwrap();
        let transport = FakeTransport::new(|script, _| {
            if script.starts_with("test -f") {
                let hit = script.contains("/Cargo.toml") || script.contains("/go.mod");
                return Ok(ExecOutput { exit_code: if hit { 0 } else { 1 }, output: String::new() });
            }
            ok("")
        });
        let mut session = session(
            &transport,
            keys.path(),
            None,
            TestRequest::new(Some("https://example.com/mixed.git".into()), None),
        );

        let result = session.run_stage(Stage::InstallToolchains).await.unwrap();
        assert_eq!(result, StageResult::Done);
        assert_eq!(transport.count_matching("cargo fetch"), 1);
        assert_eq!(transport.count_matching("go mod download"), 1);
        assert_eq!(transport.count_matching("npm install"), 0);
        assert!(transport.calls().iter().any(|c| c.contains("'/root/work/mixed/go.mod'")));
    }
}
