//! In-memory stand-ins for the hypervisor, the guest SSH server and the
//! serial console, shared by unit tests across the crate.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::{Arc, Mutex};

use rand_core::OsRng;
use ssh_key::{Algorithm, LineEnding, PrivateKey};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

use crate::config::Config;
use crate::control::{ConfigPatch, ControlPlane, PowerState, VmRef, VmSpec, VmSummary};
use crate::error::ScratchError;
use crate::install::console::ConsoleConnector;
use crate::pipeline::{Observer, Stage, StageResult, Workspace};
use crate::remote::{Auth, ExecOutput, RemoteTransport, Target};
use crate::runner::{CommandOutput, CommandRunner};
use crate::util::random_mac;

// ── host commands ─────────────────────────────────────────

type Script = dyn Fn(&str, &[&str]) -> CommandOutput;

/// A [`CommandRunner`] answering from a closure and recording every call
/// as `"program arg1 arg2"`.
pub struct ScriptedRunner {
    script: Box<Script>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub fn new(script: impl Fn(&str, &[&str]) -> CommandOutput + 'static) -> Self {
        Self {
            script: Box::new(script),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl CommandRunner for ScriptedRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, ScratchError> {
        let mut line = program.to_string();
        for arg in args {
            line.push(' ');
            line.push_str(arg);
        }
        self.calls.lock().unwrap().push(line);
        Ok((self.script)(program, args))
    }
}

// ── control plane ─────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeVm {
    pub state: PowerState,
    pub mac: String,
    pub memory_mib: u64,
    pub cpus: u32,
    pub media_attached: bool,
    pub serial_port: Option<u16>,
    /// Config edited since the last hypervisor restart.
    pub dirty: bool,
}

impl FakeVm {
    fn new() -> Self {
        Self {
            state: PowerState::Stopped,
            mac: random_mac(),
            memory_mib: 2048,
            cpus: 2,
            media_attached: false,
            serial_port: None,
            dirty: false,
        }
    }
}

#[derive(Default)]
struct Hypervisor {
    vms: BTreeMap<String, FakeVm>,
    /// Per-name readiness: the address shows up once polls exceed the count.
    ips: HashMap<String, (u32, String)>,
    polls: HashMap<String, u32>,
    neighbor: Option<Ipv4Addr>,
    calls: Vec<String>,
}

impl Hypervisor {
    fn vm_mut(&mut self, name: &str) -> Result<&mut FakeVm, ScratchError> {
        self.vms.get_mut(name).ok_or_else(|| ScratchError::NotFound { name: name.into() })
    }
}

/// A hypervisor that keeps its registry in memory and enforces the
/// restart-after-edit rule on `start`.
#[derive(Default)]
pub struct FakeControlPlane {
    inner: Mutex<Hypervisor>,
}

impl FakeControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_vm(&self, name: &str) {
        self.inner.lock().unwrap().vms.insert(name.into(), FakeVm::new());
    }

    pub fn set_state(&self, name: &str, state: PowerState) {
        if let Some(vm) = self.inner.lock().unwrap().vms.get_mut(name) {
            vm.state = state;
        }
    }

    /// Report `ip` for `name` once more than `polls_before_ready` queries
    /// have been made. Applies to VMs created later under that name too.
    pub fn set_ip_after(&self, name: &str, polls_before_ready: u32, ip: &str) {
        self.inner
            .lock()
            .unwrap()
            .ips
            .insert(name.into(), (polls_before_ready, ip.into()));
    }

    pub fn ip_polls(&self, name: &str) -> u32 {
        self.inner.lock().unwrap().polls.get(name).copied().unwrap_or(0)
    }

    pub fn set_neighbor(&self, ip: &str) {
        self.inner.lock().unwrap().neighbor = ip.parse().ok();
    }

    pub fn vm(&self, name: &str) -> Option<FakeVm> {
        self.inner.lock().unwrap().vms.get(name).cloned()
    }

    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().calls.clone()
    }

    fn record(&self, call: String) {
        self.inner.lock().unwrap().calls.push(call);
    }
}

impl ControlPlane for FakeControlPlane {
    async fn preflight(&self) -> Result<(), ScratchError> {
        self.record("preflight".into());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<VmSummary>, ScratchError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .vms
            .iter()
            .map(|(name, vm)| VmSummary {
                name: name.clone(),
                state: vm.state,
            })
            .collect())
    }

    async fn status(&self, name: &str) -> Result<PowerState, ScratchError> {
        let mut inner = self.inner.lock().unwrap();
        Ok(inner.vm_mut(name)?.state)
    }

    async fn create(&self, spec: &VmSpec) -> Result<VmRef, ScratchError> {
        self.record(format!("create {}", spec.name));
        let mut inner = self.inner.lock().unwrap();
        if inner.vms.contains_key(&spec.name) {
            return Err(ScratchError::AlreadyExists { name: spec.name.clone() });
        }
        let vm = FakeVm {
            memory_mib: spec.memory_mib,
            cpus: spec.cpus,
            media_attached: true,
            ..FakeVm::new()
        };
        inner.vms.insert(spec.name.clone(), vm);
        Ok(VmRef { name: spec.name.clone() })
    }

    async fn clone_vm(&self, source: &str, new_name: &str) -> Result<VmRef, ScratchError> {
        self.record(format!("clone {source} {new_name}"));
        let mut inner = self.inner.lock().unwrap();
        let template = inner.vm_mut(source)?.clone();
        if template.state == PowerState::Running {
            return Err(ScratchError::ExternalCommand {
                command: format!("clone {source}"),
                message: "source VM is running".into(),
            });
        }
        if inner.vms.contains_key(new_name) {
            return Err(ScratchError::AlreadyExists { name: new_name.into() });
        }
        inner.vms.insert(new_name.into(), template);
        Ok(VmRef { name: new_name.into() })
    }

    async fn start(&self, name: &str) -> Result<(), ScratchError> {
        self.record(format!("start {name}"));
        let mut inner = self.inner.lock().unwrap();
        let vm = inner.vm_mut(name)?;
        if vm.dirty {
            return Err(ScratchError::ExternalCommand {
                command: format!("start {name}"),
                message: "configuration edited without a hypervisor restart".into(),
            });
        }
        vm.state = PowerState::Running;
        Ok(())
    }

    async fn stop(&self, name: &str) -> Result<(), ScratchError> {
        self.record(format!("stop {name}"));
        let mut inner = self.inner.lock().unwrap();
        inner.vm_mut(name)?.state = PowerState::Stopped;
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), ScratchError> {
        self.record(format!("delete {name}"));
        let mut inner = self.inner.lock().unwrap();
        inner
            .vms
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| ScratchError::NotFound { name: name.into() })
    }

    async fn ip_addresses(&self, name: &str) -> Result<Vec<String>, ScratchError> {
        let mut inner = self.inner.lock().unwrap();
        inner.vm_mut(name)?;
        let polls = {
            let count = inner.polls.entry(name.into()).or_insert(0);
            *count += 1;
            *count
        };
        match inner.ips.get(name) {
            Some((threshold, ip)) if polls > *threshold => {
                Ok(vec!["fe80::1".into(), ip.clone()])
            }
            _ => Ok(Vec::new()),
        }
    }

    async fn mac_address(&self, name: &str) -> Result<Option<String>, ScratchError> {
        let mut inner = self.inner.lock().unwrap();
        Ok(Some(inner.vm_mut(name)?.mac.clone()))
    }

    async fn edit_config(&self, name: &str, patch: &ConfigPatch) -> Result<(), ScratchError> {
        self.record(format!("edit {name} {patch:?}"));
        let mut inner = self.inner.lock().unwrap();
        let vm = inner.vm_mut(name)?;
        match patch {
            ConfigPatch::SerialConsole { port } => vm.serial_port = Some(*port),
            ConfigPatch::MacAddress(mac) => vm.mac = mac.clone(),
            ConfigPatch::MemoryMib(mib) => vm.memory_mib = *mib,
            ConfigPatch::CpuCount(cpus) => vm.cpus = *cpus,
            ConfigPatch::DetachInstallMedia => vm.media_attached = false,
        }
        vm.dirty = true;
        Ok(())
    }

    async fn restart(&self) -> Result<(), ScratchError> {
        self.record("restart".into());
        let mut inner = self.inner.lock().unwrap();
        for vm in inner.vms.values_mut() {
            vm.dirty = false;
        }
        Ok(())
    }

    async fn neighbor_ip(&self, _mac: &str) -> Result<Option<Ipv4Addr>, ScratchError> {
        Ok(self.inner.lock().unwrap().neighbor)
    }
}

// ── guest transport ───────────────────────────────────────

/// Scripts run so far, including the one being answered.
pub struct CallLog {
    scripts: Vec<String>,
}

impl CallLog {
    pub fn count_matching(&self, needle: &str) -> usize {
        self.scripts.iter().filter(|s| s.contains(needle)).count()
    }
}

type Responder = dyn Fn(&str, &CallLog) -> Result<ExecOutput, ScratchError>;
type Gate = dyn Fn(&Auth) -> bool;

/// A [`RemoteTransport`] answering from a closure.
pub struct FakeTransport {
    respond: Box<Responder>,
    accept: Box<Gate>,
    scripts: Mutex<Vec<String>>,
    auths: Mutex<Vec<Auth>>,
}

impl FakeTransport {
    pub fn new(
        respond: impl Fn(&str, &CallLog) -> Result<ExecOutput, ScratchError> + 'static,
    ) -> Self {
        Self {
            respond: Box::new(respond),
            accept: Box::new(|_| true),
            scripts: Mutex::new(Vec::new()),
            auths: Mutex::new(Vec::new()),
        }
    }

    /// Reject sessions whose credentials fail `accept`, before any script runs.
    pub fn accepting(mut self, accept: impl Fn(&Auth) -> bool + 'static) -> Self {
        self.accept = Box::new(accept);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.scripts.lock().unwrap().clone()
    }

    pub fn count_matching(&self, needle: &str) -> usize {
        self.scripts
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.contains(needle))
            .count()
    }

    /// Credentials presented, one per session.
    pub fn auths(&self) -> Vec<Auth> {
        self.auths.lock().unwrap().clone()
    }
}

impl RemoteTransport for FakeTransport {
    async fn exec(&self, target: &Target, auth: &Auth, script: &str) -> Result<ExecOutput, ScratchError> {
        self.auths.lock().unwrap().push(auth.clone());
        if !(self.accept)(auth) {
            return Err(ScratchError::ConnectivityFailure {
                target: target.to_string(),
                message: "authentication rejected".into(),
            });
        }
        let log = {
            let mut scripts = self.scripts.lock().unwrap();
            scripts.push(script.to_string());
            CallLog {
                scripts: scripts.clone(),
            }
        };
        (self.respond)(script, &log)
    }
}

// ── serial console ────────────────────────────────────────

/// Alpine installer prompts in order; `true` means a reply line follows.
const ALPINE_SCRIPT: &[(&str, bool)] = &[
    ("\nWelcome to Alpine Linux 3.20\nlocalhost login: ", true),
    ("localhost:~# ", true),
    ("Changing password for root\nNew password: ", true),
    ("Retype password: ", true),
    ("WARNING: Erase the above disk(s) and continue? (y/n) [n] ", true),
    ("Installation is complete. Please reboot.\n", false),
    ("localhost:~# ", true),
    ("SCRATCHVM_42\nlocalhost:~# ", true),
];

/// Plays the guest side of a serial console: print each prompt, then read
/// one reply line into `replies` where one is expected.
pub async fn play_installer(
    guest: DuplexStream,
    script: &'static [(&'static str, bool)],
    replies: Arc<Mutex<Vec<String>>>,
) {
    let (rd, mut wr) = tokio::io::split(guest);
    let mut lines = BufReader::new(rd).lines();
    for (prompt, expects_reply) in script {
        if wr.write_all(prompt.as_bytes()).await.is_err() {
            return;
        }
        if *expects_reply {
            match lines.next_line().await {
                Ok(Some(line)) => replies.lock().unwrap().push(line),
                _ => return,
            }
        }
    }
}

/// A [`ConsoleConnector`] over an in-memory pipe.
pub struct FakeConsole {
    script: Option<&'static [(&'static str, bool)]>,
    replies: Arc<Mutex<Vec<String>>>,
    /// Guest ends of silent consoles, held open so reads never hit EOF.
    held: Mutex<Vec<DuplexStream>>,
}

impl FakeConsole {
    /// A guest that walks through a full Alpine install.
    pub fn alpine_install() -> Self {
        Self {
            script: Some(ALPINE_SCRIPT),
            replies: Arc::default(),
            held: Mutex::new(Vec::new()),
        }
    }

    /// A guest that never prints anything.
    pub fn silent() -> Self {
        Self {
            script: None,
            replies: Arc::default(),
            held: Mutex::new(Vec::new()),
        }
    }

    pub fn replies(&self) -> Vec<String> {
        self.replies.lock().unwrap().clone()
    }
}

impl ConsoleConnector for FakeConsole {
    type Stream = DuplexStream;

    async fn connect(&self) -> Result<DuplexStream, ScratchError> {
        let (host, guest) = tokio::io::duplex(8192);
        match self.script {
            Some(script) => {
                tokio::spawn(play_installer(guest, script, self.replies.clone()));
            }
            None => self.held.lock().unwrap().push(guest),
        }
        Ok(host)
    }
}

// ── observer ──────────────────────────────────────────────

/// Observer that remembers how every stage ended.
#[derive(Debug, Default)]
pub struct Recorder {
    pub started: Vec<Stage>,
    pub results: Vec<(Stage, StageResult)>,
    pub failed: Vec<Stage>,
}

impl Recorder {
    /// Stages that finished without error, in order.
    pub fn finished(&self) -> Vec<Stage> {
        self.results.iter().map(|(stage, _)| *stage).collect()
    }

    /// Outcome of the first run of `stage`.
    pub fn result_of(&self, stage: Stage) -> Option<StageResult> {
        self.results
            .iter()
            .find(|(s, _)| *s == stage)
            .map(|(_, result)| result.clone())
    }
}

impl Observer for Recorder {
    fn stage_started(&mut self, _index: usize, stage: Stage) {
        self.started.push(stage);
    }

    fn stage_finished(&mut self, _index: usize, stage: Stage, result: &StageResult) {
        self.results.push((stage, result.clone()));
    }

    fn stage_failed(&mut self, _index: usize, stage: Stage, _cause: &ScratchError) {
        self.failed.push(stage);
    }
}

// ── fixtures ──────────────────────────────────────────────

/// Write a fresh ed25519 pair as `<dir>/<name>` and `<dir>/<name>.pub`;
/// returns the public key line.
pub fn write_key_pair(dir: &Path, name: &str) -> String {
    let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
    key.write_openssh_file(&dir.join(name), LineEnding::LF).unwrap();
    let public = key.public_key().to_openssh().unwrap();
    std::fs::write(dir.join(format!("{name}.pub")), format!("{public}\n")).unwrap();
    public
}

/// Defaults with every wait shortened to zero.
pub fn fast_config() -> Config {
    let mut config = Config::default();
    config.hypervisor.restart_settle_s = 0;
    config.probe.attempts = 3;
    config.probe.interval_s = 0;
    config.inject.attempts = 3;
    config.inject.backoff_s = 0;
    config.install.prompt_timeout_s = 5;
    config.install.completion_timeout_s = 5;
    config
}

/// Host directories under `dir`; keys are read from `dir` itself.
pub fn test_workspace(dir: &Path) -> Workspace {
    Workspace {
        work_dir: dir.join("work"),
        iso_cache: dir.join("iso"),
        results_dir: dir.join("results"),
        key_dir: dir.to_path_buf(),
    }
}
