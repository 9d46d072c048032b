//! Guest bootstrap: connectivity preflight, key injection, packages,
//! repository checkout, toolchain detection and the test run itself.

use std::fmt;
use std::time::Instant;

use crate::config::RetryPolicy;
use crate::error::ScratchError;
use crate::util::shell_quote;

use super::{Auth, ExecOutput, RemoteTransport, Target};

/// Idempotent package-manager steps run on every bootstrap.
const BASE_PACKAGES: &[&str] = &[
    "apk update",
    "apk add --no-cache bash git curl ca-certificates build-base",
];

const AUTHORIZED_KEYS: &str = "~/.ssh/authorized_keys";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toolchain {
    Node,
    Python,
    Rust,
    Go,
    Ruby,
    Java,
}

impl Toolchain {
    pub const ALL: [Toolchain; 6] = [
        Toolchain::Node,
        Toolchain::Python,
        Toolchain::Rust,
        Toolchain::Go,
        Toolchain::Ruby,
        Toolchain::Java,
    ];

    /// Manifest files whose presence implies this toolchain.
    pub fn manifests(self) -> &'static [&'static str] {
        match self {
            Toolchain::Node => &["package.json"],
            Toolchain::Python => &["requirements.txt", "pyproject.toml", "setup.py"],
            Toolchain::Rust => &["Cargo.toml"],
            Toolchain::Go => &["go.mod"],
            Toolchain::Ruby => &["Gemfile"],
            Toolchain::Java => &["pom.xml"],
        }
    }

    /// Install the toolchain and fetch the project's dependencies.
    fn install_script(self) -> &'static str {
        match self {
            Toolchain::Node => "apk add --no-cache nodejs npm && npm install",
            Toolchain::Python => {
                "apk add --no-cache python3 py3-pip && \
                 if [ -f requirements.txt ]; then \
                 pip3 install --break-system-packages -r requirements.txt; fi"
            }
            Toolchain::Rust => "apk add --no-cache rust cargo && cargo fetch",
            Toolchain::Go => "apk add --no-cache go && go mod download",
            Toolchain::Ruby => "apk add --no-cache ruby ruby-bundler && bundle install",
            Toolchain::Java => "apk add --no-cache openjdk17 maven && mvn -q dependency:resolve",
        }
    }
}

impl fmt::Display for Toolchain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Toolchain::Node => "node",
            Toolchain::Python => "python",
            Toolchain::Rust => "rust",
            Toolchain::Go => "go",
            Toolchain::Ruby => "ruby",
            Toolchain::Java => "java",
        };
        f.write_str(s)
    }
}

/// Result of the caller-supplied test command. A non-zero `exit_code` is
/// a test failure, not an executor failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestRun {
    pub exit_code: i32,
    pub output: String,
    pub duration_s: u64,
}

impl TestRun {
    pub fn passed(&self) -> bool {
        self.exit_code == 0
    }
}

/// Outcome of the key-injection retry loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyInjection {
    pub installed: bool,
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// Runs scripts against one guest, one session per call.
pub struct Executor<'a, T> {
    transport: &'a T,
    target: Target,
    auth: Auth,
}

impl<'a, T: RemoteTransport> Executor<'a, T> {
    pub fn new(transport: &'a T, target: Target, auth: Auth) -> Self {
        Self {
            transport,
            target,
            auth,
        }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn auth(&self) -> &Auth {
        &self.auth
    }

    pub fn set_auth(&mut self, auth: Auth) {
        self.auth = auth;
    }

    /// `run(vmIP, sshKey, script) -> (exitCode, combinedOutput)`.
    pub async fn run(&self, script: &str) -> Result<ExecOutput, ScratchError> {
        self.transport.exec(&self.target, &self.auth, script).await
    }

    /// Run `script` and fail on a non-zero exit.
    async fn run_checked(&self, what: &str, script: &str) -> Result<ExecOutput, ScratchError> {
        let output = self.run(script).await?;
        if !output.success() {
            return Err(ScratchError::ExternalCommand {
                command: format!("{what} on {}", self.target),
                message: format!("exit {}: {}", output.exit_code, tail(&output.output, 400)),
            });
        }
        Ok(output)
    }

    /// One connectivity probe; any failure is `ConnectivityFailure`.
    pub async fn preflight(&self) -> Result<(), ScratchError> {
        match self.run("true").await {
            Ok(out) if out.success() => {
                tracing::info!(target = %self.target, "guest reachable");
                Ok(())
            }
            Ok(out) => Err(ScratchError::ConnectivityFailure {
                target: self.target.to_string(),
                message: format!("probe command exited {}", out.exit_code),
            }),
            Err(e @ ScratchError::ConnectivityFailure { .. }) => Err(e),
            Err(e) => Err(ScratchError::ConnectivityFailure {
                target: self.target.to_string(),
                message: e.to_string(),
            }),
        }
    }

    pub async fn bootstrap_packages(&self) -> Result<(), ScratchError> {
        for step in BASE_PACKAGES {
            tracing::info!(target = %self.target, step, "package bootstrap");
            self.run_checked("package bootstrap", step).await?;
        }
        Ok(())
    }

    /// Clone `url` into `dir`, or fast-forward an existing checkout.
    pub async fn clone_repository(&self, url: &str, dir: &str) -> Result<(), ScratchError> {
        let url = shell_quote(url);
        let dir = shell_quote(dir);
        let script = format!(
            "if [ -d {dir}/.git ]; then git -C {dir} pull --ff-only; \
             else mkdir -p \"$(dirname {dir})\" && git clone {url} {dir}; fi"
        );
        self.run_checked("git clone", &script).await?;
        Ok(())
    }

    /// Independent existence checks for every known manifest. All matching
    /// toolchains are returned.
    pub async fn detect_toolchains(&self, dir: &str) -> Result<Vec<Toolchain>, ScratchError> {
        let mut found = Vec::new();
        for toolchain in Toolchain::ALL {
            for manifest in toolchain.manifests() {
                let path = shell_quote(&format!("{dir}/{manifest}"));
                if self.run(&format!("test -f {path}")).await?.success() {
                    tracing::info!(%toolchain, manifest, "project type detected");
                    found.push(toolchain);
                    break;
                }
            }
        }
        Ok(found)
    }

    pub async fn install_toolchain(&self, toolchain: Toolchain, dir: &str) -> Result<(), ScratchError> {
        let script = format!("cd {} && {}", shell_quote(dir), toolchain.install_script());
        self.run_checked(&format!("{toolchain} toolchain install"), &script)
            .await?;
        Ok(())
    }

    /// Run the test command inside `dir`. The guest exit code is reported
    /// as-is; only transport failures are errors.
    pub async fn run_test(&self, dir: &str, command: &str) -> Result<TestRun, ScratchError> {
        let dir = shell_quote(dir);
        let script = format!("mkdir -p {dir} && cd {dir} && ( {command} ) 2>&1");
        tracing::info!(target = %self.target, command, "running test command");
        let started = Instant::now();
        let out = self.run(&script).await?;
        let run = TestRun {
            exit_code: out.exit_code,
            output: out.output,
            duration_s: started.elapsed().as_secs(),
        };
        tracing::info!(exit_code = run.exit_code, passed = run.passed(), "test command finished");
        Ok(run)
    }
}

/// Shell script appending `public_key` to authorized_keys unless present.
fn install_key_script(public_key: &str) -> String {
    let key = shell_quote(public_key.trim());
    format!(
        "mkdir -p ~/.ssh && chmod 700 ~/.ssh && touch {AUTHORIZED_KEYS} && \
         chmod 600 {AUTHORIZED_KEYS} && \
         (grep -qxF {key} {AUTHORIZED_KEYS} || echo {key} >> {AUTHORIZED_KEYS})"
    )
}

fn verify_key_script() -> String {
    format!("test -s {AUTHORIZED_KEYS}")
}

/// Push `public_key` into the guest's authorized-keys store.
///
/// Each attempt transmits the key and then re-verifies the store in a
/// separate session; both must succeed. A failed attempt is retried from
/// scratch after `policy.interval`. Exhausting the budget is reported in
/// the result, not as an error: the guest stays reachable by password.
pub async fn inject_key<T: RemoteTransport>(
    executor: &Executor<'_, T>,
    public_key: &str,
    policy: RetryPolicy,
) -> KeyInjection {
    let mut last_error = None;

    for attempt in 1..=policy.attempts {
        match inject_once(executor, public_key).await {
            Ok(()) => {
                tracing::info!(target = %executor.target(), attempt, "SSH key installed");
                return KeyInjection {
                    installed: true,
                    attempts: attempt,
                    last_error: None,
                };
            }
            Err(e) => {
                tracing::warn!(target = %executor.target(), attempt, error = %e, "key injection attempt failed");
                last_error = Some(e.to_string());
            }
        }
        if attempt < policy.attempts {
            tokio::time::sleep(policy.interval).await;
        }
    }

    tracing::warn!(
        target = %executor.target(),
        attempts = policy.attempts,
        "key injection exhausted retries, guest is password-only"
    );
    KeyInjection {
        installed: false,
        attempts: policy.attempts,
        last_error,
    }
}

async fn inject_once<T: RemoteTransport>(
    executor: &Executor<'_, T>,
    public_key: &str,
) -> Result<(), ScratchError> {
    executor
        .run_checked("authorized_keys update", &install_key_script(public_key))
        .await?;
    let verify = executor.run(&verify_key_script()).await?;
    if !verify.success() {
        return Err(ScratchError::ExternalCommand {
            command: format!("authorized_keys check on {}", executor.target()),
            message: "store is empty after transmit".into(),
        });
    }
    Ok(())
}

/// Last `max` characters of `s`, on a char boundary.
fn tail(s: &str, max: usize) -> &str {
    let trimmed = s.trim_end();
    if trimmed.len() <= max {
        return trimmed;
    }
    let mut start = trimmed.len() - max;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    &trimmed[start..]
}
