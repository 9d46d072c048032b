//! Test result records: one directory per run under the results root.
//!
//! ```text
//! <results>/<YYYY-MM-DDTHH-MM-SS>_<vm>/
//!     output.log      combined stdout/stderr of the test command
//!     exit_code       decimal exit code
//!     status          PASSED or FAILED
//!     metadata.json   RecordMetadata
//! ```

use std::fmt;
use std::fs;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use facet::Facet;

use crate::error::ScratchError;
use crate::logging::utc_timestamp;
use crate::remote::bootstrap::TestRun;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestStatus {
    Passed,
    Failed,
}

impl TestStatus {
    pub fn from_exit_code(code: i32) -> Self {
        if code == 0 {
            TestStatus::Passed
        } else {
            TestStatus::Failed
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "PASSED" => Some(TestStatus::Passed),
            "FAILED" => Some(TestStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TestStatus::Passed => "PASSED",
            TestStatus::Failed => "FAILED",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Facet)]
pub struct RecordMetadata {
    pub vm: String,
    pub ip: Option<String>,
    pub repo: Option<String>,
    pub command: String,
    pub timestamp: String,
    pub exit_code: i32,
    pub status: String,
    pub duration_s: u64,
}

/// What was run and where, independent of the outcome.
#[derive(Debug, Clone)]
pub struct RunContext<'a> {
    pub vm: &'a str,
    pub ip: Option<Ipv4Addr>,
    pub repo: Option<&'a str>,
    pub command: &'a str,
}

#[derive(Debug, Clone)]
pub struct ResultRecord {
    pub dir: PathBuf,
    pub status: TestStatus,
    pub exit_code: i32,
}

/// Write a result record for `run` under `results_dir`.
pub fn persist(
    results_dir: &Path,
    context: &RunContext<'_>,
    run: &TestRun,
) -> Result<ResultRecord, ScratchError> {
    persist_at(results_dir, &utc_timestamp(), context, run)
}

fn persist_at(
    results_dir: &Path,
    timestamp: &str,
    context: &RunContext<'_>,
    run: &TestRun,
) -> Result<ResultRecord, ScratchError> {
    let io = |what: &str, path: &Path| {
        let context = format!("{what} {}", path.display());
        move |source| ScratchError::Io { context, source }
    };

    fs::create_dir_all(results_dir).map_err(io("creating", results_dir))?;
    let dir = claim_record_dir(results_dir, &format!("{timestamp}_{}", context.vm))?;
    let status = TestStatus::from_exit_code(run.exit_code);

    let metadata = RecordMetadata {
        vm: context.vm.to_string(),
        ip: context.ip.map(|ip| ip.to_string()),
        repo: context.repo.map(str::to_string),
        command: context.command.to_string(),
        timestamp: timestamp.to_string(),
        exit_code: run.exit_code,
        status: status.to_string(),
        duration_s: run.duration_s,
    };
    let json = facet_json::to_string(&metadata).map_err(|e| ScratchError::Validation {
        message: format!("serializing result metadata: {e}"),
    })?;

    let files = [
        ("output.log", run.output.clone()),
        ("exit_code", format!("{}\n", run.exit_code)),
        ("status", format!("{status}\n")),
        ("metadata.json", format!("{json}\n")),
    ];
    for (name, contents) in files {
        let path = dir.join(name);
        fs::write(&path, contents).map_err(io("writing", &path))?;
    }

    tracing::info!(dir = %dir.display(), %status, exit_code = run.exit_code, "result recorded");
    Ok(ResultRecord {
        dir,
        status,
        exit_code: run.exit_code,
    })
}

/// Create `<root>/<base>`, or `<base>-2`, `<base>-3`, ... when two runs
/// land in the same second.
fn claim_record_dir(root: &Path, base: &str) -> Result<PathBuf, ScratchError> {
    let mut suffix = 1u32;
    loop {
        let name = if suffix == 1 {
            base.to_string()
        } else {
            format!("{base}-{suffix}")
        };
        let dir = root.join(&name);
        match fs::create_dir(&dir) {
            Ok(()) => return Ok(dir),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => suffix += 1,
            Err(source) => {
                return Err(ScratchError::Io {
                    context: format!("creating {}", dir.display()),
                    source,
                });
            }
        }
    }
}

/// A record found on disk.
#[derive(Debug, Clone)]
pub struct RecordEntry {
    pub dir: PathBuf,
    pub name: String,
    pub status: Option<TestStatus>,
    pub exit_code: Option<i32>,
    pub metadata: Option<RecordMetadata>,
}

/// All records under `results_dir`, oldest first. Directories missing a
/// readable `status` file are listed with an unknown status.
pub fn list_records(results_dir: &Path) -> Vec<RecordEntry> {
    let Ok(entries) = fs::read_dir(results_dir) else {
        return Vec::new();
    };

    let mut records: Vec<RecordEntry> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .filter_map(|dir| {
            let name = dir.file_name()?.to_str()?.to_string();
            let status = fs::read_to_string(dir.join("status"))
                .ok()
                .and_then(|s| TestStatus::parse(&s));
            let exit_code = fs::read_to_string(dir.join("exit_code"))
                .ok()
                .and_then(|s| s.trim().parse().ok());
            let metadata = fs::read_to_string(dir.join("metadata.json"))
                .ok()
                .and_then(|s| facet_json::from_str::<RecordMetadata>(&s).ok());
            Some(RecordEntry {
                dir,
                name,
                status,
                exit_code,
                metadata,
            })
        })
        .collect();

    // timestamp prefix sorts chronologically
    records.sort_by(|a, b| a.name.cmp(&b.name));
    records
}
