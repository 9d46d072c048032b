use std::io::IsTerminal;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use scratchvm::cli::{Cli, Command};
use scratchvm::config::{self, Config};
use scratchvm::control::utm::UtmControlPlane;
use scratchvm::control::{ControlPlane, NetworkMode, remove_vm};
use scratchvm::credentials::SshCredential;
use scratchvm::error::ScratchError;
use scratchvm::install::console::TcpConsole;
use scratchvm::logging;
use scratchvm::pipeline::clone::{CloneOptions, CloneWorkflow};
use scratchvm::pipeline::provision::{ProvisionWorkflow, ProvisioningSession, TestRequest};
use scratchvm::pipeline::template::{TemplateOptions, TemplateWorkflow};
use scratchvm::pipeline::{self, Outcome, Workflow, Workspace};
use scratchvm::progress::{OutputMode, StageProgress};
use scratchvm::remote::Target;
use scratchvm::remote::ssh::SshTransport;
use scratchvm::report::{self, TestStatus};
use scratchvm::runner::ProcessRunner;
use scratchvm::util::{parse_gib, parse_mib};

type Utm = UtmControlPlane<ProcessRunner>;

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();
    let mode = resolve_output_mode(cli.verbose, cli.quiet);

    // Terminal layer: suppress tracing while spinners own the terminal.
    // Tracing output to stderr corrupts indicatif's line tracking.
    let terminal_filter = match mode {
        OutputMode::Verbose => EnvFilter::new("debug"),
        OutputMode::Normal | OutputMode::Quiet => EnvFilter::new("off"),
        OutputMode::Plain => EnvFilter::from_default_env()
            .add_directive("scratchvm=info".parse().expect("valid log directive")),
    };

    let terminal_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(terminal_filter);

    // File layer: always captures scratchvm=debug, discards until activated
    let (file_writer, file_handle) = logging::DeferredFileWriter::new();
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(file_writer)
        .with_filter(EnvFilter::new("scratchvm=debug"));

    tracing_subscriber::registry()
        .with(terminal_layer)
        .with(file_layer)
        .init();

    let (config_path, explicit) = match &cli.config {
        Some(path) => (path.clone(), true),
        None => (PathBuf::from(scratchvm::paths::DEFAULT_CONFIG), false),
    };
    let config = config::load_config(&config_path, explicit)?;

    // Results never touch the hypervisor
    if let Command::Results { failed } = cli.command {
        print_results(&config, failed);
        return Ok(());
    }

    // Activate file logging for commands that drive a VM
    if !matches!(cli.command, Command::List) {
        let log_path = scratchvm::paths::logs_dir().join("scratchvm.log");
        if let Err(e) = file_handle.set_file(&log_path) {
            tracing::warn!(path = %log_path.display(), error = %e, "file logging disabled");
        }
    }

    let control: Utm = UtmControlPlane::new(ProcessRunner, &config)?;
    let transport = SshTransport::new(Duration::from_secs(config.ssh.connect_timeout_s));
    let workspace = Workspace::from_config(&config);

    let code = match cli.command {
        Command::Results { .. } => unreachable!(),
        Command::CreateTemplate {
            name,
            iso,
            ram,
            cpu,
            disk,
            password,
            ssh,
            network,
            force,
        } => {
            let mut options = TemplateOptions::from_config(&config)?;
            if let Some(name) = name {
                options.name = name;
            }
            if iso.is_some() {
                options.iso = iso;
            }
            if let Some(ram) = ram {
                options.memory_mib = parse_mib(&ram)?;
            }
            if let Some(cpu) = cpu {
                options.cpus = cpu;
            }
            if let Some(disk) = disk {
                options.disk_gib = parse_gib(&disk)?;
            }
            if let Some(password) = password {
                options.password = password;
            }
            if let Some(ssh) = ssh {
                options.ssh_key = ssh;
            }
            if let Some(network) = network {
                options.network = NetworkMode::parse(&network)?;
            }
            options.force = force || confirm_replace(&control, &options.name).await?;

            let console = TcpConsole::new(
                SocketAddr::from((Ipv4Addr::LOCALHOST, config.install.serial_port)),
                config.probe_policy(),
            );
            let mut workflow =
                TemplateWorkflow::new(&control, &transport, &console, &config, workspace, options);
            let outcome = run_workflow(&mut workflow, mode).await;
            finish(outcome, mode, true)
        }
        Command::Clone {
            name,
            template,
            ram,
            cpu,
            ssh,
            force,
            repo,
            command,
        } => {
            let name = name.unwrap_or_else(|| format!("scratch-{}", logging::utc_timestamp()));
            let test = (repo.is_some() || command.is_some()).then(|| TestRequest::new(repo, command));
            let mut options = CloneOptions {
                name,
                template: template.unwrap_or_else(|| config.template.name.clone()),
                memory_mib: ram.as_deref().map(parse_mib).transpose()?,
                cpus: cpu,
                ssh_key: ssh.unwrap_or_else(|| config.ssh.key.clone()),
                force,
                test,
            };
            options.force = options.force || confirm_replace(&control, &options.name).await?;

            let mut workflow = CloneWorkflow::new(&control, &transport, &config, workspace, options);
            let outcome = run_workflow(&mut workflow, mode).await;
            finish(outcome, mode, false)
        }
        Command::ProvisionForTesting {
            name,
            ip,
            ssh,
            repo,
            command,
            password,
        } => {
            let key = ssh.unwrap_or_else(|| config.ssh.key.clone());
            let credential = SshCredential::load(&workspace.key_dir, &key)?;
            let session = ProvisioningSession::new(
                &transport,
                &name,
                Target::new(ip, config.ssh.user.clone()),
                credential,
                password,
                TestRequest::new(repo, command),
                config.inject_policy(),
            );
            let mut workflow = ProvisionWorkflow::new(session, workspace.results_dir.clone());
            let outcome = run_workflow(&mut workflow, mode).await;
            finish(outcome, mode, false)
        }
        Command::List => {
            control.preflight().await?;
            let vms = control.list().await?;
            if vms.is_empty() {
                println!("No VMs registered.");
            } else {
                println!("{:<10} NAME", "STATE");
                for vm in &vms {
                    println!("{:<10} {}", vm.state.to_string(), vm.name);
                }
            }
            0
        }
        Command::Destroy { name, yes } => {
            control.preflight().await?;
            if !control.exists(&name).await? {
                return Err(ScratchError::NotFound { name }.into());
            }
            if !yes && std::io::stdin().is_terminal() {
                let proceed = inquire::Confirm::new(&format!("Delete VM '{name}' and its disk?"))
                    .with_default(false)
                    .prompt()
                    .map_err(map_inquire_err)?;
                if !proceed {
                    println!("Cancelled.");
                    return Ok(());
                }
            }
            remove_vm(&control, &name).await?;
            println!("VM '{name}' destroyed.");
            0
        }
    };

    std::process::exit(code);
}

/// Run a workflow with stage progress, releasing its scoped resources and
/// exiting 130 on Ctrl-C.
async fn run_workflow<W: Workflow>(workflow: &mut W, mode: OutputMode) -> (Outcome, StageProgress) {
    let mut progress = StageProgress::new(mode);
    let cleanup = workflow.cleanup().clone();
    let vm = workflow.vm_name().to_string();

    let outcome = tokio::select! {
        outcome = pipeline::drive(workflow, &mut progress) => outcome,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!(%vm, "interrupted, releasing resources");
            cleanup.run().await;
            eprintln!("\nInterrupted. VM '{vm}' may be left in a partial state.");
            std::process::exit(130);
        }
    };
    (outcome, progress)
}

/// Print the outcome and map it to a process exit code.
fn finish((outcome, mut progress): (Outcome, StageProgress), mode: OutputMode, template: bool) -> i32 {
    match outcome {
        Outcome::Succeeded(report) => {
            progress.println(&format!("VM '{}' ready.", report.vm));
            if let Some(ip) = report.ip {
                progress.info(&format!("IP: {ip}"));
            }
            for warning in &report.warnings {
                progress.info(&format!("warning: {warning}"));
            }
            match report.record {
                Some(record) => {
                    progress.println(&format!(
                        "Test {} (exit code {}); record: {}",
                        record.status,
                        record.exit_code,
                        record.dir.display()
                    ));
                    if record.status == TestStatus::Failed { 2 } else { 0 }
                }
                None => 0,
            }
        }
        Outcome::Failed { stage, vm, cause } => {
            progress.abandon();
            let code = cause.exit_code();
            eprintln!(
                "{}",
                console::style(format!("Stage '{stage}' failed for VM '{vm}'."))
                    .for_stderr()
                    .red()
                    .bold()
            );
            if template && mode != OutputMode::Quiet {
                eprintln!("The VM was left registered; remove it with `scratchvm destroy {vm}`.");
            }
            eprintln!("{:?}", miette::Report::new(cause));
            code
        }
    }
}

/// Ask before replacing an existing VM when a human is at the terminal.
async fn confirm_replace(control: &Utm, name: &str) -> Result<bool, ScratchError> {
    if !std::io::stdin().is_terminal() {
        return Ok(false);
    }
    // a failing query is reported by the workflow's own checks
    if !control.exists(name).await.unwrap_or(false) {
        return Ok(false);
    }
    let replace = inquire::Confirm::new(&format!("VM '{name}' exists, delete and recreate?"))
        .with_default(false)
        .prompt()
        .map_err(map_inquire_err)?;
    if !replace {
        return Err(ScratchError::Cancelled);
    }
    Ok(true)
}

fn print_results(config: &Config, failed_only: bool) {
    let dir = config.results_dir();
    let records: Vec<_> = report::list_records(&dir)
        .into_iter()
        .filter(|r| !failed_only || r.status == Some(TestStatus::Failed))
        .collect();

    if records.is_empty() {
        if failed_only {
            println!("No failed test runs recorded.");
        } else {
            println!("No test runs recorded in {}.", dir.display());
        }
        return;
    }

    for record in &records {
        let indicator = match record.status {
            Some(TestStatus::Passed) => console::style(" OK ").green(),
            Some(TestStatus::Failed) => console::style("FAIL").red(),
            None => console::style(" ?? ").dim(),
        };
        let exit = record
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "-".into());
        let command = record
            .metadata
            .as_ref()
            .map(|m| m.command.as_str())
            .unwrap_or("?");
        println!(
            "[{indicator}] {} exit={exit} `{command}` ({})",
            record.name,
            record.dir.display()
        );
    }
}

fn map_inquire_err(e: inquire::InquireError) -> ScratchError {
    match e {
        inquire::InquireError::OperationCanceled | inquire::InquireError::OperationInterrupted => {
            ScratchError::Cancelled
        }
        other => ScratchError::Validation {
            message: format!("prompt error: {other}"),
        },
    }
}

/// Map `--verbose`/`--quiet` and terminal detection into an `OutputMode`.
fn resolve_output_mode(verbose: bool, quiet: bool) -> OutputMode {
    if quiet {
        OutputMode::Quiet
    } else if !std::io::stdout().is_terminal() {
        OutputMode::Plain
    } else if verbose {
        OutputMode::Verbose
    } else {
        OutputMode::Normal
    }
}
