use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};

use crate::error::ScratchError;
use crate::pipeline::{Observer, Stage, StageResult};

/// Controls how stage output is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Spinners with a checkmark per finished stage.
    Normal,
    /// Spinners, and tracing output goes to stderr as well.
    Verbose,
    /// Only failures and the final summary.
    Quiet,
    /// No ANSI, plain println output (for piped/non-TTY).
    Plain,
}

/// Renders pipeline stages as numbered spinners.
///
/// One bar per stage: it spins while the stage runs and is replaced by a
/// checkmark, a skip marker, a warning or a cross when the stage ends.
pub struct StageProgress {
    multi: MultiProgress,
    total_stages: usize,
    mode: OutputMode,
    current: Option<ProgressBar>,
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("[{prefix}] {spinner:.cyan} {msg}")
        .unwrap()
}

fn done_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("[{prefix}] \u{2713} {msg:.green}")
        .unwrap()
}

fn skipped_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("[{prefix}] - {msg:.dim}")
        .unwrap()
}

fn degraded_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("[{prefix}] ! {msg:.yellow}")
        .unwrap()
}

fn failed_style() -> ProgressStyle {
    ProgressStyle::default_spinner()
        .template("[{prefix}] \u{2717} {msg:.red}")
        .unwrap()
}

/// Text shown once a stage has ended.
fn finished_message(stage: Stage, result: &StageResult) -> String {
    match result {
        StageResult::Done => stage.label().to_string(),
        StageResult::Skipped(reason) => format!("{} (skipped: {reason})", stage.label()),
        StageResult::Degraded(reason) => format!("{} ({reason})", stage.label()),
    }
}

fn marker(result: &StageResult) -> &'static str {
    match result {
        StageResult::Done => "\u{2713}",
        StageResult::Skipped(_) => "-",
        StageResult::Degraded(_) => "!",
    }
}

impl StageProgress {
    pub fn new(mode: OutputMode) -> Self {
        let multi = match mode {
            OutputMode::Plain | OutputMode::Quiet => {
                MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
            }
            OutputMode::Normal | OutputMode::Verbose => MultiProgress::new(),
        };
        Self {
            multi,
            total_stages: 0,
            mode,
            current: None,
        }
    }

    fn prefix(&self, index: usize) -> String {
        format!("{}/{}", index + 1, self.total_stages)
    }

    /// Print an info line (IP address, record path, etc.).
    pub fn info(&self, text: &str) {
        match self.mode {
            OutputMode::Quiet => {}
            OutputMode::Plain => println!("      \u{2192} {text}"),
            OutputMode::Normal | OutputMode::Verbose => {
                self.multi.println(format!("      \u{2192} {text}")).ok();
            }
        }
    }

    /// Print a plain line via multi.println (final messages).
    pub fn println(&self, text: &str) {
        if matches!(self.mode, OutputMode::Plain | OutputMode::Quiet) {
            println!("{text}");
        } else {
            self.multi.println(text).ok();
        }
    }

    /// Drop a spinner left running by an interrupted stage.
    pub fn abandon(&mut self) {
        if let Some(bar) = self.current.take() {
            bar.abandon();
        }
    }
}

impl Observer for StageProgress {
    fn workflow_started(&mut self, workflow: &str, vm: &str, stages: &[Stage]) {
        self.total_stages = stages.len();
        if self.mode != OutputMode::Quiet {
            self.println(&format!("{workflow}: {vm} ({} stages)", stages.len()));
        }
    }

    fn stage_started(&mut self, index: usize, stage: Stage) {
        let prefix = self.prefix(index);
        match self.mode {
            OutputMode::Quiet => {}
            OutputMode::Plain => println!("[{prefix}] {stage}"),
            OutputMode::Normal | OutputMode::Verbose => {
                let bar = self.multi.add(ProgressBar::new_spinner());
                bar.set_style(spinner_style());
                bar.set_prefix(prefix);
                bar.set_message(stage.label().to_string());
                bar.enable_steady_tick(std::time::Duration::from_millis(80));
                self.current = Some(bar);
            }
        }
    }

    fn stage_finished(&mut self, index: usize, stage: Stage, result: &StageResult) {
        let message = finished_message(stage, result);
        match self.mode {
            OutputMode::Quiet => {}
            OutputMode::Plain => {
                println!("[{}] {} {message}", self.prefix(index), marker(result));
            }
            OutputMode::Normal | OutputMode::Verbose => {
                if let Some(bar) = self.current.take() {
                    bar.set_style(match result {
                        StageResult::Done => done_style(),
                        StageResult::Skipped(_) => skipped_style(),
                        StageResult::Degraded(_) => degraded_style(),
                    });
                    bar.finish_with_message(message);
                }
            }
        }
    }

    fn stage_failed(&mut self, index: usize, stage: Stage, cause: &ScratchError) {
        let message = format!("{} failed: {cause}", stage.label());
        match self.mode {
            OutputMode::Quiet | OutputMode::Plain => {
                eprintln!("[{}] \u{2717} {message}", self.prefix(index));
            }
            OutputMode::Normal | OutputMode::Verbose => {
                if let Some(bar) = self.current.take() {
                    bar.set_style(failed_style());
                    bar.finish_with_message(message);
                }
            }
        }
    }
}
