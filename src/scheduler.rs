//! Command dispatch for one host.
//!
//! Every primary and secondary command is an independent tokio task tracked
//! by a [`TaskTracker`]. A primary task post-processes its own output
//! (pattern matching, then service discovery) and spawns secondary tasks
//! from there; `enumerate` returns once every task, transitively, is done.
//!
//! - Concurrent subprocesses are bounded by a `Semaphore`.
//! - Each subprocess leads its own process group and runs under
//!   `tokio::time::timeout`; on expiry the whole group is killed.
//! - Tripping the [`CancellationToken`] from [`Engine::cancellation_token`]
//!   kills running commands and keeps new ones from starting.
//! - Each shared collection has its own lock; its log is rewritten or
//!   appended while that lock is held.

use std::borrow::Cow;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ::time::{format_description::well_known, OffsetDateTime};
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{Mutex, Semaphore};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::{ReconConfig, ScanDefinition};
use crate::discovery::{matching_rules, parse_scan_result, ServiceRegistry};
use crate::error::Result;
use crate::gate::{CommandGate, GateDecision, OutputConvention};
use crate::logs::{self, RunPaths};
use crate::manual::ManualStepRecorder;
use crate::patterns::{find_matches, PatternMatcher};
use crate::template::TemplateContext;
use crate::types::{CommandRecord, CommandStatus, RunSummary, Tier};

/// The host under scan and the host-level template values.
#[derive(Debug, Clone)]
pub struct HostTarget {
    pub address: String,
    pub nmap_extra: String,
    /// Canonical port list for primary templates (`{ports}`).
    pub ports: String,
}

/// Runtime knobs for command execution.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Maximum number of subprocesses running at once.
    pub concurrency: usize,
    /// Per-command wall-clock limit.
    pub command_timeout: Duration,
    /// Prepended to every executed command, e.g. `sudo`.
    pub privilege_prefix: Option<String>,
    /// Remove the output file of a command that exited non-zero. Output of
    /// timed-out and cancelled commands is always removed.
    pub invalidate_failed_output: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            concurrency: 8,
            command_timeout: Duration::from_secs(60 * 60),
            privilege_prefix: Some("sudo".to_string()),
            invalidate_failed_output: true,
        }
    }
}

/// Which configured scan a unit of work runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanRef {
    Primary(usize),
    Secondary { rule: usize, scan: usize },
}

impl ScanRef {
    fn tier(self) -> Tier {
        match self {
            ScanRef::Primary(_) => Tier::Primary,
            ScanRef::Secondary { .. } => Tier::Secondary,
        }
    }

    fn convention(self) -> OutputConvention {
        match self {
            ScanRef::Primary(_) => OutputConvention::Primary,
            ScanRef::Secondary { .. } => OutputConvention::Secondary,
        }
    }
}

enum ExecOutcome {
    Exited(ExitStatus, String),
    TimedOut,
    /// Killed by cancellation while running.
    Cancelled,
    /// Cancelled before a worker slot was free.
    NotStarted,
}

/// Time a process group gets between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// Orchestrates primary and secondary scans against one host.
pub struct Engine {
    shared: Arc<Shared>,
}

struct Shared {
    host: TemplateContext,
    config: ReconConfig,
    settings: EngineSettings,
    paths: RunPaths,
    gate: Mutex<CommandGate>,
    services: Mutex<ServiceRegistry>,
    matcher: Mutex<PatternMatcher>,
    manual: Mutex<ManualStepRecorder>,
    commands_log: Mutex<()>,
    records: Mutex<Vec<CommandRecord>>,
    workers: Arc<Semaphore>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    next_unit: AtomicU64,
}

type UnitFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

impl Engine {
    /// Build an engine. `paths` must already exist on disk.
    pub fn new(
        target: HostTarget,
        paths: RunPaths,
        config: ReconConfig,
        settings: EngineSettings,
    ) -> Self {
        let host = TemplateContext::for_host(
            target.address,
            paths.scans.display().to_string(),
            target.nmap_extra,
            target.ports,
        );
        let workers = Arc::new(Semaphore::new(settings.concurrency.clamp(1, 1_000)));
        Self {
            shared: Arc::new(Shared {
                host,
                config,
                settings,
                paths,
                gate: Mutex::new(CommandGate::new()),
                services: Mutex::new(ServiceRegistry::new()),
                matcher: Mutex::new(PatternMatcher::new()),
                manual: Mutex::new(ManualStepRecorder::new()),
                commands_log: Mutex::new(()),
                records: Mutex::new(Vec::new()),
                workers,
                tracker: TaskTracker::new(),
                cancel: CancellationToken::new(),
                next_unit: AtomicU64::new(1),
            }),
        }
    }

    /// Token that cancels the run when tripped. The binary trips it on Ctrl-C.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    /// Run every primary scan of the configured scan type, and every
    /// secondary scan they lead to, then return what happened.
    pub async fn enumerate(&self) -> Result<RunSummary> {
        let shared = &self.shared;
        let started = now_rfc3339();
        logs::clear(&shared.paths.manual_log()).await?;

        info!(
            address = %shared.host.address(),
            primary = shared.config.primary.len(),
            "starting enumeration"
        );
        for idx in 0..shared.config.primary.len() {
            shared.spawn_unit(ScanRef::Primary(idx), shared.host.clone());
        }
        shared.tracker.close();
        shared.tracker.wait().await;

        let mut commands = shared.records.lock().await.clone();
        commands.sort_by_key(|r| r.unit);
        let services = shared.services.lock().await.sorted_lines();
        let summary = RunSummary {
            address: shared.host.address().to_string(),
            started,
            finished: now_rfc3339(),
            commands,
            services,
        };
        info!(
            executed = summary.executed(),
            failures = summary.failures(),
            services = summary.services.len(),
            "enumeration finished"
        );
        Ok(summary)
    }
}

impl Shared {
    fn scan(&self, scan: ScanRef) -> &ScanDefinition {
        match scan {
            ScanRef::Primary(i) => &self.config.primary[i],
            ScanRef::Secondary { rule, scan } => &self.config.services.rules[rule].scans[scan],
        }
    }

    fn spawn_unit(self: &Arc<Self>, scan: ScanRef, ctx: TemplateContext) {
        let this = Arc::clone(self);
        self.tracker.spawn(this.run_unit(scan, ctx));
    }

    fn run_unit(self: Arc<Self>, scan: ScanRef, ctx: TemplateContext) -> UnitFuture {
        Box::pin(async move {
            let unit = self.next_unit.fetch_add(1, Ordering::Relaxed);
            let def = self.scan(scan);
            let mut record = CommandRecord {
                unit,
                tier: scan.tier(),
                scan: def.name.clone(),
                command: None,
                output: None,
                executed: false,
                status: CommandStatus::Cancelled,
                timestamp: now_rfc3339(),
            };

            let result = self.process(unit, scan, def, &ctx, &mut record).await;
            record.status = match result {
                Ok(status) => status,
                Err(e) => {
                    warn!(unit, scan = %def.name, error = %e, "unit of work failed");
                    CommandStatus::Error {
                        message: e.to_string(),
                    }
                }
            };
            self.records.lock().await.push(record);
        })
    }

    async fn process(
        self: &Arc<Self>,
        unit: u64,
        scan: ScanRef,
        def: &ScanDefinition,
        ctx: &TemplateContext,
        record: &mut CommandRecord,
    ) -> Result<CommandStatus> {
        if self.cancel.is_cancelled() {
            return Ok(CommandStatus::Cancelled);
        }
        let command = ctx.render(&def.command)?;
        record.command = Some(command.clone());

        let decision = self.gate.lock().await.admit(&command, scan.convention());
        match decision {
            GateDecision::Duplicate => {
                debug!(unit, command = %command, "already handled this run");
                Ok(CommandStatus::Duplicate)
            }
            GateDecision::SkipExisting { output } => {
                info!(unit, output = %output.display(), "output exists, skipping command");
                record.output = Some(output.clone());
                self.post_process(scan, def, ctx, &output).await?;
                Ok(CommandStatus::Skipped)
            }
            GateDecision::Run { output } => {
                record.output = output.clone();
                let outcome = self.execute(unit, &command).await?;
                record.executed = !matches!(outcome, ExecOutcome::NotStarted);
                let status = match outcome {
                    ExecOutcome::Exited(status, _) if status.success() => {
                        info!(unit, "command completed");
                        CommandStatus::Completed
                    }
                    ExecOutcome::Exited(status, stderr) => {
                        warn!(
                            unit,
                            command = %command,
                            status = %status,
                            stderr = %last_line(&stderr),
                            "command failed"
                        );
                        CommandStatus::Failed {
                            exit_code: status.code(),
                        }
                    }
                    ExecOutcome::TimedOut => {
                        warn!(
                            unit,
                            command = %command,
                            timeout_secs = self.settings.command_timeout.as_secs(),
                            "command timed out and was killed"
                        );
                        CommandStatus::TimedOut
                    }
                    ExecOutcome::Cancelled => {
                        warn!(unit, command = %command, "command cancelled and killed");
                        CommandStatus::Cancelled
                    }
                    ExecOutcome::NotStarted => CommandStatus::Cancelled,
                };

                let Some(output) = output else {
                    return Ok(status);
                };
                match status {
                    CommandStatus::Completed => {
                        self.post_process(scan, def, ctx, &output).await?;
                    }
                    CommandStatus::Cancelled | CommandStatus::TimedOut => {
                        invalidate(unit, &output).await
                    }
                    _ if self.settings.invalidate_failed_output => invalidate(unit, &output).await,
                    _ => self.post_process(scan, def, ctx, &output).await?,
                }
                Ok(status)
            }
        }
    }

    async fn execute(&self, unit: u64, command: &str) -> Result<ExecOutcome> {
        let permit = tokio::select! {
            permit = self.workers.clone().acquire_owned() => permit,
            _ = self.cancel.cancelled() => return Ok(ExecOutcome::NotStarted),
        };
        let Ok(_permit) = permit else {
            return Ok(ExecOutcome::NotStarted);
        };

        let executed = self.privileged(command);
        {
            let _guard = self.commands_log.lock().await;
            let entry = logs::command_entry(unit, &now_rfc3339(), &executed);
            logs::append(&self.paths.commands_log(), &entry).await?;
        }
        info!(unit, command = %executed, "running");

        // The command leads its own process group so that pipelines,
        // subshells and privileged children can be signalled together.
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&executed)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()?;
        let pgid = child.id();
        let stderr = tokio::spawn(read_stderr(child.stderr.take()));

        let outcome = tokio::select! {
            res = time::timeout(self.settings.command_timeout, child.wait()) => match res {
                Ok(status) => {
                    let status = status?;
                    let stderr = stderr.await.unwrap_or_default();
                    return Ok(ExecOutcome::Exited(status, stderr));
                }
                Err(_) => ExecOutcome::TimedOut,
            },
            _ = self.cancel.cancelled() => ExecOutcome::Cancelled,
        };
        stderr.abort();
        self.terminate(unit, &mut child, pgid).await;
        Ok(outcome)
    }

    fn privileged(&self, command: &str) -> String {
        match &self.settings.privilege_prefix {
            Some(prefix) => format!("{prefix} {command}"),
            None => command.to_string(),
        }
    }

    /// SIGTERM the command's process group, then SIGKILL whatever is left
    /// after [`KILL_GRACE`], and reap the direct child.
    async fn terminate(&self, unit: u64, child: &mut Child, pgid: Option<u32>) {
        if let Some(pgid) = pgid {
            debug!(unit, pgid, "terminating process group");
            self.signal_group(pgid, Signal::SIGTERM).await;
            if time::timeout(KILL_GRACE, child.wait()).await.is_err() {
                debug!(unit, pgid, "process group ignored SIGTERM");
            }
            // Stragglers that outlived the group leader.
            self.signal_group(pgid, Signal::SIGKILL).await;
        }
        let _ = child.start_kill();
        if let Err(e) = child.wait().await {
            warn!(unit, error = %e, "could not reap killed command");
        }
    }

    /// Group members started through the privilege prefix are owned by
    /// another user, so the signal is sent through the same prefix.
    async fn signal_group(&self, pgid: u32, signal: Signal) {
        let Ok(raw) = i32::try_from(pgid) else {
            return;
        };
        if self.settings.privilege_prefix.is_none() {
            match killpg(Pid::from_raw(raw), signal) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => warn!(pgid, signal = signal.as_str(), error = %e, "could not signal process group"),
            }
            return;
        }

        let name = signal.as_str().trim_start_matches("SIG");
        let kill = self.privileged(&format!("kill -s {name} -- -{pgid}"));
        let status = Command::new("sh")
            .arg("-c")
            .arg(&kill)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if let Err(e) = status {
            warn!(pgid, signal = signal.as_str(), error = %e, "could not signal process group");
        }
    }

    /// Pattern matching for any scan; service discovery for primary scans.
    async fn post_process(
        self: &Arc<Self>,
        scan: ScanRef,
        def: &ScanDefinition,
        ctx: &TemplateContext,
        output: &Path,
    ) -> Result<()> {
        let bytes = match tokio::fs::read(output).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(output = %output.display(), "command produced no output file");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let content: Cow<'_, str> = String::from_utf8_lossy(&bytes);

        self.record_patterns(def, ctx, output, &content).await?;
        if scan.tier() == Tier::Primary {
            self.discover(output, &content).await?;
        }
        Ok(())
    }

    async fn record_patterns(
        &self,
        def: &ScanDefinition,
        ctx: &TemplateContext,
        output: &Path,
        content: &str,
    ) -> Result<()> {
        let found = {
            let patterns = PatternMatcher::patterns_for(&self.config.universal, &def.patterns, ctx);
            if patterns.is_empty() {
                return Ok(());
            }
            find_matches(content, &patterns, ctx)?
        };
        if found.is_empty() {
            return Ok(());
        }

        let mut matcher = self.matcher.lock().await;
        let added = matcher.record(output, found);
        if added > 0 {
            info!(output = %output.display(), new = added, "patterns matched");
            if let Some(text) = matcher.render_log() {
                logs::rewrite(&self.paths.patterns_log(), &text).await?;
            }
        }
        Ok(())
    }

    async fn discover(self: &Arc<Self>, output: &Path, content: &str) -> Result<()> {
        let entries = parse_scan_result(content, output)?;
        let services = &self.config.services;

        for entry in entries.iter().filter(|e| !e.is_closed()) {
            let ctx = entry.context(&self.host, services);
            let detected = entry.detected();
            {
                let mut registry = self.services.lock().await;
                if registry.insert(detected.clone()) {
                    info!(service = %detected, "detected service");
                }
                logs::rewrite(&self.paths.services_log(), &registry.render_log()).await?;
            }

            for (rule_idx, rule) in matching_rules(&services.rules, &entry.service) {
                debug!(rule = %rule.name, service = %entry.service, port = entry.port, "service rule matched");
                if !rule.manual.is_empty() {
                    let mut recorder = self.manual.lock().await;
                    let text = recorder.record(&rule.name, &rule.manual, &ctx);
                    if !text.is_empty() {
                        logs::append(&self.paths.manual_log(), &text).await?;
                    }
                }
                for scan_idx in 0..rule.scans.len() {
                    self.spawn_unit(
                        ScanRef::Secondary {
                            rule: rule_idx,
                            scan: scan_idx,
                        },
                        ctx.clone(),
                    );
                }
            }
        }
        Ok(())
    }
}

async fn read_stderr(stderr: Option<ChildStderr>) -> String {
    let mut buf = Vec::new();
    if let Some(mut stderr) = stderr {
        let _ = stderr.read_to_end(&mut buf).await;
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Remove a partial output file so a later run does not treat it as done.
async fn invalidate(unit: u64, output: &Path) {
    match tokio::fs::remove_file(output).await {
        Ok(()) => info!(unit, output = %output.display(), "removed output of unsuccessful command"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(unit, output = %output.display(), error = %e, "could not remove output file"),
    }
}

fn last_line(s: &str) -> &str {
    s.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("")
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}

/// Directory where a run's output lands when none is given.
pub fn default_output_dir(address: &str) -> PathBuf {
    PathBuf::from("results").join(address)
}
