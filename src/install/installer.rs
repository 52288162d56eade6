// src/install/installer.rs

//! Concurrent package installer
//!
//! One worker process per build, driven from a single-threaded loop in the
//! parent. Each iteration:
//!
//! 1. polls the workers' output and state pipes, the jobserver and (on a
//!    terminal) stdin, for at most [`REDRAW_INTERVAL`];
//! 2. reaps exited workers and releases their jobserver tokens;
//! 3. records finished builds in the database if its lock can be taken
//!    within a few milliseconds, and only then unlocks their parents;
//! 4. starts ready builds: one on the implicit token, more for each token
//!    the jobserver hands out.
//!
//! The whole run holds the prefix lock, so concurrent installs into the
//! same root serialize.

use super::database::Database;
use super::graph::{BuildGraph, GraphOptions};
use super::jobserver::{self, JobServer};
use super::lock::{DatabaseLock, PrefixLock};
use super::protocol::{
    ECHO_OFF, ECHO_ON, LineBuffer, STATE_FAILED, STATE_FETCHING, STATE_FINISHED, StateEvent,
};
use super::status::{BuildStatus, REDRAW_INTERVAL};
use super::worker::{BuildSource, WORKER_SUBCOMMAND, WorkerRequest};
use crate::config::{Config, InstallPolicy};
use crate::error::{Error, Result};
use crate::spec::Spec;
use nix::errno::Errno;
use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use nix::sys::termios::{LocalFlags, SetArg, Termios, tcgetattr, tcsetattr};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fs::File;
use std::io::{self, ErrorKind, IsTerminal, Read, Write};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

/// Longest wait for the database lock inside the loop
const DB_LOCK_TIMEOUT: Duration = Duration::from_millis(5);

/// Upper bound on one wait in the loop, matching the redraw rate
const POLL_TIMEOUT_MS: u16 = REDRAW_INTERVAL.as_millis() as u16;

/// Longest time spent reading an exited worker's pipes
const DRAIN_LIMIT: Duration = Duration::from_millis(200);

/// Failures quoted in the final error
const MAX_REPORTED_FAILURES: usize = 5;

#[derive(Debug, Clone)]
pub struct InstallerOptions {
    pub jobs: usize,
    pub install_policy: InstallPolicy,
    /// Hashes to reinstall even if already installed
    pub overwrite: HashSet<String>,
    /// Install the requested specs
    pub install_package: bool,
    /// Install their missing dependencies
    pub install_deps: bool,
    /// Stop starting builds after the first failure
    pub fail_fast: bool,
    /// Keep building unrelated specs after a failure
    pub keep_going: bool,
    /// Use the jobserver of a parent make when one is announced
    pub inherit_jobserver: bool,
    /// Executable providing the worker subcommand
    pub worker_exe: PathBuf,
    /// Show the dashboard and accept keys when attached to a terminal
    pub interactive: bool,
    pub unsigned: bool,
}

impl InstallerOptions {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            jobs: config.jobs,
            install_policy: config.install_policy,
            overwrite: HashSet::new(),
            install_package: true,
            install_deps: true,
            fail_fast: false,
            keep_going: true,
            inherit_jobserver: true,
            worker_exe: std::env::current_exe()?,
            interactive: true,
            unsigned: config.unsigned,
        })
    }

    fn stop_on_failure(&self) -> bool {
        self.fail_fast || !self.keep_going
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildOutcome {
    Installed(BuildSource),
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct BuildRecord {
    pub hash: String,
    pub name: String,
    pub started: Instant,
    pub finished: Instant,
    pub outcome: BuildOutcome,
}

impl BuildRecord {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, BuildOutcome::Installed(_))
    }
}

#[derive(Debug, Default)]
pub struct InstallReport {
    /// Builds in the order they finished
    pub builds: Vec<BuildRecord>,
    /// Specs never attempted because a dependency failed
    pub not_attempted: Vec<String>,
}

impl InstallReport {
    pub fn succeeded(&self) -> impl Iterator<Item = &BuildRecord> {
        self.builds.iter().filter(|b| b.succeeded())
    }

    pub fn failed(&self) -> impl Iterator<Item = &BuildRecord> {
        self.builds.iter().filter(|b| !b.succeeded())
    }

    pub fn get(&self, hash: &str) -> Option<&BuildRecord> {
        self.builds.iter().find(|b| b.hash == hash)
    }
}

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Turns SIGINT into a flag the loop checks; restores the old handler on drop
struct SigintGuard {
    previous: SigAction,
}

impl SigintGuard {
    fn install() -> Result<Self> {
        INTERRUPTED.store(false, Ordering::SeqCst);
        let action = SigAction::new(
            SigHandler::Handler(on_sigint),
            SaFlags::empty(),
            SigSet::empty(),
        );
        // SAFETY: the handler only stores to an atomic
        let previous = unsafe { sigaction(Signal::SIGINT, &action) }?;
        Ok(Self { previous })
    }
}

impl Drop for SigintGuard {
    fn drop(&mut self) {
        // SAFETY: restores the disposition that was in place before
        if let Err(e) = unsafe { sigaction(Signal::SIGINT, &self.previous) } {
            warn!("Failed to restore SIGINT handler: {}", e);
        }
    }
}

/// Single-key input on the terminal for the duration of the run
struct TerminalGuard {
    original: Termios,
}

impl TerminalGuard {
    fn new() -> Result<Self> {
        let stdin = io::stdin();
        let original = tcgetattr(stdin.as_fd())?;
        let mut keys = original.clone();
        keys.local_flags.remove(LocalFlags::ICANON | LocalFlags::ECHO);
        tcsetattr(stdin.as_fd(), SetArg::TCSANOW, &keys)?;
        Ok(Self { original })
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        if let Err(e) = tcsetattr(io::stdin().as_fd(), SetArg::TCSANOW, &self.original) {
            warn!("Failed to restore terminal settings: {}", e);
        }
    }
}

/// A running worker and the parent's ends of its pipes
struct ChildInfo {
    spec: Spec,
    child: Child,
    output: Option<File>,
    state: Option<File>,
    control: Option<File>,
    lines: LineBuffer,
    phase: String,
    finished_event: bool,
    source: BuildSource,
    started: Instant,
    has_token: bool,
    log_path: PathBuf,
    _request: NamedTempFile,
}

impl ChildInfo {
    fn cleanup(&mut self) {
        self.output = None;
        self.state = None;
        self.control = None;
    }

    fn send_control(&mut self, byte: u8) {
        if let Some(control) = &mut self.control {
            if let Err(e) = control.write_all(&[byte]) {
                debug!("Worker for {} stopped reading control bytes: {}", self.spec, e);
                self.control = None;
            }
        }
    }

    fn apply(&mut self, event: StateEvent, status: &mut BuildStatus) {
        let hash = self.spec.dag_hash().to_string();
        match event {
            StateEvent::State { state } => {
                if state == STATE_FINISHED {
                    self.finished_event = true;
                } else if state == STATE_FAILED {
                    self.finished_event = false;
                } else {
                    if state == STATE_FETCHING {
                        self.source = BuildSource::Cache;
                    }
                    status.update_state(&hash, &state);
                    self.phase = state;
                }
            }
            StateEvent::Progress { progress, total } => {
                status.update_progress(&hash, progress, total);
            }
        }
    }
}

/// A build that finished and still has to be recorded in the database
struct Completed {
    spec: Spec,
    prefix: PathBuf,
}

enum Tag {
    Output(String),
    State(String),
    Tokens,
    Stdin,
}

fn readable(fd: &PollFd<'_>) -> bool {
    fd.revents()
        .is_some_and(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR))
}

fn set_nonblocking(fd: &OwnedFd) -> Result<()> {
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFL(OFlag::O_NONBLOCK))?;
    Ok(())
}

/// Read what is available without blocking; `None` at end of file
fn read_available(file: &File, buf: &mut [u8]) -> Option<usize> {
    let mut reader = file;
    match reader.read(buf) {
        Ok(0) => None,
        Ok(n) => Some(n),
        Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => Some(0),
        Err(e) => {
            debug!("Read from worker pipe failed: {}", e);
            None
        }
    }
}

pub struct PackageInstaller {
    config: Config,
    specs: Vec<Spec>,
    options: InstallerOptions,
}

impl PackageInstaller {
    pub fn new(config: Config, specs: Vec<Spec>, options: InstallerOptions) -> Self {
        Self {
            config,
            specs,
            options,
        }
    }

    /// Install the requested specs and whatever they need
    pub fn install(&self) -> Result<InstallReport> {
        let _prefix_lock = PrefixLock::acquire(&self.config.install_root)?;
        let db_path = self.config.database_path();
        let db = Database::open(&db_path)?;

        let graph_options = GraphOptions {
            install_policy: self.options.install_policy,
            install_package: self.options.install_package,
            install_deps: self.options.install_deps,
            overwrite: self.options.overwrite.clone(),
        };
        let graph = BuildGraph::new(&self.specs, &db, &graph_options)?;
        if graph.is_empty() {
            info!("All requested specs are already installed");
            return Ok(InstallReport::default());
        }
        info!("Installing {} specs with {} jobs", graph.len(), self.options.jobs);

        let tty = self.options.interactive && io::stdin().is_terminal() && io::stderr().is_terminal();
        let jobserver = JobServer::new(self.options.jobs, self.options.inherit_jobserver)?;
        let makeflags = jobserver.makeflags(jobserver::detect_make_version());
        debug!("Builds get MAKEFLAGS='{}'", makeflags);
        let _terminal = if tty { Some(TerminalGuard::new()?) } else { None };
        let _sigint = SigintGuard::install()?;

        let mut session = Session {
            installer: self,
            pending: graph.ready().into(),
            status: BuildStatus::new(graph.len(), tty),
            total: graph.len(),
            graph,
            db,
            db_lock: DatabaseLock::for_database(&db_path),
            jobserver,
            makeflags,
            keys: tty,
            running: HashMap::new(),
            implicit_in_use: false,
            to_flush: Vec::new(),
            report: InstallReport::default(),
            failures: Vec::new(),
            stopped: false,
        };
        let result = session.run();
        session.status.clear();
        result?;
        session.finish()
    }
}

/// State of one installer run
struct Session<'a> {
    installer: &'a PackageInstaller,
    graph: BuildGraph,
    db: Database,
    db_lock: DatabaseLock,
    jobserver: JobServer,
    /// Jobserver flags in the syntax of the installed make
    makeflags: String,
    status: BuildStatus,
    total: usize,
    keys: bool,
    pending: VecDeque<String>,
    running: HashMap<String, ChildInfo>,
    /// A worker is running on this process's own job slot
    implicit_in_use: bool,
    to_flush: Vec<Completed>,
    report: InstallReport,
    failures: Vec<String>,
    stopped: bool,
}

impl Session<'_> {
    fn run(&mut self) -> Result<()> {
        loop {
            if INTERRUPTED.load(Ordering::SeqCst) {
                self.status.println("==> Interrupted, waiting for running builds to exit");
                self.wait_all();
                self.flush_database();
                return Err(Error::Interrupted);
            }

            self.reap();
            self.flush_database();
            if !self.stopped {
                self.start_builds()?;
            }

            let idle = self.pending.is_empty() || self.stopped;
            if self.running.is_empty() && self.to_flush.is_empty() && idle {
                return Ok(());
            }

            self.poll_once()?;
            self.status.redraw();
        }
    }

    fn start_builds(&mut self) -> Result<()> {
        while !self.pending.is_empty() {
            let has_token = if !self.implicit_in_use {
                false
            } else if self.jobserver.acquire(1) == 1 {
                true
            } else {
                break;
            };
            let Some(hash) = self.pending.pop_front() else {
                break;
            };

            match self.spawn(&hash, has_token) {
                Ok(child) => {
                    if !has_token {
                        self.implicit_in_use = true;
                    }
                    self.status.add_build(&child.spec);
                    self.running.insert(hash, child);
                }
                Err(e) => {
                    if has_token {
                        self.jobserver.release();
                    }
                    let now = Instant::now();
                    let label = self.graph.get(&hash).map(Spec::cformat).unwrap_or_else(|| hash.clone());
                    self.record_failure(&hash, now, now, format!("{}: cannot start worker: {}", label, e));
                }
            }
        }
        Ok(())
    }

    fn spawn(&mut self, hash: &str, has_token: bool) -> Result<ChildInfo> {
        let installer = self.installer;
        let config = &installer.config;
        let spec = self
            .graph
            .get(hash)
            .cloned()
            .ok_or_else(|| Error::InstallFailed(format!("{} is not in the build graph", hash)))?;

        let log_dir = config.log_dir();
        std::fs::create_dir_all(&log_dir)?;
        let log_path = log_dir.join(format!("{}.log", hash));
        if log_path.exists() {
            std::fs::remove_file(&log_path)?;
        }

        let prefix = spec.install_prefix(&config.install_root);
        let request = WorkerRequest {
            spec: spec.to_document(),
            install_root: config.install_root.clone(),
            prefix,
            log_path: log_path.clone(),
            install_policy: installer.options.install_policy,
            mirrors: config.mirrors.clone(),
            keyring_dir: config.keyring_dir.clone(),
            unsigned: installer.options.unsigned,
            makeflags: self.makeflags.clone(),
            echo: false,
        };
        let request_file = tempfile::Builder::new()
            .prefix("strata-request-")
            .suffix(".json")
            .tempfile()?;
        request.write_to(request_file.path())?;

        let (state_r, state_w) = nix::unistd::pipe2(OFlag::O_CLOEXEC)?;
        let (output_r, output_w) = nix::unistd::pipe2(OFlag::O_CLOEXEC)?;
        let (control_r, control_w) = nix::unistd::pipe2(OFlag::O_CLOEXEC)?;
        set_nonblocking(&state_r)?;
        set_nonblocking(&output_r)?;

        debug!("Starting worker for {} (token: {})", spec, has_token);
        let child = Command::new(&installer.options.worker_exe)
            .arg(WORKER_SUBCOMMAND)
            .arg(request_file.path())
            .stdin(Stdio::from(control_r))
            .stdout(Stdio::from(state_w))
            .stderr(Stdio::from(output_w))
            .spawn()?;

        Ok(ChildInfo {
            spec,
            child,
            output: Some(File::from(output_r)),
            state: Some(File::from(state_r)),
            control: Some(File::from(control_w)),
            lines: LineBuffer::new(),
            phase: "starting".to_string(),
            finished_event: false,
            source: BuildSource::Source,
            started: Instant::now(),
            has_token,
            log_path,
            _request: request_file,
        })
    }

    fn poll_once(&mut self) -> Result<()> {
        let mut tags = Vec::new();
        let ready: Vec<Tag> = {
            let stdin = io::stdin();
            let mut fds = Vec::new();
            for (hash, child) in &self.running {
                if let Some(output) = &child.output {
                    fds.push(PollFd::new(output.as_fd(), PollFlags::POLLIN));
                    tags.push(Tag::Output(hash.clone()));
                }
                if let Some(state) = &child.state {
                    fds.push(PollFd::new(state.as_fd(), PollFlags::POLLIN));
                    tags.push(Tag::State(hash.clone()));
                }
            }
            if !self.pending.is_empty() && !self.stopped {
                fds.push(PollFd::new(self.jobserver.read_fd(), PollFlags::POLLIN));
                tags.push(Tag::Tokens);
            }
            if self.keys {
                fds.push(PollFd::new(stdin.as_fd(), PollFlags::POLLIN));
                tags.push(Tag::Stdin);
            }

            match poll(&mut fds, PollTimeout::from(POLL_TIMEOUT_MS)) {
                Ok(_) | Err(Errno::EINTR) => {}
                Err(e) => return Err(e.into()),
            }
            fds.iter()
                .zip(tags)
                .filter(|(fd, _)| readable(fd))
                .map(|(_, tag)| tag)
                .collect()
        };

        for tag in ready {
            match tag {
                Tag::Output(hash) => {
                    self.read_output(&hash);
                }
                Tag::State(hash) => {
                    self.read_state(&hash);
                }
                // picked up by start_builds on the next iteration
                Tag::Tokens => {}
                Tag::Stdin => self.read_keys(),
            }
        }
        Ok(())
    }

    /// Returns whether any bytes were read
    fn read_output(&mut self, hash: &str) -> bool {
        let echoing = self.status.echo_target() == Some(hash);
        let Some(child) = self.running.get_mut(hash) else {
            return false;
        };
        let Some(output) = &child.output else {
            return false;
        };
        let mut buf = [0u8; 65536];
        match read_available(output, &mut buf) {
            None => {
                child.output = None;
                false
            }
            Some(0) => false,
            Some(n) => {
                if echoing {
                    self.status.print_output(&buf[..n]);
                }
                true
            }
        }
    }

    /// Returns whether any bytes were read
    fn read_state(&mut self, hash: &str) -> bool {
        let Some(child) = self.running.get_mut(hash) else {
            return false;
        };
        let Some(state) = &child.state else {
            return false;
        };
        let mut buf = [0u8; 4096];
        let (lines, got) = match read_available(state, &mut buf) {
            None => {
                child.state = None;
                (child.lines.finish().into_iter().collect(), false)
            }
            Some(n) => (child.lines.feed(&buf[..n]), n > 0),
        };
        for line in lines {
            match StateEvent::from_line(&line) {
                Ok(event) => child.apply(event, &mut self.status),
                Err(e) => warn!("Bad state event from worker for {}: {} ({:?})", child.spec, e, line),
            }
        }
        got
    }

    fn read_keys(&mut self) {
        let mut buf = [0u8; 16];
        let n = match io::stdin().lock().read(&mut buf) {
            Ok(0) | Err(_) => {
                self.keys = false;
                return;
            }
            Ok(n) => n,
        };
        for key in &buf[..n] {
            match key {
                b'v' => {
                    let next = self.status.next_echo_target();
                    self.switch_echo(next);
                }
                b'q' => self.switch_echo(None),
                _ => {}
            }
        }
    }

    fn switch_echo(&mut self, target: Option<String>) {
        if let Some(old) = self.status.echo_target().map(str::to_string) {
            if let Some(child) = self.running.get_mut(&old) {
                child.send_control(ECHO_OFF);
            }
        }
        if let Some(new) = &target {
            if let Some(child) = self.running.get_mut(new) {
                child.send_control(ECHO_ON);
            }
        }
        self.status.set_echo_target(target);
    }

    /// Read whatever an exited worker left in its pipes
    ///
    /// Stops at end of file, when nothing more is buffered, or after
    /// [`DRAIN_LIMIT`]: a leftover grandchild may hold the write end open
    /// and keep writing.
    fn drain(&mut self, hash: &str) {
        let deadline = Instant::now() + DRAIN_LIMIT;
        while self.read_state(hash) && Instant::now() < deadline {}
        while self.read_output(hash) && Instant::now() < deadline {}
    }

    fn reap(&mut self) {
        let mut exited: Vec<(String, ExitStatus)> = Vec::new();
        for (hash, child) in &mut self.running {
            match child.child.try_wait() {
                Ok(Some(status)) => exited.push((hash.clone(), status)),
                Ok(None) => {}
                Err(e) => warn!("Cannot check worker for {}: {}", child.spec, e),
            }
        }

        for (hash, exit) in exited {
            self.drain(&hash);
            let Some(mut child) = self.running.remove(&hash) else {
                continue;
            };
            if child.has_token {
                self.jobserver.release();
            } else {
                self.implicit_in_use = false;
            }
            child.cleanup();
            let finished = Instant::now();

            if exit.success() && child.finished_event {
                self.status.finish(&hash, Some(child.source));
                self.report.builds.push(BuildRecord {
                    hash: hash.clone(),
                    name: child.spec.name().to_string(),
                    started: child.started,
                    finished,
                    outcome: BuildOutcome::Installed(child.source),
                });
                let prefix = child.spec.install_prefix(&self.installer.config.install_root);
                self.to_flush.push(Completed {
                    spec: child.spec,
                    prefix,
                });
            } else {
                self.status.finish(&hash, None);
                let reason = format!(
                    "{} failed during {} ({}), see {}",
                    child.spec.cformat(),
                    child.phase,
                    exit,
                    child.log_path.display()
                );
                self.record_failure(&hash, child.started, finished, reason);
            }
        }
    }

    fn record_failure(&mut self, hash: &str, started: Instant, finished: Instant, reason: String) {
        warn!("{}", reason);
        let name = self
            .graph
            .get(hash)
            .map(|s| s.name().to_string())
            .unwrap_or_default();
        self.report.builds.push(BuildRecord {
            hash: hash.to_string(),
            name,
            started,
            finished,
            outcome: BuildOutcome::Failed(reason.clone()),
        });
        self.failures.push(reason);
        if self.installer.options.stop_on_failure() && !self.stopped {
            self.status.println("==> Not starting new builds after a failure");
            self.stopped = true;
            self.pending.clear();
        }
    }

    fn flush_database(&mut self) {
        if self.to_flush.is_empty() {
            return;
        }
        let _guard = match self.db_lock.try_write(DB_LOCK_TIMEOUT) {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                debug!("Database is busy, keeping {} entries queued", self.to_flush.len());
                return;
            }
            Err(e) => {
                warn!("Cannot lock the database: {}", e);
                return;
            }
        };

        for completed in std::mem::take(&mut self.to_flush) {
            let hash = completed.spec.dag_hash().to_string();
            let explicit = self.graph.is_root(&hash);
            if let Err(e) = self.db.add(&completed.spec, &completed.prefix, explicit) {
                let now = Instant::now();
                self.report.builds.retain(|b| b.hash != hash);
                self.record_failure(
                    &hash,
                    now,
                    now,
                    format!("{}: cannot record installation: {}", completed.spec.cformat(), e),
                );
                continue;
            }
            let unlocked = self.graph.enqueue_parents(&hash);
            if !self.stopped {
                self.pending.extend(unlocked);
            }
        }
    }

    /// Wait for every running worker to exit
    fn wait_all(&mut self) {
        for (_, mut child) in self.running.drain() {
            if let Err(e) = child.child.wait() {
                warn!("Waiting for worker of {} failed: {}", child.spec, e);
            }
            if child.has_token {
                self.jobserver.release();
            }
            child.cleanup();
        }
        self.implicit_in_use = false;
    }

    fn finish(self) -> Result<InstallReport> {
        let mut report = self.report;
        let attempted: HashSet<&str> = report.builds.iter().map(|b| b.hash.as_str()).collect();
        let mut not_attempted: Vec<String> = self
            .graph
            .specs()
            .filter(|s| !attempted.contains(s.dag_hash()))
            .map(Spec::cformat)
            .collect();
        report.not_attempted.append(&mut not_attempted);
        report.not_attempted.sort();

        if self.failures.is_empty() {
            info!("Installed {} specs", report.builds.len());
            return Ok(report);
        }

        let mut message = format!(
            "{} of {} builds failed",
            self.failures.len(),
            self.total
        );
        for failure in self.failures.iter().take(MAX_REPORTED_FAILURES) {
            message.push_str(&format!("\n  {}", failure));
        }
        if self.failures.len() > MAX_REPORTED_FAILURES {
            message.push_str(&format!(
                "\n  ... and {} more",
                self.failures.len() - MAX_REPORTED_FAILURES
            ));
        }
        if !report.not_attempted.is_empty() {
            message.push_str(&format!(
                "\n{} more specs were not installed",
                report.not_attempted.len()
            ));
        }
        Err(Error::InstallFailed(message))
    }
}
