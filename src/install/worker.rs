// src/install/worker.rs

//! Build worker process
//!
//! `strata __build-worker <request.json>` installs exactly one spec. The
//! parent hands it the request file and the three protocol pipes (see
//! [`super::protocol`]). The worker either unpacks a binary from the
//! buildcache or runs the spec's build phases with `sh -c`, sending state
//! events to the parent as it goes.
//!
//! Build output from every phase goes through a pipe to a tee thread that
//! appends it to the build log and, while the parent has echo switched on,
//! copies it to the parent as well.

use super::protocol::{ECHO_OFF, ECHO_ON, STATE_FAILED, STATE_FETCHING, STATE_FINISHED, StateEvent};
use crate::buildcache::archive;
use crate::buildcache::fetch::install_from_buildcache;
use crate::buildcache::index::BinaryIndex;
use crate::config::{InstallPolicy, MirrorConfig};
use crate::error::{Error, Result};
use crate::signing::Keyring;
use crate::spec::{DepTypes, Spec, SpecDocument};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

/// Hidden CLI subcommand that runs a worker
pub const WORKER_SUBCOMMAND: &str = "__build-worker";

/// Where a spec ended up being installed from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildSource {
    Cache,
    Source,
}

impl std::fmt::Display for BuildSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildSource::Cache => write!(f, "cache"),
            BuildSource::Source => write!(f, "source"),
        }
    }
}

/// Everything a worker needs to install one spec
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub spec: SpecDocument,
    pub install_root: PathBuf,
    pub prefix: PathBuf,
    pub log_path: PathBuf,
    pub install_policy: InstallPolicy,
    #[serde(default)]
    pub mirrors: Vec<MirrorConfig>,
    pub keyring_dir: PathBuf,
    #[serde(default)]
    pub unsigned: bool,
    /// Passed to phases as `MAKEFLAGS`
    #[serde(default)]
    pub makeflags: String,
    /// Echo output to the parent from the start
    #[serde(default)]
    pub echo: bool,
}

impl WorkerRequest {
    pub fn write_to(&self, path: &Path) -> Result<()> {
        std::fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        Ok(serde_json::from_slice(&std::fs::read(path)?)?)
    }
}

/// Send a state event on stdout
fn emit(event: &StateEvent) {
    let line = match event.to_line() {
        Ok(line) => line,
        Err(e) => {
            warn!("Cannot encode state event {:?}: {}", event, e);
            return;
        }
    };
    let mut stdout = io::stdout().lock();
    if let Err(e) = stdout.write_all(&line).and_then(|()| stdout.flush()) {
        debug!("Parent is no longer reading state events: {}", e);
    }
}

fn readable(fd: &PollFd<'_>) -> bool {
    fd.revents()
        .is_some_and(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR))
}

/// Copy build output to the log and, while echo is on, to stderr
///
/// Also watches stdin for control bytes. Returns when every writer of
/// `output` has closed it.
fn spawn_tee(output: File, mut log: File, echo: Arc<AtomicBool>) -> io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("tee".to_string())
        .spawn(move || {
            let stdin = io::stdin();
            let mut control_open = true;
            let mut buf = [0u8; 8192];
            let mut control = [0u8; 64];
            loop {
                let (out_ready, control_ready) = {
                    let mut fds = vec![PollFd::new(output.as_fd(), PollFlags::POLLIN)];
                    if control_open {
                        fds.push(PollFd::new(stdin.as_fd(), PollFlags::POLLIN));
                    }
                    match poll(&mut fds, PollTimeout::NONE) {
                        Ok(_) => {}
                        Err(Errno::EINTR) => continue,
                        Err(e) => {
                            warn!("poll failed in tee: {}", e);
                            break;
                        }
                    }
                    (readable(&fds[0]), control_open && readable(&fds[1]))
                };

                if control_ready {
                    match stdin.lock().read(&mut control) {
                        Ok(0) | Err(_) => control_open = false,
                        Ok(n) => {
                            for byte in &control[..n] {
                                match *byte {
                                    ECHO_ON => echo.store(true, Ordering::SeqCst),
                                    ECHO_OFF => echo.store(false, Ordering::SeqCst),
                                    _ => {}
                                }
                            }
                        }
                    }
                }

                if out_ready {
                    match (&output).read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => {
                            if let Err(e) = log.write_all(&buf[..n]) {
                                warn!("Writing build log failed: {}", e);
                            }
                            if echo.load(Ordering::SeqCst) {
                                let mut stderr = io::stderr().lock();
                                let _ = stderr.write_all(&buf[..n]).and_then(|()| stderr.flush());
                            }
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => {
                            warn!("Reading build output failed: {}", e);
                            break;
                        }
                    }
                }
            }
        })
}

/// Prefixes of the dependencies a build can see, `:`-separated
fn dependency_path(spec: &Spec, install_root: &Path) -> String {
    spec.traverse_deps_first(DepTypes::BUILD | DepTypes::LINK | DepTypes::RUN)
        .iter()
        .filter(|dep| dep.dag_hash() != spec.dag_hash())
        .map(|dep| dep.install_prefix(install_root).to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(":")
}

fn try_buildcache(request: &WorkerRequest, spec: &Spec, output: &mut File) -> Result<bool> {
    let mirrors: Vec<_> = request.mirrors.iter().map(MirrorConfig::to_mirror).collect();
    if mirrors.is_empty() {
        return Ok(false);
    }
    let keyring = Keyring::new(&request.keyring_dir)?;
    let index = BinaryIndex::new(mirrors, Some(&keyring), request.unsigned);
    let candidates = index.binary_cache_for_spec(spec);
    if candidates.is_empty() {
        writeln!(output, "==> No binary for {} on any mirror", spec)?;
        return Ok(false);
    }

    emit(&StateEvent::state(STATE_FETCHING));
    writeln!(output, "==> Fetching {} from the buildcache", spec)?;
    match install_from_buildcache(spec, &candidates, Some(&keyring), request.unsigned, &request.prefix) {
        Ok(mirror) => {
            writeln!(output, "==> Extracted {} from {}", spec, mirror)?;
            Ok(true)
        }
        Err(e) => {
            writeln!(output, "==> Cannot install {} from the buildcache: {}", spec, e)?;
            Ok(false)
        }
    }
}

fn build_from_source(request: &WorkerRequest, spec: &Spec, output: &mut File) -> Result<()> {
    let phases = spec.recipe().map(|r| r.phases.clone()).unwrap_or_default();
    let stage = tempfile::Builder::new()
        .prefix(&format!("strata-stage-{}-", spec.name()))
        .tempdir()?;
    std::fs::create_dir_all(&request.prefix)?;
    let dependency_path = dependency_path(spec, &request.install_root);

    let total = phases.len() as u64;
    for (i, phase) in phases.iter().enumerate() {
        emit(&StateEvent::state(&phase.name));
        writeln!(output, "==> {}: executing phase '{}'", spec.name(), phase.name)?;
        info!("Running phase {} of {}", phase.name, spec);

        let status = Command::new("sh")
            .arg("-c")
            .arg(&phase.script)
            .current_dir(stage.path())
            .env("PREFIX", &request.prefix)
            .env("STRATA_SPEC_NAME", spec.name())
            .env("STRATA_SPEC_VERSION", spec.version())
            .env("STRATA_SPEC_HASH", spec.dag_hash())
            .env("STRATA_DEPENDENCY_PATH", &dependency_path)
            .env("MAKEFLAGS", &request.makeflags)
            .stdin(Stdio::null())
            .stdout(Stdio::from(output.try_clone()?))
            .stderr(Stdio::from(output.try_clone()?))
            .status()?;

        if !status.success() {
            return Err(Error::InstallFailed(format!(
                "{}: phase '{}' failed with {}",
                spec.cformat(),
                phase.name,
                status
            )));
        }
        emit(&StateEvent::progress(i as u64 + 1, total));
    }
    Ok(())
}

fn install(request: &WorkerRequest, spec: &Spec, output: &mut File) -> Result<BuildSource> {
    writeln!(output, "==> Installing {}", spec)?;
    if request.install_policy != InstallPolicy::SourceOnly {
        if try_buildcache(request, spec, output)? {
            return Ok(BuildSource::Cache);
        }
        if request.install_policy == InstallPolicy::CacheOnly {
            return Err(Error::BuildcacheEntry(format!(
                "{} is not available from any mirror and source builds are disabled",
                spec.cformat()
            )));
        }
    }

    if let Err(e) = build_from_source(request, spec, output) {
        if request.prefix.exists() {
            if let Err(cleanup) = std::fs::remove_dir_all(&request.prefix) {
                warn!("Failed to clean up {}: {}", request.prefix.display(), cleanup);
            }
        }
        return Err(e);
    }
    archive::write_spec_metadata(spec, &request.prefix)?;
    Ok(BuildSource::Source)
}

/// Install the spec described by `request`, reporting over the standard streams
pub fn run(request: &WorkerRequest) -> Result<BuildSource> {
    let spec = request.spec.to_spec()?;
    if let Some(parent) = request.log_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let log = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&request.log_path)?;

    let (read_end, write_end) = nix::unistd::pipe2(OFlag::O_CLOEXEC)?;
    let echo = Arc::new(AtomicBool::new(request.echo));
    let tee = spawn_tee(File::from(read_end), log, Arc::clone(&echo))?;

    let mut output = File::from(write_end);
    let result = install(request, &spec, &mut output);
    if let Err(e) = &result {
        let _ = writeln!(output, "==> Error: {}", e);
    }
    drop(output);
    if tee.join().is_err() {
        warn!("Tee thread panicked");
    }

    match &result {
        Ok(source) => {
            info!("Installed {} from {}", spec, source);
            emit(&StateEvent::state(STATE_FINISHED));
        }
        Err(e) => {
            warn!("Installing {} failed: {}", spec, e);
            emit(&StateEvent::state(STATE_FAILED));
        }
    }
    result
}
