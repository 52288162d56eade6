// src/install/jobserver.rs

//! GNU make compatible jobserver
//!
//! Tokens are single bytes in a pipe or named FIFO. Every participant owns
//! one implicit token and must read a byte from the channel before running
//! any additional job, writing it back when the job is done. The installer
//! and every `make` it spawns draw from the same channel, so the configured
//! job count bounds the whole process tree.
//!
//! When strata itself runs under `make -jN` it attaches to the parent's
//! jobserver (announced through `MAKEFLAGS`); otherwise it creates a FIFO
//! seeded with `jobs - 1` tokens and removes it on drop.

use crate::error::{Error, Result};
use nix::fcntl::{FcntlArg, FdFlag, fcntl};
use nix::sys::stat::Mode;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, warn};

const TOKEN: u8 = b'+';
const FIFO_NAME: &str = "jobserver_fifo";

/// Tokens written up front; stays below the 64 KiB Linux pipe buffer so the
/// write cannot block with no reader draining it
const MAX_TOKENS: usize = 4096;

/// How a jobserver is advertised to children
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobserverAuth {
    Fifo(PathBuf),
    Fds(RawFd, RawFd),
}

/// Find the jobserver announced in a `MAKEFLAGS` value
///
/// Understands `--jobserver-auth=fifo:PATH`, `--jobserver-auth=R,W` and the
/// pre-4.2 `--jobserver-fds=R,W`. When several are present the last wins,
/// matching make's own parsing.
pub fn parse_makeflags(makeflags: &str) -> Option<JobserverAuth> {
    let mut found = None;
    for arg in makeflags.split_whitespace() {
        let Some(value) = arg
            .strip_prefix("--jobserver-auth=")
            .or_else(|| arg.strip_prefix("--jobserver-fds="))
        else {
            continue;
        };
        if let Some(path) = value.strip_prefix("fifo:") {
            found = Some(JobserverAuth::Fifo(PathBuf::from(path)));
        } else if let Some((r, w)) = value.split_once(',') {
            match (r.parse::<RawFd>(), w.parse::<RawFd>()) {
                (Ok(r), Ok(w)) if r >= 0 && w >= 0 => found = Some(JobserverAuth::Fds(r, w)),
                _ => found = None,
            }
        }
    }
    found
}

/// A GNU make version, for choosing the `MAKEFLAGS` syntax
pub type MakeVersion = (u32, u32);

/// Version from the first line of `make --version`, e.g. `GNU Make 4.3`
pub fn parse_make_version(output: &str) -> Option<MakeVersion> {
    let line = output.lines().next()?;
    let version = line.strip_prefix("GNU Make ")?.split_whitespace().next()?;
    let mut parts = version.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts
        .next()
        .and_then(|m| m.trim_end_matches(|c: char| !c.is_ascii_digit()).parse().ok())
        .unwrap_or(0);
    Some((major, minor))
}

/// Version of the `make` on `PATH`, or `None` when there is no GNU make
pub fn detect_make_version() -> Option<MakeVersion> {
    let output = std::process::Command::new("make")
        .arg("--version")
        .stdin(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .output()
        .ok()?;
    let version = parse_make_version(&String::from_utf8_lossy(&output.stdout));
    debug!("Detected make version {:?}", version);
    version
}

pub struct JobServer {
    reader: File,
    writer: File,
    /// Descriptors children inherit for the fd-pair syntax
    inheritable: Option<(File, File)>,
    auth: JobserverAuth,
    num_jobs: usize,
    created: bool,
    tokens_acquired: usize,
    _fifo_dir: Option<TempDir>,
}

fn fd_is_open(fd: RawFd) -> bool {
    fcntl(fd, FcntlArg::F_GETFD).is_ok()
}

fn open_reader(path: &Path) -> std::io::Result<File> {
    OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
}

fn open_writer(path: &Path) -> std::io::Result<File> {
    OpenOptions::new().write(true).open(path)
}

/// Blocking read and write handles without close-on-exec
fn open_inheritable(path: &Path) -> Result<(File, File)> {
    let reader = OpenOptions::new().read(true).open(path)?;
    let writer = open_writer(path)?;
    for file in [&reader, &writer] {
        fcntl(file.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::empty()))?;
    }
    Ok((reader, writer))
}

impl JobServer {
    /// Attach to the jobserver in `$MAKEFLAGS` when `inherit` is set and one
    /// is usable, else create one for `num_jobs` jobs
    pub fn new(num_jobs: usize, inherit: bool) -> Result<Self> {
        if inherit {
            if let Ok(makeflags) = std::env::var("MAKEFLAGS") {
                if let Some(server) = Self::connect(&makeflags, num_jobs) {
                    return Ok(server);
                }
            }
        }
        Self::create(num_jobs)
    }

    /// Attach to the jobserver described by `makeflags`
    ///
    /// Returns `None` when no jobserver is announced or its channel is not
    /// usable from this process (closed descriptors, missing FIFO).
    pub fn connect(makeflags: &str, num_jobs: usize) -> Option<Self> {
        let auth = parse_makeflags(makeflags)?;
        let opened = match &auth {
            JobserverAuth::Fifo(path) => {
                let is_fifo = std::fs::metadata(path)
                    .map(|m| m.file_type().is_fifo())
                    .unwrap_or(false);
                if !is_fifo {
                    warn!("Jobserver FIFO {} is not usable", path.display());
                    return None;
                }
                let reader = open_reader(path).ok()?;
                let writer = open_writer(path).ok()?;
                let inheritable = open_inheritable(path).ok()?;
                Some((reader, writer, Some(inheritable)))
            }
            JobserverAuth::Fds(r, w) => {
                if !fd_is_open(*r) || !fd_is_open(*w) {
                    warn!("Jobserver descriptors {},{} are not open, ignoring them", r, w);
                    return None;
                }
                // A private open file description, so non-blocking reads here
                // do not change how the parent make reads the pipe
                let reader = open_reader(Path::new(&format!("/proc/self/fd/{}", r)));
                let writer = open_writer(Path::new(&format!("/proc/self/fd/{}", w)));
                reader.and_then(|r| Ok((r, writer?, None))).ok()
            }
        };
        let (reader, writer, inheritable) = opened?;
        debug!("Attached to jobserver {:?}", auth);
        Some(Self {
            reader,
            writer,
            inheritable,
            auth,
            num_jobs,
            created: false,
            tokens_acquired: 0,
            _fifo_dir: None,
        })
    }

    /// Create a FIFO jobserver with `num_jobs - 1` tokens
    pub fn create(num_jobs: usize) -> Result<Self> {
        let num_jobs = num_jobs.max(1);
        let dir = tempfile::Builder::new().prefix("strata-jobserver-").tempdir()?;
        let path = dir.path().join(FIFO_NAME);
        nix::unistd::mkfifo(&path, Mode::S_IRUSR | Mode::S_IWUSR)
            .map_err(|e| Error::Jobserver(format!("cannot create {}: {}", path.display(), e)))?;

        // The reader must exist before a blocking open for writing returns
        let reader = open_reader(&path)?;
        let mut writer = open_writer(&path)?;
        let inheritable = open_inheritable(&path)?;
        let tokens = (num_jobs - 1).min(MAX_TOKENS);
        if tokens < num_jobs - 1 {
            warn!("Limiting the jobserver to {} jobs", tokens + 1);
        }
        writer.write_all(&vec![TOKEN; tokens])?;
        debug!("Created jobserver at {} with {} jobs", path.display(), num_jobs);

        Ok(Self {
            reader,
            writer,
            inheritable: Some(inheritable),
            auth: JobserverAuth::Fifo(path),
            num_jobs,
            created: true,
            tokens_acquired: 0,
            _fifo_dir: Some(dir),
        })
    }

    /// Take up to `n` tokens without blocking; returns how many were taken
    pub fn acquire(&mut self, n: usize) -> usize {
        if n == 0 {
            return 0;
        }
        let mut buf = vec![0u8; n];
        let got = match self.reader.read(&mut buf) {
            Ok(got) => got,
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => 0,
            Err(e) => {
                warn!("Reading jobserver tokens failed: {}", e);
                0
            }
        };
        self.tokens_acquired += got;
        got
    }

    /// Return one token; a no-op while no tokens are held
    pub fn release(&mut self) {
        if self.tokens_acquired == 0 {
            return;
        }
        match self.writer.write_all(&[TOKEN]) {
            Ok(()) => self.tokens_acquired -= 1,
            Err(e) => warn!("Returning a jobserver token failed: {}", e),
        }
    }

    pub fn tokens_acquired(&self) -> usize {
        self.tokens_acquired
    }

    pub fn num_jobs(&self) -> usize {
        self.num_jobs
    }

    /// Whether this process created (and will remove) the channel
    pub fn is_creator(&self) -> bool {
        self.created
    }

    pub fn auth(&self) -> &JobserverAuth {
        &self.auth
    }

    /// Descriptor that becomes readable when tokens are available
    pub fn read_fd(&self) -> BorrowedFd<'_> {
        self.reader.as_fd()
    }

    /// `MAKEFLAGS` fragment for a child make of the given version
    ///
    /// make 4.4 added the FIFO syntax and 4.2 renamed `--jobserver-fds` to
    /// `--jobserver-auth`. Older makes abort on a FIFO string, so an unknown
    /// version gets the descriptor pair under both names, which every make
    /// since 3.78 accepts. The descriptors are inherited by children.
    pub fn makeflags(&self, make_version: Option<MakeVersion>) -> String {
        let jobs = self.num_jobs;
        if let (JobserverAuth::Fifo(path), Some(version)) = (&self.auth, make_version) {
            if version >= (4, 4) {
                return format!(" -j{} --jobserver-auth=fifo:{}", jobs, path.display());
            }
        }
        let (r, w) = match (&self.auth, &self.inheritable) {
            (JobserverAuth::Fds(r, w), _) => (*r, *w),
            (_, Some((r, w))) => (r.as_raw_fd(), w.as_raw_fd()),
            (JobserverAuth::Fifo(_), None) => return format!(" -j{}", jobs),
        };
        match make_version {
            Some(version) if version < (4, 2) => {
                format!(" -j{} --jobserver-fds={},{}", jobs, r, w)
            }
            _ => format!(" -j{} --jobserver-fds={},{} --jobserver-auth={},{}", jobs, r, w, r, w),
        }
    }
}

impl Drop for JobServer {
    fn drop(&mut self) {
        while self.tokens_acquired > 0 {
            let before = self.tokens_acquired;
            self.release();
            if self.tokens_acquired == before {
                break;
            }
        }
        if self.created {
            if let JobserverAuth::Fifo(path) = &self.auth {
                debug!("Removing jobserver FIFO {}", path.display());
                if let Err(e) = std::fs::remove_file(path) {
                    warn!("Failed to remove {}: {}", path.display(), e);
                }
            }
        }
    }
}
