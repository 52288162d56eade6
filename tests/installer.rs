// tests/installer.rs

//! End-to-end installs through real worker processes

mod common;

use common::write_spec_file;
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::time::{Duration, Instant};
use strata::install::lock::{DatabaseLock, PrefixLock};
use strata::install::{BuildOutcome, BuildSource, Database, InstallerOptions, PackageInstaller};
use strata::{Config, DepTypes, InstallPolicy, Spec, SpecBuilder};
use tempfile::TempDir;

fn config(dir: &TempDir) -> Config {
    Config {
        install_root: dir.path().join("opt"),
        keyring_dir: dir.path().join("keys"),
        jobs: 1,
        install_policy: InstallPolicy::SourceOnly,
        unsigned: true,
        ..Default::default()
    }
}

fn options(jobs: usize) -> InstallerOptions {
    InstallerOptions {
        jobs,
        install_policy: InstallPolicy::SourceOnly,
        overwrite: HashSet::new(),
        install_package: true,
        install_deps: true,
        fail_fast: false,
        keep_going: true,
        inherit_jobserver: false,
        worker_exe: PathBuf::from(env!("CARGO_BIN_EXE_strata")),
        interactive: false,
        unsigned: true,
    }
}

/// Three specs with no dependencies between them
fn independent_specs() -> Vec<Spec> {
    ["alpha", "beta", "gamma"]
        .iter()
        .map(|name| {
            SpecBuilder::new(*name, "1.0")
                .phase("build", "sleep 0.5")
                .phase("install", "mkdir -p \"$PREFIX/bin\" && touch \"$PREFIX/bin/$STRATA_SPEC_NAME\"")
                .build()
        })
        .collect()
}

#[test]
fn test_single_job_runs_builds_one_at_a_time() {
    let dir = TempDir::new().unwrap();
    let specs = independent_specs();
    let report = PackageInstaller::new(config(&dir), specs.clone(), options(1))
        .install()
        .unwrap();
    assert_eq!(report.succeeded().count(), 3);

    let mut builds: Vec<_> = report.builds.iter().collect();
    builds.sort_by_key(|b| b.started);
    for pair in builds.windows(2) {
        assert!(
            pair[1].started >= pair[0].finished,
            "{} started before {} finished",
            pair[1].name,
            pair[0].name
        );
    }

    for spec in &specs {
        let prefix = spec.install_prefix(&dir.path().join("opt"));
        assert!(prefix.join("bin").join(spec.name()).exists());
    }
}

#[test]
fn test_three_jobs_run_builds_concurrently() {
    let dir = TempDir::new().unwrap();
    let report = PackageInstaller::new(config(&dir), independent_specs(), options(3))
        .install()
        .unwrap();
    assert_eq!(report.succeeded().count(), 3);

    let last_start = report.builds.iter().map(|b| b.started).max().unwrap();
    let first_finish = report.builds.iter().map(|b| b.finished).min().unwrap();
    assert!(last_start < first_finish, "builds did not overlap");
}

#[test]
fn test_failed_phase_is_reported_with_log() {
    let dir = TempDir::new().unwrap();
    let broken = SpecBuilder::new("broken", "0.1")
        .phase("configure", "echo 'checking for cc... no' && exit 3")
        .build();
    let app = SpecBuilder::new("app", "2.0")
        .depends_on(&broken, DepTypes::BUILD | DepTypes::LINK)
        .phase("build", "true")
        .build();

    let err = PackageInstaller::new(config(&dir), vec![app], options(2))
        .install()
        .unwrap_err();
    let message = err.to_string();
    assert!(message.contains("1 of 2 builds failed"), "{}", message);
    assert!(message.contains("broken@0.1"), "{}", message);
    assert!(message.contains("1 more specs were not installed"), "{}", message);

    let config = config(&dir);
    let logs: Vec<_> = fs::read_dir(config.log_dir()).unwrap().collect();
    assert_eq!(logs.len(), 1);
    let log = fs::read_to_string(logs[0].as_ref().unwrap().path()).unwrap();
    assert!(log.contains("checking for cc... no"));
}

#[test]
fn test_install_command_records_explicit_specs() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let config_path = dir.path().join("config.toml");
    fs::write(&config_path, toml::to_string(&config).unwrap()).unwrap();

    let zlib = SpecBuilder::new("zlib", "1.3").phase("install", "true").build();
    let libpng = SpecBuilder::new("libpng", "1.6.43")
        .depends_on(&zlib, DepTypes::BUILD | DepTypes::LINK)
        .phase("install", "true")
        .build();
    let spec_file = write_spec_file(dir.path(), &libpng);

    let output = Command::new(env!("CARGO_BIN_EXE_strata"))
        .arg("--config")
        .arg(&config_path)
        .args(["install", "-j", "2"])
        .arg(&spec_file)
        .env_remove("MAKEFLAGS")
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "{}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Installed 2 specs"), "{}", stdout);

    let db = Database::open(&config.database_path()).unwrap();
    assert!(db.get(libpng.dag_hash()).unwrap().unwrap().explicit);
    assert!(!db.get(zlib.dag_hash()).unwrap().unwrap().explicit);

    // a second run finds everything installed
    let output = Command::new(env!("CARGO_BIN_EXE_strata"))
        .arg("--config")
        .arg(&config_path)
        .arg("install")
        .arg(&spec_file)
        .env_remove("MAKEFLAGS")
        .output()
        .unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("already installed"));
}

#[test]
fn test_worker_reports_source_build() {
    let dir = TempDir::new().unwrap();
    let spec = SpecBuilder::new("solo", "1.0").phase("install", "true").build();
    let report = PackageInstaller::new(config(&dir), vec![spec.clone()], options(1))
        .install()
        .unwrap();
    assert_eq!(
        report.get(spec.dag_hash()).unwrap().outcome,
        BuildOutcome::Installed(BuildSource::Source)
    );
}

/// Wait for `path` to appear, for at most ten seconds
fn wait_for(path: &std::path::Path) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if path.exists() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    false
}

#[test]
fn test_busy_database_holds_back_dependents() {
    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let marker = dir.path().join("libdwarf-started");

    let libelf = SpecBuilder::new("libelf", "0.8.13")
        .phase("install", "mkdir -p \"$PREFIX\" && touch \"$PREFIX/done\"")
        .build();
    let libdwarf = SpecBuilder::new("libdwarf", "20180129")
        .depends_on(&libelf, DepTypes::BUILD | DepTypes::LINK)
        .phase("install", &format!("touch '{}'", marker.display()))
        .build();

    // another process is writing to the database
    let lock = DatabaseLock::for_database(&config.database_path());
    let guard = lock.try_write(Duration::from_secs(1)).unwrap().unwrap();

    let installer = PackageInstaller::new(config.clone(), vec![libdwarf.clone()], options(2));
    let run = std::thread::spawn(move || installer.install());

    let libelf_done = libelf.install_prefix(&config.install_root).join("done");
    assert!(wait_for(&libelf_done));
    // let the worker exit and be reaped
    std::thread::sleep(Duration::from_millis(500));

    assert!(!marker.exists(), "dependent started before its dependency was recorded");
    let db = Database::open(&config.database_path()).unwrap();
    assert!(db.get(libelf.dag_hash()).unwrap().is_none());

    drop(guard);
    let report = run.join().unwrap().unwrap();
    assert_eq!(report.succeeded().count(), 2);
    assert!(marker.exists());
    assert!(db.get(libelf.dag_hash()).unwrap().is_some());
    assert!(db.get(libdwarf.dag_hash()).unwrap().unwrap().explicit);
}

#[test]
fn test_phases_can_reach_the_jobserver() {
    let dir = TempDir::new().unwrap();
    // whichever syntax the installed make needs, the channel it names exists
    let check = r#"case "$MAKEFLAGS" in
  *fifo:*) test -p "${MAKEFLAGS##*fifo:}" ;;
  *--jobserver-auth=*) fds="${MAKEFLAGS##*--jobserver-auth=}"; test -e "/proc/self/fd/${fds%%,*}" ;;
  *--jobserver-fds=*) fds="${MAKEFLAGS##*--jobserver-fds=}"; test -e "/proc/self/fd/${fds%%,*}" ;;
  *) echo "no jobserver in MAKEFLAGS='$MAKEFLAGS'"; exit 1 ;;
esac"#;
    let spec = SpecBuilder::new("uses-make", "1.0").phase("build", check).build();
    let report = PackageInstaller::new(config(&dir), vec![spec], options(2))
        .install()
        .unwrap();
    assert_eq!(report.succeeded().count(), 1);
}

#[test]
fn test_interrupt_joins_running_builds_and_drops_pending() {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;
    use std::process::Stdio;

    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let config_path = dir.path().join("config.toml");
    fs::write(&config_path, toml::to_string(&config).unwrap()).unwrap();
    let started = dir.path().join("libelf-started");
    let dependent = dir.path().join("libdwarf-started");

    let libelf = SpecBuilder::new("libelf", "0.8.13")
        .phase("build", &format!("touch '{}' && sleep 1", started.display()))
        .phase("install", "mkdir -p \"$PREFIX\" && touch \"$PREFIX/done\"")
        .build();
    let libdwarf = SpecBuilder::new("libdwarf", "20180129")
        .depends_on(&libelf, DepTypes::BUILD | DepTypes::LINK)
        .phase("install", &format!("touch '{}'", dependent.display()))
        .build();
    let spec_file = write_spec_file(dir.path(), &libdwarf);

    let child = Command::new(env!("CARGO_BIN_EXE_strata"))
        .arg("--config")
        .arg(&config_path)
        .arg("install")
        .arg(&spec_file)
        .env_remove("MAKEFLAGS")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .unwrap();
    assert!(wait_for(&started));
    kill(Pid::from_raw(child.id() as i32), Signal::SIGINT).unwrap();

    let output = child.wait_with_output().unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("interrupted"), "{}", stderr);

    // the running build was waited for, not killed
    assert!(libelf.install_prefix(&config.install_root).join("done").exists());
    // the pending dependent never started
    assert!(!dependent.exists());
    // and the install root is free again
    assert!(PrefixLock::try_acquire(&config.install_root).unwrap().is_some());
}
