// src/commands/install.rs
//! Install command

use super::read_spec_files;
use anyhow::Result;
use std::path::PathBuf;
use strata::install::{BuildOutcome, BuildSource, InstallerOptions, PackageInstaller};
use strata::{Config, InstallPolicy};
use tracing::info;

#[allow(clippy::too_many_arguments)]
pub fn cmd_install(
    config: Config,
    spec_files: &[PathBuf],
    jobs: Option<usize>,
    cache_only: bool,
    source_only: bool,
    only: Option<&str>,
    overwrite: bool,
    fail_fast: bool,
    no_check_signature: bool,
) -> Result<()> {
    let specs = read_spec_files(spec_files)?;
    info!("Installing {} requested specs", specs.len());

    let mut options = InstallerOptions::from_config(&config)?;
    if let Some(jobs) = jobs {
        if jobs == 0 {
            anyhow::bail!("--jobs must be at least 1");
        }
        options.jobs = jobs;
    }
    if cache_only {
        options.install_policy = InstallPolicy::CacheOnly;
    } else if source_only {
        options.install_policy = InstallPolicy::SourceOnly;
    }
    match only {
        Some("package") => options.install_deps = false,
        Some("dependencies") => options.install_package = false,
        _ => {}
    }
    if overwrite {
        options.overwrite = specs.iter().map(|s| s.dag_hash().to_string()).collect();
    }
    options.fail_fast = fail_fast;
    options.unsigned |= no_check_signature;

    let install_root = config.install_root.clone();
    let report = PackageInstaller::new(config, specs, options).install()?;

    if report.builds.is_empty() {
        println!("All requested specs are already installed");
        return Ok(());
    }
    let (mut from_cache, mut from_source) = (0, 0);
    for build in &report.builds {
        if let BuildOutcome::Installed(source) = &build.outcome {
            match source {
                BuildSource::Cache => from_cache += 1,
                BuildSource::Source => from_source += 1,
            }
        }
    }
    println!(
        "Installed {} specs into {} ({} from cache, {} from source)",
        report.builds.len(),
        install_root.display(),
        from_cache,
        from_source
    );
    Ok(())
}
