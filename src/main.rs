// src/main.rs

use anyhow::Result;
use clap::Parser;
use strata::buildcache::push::PushOptions;
use tracing_subscriber::EnvFilter;

mod cli;
mod commands;

use cli::{BuildcacheCommands, Cli, Commands, GpgCommands};

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Workers log into their build log; stderr is the output pipe
    if let Commands::BuildWorker { request } = &cli.command {
        return commands::cmd_build_worker(request);
    }

    init_logging(cli.verbose);
    let config = commands::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Install {
            specs,
            jobs,
            cache_only,
            source_only,
            only,
            overwrite,
            fail_fast,
            no_check_signature,
        } => commands::cmd_install(
            config,
            &specs,
            jobs,
            cache_only,
            source_only,
            only.as_deref(),
            overwrite,
            fail_fast,
            no_check_signature,
        ),

        Commands::Buildcache(cmd) => match cmd {
            BuildcacheCommands::Push {
                mirror,
                hashes,
                force,
                key,
                unsigned,
                fail_fast,
                update_index,
            } => commands::cmd_buildcache_push(
                &config,
                &mirror,
                &hashes,
                PushOptions {
                    force,
                    signing_key: key,
                    unsigned: unsigned || config.unsigned,
                    fail_fast,
                    update_index,
                },
            ),
            BuildcacheCommands::List { allarch, mirror } => {
                commands::cmd_buildcache_list(&config, allarch, mirror.as_deref())
            }
            BuildcacheCommands::Check { specs, mirror } => {
                commands::cmd_buildcache_check(&config, &specs, mirror.as_deref())
            }
            BuildcacheCommands::UpdateIndex { mirror, key } => {
                commands::cmd_buildcache_update_index(&config, &mirror, key.as_deref())
            }
            BuildcacheCommands::Keys {
                install,
                trust,
                mirror,
            } => commands::cmd_buildcache_keys(&config, install, trust, mirror.as_deref()),
            BuildcacheCommands::Migrate {
                mirror,
                unsigned,
                delete_existing,
                yes_to_all,
                key,
            } => commands::cmd_buildcache_migrate(
                &config,
                &mirror,
                unsigned,
                delete_existing,
                yes_to_all,
                key,
            ),
            BuildcacheCommands::Prune {
                mirror,
                keeplist,
                dry_run,
            } => commands::cmd_buildcache_prune(&config, &mirror, keeplist.as_deref(), dry_run),
            BuildcacheCommands::Sync {
                src,
                dest,
                manifest_glob,
            } => commands::cmd_buildcache_sync(
                &config,
                src.as_deref(),
                dest.as_deref(),
                manifest_glob.as_deref(),
            ),
        },

        Commands::Gpg(cmd) => match cmd {
            GpgCommands::Trust { keyfile } => commands::cmd_gpg_trust(&config, &keyfile),
            GpgCommands::List => commands::cmd_gpg_list(&config),
            GpgCommands::Create { name, email } => commands::cmd_gpg_create(&config, &name, &email),
            GpgCommands::Export { fingerprint, file } => {
                commands::cmd_gpg_export(&config, &fingerprint, &file)
            }
        },

        Commands::BuildWorker { request } => commands::cmd_build_worker(&request),
    }
}
