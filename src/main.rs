use std::process::ExitCode;

use clap::Parser;
use derive_more::{Display, Error, From};
use snap_replicate_lib::catalog::ZfsCatalog;
use snap_replicate_lib::cli::{Action, Cli, JobArgs, ReleaseArgs, ReplicateArgs, StatusArgs};
use snap_replicate_lib::config::{ConfigError, ReplicatorConfig};
use snap_replicate_lib::replication::{Controller, HoldError, HoldManager, ReplicationError, RunReport};
use snap_replicate_lib::service::{FileServiceStore, ServiceState, ServiceStateError, ServiceStateStore};
use snap_replicate_lib::transfer::ZfsSendReceive;

#[derive(Debug, Display, Error, From)]
enum CliError {
    Config(ConfigError),
    Replication(ReplicationError),
    Service(ServiceStateError),
    Hold(HoldError),
    Json(serde_json::Error),
}

#[derive(Debug, serde::Serialize)]
struct JobStatus<'a> {
    job: &'a str,
    state: ServiceState,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // init logger
    let mut env_logger = env_logger::builder();
    if let Some(level) = cli.verbose {
        env_logger.filter_level(level);
    }
    env_logger.try_init().expect("env_logger should not fail");

    match execute(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn execute(cli: Cli) -> Result<(), CliError> {
    let config = ReplicatorConfig::load_or_init(&cli.config)?;
    let service = FileServiceStore::new(&config.state_file);

    match cli.action {
        Action::Replicate(args) => replicate(&config, &service, args),
        Action::Status(args) => status(&config, &service, args),
        Action::Clear(JobArgs { job }) => {
            config.job(&job)?;
            Ok(service.enable(&job)?)
        }
        Action::Disable(JobArgs { job }) => {
            config.job(&job)?;
            Ok(service.disable(&job)?)
        }
        Action::Release(args) => release(&config, args),
    }
}

fn replicate(
    config: &ReplicatorConfig,
    service: &FileServiceStore,
    args: ReplicateArgs,
) -> Result<(), CliError> {
    let job = config.job(&args.job)?;
    let catalog = ZfsCatalog::new(&config.zfs_command, config.elevate.clone());
    let executor = ZfsSendReceive::new(&config.zfs_command, config.elevate.clone());

    let report = Controller::new(&catalog, &executor, service).run(&job, &args.schedule, &args.label)?;
    match report {
        RunReport::Skipped(reason) => {
            log::info!("Job {} skipped: {reason}", job.id());
        }
        RunReport::Completed { transfers } => {
            let bytes: u64 = transfers.iter().map(|t| t.bytes).sum();
            log::info!(
                "Job {} replicated {} dataset(s), {bytes} bytes",
                job.id(),
                transfers.len()
            );
        }
    }
    Ok(())
}

fn status(
    config: &ReplicatorConfig,
    service: &FileServiceStore,
    args: StatusArgs,
) -> Result<(), CliError> {
    let jobs: Vec<&str> = match &args.job {
        Some(job) => {
            config.job(job)?;
            vec![job.as_str()]
        }
        None => config.jobs.keys().map(String::as_str).collect(),
    };

    let statuses = jobs
        .into_iter()
        .map(|job| Ok(JobStatus { job, state: service.state(job)? }))
        .collect::<Result<Vec<_>, ServiceStateError>>()?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&statuses)?);
    } else {
        for JobStatus { job, state } in statuses {
            println!("{job}\t{state}");
        }
    }
    Ok(())
}

fn release(config: &ReplicatorConfig, args: ReleaseArgs) -> Result<(), CliError> {
    let job = config.job(&args.job.job)?;
    let catalog = ZfsCatalog::new(&config.zfs_command, config.elevate.clone());

    if HoldManager::new(&catalog).release(&args.snapshot, job.keys.hold_tag())? {
        log::info!("Released hold of job {} on {}", job.id(), args.snapshot);
    } else {
        log::info!("Job {} holds nothing on {}", job.id(), args.snapshot);
    }
    Ok(())
}
