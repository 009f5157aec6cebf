//! Binary entry point for the Verge CLI.

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::process;

use clap::Parser;
use serde::Serialize;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

use verge::declaration::parse_trigger;
use verge::{
    ApiConfig, BranchDeclaration, CommitDeclaration, ConfigError, DeclarationError,
    DriverSettings, EngineConfig, FileLedgerStore, HttpApiError, HttpLifecycleApi, ImageId,
    ProcessCommandRunner, ProvisionDeclaration, ResourceDriver, ResourceError,
    RestoreDeclaration, TransportConfig, TunnelTransport, VmDeclaration, VmId,
};

mod cli;

use cli::{Cli, CommitCommand, CreateCommand, ProvisionCommand, VmCommand};

const LOG_ENV_VAR: &str = "VERGE_LOG";

type Driver = ResourceDriver<HttpLifecycleApi, TunnelTransport<ProcessCommandRunner>>;

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Declaration(#[from] DeclarationError),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("api client error: {0}")]
    Client(String),
    #[error(transparent)]
    Resource(#[from] ResourceError<HttpApiError>),
    #[error("failed to render output: {0}")]
    Output(String),
}

/// A command whose declaration has already been validated.
#[derive(Debug)]
enum Request {
    CreateVm(VmDeclaration),
    ListVms,
    DeleteVm(VmId),
    PauseVm(VmId),
    ResumeVm(VmId),
    Provision {
        unit: String,
        declaration: ProvisionDeclaration,
    },
    Commit {
        unit: Option<String>,
        declaration: CommitDeclaration,
    },
    Restore(RestoreDeclaration),
    Branch(BranchDeclaration),
    Lineage(VmId),
    ForgetImage(ImageId),
    Refresh,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing();
    let exit_code = match dispatch(cli).await {
        Ok(()) => 0,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_env(LOG_ENV_VAR).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

async fn dispatch(cli: Cli) -> Result<(), CliError> {
    let request = prepare(cli)?;
    let driver = build_driver()?;
    execute(&driver, request).await
}

/// Validates everything that can be validated locally, before any
/// configuration is loaded or any remote call is made.
fn prepare(cli: Cli) -> Result<Request, CliError> {
    let request = match cli {
        Cli::Vm(command) => prepare_vm(command)?,
        Cli::Provision(command) => prepare_provision(&command)?,
        Cli::Commit(command) => prepare_commit(command)?,
        Cli::Restore(arg) => {
            let declaration = RestoreDeclaration {
                image_id: arg.image,
            };
            declaration.image()?;
            Request::Restore(declaration)
        }
        Cli::Branch(arg) => {
            let declaration = BranchDeclaration {
                source_vm_id: arg.vm,
            };
            declaration.source()?;
            Request::Branch(declaration)
        }
        Cli::Lineage(arg) => Request::Lineage(vm_arg(&arg.vm)?),
        Cli::ForgetImage(arg) => Request::ForgetImage(
            RestoreDeclaration {
                image_id: arg.image,
            }
            .image()?,
        ),
        Cli::Refresh => Request::Refresh,
    };
    Ok(request)
}

fn prepare_vm(command: VmCommand) -> Result<Request, CliError> {
    Ok(match command {
        VmCommand::Create(CreateCommand {
            vcpus,
            memory_mib,
            disk_mib,
            no_wait,
        }) => {
            let declaration = VmDeclaration {
                vcpu_count: vcpus,
                mem_size_mib: memory_mib,
                fs_size_mib: disk_mib,
                wait_boot: Some(!no_wait),
            };
            declaration.validate()?;
            Request::CreateVm(declaration)
        }
        VmCommand::List => Request::ListVms,
        VmCommand::Delete(arg) => Request::DeleteVm(vm_arg(&arg.vm)?),
        VmCommand::Pause(arg) => Request::PauseVm(vm_arg(&arg.vm)?),
        VmCommand::Resume(arg) => Request::ResumeVm(vm_arg(&arg.vm)?),
    })
}

fn prepare_provision(command: &ProvisionCommand) -> Result<Request, CliError> {
    let declaration = ProvisionDeclaration::from_manifest(&command.manifest)?;
    declaration.validate()?;
    let unit = command
        .unit
        .clone()
        .or_else(|| command.manifest.file_stem().map(str::to_owned))
        .unwrap_or_else(|| String::from("default"));
    Ok(Request::Provision { unit, declaration })
}

fn prepare_commit(command: CommitCommand) -> Result<Request, CliError> {
    let triggers = command
        .triggers
        .iter()
        .map(|raw| parse_trigger(raw))
        .collect::<Result<BTreeMap<_, _>, _>>()?;
    let declaration = CommitDeclaration {
        vm_id: command.vm,
        keep_paused: command.keep_paused,
        triggers,
    };
    declaration.vm()?;
    Ok(Request::Commit {
        unit: command.unit,
        declaration,
    })
}

fn vm_arg(raw: &str) -> Result<VmId, CliError> {
    Ok(BranchDeclaration {
        source_vm_id: raw.to_owned(),
    }
    .source()?)
}

fn build_driver() -> Result<Driver, CliError> {
    let api_config = ApiConfig::load_without_cli_args()?;
    api_config.validate()?;
    let api =
        HttpLifecycleApi::new(&api_config).map_err(|err| CliError::Client(err.to_string()))?;

    let transport_config = TransportConfig::load_without_cli_args()?;
    let transport = TunnelTransport::with_process_runner(transport_config)?;

    let engine = EngineConfig::load_without_cli_args()?;
    engine.validate()?;
    let store = FileLedgerStore::new(engine.state_path());

    Ok(ResourceDriver::new(
        api,
        transport,
        store,
        DriverSettings::from_config(&engine),
    ))
}

async fn execute(driver: &Driver, request: Request) -> Result<(), CliError> {
    match request {
        Request::CreateVm(declaration) => print_json(&driver.create_vm(&declaration).await?),
        Request::ListVms => print_json(&driver.list_vms().await?),
        Request::DeleteVm(vm_id) => {
            driver.delete_vm(&vm_id).await?;
            print_json(&Deleted { vm_id })
        }
        Request::PauseVm(vm_id) => {
            driver.pause(&vm_id).await?;
            print_json(&StateChanged {
                vm_id,
                state: "paused",
            })
        }
        Request::ResumeVm(vm_id) => {
            driver.resume(&vm_id).await?;
            print_json(&StateChanged {
                vm_id,
                state: "running",
            })
        }
        Request::Provision { unit, declaration } => {
            print_json(&driver.provision(&unit, &declaration).await?)
        }
        Request::Commit { unit, declaration } => {
            print_json(&driver.commit(unit.as_deref(), &declaration).await?)
        }
        Request::Restore(declaration) => print_json(&driver.restore(&declaration).await?),
        Request::Branch(declaration) => print_json(&driver.branch(&declaration).await?),
        Request::Lineage(vm_id) => print_json(&driver.lineage(&vm_id).await?),
        Request::ForgetImage(image_id) => print_json(&driver.forget_image(&image_id).await?),
        Request::Refresh => print_json(&driver.refresh().await?),
    }
}

#[derive(Serialize)]
struct Deleted {
    vm_id: VmId,
}

#[derive(Serialize)]
struct StateChanged {
    vm_id: VmId,
    state: &'static str,
}

fn print_json(value: &impl Serialize) -> Result<(), CliError> {
    let rendered =
        serde_json::to_string_pretty(value).map_err(|err| CliError::Output(err.to_string()))?;
    writeln!(io::stdout(), "{rendered}").map_err(|err| CliError::Output(err.to_string()))
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap_or_else(|err| panic!("parse {args:?}: {err}"))
    }

    #[test]
    fn commit_collects_triggers() {
        let request = prepare(parse(&[
            "verge",
            "commit",
            "vm-1",
            "--keep-paused",
            "--trigger",
            "version=2",
            "--trigger",
            "channel=stable",
            "--unit",
            "golden",
        ]))
        .unwrap_or_else(|err| panic!("prepare: {err}"));

        let Request::Commit { unit, declaration } = request else {
            panic!("expected commit request, got {request:?}");
        };
        assert_eq!(unit.as_deref(), Some("golden"));
        assert!(declaration.keep_paused);
        assert_eq!(declaration.triggers.len(), 2);
    }

    #[rstest]
    #[case::malformed_trigger(&["verge", "commit", "vm-1", "--trigger", "oops"])]
    #[case::blank_vm(&["verge", "branch", " "])]
    #[case::zero_memory(&["verge", "vm", "create", "--memory-mib", "0"])]
    fn invalid_arguments_fail_before_configuration(#[case] args: &[&str]) {
        let err = prepare(parse(args)).expect_err("prepare must fail");
        assert!(
            err.to_string().starts_with("configuration error"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn provision_unit_defaults_to_manifest_stem() {
        let dir = tempfile::TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let root = camino::Utf8PathBuf::from_path_buf(dir.path().to_path_buf())
            .unwrap_or_else(|path| panic!("temp dir should be utf8: {}", path.display()));
        cap_std::fs_utf8::Dir::open_ambient_dir(&root, cap_std::ambient_authority())
            .unwrap_or_else(|err| panic!("open temp dir: {err}"))
            .write("base-layer.toml", "vm_id = \"vm-1\"\ncommands = [\"true\"]\n")
            .unwrap_or_else(|err| panic!("write manifest: {err}"));
        let manifest = root.join("base-layer.toml").into_string();

        let request = prepare(parse(&["verge", "provision", manifest.as_str()]))
            .unwrap_or_else(|err| panic!("prepare: {err}"));

        let Request::Provision { unit, .. } = request else {
            panic!("expected provision request, got {request:?}");
        };
        assert_eq!(unit, "base-layer");
    }

    #[test]
    fn write_error_writes_cli_error() {
        let mut buf = Vec::new();
        let err = CliError::Client(String::from("boom"));
        write_error(&mut buf, &err);
        let rendered = String::from_utf8(buf).expect("utf8");
        assert!(rendered.contains("api client error: boom"), "rendered: {rendered}");
    }
}
