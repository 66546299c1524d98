use std::env;
use std::fs;
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use crashbisect_engine::{
    BisectionEngine, DEFAULT_CHUNK_COUNT, ManifestProvider, ProgressView, StateStore, StepOutcome,
    run_step,
};
use crashbisect_error::{BisectError, Result};
use crashbisect_supervisor::{
    CommandInjector, ProcessHost, Supervisor, SupervisorConfig, SupervisorExit, SystemClock,
    init_logging,
};
use tracing::info;

const CONTROL_POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Step {
        state_dir: PathBuf,
        manifest: PathBuf,
        keep_list: PathBuf,
        chunk_count: usize,
    },
    Run {
        config: PathBuf,
    },
    Status {
        state_dir: PathBuf,
        json: bool,
    },
    Reset {
        state_dir: PathBuf,
    },
    InitConfig {
        config: PathBuf,
        force: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Cli {
    command: Command,
    verbose: bool,
    log_dir: Option<PathBuf>,
}

fn print_help() {
    let help = "\
crashbisect - isolate the content that crashes a long-running operation

USAGE:
    crashbisect [GLOBAL OPTIONS] <COMMAND> [OPTIONS]

COMMANDS:
    step          Run one engine step (invoked from inside the target)
        --state-dir <DIR>       Shared state directory
        --manifest <PATH>       Candidate manifest (`id` or `id<TAB>label` per line)
        --keep-list <PATH>      File receiving the ids the target must keep loaded
        --chunk-count <N>       Initial number of chunks (default: 10)
    run           Supervise test cycles until finished; type `stop` or
                  `status` on stdin while it runs
        --config <PATH>         Supervisor config (TOML)
    status        Show isolation progress
        --state-dir <DIR>
        --json                  Emit machine-readable JSON
    reset         Delete the record, verdict and fault export
        --state-dir <DIR>
    init-config   Write an example supervisor config
        --config <PATH>
        --force                 Overwrite an existing file

GLOBAL OPTIONS:
    -v, --verbose               Debug-level logging
    --log-dir <DIR>             Also write JSON-lines logs to <DIR>/crashbisect.log.jsonl
    -h, --help                  Show this help
";
    println!("{help}");
}

fn usage(msg: impl Into<String>) -> BisectError {
    BisectError::Usage(msg.into())
}

fn take_value<'a>(args: &'a [String], index: &mut usize, flag: &str) -> Result<&'a str> {
    *index += 1;
    args.get(*index)
        .map(String::as_str)
        .ok_or_else(|| usage(format!("{flag} requires a value")))
}

fn require(value: Option<PathBuf>, flag: &str, command: &str) -> Result<PathBuf> {
    value.ok_or_else(|| usage(format!("{command} requires {flag}")))
}

/// Parse argv (without the program name). `Ok(None)` means help was asked
/// for.
fn parse_args(args: &[String]) -> Result<Option<Cli>> {
    let mut verbose = false;
    let mut log_dir = None;
    let mut subcommand: Option<String> = None;
    let mut state_dir = None;
    let mut manifest = None;
    let mut keep_list = None;
    let mut config = None;
    let mut chunk_count = DEFAULT_CHUNK_COUNT;
    let mut json = false;
    let mut force = false;

    let mut index = 0;
    while index < args.len() {
        match args[index].as_str() {
            "-h" | "--help" => return Ok(None),
            "-v" | "--verbose" => verbose = true,
            "--log-dir" => log_dir = Some(PathBuf::from(take_value(args, &mut index, "--log-dir")?)),
            "--state-dir" => {
                state_dir = Some(PathBuf::from(take_value(args, &mut index, "--state-dir")?));
            }
            "--manifest" => {
                manifest = Some(PathBuf::from(take_value(args, &mut index, "--manifest")?));
            }
            "--keep-list" => {
                keep_list = Some(PathBuf::from(take_value(args, &mut index, "--keep-list")?));
            }
            "--config" => config = Some(PathBuf::from(take_value(args, &mut index, "--config")?)),
            "--chunk-count" => {
                let raw = take_value(args, &mut index, "--chunk-count")?;
                chunk_count = raw
                    .parse::<usize>()
                    .ok()
                    .filter(|n| *n > 0)
                    .ok_or_else(|| usage(format!("invalid --chunk-count value: {raw}")))?;
            }
            "--json" => json = true,
            "--force" => force = true,
            flag if flag.starts_with('-') => return Err(usage(format!("unknown option: {flag}"))),
            word => {
                if let Some(existing) = &subcommand {
                    return Err(usage(format!(
                        "unexpected argument '{word}' after command '{existing}'"
                    )));
                }
                subcommand = Some(word.to_owned());
            }
        }
        index += 1;
    }

    let Some(name) = subcommand else {
        return Err(usage("no command given"));
    };
    let command = match name.as_str() {
        "step" => Command::Step {
            state_dir: require(state_dir, "--state-dir", "step")?,
            manifest: require(manifest, "--manifest", "step")?,
            keep_list: require(keep_list, "--keep-list", "step")?,
            chunk_count,
        },
        "run" => Command::Run {
            config: require(config, "--config", "run")?,
        },
        "status" => Command::Status {
            state_dir: require(state_dir, "--state-dir", "status")?,
            json,
        },
        "reset" => Command::Reset {
            state_dir: require(state_dir, "--state-dir", "reset")?,
        },
        "init-config" => Command::InitConfig {
            config: require(config, "--config", "init-config")?,
            force,
        },
        other => return Err(usage(format!("unknown command: {other}"))),
    };
    Ok(Some(Cli {
        command,
        verbose,
        log_dir,
    }))
}

fn describe_outcome(outcome: &StepOutcome) -> Vec<String> {
    match outcome {
        StepOutcome::Initialized { candidates, ranges } => {
            vec![format!(
                "initialized: {candidates} candidate(s) in {ranges} chunk(s)"
            )]
        }
        StepOutcome::Testing { chunk } => vec![format!("testing chunk of {}", chunk.len())],
        StepOutcome::AwaitingVerdict { chunk } => vec![format!(
            "no verdict yet; chunk of {} isolated again",
            chunk.len()
        )],
        StepOutcome::Done { report } => {
            let mut lines = vec![format!(
                "finished: {} crashing candidate(s)",
                report.len()
            )];
            lines.extend(report.labels().map(|label| format!("  {label}")));
            lines
        }
    }
}

fn cmd_step(state_dir: &Path, manifest: &Path, keep_list: &Path, chunk_count: usize) -> Result<()> {
    let store = StateStore::open(state_dir)?;
    let mut provider = ManifestProvider::load(manifest, keep_list)?;
    let engine = BisectionEngine::new(chunk_count);
    let outcome = run_step(&store, &engine, &mut provider)?;
    for line in describe_outcome(&outcome) {
        println!("{line}");
    }
    Ok(())
}

fn cmd_run(config_path: &Path) -> Result<()> {
    let config = SupervisorConfig::load(config_path)?;
    let host = ProcessHost::new(&config.target);
    let injector = CommandInjector::new(config.input.injector_program.clone());
    let supervisor = Supervisor::new(config, host, injector, SystemClock::new())?;
    let handle = supervisor.spawn()?;

    let (tx, rx) = mpsc::channel::<String>();
    thread::Builder::new()
        .name("crashbisect-stdin".to_owned())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        })?;

    while handle.is_running() {
        match rx.recv_timeout(CONTROL_POLL) {
            Ok(line) => match line.trim() {
                "stop" => {
                    info!("stop requested from terminal");
                    handle.request_stop();
                    println!("stopping after the current cycle");
                }
                "status" => {
                    let status = handle.status();
                    println!(
                        "cycle {} phase {:?}: {}",
                        status.cycle,
                        status.phase,
                        status.progress.render_line()
                    );
                }
                "" => {}
                other => println!("unknown control command '{other}' (try: stop, status)"),
            },
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            // stdin closed; keep supervising without a control channel
            Err(mpsc::RecvTimeoutError::Disconnected) => thread::sleep(CONTROL_POLL),
        }
    }

    match handle.join()? {
        SupervisorExit::Finished { faults } => {
            println!("finished: {} crashing candidate(s)", faults.len());
            for fault in faults {
                println!("  {fault}");
            }
        }
        SupervisorExit::Stopped => println!("stopped"),
    }
    Ok(())
}

fn cmd_status(state_dir: PathBuf, json: bool) -> Result<()> {
    let store = StateStore::new(state_dir);
    let progress = store.progress();
    if json {
        println!("{}", serde_json::to_string_pretty(&progress)?);
        return Ok(());
    }
    println!("{}", progress.render_line());
    if let ProgressView::Tracking { faults, .. } = &progress {
        for fault in faults {
            println!("  {fault}");
        }
    }
    if store.fault_export_path().exists() {
        println!("report: {}", store.fault_export_path().display());
    }
    Ok(())
}

fn cmd_reset(state_dir: PathBuf) -> Result<()> {
    let store = StateStore::new(state_dir);
    if store.reset()? {
        println!("isolation record removed from {}", store.root().display());
    } else {
        println!("nothing to reset in {}", store.root().display());
    }
    Ok(())
}

fn cmd_init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        return Err(usage(format!(
            "{} already exists; pass --force to overwrite",
            path.display()
        )));
    }
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, SupervisorConfig::example().to_toml()?)?;
    println!("wrote {}", path.display());
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    let _guard = init_logging(cli.log_dir.as_deref(), cli.verbose)?;
    match cli.command {
        Command::Step {
            state_dir,
            manifest,
            keep_list,
            chunk_count,
        } => cmd_step(&state_dir, &manifest, &keep_list, chunk_count),
        Command::Run { config } => cmd_run(&config),
        Command::Status { state_dir, json } => cmd_status(state_dir, json),
        Command::Reset { state_dir } => cmd_reset(state_dir),
        Command::InitConfig { config, force } => cmd_init_config(&config, force),
    }
}

fn main() -> ExitCode {
    let args: Vec<String> = env::args().skip(1).collect();
    let cli = match parse_args(&args) {
        Ok(Some(cli)) => cli,
        Ok(None) => {
            print_help();
            return ExitCode::SUCCESS;
        }
        Err(error) => {
            eprintln!("crashbisect: {error}");
            eprintln!("run `crashbisect --help` for usage");
            return ExitCode::from(2);
        }
    };
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("crashbisect: {error}");
            if let Some(hint) = error.suggestion() {
                eprintln!("hint: {hint}");
            }
            ExitCode::from(u8::try_from(error.exit_code()).unwrap_or(1))
        }
    }
}
