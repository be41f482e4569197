//! arbord command-line front end.
//!
//! `arbord daemon` runs the supervisor+engine pair in the foreground;
//! the other subcommands manage a running daemon through its pidfile.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use nix::sys::signal::Signal;

use arbord::config::DaemonConfig;
use arbord::daemon::supervisor::{self, DaemonOptions};
use arbord::util::proc::{is_alive, kill_one, PidFile};

#[derive(Parser)]
#[command(name = "arbord", version = arbord::VERSION, about = "Linux container management daemon")]
struct Cli {
    /// Log to stderr instead of the log file.
    #[arg(long, global = true)]
    stdlog: bool,

    /// Verbose logging.
    #[arg(long, global = true)]
    verbose: bool,

    /// Debug logging (implies --verbose).
    #[arg(long, global = true)]
    debug: bool,

    /// Do not respawn the engine after a crash.
    #[arg(long, global = true)]
    norespawn: bool,

    /// Discard persistent state on shutdown.
    #[arg(long, global = true)]
    discard: bool,

    /// Configuration file.
    #[arg(long, default_value = arbord::config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Report whether the daemon is running.
    Status,
    /// Run the daemon in the foreground (default).
    Daemon,
    /// Start the daemon in the background.
    Start,
    /// Stop a running daemon.
    Stop,
    /// Stop, then start.
    Restart,
    /// Ask the daemon to reload (SIGHUP re-exec).
    Reload,
    /// Alias of reload: replace the engine binary in place.
    Upgrade,
    /// Ask the daemon to dump diagnostics to its log.
    Dump,
    /// Core-dump forwarding hook (handled by a separate helper).
    Core,
    /// Print the version.
    Version,
}

fn init_logging(cli: &Cli, config: &DaemonConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::EnvFilter;

    let default_level = if cli.debug {
        "debug"
    } else if cli.verbose {
        "info"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("arbord={}", default_level)));

    if cli.stdlog {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
        None
    } else {
        let dir = config
            .log_path
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/var/log"));
        let file = config
            .log_path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "arbord.log".to_string());
        let appender = tracing_appender::rolling::never(dir, file);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(false)
            .init();
        Some(guard)
    }
}

fn daemon_pid(config: &DaemonConfig) -> anyhow::Result<Option<u32>> {
    PidFile::new(&config.pidfile)
        .load()
        .map_err(|e| anyhow::anyhow!("{}", e))
}

fn stop_daemon(config: &DaemonConfig) -> anyhow::Result<()> {
    let Some(pid) = daemon_pid(config)? else {
        bail!("arbord is not running");
    };
    kill_one(pid, Signal::SIGTERM).map_err(|e| anyhow::anyhow!("{}", e))?;
    let deadline = Instant::now() + Duration::from_secs(30);
    while is_alive(pid) {
        if Instant::now() >= deadline {
            eprintln!("arbord ({}) ignored SIGTERM, sending SIGKILL", pid);
            let _ = kill_one(pid, Signal::SIGKILL);
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    Ok(())
}

fn start_background(config: &DaemonConfig) -> anyhow::Result<()> {
    if daemon_pid(config)?.is_some() {
        bail!("arbord is already running");
    }
    let exe = std::env::current_exe().context("locating arbord binary")?;
    std::process::Command::new(exe)
        .arg("daemon")
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn()
        .context("spawning arbord daemon")?;
    Ok(())
}

fn signal_daemon(config: &DaemonConfig, sig: Signal) -> anyhow::Result<()> {
    let Some(pid) = daemon_pid(config)? else {
        bail!("arbord is not running");
    };
    kill_one(pid, sig).map_err(|e| anyhow::anyhow!("{}", e))?;
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    let config = match DaemonConfig::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("arbord: {}", e);
            std::process::exit(1);
        }
    };

    let command = cli.command.as_ref().unwrap_or(&Command::Daemon);
    let result: anyhow::Result<i32> = match command {
        Command::Daemon => {
            let _guard = init_logging(&cli, &config);
            if std::env::var_os("ARBORD_REEXEC").is_some() {
                // SIGHUP self-exec lands here: we already are the
                // engine, with the fixed fds waiting.
                supervisor::engine_reentry(config).map_err(|e| anyhow::anyhow!("{}", e))
            } else {
                let options = DaemonOptions {
                    norespawn: cli.norespawn,
                    discard: cli.discard,
                };
                supervisor::run(config, options).map_err(|e| anyhow::anyhow!("{}", e))
            }
        }
        Command::Status => match daemon_pid(&config) {
            Ok(Some(pid)) => {
                println!("arbord is running, pid {}", pid);
                Ok(0)
            }
            Ok(None) => {
                println!("arbord is not running");
                Ok(3)
            }
            Err(e) => Err(e),
        },
        Command::Start => start_background(&config).map(|_| 0),
        Command::Stop => stop_daemon(&config).map(|_| 0),
        Command::Restart => stop_daemon(&config)
            .and_then(|_| start_background(&config))
            .map(|_| 0),
        Command::Reload | Command::Upgrade => signal_daemon(&config, Signal::SIGHUP).map(|_| 0),
        Command::Dump => signal_daemon(&config, Signal::SIGUSR2).map(|_| 0),
        Command::Core => Err(anyhow::anyhow!(
            "core forwarding is handled by the arbord-core helper"
        )),
        Command::Version => {
            println!("arbord {}", arbord::VERSION);
            Ok(0)
        }
    };

    match result {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("arbord: {:#}", e);
            std::process::exit(1);
        }
    }
}
