//! `fatbuildrd` — composition root.
//!
//! Loads configuration, loads every instance definition, and starts one
//! worker thread per instance plus the idle-shutdown timer, mirroring the
//! way `buildsys`'s own daemon-shaped tools (`tools/pipesys/src/main.rs`)
//! are a thin driver wired on top of a library crate. The HTTP/IPC front
//! end that actually feeds tasks into each instance's queue is out of
//! scope (`spec.md` §1) — this binary wires the engine together, runs
//! startup crash recovery, and keeps every worker alive until the idle
//! timer trips or a shutdown signal arrives.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fatbuildrd::cleanup::CleanupRegistry;
use fatbuildrd::config::Config;
use fatbuildrd::instances::{Instances, RunningInstance};
use fatbuildrd::log::init_logger;
use fatbuildrd::tasks::{worker_loop, Task};
use fatbuildrd::timer::ServerTimer;

const DEFAULT_CONFIG_PATH: &str = "/etc/fatbuildr/fatbuildr.toml";
const IDLE_SHUTDOWN: Duration = Duration::from_secs(300);

struct Args {
    config: PathBuf,
    foreground: bool,
    debug: bool,
}

impl Args {
    fn parse() -> Self {
        let mut config = PathBuf::from(DEFAULT_CONFIG_PATH);
        let mut foreground = false;
        let mut debug = false;
        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    config = PathBuf::from(args.next().unwrap_or_else(|| {
                        eprintln!("--config requires a path argument");
                        std::process::exit(2);
                    }));
                }
                "-f" | "--foreground" => foreground = true,
                "-d" | "--debug" => debug = true,
                "-h" | "--help" => {
                    print_usage();
                    std::process::exit(0);
                }
                other => {
                    eprintln!("unrecognized argument: {other}");
                    print_usage();
                    std::process::exit(2);
                }
            }
        }
        Args { config, foreground, debug }
    }
}

fn print_usage() {
    eprintln!("usage: fatbuildrd [-c|--config <path>] [-f|--foreground] [-d|--debug]");
}

static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_shutdown_signal(_signum: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

/// Installs bare `SIGTERM`/`SIGINT` handlers that only flip an atomic flag,
/// the minimum needed for the cooperative shutdown sequence in `spec.md`
/// §5: stop accepting new work, let the current task finish, then exit.
fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGTERM, handle_shutdown_signal as libc::sighandler_t);
        libc::signal(libc::SIGINT, handle_shutdown_signal as libc::sighandler_t);
    }
}

fn main() {
    let args = Args::parse();
    init_logger(
        if args.debug { Some(log::LevelFilter::Debug) } else { None },
        args.debug,
    );

    if !args.foreground {
        log::info!("fatbuildrd has no double-fork daemonization path; running in the foreground regardless of -f");
    }

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("unable to load configuration from {:?}: {err}", args.config);
            std::process::exit(1);
        }
    };

    install_signal_handlers();
    let cleanup = CleanupRegistry::new();

    let instances = match Instances::load(&config) {
        Ok(instances) => instances,
        Err(err) => {
            log::error!("unable to load instances: {err}");
            std::process::exit(1);
        }
    };

    let timer = Arc::new(ServerTimer::new(IDLE_SHUTDOWN));
    let stopping = Arc::new(AtomicBool::new(false));

    let mut workers = Vec::new();
    for (id, instance) in instances.into_iter() {
        let running = match RunningInstance::new(&config, instance) {
            Ok(running) => Arc::new(running),
            Err(err) => {
                log::error!("unable to wire instance {id}: {err}");
                continue;
            }
        };

        log::info!("starting worker thread for instance {id}");
        let worker_config = config.clone();
        let worker_timer = timer.clone();
        let worker_stopping = stopping.clone();
        let worker_instance = running.clone();
        let pending: Arc<Mutex<HashMap<String, Task>>> = Arc::new(Mutex::new(HashMap::new()));

        let handle = match std::thread::Builder::new()
            .name(format!("worker-{id}"))
            .spawn(move || {
                worker_loop(
                    &worker_config,
                    worker_instance.as_ref(),
                    &worker_timer,
                    worker_stopping.as_ref(),
                    pending.as_ref(),
                );
            }) {
            Ok(handle) => handle,
            Err(err) => {
                log::error!("unable to spawn worker thread for instance {id}: {err}");
                continue;
            }
        };

        workers.push((id, handle, running));
    }

    if workers.is_empty() {
        log::warn!("no instance could be started, exiting");
        cleanup.clean();
        std::process::exit(1);
    }

    log::info!("fatbuildrd running with {} instance(s), idle shutdown after {:?}", workers.len(), IDLE_SHUTDOWN);

    loop {
        if SHUTDOWN_REQUESTED.load(Ordering::SeqCst) {
            log::info!("shutdown requested, waiting for any running task to finish");
            break;
        }
        if timer.over() {
            log::info!("idle timeout reached, shutting down");
            break;
        }
        timer.wait(Duration::from_secs(1));
    }

    stopping.store(true, Ordering::SeqCst);
    for (id, handle, running) in workers {
        running.queue.stop();
        if handle.join().is_err() {
            log::warn!("worker thread for instance {id} panicked");
        }
    }

    cleanup.clean();
    log::info!("fatbuildrd shut down cleanly");
}
