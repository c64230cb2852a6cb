//! `taskgate` – command line front end for the taskgate kernel.
//!
//! 1. Loads `~/.taskgate/config.toml`, writing the defaults on first run.
//! 2. Opens the SQLite store and registers the built-in workers.
//! 3. Without arguments, drops into an **interactive REPL**; with `serve`,
//!    runs a headless dispatcher pool until **Ctrl-C**.

mod config;
mod pool;
mod repl;
mod telemetry;
mod workers;

use colored::Colorize;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{error, info, warn};

use taskgate_kernel::Kernel;
use taskgate_store::Database;

use crate::pool::DispatcherPool;

enum Mode {
    Repl,
    Serve,
}

fn main() {
    let mode = match std::env::args().nth(1).as_deref() {
        None => Mode::Repl,
        Some("serve") => Mode::Serve,
        Some("help" | "-h" | "--help") => {
            print_usage();
            return;
        }
        Some(other) => {
            eprintln!("{} '{}'", "Unknown argument".red(), other);
            print_usage();
            std::process::exit(2);
        }
    };

    let _telemetry = telemetry::init_tracing("taskgate");

    if matches!(mode, Mode::Repl) {
        print_banner();
    }

    let cfg = load_or_init_config();
    let kernel = match open_kernel(&cfg) {
        Ok(kernel) => Arc::new(kernel),
        Err(e) => {
            error!(error = %e, database = %cfg.database_path, "cannot open task store");
            eprintln!("{}: {}", "Cannot open task store".red(), e);
            std::process::exit(1);
        }
    };

    // ── Shared shutdown flag ──────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    let interactive = matches!(mode, Mode::Repl);

    // A second Ctrl-C exits at once; the reaper recovers any claim it cuts off.
    if let Err(e) = ctrlc::set_handler(move || {
        if shutdown_clone.swap(true, Ordering::SeqCst) {
            std::process::exit(130);
        }
        println!();
        println!("{}", "⚠  Ctrl-C received – stopping dispatchers …".yellow().bold());
        if interactive {
            println!("  Press Enter to exit, or Ctrl-C again to exit now.");
        }
    }) {
        warn!(
            error = %e,
            "Failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available"
        );
    }

    match mode {
        Mode::Repl => {
            println!("  Type {} for a list of commands.\n", "/help".bold().cyan());
            repl::run(kernel, cfg, shutdown);
        }
        Mode::Serve => serve(kernel, &cfg, &shutdown),
    }
}

fn serve(kernel: Arc<Kernel>, cfg: &config::Config, shutdown: &AtomicBool) {
    let settings = cfg.pool_settings();
    let pool = match DispatcherPool::start(kernel, settings) {
        Ok(pool) => pool,
        Err(e) => {
            error!(error = %e, "failed to start dispatcher pool");
            std::process::exit(1);
        }
    };
    info!(
        dispatchers = settings.dispatchers,
        database = %cfg.database_path,
        "taskgate serving"
    );

    while !shutdown.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(200));
    }
    let resolved = pool.stop();
    info!(resolved, "taskgate stopped");
}

fn load_or_init_config() -> config::Config {
    match config::load() {
        Ok(Some(cfg)) => {
            info!(path = %config::config_path().display(), "config loaded");
            cfg
        }
        Ok(None) => {
            let mut cfg = config::Config::default();
            match config::save(&cfg) {
                Ok(()) => println!(
                    "  {} Default config written to {}",
                    "✓".green().bold(),
                    config::config_path().display().to_string().bold()
                ),
                Err(e) => println!("{}: {}", "Error saving config".red(), e),
            }
            config::apply_env_overrides(&mut cfg);
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    }
}

fn open_kernel(cfg: &config::Config) -> Result<Kernel, String> {
    let path = Path::new(&cfg.database_path);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create {}: {}", parent.display(), e))?;
    }
    let db = Database::open(path).map_err(|e| e.to_string())?;
    let registry = workers::build_registry();
    info!(
        workers = ?registry.task_types(),
        database = %path.display(),
        "task store opened"
    );
    let kernel = Kernel::new(Arc::new(db), Arc::new(registry), cfg.retry_policy())
        .with_heartbeat_interval(cfg.heartbeat_interval());
    Ok(kernel)
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"  __            __                 __     "#.bold().cyan());
    println!("{}", r#" / /____ ____ / /__ ___ ____ _ __ / /____ "#.bold().cyan());
    println!("{}", r#"/ __/ _ `(_-</  '_// _ `/ _ `/ _ `/ __/ -_)"#.bold().cyan());
    println!("{}", r#"\__/\_,_/___/_/\_\ \_, /\_,_/\_,_/\__/\__/ "#.bold().cyan());
    println!("{}", r#"                  /___/                   "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "taskgate".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Policy-gated task execution with a verifiable audit trail");
    println!();
}

fn print_usage() {
    println!("Usage: taskgate [serve]");
    println!();
    println!("  (no argument)  interactive shell");
    println!("  serve          run the dispatcher pool until Ctrl-C");
    println!();
    println!("Config: ~/.taskgate/config.toml (override with TASKGATE_CONFIG)");
}
