//! kmsdm - DRM display manager daemon
//!
//! Discovers the display GPU, tracks monitor hotplug and logs every change
//! until SIGINT/SIGTERM.

use anyhow::{Context, Result};
use log::info;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kmsdm::{Config, DisplayHandle, DisplayManager};

/// Set from the signal handler (SIGTERM/SIGINT)
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

fn setup_signal_handlers() {
    unsafe {
        libc::signal(
            libc::SIGTERM,
            shutdown_signal_handler as *const () as libc::sighandler_t,
        );
        libc::signal(
            libc::SIGINT,
            shutdown_signal_handler as *const () as libc::sighandler_t,
        );
    }
}

extern "C" fn shutdown_signal_handler(_signo: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::Relaxed);
}

/// Print help message
fn print_help() {
    println!(
        r#"kmsdm {} - DRM display manager

USAGE:
    kmsdm [OPTIONS]

OPTIONS:
    -h, --help              Print this help message
    -V, --version           Print version information
    -l, --list              Print the displays and exit

CONFIG FILE:
    $KMSDM_CONFIG, ~/.config/kmsdm/config.toml or /etc/kmsdm/config.toml

Set RUST_LOG=info (or debug) for more output.
"#,
        env!("CARGO_PKG_VERSION")
    );
}

fn describe(display: &DisplayHandle) -> String {
    match &display.mode {
        Some(mode) if display.connected => format!(
            "display {} (crtc {}): connector {} {}x{}@{}",
            display.pipe,
            display.crtc_id,
            display.connector_id,
            mode.hdisplay,
            mode.vdisplay,
            mode.vrefresh
        ),
        _ => format!(
            "display {} (crtc {}): disconnected",
            display.pipe, display.crtc_id
        ),
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args: Vec<String> = std::env::args().collect();

    // --help
    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_help();
        return Ok(());
    }

    // --version
    if args.iter().any(|a| a == "--version" || a == "-V") {
        println!("kmsdm {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let list_only = args.iter().any(|a| a == "--list" || a == "-l");

    let config = Config::load();
    let manager = DisplayManager::discover(config).context("Display discovery failed")?;
    manager.initialize_display_resources();

    if list_only {
        manager.update_display_state()?;
        for display in manager.displays() {
            println!("{}", describe(&display));
        }
        println!(
            "{} connected output(s), master: {}",
            manager.connected_display_count(),
            manager.is_master()
        );
        return Ok(());
    }

    setup_signal_handlers();

    manager.register_hotplug_callback(Arc::new(|displays: &[DisplayHandle]| {
        info!("{} display(s) connected", displays.len());
        for display in displays {
            info!("  {}", describe(display));
        }
    }));
    manager.set_master(false);
    manager.start_hotplug_monitor();

    while !SHUTDOWN_REQUESTED.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));
    }

    info!("Shutting down");
    manager.drop_master();
    Ok(())
}
