use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use kbdd::daemon::{hotplug_reactor, passthrough_reactor, KbdDaemon};
use kbdd::emitter::VirtualOut;
use kbdd::fswatch::FsWatcher;
use kbdd::passthrough::PassthroughSet;
use kbdd::registry::DeviceRegistry;
use kbdd::shutdown::Shutdown;
use kbdd::socket::FrameSocket;
use kbdd::{config, error::ReloadError};

/// Keyboard daemon: grabs the named keyboards and relays passthrough keys
/// to the macro daemon.
#[derive(Parser)]
#[command(name = "kbdd")]
#[command(author, version, about = "Keyboard-grab daemon for the hotkey/macro system")]
struct Cli {
    /// Input device identities: a /dev/input/eventN path, a device name, or
    /// a vendor:product:name fingerprint
    #[arg(required = true, value_name = "DEVICE")]
    devices: Vec<String>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("kbdd=info")),
        )
        .init();

    let cli = Cli::parse();

    let shutdown = Arc::new(Shutdown::new().context("shutdown pipe")?);
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || shutdown.trigger()).context("signal handler")?;
    }

    let registry = Arc::new(DeviceRegistry::new());
    registry
        .populate(&cli.devices)
        .context("opening input devices")?;
    if registry.available_count() == 0 {
        anyhow::bail!("no device could be grabbed");
    }

    let out = VirtualOut::new().context("creating virtual keyboard")?;
    let socket = FrameSocket::bind(Path::new(config::SOCKET_PATH))
        .with_context(|| format!("binding {}", config::SOCKET_PATH))?;

    // Initial passthrough population, then hot-reload via the reactor.
    let passthrough = Arc::new(PassthroughSet::new());
    let keys_watcher = Arc::new(FsWatcher::new().context("keys watcher")?);
    let existing = keys_watcher
        .add_dir(Path::new(config::KEYS_DIR))
        .with_context(|| format!("watching {}", config::KEYS_DIR))?;
    for ev in &existing {
        match passthrough.load(&keys_watcher, &ev.path) {
            Ok(_) => {}
            Err(e @ ReloadError::Perm { .. }) => warn!("{e}"),
            Err(e) => warn!("skipping {}: {e}", ev.path.display()),
        }
    }
    info!(
        "passthrough set: {} code(s) from {}",
        passthrough.len(),
        config::KEYS_DIR
    );

    let input_watcher = Arc::new(FsWatcher::new().context("input watcher")?);
    input_watcher
        .add_dir(Path::new(config::INPUT_DIR))
        .with_context(|| format!("watching {}", config::INPUT_DIR))?;

    let keys_thread = {
        let watcher = Arc::clone(&keys_watcher);
        let set = Arc::clone(&passthrough);
        let shutdown = Arc::clone(&shutdown);
        std::thread::Builder::new()
            .name("kbdd-keys-watch".into())
            .spawn(move || passthrough_reactor(watcher, set, shutdown))
            .context("spawning keys reactor")?
    };
    let hotplug_thread = {
        let watcher = Arc::clone(&input_watcher);
        let registry = Arc::clone(&registry);
        let shutdown = Arc::clone(&shutdown);
        std::thread::Builder::new()
            .name("kbdd-hotplug-watch".into())
            .spawn(move || hotplug_reactor(watcher, registry, Path::new(config::INPUT_DIR), shutdown))
            .context("spawning hotplug reactor")?
    };

    let mut daemon = KbdDaemon::new(
        Arc::clone(&registry),
        Arc::clone(&passthrough),
        socket,
        out,
        Arc::clone(&shutdown),
    );
    let result = daemon.run();

    shutdown.trigger();
    let _ = keys_thread.join();
    let _ = hotplug_thread.join();

    match result {
        Ok(()) => {
            info!("shut down");
            Ok(())
        }
        Err(e) => Err(e).context("pipeline failed"),
    }
}
