// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host process playing the role of the system supervisor: brings up a
//! [`rt_runtime::System`], wires an [`rt_loader::AppManager`] to it as the
//! app restart hook (spec.md §4.M.5), loads any app images named on the
//! command line from an in-memory flash partition, starts them, and then
//! blocks until interrupted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use rt_hostsim::{HeapAllocator, LoggingCacheMaintenance, MemoryFlash, ThreadSpawner, WallClock};
use rt_loader::{AppManager, ElfLoader, GenericArch, HostSymbolTable};
use rt_runtime::{SystemConfig, System};

#[derive(Debug, Parser)]
#[clap(about = "Runtime supervisor: brings up the system and loads apps")]
struct Args {
    /// Path to a TOML configuration file (defaults left in place if absent).
    #[clap(short, long)]
    config: Option<PathBuf>,
    /// Paths to ELF app images to load and start at bring-up.
    #[clap(short, long)]
    app: Vec<PathBuf>,
    /// Maximum number of concurrently loaded apps.
    #[clap(long, default_value_t = 8)]
    max_apps: usize,
}

fn load_config(path: Option<&PathBuf>) -> Result<SystemConfig> {
    match path {
        None => Ok(SystemConfig::default()),
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            SystemConfig::from_toml_str(&text).with_context(|| "parsing system config")
        }
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = load_config(args.config.as_ref())?;
    let timebase = Arc::new(WallClock::new());
    let spawner = Arc::new(ThreadSpawner);
    let (system, token) = System::new(config, timebase, spawner);

    let manager = AppManager::new(system.clone(), args.max_apps, 4);
    system
        .set_restart_hook(token, manager.clone())
        .context("installing app manager as restart hook")?;

    system.start(token).context("starting dispatcher and watchdog")?;

    let flash = MemoryFlash::new();
    let symbols = HostSymbolTable::default();
    let arch = GenericArch;
    let code_alloc = HeapAllocator;
    let data_alloc = HeapAllocator;
    let cache = LoggingCacheMaintenance;
    let loader = ElfLoader {
        arch: &arch,
        code_alloc: &code_alloc,
        data_alloc: &data_alloc,
        symbols: &symbols,
        cache: &cache,
    };

    for path in &args.app {
        let label = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("app")
            .to_string();
        let bytes = std::fs::read(path).with_context(|| format!("reading app image {}", path.display()))?;
        flash.install(&label, bytes);

        let slot = manager
            .load_from_storage(&flash, &label, &loader)
            .with_context(|| format!("loading app image {}", path.display()))?;
        manager.start(slot).with_context(|| format!("starting app {label}"))?;
        log::info!("started app {label} in slot {}", slot.index());
    }

    log::info!("supervisor running with {} app(s)", args.app.len());
    loop {
        std::thread::sleep(Duration::from_millis(500));
        if let Some(reason) = system.safe_mode() {
            log::error!("system entered safe mode: {reason:?}");
            break;
        }
    }

    Ok(())
}
