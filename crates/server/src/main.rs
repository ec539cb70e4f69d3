#![forbid(unsafe_code)]

use clap::Parser;
use dkcm_runner::{ProcessExecutor, RegionalRetryDriver, resolve_program};
use dkcm_server::{
    LeaseAllocator, RetryDriverProvisioner, ServerConfig, ServerConfigError, serve,
};
use dkcm_storage::SqliteStore;
use signal_hook::consts::TERM_SIGNALS;
use std::io::Write;
use std::net::TcpListener;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ServerConfig::parse();
    let pool = config.resource_pool()?;
    let base = config.base_cluster_config()?;
    let program = resolve_program(&config.provision_bin)
        .ok_or_else(|| ServerConfigError::ProgramNotFound(config.provision_bin.clone()))?;

    let store = SqliteStore::open(&config.storage_dir)?;
    info!(storage_dir = %store.storage_dir().display(), "lease store opened");
    let store = Arc::new(Mutex::new(store));

    let executor = ProcessExecutor {
        term_grace: Duration::from_secs(config.term_grace_s),
        ..ProcessExecutor::default()
    };
    let driver = RegionalRetryDriver::new(program.to_string_lossy().into_owned(), Arc::new(executor));
    info!(program = driver.program(), "provisioning program resolved");
    let provisioner = RetryDriverProvisioner::new(driver, base, config.work_root())
        .with_version_command(config.version_command());
    let allocator = LeaseAllocator::new(
        store,
        pool,
        Arc::new(provisioner),
        config.allocator_config(),
    );

    let recovered = allocator.recover_interrupted()?;
    if recovered > 0 {
        info!(recovered, "failed leases interrupted by the previous run");
    }

    // A second signal while draining exits immediately.
    let stop = Arc::new(AtomicBool::new(false));
    for &signal in TERM_SIGNALS {
        signal_hook::flag::register_conditional_shutdown(signal, 1, Arc::clone(&stop))?;
        signal_hook::flag::register(signal, Arc::clone(&stop))?;
    }

    let listener = TcpListener::bind((config.bind.as_str(), config.port))?;
    let addr = listener.local_addr()?;
    info!(%addr, "serving");
    {
        let mut stdout = std::io::stdout();
        writeln!(stdout, "listening on {addr}")?;
        stdout.flush()?;
    }

    serve(
        listener,
        allocator.clone(),
        config.request_defaults(),
        stop,
    )?;
    info!("stopped accepting requests");
    allocator.shutdown();
    allocator.wait_idle();
    info!("in-flight leases settled");
    Ok(())
}
