use std::sync::Arc;

mod config;
mod tasks;

use config::{Config, ConfigError};
use tasks::{Services, Storage};

#[derive(Debug, thiserror::Error)]
enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Core(#[from] anonballot::Error),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    if let Err(e) = run().await {
        tracing::error!("{}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), StartupError> {
    let config = Config::from_env()?;
    tracing::info!(
        "starting with {:?} custody, elections keyed {:?} with {}-bit primes, merkle batches of {}",
        config.custody,
        config.key_mode(),
        config.tally.prime_bits,
        config.record.batch_size
    );

    // Stand-alone, the daemon keeps its own stores in memory. Embedded next to
    // a voting front end it is given that front end's stores instead.
    let storage = Storage::in_memory();
    let services = Arc::new(Services::new(&config, &storage)?);

    let mut interval = tokio::time::interval(config.sweep_interval);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let services = services.clone();
                let pass = tokio::task::spawn_blocking(move || tasks::run_tasks(&services));
                if let Err(e) = pass.await {
                    tracing::error!("scheduled tasks panicked: {}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                return Ok(());
            }
        }
    }
}
