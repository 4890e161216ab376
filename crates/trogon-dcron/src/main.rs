mod signal;

use tracing::{error, info};
use trogon_dcron::env::SystemEnv;
use trogon_dcron::{
    CronComponent, CronConfig, CronError, LockClient, NatsKvLock, PublishJob, ServiceConfig,
};

use crate::signal::shutdown_signal;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let service = ServiceConfig::from_env(&SystemEnv);
    let config = CronConfig::from_env(&SystemEnv);

    info!(nats_url = %service.nats_url, "Connecting to NATS");
    let nats = async_nats::connect(&service.nats_url)
        .await
        .unwrap_or_else(|e| {
            error!(error = %e, "Failed to connect to NATS");
            std::process::exit(1);
        });

    let result = if config.distributed_task {
        let js = async_nats::jetstream::new(nats.clone());
        let lock = NatsKvLock::new(&js, config.lock_ttl)
            .await
            .unwrap_or_else(|e| {
                error!(error = %e, "Failed to open the lock bucket");
                std::process::exit(1);
            });
        serve(
            CronComponent::with_locker(service.name.clone(), config, lock),
            &service,
            nats,
        )
        .await
    } else {
        match CronComponent::new(service.name.clone(), config) {
            Ok(cron) => serve(cron, &service, nats).await,
            Err(e) => Err(e),
        }
    };

    if let Err(e) = result {
        error!(error = %e, "Cron component exited with error");
        std::process::exit(1);
    }
}

async fn serve<L: LockClient>(
    cron: CronComponent<L>,
    service: &ServiceConfig,
    nats: async_nats::Client,
) -> Result<(), CronError> {
    cron.add_job(&service.spec, PublishJob::new(service.subject.clone(), nats))?;

    info!(
        component = %cron.name(),
        spec = %service.spec,
        subject = %service.subject,
        "Starting cron component"
    );
    cron.start();

    let signal = shutdown_signal().await;
    info!(signal, "Shutting down");

    let running = cron.stop().await?;
    running.wait().await;
    Ok(())
}
