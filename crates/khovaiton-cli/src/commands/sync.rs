use crate::commands::common::Service;
use crate::error::CliError;

pub async fn run_sync(service: &Service) -> Result<(), CliError> {
    if !service.resolver().mapping().is_enabled() {
        return Err(CliError::SyncNotConfigured);
    }

    let report = service.sync_now().await?;
    println!(
        "Sync completed: {} pushed, {} merged",
        report.local_to_cloud, report.cloud_to_local
    );
    Ok(())
}

pub async fn run_sync_watch(service: &Service) -> Result<(), CliError> {
    if !service.resolver().mapping().is_enabled() {
        return Err(CliError::SyncNotConfigured);
    }

    service.start_auto_sync();
    println!(
        "Syncing every {}s; press Ctrl-C to stop",
        service.sync_status().interval_secs
    );
    tokio::signal::ctrl_c().await?;
    service.stop_auto_sync();
    service.settle().await;

    let status = service.sync_status();
    println!("Stopped after {} passes ({} failed)", status.runs, status.failures);
    Ok(())
}
