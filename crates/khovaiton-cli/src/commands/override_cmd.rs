use crate::commands::common::Service;
use crate::error::CliError;

pub async fn run_override(service: &Service, code: &str, url: &str) -> Result<(), CliError> {
    let record = service.record_manual_override(code, url)?;
    service.settle().await;
    println!("{} -> {}", record.fabric_code, record.url);
    Ok(())
}
