use khovaiton_core::FabricCode;

use crate::commands::common::Service;
use crate::error::CliError;

pub async fn run_resolve(service: &Service, code: &str, as_json: bool) -> Result<(), CliError> {
    let code = FabricCode::new(code)?;
    let record = service.resolver().resolve_record(&code).await;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&record)?);
        return Ok(());
    }

    match record {
        Some(record) => println!("{}", record.url),
        None => println!("No image for {code}"),
    }
    Ok(())
}
