use serde_json::json;

use crate::commands::common::{format_status_lines, Service};
use crate::error::CliError;

pub fn run_status(service: &Service, as_json: bool) -> Result<(), CliError> {
    let status = service.sync_status();
    let stats = service.cache_stats();

    if as_json {
        let body = json!({ "sync": status, "cache": stats });
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }

    for line in format_status_lines(&status, &stats) {
        println!("{line}");
    }
    Ok(())
}
