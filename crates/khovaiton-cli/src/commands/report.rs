use std::path::Path;

use crate::commands::common::{collect_codes, Service};
use crate::error::CliError;

pub async fn run_report(
    service: &Service,
    codes: &[String],
    file: Option<&Path>,
    as_json: bool,
) -> Result<(), CliError> {
    let codes = collect_codes(codes, file)?;
    let report = service.image_status_report(&codes).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!(
        "{} of {} fabrics have images ({} missing)",
        report.with_images, report.total, report.without_images
    );
    for code in &report.missing {
        println!("  {code}");
    }
    Ok(())
}
