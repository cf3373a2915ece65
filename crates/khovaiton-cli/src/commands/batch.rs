use std::collections::BTreeMap;
use std::path::Path;

use crate::commands::common::{collect_codes, format_resolution_lines, Service};
use crate::error::CliError;

pub async fn run_batch(
    service: &Service,
    codes: &[String],
    file: Option<&Path>,
    as_json: bool,
) -> Result<(), CliError> {
    let codes = collect_codes(codes, file)?;
    let results = service.get_image_urls_batch(&codes).await;

    if as_json {
        let sorted = results.iter().collect::<BTreeMap<_, _>>();
        println!("{}", serde_json::to_string_pretty(&sorted)?);
        return Ok(());
    }

    for line in format_resolution_lines(&codes, &results) {
        println!("{line}");
    }
    Ok(())
}
