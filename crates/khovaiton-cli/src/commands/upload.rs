use std::path::Path;

use crate::commands::common::{upload_content_type, Service};
use crate::error::CliError;

pub async fn run_upload(
    service: &Service,
    code: &str,
    path: &Path,
    name: Option<&str>,
) -> Result<(), CliError> {
    let content_type = upload_content_type(path)?;
    let bytes = tokio::fs::read(path).await?;
    let file_name = name
        .map(ToString::to_string)
        .or_else(|| path.file_name().map(|name| name.to_string_lossy().into_owned()));
    tracing::debug!(content_type, bytes = bytes.len(), "Uploading image file");

    let record = service
        .record_upload(code, &bytes, file_name.as_deref())
        .await?;
    // Let the background mapping push finish before the process exits.
    service.settle().await;

    println!("{}", record.url);
    if let Some(object_id) = &record.object_id {
        println!("Object id: {object_id}");
    }
    Ok(())
}
