pub mod batch;
pub mod clear_cache;
pub mod common;
pub mod completions;
pub mod override_cmd;
pub mod report;
pub mod resolve;
pub mod status;
pub mod sync;
pub mod upload;
