use crate::commands::common::Service;

pub fn run_clear_cache(service: &Service) {
    service.clear_cache();
    println!("Local image caches cleared");
}
