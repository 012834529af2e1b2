use std::time::Duration;

/// Call `connect` until it succeeds, sleeping `poll_interval` between
/// attempts. Never gives up.
pub fn wait_for_resource<F, T, E>(mut connect: F, poll_interval: Duration, resource_name: &str) -> T
where
    F: FnMut() -> Result<T, E>,
    E: std::fmt::Display,
{
    let mut attempts: u64 = 0;
    loop {
        attempts += 1;
        match connect() {
            Ok(resource) => {
                tracing::info!(attempts, "{} connected", resource_name);
                return resource;
            }
            Err(e) => {
                if attempts == 1 {
                    tracing::warn!("Waiting for {} ({})", resource_name, e);
                } else {
                    tracing::debug!(attempts, "Waiting for {} ({})", resource_name, e);
                }
                std::thread::sleep(poll_interval);
            }
        }
    }
}
