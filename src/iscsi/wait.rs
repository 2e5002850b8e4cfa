//! Bounded wait for a device node to appear

use crate::domain::ports::DeviceFs;
use crate::iscsi::session::DEFAULT_TRANSPORT;
use std::io;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

/// Poll until `device_path` exists, at most `max_retries` times
///
/// For tcp the exact path is checked. Other transports treat `device_path`
/// as a glob and, on a hit, replace it with the first match. Sleeps
/// `poll_interval` between attempts but never after the last one. Any error
/// other than not-found ends the wait.
pub async fn wait_for_path_to_exist(
    fs: &dyn DeviceFs,
    device_path: &mut String,
    max_retries: u32,
    transport: &str,
    poll_interval: Duration,
) -> bool {
    for attempt in 1..=max_retries {
        let lookup = if transport == DEFAULT_TRANSPORT {
            fs.stat(Path::new(device_path.as_str()))
        } else {
            match fs.glob(device_path) {
                Ok(matches) => match matches.first() {
                    Some(found) => {
                        *device_path = found.to_string_lossy().to_string();
                        Ok(())
                    }
                    None => Err(io::ErrorKind::NotFound.into()),
                },
                Err(e) => {
                    debug!("Bad device pattern {}: {}", device_path, e);
                    Err(io::ErrorKind::NotFound.into())
                }
            }
        };

        match lookup {
            Ok(()) => {
                debug!("{} present after {} attempt(s)", device_path, attempt);
                return true;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!("Giving up on {}: {}", device_path, e);
                return false;
            }
        }

        if attempt < max_retries {
            tokio::time::sleep(poll_interval).await;
        }
    }

    false
}
