//! Stage-wide accelerator leasing.
//!
//! Epistemic foundation:
//! - K_i: free = all − busy; the lowest free device id is chosen
//! - K_i: One lease per stage run, never re-evaluated per item
//! - I^B: No locking and no liveness tracking; process exit ends the lease
//!
//! Coarse and non-fair: a device freed mid-run is not noticed, and two
//! concurrent stage runs may pick the same device if neither has started
//! its compute process yet.

use super::query::{Accelerator, DeviceQuery};
use crate::models::{Result, TiltflowError};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use tracing::{info, warn};

/// Binding of a stage run to one accelerator.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceLease {
    /// The leased device
    pub device: Accelerator,
    /// When the lease was taken
    pub acquired_at: DateTime<Utc>,
}

impl DeviceLease {
    /// Identifier handed to external tools.
    pub fn device_id(&self) -> String {
        self.device.id.to_string()
    }
}

/// Acquires accelerator leases from a device query.
pub struct LeaseManager<Q: DeviceQuery> {
    query: Q,
}

impl<Q: DeviceQuery> LeaseManager<Q> {
    pub fn new(query: Q) -> Self {
        Self { query }
    }

    /// Lease the lowest-numbered free accelerator.
    ///
    /// Fails fast with `ResourceUnavailable` when every device is busy.
    pub async fn acquire(&self) -> Result<DeviceLease> {
        let devices = self.query.list_devices().await?;
        let busy: HashSet<String> = self.query.busy_devices().await?.into_iter().collect();

        let free = free_devices(&devices, &busy);
        // Only listed devices count as busy; stray ids in the busy query are ignored.
        let busy_listed = devices.len() - free.len();
        let Some(device) = free.into_iter().min_by_key(|d| d.id) else {
            warn!(
                total = devices.len(),
                busy = busy_listed,
                reported = busy.len(),
                "No free accelerator"
            );
            return Err(TiltflowError::ResourceUnavailable {
                total: devices.len(),
                busy: busy_listed,
            });
        };

        info!(device = device.id, uuid = %device.uuid, "Accelerator leased");
        Ok(DeviceLease {
            device,
            acquired_at: Utc::now(),
        })
    }
}

/// Devices not reported busy, matched by UUID or numeric id.
pub fn free_devices(devices: &[Accelerator], busy: &HashSet<String>) -> Vec<Accelerator> {
    devices
        .iter()
        .filter(|d| !busy.contains(&d.uuid) && !busy.contains(&d.id.to_string()))
        .cloned()
        .collect()
}
