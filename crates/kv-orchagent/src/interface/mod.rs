//! Interfaces of the mock device.
//!
//! Interfaces are configured from the northbound under
//! `config/mock/v1/interfaces/<name>`. Interfaces the device creates on its
//! own are reported to the scheduler as southbound values under the same
//! key, so that other values may depend on them.

mod descriptor;
mod types;

pub use descriptor::{InterfaceDescriptor, INTERFACE_DESCRIPTOR};
pub use types::{
    interface_key, Interface, InterfaceMetadata, InterfaceType, MemifLink, INTERFACE_KEY_PREFIX,
    INTERFACE_NAME_LIMIT,
};

use crate::device::DeviceEvent;
use crate::scheduler::KvScheduler;
use kv_orch_common::{value_ref, KvError, MetadataRef};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Forwards interfaces created or removed by the device as southbound
/// notifications until `shutdown` or until the device stops reporting.
pub async fn forward_device_events(
    scheduler: KvScheduler,
    mut events: mpsc::UnboundedReceiver<DeviceEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let result = match event {
            DeviceEvent::InterfaceAdded { index, interface } => {
                tracing::info!(interface = %interface.name, index, "interface created by the device");
                let metadata: MetadataRef = Arc::new(InterfaceMetadata { index });
                scheduler
                    .push_sb_notification(interface_key(&interface.name), Some(value_ref(interface)), Some(metadata))
                    .await
            }
            DeviceEvent::InterfaceRemoved { name } => {
                tracing::info!(interface = %name, "interface removed by the device");
                scheduler.push_sb_notification(interface_key(&name), None, None).await
            }
        };

        match result {
            Ok(_) => {}
            Err(KvError::SchedulerClosed) => break,
            Err(err) => tracing::warn!(error = %err, "failed to report device interface change"),
        }
    }
    tracing::debug!("device event forwarder stopped");
}
