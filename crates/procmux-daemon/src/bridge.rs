//! Forwards supervisor events onto the hub's `process:<id>` channels.

use tracing::{debug, warn};

use crate::hub::EventHub;
use crate::subprocess::ProcessSupervisor;

/// Install the supervisor callbacks that publish process output and status
/// changes to `hub`. Replaces any callbacks already installed.
///
/// Publishing never blocks the process readers; when the hub's publish queue
/// is full the event is dropped.
pub async fn attach(supervisor: &ProcessSupervisor, hub: EventHub) {
    let output_hub = hub.clone();
    supervisor
        .on_output(move |process_id, line| {
            if let Err(e) = output_hub.send_process_output(process_id, line) {
                debug!(process_id, error = %e, "Dropped process output");
            }
        })
        .await;

    supervisor
        .on_status_change(move |process_id, status, exit_code| {
            if let Err(e) = hub.send_process_status(process_id, status, exit_code) {
                warn!(process_id, %status, error = %e, "Dropped process status");
            }
        })
        .await;
}
