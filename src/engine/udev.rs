// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// Waiting for udev to finish processing a device-mapper device.

use std::path::PathBuf;

use log::{debug, trace};
use retry::{retry_with_index, OperationResult};

use devicemapper::DmName;

use crate::{
    engine::{cmd::udev_settle, config::RetryPolicy, names::devnode},
    errors::{PackerError, PackerResult},
};

/// Wait until the node for the device-mapper device name exists. udev is
/// asked to settle first; its node is then polled according to policy.
/// Returns the node.
pub fn wait_for_devnode(name: &DmName, policy: RetryPolicy) -> PackerResult<PathBuf> {
    if let Err(err) = udev_settle() {
        debug!("udev did not settle, polling for the node of {}: {}", name, err);
    }

    let node = devnode(name);
    retry_with_index(policy.delays(), |index| {
        if node.exists() {
            OperationResult::Ok(())
        } else {
            trace!("Node {} absent on check {}", node.display(), index);
            OperationResult::Retry(())
        }
    })
    .map_err(|_| PackerError::SyncTimeout {
        name: name.to_string(),
        waited: policy.total_delay(),
    })?;

    Ok(node)
}
