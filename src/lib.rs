// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Thin provisioned block devices for container image layers.
//!
//! A [`DeviceSet`](engine::DeviceSet) binds two sparse files to loop
//! devices, builds a device-mapper thin pool over them, and formats a base
//! image. Further thin devices are allocated, activated, deactivated and
//! removed through it.

pub mod engine;
pub mod errors;

pub use crate::errors::{PackerError, PackerResult, TaskError, TaskFailureKind};
