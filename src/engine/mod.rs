// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

pub use self::{
    backing::{create_sparse_file, remove_sparse_file, BackedLoop},
    config::{DeviceSetConfig, RetryPolicy},
    device_set::{Backends, DeviceSet},
    dm::{get_dm_init, DmTasks, KernelDm, TableLine},
    filesystem::{FsCreator, Mkfs},
    loopdev::{KernelLoops, LoopBinder, LoopDevice},
    names::{device_prefix, format_pool_name, format_thin_name},
    sim::{SimBackends, SimDm, SimLoops, SimMkfs},
    thindev::{create_thin, ThinDevice, ThinState},
    thinids::{ThinId, ThinIdCounter},
    thinpool::{create_pool, remove_pool, remove_pool_with_retry},
};

mod backing;
mod cmd;
mod config;
mod consts;
mod device_set;
mod dm;
mod filesystem;
mod loopdev;
mod names;
mod sim;
mod thindev;
mod thinids;
mod thinpool;
mod udev;

#[cfg(test)]
mod tests;
