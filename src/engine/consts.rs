// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use devicemapper::{Sectors, IEC};

pub const DEFAULT_ROOT_PATH: &str = "/var/lib/packer/devmapper";

// Names of the entries below the root directory.
pub const METADATA_DIR: &str = "metadata";
pub const LOOP_FILE_DIR: &str = "devmapper";
pub const DATA_LOOP_FILE: &str = "data";
pub const METADATA_LOOP_FILE: &str = "metadata";

pub const SECTOR_SIZE: u64 = 512;

pub const DEFAULT_DATA_LOOP_SIZE: u64 = 100 * IEC::Gi;
pub const DEFAULT_METADATA_LOOP_SIZE: u64 = 2 * IEC::Gi;
pub const DEFAULT_BASE_FS_SIZE: u64 = 10 * IEC::Gi;
pub const DEFAULT_THINPOOL_BLOCK_SIZE: Sectors = Sectors(128); // 64 KiB
pub const DEFAULT_FILESYSTEM: &str = "ext4";

// The kernel requires the pool block size to be a multiple of 64 KiB
// between 64 KiB and 1 GiB.
pub const MIN_THINPOOL_BLOCK_SIZE: Sectors = Sectors(128);
pub const MAX_THINPOOL_BLOCK_SIZE: Sectors = Sectors(2 * IEC::Mi);

/// Fourth positional argument of the thin-pool table, in data blocks.
pub const POOL_LOW_WATER_MARK: u64 = 32 * IEC::Ki;

/// Thin device ids are 24 bit numbers.
pub const THIN_ID_LIMIT: u32 = 1 << 24;

pub const DEFAULT_MAX_ID_COLLISIONS: usize = 1024;

// Each removal attempt is itself up to 5 tries 200 ms apart inside the
// devicemapper crate, so 20 attempts bound a busy removal at about 18 s.
pub const DEFAULT_REMOVAL_ATTEMPTS: usize = 20;
pub const DEFAULT_REMOVAL_DELAY_MS: u64 = 100;

pub const DEFAULT_UDEV_WAIT_ATTEMPTS: usize = 100;
pub const DEFAULT_UDEV_WAIT_DELAY_MS: u64 = 50;
