// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// Configuration of a device set: where its files live, how large its
// backing stores are, and how long it waits on the kernel.

use std::{
    fs::read_to_string,
    iter::Take,
    path::{Path, PathBuf},
    time::Duration,
};

use retry::delay::Fixed;
use serde_derive::{Deserialize, Serialize};

use devicemapper::Sectors;

use crate::{
    engine::consts::{
        DATA_LOOP_FILE, DEFAULT_BASE_FS_SIZE, DEFAULT_DATA_LOOP_SIZE, DEFAULT_FILESYSTEM,
        DEFAULT_MAX_ID_COLLISIONS, DEFAULT_METADATA_LOOP_SIZE, DEFAULT_REMOVAL_ATTEMPTS,
        DEFAULT_REMOVAL_DELAY_MS, DEFAULT_ROOT_PATH, DEFAULT_THINPOOL_BLOCK_SIZE,
        DEFAULT_UDEV_WAIT_ATTEMPTS, DEFAULT_UDEV_WAIT_DELAY_MS, LOOP_FILE_DIR, METADATA_DIR,
        METADATA_LOOP_FILE, MAX_THINPOOL_BLOCK_SIZE, MIN_THINPOOL_BLOCK_SIZE, SECTOR_SIZE,
    },
    errors::{PackerError, PackerResult},
};

/// A bounded number of attempts separated by a fixed delay.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: usize,
    pub delay_ms: u64,
}

impl RetryPolicy {
    pub const fn new(max_attempts: usize, delay_ms: u64) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            delay_ms,
        }
    }

    /// The delays to sleep between consecutive attempts. There is one fewer
    /// delay than there are attempts.
    pub fn delays(self) -> Take<Fixed> {
        Fixed::from_millis(self.delay_ms).take(self.max_attempts.saturating_sub(1))
    }

    /// The longest time that all delays together may take.
    pub fn total_delay(self) -> Duration {
        self.delays().sum()
    }
}

fn default_removal_retry() -> RetryPolicy {
    RetryPolicy::new(DEFAULT_REMOVAL_ATTEMPTS, DEFAULT_REMOVAL_DELAY_MS)
}

fn default_udev_wait() -> RetryPolicy {
    RetryPolicy::new(DEFAULT_UDEV_WAIT_ATTEMPTS, DEFAULT_UDEV_WAIT_DELAY_MS)
}

/// Every setting has a default. Paths which are not set explicitly are
/// placed below root_path.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct DeviceSetConfig {
    pub root_path: PathBuf,
    pub metadata_path: Option<PathBuf>,
    pub data_loop_path: Option<PathBuf>,
    pub metadata_loop_path: Option<PathBuf>,
    /// Size of the data backing file in bytes.
    pub data_loop_size: u64,
    /// Size of the metadata backing file in bytes.
    pub metadata_loop_size: u64,
    /// Size in bytes of every thin device mapping, including the base.
    pub base_fs_size: u64,
    /// Thin pool block size in sectors.
    pub thinpool_block_size: u64,
    pub filesystem: String,
    pub max_id_collisions: usize,
    pub removal_retry: RetryPolicy,
    pub udev_wait: RetryPolicy,
}

impl Default for DeviceSetConfig {
    fn default() -> DeviceSetConfig {
        DeviceSetConfig {
            root_path: PathBuf::from(DEFAULT_ROOT_PATH),
            metadata_path: None,
            data_loop_path: None,
            metadata_loop_path: None,
            data_loop_size: DEFAULT_DATA_LOOP_SIZE,
            metadata_loop_size: DEFAULT_METADATA_LOOP_SIZE,
            base_fs_size: DEFAULT_BASE_FS_SIZE,
            thinpool_block_size: *DEFAULT_THINPOOL_BLOCK_SIZE,
            filesystem: DEFAULT_FILESYSTEM.to_owned(),
            max_id_collisions: DEFAULT_MAX_ID_COLLISIONS,
            removal_retry: default_removal_retry(),
            udev_wait: default_udev_wait(),
        }
    }
}

impl DeviceSetConfig {
    /// The default configuration with every path below root.
    pub fn with_root(root: &Path) -> DeviceSetConfig {
        DeviceSetConfig {
            root_path: root.to_owned(),
            ..Default::default()
        }
    }

    /// Read a JSON configuration file. Missing keys take their defaults.
    pub fn from_file(path: &Path) -> PackerResult<DeviceSetConfig> {
        let config: DeviceSetConfig = serde_json::from_str(&read_to_string(path)?)?;
        config.validate()?;
        Ok(config)
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.metadata_path
            .clone()
            .unwrap_or_else(|| self.root_path.join(METADATA_DIR))
    }

    pub fn data_loop_path(&self) -> PathBuf {
        self.data_loop_path
            .clone()
            .unwrap_or_else(|| self.root_path.join(LOOP_FILE_DIR).join(DATA_LOOP_FILE))
    }

    pub fn metadata_loop_path(&self) -> PathBuf {
        self.metadata_loop_path
            .clone()
            .unwrap_or_else(|| self.root_path.join(LOOP_FILE_DIR).join(METADATA_LOOP_FILE))
    }

    pub fn thinpool_block_size(&self) -> Sectors {
        Sectors(self.thinpool_block_size)
    }

    pub fn base_fs_sectors(&self) -> Sectors {
        Sectors(self.base_fs_size / SECTOR_SIZE)
    }

    /// Check the configuration for values the kernel or the filesystem
    /// tools would reject.
    pub fn validate(&self) -> PackerResult<()> {
        if self.root_path.as_os_str().is_empty() || !self.root_path.is_absolute() {
            return Err(PackerError::Config(format!(
                "root path \"{}\" must be absolute",
                self.root_path.display()
            )));
        }

        for (what, size) in [
            ("data loop size", self.data_loop_size),
            ("metadata loop size", self.metadata_loop_size),
            ("base filesystem size", self.base_fs_size),
        ] {
            if size == 0 || size % SECTOR_SIZE != 0 {
                return Err(PackerError::Config(format!(
                    "{what} {size} must be a non-zero multiple of {SECTOR_SIZE} bytes"
                )));
            }
        }

        if self.metadata_loop_size > self.data_loop_size {
            return Err(PackerError::Config(format!(
                "metadata loop size {} exceeds data loop size {}",
                self.metadata_loop_size, self.data_loop_size
            )));
        }

        let block_size = self.thinpool_block_size();
        if block_size < MIN_THINPOOL_BLOCK_SIZE
            || block_size > MAX_THINPOOL_BLOCK_SIZE
            || *block_size % *MIN_THINPOOL_BLOCK_SIZE != 0
        {
            return Err(PackerError::Config(format!(
                "thin pool block size {} sectors must be a multiple of {} in [{}, {}]",
                *block_size,
                *MIN_THINPOOL_BLOCK_SIZE,
                *MIN_THINPOOL_BLOCK_SIZE,
                *MAX_THINPOOL_BLOCK_SIZE
            )));
        }

        if self.filesystem.is_empty()
            || !self.filesystem.chars().all(|c| c.is_ascii_alphanumeric())
        {
            return Err(PackerError::Config(format!(
                "filesystem type \"{}\" is not a plain name",
                self.filesystem
            )));
        }

        if self.max_id_collisions == 0
            || self.removal_retry.max_attempts == 0
            || self.udev_wait.max_attempts == 0
        {
            return Err(PackerError::Config(
                "attempt limits must be at least 1".to_owned(),
            ));
        }

        Ok(())
    }
}
