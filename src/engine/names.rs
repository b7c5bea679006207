// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// Functions for dealing with device mapper names.

use std::{
    fs::metadata,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
};

use nix::sys::stat::{major, minor};

use devicemapper::{DmName, DmNameBuf};

use crate::{
    engine::thinids::ThinId,
    errors::{PackerError, PackerResult},
};

const NAME_PREFIX: &str = "packer";
const DEV_MAPPER_DIR: &str = "/dev/mapper";

/// Compute the prefix that names every device belonging to the device set
/// rooted at root. The prefix encodes the device number and inode of root,
/// so that device sets on different roots never share pool names.
pub fn device_prefix(root: &Path) -> PackerResult<String> {
    let stat = metadata(root).map_err(|err| {
        PackerError::Chained(
            format!("Unable to stat root path {}", root.display()),
            Box::new(PackerError::Io(err)),
        )
    })?;
    let dev = stat.dev();
    Ok(format!(
        "{}-{}:{}-{}",
        NAME_PREFIX,
        major(dev),
        minor(dev),
        stat.ino()
    ))
}

/// Format the name of the thin pool.
pub fn format_pool_name(prefix: &str) -> PackerResult<DmNameBuf> {
    Ok(DmNameBuf::new(format!("{prefix}-pool"))?)
}

/// Format the name of the mapping for a thin device.
pub fn format_thin_name(prefix: &str, id: ThinId) -> PackerResult<DmNameBuf> {
    Ok(DmNameBuf::new(format!("{prefix}-{id}"))?)
}

/// The node that udev creates for an active device-mapper device.
pub fn devnode(name: &DmName) -> PathBuf {
    Path::new(DEV_MAPPER_DIR).join(name.to_string())
}
