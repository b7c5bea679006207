// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{fmt, path::Path};

use log::info;

use crate::{engine::cmd::create_fs, errors::PackerResult};

/// Writes a fresh filesystem onto a device node.
pub trait FsCreator: fmt::Debug + Send + Sync {
    fn create_fs(&self, devnode: &Path, fs_type: &str) -> PackerResult<()>;
}

/// Formats with the mkfs.<type> binary.
#[derive(Debug, Default)]
pub struct Mkfs;

impl FsCreator for Mkfs {
    fn create_fs(&self, devnode: &Path, fs_type: &str) -> PackerResult<()> {
        create_fs(devnode, fs_type)?;
        info!("Created {} filesystem on {}", fs_type, devnode.display());
        Ok(())
    }
}
