// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// Sparse files exposed as block devices through loop devices.

use std::{
    fs::{create_dir_all, remove_file, File, OpenOptions},
    io::ErrorKind,
    path::{Path, PathBuf},
};

use log::{info, warn};

use crate::{
    engine::loopdev::{LoopBinder, LoopDevice},
    errors::{rollback, PackerError, PackerResult},
};

/// Create, or reuse, the file at path and set its length to size bytes.
/// Parent directories are created as needed. Extending the file does not
/// allocate any blocks. If the length cannot be set, a file created by this
/// call is removed again.
pub fn create_sparse_file(path: &Path, size: u64) -> PackerResult<File> {
    if let Some(parent) = path.parent() {
        create_dir_all(parent)?;
    }
    let open_failed = |err| {
        PackerError::Chained(
            format!("Failed to open backing file {}", path.display()),
            Box::new(PackerError::Io(err)),
        )
    };
    let (file, created) = match OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(path)
    {
        Ok(file) => (file, true),
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(path)
                .map_err(open_failed)?;
            (file, false)
        }
        Err(err) => return Err(open_failed(err)),
    };

    if let Err(err) = file.set_len(size) {
        let err = PackerError::Chained(
            format!("Failed to size backing file {} to {} bytes", path.display(), size),
            Box::new(PackerError::Io(err)),
        );
        if created {
            drop(file);
            return Err(rollback(err, [remove_sparse_file(path)]));
        }
        return Err(err);
    }
    Ok(file)
}

/// Remove the backing file at path. A file that is already gone is not an
/// error.
pub fn remove_sparse_file(path: &Path) -> PackerResult<()> {
    match remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(PackerError::Chained(
            format!("Failed to remove backing file {}", path.display()),
            Box::new(PackerError::Io(err)),
        )),
    }
}

/// A sparse file together with the loop device it is bound to. The file
/// stays open until the device is released.
#[derive(Debug)]
pub struct BackedLoop {
    file: File,
    path: PathBuf,
    dev: LoopDevice,
}

impl BackedLoop {
    /// Create a sparse file of size bytes at path and bind it to a free loop
    /// device. If no loop device can be bound the file is removed again.
    pub fn create(loops: &dyn LoopBinder, path: &Path, size: u64) -> PackerResult<BackedLoop> {
        let file = create_sparse_file(path, size)?;
        match loops.attach(&file, path) {
            Ok(dev) => {
                info!(
                    "Backing file {} is available as {}",
                    path.display(),
                    dev.devnode().display()
                );
                Ok(BackedLoop {
                    file,
                    path: path.to_owned(),
                    dev,
                })
            }
            Err(err) => {
                drop(file);
                if let Err(rm_err) = remove_sparse_file(path) {
                    warn!("{}", rm_err);
                }
                Err(err)
            }
        }
    }

    /// Detach the loop device, close the file, and unlink it.
    pub fn release(self, loops: &dyn LoopBinder) -> PackerResult<()> {
        let BackedLoop { file, path, dev } = self;
        loops.detach(dev);
        drop(file);
        remove_sparse_file(&path)
    }

    pub fn device(&self) -> &LoopDevice {
        &self.dev
    }

    pub fn backing_path(&self) -> &Path {
        &self.path
    }
}
