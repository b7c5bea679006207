// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// Binding backing files to kernel loop devices.

use std::{
    fmt,
    fs::{metadata, File, OpenOptions},
    io, mem,
    os::unix::{ffi::OsStrExt, fs::FileTypeExt, io::AsRawFd},
    path::{Path, PathBuf},
};

use linux_raw_sys::loop_device::{
    loop_info64, LOOP_CLR_FD, LOOP_CTL_GET_FREE, LOOP_GET_STATUS64, LOOP_SET_FD,
    LOOP_SET_STATUS64, LO_FLAGS_AUTOCLEAR,
};
use log::{debug, info, warn};
use nix::{errno::Errno, libc};

use devicemapper::Sectors;

use crate::{
    engine::consts::SECTOR_SIZE,
    errors::{PackerError, PackerResult},
};

const LOOP_DEV_PREFIX: &str = "/dev/loop";
const LOOP_CONTROL_PATH: &str = "/dev/loop-control";

nix::ioctl_read!(blkgetsize64, 0x12, 114, u64);

/// Binds regular files to loop devices. Binding mutates the kernel's
/// global loop device table, so independent processes that attach
/// concurrently must be serialized by the caller.
pub trait LoopBinder: fmt::Debug + Send + Sync {
    /// Bind backing, the open file found at backing_path, to the free loop
    /// device with the lowest index.
    fn attach(&self, backing: &File, backing_path: &Path) -> PackerResult<LoopDevice>;

    /// Unbind the loop device and close its node. Failures are logged, the
    /// device is consumed regardless.
    fn detach(&self, dev: LoopDevice);

    /// The size of the loop device.
    fn size(&self, dev: &LoopDevice) -> PackerResult<Sectors>;
}

/// A loop device bound to a backing file.
#[derive(Debug)]
pub struct LoopDevice {
    index: u32,
    // The open loop node; absent for simulated devices.
    node: Option<File>,
    backing_path: PathBuf,
}

impl LoopDevice {
    pub(crate) fn new(index: u32, node: Option<File>, backing_path: &Path) -> LoopDevice {
        LoopDevice {
            index,
            node,
            backing_path: backing_path.to_owned(),
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn devnode(&self) -> PathBuf {
        loop_path(self.index)
    }

    pub fn backing_path(&self) -> &Path {
        &self.backing_path
    }
}

pub fn loop_path(index: u32) -> PathBuf {
    PathBuf::from(format!("{LOOP_DEV_PREFIX}{index}"))
}

fn open_node(path: &Path) -> io::Result<File> {
    OpenOptions::new().read(true).write(true).open(path)
}

/// Return true if no file is bound to the loop node.
fn is_unbound(node: &File) -> bool {
    let mut info: loop_info64 = unsafe { mem::zeroed() };
    let res = unsafe {
        libc::ioctl(
            node.as_raw_fd(),
            LOOP_GET_STATUS64 as _,
            &mut info as *mut loop_info64,
        )
    };
    res < 0 && Errno::last() == Errno::ENXIO
}

/// Bind backing to the loop node found at loop_path, mark the binding to be
/// cleared automatically on last close, and record loop_path as its name.
/// If the status can not be set the binding is undone.
fn bind(node: &File, backing: &File, loop_path: &Path) -> PackerResult<()> {
    if unsafe { libc::ioctl(node.as_raw_fd(), LOOP_SET_FD as _, backing.as_raw_fd()) } < 0 {
        return Err(PackerError::BindFailure {
            loop_path: loop_path.to_owned(),
            source: Errno::last(),
        });
    }

    let mut info: loop_info64 = unsafe { mem::zeroed() };
    info.lo_flags = LO_FLAGS_AUTOCLEAR as u32;
    let name = loop_path.as_os_str().as_bytes();
    let len = name.len().min(info.lo_file_name.len() - 1);
    info.lo_file_name[..len].copy_from_slice(&name[..len]);

    let res = unsafe {
        libc::ioctl(
            node.as_raw_fd(),
            LOOP_SET_STATUS64 as _,
            &info as *const loop_info64,
        )
    };
    if res < 0 {
        let source = Errno::last();
        if unsafe { libc::ioctl(node.as_raw_fd(), LOOP_CLR_FD as _, 0) } < 0 {
            warn!(
                "Failed to unbind {} after setting its status failed: {}",
                loop_path.display(),
                Errno::last()
            );
        }
        return Err(PackerError::BindFailure {
            loop_path: loop_path.to_owned(),
            source,
        });
    }

    Ok(())
}

/// Loop devices provided by the running kernel.
#[derive(Debug, Default)]
pub struct KernelLoops;

impl KernelLoops {
    /// Scan the existing /dev/loopN nodes in increasing order and bind to
    /// the first block device that is not in use. The scan stops at the
    /// first index that has no node.
    fn bind_existing(backing: &File) -> PackerResult<Option<(u32, File)>> {
        for index in 0u32.. {
            let path = loop_path(index);
            let Ok(stat) = metadata(&path) else {
                break;
            };
            if !stat.file_type().is_block_device() {
                continue;
            }

            let node = match open_node(&path) {
                Ok(node) => node,
                Err(err) => {
                    debug!("Skipping loop device {}: {}", path.display(), err);
                    continue;
                }
            };
            if !is_unbound(&node) {
                continue;
            }

            match bind(&node, backing, &path) {
                Ok(()) => return Ok(Some((index, node))),
                Err(PackerError::BindFailure {
                    source: Errno::EBUSY,
                    ..
                }) => {
                    debug!("Loop device {} was claimed concurrently", path.display());
                }
                Err(err) => return Err(err),
            }
        }
        Ok(None)
    }

    /// Ask loop-control for a free index, creating its node if necessary,
    /// and bind to it.
    fn bind_new(backing: &File) -> PackerResult<Option<(u32, File)>> {
        let control = match open_node(Path::new(LOOP_CONTROL_PATH)) {
            Ok(control) => control,
            Err(err) => {
                debug!("Unable to open {}: {}", LOOP_CONTROL_PATH, err);
                return Ok(None);
            }
        };

        let res = unsafe { libc::ioctl(control.as_raw_fd(), LOOP_CTL_GET_FREE as _) };
        let Ok(index) = u32::try_from(res) else {
            debug!("{} has no free loop device: {}", LOOP_CONTROL_PATH, Errno::last());
            return Ok(None);
        };

        let path = loop_path(index);
        let node = open_node(&path)?;
        bind(&node, backing, &path)?;
        Ok(Some((index, node)))
    }
}

impl LoopBinder for KernelLoops {
    fn attach(&self, backing: &File, backing_path: &Path) -> PackerResult<LoopDevice> {
        let found = match KernelLoops::bind_existing(backing)? {
            Some(found) => Some(found),
            None => KernelLoops::bind_new(backing)?,
        };
        let (index, node) = found.ok_or(PackerError::NoFreeLoopDevice)?;

        info!(
            "Attached {} to loop device {}",
            backing_path.display(),
            loop_path(index).display()
        );
        Ok(LoopDevice::new(index, Some(node), backing_path))
    }

    fn detach(&self, dev: LoopDevice) {
        let Some(node) = dev.node.as_ref() else {
            return;
        };
        if unsafe { libc::ioctl(node.as_raw_fd(), LOOP_CLR_FD as _, 0) } < 0 {
            warn!(
                "Failed to detach loop device {}: {}",
                dev.devnode().display(),
                Errno::last()
            );
        } else {
            info!(
                "Detached {} from loop device {}",
                dev.backing_path.display(),
                dev.devnode().display()
            );
        }
    }

    fn size(&self, dev: &LoopDevice) -> PackerResult<Sectors> {
        let node = dev.node.as_ref().ok_or_else(|| {
            PackerError::Msg(format!(
                "loop device {} has no open node",
                dev.devnode().display()
            ))
        })?;
        let mut bytes: u64 = 0;
        unsafe { blkgetsize64(node.as_raw_fd(), &mut bytes) }?;
        Ok(Sectors(bytes / SECTOR_SIZE))
    }
}

#[cfg(test)]
mod tests {
    use loopdev::LoopControl;

    use devicemapper::IEC;

    use crate::engine::{
        backing::{create_sparse_file, remove_sparse_file},
        tests::logger::init_logger,
    };

    use super::*;

    fn index_of(path: &Path) -> u32 {
        path.to_string_lossy()
            .trim_start_matches(LOOP_DEV_PREFIX)
            .parse()
            .unwrap()
    }

    #[test]
    fn test_loop_path() {
        assert_eq!(loop_path(3), PathBuf::from("/dev/loop3"));
        assert_eq!(index_of(&loop_path(12)), 12);
    }

    /// Verify that the index released by detach is found again by the next
    /// attach and that the kernel agrees that it is free.
    #[test]
    #[ignore = "requires root and loop devices"]
    fn loop_test_detach_frees_index() {
        init_logger();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("backing");
        let loops = KernelLoops;

        let file = create_sparse_file(&path, 16 * IEC::Mi).unwrap();
        let dev = loops.attach(&file, &path).unwrap();
        let index = dev.index();
        assert_eq!(loops.size(&dev).unwrap(), Sectors(32 * IEC::Ki));

        loops.detach(dev);
        drop(file);
        remove_sparse_file(&path).unwrap();

        assert!(is_unbound(&open_node(&loop_path(index)).unwrap()));
        let free = LoopControl::open().unwrap().next_free().unwrap();
        assert!(index_of(&free.path().unwrap()) <= index);

        let file = create_sparse_file(&path, 16 * IEC::Mi).unwrap();
        let dev = loops.attach(&file, &path).unwrap();
        assert_eq!(dev.index(), index);
        loops.detach(dev);
        drop(file);
        remove_sparse_file(&path).unwrap();
    }
}
