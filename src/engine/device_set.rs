// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// A thin pool over two loop-backed sparse files together with the thin
// devices allocated from it.

use std::{
    collections::HashMap,
    fs::{create_dir_all, remove_dir},
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use log::{info, warn};

use devicemapper::{DmName, DmNameBuf};

use crate::{
    engine::{
        backing::BackedLoop,
        cmd::verify_binaries,
        config::DeviceSetConfig,
        dm::{DmTasks, KernelDm},
        filesystem::{FsCreator, Mkfs},
        loopdev::{KernelLoops, LoopBinder, LoopDevice},
        names::{device_prefix, format_pool_name},
        thindev::{ThinDevice, ThinState},
        thinids::{ThinId, ThinIdCounter},
        thinpool::{create_pool, remove_pool_with_retry},
    },
    errors::{rollback, PackerError, PackerResult},
};

/// The kernel facilities a device set drives.
#[derive(Clone, Debug)]
pub struct Backends {
    pub dm: Arc<dyn DmTasks>,
    pub loops: Arc<dyn LoopBinder>,
    pub fs: Arc<dyn FsCreator>,
}

impl Backends {
    /// The running kernel's device-mapper and loop devices, and the mkfs
    /// binary for the configured filesystem. Fails if a required binary is
    /// missing.
    pub fn system(config: &DeviceSetConfig) -> PackerResult<Backends> {
        verify_binaries(&config.filesystem)?;
        Ok(Backends {
            dm: Arc::new(KernelDm::new(config.udev_wait)),
            loops: Arc::new(KernelLoops),
            fs: Arc::new(Mkfs),
        })
    }
}

/// Create dir and any missing ancestors, recording each directory created
/// in created, outermost first.
fn ensure_dir(dir: &Path, created: &mut Vec<PathBuf>) -> PackerResult<()> {
    if dir.is_dir() {
        return Ok(());
    }
    let missing: Vec<PathBuf> = dir
        .ancestors()
        .take_while(|path| !path.as_os_str().is_empty() && !path.exists())
        .map(Path::to_path_buf)
        .collect();
    create_dir_all(dir).map_err(|err| {
        PackerError::Chained(
            format!("Failed to create directory {}", dir.display()),
            Box::new(PackerError::Io(err)),
        )
    })?;
    created.extend(missing.into_iter().rev());
    Ok(())
}

/// Remove the directories in dirs, last created first. A directory that
/// still holds files is left in place.
fn remove_dirs(dirs: &[PathBuf]) -> PackerResult<()> {
    let mut result = Ok(());
    for dir in dirs.iter().rev() {
        match remove_dir(dir) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => {
                warn!("Leaving non-empty directory {} in place", dir.display());
            }
            Err(err) => {
                warn!("Failed to remove directory {}: {}", dir.display(), err);
                if result.is_ok() {
                    result = Err(PackerError::Chained(
                        format!("Failed to remove directory {}", dir.display()),
                        Box::new(PackerError::Io(err)),
                    ));
                }
            }
        }
    }
    result
}

fn prepare_dirs(config: &DeviceSetConfig, created: &mut Vec<PathBuf>) -> PackerResult<()> {
    ensure_dir(&config.metadata_path(), created)?;
    for file in [config.data_loop_path(), config.metadata_loop_path()] {
        if let Some(parent) = file.parent() {
            ensure_dir(parent, created)?;
        }
    }
    Ok(())
}

#[derive(Debug)]
struct Pool {
    prefix: String,
    name: DmNameBuf,
    devnode: PathBuf,
    data_loop: BackedLoop,
    metadata_loop: BackedLoop,
}

/// Bind the data and metadata backing files and build the pool over them.
/// Whatever was acquired is released again, last first, if a later step
/// fails.
fn setup_pool(config: &DeviceSetConfig, backends: &Backends) -> PackerResult<Pool> {
    let prefix = device_prefix(&config.root_path)?;
    let name = format_pool_name(&prefix)?;
    let loops = backends.loops.as_ref();

    let data_loop = BackedLoop::create(loops, &config.data_loop_path(), config.data_loop_size)?;
    let metadata_loop = match BackedLoop::create(
        loops,
        &config.metadata_loop_path(),
        config.metadata_loop_size,
    ) {
        Ok(metadata_loop) => metadata_loop,
        Err(err) => return Err(rollback(err, [data_loop.release(loops)])),
    };

    match create_pool(
        backends.dm.as_ref(),
        loops,
        &name,
        data_loop.device(),
        metadata_loop.device(),
        config.thinpool_block_size(),
    ) {
        Ok(devnode) => Ok(Pool {
            prefix,
            name,
            devnode,
            data_loop,
            metadata_loop,
        }),
        Err(err) => Err(rollback(
            err,
            [metadata_loop.release(loops), data_loop.release(loops)],
        )),
    }
}

fn unknown_device(id: ThinId) -> PackerError {
    PackerError::Msg(format!("no thin device with id {id} in this device set"))
}

/// A thin pool and the thin devices allocated from it. Operations that
/// change the pool take &mut self; callers that share a device set between
/// threads must serialize access, as the pool's "exists" response does not
/// reserve an id.
#[derive(Debug)]
pub struct DeviceSet {
    config: DeviceSetConfig,
    backends: Backends,
    prefix: String,
    pool_name: DmNameBuf,
    pool_devnode: PathBuf,
    data_loop: BackedLoop,
    metadata_loop: BackedLoop,
    // Directories made by initialize, outermost first.
    created_dirs: Vec<PathBuf>,
    next_id: ThinIdCounter,
    devices: HashMap<ThinId, ThinDevice>,
    base: Option<ThinId>,
}

impl DeviceSet {
    /// Build a thin pool below root and provision the base image, a thin
    /// device formatted with the configured filesystem. root overrides the
    /// root path of config.
    ///
    /// On failure everything already built is torn down again, last first,
    /// before the error is returned.
    pub fn initialize(
        root: &Path,
        config: DeviceSetConfig,
        backends: Backends,
    ) -> PackerResult<DeviceSet> {
        let config = DeviceSetConfig {
            root_path: root.to_owned(),
            ..config
        };
        config.validate()?;

        let mut created_dirs = Vec::new();
        let pool = match prepare_dirs(&config, &mut created_dirs)
            .and_then(|()| setup_pool(&config, &backends))
        {
            Ok(pool) => pool,
            Err(err) => return Err(rollback(err, [remove_dirs(&created_dirs)])),
        };

        let mut device_set = DeviceSet {
            config,
            backends,
            prefix: pool.prefix,
            pool_name: pool.name,
            pool_devnode: pool.devnode,
            data_loop: pool.data_loop,
            metadata_loop: pool.metadata_loop,
            created_dirs,
            next_id: ThinIdCounter::default(),
            devices: HashMap::new(),
            base: None,
        };

        if let Err(err) = device_set.setup_base_image() {
            let undo = device_set.release();
            return Err(rollback(err, undo.into_iter().map(Err)));
        }

        info!(
            "Device set {} ready with pool {}",
            device_set.prefix, device_set.pool_name
        );
        Ok(device_set)
    }

    /// Allocate, activate, and format the base image. A failure after
    /// allocation deletes the device from the pool again.
    fn setup_base_image(&mut self) -> PackerResult<()> {
        let id = self.create_device()?;

        let devnode = match self.activate_device(id) {
            Ok(devnode) => devnode,
            Err(err) => {
                let undo = self.discard_device(id);
                return Err(rollback(err, [undo]));
            }
        };

        if let Err(err) = self.backends.fs.create_fs(&devnode, &self.config.filesystem) {
            let undo = self
                .deactivate_device(id)
                .and_then(|()| self.remove_device(id));
            return Err(rollback(err, [undo]));
        }

        self.base = Some(id);
        info!(
            "Base image {} formatted with {}",
            devnode.display(),
            self.config.filesystem
        );
        Ok(())
    }

    /// Allocate a new thin device in the pool. The id counter moves past
    /// the id the pool accepted.
    pub fn create_device(&mut self) -> PackerResult<ThinId> {
        let dev = ThinDevice::allocate(
            self.backends.dm.as_ref(),
            &self.prefix,
            &self.pool_name,
            self.next_id.candidate(),
            self.config.max_id_collisions,
        )?;
        let id = dev.id();
        self.next_id.advance_past(id);
        self.devices.insert(id, dev);
        Ok(id)
    }

    /// Map the device so that it can be used. Returns its device node.
    pub fn activate_device(&mut self, id: ThinId) -> PackerResult<PathBuf> {
        let dev = self.devices.get_mut(&id).ok_or_else(|| unknown_device(id))?;
        dev.activate(
            self.backends.dm.as_ref(),
            &self.pool_devnode,
            self.config.base_fs_sectors(),
        )?;
        dev.devnode()
            .map(Path::to_path_buf)
            .ok_or_else(|| PackerError::Msg(format!("thin device {id} has no device node")))
    }

    pub fn deactivate_device(&mut self, id: ThinId) -> PackerResult<()> {
        let dev = self.devices.get_mut(&id).ok_or_else(|| unknown_device(id))?;
        dev.deactivate(self.backends.dm.as_ref(), self.config.removal_retry)
    }

    /// Delete a deactivated device from the pool. Its id is forgotten.
    pub fn remove_device(&mut self, id: ThinId) -> PackerResult<()> {
        let dev = self.devices.get_mut(&id).ok_or_else(|| unknown_device(id))?;
        dev.remove(
            self.backends.dm.as_ref(),
            &self.pool_name,
            self.config.removal_retry,
        )?;
        self.forget_device(id);
        Ok(())
    }

    fn discard_device(&mut self, id: ThinId) -> PackerResult<()> {
        let dev = self.devices.get_mut(&id).ok_or_else(|| unknown_device(id))?;
        dev.discard(
            self.backends.dm.as_ref(),
            &self.pool_name,
            self.config.removal_retry,
        )?;
        self.forget_device(id);
        Ok(())
    }

    fn forget_device(&mut self, id: ThinId) {
        self.devices.remove(&id);
        if self.base == Some(id) {
            self.base = None;
        }
    }

    /// The state of the device, or None if no such device is allocated.
    pub fn device_state(&self, id: ThinId) -> Option<ThinState> {
        self.devices.get(&id).map(ThinDevice::state)
    }

    /// The device node of the device while it is active.
    pub fn device_path(&self, id: ThinId) -> Option<&Path> {
        self.devices.get(&id).and_then(ThinDevice::devnode)
    }

    /// The formatted device every later device is derived from.
    pub fn base_device(&self) -> Option<&ThinDevice> {
        self.base.and_then(|id| self.devices.get(&id))
    }

    pub fn pool_name(&self) -> &DmName {
        &self.pool_name
    }

    pub fn pool_devnode(&self) -> &Path {
        &self.pool_devnode
    }

    pub fn device_prefix(&self) -> &str {
        &self.prefix
    }

    pub fn config(&self) -> &DeviceSetConfig {
        &self.config
    }

    pub fn data_loop(&self) -> &LoopDevice {
        self.data_loop.device()
    }

    pub fn metadata_loop(&self) -> &LoopDevice {
        self.metadata_loop.device()
    }

    /// Deactivate every active device, remove the pool, release both
    /// backing loops and remove the directories initialize created. Every
    /// step is attempted; the failures are returned together.
    pub fn teardown(self) -> PackerResult<()> {
        let prefix = self.prefix.clone();
        let errors = self.release();
        if errors.is_empty() {
            info!("Device set {} torn down", prefix);
            Ok(())
        } else {
            Err(PackerError::Teardown(errors))
        }
    }

    fn release(self) -> Vec<PackerError> {
        let DeviceSet {
            config,
            backends,
            pool_name,
            data_loop,
            metadata_loop,
            created_dirs,
            mut devices,
            ..
        } = self;
        let dm = backends.dm.as_ref();
        let loops = backends.loops.as_ref();
        let mut errors = Vec::new();

        let mut active: Vec<&mut ThinDevice> = devices
            .values_mut()
            .filter(|dev| dev.state() == ThinState::Active)
            .collect();
        active.sort_by_key(|dev| dev.id());
        for dev in active {
            if let Err(err) = dev.deactivate(dm, config.removal_retry) {
                warn!("Failed to deactivate thin device {}: {}", dev.id(), err);
                errors.push(err);
            }
        }

        if let Err(err) = remove_pool_with_retry(dm, &pool_name, config.removal_retry) {
            warn!("Failed to remove thin pool {}: {}", pool_name, err);
            errors.push(err);
        }

        for backed in [metadata_loop, data_loop] {
            if let Err(err) = backed.release(loops) {
                warn!("{}", err);
                errors.push(err);
            }
        }

        if let Err(err) = remove_dirs(&created_dirs) {
            errors.push(err);
        }

        errors
    }
}
