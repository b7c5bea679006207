// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// Issuing device-mapper tasks and classifying their failures.

use std::{error::Error, fmt, io, path::PathBuf, sync::OnceLock};

use log::{debug, info, warn};
use nix::errno::Errno;
use retry::{retry_with_index, OperationResult};

use devicemapper::{errors, DevId, DmError, DmName, DmOptions, Sectors, DM};

use crate::{
    engine::{config::RetryPolicy, udev::wait_for_devnode},
    errors::{rollback, PackerError, PackerResult, TaskError, TaskFailureKind},
};

static DM_CONTEXT: OnceLock<Result<DM, String>> = OnceLock::new();

/// Get the process wide device-mapper context, opening it on first use.
pub fn get_dm_init() -> PackerResult<&'static DM> {
    match DM_CONTEXT.get_or_init(|| DM::new().map_err(|err| err.to_string())) {
        Ok(dm) => Ok(dm),
        Err(err) => Err(PackerError::Chained(
            "Failed to open a device-mapper context".to_owned(),
            Box::new(PackerError::Msg(err.clone())),
        )),
    }
}

/// One line of a device-mapper table.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TableLine {
    pub start: Sectors,
    pub length: Sectors,
    pub target_type: String,
    pub params: String,
}

impl TableLine {
    pub fn new(start: Sectors, length: Sectors, target_type: &str, params: String) -> TableLine {
        TableLine {
            start,
            length,
            target_type: target_type.to_owned(),
            params,
        }
    }
}

impl fmt::Display for TableLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {}",
            *self.start, *self.length, self.target_type, self.params
        )
    }
}

/// The device-mapper operations needed to build and tear down thin pools.
pub trait DmTasks: fmt::Debug + Send + Sync {
    /// Create the device, load table into it, and resume it. Returns the
    /// device node once udev has created it.
    fn create(&self, name: &DmName, table: &[TableLine]) -> PackerResult<PathBuf>;

    /// Remove the device.
    fn remove(&self, name: &DmName) -> PackerResult<()>;

    /// Send msg to sector 0 of the device.
    fn message(&self, name: &DmName, msg: &str) -> PackerResult<()>;
}

/// Classify a device-mapper failure by the errno the kernel returned. A
/// DmError has no source of its own, so the errno is taken from the core
/// error it wraps.
pub fn classify(err: &DmError) -> TaskFailureKind {
    match err {
        DmError::Core(errors::Error::Ioctl(_, _, _, errno)) => TaskFailureKind::from(**errno),
        DmError::Core(core) => classify_sources(core),
        DmError::Dm(..) => TaskFailureKind::Other,
    }
}

fn classify_sources(err: &(dyn Error + 'static)) -> TaskFailureKind {
    let mut current = Some(err);
    while let Some(err) = current {
        if let Some(errno) = err.downcast_ref::<Errno>() {
            return TaskFailureKind::from(*errno);
        }
        if let Some(errno) = err.downcast_ref::<Box<Errno>>() {
            return TaskFailureKind::from(**errno);
        }
        if let Some(raw) = err
            .downcast_ref::<io::Error>()
            .and_then(io::Error::raw_os_error)
        {
            return TaskFailureKind::from(Errno::from_raw(raw));
        }
        current = err.source();
    }
    TaskFailureKind::Other
}

fn task_error(name: &DmName, err: &DmError) -> TaskError {
    TaskError::new(&name.to_string(), classify(err), err.to_string())
}

/// Device-mapper tasks issued to the running kernel.
#[derive(Debug)]
pub struct KernelDm {
    udev_wait: RetryPolicy,
}

impl KernelDm {
    pub fn new(udev_wait: RetryPolicy) -> KernelDm {
        KernelDm { udev_wait }
    }
}

impl DmTasks for KernelDm {
    fn create(&self, name: &DmName, table: &[TableLine]) -> PackerResult<PathBuf> {
        let dm = get_dm_init()?;
        let id = DevId::Name(name);

        dm.device_create(name, None, DmOptions::default())
            .map_err(|err| PackerError::TaskCreateFailure(task_error(name, &err)))?;

        let targets = table
            .iter()
            .map(|line| {
                (
                    *line.start,
                    *line.length,
                    line.target_type.clone(),
                    line.params.clone(),
                )
            })
            .collect::<Vec<_>>();

        let result = dm
            .table_load(&id, &targets, DmOptions::default())
            .map_err(|err| PackerError::TaskCreateFailure(task_error(name, &err)))
            .and_then(|_| {
                dm.device_suspend(&id, DmOptions::default())
                    .map_err(|err| PackerError::TaskRunFailure(task_error(name, &err)))
            })
            .and_then(|_| wait_for_devnode(name, self.udev_wait));

        match result {
            Ok(devnode) => {
                info!("Created device {} at {}", name, devnode.display());
                Ok(devnode)
            }
            Err(err) => {
                warn!("Setting up device {} failed, removing it: {}", name, err);
                let undo = dm
                    .device_remove(&id, DmOptions::default())
                    .map(|_| ())
                    .map_err(|err| PackerError::TaskRunFailure(task_error(name, &err)));
                Err(rollback(err, [undo]))
            }
        }
    }

    fn remove(&self, name: &DmName) -> PackerResult<()> {
        get_dm_init()?
            .device_remove(&DevId::Name(name), DmOptions::default())
            .map_err(|err| PackerError::TaskRunFailure(task_error(name, &err)))?;
        info!("Removed device {}", name);
        Ok(())
    }

    fn message(&self, name: &DmName, msg: &str) -> PackerResult<()> {
        debug!("Sending message \"{}\" to {}", msg, name);
        get_dm_init()?
            .target_msg(&DevId::Name(name), None, msg)
            .map_err(|err| PackerError::TaskRunFailure(task_error(name, &err)))?;
        Ok(())
    }
}

/// Run op until it succeeds or fails with anything other than busy. After
/// policy.max_attempts busy failures a Busy error is returned.
pub fn retry_while_busy<T, F>(name: &DmName, policy: RetryPolicy, mut op: F) -> PackerResult<T>
where
    F: FnMut() -> PackerResult<T>,
{
    let mut last_error = None;
    let mut attempts = 0;
    let result = retry_with_index(policy.delays(), |index| {
        attempts = index;
        match op() {
            Ok(value) => OperationResult::Ok(value),
            Err(err) if err.task_failure_kind() == Some(TaskFailureKind::Busy) => {
                debug!("Device {} busy on attempt {}", name, index);
                last_error = Some(err);
                OperationResult::Retry(())
            }
            Err(err) => {
                last_error = Some(err);
                OperationResult::Err(())
            }
        }
    });

    match (result, last_error) {
        (Ok(value), _) => Ok(value),
        (Err(_), Some(err)) if err.task_failure_kind() == Some(TaskFailureKind::Busy) => {
            warn!("Device {} still busy after {} attempts: {}", name, attempts, err);
            Err(PackerError::Busy {
                name: name.to_string(),
                attempts,
            })
        }
        (Err(_), Some(err)) => Err(err),
        (Err(_), None) => Err(PackerError::Msg(format!(
            "no attempt was made on device {name}"
        ))),
    }
}

/// Remove the device, retrying while the kernel reports it busy.
pub fn remove_with_retry(dm: &dyn DmTasks, name: &DmName, policy: RetryPolicy) -> PackerResult<()> {
    retry_while_busy(name, policy, || dm.remove(name))
}
