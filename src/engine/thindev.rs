// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// Allocation and activation of thin devices within a pool.

use std::path::{Path, PathBuf};

use log::{debug, info};
use strum_macros::Display;

use devicemapper::{DmName, DmNameBuf, Sectors};

use crate::{
    engine::{
        config::RetryPolicy,
        dm::{remove_with_retry, retry_while_busy, DmTasks, TableLine},
        names::format_thin_name,
        thinids::ThinId,
    },
    errors::{rollback, PackerError, PackerResult, TaskFailureKind},
};

/// The life cycle of a thin device. A device that has not been allocated
/// has no state; Removed is terminal.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
#[strum(serialize_all = "snake_case")]
pub enum ThinState {
    Allocated,
    Active,
    Deactivated,
    Removed,
}

/// Ask the pool to provision a thin device with id candidate. While the pool
/// reports that the id already exists the following id is tried, up to
/// max_attempts ids in all. Any other failure is returned immediately.
/// Returns the id the pool accepted.
pub fn create_thin(
    dm: &dyn DmTasks,
    pool: &DmName,
    candidate: ThinId,
    max_attempts: usize,
) -> PackerResult<ThinId> {
    let mut id = candidate;
    for attempt in 1..=max_attempts {
        match dm.message(pool, &format!("create_thin {id}")) {
            Ok(()) => {
                debug!("Pool {} accepted thin id {} on attempt {}", pool, id, attempt);
                return Ok(id);
            }
            Err(err) if err.task_failure_kind() == Some(TaskFailureKind::AlreadyExists) => {
                debug!("Thin id {} already exists in pool {}", id, pool);
                id = id.wrapping_next();
            }
            Err(err) => return Err(err),
        }
    }
    Err(PackerError::Collision {
        first_candidate: candidate.into(),
        attempts: max_attempts,
    })
}

/// A thin device provisioned in a pool.
#[derive(Debug)]
pub struct ThinDevice {
    id: ThinId,
    name: DmNameBuf,
    state: ThinState,
    devnode: Option<PathBuf>,
}

impl ThinDevice {
    /// Provision a new thin device in pool, starting the search for a free
    /// id at candidate. The device's mapping is named with prefix.
    pub fn allocate(
        dm: &dyn DmTasks,
        prefix: &str,
        pool: &DmName,
        candidate: ThinId,
        max_attempts: usize,
    ) -> PackerResult<ThinDevice> {
        let id = create_thin(dm, pool, candidate, max_attempts)?;
        let name = match format_thin_name(prefix, id) {
            Ok(name) => name,
            Err(err) => {
                let undo = dm.message(pool, &format!("delete {id}"));
                return Err(rollback(err, [undo]));
            }
        };
        info!("Allocated thin device {} in pool {}", id, pool);
        Ok(ThinDevice {
            id,
            name,
            state: ThinState::Allocated,
            devnode: None,
        })
    }

    fn check_state(&self, operation: &'static str, allowed: &[ThinState]) -> PackerResult<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(PackerError::InvalidState {
                id: self.id.into(),
                state: self.state.to_string(),
                operation,
            })
        }
    }

    /// Map the device as a "thin" target of size sectors over the pool
    /// whose node is pool_devnode.
    pub fn activate(
        &mut self,
        dm: &dyn DmTasks,
        pool_devnode: &Path,
        size: Sectors,
    ) -> PackerResult<()> {
        self.check_state("activate", &[ThinState::Allocated, ThinState::Deactivated])?;

        let table = [TableLine::new(
            Sectors(0),
            size,
            "thin",
            format!("{} {}", pool_devnode.display(), self.id),
        )];
        debug!("Thin device {} table: {}", self.name, table[0]);

        self.devnode = Some(dm.create(&self.name, &table)?);
        self.state = ThinState::Active;
        info!("Activated thin device {}", self.id);
        Ok(())
    }

    /// Remove the device's mapping. Its data stays in the pool.
    pub fn deactivate(&mut self, dm: &dyn DmTasks, policy: RetryPolicy) -> PackerResult<()> {
        self.check_state("deactivate", &[ThinState::Active])?;

        remove_with_retry(dm, &self.name, policy)?;
        self.devnode = None;
        self.state = ThinState::Deactivated;
        info!("Deactivated thin device {}", self.id);
        Ok(())
    }

    /// Delete the device from the pool.
    pub fn remove(
        &mut self,
        dm: &dyn DmTasks,
        pool: &DmName,
        policy: RetryPolicy,
    ) -> PackerResult<()> {
        self.check_state("remove", &[ThinState::Deactivated])?;
        self.delete(dm, pool, policy)
    }

    /// Delete a device that was allocated but never activated.
    pub(crate) fn discard(
        &mut self,
        dm: &dyn DmTasks,
        pool: &DmName,
        policy: RetryPolicy,
    ) -> PackerResult<()> {
        self.check_state("discard", &[ThinState::Allocated])?;
        self.delete(dm, pool, policy)
    }

    fn delete(&mut self, dm: &dyn DmTasks, pool: &DmName, policy: RetryPolicy) -> PackerResult<()> {
        let message = format!("delete {}", self.id);
        retry_while_busy(pool, policy, || dm.message(pool, &message))?;
        self.state = ThinState::Removed;
        info!("Removed thin device {} from pool {}", self.id, pool);
        Ok(())
    }

    pub fn id(&self) -> ThinId {
        self.id
    }

    pub fn name(&self) -> &DmName {
        &self.name
    }

    pub fn state(&self) -> ThinState {
        self.state
    }

    /// The device node, present while the device is active.
    pub fn devnode(&self) -> Option<&Path> {
        self.devnode.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use proptest::prelude::*;

    use crate::engine::{
        names::{devnode, format_pool_name},
        sim::SimDm,
        thinids::ThinIdCounter,
        thinpool::pool_table,
    };

    use super::*;

    const PREFIX: &str = "packer-0:0-7";
    const POLICY: RetryPolicy = RetryPolicy::new(3, 1);

    fn sim_pool(dm: &SimDm) -> DmNameBuf {
        let name = format_pool_name(PREFIX).unwrap();
        dm.create(
            &name,
            &[pool_table(
                Path::new("/dev/loop1"),
                Path::new("/dev/loop0"),
                Sectors(1 << 20),
                Sectors(128),
            )],
        )
        .unwrap();
        name
    }

    fn id(value: u32) -> ThinId {
        ThinId::new(value).unwrap()
    }

    #[test]
    fn test_create_thin_skips_existing_ids() {
        let dm = SimDm::default();
        let pool = sim_pool(&dm);
        dm.report_exists(5..=8);

        let messages = dm.message_count();
        assert_eq!(create_thin(&dm, &pool, id(5), 1024).unwrap(), id(9));
        assert_eq!(dm.message_count() - messages, 5);
        assert_eq!(dm.thin_ids(&pool.to_string()), vec![9]);
    }

    #[test]
    fn test_create_thin_collisions_exhausted() {
        let dm = SimDm::default();
        let pool = sim_pool(&dm);
        dm.report_exists(0..=3);

        assert_matches!(
            create_thin(&dm, &pool, id(0), 4),
            Err(PackerError::Collision {
                first_candidate: 0,
                attempts: 4
            })
        );
        assert!(dm.thin_ids(&pool.to_string()).is_empty());
    }

    #[test]
    fn test_create_thin_wraps_around() {
        let dm = SimDm::default();
        let pool = sim_pool(&dm);
        let last = id((1 << 24) - 1);
        dm.report_exists([u32::from(last)]);

        assert_eq!(create_thin(&dm, &pool, last, 2).unwrap(), ThinId::BASE);
    }

    #[test]
    fn test_create_thin_other_failure_not_retried() {
        let dm = SimDm::default();
        let pool = DmNameBuf::new(format!("{PREFIX}-absent-pool")).unwrap();

        let messages = dm.message_count();
        assert_matches!(
            create_thin(&dm, &pool, id(0), 1024),
            Err(PackerError::TaskRunFailure(_))
        );
        assert_eq!(dm.message_count() - messages, 1);
    }

    #[test]
    fn test_thin_device_lifecycle() {
        let dm = SimDm::default();
        let pool = sim_pool(&dm);
        let pool_node = devnode(&pool);

        let mut dev = ThinDevice::allocate(&dm, PREFIX, &pool, id(1), 1024).unwrap();
        assert_eq!(dev.state(), ThinState::Allocated);
        assert_eq!(dev.name().to_string(), "packer-0:0-7-1");
        assert_eq!(dev.devnode(), None);

        dev.activate(&dm, &pool_node, Sectors(2048)).unwrap();
        assert_eq!(dev.state(), ThinState::Active);
        assert_eq!(
            dev.devnode(),
            Some(Path::new("/dev/mapper/packer-0:0-7-1"))
        );
        assert_eq!(
            dm.table("packer-0:0-7-1").unwrap()[0].params,
            "/dev/mapper/packer-0:0-7-pool 1"
        );

        dev.deactivate(&dm, POLICY).unwrap();
        assert_eq!(dev.state(), ThinState::Deactivated);
        assert!(!dm.is_active("packer-0:0-7-1"));

        // Deactivated devices may be activated again.
        dev.activate(&dm, &pool_node, Sectors(2048)).unwrap();
        dev.deactivate(&dm, POLICY).unwrap();

        dev.remove(&dm, &pool, POLICY).unwrap();
        assert_eq!(dev.state(), ThinState::Removed);
        assert!(dm.thin_ids(&pool.to_string()).is_empty());
    }

    #[test]
    fn test_thin_device_state_violations() {
        let dm = SimDm::default();
        let pool = sim_pool(&dm);
        let pool_node = devnode(&pool);

        let mut dev = ThinDevice::allocate(&dm, PREFIX, &pool, id(0), 1024).unwrap();
        assert_matches!(
            dev.deactivate(&dm, POLICY),
            Err(PackerError::InvalidState {
                operation: "deactivate",
                ..
            })
        );
        assert_matches!(
            dev.remove(&dm, &pool, POLICY),
            Err(PackerError::InvalidState {
                operation: "remove",
                ..
            })
        );

        dev.activate(&dm, &pool_node, Sectors(2048)).unwrap();
        assert_matches!(
            dev.activate(&dm, &pool_node, Sectors(2048)),
            Err(PackerError::InvalidState {
                operation: "activate",
                ..
            })
        );
        assert_matches!(
            dev.remove(&dm, &pool, POLICY),
            Err(PackerError::InvalidState { .. })
        );
        assert_eq!(dev.state(), ThinState::Active);

        dev.deactivate(&dm, POLICY).unwrap();
        dev.remove(&dm, &pool, POLICY).unwrap();
        assert_matches!(
            dev.activate(&dm, &pool_node, Sectors(2048)),
            Err(PackerError::InvalidState { .. })
        );
    }

    #[test]
    fn test_remove_retries_busy_pool() {
        let dm = SimDm::default();
        let pool = sim_pool(&dm);

        let mut dev = ThinDevice::allocate(&dm, PREFIX, &pool, id(0), 1024).unwrap();
        dev.discard(&dm, &pool, POLICY).unwrap();
        assert_eq!(dev.state(), ThinState::Removed);

        let mut dev = ThinDevice::allocate(&dm, PREFIX, &pool, id(1), 1024).unwrap();
        dev.activate(&dm, &devnode(&pool), Sectors(2048)).unwrap();
        dev.deactivate(&dm, POLICY).unwrap();
        dm.busy_forever(&pool.to_string());
        assert_matches!(
            dev.remove(&dm, &pool, POLICY),
            Err(PackerError::Busy { attempts: 3, .. })
        );
        assert_eq!(dev.state(), ThinState::Deactivated);
    }

    proptest! {
        #[test]
        /// Ids handed out without intervening removals increase strictly.
        fn ids_strictly_increase(
            existing in prop::collection::hash_set(0u32..64, 0..32),
            count in 1usize..16,
        ) {
            let dm = SimDm::default();
            let pool = sim_pool(&dm);
            dm.report_exists(existing);

            let mut counter = ThinIdCounter::default();
            let mut previous: Option<ThinId> = None;
            for _ in 0..count {
                let assigned = create_thin(&dm, &pool, counter.candidate(), 1024).unwrap();
                counter.advance_past(assigned);
                if let Some(previous) = previous {
                    prop_assert!(assigned > previous);
                }
                previous = Some(assigned);
            }
        }
    }
}
