// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// Creating and removing the thin pool.

use std::path::{Path, PathBuf};

use log::{debug, info};

use devicemapper::{DmName, Sectors};

use crate::{
    engine::{
        config::RetryPolicy,
        consts::POOL_LOW_WATER_MARK,
        dm::{remove_with_retry, DmTasks, TableLine},
        loopdev::{LoopBinder, LoopDevice},
    },
    errors::PackerResult,
};

/// The table of a thin pool spanning length sectors of data_dev. The format
/// of the line is:
/// <start> <length> thin-pool <meta dev> <data dev> <block size> <low water mark> 1 skip_block_zeroing
///
/// New blocks are not zeroed; a thin device may read stale data from the
/// backing file until the block is first written.
pub fn pool_table(
    meta_dev: &Path,
    data_dev: &Path,
    length: Sectors,
    data_block_size: Sectors,
) -> TableLine {
    let params = format!(
        "{} {} {} {} 1 skip_block_zeroing",
        meta_dev.display(),
        data_dev.display(),
        *data_block_size,
        POOL_LOW_WATER_MARK
    );
    TableLine::new(Sectors(0), length, "thin-pool", params)
}

/// Create the thin pool name over the data and metadata loop devices. The
/// pool spans the whole data device. Returns the pool's device node once
/// udev has confirmed it.
pub fn create_pool(
    dm: &dyn DmTasks,
    loops: &dyn LoopBinder,
    name: &DmName,
    data: &LoopDevice,
    meta: &LoopDevice,
    data_block_size: Sectors,
) -> PackerResult<PathBuf> {
    let length = loops.size(data)?;
    let table = [pool_table(
        &meta.devnode(),
        &data.devnode(),
        length,
        data_block_size,
    )];
    debug!("Thin pool {} table: {}", name, table[0]);

    let devnode = dm.create(name, &table)?;
    info!(
        "Created thin pool {} over {} and {}",
        name,
        data.devnode().display(),
        meta.devnode().display()
    );
    Ok(devnode)
}

/// Remove the thin pool with a single attempt.
pub fn remove_pool(dm: &dyn DmTasks, name: &DmName) -> PackerResult<()> {
    dm.remove(name)
}

/// Remove the thin pool, retrying while udev or another holder keeps it
/// busy.
pub fn remove_pool_with_retry(
    dm: &dyn DmTasks,
    name: &DmName,
    policy: RetryPolicy,
) -> PackerResult<()> {
    remove_with_retry(dm, name, policy)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use devicemapper::{DmNameBuf, IEC};

    use crate::{
        engine::{
            backing::BackedLoop,
            sim::{SimDm, SimLoops},
        },
        errors::PackerError,
    };

    use super::*;

    #[test]
    fn test_pool_table() {
        let line = pool_table(
            Path::new("/dev/loop1"),
            Path::new("/dev/loop0"),
            Sectors(2048),
            Sectors(128),
        );
        assert_eq!(
            line.to_string(),
            "0 2048 thin-pool /dev/loop1 /dev/loop0 128 32768 1 skip_block_zeroing"
        );
    }

    #[test]
    fn test_create_and_remove_pool() {
        let dir = tempfile::tempdir().unwrap();
        let dm = SimDm::default();
        let loops = SimLoops::default();
        let name = DmNameBuf::new("packer-0:0-1-pool".to_owned()).unwrap();

        let data = BackedLoop::create(&loops, &dir.path().join("data"), 8 * IEC::Mi).unwrap();
        let meta = BackedLoop::create(&loops, &dir.path().join("metadata"), IEC::Mi).unwrap();

        let devnode = create_pool(&dm, &loops, &name, data.device(), meta.device(), Sectors(128))
            .unwrap();
        assert_eq!(devnode, PathBuf::from("/dev/mapper/packer-0:0-1-pool"));
        let table = dm.table("packer-0:0-1-pool").unwrap();
        assert_eq!(table[0].length, Sectors(16 * IEC::Ki));
        assert_eq!(
            table[0].params,
            "/dev/loop1 /dev/loop0 128 32768 1 skip_block_zeroing"
        );

        dm.busy_for("packer-0:0-1-pool", 2);
        assert_matches!(
            remove_pool(&dm, &name),
            Err(PackerError::TaskRunFailure(_))
        );
        remove_pool_with_retry(&dm, &name, RetryPolicy::new(3, 1)).unwrap();
        assert!(!dm.is_active("packer-0:0-1-pool"));
        assert_eq!(dm.remove_attempts("packer-0:0-1-pool"), 3);

        meta.release(&loops).unwrap();
        data.release(&loops).unwrap();
    }

    #[test]
    fn test_remove_pool_busy_forever() {
        let dm = SimDm::default();
        let name = DmNameBuf::new("packer-0:0-2-pool".to_owned()).unwrap();
        dm.create(
            &name,
            &[pool_table(
                Path::new("/dev/loop1"),
                Path::new("/dev/loop0"),
                Sectors(2048),
                Sectors(128),
            )],
        )
        .unwrap();
        dm.busy_forever("packer-0:0-2-pool");

        assert_matches!(
            remove_pool_with_retry(&dm, &name, RetryPolicy::new(5, 1)),
            Err(PackerError::Busy { attempts: 5, .. })
        );
        assert_eq!(dm.remove_attempts("packer-0:0-2-pool"), 5);
        assert!(dm.is_active("packer-0:0-2-pool"));
    }
}
