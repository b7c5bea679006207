// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// Simulated device-mapper, loop and mkfs backends. They keep their state in
// memory and allow failures to be injected.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    fs::{metadata, File},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use devicemapper::{DmName, Sectors};

use crate::{
    engine::{
        consts::SECTOR_SIZE,
        device_set::Backends,
        dm::{DmTasks, TableLine},
        filesystem::FsCreator,
        loopdev::{LoopBinder, LoopDevice},
        names::devnode,
    },
    errors::{PackerError, PackerResult, TaskError, TaskFailureKind},
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn run_failure(name: &str, kind: TaskFailureKind, message: &str) -> PackerError {
    PackerError::TaskRunFailure(TaskError::new(name, kind, message.to_owned()))
}

#[derive(Debug, Default)]
struct SimDmState {
    // Active mappings by name.
    tables: HashMap<String, Vec<TableLine>>,
    // Thin ids provisioned in each pool, by pool name.
    pools: HashMap<String, BTreeSet<u32>>,
    report_exists: HashSet<u32>,
    // Remaining busy responses by name; None is busy forever.
    busy: HashMap<String, Option<usize>>,
    fail_create: HashSet<String>,
    fail_sync: HashSet<String>,
    message_count: usize,
    remove_attempts: HashMap<String, usize>,
}

impl SimDmState {
    fn take_busy(&mut self, name: &str) -> bool {
        let Some(remaining) = self.busy.get(name).copied() else {
            return false;
        };
        match remaining {
            None => true,
            Some(0) => {
                self.busy.remove(name);
                false
            }
            Some(remaining) => {
                self.busy.insert(name.to_owned(), Some(remaining - 1));
                true
            }
        }
    }

    // Names of the active thin mappings on pool.
    fn active_thins(&self, pool: &str) -> Vec<(String, u32)> {
        let pool_node = devnode_of(pool);
        self.tables
            .iter()
            .filter_map(|(name, table)| {
                let line = table.first()?;
                if line.target_type != "thin" {
                    return None;
                }
                let (node, id) = line.params.rsplit_once(' ')?;
                if Path::new(node) == pool_node {
                    Some((name.clone(), id.parse().ok()?))
                } else {
                    None
                }
            })
            .collect()
    }
}

fn devnode_of(name: &str) -> PathBuf {
    match DmName::new(name) {
        Ok(name) => devnode(name),
        Err(_) => PathBuf::new(),
    }
}

/// An in-memory device-mapper. Pools track the thin ids provisioned in
/// them; thin mappings must refer to a pool by its node and to an id
/// provisioned in it.
#[derive(Debug, Default)]
pub struct SimDm {
    state: Mutex<SimDmState>,
}

impl SimDm {
    /// Report that these ids already exist whenever a pool is asked to
    /// create them.
    pub fn report_exists<I: IntoIterator<Item = u32>>(&self, ids: I) {
        lock(&self.state).report_exists.extend(ids);
    }

    /// Fail the next times tasks against name with busy.
    pub fn busy_for(&self, name: &str, times: usize) {
        lock(&self.state).busy.insert(name.to_owned(), Some(times));
    }

    /// Fail every task against name with busy.
    pub fn busy_forever(&self, name: &str) {
        lock(&self.state).busy.insert(name.to_owned(), None);
    }

    pub fn clear_busy(&self, name: &str) {
        lock(&self.state).busy.remove(name);
    }

    /// Fail the creation of the device name.
    pub fn fail_create(&self, name: &str) {
        lock(&self.state).fail_create.insert(name.to_owned());
    }

    /// Never let the node of name appear.
    pub fn fail_sync(&self, name: &str) {
        lock(&self.state).fail_sync.insert(name.to_owned());
    }

    pub fn is_active(&self, name: &str) -> bool {
        lock(&self.state).tables.contains_key(name)
    }

    pub fn active_devices(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.state).tables.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn table(&self, name: &str) -> Option<Vec<TableLine>> {
        lock(&self.state).tables.get(name).cloned()
    }

    /// The ids provisioned in pool, in increasing order.
    pub fn thin_ids(&self, pool: &str) -> Vec<u32> {
        lock(&self.state)
            .pools
            .get(pool)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn message_count(&self) -> usize {
        lock(&self.state).message_count
    }

    pub fn remove_attempts(&self, name: &str) -> usize {
        lock(&self.state)
            .remove_attempts
            .get(name)
            .copied()
            .unwrap_or(0)
    }
}

impl DmTasks for SimDm {
    fn create(&self, name: &DmName, table: &[TableLine]) -> PackerResult<PathBuf> {
        let key = name.to_string();
        let mut state = lock(&self.state);

        if state.fail_create.contains(&key) {
            return Err(PackerError::TaskCreateFailure(TaskError::new(
                &key,
                TaskFailureKind::Other,
                "injected create failure".to_owned(),
            )));
        }
        if state.tables.contains_key(&key) {
            return Err(PackerError::TaskCreateFailure(TaskError::new(
                &key,
                TaskFailureKind::AlreadyExists,
                "device already exists".to_owned(),
            )));
        }

        let line = table.first().ok_or_else(|| {
            PackerError::TaskCreateFailure(TaskError::new(
                &key,
                TaskFailureKind::Other,
                "empty table".to_owned(),
            ))
        })?;
        match line.target_type.as_str() {
            "thin-pool" => {}
            "thin" => {
                let valid = line.params.rsplit_once(' ').and_then(|(node, id)| {
                    let pool = Path::new(node).file_name()?.to_str()?;
                    let id = id.parse::<u32>().ok()?;
                    Some(state.pools.get(pool)?.contains(&id))
                });
                if valid != Some(true) {
                    return Err(run_failure(
                        &key,
                        TaskFailureKind::Other,
                        "no such thin device in pool",
                    ));
                }
            }
            other => {
                return Err(PackerError::TaskCreateFailure(TaskError::new(
                    &key,
                    TaskFailureKind::Other,
                    format!("unknown target type {other}"),
                )))
            }
        }

        if state.fail_sync.contains(&key) {
            return Err(PackerError::SyncTimeout {
                name: key,
                waited: Duration::ZERO,
            });
        }

        if line.target_type == "thin-pool" {
            state.pools.entry(key.clone()).or_default();
        }
        state.tables.insert(key, table.to_vec());
        Ok(devnode(name))
    }

    fn remove(&self, name: &DmName) -> PackerResult<()> {
        let key = name.to_string();
        let mut state = lock(&self.state);
        *state.remove_attempts.entry(key.clone()).or_insert(0) += 1;

        if state.take_busy(&key) {
            return Err(run_failure(&key, TaskFailureKind::Busy, "Device or resource busy"));
        }
        if !state.tables.contains_key(&key) {
            return Err(run_failure(&key, TaskFailureKind::Other, "No such device or address"));
        }
        if !state.active_thins(&key).is_empty() {
            return Err(run_failure(&key, TaskFailureKind::Busy, "pool has open thin devices"));
        }

        state.tables.remove(&key);
        state.pools.remove(&key);
        Ok(())
    }

    fn message(&self, name: &DmName, msg: &str) -> PackerResult<()> {
        let key = name.to_string();
        let mut state = lock(&self.state);
        state.message_count += 1;

        if state.take_busy(&key) {
            return Err(run_failure(&key, TaskFailureKind::Busy, "Device or resource busy"));
        }

        let (verb, id) = match msg.split_once(' ') {
            Some((verb, arg)) => match arg.parse::<u32>() {
                Ok(id) => (verb, id),
                Err(_) => {
                    return Err(run_failure(&key, TaskFailureKind::Other, "Invalid argument"))
                }
            },
            None => return Err(run_failure(&key, TaskFailureKind::Other, "Invalid argument")),
        };

        let in_use = state.active_thins(&key).iter().any(|(_, active)| *active == id);
        let reported = state.report_exists.contains(&id);
        let Some(ids) = state.pools.get_mut(&key) else {
            return Err(run_failure(&key, TaskFailureKind::Other, "No such device or address"));
        };
        match verb {
            "create_thin" => {
                if reported || !ids.insert(id) {
                    return Err(run_failure(&key, TaskFailureKind::AlreadyExists, "File exists"));
                }
                Ok(())
            }
            "delete" => {
                if in_use {
                    return Err(run_failure(&key, TaskFailureKind::Busy, "Device or resource busy"));
                }
                if !ids.remove(&id) {
                    return Err(run_failure(&key, TaskFailureKind::Other, "No data available"));
                }
                Ok(())
            }
            _ => Err(run_failure(&key, TaskFailureKind::Other, "Invalid argument")),
        }
    }
}

#[derive(Debug, Default)]
struct SimLoopsState {
    bound: BTreeMap<u32, PathBuf>,
    fail_attach: HashSet<PathBuf>,
}

/// An in-memory loop device table. Attach takes the lowest unbound index.
#[derive(Debug, Default)]
pub struct SimLoops {
    state: Mutex<SimLoopsState>,
}

impl SimLoops {
    /// Refuse to attach the backing file at path.
    pub fn fail_attach(&self, path: &Path) {
        lock(&self.state).fail_attach.insert(path.to_owned());
    }

    pub fn bound_count(&self) -> usize {
        lock(&self.state).bound.len()
    }

    pub fn bound_paths(&self) -> Vec<PathBuf> {
        lock(&self.state).bound.values().cloned().collect()
    }
}

impl LoopBinder for SimLoops {
    fn attach(&self, _backing: &File, backing_path: &Path) -> PackerResult<LoopDevice> {
        let mut state = lock(&self.state);
        if state.fail_attach.contains(backing_path) {
            return Err(PackerError::NoFreeLoopDevice);
        }
        let index = (0u32..)
            .find(|index| !state.bound.contains_key(index))
            .ok_or(PackerError::NoFreeLoopDevice)?;
        state.bound.insert(index, backing_path.to_owned());
        Ok(LoopDevice::new(index, None, backing_path))
    }

    fn detach(&self, dev: LoopDevice) {
        lock(&self.state).bound.remove(&dev.index());
    }

    fn size(&self, dev: &LoopDevice) -> PackerResult<Sectors> {
        Ok(Sectors(metadata(dev.backing_path())?.len() / SECTOR_SIZE))
    }
}

/// Records the nodes it is asked to format.
#[derive(Debug, Default)]
pub struct SimMkfs {
    formatted: Mutex<Vec<(PathBuf, String)>>,
    fail: AtomicBool,
}

impl SimMkfs {
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn formatted(&self) -> Vec<(PathBuf, String)> {
        lock(&self.formatted).clone()
    }
}

impl FsCreator for SimMkfs {
    fn create_fs(&self, devnode: &Path, fs_type: &str) -> PackerResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(PackerError::Msg(format!(
                "injected mkfs.{} failure on {}",
                fs_type,
                devnode.display()
            )));
        }
        lock(&self.formatted).push((devnode.to_owned(), fs_type.to_owned()));
        Ok(())
    }
}

/// The simulated backends, kept so that tests can inspect and steer them.
#[derive(Debug, Default)]
pub struct SimBackends {
    pub dm: Arc<SimDm>,
    pub loops: Arc<SimLoops>,
    pub fs: Arc<SimMkfs>,
}

impl SimBackends {
    pub fn backends(&self) -> Backends {
        Backends {
            dm: Arc::clone(&self.dm) as Arc<dyn DmTasks>,
            loops: Arc::clone(&self.loops) as Arc<dyn LoopBinder>,
            fs: Arc::clone(&self.fs) as Arc<dyn FsCreator>,
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use devicemapper::DmNameBuf;

    use crate::engine::{backing::create_sparse_file, thinpool::pool_table};

    use super::*;

    #[test]
    fn test_loop_index_reused_after_detach() {
        let dir = tempfile::tempdir().unwrap();
        let loops = SimLoops::default();
        let paths: Vec<PathBuf> = (0..3).map(|i| dir.path().join(format!("f{i}"))).collect();
        let files: Vec<File> = paths
            .iter()
            .map(|path| create_sparse_file(path, 4096).unwrap())
            .collect();

        let devs: Vec<LoopDevice> = files
            .iter()
            .zip(paths.iter())
            .map(|(file, path)| loops.attach(file, path).unwrap())
            .collect();
        assert_eq!(devs.iter().map(LoopDevice::index).collect::<Vec<_>>(), vec![0, 1, 2]);

        let mut devs = devs.into_iter();
        let first = devs.next().unwrap();
        let first_index = first.index();
        loops.detach(first);

        let again = loops.attach(&files[0], &paths[0]).unwrap();
        assert_eq!(again.index(), first_index);
        assert_eq!(loops.size(&again).unwrap(), Sectors(8));
        assert_eq!(loops.bound_count(), 3);
    }

    #[test]
    fn test_pool_removal_blocked_by_active_thin() {
        let dm = SimDm::default();
        let pool = DmNameBuf::new("packer-sim-pool".to_owned()).unwrap();
        dm.create(
            &pool,
            &[pool_table(
                Path::new("/dev/loop1"),
                Path::new("/dev/loop0"),
                Sectors(2048),
                Sectors(128),
            )],
        )
        .unwrap();
        dm.message(&pool, "create_thin 0").unwrap();

        let thin = DmNameBuf::new("packer-sim-0".to_owned()).unwrap();
        let table = [TableLine::new(
            Sectors(0),
            Sectors(1024),
            "thin",
            format!("{} 0", devnode(&pool).display()),
        )];
        dm.create(&thin, &table).unwrap();
        assert_matches!(
            dm.create(&thin, &table),
            Err(PackerError::TaskCreateFailure(TaskError {
                kind: TaskFailureKind::AlreadyExists,
                ..
            }))
        );

        assert_eq!(
            dm.remove(&pool).unwrap_err().task_failure_kind(),
            Some(TaskFailureKind::Busy)
        );
        assert_eq!(
            dm.message(&pool, "delete 0")
                .unwrap_err()
                .task_failure_kind(),
            Some(TaskFailureKind::Busy)
        );

        dm.remove(&thin).unwrap();
        dm.message(&pool, "delete 0").unwrap();
        dm.remove(&pool).unwrap();
        assert!(dm.active_devices().is_empty());
    }

    #[test]
    fn test_thin_table_needs_provisioned_id() {
        let dm = SimDm::default();
        let thin = DmNameBuf::new("packer-sim-3".to_owned()).unwrap();
        let table = [TableLine::new(
            Sectors(0),
            Sectors(1024),
            "thin",
            "/dev/mapper/packer-sim-pool 3".to_owned(),
        )];
        assert_matches!(dm.create(&thin, &table), Err(PackerError::TaskRunFailure(_)));
    }

    #[test]
    fn test_mkfs_failure_injection() {
        let fs = SimMkfs::default();
        fs.create_fs(Path::new("/dev/mapper/a"), "ext4").unwrap();
        fs.set_fail(true);
        assert!(fs.create_fs(Path::new("/dev/mapper/b"), "ext4").is_err());
        assert_eq!(
            fs.formatted(),
            vec![(PathBuf::from("/dev/mapper/a"), "ext4".to_owned())]
        );
    }
}
