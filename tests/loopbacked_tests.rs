// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// Tests against the running kernel. They need root, loop devices, and
// mkfs.ext4, so they only run when asked for with --ignored.

use std::{path::Path, sync::Once};

use packer_devmapper::engine::{
    get_dm_init, Backends, DeviceSet, DeviceSetConfig, ThinId, ThinState,
};

static LOGGER_INIT: Once = Once::new();

fn init_logger() {
    LOGGER_INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// Fail if any packer device is left in the kernel's device-mapper table.
fn assert_no_packer_devices() {
    let leftover: Vec<String> = get_dm_init()
        .unwrap()
        .list_devices()
        .unwrap()
        .into_iter()
        .map(|dev| dev.0.to_string())
        .filter(|name| name.starts_with("packer-"))
        .collect();
    assert!(leftover.is_empty(), "devices left behind: {leftover:?}");
}

fn initialize(root: &Path) -> DeviceSet {
    let config = DeviceSetConfig::with_root(root);
    let backends = Backends::system(&config).unwrap();
    DeviceSet::initialize(root, config, backends).unwrap()
}

#[test]
#[ignore = "requires root, loop devices and mkfs.ext4"]
fn test_default_sizes_end_to_end() {
    init_logger();
    let tmpdir = tempfile::Builder::new().prefix("packer").tempdir().unwrap();
    let root = tmpdir.path();

    let mut device_set = initialize(root);
    let base = device_set.base_device().unwrap();
    assert_eq!(base.id(), ThinId::BASE);
    assert_eq!(base.state(), ThinState::Active);

    let layer = device_set.create_device().unwrap();
    assert_eq!(u32::from(layer), 1);
    let node = device_set.activate_device(layer).unwrap();
    assert!(node.exists());

    device_set.deactivate_device(layer).unwrap();
    assert_eq!(device_set.device_state(layer), Some(ThinState::Deactivated));
    device_set.remove_device(layer).unwrap();
    assert_eq!(device_set.device_state(layer), None);

    device_set.teardown().unwrap();
    assert_no_packer_devices();
}

#[test]
#[ignore = "requires root, loop devices and mkfs.ext4"]
fn test_roots_do_not_collide() {
    init_logger();
    let first_dir = tempfile::Builder::new().prefix("packer").tempdir().unwrap();
    let second_dir = tempfile::Builder::new().prefix("packer").tempdir().unwrap();

    let first = initialize(first_dir.path());
    let second = initialize(second_dir.path());
    assert_ne!(first.pool_name(), second.pool_name());
    assert_ne!(first.data_loop().index(), second.data_loop().index());

    second.teardown().unwrap();
    first.teardown().unwrap();
    assert_no_packer_devices();
}
