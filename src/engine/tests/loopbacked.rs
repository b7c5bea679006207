// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::{env, mem::forget, panic, path::Path};

use log::debug;

use devicemapper::DmNameBuf;

use crate::{
    engine::{
        config::RetryPolicy,
        dm::{get_dm_init, remove_with_retry, KernelDm},
        tests::logger::init_logger,
    },
    errors::PackerResult,
};

const CLEAN_UP_RETRY: RetryPolicy = RetryPolicy::new(10, 100);

/// Remove every device-mapper device whose name has the packer prefix.
/// Thin devices are removed before the pools that hold them.
pub fn clean_up() -> PackerResult<()> {
    let mut names: Vec<DmNameBuf> = get_dm_init()?
        .list_devices()?
        .into_iter()
        .map(|dev| dev.0)
        .filter(|name| name.to_string().starts_with("packer-"))
        .collect();
    names.sort_by_key(|name| name.to_string().ends_with("-pool"));

    let dm = KernelDm::new(CLEAN_UP_RETRY);
    for name in names {
        debug!("Cleaning up device {}", name);
        remove_with_retry(&dm, &name, CLEAN_UP_RETRY)?;
    }
    Ok(())
}

/// Run test with a scratch root directory, removing any packer devices
/// before and after. Set NO_TEST_CLEAN_UP=1 to keep the devices and the
/// root directory of a test for inspection.
pub fn test_with_root<F>(test: F)
where
    F: Fn(&Path) + panic::RefUnwindSafe,
{
    init_logger();
    let tmpdir = tempfile::Builder::new()
        .prefix("packer")
        .tempdir()
        .unwrap();

    clean_up().unwrap();

    let result = panic::catch_unwind(|| {
        test(tmpdir.path());
    });

    let tear_down = if env::var("NO_TEST_CLEAN_UP") != Ok("1".to_string()) {
        Some(clean_up())
    } else {
        forget(tmpdir);
        None
    };

    result.unwrap();

    if let Some(td) = tear_down {
        td.unwrap();
    }
}
