// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

// Handles invoking external binaries.
// Binaries are looked up in a fixed list of directories rather than in
// PATH, which may be unset when running as a service. The existence of the
// file is checked again each time a command is invoked, and an explicit
// error is returned if the executable can not be found.

use std::{
    path::{Path, PathBuf},
    process::Command,
};

use log::debug;

use crate::errors::{PackerError, PackerResult};

const BINARIES_PATHS: [&str; 4] = ["/usr/sbin", "/sbin", "/usr/bin", "/bin"];

const MKFS_PREFIX: &str = "mkfs.";
const UDEVADM: &str = "udevadm";

/// Find the binary with the given name by looking in likely locations.
/// Return None if no binary was found.
fn find_binary(name: &str) -> Option<PathBuf> {
    BINARIES_PATHS
        .iter()
        .map(|pre| [pre, name].iter().collect::<PathBuf>())
        .find(|path| path.exists())
}

fn binaries_not_found(names: Vec<String>) -> PackerError {
    PackerError::BinariesNotFound {
        names,
        locations: BINARIES_PATHS.iter().map(|path| (*path).to_owned()).collect(),
    }
}

/// Get an absolute path for the executable with the given name.
fn get_executable(name: &str) -> PackerResult<PathBuf> {
    find_binary(name).ok_or_else(|| binaries_not_found(vec![name.to_owned()]))
}

fn mkfs_binary(fs_type: &str) -> String {
    format!("{MKFS_PREFIX}{fs_type}")
}

/// Verify that every binary a device set may invoke when formatting with
/// fs_type is available. Return an error naming all that are missing.
pub fn verify_binaries(fs_type: &str) -> PackerResult<()> {
    let missing: Vec<String> = [mkfs_binary(fs_type), UDEVADM.to_owned()]
        .into_iter()
        .filter(|name| find_binary(name).is_none())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(binaries_not_found(missing))
    }
}

/// Invoke the specified command. Return an error if invoking the command
/// fails or if the command itself fails.
fn execute_cmd(cmd: &mut Command) -> PackerResult<()> {
    debug!("Executing {:?}", cmd);
    match cmd.output() {
        Err(err) => Err(PackerError::Chained(
            format!("Failed to execute {cmd:?}"),
            Box::new(PackerError::Io(err)),
        )),
        Ok(result) => {
            if result.status.success() {
                Ok(())
            } else {
                Err(PackerError::CommandFailure {
                    cmd: format!("{cmd:?}"),
                    output: result,
                })
            }
        }
    }
}

/// Create a filesystem of type fs_type on devnode.
pub fn create_fs(devnode: &Path, fs_type: &str) -> PackerResult<()> {
    execute_cmd(
        Command::new(get_executable(&mkfs_binary(fs_type))?.as_os_str())
            .arg("-q")
            .arg(devnode),
    )
}

/// Call udevadm settle
pub fn udev_settle() -> PackerResult<()> {
    execute_cmd(Command::new(get_executable(UDEVADM)?.as_os_str()).arg("settle"))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn test_missing_binary() {
        assert_matches!(
            verify_binaries("nosuchfs"),
            Err(PackerError::BinariesNotFound { names, locations })
                if names.contains(&"mkfs.nosuchfs".to_owned()) && locations.len() == 4
        );
        assert_matches!(
            create_fs(Path::new("/dev/null"), "nosuchfs"),
            Err(PackerError::BinariesNotFound { .. })
        );
    }

    #[test]
    fn test_command_failure() {
        assert_matches!(
            execute_cmd(&mut Command::new("false")),
            Err(PackerError::CommandFailure { .. })
        );
        execute_cmd(&mut Command::new("true")).unwrap();
    }
}
