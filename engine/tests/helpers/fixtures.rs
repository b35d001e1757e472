//! Fixture utilities shared by the integration tests.

use std::fs;
use std::path::Path;

/// Copy a fixture tree into a scratch directory.
pub fn copy_dir_recursive(src: &Path, dst: &Path) {
    fs::create_dir_all(dst).expect("create fixture target dir");
    for entry in fs::read_dir(src).expect("read fixture dir") {
        let entry = entry.expect("fixture dir entry");
        let target = dst.join(entry.file_name());
        if entry.file_type().expect("fixture file type").is_dir() {
            copy_dir_recursive(&entry.path(), &target);
        } else {
            fs::copy(entry.path(), &target).expect("copy fixture file");
        }
    }
}
