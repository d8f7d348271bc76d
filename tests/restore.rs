//! Integration test for `run_restore` over the synthetic image built by
//! `tests/common`: extracts `/foo` onto the host filesystem and checks its
//! content and size match the inode's declared `isize`.

mod common;

use std::fs;

use btrfsck::restore::{run_restore, RestoreOptions};

#[test]
fn restores_regular_file_content() {
    let (_tmp, handle) = common::build_fixture(1).expect("build fixture");
    let out = tempfile::tempdir().expect("tempdir");

    let report = run_restore(&handle, out.path(), &RestoreOptions::default()).expect("run_restore");

    assert_eq!(report.files_restored, 1);
    assert!(report.errors.is_empty(), "unexpected errors: {:?}", report.errors);

    let restored = out.path().join("foo");
    let content = fs::read(&restored).expect("read restored file");
    assert_eq!(content, common::FILE_CONTENT);
}
