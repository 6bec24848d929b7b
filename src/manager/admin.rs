//! ストアを開かずに行う管理操作.
use std::fs;
use std::path::Path;

use super::kernel::{copy_datastore, datastore_dir, HEADER_FILE_NAME};
use super::ManagerBuilder;
use crate::consistency::{self, ConsistencyMark};
use crate::{ErrorKind, Result};

/// `path`のストアが存在し、かつ正常にクローズされているかどうか.
pub fn is_consistent<P: AsRef<Path>>(path: P) -> bool {
    let datastore = datastore_dir(path);
    datastore.join(HEADER_FILE_NAME).exists() && ConsistencyMark::new(&datastore).is_clean()
}

/// `path`のストアを削除する.
///
/// ストアが存在しなかった場合には`false`が返される.
/// 他のインスタンスが使用中(ロック取得済み)の場合には失敗する.
pub fn remove_store<P: AsRef<Path>>(path: P) -> Result<bool> {
    let datastore = datastore_dir(&path);
    if !datastore.exists() {
        return Ok(false);
    }
    let lock_file = fs::File::open(datastore.join(HEADER_FILE_NAME)).ok();
    if let Some(ref file) = lock_file {
        track!(ManagerBuilder::new().lock_file(file, false))?;
    }
    track_io!(fs::remove_dir_all(&datastore))?;
    drop(lock_file);

    // 他に何も残っていなければ、ストアのディレクトリ自体も削除する
    let _ = fs::remove_dir(path.as_ref());
    Ok(true)
}

/// 正常にクローズされているストアを`from`から`to`にコピーする.
///
/// コピー先はクリーンな状態となり、インスタンスUUIDも引き継がれる.
pub fn copy_store<P: AsRef<Path>, Q: AsRef<Path>>(from: P, to: Q) -> Result<()> {
    let source = datastore_dir(&from);
    track_assert!(
        source.join(HEADER_FILE_NAME).exists(),
        ErrorKind::StoreNotFound,
        "path={:?}",
        from.as_ref()
    );
    track_assert!(
        is_consistent(&from),
        ErrorKind::InconsistentStore,
        "path={:?}",
        from.as_ref()
    );
    let destination = datastore_dir(&to);
    track_assert!(
        !destination.exists(),
        ErrorKind::StoreAlreadyExists,
        "path={:?}",
        to.as_ref()
    );

    track!(copy_datastore(&source, &destination))?;
    track!(ConsistencyMark::new(&destination).mark_clean())?;
    track!(consistency::sync_dir(to.as_ref()))?;
    Ok(())
}
