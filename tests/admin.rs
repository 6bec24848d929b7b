extern crate futures;
extern crate permheap;
extern crate tempdir;
#[macro_use]
extern crate trackable;

use futures::Future;
use permheap::{ErrorKind, Key, Manager, ManagerBuilder};
use tempdir::TempDir;
use trackable::result::TestResult;

fn builder() -> ManagerBuilder {
    let mut builder = ManagerBuilder::new();
    builder
        .chunk_size(1 << 16)
        .vm_reserve_size(1 << 30)
        .initial_segment_size(1 << 20);
    builder
}

fn create_store(path: &std::path::Path, value: u64) -> permheap::Result<()> {
    let manager = track!(builder().create(path))?;
    track!(manager.construct(Key::Named("value"), value))?;
    track!(manager.close())
}

fn read_value(path: &std::path::Path) -> permheap::Result<Option<u64>> {
    let manager = track!(builder().open_read_only(path))?;
    let value = track!(manager.find::<u64>(Key::Named("value")))?
        .map(|(p, _)| unsafe { *p.as_ptr() });
    track!(manager.close())?;
    Ok(value)
}

#[test]
fn snapshot_works() -> TestResult {
    let dir = track_any_err!(TempDir::new("permheap_test"))?;
    let src = dir.path().join("src");
    let dst = dir.path().join("dst");

    let manager = track!(builder().create(&src))?;
    track!(manager.construct(Key::Named("value"), 10u64))?;
    track!(manager.snapshot(&dst))?;
    assert!(Manager::consistent(&dst));
    assert!(!Manager::consistent(&src));

    let e = manager.snapshot(&dst).err();
    assert_eq!(e.map(|e| *e.kind()), Some(ErrorKind::StoreAlreadyExists));

    let uuid = manager.header().instance_uuid;
    track!(manager.close())?;

    let snapshot = track!(builder().open(&dst))?;
    assert_ne!(snapshot.header().instance_uuid, uuid);
    let (p, _) = track!(snapshot.find::<u64>(Key::Named("value")))?.expect("Not found");
    assert_eq!(unsafe { *p.as_ptr() }, 10);
    track!(snapshot.close())?;
    Ok(())
}

#[test]
fn copy_works() -> TestResult {
    let dir = track_any_err!(TempDir::new("permheap_test"))?;
    let src = dir.path().join("src");
    let dst = dir.path().join("dst");
    track!(create_store(&src, 20))?;

    track!(Manager::copy(&src, &dst))?;
    assert!(Manager::consistent(&dst));
    assert_eq!(track!(read_value(&dst))?, Some(20));

    let e = Manager::copy(&src, &dst).err();
    assert_eq!(e.map(|e| *e.kind()), Some(ErrorKind::StoreAlreadyExists));

    let e = Manager::copy(dir.path().join("foo"), dir.path().join("bar")).err();
    assert_eq!(e.map(|e| *e.kind()), Some(ErrorKind::StoreNotFound));

    // 開いている(ダーティな)ストアはコピーできない
    let manager = track!(builder().open(&src))?;
    let e = Manager::copy(&src, dir.path().join("other")).err();
    assert_eq!(e.map(|e| *e.kind()), Some(ErrorKind::InconsistentStore));
    track!(manager.close())?;
    Ok(())
}

#[test]
fn remove_works() -> TestResult {
    let dir = track_any_err!(TempDir::new("permheap_test"))?;
    let path = dir.path().join("store");
    track!(create_store(&path, 30))?;

    let manager = track!(builder().open(&path))?;
    assert!(Manager::remove(&path).is_err());
    track!(manager.close())?;

    assert!(track!(Manager::remove(&path))?);
    assert!(!path.exists());
    assert!(!track!(Manager::remove(&path))?);
    assert!(!Manager::consistent(&path));
    Ok(())
}

#[test]
fn async_operations_work() -> TestResult {
    let dir = track_any_err!(TempDir::new("permheap_test"))?;
    let src = dir.path().join("src");
    let dst = dir.path().join("dst");
    track!(create_store(&src, 40))?;

    track!(Manager::copy_async(&src, &dst).wait())?;
    assert_eq!(track!(read_value(&dst))?, Some(40));

    assert!(track!(Manager::remove_async(&dst).wait())?);
    assert!(!track!(Manager::remove_async(&dst).wait())?);

    let e = Manager::copy_async(&dst, &src).wait().err();
    assert_eq!(e.map(|e| *e.kind()), Some(ErrorKind::StoreNotFound));
    Ok(())
}
