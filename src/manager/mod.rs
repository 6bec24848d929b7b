//! 永続ヒープのマネージャ.
//!
//! [Manager]は、利用者が直接触る唯一の構造体であり、以下の機能を提供する:
//!
//! - ストアの作成・オープン・クローズ
//! - セグメント内の領域の割当・解放 (`allocate`, `deallocate`)
//! - キー付きオブジェクトの構築・検索・破棄 (`construct`, `find`, `destroy`)
//! - 永続化とスナップショット (`flush`, `snapshot`)
//! - ストア単位の管理操作 (`remove`, `consistent`, `copy`)
//!
//! 内部状態は一つのロックで保護されており、各操作は個別に不可分に実行される.
//!
//! [Manager]: ./struct.Manager.html
#[cfg(feature = "futures")]
use futures::sync::oneshot;
#[cfg(feature = "futures")]
use futures::{Async, Future, Poll};
use std::mem;
use std::path::{Path, PathBuf};
use std::ptr::{self, NonNull};
use std::slice;
use std::sync::{Mutex, MutexGuard};

pub use self::builder::ManagerBuilder;
pub use self::header::StoreHeader;

use self::kernel::Kernel;
use crate::collections::Persistent;
use crate::directory::{EntryKey, ObjectEntry};
use crate::metrics::ManagerMetrics;
use crate::size_class::SizeClassTable;
use crate::{Error, ErrorKind, Result};

mod admin;
mod builder;
mod header;
mod kernel;

/// オブジェクトを識別するためのキー.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key<'a> {
    /// 名前付きオブジェクト.
    ///
    /// 型に関わらず、一つの名前に対して一つのオブジェクトのみが登録可能.
    Named(&'a str),

    /// ユニークオブジェクト.
    ///
    /// 型自体がキーとなり、一つの型に対して一つのオブジェクトのみが登録可能.
    Unique,

    /// 匿名オブジェクト.
    ///
    /// `find`による検索はできず、`deallocate`でのみ解放される.
    Anonymous,
}
impl<'a> From<&'a str> for Key<'a> {
    fn from(f: &'a str) -> Self {
        Key::Named(f)
    }
}

/// 永続ヒープのマネージャ.
///
/// [モジュールドキュメント](index.html)も参照のこと.
///
/// セグメント内のオブジェクトへのポインタは、このインスタンスがクローズされるまでの間のみ有効.
/// 異なるセッション間では、同じオブジェクトが異なるアドレスに配置され得るため、
/// 永続的な参照には`to_offset`で得られるオフセットを使用すること.
#[derive(Debug)]
pub struct Manager {
    kernel: Mutex<Kernel>,
    base: usize,
    reserved: u64,
    path: PathBuf,
    read_only: bool,
    header: StoreHeader,
    table: SizeClassTable,
    metrics: ManagerMetrics,
}
impl Manager {
    /// デフォルト設定で、新しいストアを`path`に作成する.
    ///
    /// 設定を変更したい場合には`ManagerBuilder`を使用すること.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        track!(ManagerBuilder::new().create(path))
    }

    /// デフォルト設定で、`path`の既存のストアを開く.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        track!(ManagerBuilder::new().open(path))
    }

    /// デフォルト設定で、`path`の既存のストアを読み込み専用モードで開く.
    pub fn open_read_only<P: AsRef<Path>>(path: P) -> Result<Self> {
        track!(ManagerBuilder::new().open_read_only(path))
    }

    /// デフォルト設定で、ストアを開くか、存在しなければ作成する.
    pub fn open_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        track!(ManagerBuilder::new().open_or_create(path))
    }

    pub(crate) fn new(path: &Path, kernel: Kernel, read_only: bool, metrics: ManagerMetrics) -> Self {
        Manager {
            base: kernel.base() as usize,
            reserved: kernel.reserved_size(),
            path: path.to_path_buf(),
            read_only,
            header: kernel.header().clone(),
            table: kernel.table().clone(),
            metrics,
            kernel: Mutex::new(kernel),
        }
    }

    /// `size`バイトの領域を割り当てる.
    ///
    /// 返されるアドレスは、少なくとも8バイトにアラインされている.
    ///
    /// # Errors
    ///
    /// 空き領域が不足している場合には`ErrorKind::OutOfSpace`エラーが返される.
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>> {
        track!(self.allocate_aligned(size, 1))
    }

    /// `alignment`の倍数のアドレスに`size`バイトの領域を割り当てる.
    ///
    /// `alignment`は二冪かつチャンクサイズ以下である必要がある.
    pub fn allocate_aligned(&self, size: usize, alignment: usize) -> Result<NonNull<u8>> {
        let offset = {
            let mut kernel = track!(self.lock())?;
            track!(kernel.allocate(size as u64, alignment as u64))?
        };
        self.metrics.allocations.increment();
        Ok(self.pointer(offset))
    }

    /// `allocate`で割り当てた領域を解放する.
    ///
    /// `Key::Anonymous`で構築したオブジェクトもこのメソッドで解放する.
    /// なおデストラクタは実行されない.
    ///
    /// # Errors
    ///
    /// 割当済み領域の先頭ではないアドレスや、名前付き・ユニークオブジェクトのアドレスが指定された場合には
    /// `ErrorKind::InvalidInput`エラーが返される.
    pub fn deallocate(&self, ptr: NonNull<u8>) -> Result<()> {
        let offset = track_assert_some!(
            self.to_offset(ptr.as_ptr()),
            ErrorKind::InvalidInput,
            "Out of segment: ptr={:?}",
            ptr
        );
        track!(self.lock()?.deallocate(offset))?;
        self.metrics.deallocations.increment();
        Ok(())
    }

    /// `key`で識別されるオブジェクトを構築する.
    ///
    /// # Errors
    ///
    /// `key`に対応するオブジェクトが既に存在する場合には`ErrorKind::KeyAlreadyExists`エラーが返される.
    /// 名前付きオブジェクトの場合、既存のオブジェクトの型は問わない.
    pub fn construct<T: Persistent>(&self, key: Key, value: T) -> Result<NonNull<T>> {
        track!(self.construct_in_place(key, 1, |head| unsafe { ptr::write(head.as_ptr(), value) }))
    }

    /// `value`の複製を`count`個並べた配列オブジェクトを構築する.
    pub fn construct_array<T: Persistent + Clone>(
        &self,
        key: Key,
        count: usize,
        value: T,
    ) -> Result<NonNull<T>> {
        track!(self.construct_with(key, count, |_| value.clone()))
    }

    /// `i`番目の要素を`f(i)`で初期化した配列オブジェクトを構築する.
    pub fn construct_with<T, F>(&self, key: Key, count: usize, mut f: F) -> Result<NonNull<T>>
    where
        T: Persistent,
        F: FnMut(usize) -> T,
    {
        track!(self.construct_in_place(key, count, |head: NonNull<T>| {
            for i in 0..count {
                unsafe { ptr::write(head.as_ptr().add(i), f(i)) };
            }
        }))
    }

    /// `key`に対応するオブジェクトを検索し、存在しなければ構築する.
    ///
    /// オブジェクトが既に存在する場合には、`value`は無視される.
    pub fn find_or_construct<T: Persistent>(&self, key: Key, value: T) -> Result<NonNull<T>> {
        if let Some((ptr, _)) = track!(self.find::<T>(key))? {
            return Ok(ptr);
        }
        match self.construct(key, value) {
            Err(ref e) if *e.kind() == ErrorKind::KeyAlreadyExists => {
                // 他のスレッドが先に構築した
                let found = track!(self.find::<T>(key))?;
                let (ptr, _) = track_assert_some!(found, ErrorKind::KeyAlreadyExists, "key={:?}", key);
                Ok(ptr)
            }
            result => track!(result),
        }
    }

    /// 配列版の`find_or_construct`.
    ///
    /// オブジェクトが既に存在する場合には、`count`と`value`は無視され、既存の要素数が返される.
    pub fn find_or_construct_array<T: Persistent + Clone>(
        &self,
        key: Key,
        count: usize,
        value: T,
    ) -> Result<(NonNull<T>, usize)> {
        if let Some(found) = track!(self.find::<T>(key))? {
            return Ok(found);
        }
        match self.construct_array(key, count, value) {
            Err(ref e) if *e.kind() == ErrorKind::KeyAlreadyExists => {
                let found = track!(self.find::<T>(key))?;
                Ok(track_assert_some!(found, ErrorKind::KeyAlreadyExists, "key={:?}", key))
            }
            result => track!(result).map(|ptr| (ptr, count)),
        }
    }

    /// `key`に対応するオブジェクトを検索する.
    ///
    /// 結果は、オブジェクトの先頭を指すポインタと要素数のペア.
    ///
    /// 以下の場合には`None`が返される:
    ///
    /// - `key`に対応するオブジェクトが存在しない
    /// - オブジェクトの型が`T`ではない
    /// - `key`が`Key::Anonymous`
    pub fn find<T: Persistent>(&self, key: Key) -> Result<Option<(NonNull<T>, usize)>> {
        let entry_key = match keyed_entry::<T>(key) {
            None => return Ok(None),
            Some(k) => k,
        };
        let kernel = track!(self.lock())?;
        match kernel.directory().get(&entry_key) {
            Some(entry) if entry.type_tag == type_tag::<T>() => Ok(Some((
                self.pointer(entry.offset).cast(),
                entry.length as usize,
            ))),
            _ => Ok(None),
        }
    }

    /// `key`に対応するオブジェクトを破棄する.
    ///
    /// 各要素に対して`Persistent::release`とデストラクタが実行された後に、領域が解放される.
    ///
    /// オブジェクトが存在しない場合や、型が一致しない場合、`Key::Anonymous`が指定された場合には`false`が返される.
    pub fn destroy<T: Persistent>(&self, key: Key) -> Result<bool> {
        let entry_key = match keyed_entry::<T>(key) {
            None => return Ok(false),
            Some(k) => k,
        };
        let entry = {
            let mut kernel = track!(self.lock())?;
            track!(kernel.check_writable())?;
            match kernel.directory().get(&entry_key) {
                Some(entry) if entry.type_tag == type_tag::<T>() => {}
                _ => return Ok(false),
            }
            let entry = track!(kernel.unregister(&entry_key))?;
            track_assert_some!(entry, ErrorKind::InconsistentState)
        };

        // `release`に失敗した要素があっても、残りの後始末と領域の解放は行う
        let head = self.pointer(entry.offset).cast::<T>();
        let elements = unsafe { slice::from_raw_parts_mut(head.as_ptr(), entry.length as usize) };
        let mut released = Ok(());
        for x in elements.iter_mut() {
            if let Err(e) = x.release(self) {
                if released.is_ok() {
                    released = Err(track!(e));
                }
            }
        }
        unsafe { ptr::drop_in_place(elements) };

        track!(self.lock()?.deallocate_unregistered(entry.offset))?;
        self.metrics.deallocations.increment();
        self.metrics.object_directory.destroyed_objects.increment();
        track!(released)?;
        Ok(true)
    }

    /// セグメントと管理データをディスクに同期する.
    ///
    /// ストアは引き続き「正常にクローズされていない」状態のまま.
    /// 読み込み専用モードでは何もしない.
    pub fn flush(&self) -> Result<()> {
        track!(self.lock()?.flush())?;
        self.metrics.flushes.increment();
        Ok(())
    }

    /// 現在の内容を、クリーンな状態の別ストアとして`path`に複製する.
    ///
    /// 複製には新しいインスタンスUUIDが割り当てられる.
    pub fn snapshot<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        track!(self.lock()?.snapshot(path))
    }

    /// ストアをクローズする.
    ///
    /// 書き込み可能モードで開いていた場合には、全ての管理データが永続化され、
    /// ストアは「正常にクローズされた」状態となる.
    ///
    /// クローズせずにインスタンスが破棄された場合にも同様の処理が行われるが、その際のエラーはログ出力のみとなる.
    pub fn close(self) -> Result<()> {
        let mut kernel = track!(self.kernel.into_inner().map_err(Error::from))?;
        track!(kernel.close())
    }

    /// `path`のストアを削除する.
    ///
    /// ストアが存在しなかった場合には`false`が返される.
    pub fn remove<P: AsRef<Path>>(path: P) -> Result<bool> {
        track!(admin::remove_store(path))
    }

    /// `path`のストアが正常にクローズされた状態かどうかを判定する.
    ///
    /// ストアが存在しない場合には`false`が返される.
    pub fn consistent<P: AsRef<Path>>(path: P) -> bool {
        admin::is_consistent(path)
    }

    /// 正常にクローズされたストアを`from`から`to`に複製する.
    pub fn copy<P: AsRef<Path>, Q: AsRef<Path>>(from: P, to: Q) -> Result<()> {
        track!(admin::copy_store(from, to))
    }

    /// `copy`を別スレッドで実行する.
    #[cfg(feature = "futures")]
    pub fn copy_async<P: AsRef<Path>, Q: AsRef<Path>>(from: P, to: Q) -> AsyncResult<()> {
        let from = from.as_ref().to_path_buf();
        let to = to.as_ref().to_path_buf();
        AsyncResult::spawn(move || track!(admin::copy_store(from, to)))
    }

    /// `remove`を別スレッドで実行する.
    #[cfg(feature = "futures")]
    pub fn remove_async<P: AsRef<Path>>(path: P) -> AsyncResult<bool> {
        let path = path.as_ref().to_path_buf();
        AsyncResult::spawn(move || track!(admin::remove_store(path)))
    }

    /// ポインタを、セグメント先頭からのオフセットに変換する.
    ///
    /// ポインタがセグメント用の予約領域外を指している場合には`None`が返される.
    pub fn to_offset(&self, ptr: *const u8) -> Option<u64> {
        let address = ptr as usize;
        if address < self.base {
            return None;
        }
        let offset = (address - self.base) as u64;
        if offset < self.reserved {
            Some(offset)
        } else {
            None
        }
    }

    /// オフセットを、現在のセッションでのポインタに変換する.
    pub fn from_offset(&self, offset: u64) -> Option<NonNull<u8>> {
        if offset < self.reserved {
            Some(self.pointer(offset))
        } else {
            None
        }
    }

    /// セグメントの先頭アドレスを返す.
    pub fn base_address(&self) -> *mut u8 {
        self.base as *mut u8
    }

    /// セグメントの現在のサイズを返す.
    pub fn segment_size(&self) -> Result<u64> {
        Ok(track!(self.lock())?.segment_size())
    }

    /// ストアのヘッダを返す.
    pub fn header(&self) -> &StoreHeader {
        &self.header
    }

    /// ストアが使用しているサイズクラステーブルを返す.
    pub fn size_class_table(&self) -> &SizeClassTable {
        &self.table
    }

    /// 名前付きオブジェクトの数を返す.
    pub fn num_named_objects(&self) -> Result<usize> {
        Ok(track!(self.lock())?.directory().num_named())
    }

    /// ユニークオブジェクトの数を返す.
    pub fn num_unique_objects(&self) -> Result<usize> {
        Ok(track!(self.lock())?.directory().num_unique())
    }

    /// 匿名オブジェクトの数を返す.
    pub fn num_anonymous_objects(&self) -> Result<usize> {
        Ok(track!(self.lock())?.directory().num_anonymous())
    }

    /// 名前付きオブジェクトの一覧を、名前の昇順で返す.
    pub fn named_objects(&self) -> Result<Vec<(String, ObjectEntry)>> {
        let kernel = track!(self.lock())?;
        Ok(kernel
            .directory()
            .named()
            .map(|(name, entry)| (name.to_owned(), entry.clone()))
            .collect())
    }

    /// ストアのパスを返す.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 読み込み専用モードで開かれているかどうか.
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// メトリクスを返す.
    pub fn metrics(&self) -> &ManagerMetrics {
        &self.metrics
    }

    fn lock(&self) -> Result<MutexGuard<Kernel>> {
        track!(self.kernel.lock().map_err(Error::from))
    }

    fn pointer(&self, offset: u64) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked((self.base + offset as usize) as *mut u8) }
    }

    fn construct_in_place<T, F>(&self, key: Key, count: usize, init: F) -> Result<NonNull<T>>
    where
        T: Persistent,
        F: FnOnce(NonNull<T>),
    {
        // 領域の確保
        let offset = {
            let mut kernel = track!(self.lock())?;
            track!(kernel.check_writable())?;
            if let Some(entry_key) = keyed_entry::<T>(key) {
                if kernel.directory().contains(&entry_key) {
                    self.metrics.object_directory.key_conflicts.increment();
                    track_panic!(ErrorKind::KeyAlreadyExists, "key={:?}", key);
                }
            }
            let size = track_assert_some!(
                mem::size_of::<T>().checked_mul(count),
                ErrorKind::InvalidInput,
                "Too many elements: count={}",
                count
            );
            track!(kernel.allocate(size.max(1) as u64, mem::align_of::<T>() as u64))?
        };
        self.metrics.allocations.increment();

        // 初期化はロックの外で行う
        let head = self.pointer(offset).cast::<T>();
        init(head);

        // 登録
        let entry_key = keyed_entry::<T>(key).unwrap_or(EntryKey::Anonymous(offset));
        let entry = ObjectEntry {
            type_tag: type_tag::<T>(),
            offset,
            length: count as u64,
        };
        let mut kernel = track!(self.lock())?;
        if let Err(e) = kernel.register(entry_key, entry) {
            if *e.kind() == ErrorKind::KeyAlreadyExists {
                self.metrics.object_directory.key_conflicts.increment();
            }
            unsafe { ptr::drop_in_place(slice::from_raw_parts_mut(head.as_ptr(), count)) };
            track!(kernel.deallocate_unregistered(offset))?;
            self.metrics.deallocations.increment();
            return Err(track!(e));
        }
        self.metrics.object_directory.constructed_objects.increment();
        Ok(head)
    }
}

// 型タグには`std::any::type_name`を用いる.
//
// この文字列はコンパイラのバージョン間で同一であることが保証されていないため、
// ストアを作成した時とは異なるツールチェインでビルドした場合には、
// `Key::Unique`や型付きの`find`が既存のオブジェクトを見つけられなくなる可能性がある.
fn type_tag<T>() -> String {
    std::any::type_name::<T>().to_owned()
}

fn keyed_entry<T>(key: Key) -> Option<EntryKey> {
    match key {
        Key::Named(name) => Some(EntryKey::Named(name.to_owned())),
        Key::Unique => Some(EntryKey::Unique(type_tag::<T>())),
        Key::Anonymous => None,
    }
}

/// 非同期に実行される管理操作の結果.
#[cfg(feature = "futures")]
#[derive(Debug)]
pub struct AsyncResult<T>(oneshot::Receiver<Result<T>>);
#[cfg(feature = "futures")]
impl<T: Send + 'static> AsyncResult<T> {
    fn spawn<F>(f: F) -> Self
    where
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        std::thread::spawn(move || {
            let _ = tx.send(f());
        });
        AsyncResult(rx)
    }
}
#[cfg(feature = "futures")]
impl<T> Future for AsyncResult<T> {
    type Item = T;
    type Error = Error;
    fn poll(&mut self) -> Poll<Self::Item, Self::Error> {
        match self.0.poll() {
            Ok(Async::NotReady) => Ok(Async::NotReady),
            Ok(Async::Ready(result)) => track!(result).map(Async::Ready),
            Err(_) => track_panic!(ErrorKind::InconsistentState, "Worker thread terminated"),
        }
    }
}

#[cfg(test)]
mod tests {
    use tempdir::TempDir;
    use trackable::result::TestResult;

    use super::*;

    fn builder() -> ManagerBuilder {
        let mut builder = ManagerBuilder::new();
        builder
            .chunk_size(1 << 16)
            .vm_reserve_size(1 << 30)
            .initial_segment_size(1 << 20);
        builder
    }

    #[test]
    fn allocate_and_deallocate() -> TestResult {
        let dir = track_any_err!(TempDir::new("permheap_test"))?;
        let manager = track!(builder().create(dir.path()))?;

        let p = track!(manager.allocate(100))?;
        assert_eq!(p.as_ptr() as usize % 8, 0);
        assert_eq!(manager.to_offset(p.as_ptr()), Some(0));
        assert_eq!(manager.from_offset(0), Some(p));
        unsafe { ptr::write_bytes(p.as_ptr(), 0xFF, 100) };

        let q = track!(manager.allocate_aligned(100, 256))?;
        assert_eq!(q.as_ptr() as usize % 256, 0);

        track!(manager.deallocate(p))?;
        track!(manager.deallocate(q))?;
        assert!(manager.deallocate(p).is_err());
        assert_eq!(manager.metrics().allocations(), 2);
        assert_eq!(manager.metrics().deallocations(), 2);

        let outside = unsafe { NonNull::new_unchecked(8 as *mut u8) };
        assert_eq!(
            manager.deallocate(outside).err().map(|e| *e.kind()),
            Some(ErrorKind::InvalidInput)
        );
        track!(manager.close())?;
        Ok(())
    }

    #[test]
    fn construct_find_destroy() -> TestResult {
        let dir = track_any_err!(TempDir::new("permheap_test"))?;
        let manager = track!(builder().create(dir.path()))?;

        let p = track!(manager.construct(Key::Named("foo"), 10u64))?;
        assert_eq!(unsafe { *p.as_ptr() }, 10);
        assert_eq!(
            manager
                .construct(Key::Named("foo"), 1u8)
                .err()
                .map(|e| *e.kind()),
            Some(ErrorKind::KeyAlreadyExists)
        );
        assert_eq!(manager.metrics().object_directory().key_conflicts(), 1);

        let (q, count) = track!(manager.find::<u64>(Key::Named("foo")))?.expect("Not found");
        assert_eq!((q, count), (p, 1));
        assert!(track!(manager.find::<u32>(Key::Named("foo")))?.is_none());
        assert!(track!(manager.find::<u64>(Key::Named("bar")))?.is_none());

        let a = track!(manager.construct_with(Key::Named("bar"), 5, |i| i as u32 * 2))?;
        let a = unsafe { slice::from_raw_parts(a.as_ptr(), 5) };
        assert_eq!(a, &[0, 2, 4, 6, 8]);

        assert!(!track!(manager.destroy::<u32>(Key::Named("foo")))?);
        assert!(track!(manager.destroy::<u64>(Key::Named("foo")))?);
        assert!(!track!(manager.destroy::<u64>(Key::Named("foo")))?);
        assert_eq!(track!(manager.num_named_objects())?, 1);

        let names = track!(manager.named_objects())?;
        assert_eq!(names.len(), 1);
        assert_eq!(names[0].0, "bar");
        assert_eq!(names[0].1.length, 5);
        track!(manager.close())?;
        Ok(())
    }

    #[test]
    fn unique_and_anonymous_objects() -> TestResult {
        let dir = track_any_err!(TempDir::new("permheap_test"))?;
        let manager = track!(builder().create(dir.path()))?;

        track!(manager.construct(Key::Unique, 1u32))?;
        assert!(manager.construct(Key::Unique, 2u32).is_err());
        track!(manager.construct(Key::Unique, 3u64))?;
        assert_eq!(track!(manager.num_unique_objects())?, 2);

        let p = track!(manager.construct(Key::Anonymous, 4u32))?;
        let q = track!(manager.construct(Key::Anonymous, 4u32))?;
        assert_ne!(p, q);
        assert_eq!(track!(manager.num_anonymous_objects())?, 2);
        assert!(track!(manager.find::<u32>(Key::Anonymous))?.is_none());
        assert!(!track!(manager.destroy::<u32>(Key::Anonymous))?);

        track!(manager.deallocate(p.cast()))?;
        assert_eq!(track!(manager.num_anonymous_objects())?, 1);

        let (u, _) = track!(manager.find::<u32>(Key::Unique))?.expect("Not found");
        assert_eq!(
            manager.deallocate(u.cast()).err().map(|e| *e.kind()),
            Some(ErrorKind::InvalidInput)
        );
        track!(manager.close())?;
        Ok(())
    }

    #[test]
    fn find_or_construct_ignores_value() -> TestResult {
        let dir = track_any_err!(TempDir::new("permheap_test"))?;
        let manager = track!(builder().create(dir.path()))?;

        let p = track!(manager.find_or_construct(Key::Named("n"), 1i64))?;
        let q = track!(manager.find_or_construct(Key::Named("n"), 2i64))?;
        assert_eq!(p, q);
        assert_eq!(unsafe { *q.as_ptr() }, 1);

        let (a, n) = track!(manager.find_or_construct_array(Key::Named("a"), 3, 7u8))?;
        let (b, m) = track!(manager.find_or_construct_array(Key::Named("a"), 10, 8u8))?;
        assert_eq!((a, n), (b, m));
        assert_eq!(unsafe { slice::from_raw_parts(b.as_ptr(), m) }, &[7, 7, 7]);
        track!(manager.close())?;
        Ok(())
    }

    #[test]
    fn destroy_frees_storage_even_if_release_fails() -> TestResult {
        struct Faulty(u64);
        unsafe impl Persistent for Faulty {
            fn release(&mut self, _manager: &Manager) -> Result<()> {
                track_panic!(ErrorKind::InvalidInput, "value={}", self.0);
            }
        }

        let dir = track_any_err!(TempDir::new("permheap_test"))?;
        let manager = track!(builder().create(dir.path()))?;

        let p = track!(manager.construct(Key::Named("faulty"), Faulty(1)))?;
        let offset = manager.to_offset(p.as_ptr() as *const u8);
        assert_eq!(
            manager
                .destroy::<Faulty>(Key::Named("faulty"))
                .err()
                .map(|e| *e.kind()),
            Some(ErrorKind::InvalidInput)
        );
        assert!(track!(manager.find::<Faulty>(Key::Named("faulty")))?.is_none());
        assert_eq!(manager.metrics().deallocations(), 1);

        // 解放されたスロットが再利用される
        let q = track!(manager.allocate(8))?;
        assert_eq!(manager.to_offset(q.as_ptr()), offset);
        track!(manager.close())?;
        Ok(())
    }

    #[test]
    fn manager_is_send_and_sync() {
        fn check<T: Send + Sync>() {}
        check::<Manager>();
    }
}
