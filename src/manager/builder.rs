use prometrics::metrics::MetricBuilder;
use slog::{Discard, Logger};
use std::fs::File;
use std::path::Path;
use uuid::Uuid;

use super::kernel::{datastore_dir, Kernel, HEADER_FILE_NAME};
use super::Manager;
use crate::metrics::ManagerMetrics;
use crate::segment::page_size;
use crate::{ErrorKind, Result};

/// デフォルトのチャンクサイズ (2MiB).
pub const DEFAULT_CHUNK_SIZE: u64 = 1 << 21;

/// 一回の割当で要求可能な最大サイズのデフォルト値 (1TiB).
pub const DEFAULT_MAX_SIZE: u64 = 1 << 40;

/// 予約する仮想アドレス空間のサイズのデフォルト値 (1TiB).
pub const DEFAULT_VM_RESERVE_SIZE: u64 = 1 << 40;

/// セグメントの初期サイズのデフォルト値 (256MiB).
pub const DEFAULT_INITIAL_SEGMENT_SIZE: u64 = 1 << 28;

/// `Manager`のビルダ.
#[derive(Debug, Clone)]
pub struct ManagerBuilder {
    pub(crate) chunk_size: u64,
    pub(crate) max_size: u64,
    pub(crate) vm_reserve_size: u64,
    pub(crate) initial_segment_size: u64,
    pub(crate) object_cache: Option<usize>,
    pub(crate) free_file_space: bool,
    pub(crate) exclusive_lock: bool,
    pub(crate) accept_inconsistent: bool,
    pub(crate) instance_uuid: Option<Uuid>,
    pub(crate) logger: Logger,
    pub(crate) metrics: MetricBuilder,
}
impl ManagerBuilder {
    /// 新しい`ManagerBuilder`インスタンスを生成する.
    pub fn new() -> Self {
        ManagerBuilder {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_size: DEFAULT_MAX_SIZE,
            vm_reserve_size: DEFAULT_VM_RESERVE_SIZE,
            initial_segment_size: DEFAULT_INITIAL_SEGMENT_SIZE,
            object_cache: None,
            free_file_space: true,
            exclusive_lock: true,
            accept_inconsistent: false,
            instance_uuid: None,
            logger: Logger::root(Discard, o!()),
            metrics: MetricBuilder::new(),
        }
    }

    /// チャンクサイズを設定する.
    ///
    /// ページサイズ以上の二の冪である必要があり、そうではない場合には作成時にエラーとなる.
    /// デフォルト値は`DEFAULT_CHUNK_SIZE`.
    ///
    /// ストアの新規作成時にのみ反映され、既存のストアを開く場合には作成時の値が使用される.
    pub fn chunk_size(&mut self, size: u64) -> &mut Self {
        self.chunk_size = size;
        self
    }

    /// 一回の割当で要求可能な最大サイズを設定する.
    ///
    /// ストアの新規作成時にのみ反映される.
    pub fn max_size(&mut self, size: u64) -> &mut Self {
        self.max_size = size;
        self
    }

    /// セグメント用に予約する仮想アドレス空間のサイズを設定する.
    ///
    /// セグメントはこのサイズを超えて拡張できない.
    /// 既存のストアを開く際に、保存済みのセグメントの方が大きい場合には、そちらのサイズが使われる.
    pub fn vm_reserve_size(&mut self, size: u64) -> &mut Self {
        self.vm_reserve_size = size;
        self
    }

    /// セグメントを最初に拡張する際の最小サイズを設定する.
    pub fn initial_segment_size(&mut self, size: u64) -> &mut Self {
        self.initial_segment_size = size;
        self
    }

    /// オブジェクトキャッシュを設定する.
    ///
    /// `Some(n)`の場合には、サイズクラス毎に最大`n`個の解放済みスロットがキャッシュされる.
    /// キャッシュを有効にすると、割当結果のオフセットは決定的ではなくなる.
    ///
    /// デフォルトは無効.
    pub fn object_cache(&mut self, capacity: Option<usize>) -> &mut Self {
        self.object_cache = capacity;
        self
    }

    /// 解放されたチャンクのファイル領域をファイルシステムに返却するかどうかを設定する.
    ///
    /// デフォルト値は`true`.
    pub fn free_file_space(&mut self, enabled: bool) -> &mut Self {
        self.free_file_space = enabled;
        self
    }

    /// ストアのファイルをロックするかどうかを設定する.
    ///
    /// 有効な場合、書き込み可能モードでは排他ロック、読み込み専用モードでは共有ロックを取得する.
    /// ロックの取得に失敗した場合には、オープン(または作成)がエラーとなる.
    ///
    /// デフォルト値は`true`.
    pub fn exclusive_lock(&mut self, enabled: bool) -> &mut Self {
        self.exclusive_lock = enabled;
        self
    }

    /// 正常にクローズされなかったストアのオープンを許可するかどうかを設定する.
    ///
    /// デフォルト値は`false`で、その場合には`ErrorKind::InconsistentStore`エラーとなる.
    pub fn accept_inconsistent(&mut self, enabled: bool) -> &mut Self {
        self.accept_inconsistent = enabled;
        self
    }

    /// ストアのインスタンスを識別するためのUUIDを設定する.
    ///
    /// - 作成時: ここで指定した値が識別子として採用される (未指定ならランダム)
    /// - オープン時: ストアの識別子と比較され、異なる場合にはオープンに失敗する
    pub fn instance_uuid(&mut self, uuid: Uuid) -> &mut Self {
        self.instance_uuid = Some(uuid);
        self
    }

    /// ロガーを設定する.
    pub fn logger(&mut self, logger: Logger) -> &mut Self {
        self.logger = logger;
        self
    }

    /// メトリクス用の共通設定を登録する.
    ///
    /// デフォルト値は`MetricBuilder::new()`.
    pub fn metrics(&mut self, metrics: MetricBuilder) -> &mut Self {
        self.metrics = metrics;
        self
    }

    /// 新しいストアを`path`に作成する.
    ///
    /// # Errors
    ///
    /// ストアが既に存在する場合には`ErrorKind::StoreAlreadyExists`エラーが返される.
    pub fn create<P: AsRef<Path>>(&self, path: P) -> Result<Manager> {
        track!(self.validate())?;
        let metrics = ManagerMetrics::new(&self.metrics);
        let kernel = track!(Kernel::create(&path, self, &metrics))?;
        Ok(Manager::new(path.as_ref(), kernel, false, metrics))
    }

    /// `path`の既存のストアを書き込み可能モードで開く.
    ///
    /// # Errors
    ///
    /// - ストアが存在しない場合には`ErrorKind::StoreNotFound`エラー
    /// - 正常にクローズされていない場合には`ErrorKind::InconsistentStore`エラー
    pub fn open<P: AsRef<Path>>(&self, path: P) -> Result<Manager> {
        track!(self.open_store(path, false))
    }

    /// `path`の既存のストアを読み込み専用モードで開く.
    ///
    /// このモードでは、ストアを変更する操作は全て`ErrorKind::InvalidInput`エラーとなる.
    pub fn open_read_only<P: AsRef<Path>>(&self, path: P) -> Result<Manager> {
        track!(self.open_store(path, true))
    }

    /// ストアが存在すれば開き、存在しなければ作成する.
    pub fn open_or_create<P: AsRef<Path>>(&self, path: P) -> Result<Manager> {
        if datastore_dir(&path).join(HEADER_FILE_NAME).exists() {
            track!(self.open(path))
        } else {
            track!(self.create(path))
        }
    }

    fn open_store<P: AsRef<Path>>(&self, path: P, read_only: bool) -> Result<Manager> {
        track!(self.validate())?;
        let metrics = ManagerMetrics::new(&self.metrics);
        let kernel = track!(Kernel::open(&path, self, read_only, &metrics))?;
        Ok(Manager::new(path.as_ref(), kernel, read_only, metrics))
    }

    fn validate(&self) -> Result<()> {
        track_assert!(
            self.chunk_size.is_power_of_two() && self.chunk_size >= page_size(),
            ErrorKind::InvalidInput,
            "chunk_size={}",
            self.chunk_size
        );
        track_assert!(
            self.vm_reserve_size >= self.chunk_size,
            ErrorKind::InvalidInput,
            "vm_reserve_size={}, chunk_size={}",
            self.vm_reserve_size,
            self.chunk_size
        );
        track_assert_ne!(self.object_cache, Some(0), ErrorKind::InvalidInput);
        Ok(())
    }

    #[cfg(unix)]
    pub(crate) fn lock_file(&self, file: &File, shared: bool) -> Result<()> {
        use std::io;
        use std::os::unix::io::AsRawFd;
        if self.exclusive_lock {
            let operation = if shared {
                libc::LOCK_SH
            } else {
                libc::LOCK_EX
            };
            if unsafe { libc::flock(file.as_raw_fd(), operation | libc::LOCK_NB) } != 0 {
                track_io!(Err(io::Error::last_os_error()))
            } else {
                Ok(())
            }
        } else {
            Ok(())
        }
    }
    #[cfg(not(unix))]
    pub(crate) fn lock_file(&self, _file: &File, _shared: bool) -> Result<()> {
        Ok(())
    }
}
impl Default for ManagerBuilder {
    fn default() -> Self {
        Self::new()
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
    fn invalid_parameters() -> TestResult {
        let dir = track_any_err!(TempDir::new("permheap_test"))?;

        let e = builder().chunk_size(3000).create(dir.path()).err();
        assert_eq!(e.map(|e| *e.kind()), Some(ErrorKind::InvalidInput));

        let e = builder().vm_reserve_size(1).create(dir.path()).err();
        assert_eq!(e.map(|e| *e.kind()), Some(ErrorKind::InvalidInput));

        let e = builder().object_cache(Some(0)).create(dir.path()).err();
        assert_eq!(e.map(|e| *e.kind()), Some(ErrorKind::InvalidInput));
        Ok(())
    }

    #[test]
    fn instance_uuid_works() -> TestResult {
        let dir = track_any_err!(TempDir::new("permheap_test"))?;
        let uuid = Uuid::new_v4();
        let manager = track!(builder().instance_uuid(uuid).create(dir.path()))?;
        assert_eq!(manager.header().instance_uuid, uuid);
        track!(manager.close())?;

        let e = builder()
            .instance_uuid(Uuid::new_v4())
            .open(dir.path())
            .err();
        assert_eq!(e.map(|e| *e.kind()), Some(ErrorKind::InvalidInput));

        let manager = track!(builder().instance_uuid(uuid).open(dir.path()))?;
        track!(manager.close())?;
        Ok(())
    }

    #[test]
    fn exclusive_lock_works() -> TestResult {
        let dir = track_any_err!(TempDir::new("permheap_test"))?;
        let manager = track!(builder().create(dir.path()))?;
        assert!(builder().open(dir.path()).is_err());
        assert!(builder().open_read_only(dir.path()).is_err());
        track!(manager.close())?;

        let reader0 = track!(builder().open_read_only(dir.path()))?;
        let reader1 = track!(builder().open_read_only(dir.path()))?;
        assert!(builder().open(dir.path()).is_err());
        track!(reader0.close())?;
        track!(reader1.close())?;
        Ok(())
    }

    #[test]
    fn open_or_create_works() -> TestResult {
        let dir = track_any_err!(TempDir::new("permheap_test"))?;
        let manager = track!(builder().open_or_create(dir.path()))?;
        let uuid = manager.header().instance_uuid;
        track!(manager.close())?;

        let manager = track!(builder().open_or_create(dir.path()))?;
        assert_eq!(manager.header().instance_uuid, uuid);
        track!(manager.close())?;
        Ok(())
    }
}
