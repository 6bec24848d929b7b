use slog::Logger;
use std::cmp;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use super::builder::ManagerBuilder;
use super::header::StoreHeader;
use crate::allocator::{AllocatorOptions, ChunkDirectory, SegmentAllocator};
use crate::consistency::{self, ConsistencyMark, MARK_FILE_NAME};
use crate::directory::{EntryKey, ObjectDirectory, ObjectEntry};
use crate::metrics::ManagerMetrics;
use crate::segment::{Segment, SegmentStorage, VmRegion};
use crate::size_class::SizeClassTable;
use crate::{ErrorKind, Result};

/// ストアのパス直下に作られる、データストア用ディレクトリの名前.
pub const DATASTORE_DIR_NAME: &str = "datastore";

/// ヘッダファイルの名前.
pub const HEADER_FILE_NAME: &str = "header";

/// チャンクディレクトリファイルの名前.
pub const CHUNK_DIRECTORY_FILE_NAME: &str = "chunk_directory";

/// オブジェクトディレクトリファイルの名前.
pub const OBJECT_DIRECTORY_FILE_NAME: &str = "object_directory";

/// ストアのパスから、データストア用ディレクトリのパスを求める.
pub fn datastore_dir<P: AsRef<Path>>(path: P) -> PathBuf {
    path.as_ref().join(DATASTORE_DIR_NAME)
}

/// `Manager`の内部状態.
///
/// 全ての操作は`Manager`が保持するロックの下で実行される.
#[derive(Debug)]
pub struct Kernel {
    allocator: SegmentAllocator,
    directory: ObjectDirectory,
    segment: Segment,
    datastore: PathBuf,
    mark: ConsistencyMark,
    header: StoreHeader,
    read_only: bool,
    closed: bool,
    _lock_file: File,
    logger: Logger,
}
impl Kernel {
    /// 新規にストアを作成する.
    pub fn create<P: AsRef<Path>>(
        path: P,
        builder: &ManagerBuilder,
        metrics: &ManagerMetrics,
    ) -> Result<Self> {
        let datastore = datastore_dir(&path);
        track_assert!(
            !datastore.exists(),
            ErrorKind::StoreAlreadyExists,
            "path={:?}",
            path.as_ref()
        );
        let table = track!(SizeClassTable::new(builder.chunk_size, builder.max_size))?;
        let header = StoreHeader::new(
            builder.instance_uuid.unwrap_or_else(Uuid::new_v4),
            &table,
        );

        // ディスクに触れる前に、アドレス空間を予約しておく
        let chunk_size = table.chunk_size();
        let region = track!(VmRegion::reserve(
            builder.vm_reserve_size / chunk_size * chunk_size,
            chunk_size
        ))?;
        let max_chunks = region.size() / chunk_size;
        let allocator = SegmentAllocator::new(
            table,
            max_chunks,
            allocator_options(builder),
            metrics.segment_allocator.clone(),
            metrics.bin.clone(),
        );

        track_io!(fs::create_dir_all(path.as_ref()))?;
        track_io!(fs::create_dir(&datastore))?;
        match Self::initialize(datastore.clone(), header, region, allocator, builder) {
            Ok(kernel) => {
                info!(kernel.logger, "Store created";
                      "path" => format!("{:?}", path.as_ref()),
                      "uuid" => kernel.header.instance_uuid.to_string(),
                      "chunk_size" => kernel.header.chunk_size);
                Ok(kernel)
            }
            Err(e) => {
                // 作りかけのデータストアは残さない
                if let Err(cleanup) = fs::remove_dir_all(&datastore) {
                    warn!(builder.logger, "Cannot remove the incomplete datastore: {}", cleanup;
                          "path" => format!("{:?}", datastore));
                }
                Err(track!(e))
            }
        }
    }

    // 新規に作成した空のデータストアに、ヘッダと空の管理データを書き込む.
    fn initialize(
        datastore: PathBuf,
        header: StoreHeader,
        region: VmRegion,
        allocator: SegmentAllocator,
        builder: &ManagerBuilder,
    ) -> Result<Self> {
        let lock_file = track_io!(OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(datastore.join(HEADER_FILE_NAME)))?;
        track!(builder.lock_file(&lock_file, false))?;
        track!(header.write_to(&lock_file))?;
        track_io!(lock_file.sync_all())?;

        let segment = Segment::create(&datastore, region, builder.logger.clone());
        let mark = ConsistencyMark::new(&datastore);

        // 初期化が完了するまでは、ドロップ時のクローズ処理を行わない
        let mut kernel = Kernel {
            allocator,
            directory: ObjectDirectory::new(),
            segment,
            datastore,
            mark,
            header,
            read_only: false,
            closed: true,
            _lock_file: lock_file,
            logger: builder.logger.clone(),
        };
        track!(kernel.save_management_data())?;
        if let Some(parent) = kernel.datastore.parent() {
            track!(consistency::sync_dir(parent))?;
        }
        kernel.closed = false;
        Ok(kernel)
    }

    /// 既存のストアを開く.
    pub fn open<P: AsRef<Path>>(
        path: P,
        builder: &ManagerBuilder,
        read_only: bool,
        metrics: &ManagerMetrics,
    ) -> Result<Self> {
        let datastore = datastore_dir(&path);
        let header_path = datastore.join(HEADER_FILE_NAME);
        track_assert!(
            header_path.exists(),
            ErrorKind::StoreNotFound,
            "path={:?}",
            path.as_ref()
        );

        let lock_file = track_io!(OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(&header_path))?;
        track!(builder.lock_file(&lock_file, read_only))?;
        let header = track!(StoreHeader::read_from(&lock_file))?;
        if let Some(expected_uuid) = builder.instance_uuid {
            track_assert_eq!(header.instance_uuid, expected_uuid, ErrorKind::InvalidInput);
        }
        let table = track!(header.size_class_table())?;

        let mark = ConsistencyMark::new(&datastore);
        if !mark.is_clean() {
            track_assert!(
                builder.accept_inconsistent,
                ErrorKind::InconsistentStore,
                "The store was not closed properly: path={:?}",
                path.as_ref()
            );
            warn!(builder.logger, "Opening an inconsistent store";
                  "path" => format!("{:?}", path.as_ref()));
        }

        let file = track_io!(File::open(datastore.join(CHUNK_DIRECTORY_FILE_NAME)))?;
        let mut chunks = track!(ChunkDirectory::read_from(BufReader::new(file), &table))?;
        let file = track_io!(File::open(datastore.join(OBJECT_DIRECTORY_FILE_NAME)))?;
        let directory = track!(ObjectDirectory::read_from(BufReader::new(file)))?;

        let chunk_size = table.chunk_size();
        let stored_size = track!(Segment::stored_size(&datastore))?;
        let reserve_size = cmp::max(
            builder.vm_reserve_size / chunk_size * chunk_size,
            (stored_size + chunk_size - 1) / chunk_size * chunk_size,
        )
        .max(chunk_size);
        let region = track!(VmRegion::reserve(reserve_size, chunk_size))?;
        track!(chunks.set_max_chunks(region.size() / chunk_size))?;

        let segment = track!(Segment::open(
            &datastore,
            region,
            !read_only,
            builder.logger.clone()
        ))?;
        let allocator = track!(SegmentAllocator::restore(
            table,
            chunks,
            segment.size(),
            allocator_options(builder),
            metrics.segment_allocator.clone(),
            metrics.bin.clone(),
        ))?;

        // マークを落とすのは、全ての読み込みが成功した後
        if !read_only {
            track!(mark.mark_dirty())?;
        }
        info!(builder.logger, "Store opened";
              "path" => format!("{:?}", path.as_ref()),
              "uuid" => header.instance_uuid.to_string(),
              "read_only" => read_only,
              "segment_size" => segment.size(),
              "objects" => directory.entries().count());
        Ok(Kernel {
            allocator,
            directory,
            segment,
            datastore,
            mark,
            header,
            read_only,
            closed: false,
            _lock_file: lock_file,
            logger: builder.logger.clone(),
        })
    }

    pub fn base(&self) -> *mut u8 {
        self.segment.base()
    }

    pub fn header(&self) -> &StoreHeader {
        &self.header
    }

    pub fn table(&self) -> &SizeClassTable {
        self.allocator.table()
    }

    pub fn directory(&self) -> &ObjectDirectory {
        &self.directory
    }

    pub fn segment_size(&self) -> u64 {
        self.segment.size()
    }

    pub fn reserved_size(&self) -> u64 {
        self.segment.capacity()
    }

    pub fn check_writable(&self) -> Result<()> {
        track_assert!(
            !self.read_only,
            ErrorKind::InvalidInput,
            "The store is opened in read-only mode"
        );
        track_assert!(!self.closed, ErrorKind::InvalidInput, "The store is closed");
        Ok(())
    }

    pub fn allocate(&mut self, size: u64, alignment: u64) -> Result<u64> {
        track!(self.check_writable())?;
        track!(self
            .allocator
            .allocate_aligned(&mut self.segment, size, alignment))
    }

    /// `offset`の領域を解放する.
    ///
    /// 匿名オブジェクトの場合には、ディレクトリからの削除も合わせて行う.
    /// 名前付きおよびユニークオブジェクトは、このメソッドでは解放できない.
    pub fn deallocate(&mut self, offset: u64) -> Result<()> {
        track!(self.check_writable())?;
        match self.directory.key_of(offset).cloned() {
            None => {}
            Some(key @ EntryKey::Anonymous(_)) => {
                track!(self.allocator.deallocate(&mut self.segment, offset))?;
                self.directory.remove(&key);
                return Ok(());
            }
            Some(key) => track_panic!(
                ErrorKind::InvalidInput,
                "Keyed objects must be released by `destroy`: key={:?}",
                key
            ),
        }
        track!(self.allocator.deallocate(&mut self.segment, offset))
    }

    /// ディレクトリから取り除き済みのオブジェクトの領域を解放する.
    pub fn deallocate_unregistered(&mut self, offset: u64) -> Result<()> {
        track!(self.check_writable())?;
        track!(self.allocator.deallocate(&mut self.segment, offset))
    }

    pub fn register(&mut self, key: EntryKey, entry: ObjectEntry) -> Result<()> {
        track!(self.check_writable())?;
        track!(self.directory.insert(key, entry))
    }

    pub fn unregister(&mut self, key: &EntryKey) -> Result<Option<ObjectEntry>> {
        track!(self.check_writable())?;
        Ok(self.directory.remove(key))
    }

    /// セグメントと管理データをディスクに同期する.
    ///
    /// 一貫性マークはダーティのまま.
    pub fn flush(&mut self) -> Result<()> {
        if self.read_only || self.closed {
            return Ok(());
        }
        track!(self.allocator.drain_cache(&mut self.segment))?;
        track!(self.save_management_data())?;
        track!(self.segment.sync())?;
        debug!(self.logger, "Store flushed"; "segment_size" => self.segment.size());
        Ok(())
    }

    /// 現在の内容のコピーを、クリーンな状態のストアとして`path`に作成する.
    pub fn snapshot<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        track!(self.check_writable())?;
        let destination = datastore_dir(&path);
        track_assert!(
            !destination.exists(),
            ErrorKind::StoreAlreadyExists,
            "path={:?}",
            path.as_ref()
        );
        track!(self.flush())?;
        track!(copy_datastore(&self.datastore, &destination))?;

        // スナップショットは別インスタンスとして扱う
        let mut header = self.header.clone();
        header.instance_uuid = Uuid::new_v4();
        let mut file = track_io!(File::create(destination.join(HEADER_FILE_NAME)))?;
        track!(header.write_to(&mut file))?;
        track_io!(file.sync_all())?;

        track!(ConsistencyMark::new(&destination).mark_clean())?;
        info!(self.logger, "Snapshot created";
              "path" => format!("{:?}", path.as_ref()),
              "uuid" => header.instance_uuid.to_string());
        Ok(())
    }

    /// ストアをクローズする.
    ///
    /// 書き込み可能モードの場合には、全ての管理データを永続化した上で、ストアをクリーンな状態にする.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if self.read_only {
            info!(self.logger, "Store closed"; "read_only" => true);
            return Ok(());
        }
        track!(self.allocator.drain_cache(&mut self.segment))?;
        track!(self.save_management_data())?;
        track!(self.segment.sync())?;
        track!(self.mark.mark_clean())?;
        info!(self.logger, "Store closed";
              "read_only" => false,
              "segment_size" => self.segment.size(),
              "used_chunks" => self.allocator.chunk_directory().num_used_chunks());
        Ok(())
    }

    fn save_management_data(&self) -> Result<()> {
        let chunks = self.allocator.chunk_directory();
        track!(write_file_atomically(
            &self.datastore,
            CHUNK_DIRECTORY_FILE_NAME,
            |w| chunks.write_to(w)
        ))?;
        track!(write_file_atomically(
            &self.datastore,
            OBJECT_DIRECTORY_FILE_NAME,
            |w| self.directory.write_to(w)
        ))?;
        track!(consistency::sync_dir(&self.datastore))
    }
}
impl Drop for Kernel {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(self.logger, "Cannot close the store: {}", e);
        }
    }
}

fn allocator_options(builder: &ManagerBuilder) -> AllocatorOptions {
    AllocatorOptions {
        initial_segment_size: builder.initial_segment_size,
        object_cache_capacity: builder.object_cache,
        free_file_space: builder.free_file_space,
    }
}

// 一時ファイルに書き込んでからリネームする.
fn write_file_atomically<F>(dir: &Path, name: &str, f: F) -> Result<()>
where
    F: FnOnce(&mut BufWriter<File>) -> Result<()>,
{
    let temp_path = dir.join(format!("{}.tmp", name));
    let file = track_io!(File::create(&temp_path))?;
    let mut writer = BufWriter::new(file);
    track!(f(&mut writer))?;
    track_io!(writer.flush())?;
    let file = track_io!(writer.into_inner().map_err(|e| e.into_error()))?;
    track_io!(file.sync_all())?;
    track_io!(fs::rename(&temp_path, dir.join(name)))?;
    Ok(())
}

/// データストア用ディレクトリの内容を`to`にコピーする.
///
/// 一貫性マークと一時ファイルはコピーされない.
pub fn copy_datastore(from: &Path, to: &Path) -> Result<()> {
    track_io!(fs::create_dir_all(to))?;
    for entry in track_io!(fs::read_dir(from))? {
        let entry = track_io!(entry)?;
        let name = entry.file_name();
        let skip = name == MARK_FILE_NAME
            || name.to_str().map_or(false, |s| s.ends_with(".tmp"));
        if skip || !track_io!(entry.file_type())?.is_file() {
            continue;
        }
        track_io!(fs::copy(entry.path(), to.join(&name)))?;
        let file = track_io!(File::open(to.join(&name)))?;
        track_io!(file.sync_all())?;
    }
    track!(consistency::sync_dir(to))
}

