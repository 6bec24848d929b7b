//! セグメント(アロケータが管理する連続領域)のバッキングストレージ.
//!
//! セグメントは、予約済みの仮想アドレス空間([VmRegion])と、
//! その先頭から隙間なく並べてマッピングされたファイル群から構成される.
//!
//! [VmRegion]: ./struct.VmRegion.html
use slog::Logger;
use std::path::{Path, PathBuf};

pub use self::file::{segment_file_path, SegmentFile};
pub use self::vm_region::{page_size, VmRegion};

use crate::{ErrorKind, Result};

mod file;
mod vm_region;

/// アロケータから見たバッキングストレージのインタフェース.
pub trait SegmentStorage {
    /// 現在の(バッキングが確保済みの)サイズ.
    fn size(&self) -> u64;

    /// 拡張可能な最大サイズ.
    fn capacity(&self) -> u64;

    /// サイズを`new_size`まで拡張する.
    ///
    /// 既存の領域のアドレスは変化しない.
    fn extend(&mut self, new_size: u64) -> Result<()>;

    /// 不要になった範囲のバッキングを解放する.
    ///
    /// 範囲の内容は不定となるが、アクセス自体は引き続き可能.
    fn release(&mut self, offset: u64, len: u64) -> Result<()>;
}

/// メモリマップドファイルを用いた`SegmentStorage`の実装.
#[derive(Debug)]
pub struct Segment {
    region: VmRegion,
    files: Vec<SegmentFile>,
    dir: PathBuf,
    size: u64,
    writable: bool,
    logger: Logger,
}
impl Segment {
    /// 空のセグメントを生成する.
    ///
    /// ファイルは最初の拡張時に作成される.
    pub fn create<P: AsRef<Path>>(dir: P, region: VmRegion, logger: Logger) -> Self {
        Segment {
            region,
            files: Vec::new(),
            dir: dir.as_ref().to_path_buf(),
            size: 0,
            writable: true,
            logger,
        }
    }

    /// `dir`内の既存のセグメントファイル群をマッピングする.
    pub fn open<P: AsRef<Path>>(
        dir: P,
        region: VmRegion,
        writable: bool,
        logger: Logger,
    ) -> Result<Self> {
        let mut files = Vec::new();
        let mut size = 0;
        loop {
            let path = segment_file_path(&dir, files.len());
            if !path.exists() {
                break;
            }
            let file = track!(SegmentFile::open(&path, &region, size, writable), "path={:?}", path)?;
            size += file.len();
            files.push(file);
        }
        debug!(logger, "Segment mapped";
               "files" => files.len(), "size" => size, "writable" => writable);
        Ok(Segment {
            region,
            files,
            dir: dir.as_ref().to_path_buf(),
            size,
            writable,
            logger,
        })
    }

    /// `dir`内のセグメントファイル群の合計サイズを返す.
    pub fn stored_size<P: AsRef<Path>>(dir: P) -> Result<u64> {
        let mut size = 0;
        for index in 0.. {
            let path = segment_file_path(&dir, index);
            if !path.exists() {
                break;
            }
            size += track_io!(path.metadata())?.len();
        }
        Ok(size)
    }

    /// セグメントの先頭アドレス.
    pub fn base(&self) -> *mut u8 {
        self.region.base()
    }

    /// セグメントを構成するファイルの数.
    pub fn num_files(&self) -> usize {
        self.files.len()
    }

    /// セグメントへの書き込みをディスクに同期する.
    pub fn sync(&self) -> Result<()> {
        if !self.writable {
            return Ok(());
        }
        track!(self.region.sync(0, self.size))?;
        for file in &self.files {
            track!(file.sync_all())?;
        }
        Ok(())
    }
}
impl SegmentStorage for Segment {
    fn size(&self) -> u64 {
        self.size
    }

    fn capacity(&self) -> u64 {
        self.region.size()
    }

    fn extend(&mut self, new_size: u64) -> Result<()> {
        track_assert!(self.writable, ErrorKind::InvalidInput, "Read-only segment");
        if new_size <= self.size {
            return Ok(());
        }
        track_assert!(
            new_size <= self.capacity(),
            ErrorKind::OutOfSpace,
            "new_size={}, capacity={}",
            new_size,
            self.capacity()
        );
        track_assert_eq!(new_size % page_size(), 0, ErrorKind::InvalidInput);

        let path = segment_file_path(&self.dir, self.files.len());
        let len = new_size - self.size;
        let file = track!(SegmentFile::create(&path, &self.region, self.size, len), "path={:?}", path)?;
        self.files.push(file);
        debug!(self.logger, "Segment extended";
               "old_size" => self.size, "new_size" => new_size, "files" => self.files.len());
        self.size = new_size;
        Ok(())
    }

    fn release(&mut self, offset: u64, len: u64) -> Result<()> {
        track_assert!(self.writable, ErrorKind::InvalidInput, "Read-only segment");
        track_assert!(offset + len <= self.size, ErrorKind::InvalidInput);
        track!(self.region.free_backing(offset, len))
    }
}
