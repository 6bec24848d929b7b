use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use super::vm_region::VmRegion;
use crate::{ErrorKind, Result};

/// セグメントを構成するバッキングファイルのパスを返す.
///
/// ファイル名は`segment-000000`, `segment-000001`, ...となり、この順でアドレス空間に並べられる.
pub fn segment_file_path<P: AsRef<Path>>(dir: P, index: usize) -> PathBuf {
    dir.as_ref().join(format!("segment-{:06}", index))
}

/// セグメントの一部を担当するバッキングファイル.
#[derive(Debug)]
pub struct SegmentFile {
    file: File,
    offset: u64,
    len: u64,
}
impl SegmentFile {
    /// `len`バイトのファイルを新規に作成し、`region`内の`offset`の位置にマッピングする.
    ///
    /// 同名のファイルが既に存在する場合はエラーとなる.
    /// 作成後のサイズ設定やマッピングに失敗した場合には、作成したファイルは削除される.
    pub fn create<P: AsRef<Path>>(
        path: P,
        region: &VmRegion,
        offset: u64,
        len: u64,
    ) -> Result<Self> {
        let file = track_io!(OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path.as_ref()))?;
        let result = track_io!(file.set_len(len))
            .and_then(|()| track!(region.map_file(offset, len, &file, true)));
        if let Err(e) = result {
            let _ = fs::remove_file(path.as_ref());
            return Err(e);
        }
        Ok(SegmentFile { file, offset, len })
    }

    /// 既存のファイルを開き、`region`内の`offset`の位置にマッピングする.
    ///
    /// マッピングされるサイズはファイルのサイズとなる.
    pub fn open<P: AsRef<Path>>(
        path: P,
        region: &VmRegion,
        offset: u64,
        writable: bool,
    ) -> Result<Self> {
        let file = track_io!(OpenOptions::new()
            .read(true)
            .write(writable)
            .open(path.as_ref()))?;
        let len = track_io!(file.metadata())?.len();
        track_assert_ne!(
            len,
            0,
            ErrorKind::StorageCorrupted,
            "Empty segment file: {:?}",
            path.as_ref()
        );
        track!(region.map_file(offset, len, &file, writable))?;
        Ok(SegmentFile { file, offset, len })
    }

    /// このファイルがマッピングされているセグメント内の位置.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// ファイルのサイズ.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// ファイルのメタデータを含めて、内容をディスクに同期する.
    pub fn sync_all(&self) -> Result<()> {
        track_io!(self.file.sync_all())
    }
}
