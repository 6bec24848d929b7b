//! ストアが正常にクローズされたかどうかを示すマーク.
//!
//! マークファイルが存在すれば「クリーン」、存在しなければ「ダーティ」.
//!
//! ```text
//! Clean --(書き込み可能モードでオープン)--> Dirty --(正常クローズ)--> Clean
//! ```
//!
//! 読み込み専用のオープンではマークに触れない.
//! また`flush`はデータを永続化するが、マークはダーティのまま残す.
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};

use crate::Result;

/// マークファイルの名前.
pub const MARK_FILE_NAME: &str = "properly_closed_mark";

/// 一貫性マーク.
#[derive(Debug, Clone)]
pub struct ConsistencyMark {
    dir: PathBuf,
}
impl ConsistencyMark {
    /// `dir`ディレクトリ内のマークを扱うインスタンスを生成する.
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        ConsistencyMark {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// マークファイルのパス.
    pub fn path(&self) -> PathBuf {
        self.dir.join(MARK_FILE_NAME)
    }

    /// ストアがクリーンな状態かどうか.
    pub fn is_clean(&self) -> bool {
        self.path().exists()
    }

    /// ストアをクリーンな状態にする.
    ///
    /// マークファイルとディレクトリエントリの両方が永続化されてから返る.
    pub fn mark_clean(&self) -> Result<()> {
        let file = track_io!(OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.path()))?;
        track_io!(file.sync_all())?;
        track!(sync_dir(&self.dir))
    }

    /// ストアをダーティな状態にする.
    pub fn mark_dirty(&self) -> Result<()> {
        match fs::remove_file(self.path()) {
            Ok(()) => {}
            Err(ref e) if e.kind() == IoErrorKind::NotFound => return Ok(()),
            Err(e) => return track_io!(Err(e)),
        }
        track!(sync_dir(&self.dir))
    }
}

/// ディレクトリ自体のメタデータ(エントリの追加・削除)をディスクに同期する.
pub fn sync_dir<P: AsRef<Path>>(dir: P) -> Result<()> {
    let dir = track_io!(File::open(dir.as_ref()))?;
    track_io!(dir.sync_all())
}
