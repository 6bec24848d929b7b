//! 複数の参加者(プロセスやスレッド)で、ストアを分割して保持するための層.
//!
//! 各参加者は、共通のベースディレクトリ配下にある自分専用のサブディレクトリに、
//! 独立したストアを持つ:
//!
//! ```text
//! <base>/permheap_partitioned/subdir-0
//! <base>/permheap_partitioned/subdir-1
//! ...
//! ```
//!
//! 参加者間の同期は[ProcessGroup]トレイトを通して行われる.
//! 同期に失敗した場合には、グループ全体が中断される.
//!
//! [ProcessGroup]: ./trait.ProcessGroup.html
use slog::Logger;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Barrier};

use crate::manager::{Manager, ManagerBuilder};
use crate::Result;

/// 全参加者のストアを格納するディレクトリの名前.
pub const TOP_LEVEL_DIR_NAME: &str = "permheap_partitioned";

/// 参加者のグループ.
pub trait ProcessGroup {
    /// グループ内での自分の番号 (`0`から`size() - 1`).
    fn rank(&self) -> usize;

    /// グループの参加者数.
    fn size(&self) -> usize;

    /// 全ての参加者がこの地点に到達するまで待機する.
    fn barrier(&self) -> Result<()>;

    /// グループ全体を中断する.
    fn abort(&self, reason: &str) -> !;
}

/// 同一プロセス内のスレッド群を参加者とする`ProcessGroup`の実装.
#[derive(Debug, Clone)]
pub struct ThreadGroup {
    rank: usize,
    size: usize,
    barrier: Arc<Barrier>,
}
impl ThreadGroup {
    /// `size`人分の参加者を生成する.
    ///
    /// 結果の`i`番目の要素のランクは`i`となる.
    pub fn new_group(size: usize) -> Vec<Self> {
        let barrier = Arc::new(Barrier::new(size));
        (0..size)
            .map(|rank| ThreadGroup {
                rank,
                size,
                barrier: Arc::clone(&barrier),
            })
            .collect()
    }
}
impl ProcessGroup for ThreadGroup {
    fn rank(&self) -> usize {
        self.rank
    }
    fn size(&self) -> usize {
        self.size
    }
    fn barrier(&self) -> Result<()> {
        self.barrier.wait();
        Ok(())
    }
    fn abort(&self, reason: &str) -> ! {
        panic!("Thread group aborted: rank={}, reason={}", self.rank, reason)
    }
}

/// 参加者毎にストアを分割して保持するマネージャ.
///
/// インスタンスの破棄時(または`close`時)には、ローカルのストアをクローズした後に、
/// 全参加者の間で同期が取られる.
#[derive(Debug)]
pub struct PartitionedManager<G: ProcessGroup> {
    manager: Option<Manager>,
    group: G,
    local_dir: PathBuf,
    logger: Logger,
}
impl<G: ProcessGroup> PartitionedManager<G> {
    /// 各参加者のストアを新規に作成する.
    pub fn create<P: AsRef<Path>>(builder: &ManagerBuilder, base: P, group: G) -> Result<Self> {
        setup_top_level_dir(&base, &group, &builder.logger);
        track!(Self::start(builder, base, group, |b, dir| b.create(dir)))
    }

    /// 各参加者の既存のストアを開く.
    pub fn open<P: AsRef<Path>>(builder: &ManagerBuilder, base: P, group: G) -> Result<Self> {
        track!(Self::start(builder, base, group, |b, dir| b.open(dir)))
    }

    /// 各参加者の既存のストアを読み込み専用モードで開く.
    pub fn open_read_only<P: AsRef<Path>>(
        builder: &ManagerBuilder,
        base: P,
        group: G,
    ) -> Result<Self> {
        track!(Self::start(builder, base, group, |b, dir| b.open_read_only(dir)))
    }

    /// 各参加者のストアを開き、存在しなければ作成する.
    pub fn open_or_create<P: AsRef<Path>>(
        builder: &ManagerBuilder,
        base: P,
        group: G,
    ) -> Result<Self> {
        setup_top_level_dir(&base, &group, &builder.logger);
        track!(Self::start(builder, base, group, |b, dir| b.open_or_create(dir)))
    }

    // ローカルのストアを開く.
    //
    // 失敗した参加者も、他の参加者のクローズ時の同期には参加してからエラーを返す.
    fn start<P, F>(builder: &ManagerBuilder, base: P, group: G, f: F) -> Result<Self>
    where
        P: AsRef<Path>,
        F: FnOnce(&ManagerBuilder, &Path) -> Result<Manager>,
    {
        let local_dir = local_dir_path(&base, &group);
        match f(builder, &local_dir) {
            Ok(manager) => Ok(Self::new(manager, group, local_dir, builder.logger.clone())),
            Err(e) => {
                error!(builder.logger, "Cannot open the local store: {}", e;
                       "rank" => group.rank(),
                       "local_dir" => format!("{:?}", local_dir));
                synchronize(&group, &builder.logger);
                Err(track!(e))
            }
        }
    }

    fn new(manager: Manager, group: G, local_dir: PathBuf, logger: Logger) -> Self {
        info!(logger, "Partitioned store opened";
              "rank" => group.rank(), "size" => group.size(),
              "local_dir" => format!("{:?}", local_dir));
        PartitionedManager {
            manager: Some(manager),
            group,
            local_dir,
            logger,
        }
    }

    /// この参加者のストアを返す.
    pub fn local_manager(&self) -> &Manager {
        self.manager
            .as_ref()
            .unwrap_or_else(|| self.group.abort("The local manager has already been closed"))
    }

    /// この参加者のストアのディレクトリを返す.
    pub fn local_dir(&self) -> &Path {
        &self.local_dir
    }

    /// 参加者のグループを返す.
    pub fn group(&self) -> &G {
        &self.group
    }

    /// ローカルのストアをクローズして、全参加者がクローズし終わるまで待機する.
    pub fn close(mut self) -> Result<()> {
        let result = match self.manager.take() {
            Some(manager) => track!(manager.close()),
            None => Ok(()),
        };
        self.synchronize();
        result
    }

    /// この参加者のストアが正常にクローズされた状態かどうかを判定する.
    pub fn consistent<P: AsRef<Path>>(base: P, group: &G) -> bool {
        Manager::consistent(local_dir_path(base, group))
    }

    fn synchronize(&self) {
        synchronize(&self.group, &self.logger);
    }
}
impl<G: ProcessGroup> Drop for PartitionedManager<G> {
    fn drop(&mut self) {
        if let Some(manager) = self.manager.take() {
            if let Err(e) = manager.close() {
                warn!(self.logger, "Cannot close the local store: {}", e;
                      "rank" => self.group.rank());
            }
            self.synchronize();
        }
    }
}

/// `rank`番目の参加者用のディレクトリのパスを求める.
pub fn local_dir_path<P: AsRef<Path>, G: ProcessGroup>(base: P, group: &G) -> PathBuf {
    base.as_ref()
        .join(TOP_LEVEL_DIR_NAME)
        .join(format!("subdir-{}", group.rank()))
}

// ランク0がトップレベルのディレクトリを作成し、他の参加者はそれを待つ.
fn setup_top_level_dir<P: AsRef<Path>, G: ProcessGroup>(base: P, group: &G, logger: &Logger) {
    if group.rank() == 0 {
        let top = base.as_ref().join(TOP_LEVEL_DIR_NAME);
        if let Err(e) = fs::create_dir_all(&top) {
            error!(logger, "Cannot create the top level directory: {}", e;
                   "path" => format!("{:?}", top));
            group.abort("cannot create the top level directory");
        }
    }
    synchronize(group, logger);
}

// 全参加者の到達を待つ. 同期できなければグループ全体を中断する.
fn synchronize<G: ProcessGroup>(group: &G, logger: &Logger) {
    if let Err(e) = group.barrier() {
        error!(logger, "Barrier failed: {}", e; "rank" => group.rank());
        group.abort("barrier failed");
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use tempdir::TempDir;
    use trackable::result::TestResult;

    use super::*;
    use crate::manager::Key;
    use crate::ErrorKind;

    fn builder() -> ManagerBuilder {
        let mut builder = ManagerBuilder::new();
        builder
            .chunk_size(1 << 16)
            .vm_reserve_size(1 << 28)
            .initial_segment_size(1 << 16);
        builder
    }

    #[test]
    fn it_works() -> TestResult {
        let dir = track_any_err!(TempDir::new("permheap_test"))?;
        let base = dir.path().to_path_buf();

        let handles = ThreadGroup::new_group(4)
            .into_iter()
            .map(|group| {
                let base = base.clone();
                thread::spawn(move || -> Result<()> {
                    let rank = group.rank() as u64;
                    let m = track!(PartitionedManager::create(&builder(), &base, group))?;
                    assert!(m.local_dir().ends_with(format!("subdir-{}", rank)));
                    track!(m.local_manager().construct(Key::Named("rank"), rank))?;
                    track!(m.close())
                })
            })
            .collect::<Vec<_>>();
        for h in handles {
            track!(h.join().expect("Thread panicked"))?;
        }

        for rank in 0..4 {
            let subdir = base.join(TOP_LEVEL_DIR_NAME).join(format!("subdir-{}", rank));
            assert!(Manager::consistent(&subdir));
        }

        let handles = ThreadGroup::new_group(4)
            .into_iter()
            .map(|group| {
                let base = base.clone();
                thread::spawn(move || -> Result<()> {
                    let rank = group.rank() as u64;
                    let m = track!(PartitionedManager::open_read_only(&builder(), &base, group))?;
                    let found = track!(m.local_manager().find::<u64>(Key::Named("rank")))?;
                    let (p, _) = track_assert_some!(found, ErrorKind::InconsistentState);
                    assert_eq!(unsafe { *p.as_ptr() }, rank);
                    Ok(())
                })
            })
            .collect::<Vec<_>>();
        for h in handles {
            track!(h.join().expect("Thread panicked"))?;
        }
        Ok(())
    }

    #[test]
    fn local_failure_does_not_block_others() -> TestResult {
        let dir = track_any_err!(TempDir::new("permheap_test"))?;
        let base = dir.path().to_path_buf();

        // ランク1のストアは既に存在するので、作成に失敗する
        let taken = base.join(TOP_LEVEL_DIR_NAME).join("subdir-1").join("datastore");
        track_any_err!(fs::create_dir_all(&taken))?;

        let handles = ThreadGroup::new_group(2)
            .into_iter()
            .map(|group| {
                let base = base.clone();
                thread::spawn(move || {
                    PartitionedManager::create(&builder(), &base, group)
                        .and_then(|m| m.close())
                        .err()
                        .map(|e| *e.kind())
                })
            })
            .collect::<Vec<_>>();
        let results = handles
            .into_iter()
            .map(|h| h.join().expect("Thread panicked"))
            .collect::<Vec<_>>();
        assert_eq!(results, vec![None, Some(ErrorKind::StoreAlreadyExists)]);
        assert!(Manager::consistent(base.join(TOP_LEVEL_DIR_NAME).join("subdir-0")));
        Ok(())
    }
}
