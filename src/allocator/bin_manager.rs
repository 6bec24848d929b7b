//! Small-Object Bin Manager.
use std::collections::BTreeSet;

use super::chunk_directory::{ChunkDirectory, ChunkEntry, ChunkNo};
use crate::size_class::{ClassIndex, SizeClassTable};
use crate::{ErrorKind, Result};

/// スロット解放の結果.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotRelease {
    /// チャンク内にまだ使用中のスロットが残っている.
    Retained,

    /// チャンク内の全てのスロットが空きになった.
    ///
    /// 該当チャンクはビンから外されているので、呼び出し側はこれをセグメントに返却する必要がある.
    Emptied,
}

/// サイズクラス毎に、空きスロットを持つチャンクの集合を管理する.
///
/// スロットの使用状況自体は`ChunkDirectory`側が保持しており、
/// この構造体はそこから再構築可能な索引に過ぎない(永続化は不要).
///
/// 割当時には「番号が最小の非満杯チャンク」の「インデックスが最小の空きスロット」が選択される.
#[derive(Debug, Clone)]
pub struct BinManager {
    non_full_chunks: Vec<BTreeSet<ChunkNo>>,
}
impl BinManager {
    /// 空の`BinManager`を生成する.
    pub fn new(table: &SizeClassTable) -> Self {
        BinManager {
            non_full_chunks: vec![BTreeSet::new(); table.num_classes()],
        }
    }

    /// チャンクディレクトリの内容から索引を再構築する.
    pub fn rebuild(table: &SizeClassTable, chunks: &ChunkDirectory) -> Self {
        let mut bins = Self::new(table);
        for chunk in 0..chunks.num_chunks() {
            if let Some(ChunkEntry::Small { class, slots }) = chunks.entry(chunk) {
                if !slots.is_full() {
                    bins.non_full_chunks[*class].insert(chunk);
                }
            }
        }
        bins
    }

    /// 指定クラスの既存チャンクからスロットを割り当てる.
    ///
    /// 結果は`(チャンク番号, スロットインデックス)`のペア.
    ///
    /// 空きスロットを持つチャンクが存在しない場合には`None`が返されるので、
    /// その場合は呼び出し側でチャンクを確保した上で`bind`を呼び出す必要がある.
    pub fn allocate(
        &mut self,
        class: ClassIndex,
        chunks: &mut ChunkDirectory,
    ) -> Result<Option<(ChunkNo, u64)>> {
        let chunk = match self.non_full_chunks[class].iter().next() {
            None => return Ok(None),
            Some(&chunk) => chunk,
        };
        let (bound_class, slots) = track_assert_some!(
            chunks.slots_mut(chunk),
            ErrorKind::InconsistentState,
            "Not a small-object chunk: chunk={}",
            chunk
        );
        track_assert_eq!(bound_class, class, ErrorKind::InconsistentState);

        let slot = track_assert_some!(
            slots.take_lowest(),
            ErrorKind::InconsistentState,
            "No free slot: chunk={}",
            chunk
        );
        if slots.is_full() {
            self.non_full_chunks[class].remove(&chunk);
        }
        Ok(Some((chunk, slot)))
    }

    /// 新たに確保された空きチャンクを指定クラスに束縛し、その先頭スロットを割り当てる.
    pub fn bind(
        &mut self,
        table: &SizeClassTable,
        class: ClassIndex,
        chunk: ChunkNo,
        chunks: &mut ChunkDirectory,
    ) -> Result<u64> {
        track!(chunks.bind_small(chunk, class, table.slots_per_chunk(class)))?;
        self.non_full_chunks[class].insert(chunk);
        let (_, slot) = track_assert_some!(
            track!(self.allocate(class, chunks))?,
            ErrorKind::InconsistentState
        );
        Ok(slot)
    }

    /// 指定スロットを解放する.
    ///
    /// # Errors
    ///
    /// `chunk`が小オブジェクト用チャンクではない、あるいはスロットが使用中ではない場合には
    /// `ErrorKind::InvalidInput`エラーが返される.
    pub fn deallocate(
        &mut self,
        chunk: ChunkNo,
        slot: u64,
        chunks: &mut ChunkDirectory,
    ) -> Result<SlotRelease> {
        let (class, slots) = track_assert_some!(
            chunks.slots_mut(chunk),
            ErrorKind::InvalidInput,
            "Not a small-object chunk: chunk={}",
            chunk
        );
        track_assert!(
            slots.release(slot),
            ErrorKind::InvalidInput,
            "Not an allocated slot: chunk={}, slot={}",
            chunk,
            slot
        );
        if slots.is_empty() {
            self.non_full_chunks[class].remove(&chunk);
            Ok(SlotRelease::Emptied)
        } else {
            self.non_full_chunks[class].insert(chunk);
            Ok(SlotRelease::Retained)
        }
    }

    /// 指定クラスの非満杯チャンクの番号を昇順で返す.
    pub fn non_full_chunks(&self, class: ClassIndex) -> impl Iterator<Item = ChunkNo> + '_ {
        self.non_full_chunks[class].iter().cloned()
    }
}

#[cfg(test)]
mod tests {
    use trackable::result::TestResult;

    use super::*;

    #[test]
    fn it_works() -> TestResult {
        let table = track!(SizeClassTable::new(4096, 1 << 30))?;
        let class = table.num_classes() - 1; // 2048バイト => チャンク当たり二スロット
        assert_eq!(table.slots_per_chunk(class), 2);

        let mut chunks = ChunkDirectory::new(16);
        track!(chunks.extend(4))?;
        let mut bins = BinManager::new(&table);

        assert_eq!(track!(bins.allocate(class, &mut chunks))?, None);
        assert_eq!(track!(bins.bind(&table, class, 1, &mut chunks))?, 0);
        assert_eq!(track!(bins.allocate(class, &mut chunks))?, Some((1, 1)));
        assert_eq!(track!(bins.allocate(class, &mut chunks))?, None);

        assert_eq!(
            track!(bins.deallocate(1, 0, &mut chunks))?,
            SlotRelease::Retained
        );
        assert_eq!(bins.non_full_chunks(class).collect::<Vec<_>>(), vec![1]);
        assert_eq!(
            track!(bins.deallocate(1, 1, &mut chunks))?,
            SlotRelease::Emptied
        );
        assert_eq!(bins.non_full_chunks(class).count(), 0);
        Ok(())
    }

    #[test]
    fn lowest_chunk_is_preferred() -> TestResult {
        let table = track!(SizeClassTable::new(4096, 1 << 30))?;
        let class = table.num_classes() - 1;
        let mut chunks = ChunkDirectory::new(16);
        track!(chunks.extend(4))?;
        let mut bins = BinManager::new(&table);

        track!(bins.bind(&table, class, 0, &mut chunks))?;
        track!(bins.allocate(class, &mut chunks))?;
        track!(bins.bind(&table, class, 2, &mut chunks))?;
        track!(bins.allocate(class, &mut chunks))?;

        track!(bins.deallocate(2, 1, &mut chunks))?;
        track!(bins.deallocate(0, 1, &mut chunks))?;
        assert_eq!(track!(bins.allocate(class, &mut chunks))?, Some((0, 1)));
        assert_eq!(track!(bins.allocate(class, &mut chunks))?, Some((2, 1)));
        Ok(())
    }

    #[test]
    fn double_free_is_rejected() -> TestResult {
        let table = track!(SizeClassTable::new(4096, 1 << 30))?;
        let mut chunks = ChunkDirectory::new(16);
        track!(chunks.extend(2))?;
        let mut bins = BinManager::new(&table);

        track!(bins.bind(&table, 0, 0, &mut chunks))?;
        track!(bins.allocate(0, &mut chunks))?;
        track!(bins.deallocate(0, 1, &mut chunks))?;
        assert!(bins.deallocate(0, 1, &mut chunks).is_err());
        assert!(bins.deallocate(1, 0, &mut chunks).is_err());
        Ok(())
    }

    #[test]
    fn rebuild_works() -> TestResult {
        let table = track!(SizeClassTable::new(4096, 1 << 30))?;
        let class = table.num_classes() - 1;
        let mut chunks = ChunkDirectory::new(16);
        track!(chunks.extend(3))?;
        let mut bins = BinManager::new(&table);

        track!(bins.bind(&table, class, 0, &mut chunks))?;
        track!(bins.allocate(class, &mut chunks))?;
        track!(bins.bind(&table, class, 1, &mut chunks))?;
        track!(bins.bind(&table, 0, 2, &mut chunks))?;

        let rebuilt = BinManager::rebuild(&table, &chunks);
        assert_eq!(rebuilt.non_full_chunks(class).collect::<Vec<_>>(), vec![1]);
        assert_eq!(rebuilt.non_full_chunks(0).collect::<Vec<_>>(), vec![2]);
        Ok(())
    }
}
