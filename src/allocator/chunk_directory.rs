//! Chunk Directory.
use adler32::RollingAdler32;
use byteorder::{BigEndian, ByteOrder, ReadBytesExt, WriteBytesExt};
use std::collections::BTreeMap;
use std::io::{Cursor, Read, Write};

use super::slot_bitmap::SlotBitmap;
use crate::size_class::{ClassIndex, SizeClassTable};
use crate::{ErrorKind, Result};

/// チャンクの番号.
///
/// セグメントの先頭から`0, 1, 2, ...`と連続して割り振られる.
pub type ChunkNo = u64;

/// チャンクディレクトリファイルの先頭に書き込まれるマジックナンバー.
const MAGIC_NUMBER: [u8; 4] = *b"pmcd";

/// チャンクディレクトリのフォーマットバージョン.
const FORMAT_VERSION: u16 = 1;

const TAG_FREE: u8 = 0;
const TAG_SMALL: u8 = 1;
const TAG_LARGE_HEAD: u8 = 2;
const TAG_LARGE_BODY: u8 = 3;

/// 個々のチャンクの状態.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkEntry {
    /// 未使用.
    Free,

    /// 小オブジェクト用のサイズクラスに束縛されている.
    Small {
        /// 束縛先のサイズクラス.
        class: ClassIndex,

        /// スロットの使用状況.
        slots: SlotBitmap,
    },

    /// 大オブジェクトを構成する連続領域の先頭.
    LargeHead {
        /// 連続領域を構成するチャンクの数(先頭を含む).
        num_chunks: u64,
    },

    /// 大オブジェクトを構成する連続領域の二番目以降.
    LargeBody,
}

/// セグメント内のチャンクの状態を管理するためのディレクトリ.
///
/// バッキングストレージが確保済みのチャンク群(`0..num_chunks()`)について、
/// その状態と空きチャンクの連続領域(フリーラン)を保持している.
///
/// このディレクトリ自体は計算処理のみを担当し、I/Oは行わない.
/// ストレージの拡張は呼び出し側の責務.
///
/// # 割当戦略
///
/// 要求を満たすフリーランの中で、開始位置が最も小さいものが選択される(First-Fit).
/// そのため、割当と解放の順序が同じであれば、常に同じ位置が返される.
///
/// 解放されたチャンクは、隣接するフリーランと結合された上でフリーリストに戻される.
#[derive(Debug, Clone)]
pub struct ChunkDirectory {
    entries: Vec<ChunkEntry>,
    free_runs: BTreeMap<ChunkNo, u64>,
    max_chunks: u64,
}
impl ChunkDirectory {
    /// 空のディレクトリを生成する.
    ///
    /// `max_chunks`は、セグメントが保持可能なチャンク数の上限.
    pub fn new(max_chunks: u64) -> Self {
        ChunkDirectory {
            entries: Vec::new(),
            free_runs: BTreeMap::new(),
            max_chunks,
        }
    }

    /// バッキングストレージが確保済みのチャンクの数を返す.
    pub fn num_chunks(&self) -> u64 {
        self.entries.len() as u64
    }

    /// 保持可能なチャンク数の上限を返す.
    pub fn max_chunks(&self) -> u64 {
        self.max_chunks
    }

    /// 保持可能なチャンク数の上限を変更する.
    ///
    /// 確保済みのチャンク数よりも小さな値は指定できない.
    pub fn set_max_chunks(&mut self, max_chunks: u64) -> Result<()> {
        track_assert!(
            max_chunks >= self.num_chunks(),
            ErrorKind::InvalidInput,
            "max_chunks={}, num_chunks={}",
            max_chunks,
            self.num_chunks()
        );
        self.max_chunks = max_chunks;
        Ok(())
    }

    /// 使用中(i.e., 空きではない)チャンクの数を返す.
    pub fn num_used_chunks(&self) -> u64 {
        self.num_chunks() - self.free_runs.values().sum::<u64>()
    }

    /// 指定チャンクの状態を返す.
    pub fn entry(&self, chunk: ChunkNo) -> Option<&ChunkEntry> {
        self.entries.get(chunk as usize)
    }

    /// 空きチャンクの連続領域を、開始位置の昇順で返す.
    pub fn free_runs(&self) -> impl Iterator<Item = (ChunkNo, u64)> + '_ {
        self.free_runs.iter().map(|(&start, &len)| (start, len))
    }

    /// `count`個の連続した空きチャンクを配置する位置を決める.
    ///
    /// 結果のタプルの第一要素は配置先の先頭チャンク番号で、
    /// 第二要素はその配置のために必要となるチャンク数(`num_chunks()`以下なら拡張不要).
    ///
    /// # Errors
    ///
    /// `max_chunks()`を超えてしまう場合には`ErrorKind::OutOfSpace`エラーが返される.
    pub fn plan(&self, count: u64) -> Result<(ChunkNo, u64)> {
        track_assert_ne!(count, 0, ErrorKind::InvalidInput);
        if let Some(start) = self
            .free_runs
            .iter()
            .find(|&(_, &len)| len >= count)
            .map(|(&start, _)| start)
        {
            return Ok((start, self.num_chunks()));
        }

        // 末尾に接しているフリーランがあれば、それを延長して使う
        let start = match self.free_runs.iter().next_back() {
            Some((&start, &len)) if start + len == self.num_chunks() => start,
            _ => self.num_chunks(),
        };
        let required = start + count;
        track_assert!(
            required <= self.max_chunks,
            ErrorKind::OutOfSpace,
            "Too many chunks: required={}, max={}",
            required,
            self.max_chunks
        );
        Ok((start, required))
    }

    /// 確保済みのチャンク数を`num_chunks`まで増やす.
    ///
    /// 追加されたチャンクは空き状態となる.
    pub fn extend(&mut self, num_chunks: u64) -> Result<()> {
        track_assert!(num_chunks <= self.max_chunks, ErrorKind::OutOfSpace);
        let current = self.num_chunks();
        if num_chunks <= current {
            return Ok(());
        }
        self.entries.resize(num_chunks as usize, ChunkEntry::Free);
        self.insert_free_run(current, num_chunks - current);
        Ok(())
    }

    /// `start`から始まる`count`個の空きチャンクを、大オブジェクト用に使用中にする.
    pub fn occupy_large(&mut self, start: ChunkNo, count: u64) -> Result<()> {
        track!(self.take_free_run(start, count))?;
        self.entries[start as usize] = ChunkEntry::LargeHead { num_chunks: count };
        for chunk in start + 1..start + count {
            self.entries[chunk as usize] = ChunkEntry::LargeBody;
        }
        Ok(())
    }

    /// 空きチャンクを小オブジェクト用のサイズクラスに束縛する.
    pub fn bind_small(&mut self, chunk: ChunkNo, class: ClassIndex, num_slots: u64) -> Result<()> {
        track!(self.take_free_run(chunk, 1))?;
        self.entries[chunk as usize] = ChunkEntry::Small {
            class,
            slots: SlotBitmap::new(num_slots),
        };
        Ok(())
    }

    /// 小オブジェクト用チャンクのスロットビットマップを返す.
    pub fn slots_mut(&mut self, chunk: ChunkNo) -> Option<(ClassIndex, &mut SlotBitmap)> {
        match self.entries.get_mut(chunk as usize) {
            Some(ChunkEntry::Small { class, slots }) => Some((*class, slots)),
            _ => None,
        }
    }

    /// 使用中のチャンク(あるいは大オブジェクトの連続領域)を解放する.
    ///
    /// 解放したチャンクの数が返される.
    ///
    /// # Errors
    ///
    /// `start`が小オブジェクト用チャンクか大オブジェクトの先頭ではない場合には、
    /// `ErrorKind::InvalidInput`エラーが返される.
    pub fn release(&mut self, start: ChunkNo) -> Result<u64> {
        let count = match self.entries.get(start as usize) {
            Some(ChunkEntry::LargeHead { num_chunks }) => *num_chunks,
            Some(ChunkEntry::Small { .. }) => 1,
            other => track_panic!(
                ErrorKind::InvalidInput,
                "Not a releasable chunk: chunk={}, entry={:?}",
                start,
                other
            ),
        };
        for chunk in start..start + count {
            self.entries[chunk as usize] = ChunkEntry::Free;
        }
        self.insert_free_run(start, count);
        Ok(count)
    }

    /// ディレクトリの内容を`writer`に書き込む.
    ///
    /// 末尾には内容全体のチェックサム(adler32)が付与される.
    pub fn write_to<W: Write>(&self, mut writer: W) -> Result<()> {
        let mut buf = Vec::new();
        track_io!(buf.write_u16::<BigEndian>(FORMAT_VERSION))?;
        track_io!(buf.write_u64::<BigEndian>(self.max_chunks))?;
        track_io!(buf.write_u64::<BigEndian>(self.num_chunks()))?;
        for entry in &self.entries {
            match entry {
                ChunkEntry::Free => track_io!(buf.write_u8(TAG_FREE))?,
                ChunkEntry::Small { class, slots } => {
                    track_io!(buf.write_u8(TAG_SMALL))?;
                    track_io!(buf.write_u16::<BigEndian>(*class as u16))?;
                    track_io!(buf.write_u64::<BigEndian>(slots.num_slots()))?;
                    for &word in slots.words() {
                        track_io!(buf.write_u64::<BigEndian>(word))?;
                    }
                }
                ChunkEntry::LargeHead { num_chunks } => {
                    track_io!(buf.write_u8(TAG_LARGE_HEAD))?;
                    track_io!(buf.write_u64::<BigEndian>(*num_chunks))?;
                }
                ChunkEntry::LargeBody => track_io!(buf.write_u8(TAG_LARGE_BODY))?,
            }
        }

        let mut adler32 = RollingAdler32::new();
        adler32.update_buffer(&buf);

        track_io!(writer.write_all(&MAGIC_NUMBER[..]))?;
        track_io!(writer.write_all(&buf))?;
        track_io!(writer.write_u32::<BigEndian>(adler32.hash()))?;
        Ok(())
    }

    /// `writer_to`で書き込まれたディレクトリを`reader`から読み込む.
    ///
    /// チャンクの状態はサイズクラステーブル`table`と照合される.
    pub fn read_from<R: Read>(mut reader: R, table: &SizeClassTable) -> Result<Self> {
        let mut magic_number = [0; 4];
        track_io!(reader.read_exact(&mut magic_number))?;
        track_assert_eq!(magic_number, MAGIC_NUMBER, ErrorKind::StorageCorrupted);

        let mut buf = Vec::new();
        track_io!(reader.read_to_end(&mut buf))?;
        track_assert!(buf.len() >= 4, ErrorKind::StorageCorrupted);
        let (body, checksum) = buf.split_at(buf.len() - 4);
        let mut adler32 = RollingAdler32::new();
        adler32.update_buffer(body);
        track_assert_eq!(
            adler32.hash(),
            BigEndian::read_u32(checksum),
            ErrorKind::StorageCorrupted,
            "Chunk directory checksum mismatch"
        );

        let mut reader = Cursor::new(body);
        let version = track_io!(reader.read_u16::<BigEndian>())?;
        track_assert_eq!(
            version,
            FORMAT_VERSION,
            ErrorKind::StorageCorrupted,
            "Unsupported chunk directory version"
        );
        let max_chunks = track_io!(reader.read_u64::<BigEndian>())?;
        let num_chunks = track_io!(reader.read_u64::<BigEndian>())?;
        track_assert!(num_chunks <= max_chunks, ErrorKind::StorageCorrupted);

        let mut entries = Vec::with_capacity(num_chunks as usize);
        let mut large_remaining = 0;
        for chunk in 0..num_chunks {
            let tag = track_io!(reader.read_u8())?;
            if large_remaining > 0 {
                track_assert_eq!(
                    tag,
                    TAG_LARGE_BODY,
                    ErrorKind::StorageCorrupted,
                    "chunk={}",
                    chunk
                );
            }
            let entry = match tag {
                TAG_FREE => ChunkEntry::Free,
                TAG_SMALL => {
                    let class = track_io!(reader.read_u16::<BigEndian>())? as ClassIndex;
                    track_assert!(
                        class < table.num_classes(),
                        ErrorKind::StorageCorrupted,
                        "Unknown size class: chunk={}, class={}",
                        chunk,
                        class
                    );
                    let num_slots = track_io!(reader.read_u64::<BigEndian>())?;
                    track_assert_eq!(
                        num_slots,
                        table.slots_per_chunk(class),
                        ErrorKind::StorageCorrupted
                    );
                    let mut words = vec![0; ((num_slots + 63) / 64) as usize];
                    track_io!(reader.read_u64_into::<BigEndian>(&mut words))?;
                    let slots = track_assert_some!(
                        SlotBitmap::from_words(num_slots, words),
                        ErrorKind::StorageCorrupted,
                        "chunk={}",
                        chunk
                    );
                    ChunkEntry::Small { class, slots }
                }
                TAG_LARGE_HEAD => {
                    let count = track_io!(reader.read_u64::<BigEndian>())?;
                    track_assert!(
                        count > 0 && chunk + count <= num_chunks,
                        ErrorKind::StorageCorrupted,
                        "chunk={}, num_chunks={}",
                        chunk,
                        count
                    );
                    large_remaining = count;
                    ChunkEntry::LargeHead { num_chunks: count }
                }
                TAG_LARGE_BODY => {
                    track_assert!(large_remaining > 0, ErrorKind::StorageCorrupted);
                    ChunkEntry::LargeBody
                }
                _ => track_panic!(
                    ErrorKind::StorageCorrupted,
                    "Unknown chunk tag: chunk={}, tag={}",
                    chunk,
                    tag
                ),
            };
            if large_remaining > 0 {
                large_remaining -= 1;
            }
            entries.push(entry);
        }
        track_assert_eq!(
            reader.position(),
            body.len() as u64,
            ErrorKind::StorageCorrupted
        );

        let mut directory = ChunkDirectory {
            entries,
            free_runs: BTreeMap::new(),
            max_chunks,
        };
        directory.rebuild_free_runs();
        Ok(directory)
    }

    fn rebuild_free_runs(&mut self) {
        let mut run_start = None;
        for chunk in 0..self.num_chunks() {
            let is_free = self.entries[chunk as usize] == ChunkEntry::Free;
            match (is_free, run_start) {
                (true, None) => run_start = Some(chunk),
                (false, Some(start)) => {
                    self.free_runs.insert(start, chunk - start);
                    run_start = None;
                }
                _ => {}
            }
        }
        if let Some(start) = run_start {
            self.free_runs.insert(start, self.num_chunks() - start);
        }
    }

    // `start`から`count`個のチャンクをフリーランから取り除く.
    //
    // 対象範囲は、単一のフリーランに完全に含まれている必要がある.
    fn take_free_run(&mut self, start: ChunkNo, count: u64) -> Result<()> {
        let (run_start, run_len) = track_assert_some!(
            self.free_runs
                .range(..=start)
                .next_back()
                .map(|(&s, &l)| (s, l)),
            ErrorKind::InconsistentState,
            "No free run: start={}",
            start
        );
        track_assert!(
            start + count <= run_start + run_len,
            ErrorKind::InconsistentState,
            "Not free: start={}, count={}, run=({}, {})",
            start,
            count,
            run_start,
            run_len
        );

        self.free_runs.remove(&run_start);
        if run_start < start {
            self.free_runs.insert(run_start, start - run_start);
        }
        let run_end = run_start + run_len;
        if start + count < run_end {
            self.free_runs.insert(start + count, run_end - (start + count));
        }
        Ok(())
    }

    // `start`と`start + len`に隣接するフリーランが存在する場合には、それらをまとめて登録する.
    fn insert_free_run(&mut self, mut start: ChunkNo, mut len: u64) {
        let prev = self
            .free_runs
            .range(..start)
            .next_back()
            .map(|(&s, &l)| (s, l));
        if let Some((prev_start, prev_len)) = prev {
            if prev_start + prev_len == start {
                self.free_runs.remove(&prev_start);
                start = prev_start;
                len += prev_len;
            }
        }
        if let Some(next_len) = self.free_runs.remove(&(start + len)) {
            len += next_len;
        }
        self.free_runs.insert(start, len);
    }
}

#[cfg(test)]
mod tests {
    use trackable::result::TestResult;

    use super::*;

    fn table() -> SizeClassTable {
        SizeClassTable::new(1 << 16, 1 << 32).unwrap()
    }

    fn acquire(directory: &mut ChunkDirectory, count: u64) -> Result<ChunkNo> {
        let (start, required) = track!(directory.plan(count))?;
        track!(directory.extend(required))?;
        track!(directory.occupy_large(start, count))?;
        Ok(start)
    }

    #[test]
    fn it_works() -> TestResult {
        let mut directory = ChunkDirectory::new(16);
        assert_eq!(track!(acquire(&mut directory, 1))?, 0);
        assert_eq!(track!(acquire(&mut directory, 2))?, 1);
        assert_eq!(track!(acquire(&mut directory, 1))?, 3);
        assert_eq!(directory.num_chunks(), 4);
        assert_eq!(directory.num_used_chunks(), 4);

        assert_eq!(track!(directory.release(0))?, 1);
        assert_eq!(track!(directory.release(1))?, 2);
        assert_eq!(track!(directory.release(3))?, 1);
        assert_eq!(directory.free_runs().collect::<Vec<_>>(), vec![(0, 4)]);

        // 同じ順序で割り当てれば、同じ位置が返される
        assert_eq!(track!(acquire(&mut directory, 1))?, 0);
        assert_eq!(track!(acquire(&mut directory, 2))?, 1);
        assert_eq!(track!(acquire(&mut directory, 1))?, 3);
        assert_eq!(directory.num_chunks(), 4);
        Ok(())
    }

    #[test]
    fn lowest_fit_is_preferred() -> TestResult {
        let mut directory = ChunkDirectory::new(16);
        for i in 0..8 {
            assert_eq!(track!(acquire(&mut directory, 1))?, i);
        }
        track!(directory.release(5))?;
        track!(directory.release(6))?;
        track!(directory.release(1))?;

        assert_eq!(track!(acquire(&mut directory, 2))?, 5);
        assert_eq!(track!(acquire(&mut directory, 1))?, 1);

        // 末尾に接している空き領域は、延長して使われる
        track!(directory.release(7))?;
        assert_eq!(track!(acquire(&mut directory, 3))?, 7);
        assert_eq!(directory.num_chunks(), 10);
        Ok(())
    }

    #[test]
    fn out_of_space() -> TestResult {
        let mut directory = ChunkDirectory::new(4);
        assert_eq!(track!(acquire(&mut directory, 3))?, 0);
        assert_eq!(
            directory.plan(2).err().map(|e| *e.kind()),
            Some(ErrorKind::OutOfSpace)
        );
        assert_eq!(track!(acquire(&mut directory, 1))?, 3);
        Ok(())
    }

    #[test]
    fn invalid_release() -> TestResult {
        let mut directory = ChunkDirectory::new(8);
        track!(acquire(&mut directory, 3))?;
        assert!(directory.release(1).is_err());
        assert!(directory.release(5).is_err());
        track!(directory.release(0))?;
        assert!(directory.release(0).is_err());
        Ok(())
    }

    #[test]
    fn write_and_read() -> TestResult {
        let table = table();
        let mut directory = ChunkDirectory::new(64);
        track!(directory.extend(6))?;
        track!(directory.bind_small(0, 3, table.slots_per_chunk(3)))?;
        if let Some((_, slots)) = directory.slots_mut(0) {
            slots.take_lowest();
            slots.take_lowest();
        }
        track!(directory.occupy_large(2, 3))?;

        let mut buf = Vec::new();
        track!(directory.write_to(&mut buf))?;
        let restored = track!(ChunkDirectory::read_from(&buf[..], &table))?;

        assert_eq!(restored.num_chunks(), 6);
        assert_eq!(restored.max_chunks(), 64);
        assert_eq!(restored.entries, directory.entries);
        assert_eq!(
            restored.free_runs().collect::<Vec<_>>(),
            vec![(1, 1), (5, 1)]
        );
        Ok(())
    }

    #[test]
    fn corruption_is_detected() -> TestResult {
        let table = table();
        let mut directory = ChunkDirectory::new(64);
        track!(directory.extend(4))?;
        track!(directory.occupy_large(0, 2))?;

        let mut buf = Vec::new();
        track!(directory.write_to(&mut buf))?;
        let i = buf.len() - 6;
        buf[i] ^= 0xFF;
        assert_eq!(
            ChunkDirectory::read_from(&buf[..], &table)
                .err()
                .map(|e| *e.kind()),
            Some(ErrorKind::StorageCorrupted)
        );
        Ok(())
    }
}
