//! セグメント内の領域割当を担当するアロケータ.
//!
//! # 構成
//!
//! ```text
//! SegmentAllocator
//!   ├─ ChunkDirectory (チャンク単位の割当と、各チャンクの状態管理)
//!   ├─ BinManager     (小オブジェクト用: サイズクラス毎の非満杯チャンクの索引)
//!   └─ ObjectCache    (任意: 最近解放されたスロットのキャッシュ)
//! ```
//!
//! 要求サイズが`SizeClassTable::max_small_size()`以下ならスロット単位、
//! それより大きければ連続したチャンク単位で割り当てられる.
//!
//! このモジュール内のデータ構造は、全てアドレスではなく「セグメント先頭からのオフセット」を扱う.
use std::cmp;
use trackable::error::ErrorKindExt;

pub use self::bin_manager::{BinManager, SlotRelease};
pub use self::chunk_directory::{ChunkDirectory, ChunkEntry, ChunkNo};
pub use self::object_cache::ObjectCache;
pub use self::slot_bitmap::SlotBitmap;

use crate::metrics::{BinMetrics, SegmentAllocatorMetrics};
use crate::segment::SegmentStorage;
use crate::size_class::{ClassIndex, SizeClass, SizeClassTable};
use crate::{Error, ErrorKind, Result};

mod bin_manager;
mod chunk_directory;
mod object_cache;
mod slot_bitmap;

/// `SegmentAllocator`の挙動を調整するためのオプション.
#[derive(Debug, Clone)]
pub struct AllocatorOptions {
    /// セグメントを最初に拡張する際の最小サイズ(バイト単位).
    ///
    /// チャンクサイズの倍数である必要がある.
    pub initial_segment_size: u64,

    /// サイズクラス毎のオブジェクトキャッシュの容量.
    ///
    /// `None`の場合にはキャッシュは使用されない.
    pub object_cache_capacity: Option<usize>,

    /// 解放されたチャンクに対応するファイル領域をファイルシステムに返却するかどうか.
    pub free_file_space: bool,
}
impl Default for AllocatorOptions {
    fn default() -> Self {
        AllocatorOptions {
            initial_segment_size: 0,
            object_cache_capacity: None,
            free_file_space: true,
        }
    }
}

/// セグメント用のアロケータ.
///
/// # 割当戦略
///
/// - 大オブジェクト: 要求を満たす連続空きチャンクの中で、番号が最小のものを使う(First-Fit)
/// - 小オブジェクト: 該当クラスの非満杯チャンクの中で番号が最小のものの、最小インデックスの空きスロットを使う
///
/// 全てのスロットが空きになったチャンクは即座にセグメントに返却される.
///
/// 以上により、オブジェクトキャッシュが無効であれば、
/// 同じ順序の割当・解放要求に対しては、常に同じオフセット列が返される.
#[derive(Debug)]
pub struct SegmentAllocator {
    table: SizeClassTable,
    chunks: ChunkDirectory,
    bins: BinManager,
    cache: Option<ObjectCache>,
    options: AllocatorOptions,
    metrics: SegmentAllocatorMetrics,
    bin_metrics: BinMetrics,
}
impl SegmentAllocator {
    /// 空のセグメント用のアロケータを生成する.
    ///
    /// `max_chunks`は、セグメントが保持可能なチャンク数の上限.
    pub fn new(
        table: SizeClassTable,
        max_chunks: u64,
        options: AllocatorOptions,
        metrics: SegmentAllocatorMetrics,
        bin_metrics: BinMetrics,
    ) -> Self {
        let chunks = ChunkDirectory::new(max_chunks);
        let bins = BinManager::new(&table);
        let cache = options
            .object_cache_capacity
            .map(|capacity| ObjectCache::new(table.num_classes(), capacity));
        SegmentAllocator {
            table,
            chunks,
            bins,
            cache,
            options,
            metrics,
            bin_metrics,
        }
    }

    /// 永続化されていたチャンクディレクトリからアロケータを復元する.
    ///
    /// `segment_size`は、マッピング済みのセグメントのサイズ.
    pub fn restore(
        table: SizeClassTable,
        mut chunks: ChunkDirectory,
        segment_size: u64,
        options: AllocatorOptions,
        metrics: SegmentAllocatorMetrics,
        bin_metrics: BinMetrics,
    ) -> Result<Self> {
        let chunk_size = table.chunk_size();
        track_assert!(
            chunks.num_chunks() * chunk_size <= segment_size,
            ErrorKind::StorageCorrupted,
            "Segment is smaller than the chunk directory: chunks={}, segment_size={}",
            chunks.num_chunks(),
            segment_size
        );
        track!(chunks.extend(segment_size / chunk_size))?;
        metrics.segment_size_bytes.set(segment_size as f64);

        let bins = BinManager::rebuild(&table, &chunks);
        let cache = options
            .object_cache_capacity
            .map(|capacity| ObjectCache::new(table.num_classes(), capacity));
        Ok(SegmentAllocator {
            table,
            chunks,
            bins,
            cache,
            options,
            metrics,
            bin_metrics,
        })
    }

    /// `size`バイトの領域を割り当てて、そのオフセットを返す.
    ///
    /// 結果のオフセットは、少なくとも`SizeClassTable::MIN_SIZE`の倍数になっている.
    ///
    /// # Errors
    ///
    /// 空き領域が不足している場合や`size`が`SizeClassTable::max_size()`を超えている場合には、
    /// `ErrorKind::OutOfSpace`エラーが返される.
    pub fn allocate<S: SegmentStorage>(&mut self, storage: &mut S, size: u64) -> Result<u64> {
        match self.table.class_of(size) {
            Some(SizeClass::Small(class)) => track!(self.allocate_small(storage, class)),
            Some(SizeClass::Large(count)) => {
                let chunk = track!(self.acquire_chunks(storage, count))?;
                Ok(chunk * self.table.chunk_size())
            }
            None => {
                self.metrics.nospace_failures.increment();
                track_panic!(
                    ErrorKind::OutOfSpace,
                    "Too large allocation: size={}, max_size={}",
                    size,
                    self.table.max_size()
                );
            }
        }
    }

    /// `alignment`の倍数となるオフセットに`size`バイトの領域を割り当てる.
    ///
    /// `alignment`は二冪かつチャンクサイズ以下である必要がある.
    ///
    /// セグメントの先頭アドレスはチャンクサイズの倍数に揃えられているので、
    /// アドレスについても同じアライメントが保証される.
    pub fn allocate_aligned<S: SegmentStorage>(
        &mut self,
        storage: &mut S,
        size: u64,
        alignment: u64,
    ) -> Result<u64> {
        track_assert!(
            alignment.is_power_of_two(),
            ErrorKind::InvalidInput,
            "alignment={}",
            alignment
        );
        track_assert!(
            alignment <= self.table.chunk_size(),
            ErrorKind::InvalidInput,
            "Too large alignment: alignment={}, chunk_size={}",
            alignment,
            self.table.chunk_size()
        );
        if alignment <= SizeClassTable::MIN_SIZE {
            return track!(self.allocate(storage, size));
        }

        let size = (cmp::max(size, 1) + alignment - 1) & !(alignment - 1);
        match self.table.class_of(size) {
            Some(SizeClass::Small(class)) => {
                // スロットサイズが`alignment`の倍数となる最小のクラスを探す
                if let Some(class) = (class..self.table.num_classes())
                    .find(|&c| self.table.slot_size(c) % alignment == 0)
                {
                    return track!(self.allocate_small(storage, class));
                }
                let chunk = track!(self.acquire_chunks(storage, self.table.num_chunks(size)))?;
                Ok(chunk * self.table.chunk_size())
            }
            _ => track!(self.allocate(storage, size)),
        }
    }

    /// `offset`に割り当てられている領域を解放する.
    ///
    /// # Errors
    ///
    /// `offset`が割当済み領域の先頭を指していない場合(二重解放を含む)には、
    /// `ErrorKind::InvalidInput`エラーが返される.
    pub fn deallocate<S: SegmentStorage>(&mut self, storage: &mut S, offset: u64) -> Result<()> {
        let chunk_size = self.table.chunk_size();
        let chunk = offset / chunk_size;
        match self.chunks.entry(chunk) {
            Some(ChunkEntry::Small { class, slots }) => {
                let class = *class;
                let slot_size = self.table.slot_size(class);
                let within = offset % chunk_size;
                track_assert_eq!(
                    within % slot_size,
                    0,
                    ErrorKind::InvalidInput,
                    "Not a slot boundary: offset={}, slot_size={}",
                    offset,
                    slot_size
                );
                let slot = within / slot_size;
                track_assert!(
                    slots.is_used(slot),
                    ErrorKind::InvalidInput,
                    "Not an allocated slot: offset={}",
                    offset
                );

                if let Some(cache) = self.cache.as_mut() {
                    track_assert!(
                        !cache.contains(class, offset),
                        ErrorKind::InvalidInput,
                        "Double free: offset={}",
                        offset
                    );
                    self.bin_metrics.released_slots.increment();
                    for overflowed in cache.push(class, offset) {
                        track!(self.release_slot(storage, overflowed))?;
                    }
                    return Ok(());
                }
                self.bin_metrics.released_slots.increment();
                track!(self.release_slot(storage, offset))
            }
            Some(ChunkEntry::LargeHead { .. }) => {
                track_assert_eq!(
                    offset % chunk_size,
                    0,
                    ErrorKind::InvalidInput,
                    "Not a chunk boundary: offset={}",
                    offset
                );
                track!(self.release_chunks(storage, chunk))
            }
            _ => track_panic!(
                ErrorKind::InvalidInput,
                "Not an allocated offset: offset={}",
                offset
            ),
        }
    }

    /// `count`個の連続したチャンクを確保し、その先頭のチャンク番号を返す.
    ///
    /// 空きチャンクが不足している場合には、必要に応じてストレージを拡張する.
    pub fn acquire_chunks<S: SegmentStorage>(
        &mut self,
        storage: &mut S,
        count: u64,
    ) -> Result<ChunkNo> {
        let start = track!(self.reserve_run(storage, count))?;
        track!(self.chunks.occupy_large(start, count))?;
        self.metrics.acquired_chunks.add_u64(count);
        Ok(start)
    }

    /// `first`から始まるチャンク群(大オブジェクト用の連続領域、あるいは小オブジェクト用のチャンク)を解放する.
    pub fn release_chunks<S: SegmentStorage>(
        &mut self,
        storage: &mut S,
        first: ChunkNo,
    ) -> Result<()> {
        let count = track!(self.chunks.release(first))?;
        self.metrics.released_chunks.add_u64(count);
        if self.options.free_file_space {
            // ファイルシステムが穴空けに対応していない場合でも、解放自体は成功扱いとする
            let chunk_size = self.table.chunk_size();
            let _ = storage.release(first * chunk_size, count * chunk_size);
        }
        Ok(())
    }

    /// オブジェクトキャッシュ内のスロットを全てビンに戻す.
    ///
    /// 管理データを永続化する前には、必ずこのメソッドを呼び出す必要がある.
    pub fn drain_cache<S: SegmentStorage>(&mut self, storage: &mut S) -> Result<()> {
        let slots = self.cache.as_mut().map(|c| c.drain()).unwrap_or_default();
        for (_, offset) in slots {
            track!(self.release_slot(storage, offset))?;
        }
        Ok(())
    }

    /// `offset`に割り当てられている領域のサイズを返す.
    ///
    /// 割当済み領域の先頭ではない場合には`None`が返される.
    pub fn allocation_size(&self, offset: u64) -> Option<u64> {
        let chunk_size = self.table.chunk_size();
        match self.chunks.entry(offset / chunk_size)? {
            ChunkEntry::Small { class, slots } => {
                let slot_size = self.table.slot_size(*class);
                let within = offset % chunk_size;
                let in_cache = self
                    .cache
                    .as_ref()
                    .map_or(false, |c| c.contains(*class, offset));
                if within % slot_size == 0 && slots.is_used(within / slot_size) && !in_cache {
                    Some(slot_size)
                } else {
                    None
                }
            }
            ChunkEntry::LargeHead { num_chunks } if offset % chunk_size == 0 => {
                Some(num_chunks * chunk_size)
            }
            _ => None,
        }
    }

    /// サイズクラステーブルを返す.
    pub fn table(&self) -> &SizeClassTable {
        &self.table
    }

    /// チャンクディレクトリを返す.
    pub fn chunk_directory(&self) -> &ChunkDirectory {
        &self.chunks
    }

    /// アロケータのメトリクスを返す.
    pub fn metrics(&self) -> &SegmentAllocatorMetrics {
        &self.metrics
    }

    fn allocate_small<S: SegmentStorage>(
        &mut self,
        storage: &mut S,
        class: ClassIndex,
    ) -> Result<u64> {
        if let Some(offset) = self.cache.as_mut().and_then(|c| c.pop(class)) {
            self.bin_metrics.cache_hits.increment();
            self.bin_metrics.allocated_slots.increment();
            return Ok(offset);
        }

        let (chunk, slot) = if let Some(found) = track!(self.bins.allocate(class, &mut self.chunks))? {
            found
        } else {
            let chunk = track!(self.reserve_run(storage, 1))?;
            let slot = track!(self
                .bins
                .bind(&self.table, class, chunk, &mut self.chunks))?;
            self.metrics.acquired_chunks.increment();
            (chunk, slot)
        };
        self.bin_metrics.allocated_slots.increment();
        Ok(chunk * self.table.chunk_size() + slot * self.table.slot_size(class))
    }

    fn release_slot<S: SegmentStorage>(&mut self, storage: &mut S, offset: u64) -> Result<()> {
        let chunk_size = self.table.chunk_size();
        let chunk = offset / chunk_size;
        let slot_size = match self.chunks.entry(chunk) {
            Some(ChunkEntry::Small { class, .. }) => self.table.slot_size(*class),
            other => track_panic!(
                ErrorKind::InconsistentState,
                "Not a small-object chunk: chunk={}, entry={:?}",
                chunk,
                other
            ),
        };
        let slot = (offset % chunk_size) / slot_size;
        match track!(self.bins.deallocate(chunk, slot, &mut self.chunks))? {
            SlotRelease::Retained => Ok(()),
            SlotRelease::Emptied => track!(self.release_chunks(storage, chunk)),
        }
    }

    // `count`個の連続した空きチャンクを用意し、その先頭番号を返す(状態は空きのまま).
    fn reserve_run<S: SegmentStorage>(&mut self, storage: &mut S, count: u64) -> Result<ChunkNo> {
        let (start, required) = match self.chunks.plan(count) {
            Ok(planned) => planned,
            Err(e) => {
                if *e.kind() == ErrorKind::OutOfSpace {
                    self.metrics.nospace_failures.increment();
                }
                return Err(track!(e));
            }
        };
        let current = self.chunks.num_chunks();
        if required <= current {
            return Ok(start);
        }

        // 拡張の度にファイルが増えるので、拡張幅は倍々で大きくしていく
        let chunk_size = self.table.chunk_size();
        let target = cmp::max(
            required,
            cmp::max(current * 2, self.options.initial_segment_size / chunk_size),
        );
        let target = cmp::min(target, self.chunks.max_chunks());
        if let Err(e) = storage.extend(target * chunk_size) {
            if *e.kind() == ErrorKind::InvalidInput {
                return Err(track!(e));
            }
            self.metrics.nospace_failures.increment();
            return Err(track!(Error::from(ErrorKind::OutOfSpace.cause(e))));
        }
        track!(self.chunks.extend(target))?;
        self.metrics.growths.increment();
        self.metrics
            .segment_size_bytes
            .set((target * chunk_size) as f64);
        Ok(start)
    }
}
