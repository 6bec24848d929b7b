//! 割当要求サイズからサイズクラスを求めるためのテーブル.
//!
//! テーブルは`(chunk_size, max_size)`の二つのパラメータのみから決定的に構築される.
//! ストアに記録されたスロット配置はこのテーブルに依存しているので、
//! クラスの刻み方を変更した場合には、ストアのフォーマットバージョンを上げる必要がある.
use crate::{ErrorKind, Result};

/// 直接参照テーブルで引けるサイズの上限(バイト単位).
///
/// これを超えるサイズは閉じた式で計算する.
const LOOKUP_TABLE_LIMIT: u64 = 1024;

/// サイズクラスのインデックス.
pub type ClassIndex = usize;

/// 割当要求の分類結果.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeClass {
    /// 小オブジェクト.
    ///
    /// 指定クラスに束縛されたチャンク内のスロットから割り当てられる.
    Small(ClassIndex),

    /// 大オブジェクト.
    ///
    /// 値は割当に必要なチャンク数(要求サイズをチャンクサイズで切り上げたもの).
    Large(u64),
}

/// サイズクラステーブル.
///
/// 小オブジェクトのクラスは以下の順で並ぶ:
///
/// - `8, 16, 32, 48, 64`
/// - 以降は二冪毎に四分割: `b + b/4, b + 2b/4, b + 3b/4, 2b` (`b = 64, 128, ...`)
///
/// 最大のクラスは`chunk_size / 2`であり、それより大きい要求はチャンク単位の大オブジェクトとなる.
#[derive(Debug, Clone)]
pub struct SizeClassTable {
    chunk_size: u64,
    max_size: u64,
    slot_sizes: Vec<u64>,
    lookup: Vec<u16>,
}
impl SizeClassTable {
    /// 最小のスロットサイズ.
    pub const MIN_SIZE: u64 = 8;

    /// 受け付け可能な最小のチャンクサイズ.
    pub const MIN_CHUNK_SIZE: u64 = 4096;

    /// 新しい`SizeClassTable`インスタンスを生成する.
    ///
    /// # Errors
    ///
    /// 以下の場合には、種類が`ErrorKind::InvalidInput`のエラーが返される:
    ///
    /// - `chunk_size`が二冪ではない、あるいは`MIN_CHUNK_SIZE`未満
    /// - `max_size`が`chunk_size`未満
    pub fn new(chunk_size: u64, max_size: u64) -> Result<Self> {
        track_assert!(
            chunk_size.is_power_of_two(),
            ErrorKind::InvalidInput,
            "Chunk size must be a power of two: {}",
            chunk_size
        );
        track_assert!(
            chunk_size >= Self::MIN_CHUNK_SIZE,
            ErrorKind::InvalidInput,
            "Too small chunk size: {}",
            chunk_size
        );
        track_assert!(
            max_size >= chunk_size,
            ErrorKind::InvalidInput,
            "max_size({}) must be >= chunk_size({})",
            max_size,
            chunk_size
        );

        let max_small_size = chunk_size / 2;
        let mut slot_sizes = vec![8, 16, 32, 48, 64];
        let mut base = 64;
        while base < max_small_size {
            let step = base / 4;
            for i in 1..=4 {
                slot_sizes.push(base + step * i);
            }
            base *= 2;
        }
        debug_assert_eq!(slot_sizes.last().cloned(), Some(max_small_size));

        let mut lookup = Vec::with_capacity((LOOKUP_TABLE_LIMIT / Self::MIN_SIZE) as usize);
        let mut class = 0;
        for bucket in 1..=LOOKUP_TABLE_LIMIT / Self::MIN_SIZE {
            let size = bucket * Self::MIN_SIZE;
            while slot_sizes[class] < size {
                class += 1;
            }
            lookup.push(class as u16);
        }

        Ok(SizeClassTable {
            chunk_size,
            max_size,
            slot_sizes,
            lookup,
        })
    }

    /// 要求サイズを分類する.
    ///
    /// `size`が`max_size()`を超えている場合には`None`が返される.
    ///
    /// `0`バイトの要求は最小クラスとして扱われる.
    pub fn class_of(&self, size: u64) -> Option<SizeClass> {
        if size > self.max_size {
            None
        } else if size <= self.max_small_size() {
            Some(SizeClass::Small(self.small_class_of(size)))
        } else {
            Some(SizeClass::Large(self.num_chunks(size)))
        }
    }

    /// 指定クラスのスロットサイズを返す.
    ///
    /// # Panics
    ///
    /// `class`が範囲外の場合には、現在のスレッドがパニックする.
    pub fn slot_size(&self, class: ClassIndex) -> u64 {
        self.slot_sizes[class]
    }

    /// 指定クラスに束縛されたチャンク一つに含まれるスロットの数を返す.
    pub fn slots_per_chunk(&self, class: ClassIndex) -> u64 {
        self.chunk_size / self.slot_sizes[class]
    }

    /// 最小のスロットサイズを返す.
    pub fn min_size(&self) -> u64 {
        self.slot_sizes[0]
    }

    /// 小オブジェクトとして扱われる最大サイズを返す.
    pub fn max_small_size(&self) -> u64 {
        self.chunk_size / 2
    }

    /// 割当可能な最大サイズを返す.
    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    /// チャンクサイズを返す.
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// 小オブジェクト用のクラス数を返す.
    pub fn num_classes(&self) -> usize {
        self.slot_sizes.len()
    }

    /// `size`バイトを格納するのに必要なチャンク数を返す.
    pub fn num_chunks(&self, size: u64) -> u64 {
        (size + self.chunk_size - 1) / self.chunk_size
    }

    fn small_class_of(&self, size: u64) -> ClassIndex {
        if size <= LOOKUP_TABLE_LIMIT {
            let bucket = (size.max(1) + Self::MIN_SIZE - 1) / Self::MIN_SIZE;
            return self.lookup[bucket as usize - 1] as ClassIndex;
        }

        // `2^p < size <= 2^(p+1)`となる`p`を求め、その区間内の四分割のどこに入るかを計算する
        let p = 63 - u64::from((size - 1).leading_zeros());
        let base = 1 << p;
        let step = base / 4;
        let k = (size - base + step - 1) / step;
        5 + 4 * (p as usize - 6) + (k as usize - 1)
    }
}
