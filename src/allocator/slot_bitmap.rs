//! Slot Bitmap.

/// チャンク内のスロットの使用状況を管理するビットマップ.
///
/// ビットが立っているスロットが使用中.
///
/// 空きスロットの探索は常に最小インデックスから行われるため、割当位置は決定的となる.
/// 探索コストを抑えるために「これより前のワードは全て埋まっている」位置をヒントとして保持しているが、
/// これは永続化されず、復元時に再計算される.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotBitmap {
    words: Vec<u64>,
    num_slots: u64,
    num_used: u64,
    first_candidate_word: usize,
}
impl SlotBitmap {
    /// `num_slots`個の空きスロットを持つビットマップを生成する.
    pub fn new(num_slots: u64) -> Self {
        let num_words = ((num_slots + 63) / 64) as usize;
        SlotBitmap {
            words: vec![0; num_words],
            num_slots,
            num_used: 0,
            first_candidate_word: 0,
        }
    }

    /// 保存済みのワード列からビットマップを復元する.
    ///
    /// `words`の長さが`num_slots`に対応していない、
    /// あるいは範囲外のビットが立っている場合には`None`が返される.
    pub fn from_words(num_slots: u64, words: Vec<u64>) -> Option<Self> {
        if words.len() as u64 != (num_slots + 63) / 64 {
            return None;
        }
        if let Some(&last) = words.last() {
            let tail_bits = num_slots % 64;
            if tail_bits != 0 && (last >> tail_bits) != 0 {
                return None;
            }
        }
        let num_used = words.iter().map(|w| u64::from(w.count_ones())).sum();
        let first_candidate_word = words
            .iter()
            .position(|&w| w != !0)
            .unwrap_or_else(|| words.len());
        Some(SlotBitmap {
            words,
            num_slots,
            num_used,
            first_candidate_word,
        })
    }

    /// 内部のワード列を返す.
    pub fn words(&self) -> &[u64] {
        &self.words
    }

    /// スロットの総数.
    pub fn num_slots(&self) -> u64 {
        self.num_slots
    }

    /// 使用中のスロットの数.
    pub fn num_used(&self) -> u64 {
        self.num_used
    }

    /// 全てのスロットが使用中かどうか.
    pub fn is_full(&self) -> bool {
        self.num_used == self.num_slots
    }

    /// 全てのスロットが空いているかどうか.
    pub fn is_empty(&self) -> bool {
        self.num_used == 0
    }

    /// 指定スロットが使用中かどうか.
    pub fn is_used(&self, slot: u64) -> bool {
        slot < self.num_slots && self.words[(slot / 64) as usize] & (1 << (slot % 64)) != 0
    }

    /// インデックスが最小の空きスロットを使用中にして、そのインデックスを返す.
    ///
    /// 空きがない場合には`None`が返される.
    pub fn take_lowest(&mut self) -> Option<u64> {
        for i in self.first_candidate_word..self.words.len() {
            let word = self.words[i];
            if word == !0 {
                continue;
            }
            let bit = u64::from((!word).trailing_zeros());
            let slot = i as u64 * 64 + bit;
            if slot >= self.num_slots {
                break;
            }
            self.words[i] |= 1 << bit;
            self.num_used += 1;
            self.first_candidate_word = i;
            return Some(slot);
        }
        self.first_candidate_word = self.words.len();
        None
    }

    /// 指定スロットを空きに戻す.
    ///
    /// 既に空いていた(あるいは範囲外の)場合には`false`が返される.
    pub fn release(&mut self, slot: u64) -> bool {
        if !self.is_used(slot) {
            return false;
        }
        let i = (slot / 64) as usize;
        self.words[i] &= !(1 << (slot % 64));
        self.num_used -= 1;
        if i < self.first_candidate_word {
            self.first_candidate_word = i;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_works() {
        let mut bitmap = SlotBitmap::new(130);
        assert!(bitmap.is_empty());
        for i in 0..130 {
            assert_eq!(bitmap.take_lowest(), Some(i));
        }
        assert!(bitmap.is_full());
        assert_eq!(bitmap.take_lowest(), None);

        assert!(bitmap.release(70));
        assert!(bitmap.release(3));
        assert!(!bitmap.release(3));
        assert!(!bitmap.release(1000));
        assert_eq!(bitmap.num_used(), 128);

        // 常に最小のインデックスから再利用される
        assert_eq!(bitmap.take_lowest(), Some(3));
        assert_eq!(bitmap.take_lowest(), Some(70));
        assert_eq!(bitmap.take_lowest(), None);
    }

    #[test]
    fn restore_from_words() {
        let mut bitmap = SlotBitmap::new(100);
        for _ in 0..70 {
            bitmap.take_lowest();
        }
        bitmap.release(10);

        let restored = SlotBitmap::from_words(100, bitmap.words().to_vec()).unwrap();
        assert_eq!(restored.num_used(), 69);
        let mut restored = restored;
        assert_eq!(restored.take_lowest(), Some(10));
        assert_eq!(restored.take_lowest(), Some(70));

        // 長さが一致しない
        assert!(SlotBitmap::from_words(100, vec![0; 3]).is_none());

        // 範囲外のビットが立っている
        assert!(SlotBitmap::from_words(100, vec![0, 1 << 40]).is_none());
    }
}
