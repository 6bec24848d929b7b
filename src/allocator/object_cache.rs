//! Object Cache.
use crate::size_class::ClassIndex;

/// 最近解放されたスロットを、サイズクラス毎に保持しておくためのキャッシュ.
///
/// キャッシュ内のスロットは、ビットマップ上は使用中のままになっている.
/// そのため、管理データを永続化する前には`drain`で全てをビンに戻す必要がある.
///
/// キャッシュが有効な場合、割当位置の決定性は保証されない.
#[derive(Debug, Clone)]
pub struct ObjectCache {
    per_class: Vec<Vec<u64>>,
    capacity: usize,
}
impl ObjectCache {
    /// 各クラス毎に最大`capacity`個のスロットを保持するキャッシュを生成する.
    pub fn new(num_classes: usize, capacity: usize) -> Self {
        ObjectCache {
            per_class: vec![Vec::new(); num_classes],
            capacity,
        }
    }

    /// 指定クラスのキャッシュからスロットのオフセットを取り出す.
    pub fn pop(&mut self, class: ClassIndex) -> Option<u64> {
        self.per_class[class].pop()
    }

    /// 指定クラスのキャッシュにスロットのオフセットを追加する.
    ///
    /// キャッシュが溢れた場合には、古い方から半分のスロットが返されるので、
    /// 呼び出し側はそれらを実際に解放する必要がある.
    pub fn push(&mut self, class: ClassIndex, offset: u64) -> Vec<u64> {
        let cache = &mut self.per_class[class];
        cache.push(offset);
        if cache.len() <= self.capacity {
            Vec::new()
        } else {
            let n = (cache.len() + 1) / 2;
            cache.drain(..n).collect()
        }
    }

    /// 指定のオフセットがキャッシュ内に存在するかどうか.
    pub fn contains(&self, class: ClassIndex, offset: u64) -> bool {
        self.per_class[class].contains(&offset)
    }

    /// キャッシュ内の全スロットを取り出す.
    pub fn drain(&mut self) -> Vec<(ClassIndex, u64)> {
        let mut slots = Vec::new();
        for (class, cache) in self.per_class.iter_mut().enumerate() {
            slots.extend(cache.drain(..).map(|offset| (class, offset)));
        }
        slots
    }

    /// キャッシュ内のスロットの総数.
    pub fn len(&self) -> usize {
        self.per_class.iter().map(|c| c.len()).sum()
    }

    /// キャッシュが空かどうか.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_works() {
        let mut cache = ObjectCache::new(3, 4);
        assert!(cache.is_empty());
        assert_eq!(cache.pop(1), None);

        for offset in 0..4 {
            assert!(cache.push(1, offset * 16).is_empty());
        }
        assert!(cache.contains(1, 32));
        assert!(!cache.contains(0, 32));

        // 溢れた場合には古い方から半分が返される
        assert_eq!(cache.push(1, 64), vec![0, 16, 32]);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.pop(1), Some(64));

        cache.push(2, 100);
        assert_eq!(cache.drain(), vec![(1, 48), (2, 100)]);
        assert!(cache.is_empty());
    }
}
