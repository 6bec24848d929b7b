//! セグメント内に格納可能な型と、オフセットベースのコンテナ.
//!
//! セグメントは、プロセス毎に異なるアドレスにマッピングされ得るため、
//! セグメント内のオブジェクトは絶対アドレス(ポインタや参照)を保持してはならない.
//! 他のオブジェクトを参照したい場合には、セグメント先頭からのオフセットを用いる.
use std::marker::PhantomData;
use std::mem;
use std::ptr::{self, NonNull};
use std::slice;

use crate::manager::Manager;
use crate::Result;

/// セグメント内に格納可能な型を表すマーカートレイト.
///
/// # Safety
///
/// 実装する型は、以下を満たす必要がある:
///
/// - 絶対アドレス(ポインタ、参照、`Box`や`Vec`等のヒープを指すもの)を保持しない
/// - バイト列をそのまま別プロセスで読み直しても、有効な値となる
///
/// `release`は、`Manager::destroy`によってオブジェクトが破棄される直前に呼び出される.
/// セグメント内に別途確保した領域を保持する型は、ここでそれを解放する.
pub unsafe trait Persistent: Sized + 'static {
    /// オブジェクトが保持するセグメント内の領域を解放する.
    fn release(&mut self, _manager: &Manager) -> Result<()> {
        Ok(())
    }
}

macro_rules! impl_persistent_for_primitives {
    ($($t:ty),*) => {
        $(unsafe impl Persistent for $t {})*
    };
}
impl_persistent_for_primitives!(
    (),
    bool,
    char,
    u8,
    u16,
    u32,
    u64,
    u128,
    usize,
    i8,
    i16,
    i32,
    i64,
    i128,
    isize,
    f32,
    f64
);

unsafe impl<T: Persistent, const N: usize> Persistent for [T; N] {
    fn release(&mut self, manager: &Manager) -> Result<()> {
        for x in self.iter_mut() {
            track!(x.release(manager))?;
        }
        Ok(())
    }
}

unsafe impl<T: Persistent> Persistent for Option<T> {
    fn release(&mut self, manager: &Manager) -> Result<()> {
        if let Some(x) = self {
            track!(x.release(manager))?;
        }
        Ok(())
    }
}

macro_rules! impl_persistent_for_tuples {
    ($(($($t:ident: $i:tt),+)),*) => {
        $(unsafe impl<$($t: Persistent),+> Persistent for ($($t,)+) {
            fn release(&mut self, manager: &Manager) -> Result<()> {
                $(track!(self.$i.release(manager))?;)+
                Ok(())
            }
        })*
    };
}
impl_persistent_for_tuples!(
    (A: 0),
    (A: 0, B: 1),
    (A: 0, B: 1, C: 2),
    (A: 0, B: 1, C: 2, D: 3)
);

const NO_BUFFER: u64 = u64::MAX;

/// セグメント内に格納可能な可変長配列.
///
/// バッファはセグメントから割り当てられ、オフセットで参照される.
/// そのため、要素へのアクセスには常に`Manager`が必要となる.
///
/// `Drop`ではバッファは解放されない.
/// 不要になった場合には`clear`を呼び出すか、`Manager::destroy`経由で破棄すること.
///
/// 使用例:
/// ```ignore
/// let v = track!(manager.construct(Key::Named("vec"), SegmentVec::<u64>::new()))?;
/// let v = unsafe { &mut *v.as_ptr() };
/// track!(v.push(&manager, 10))?;
/// assert_eq!(v.as_slice(&manager), &[10]);
/// ```
#[derive(Debug)]
#[repr(C)]
pub struct SegmentVec<T> {
    buf: u64,
    len: u64,
    capacity: u64,
    _phantom: PhantomData<T>,
}
impl<T: Persistent> SegmentVec<T> {
    /// 空の`SegmentVec`を生成する.
    ///
    /// 最初の要素が追加されるまで、バッファは割り当てられない.
    pub fn new() -> Self {
        SegmentVec {
            buf: NO_BUFFER,
            len: 0,
            capacity: 0,
            _phantom: PhantomData,
        }
    }

    /// 最低`capacity`個の要素を格納可能なバッファを持つ`SegmentVec`を生成する.
    pub fn with_capacity(manager: &Manager, capacity: usize) -> Result<Self> {
        let mut v = Self::new();
        track!(v.reserve(manager, capacity))?;
        Ok(v)
    }

    /// 要素数を返す.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// 要素が空かどうかを返す.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// バッファの容量(要素数)を返す.
    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// 最低`additional`個の要素を追加で格納可能となるように、バッファを拡張する.
    pub fn reserve(&mut self, manager: &Manager, additional: usize) -> Result<()> {
        let required = track_assert_some!(
            self.len().checked_add(additional),
            crate::ErrorKind::InvalidInput,
            "Capacity overflow: len={}, additional={}",
            self.len(),
            additional
        );
        if required <= self.capacity() {
            return Ok(());
        }
        let capacity = required.max(self.capacity().saturating_mul(2)).max(4);
        track!(self.reallocate(manager, capacity))
    }

    /// 末尾に要素を追加する.
    ///
    /// バッファが不足している場合には、新しいバッファが割り当てられ、古いバッファは解放される.
    pub fn push(&mut self, manager: &Manager, value: T) -> Result<()> {
        track!(self.reserve(manager, 1))?;
        let data = track_assert_some!(self.data(manager), crate::ErrorKind::InconsistentState);
        unsafe {
            ptr::write(data.as_ptr().add(self.len()), value);
        }
        self.len += 1;
        Ok(())
    }

    /// 末尾の要素を取り出す.
    pub fn pop(&mut self, manager: &Manager) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let data = self.data(manager)?;
        self.len -= 1;
        Some(unsafe { ptr::read(data.as_ptr().add(self.len())) })
    }

    /// `index`番目の要素への参照を返す.
    pub fn get<'a>(&'a self, manager: &'a Manager, index: usize) -> Option<&'a T> {
        self.as_slice(manager).get(index)
    }

    /// `index`番目の要素への可変参照を返す.
    pub fn get_mut<'a>(&'a mut self, manager: &'a Manager, index: usize) -> Option<&'a mut T> {
        self.as_mut_slice(manager).get_mut(index)
    }

    /// 要素列をスライスとして返す.
    pub fn as_slice<'a>(&'a self, manager: &'a Manager) -> &'a [T] {
        match self.data(manager) {
            Some(data) => unsafe { slice::from_raw_parts(data.as_ptr(), self.len()) },
            None => &[],
        }
    }

    /// 要素列を可変スライスとして返す.
    pub fn as_mut_slice<'a>(&'a mut self, manager: &'a Manager) -> &'a mut [T] {
        match self.data(manager) {
            Some(data) => unsafe { slice::from_raw_parts_mut(data.as_ptr(), self.len()) },
            None => &mut [],
        }
    }

    /// 全ての要素を破棄し、バッファを解放する.
    ///
    /// 各要素に対しては`Persistent::release`が呼ばれた後に、デストラクタが実行される.
    pub fn clear(&mut self, manager: &Manager) -> Result<()> {
        if self.buf == NO_BUFFER {
            return Ok(());
        }
        for x in self.as_mut_slice(manager) {
            track!(x.release(manager))?;
        }
        let data = track_assert_some!(self.data(manager), crate::ErrorKind::InconsistentState);
        unsafe {
            ptr::drop_in_place(slice::from_raw_parts_mut(data.as_ptr(), self.len()));
        }
        self.len = 0;
        track!(manager.deallocate(data.cast()))?;
        self.buf = NO_BUFFER;
        self.capacity = 0;
        Ok(())
    }

    fn data(&self, manager: &Manager) -> Option<NonNull<T>> {
        if self.buf == NO_BUFFER {
            None
        } else {
            manager.from_offset(self.buf).map(NonNull::cast)
        }
    }

    fn reallocate(&mut self, manager: &Manager, capacity: usize) -> Result<()> {
        let size = track_assert_some!(
            mem::size_of::<T>().checked_mul(capacity),
            crate::ErrorKind::InvalidInput,
            "Too large buffer: capacity={}",
            capacity
        );
        let new_data = track!(manager.allocate_aligned(size, mem::align_of::<T>()))?;
        let new_buf = track_assert_some!(
            manager.to_offset(new_data.as_ptr()),
            crate::ErrorKind::InconsistentState
        );
        if let Some(old_data) = self.data(manager) {
            unsafe {
                ptr::copy_nonoverlapping(
                    old_data.as_ptr(),
                    new_data.cast::<T>().as_ptr(),
                    self.len(),
                );
            }
            track!(manager.deallocate(old_data.cast()))?;
        }
        self.buf = new_buf;
        self.capacity = capacity as u64;
        Ok(())
    }
}
impl<T: Persistent> Default for SegmentVec<T> {
    fn default() -> Self {
        Self::new()
    }
}
unsafe impl<T: Persistent> Persistent for SegmentVec<T> {
    fn release(&mut self, manager: &Manager) -> Result<()> {
        track!(self.clear(manager))
    }
}

#[cfg(test)]
mod tests {
    use tempdir::TempDir;
    use trackable::result::TestResult;

    use super::*;
    use crate::manager::ManagerBuilder;

    fn create_manager(dir: &TempDir) -> Result<Manager> {
        track!(ManagerBuilder::new()
            .chunk_size(1 << 16)
            .vm_reserve_size(1 << 30)
            .initial_segment_size(1 << 20)
            .create(dir.path()))
    }

    #[test]
    fn it_works() -> TestResult {
        let dir = track_any_err!(TempDir::new("permheap_test"))?;
        let manager = track!(create_manager(&dir))?;

        let mut v = SegmentVec::<u64>::new();
        assert!(v.is_empty());
        assert_eq!(v.as_slice(&manager), &[] as &[u64]);

        for i in 0..100 {
            track!(v.push(&manager, i))?;
        }
        assert_eq!(v.len(), 100);
        assert!(v.capacity() >= 100);
        assert_eq!(v.get(&manager, 10), Some(&10));
        assert_eq!(v.get(&manager, 100), None);

        if let Some(x) = v.get_mut(&manager, 0) {
            *x = 1000;
        }
        assert_eq!(v.as_slice(&manager)[0], 1000);

        assert_eq!(v.pop(&manager), Some(99));
        assert_eq!(v.len(), 99);

        track!(v.clear(&manager))?;
        assert!(v.is_empty());
        assert_eq!(v.capacity(), 0);
        track!(manager.close())?;
        Ok(())
    }

    #[test]
    fn capacity_overflow() -> TestResult {
        let dir = track_any_err!(TempDir::new("permheap_test"))?;
        let manager = track!(create_manager(&dir))?;

        let mut v = SegmentVec::<u64>::new();
        assert_eq!(
            v.reserve(&manager, usize::MAX / 2).err().map(|e| *e.kind()),
            Some(crate::ErrorKind::InvalidInput)
        );
        track!(v.push(&manager, 1))?;
        assert_eq!(
            v.reserve(&manager, usize::MAX).err().map(|e| *e.kind()),
            Some(crate::ErrorKind::InvalidInput)
        );
        assert_eq!(v.as_slice(&manager), &[1]);
        track!(v.clear(&manager))?;
        track!(manager.close())?;
        Ok(())
    }

    #[test]
    fn growth_releases_old_buffers() -> TestResult {
        let dir = track_any_err!(TempDir::new("permheap_test"))?;
        let manager = track!(create_manager(&dir))?;

        let mut v = track!(SegmentVec::<u32>::with_capacity(&manager, 4))?;
        assert_eq!(v.capacity(), 4);
        for i in 0..4 {
            track!(v.push(&manager, i))?;
        }
        let before = manager.metrics().deallocations();
        track!(v.push(&manager, 4))?;
        assert_eq!(v.capacity(), 8);
        assert_eq!(manager.metrics().deallocations(), before + 1);
        assert_eq!(v.as_slice(&manager), &[0, 1, 2, 3, 4]);

        track!(v.clear(&manager))?;
        track!(manager.close())?;
        Ok(())
    }

    #[test]
    fn nested_vectors() -> TestResult {
        let dir = track_any_err!(TempDir::new("permheap_test"))?;
        let manager = track!(create_manager(&dir))?;

        let mut outer = SegmentVec::<SegmentVec<u64>>::new();
        for i in 0..10 {
            let mut inner = SegmentVec::new();
            for j in 0..i {
                track!(inner.push(&manager, j))?;
            }
            track!(outer.push(&manager, inner))?;
        }
        for (i, inner) in outer.as_slice(&manager).iter().enumerate() {
            assert_eq!(inner.len(), i);
            assert_eq!(inner.as_slice(&manager).iter().sum::<u64>(), (0..i as u64).sum());
        }

        track!(outer.release(&manager))?;
        assert!(outer.is_empty());
        track!(manager.close())?;
        Ok(())
    }
}
