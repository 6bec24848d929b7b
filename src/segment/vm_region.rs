use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use std::ptr;

use crate::{ErrorKind, Result};

/// 予約済みの仮想アドレス空間.
///
/// 生成時に`PROT_NONE`の匿名マッピングとして確保され、
/// その内部の指定位置にファイルを`MAP_FIXED`でマッピングしていく.
/// 一度予約した範囲は移動しないため、セグメントを拡張してもベースアドレスは変わらない.
///
/// インスタンスが破棄された時点で、予約範囲全体(ファイルのマッピングも含む)が解放される.
#[derive(Debug)]
pub struct VmRegion {
    base: *mut u8,
    size: u64,
}
unsafe impl Send for VmRegion {}
unsafe impl Sync for VmRegion {}
impl VmRegion {
    /// `size`バイトの仮想アドレス空間を予約する.
    ///
    /// 先頭アドレスは`alignment`の倍数となる(`alignment`は二冪).
    pub fn reserve(size: u64, alignment: u64) -> Result<Self> {
        track_assert!(size > 0, ErrorKind::InvalidInput);
        track_assert!(alignment.is_power_of_two(), ErrorKind::InvalidInput);
        track_assert!(size % page_size() == 0, ErrorKind::InvalidInput, "size={}", size);
        let alignment = alignment.max(page_size());

        let total = track_assert_some!(
            size.checked_add(alignment),
            ErrorKind::InvalidInput,
            "Too large reservation: {}",
            size
        );
        let raw = unsafe {
            libc::mmap(
                ptr::null_mut(),
                total as usize,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            let e = io::Error::last_os_error();
            track_panic!(
                ErrorKind::OutOfSpace,
                "Cannot reserve {} bytes of address space: {}",
                size,
                e
            );
        }

        // 先頭と末尾の余剰部分を返却して、アライメントを揃える
        let raw = raw as u64;
        let base = (raw + alignment - 1) & !(alignment - 1);
        let head = base - raw;
        let tail = total - head - size;
        unsafe {
            if head > 0 {
                libc::munmap(raw as *mut libc::c_void, head as usize);
            }
            if tail > 0 {
                libc::munmap((base + size) as *mut libc::c_void, tail as usize);
            }
        }
        Ok(VmRegion {
            base: base as *mut u8,
            size,
        })
    }

    /// 先頭アドレスを返す.
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    /// 予約済みのサイズを返す.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// `file`の先頭`len`バイトを、予約範囲の`offset`の位置に共有マッピングする.
    pub fn map_file(&self, offset: u64, len: u64, file: &File, writable: bool) -> Result<()> {
        track!(self.check_range(offset, len))?;
        let prot = if writable {
            libc::PROT_READ | libc::PROT_WRITE
        } else {
            libc::PROT_READ
        };
        let addr = unsafe {
            libc::mmap(
                self.base.add(offset as usize) as *mut libc::c_void,
                len as usize,
                prot,
                libc::MAP_SHARED | libc::MAP_FIXED,
                file.as_raw_fd(),
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return track_io!(Err(io::Error::last_os_error()));
        }
        track_assert_eq!(
            addr as u64,
            self.base as u64 + offset,
            ErrorKind::InconsistentState
        );
        Ok(())
    }

    /// `offset`から`len`バイトの範囲への書き込みを、バッキングファイルに同期する.
    pub fn sync(&self, offset: u64, len: u64) -> Result<()> {
        track!(self.check_range(offset, len))?;
        if len == 0 {
            return Ok(());
        }
        let result = unsafe {
            libc::msync(
                self.base.add(offset as usize) as *mut libc::c_void,
                len as usize,
                libc::MS_SYNC,
            )
        };
        if result != 0 {
            return track_io!(Err(io::Error::last_os_error()));
        }
        Ok(())
    }

    /// `offset`から`len`バイトの範囲に対応するファイル領域を解放する(穴を空ける).
    ///
    /// 範囲の内容は不定となる.
    #[cfg(target_os = "linux")]
    pub fn free_backing(&self, offset: u64, len: u64) -> Result<()> {
        track!(self.check_range(offset, len))?;
        let result = unsafe {
            libc::madvise(
                self.base.add(offset as usize) as *mut libc::c_void,
                len as usize,
                libc::MADV_REMOVE,
            )
        };
        if result != 0 {
            return track_io!(Err(io::Error::last_os_error()));
        }
        Ok(())
    }
    #[cfg(not(target_os = "linux"))]
    pub fn free_backing(&self, offset: u64, len: u64) -> Result<()> {
        track!(self.check_range(offset, len))
    }

    fn check_range(&self, offset: u64, len: u64) -> Result<()> {
        track_assert!(
            offset
                .checked_add(len)
                .map_or(false, |end| end <= self.size),
            ErrorKind::InvalidInput,
            "Out of reserved range: offset={}, len={}, reserved={}",
            offset,
            len,
            self.size
        );
        Ok(())
    }
}
impl Drop for VmRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.size as usize);
        }
    }
}

/// OSのページサイズを返す.
pub fn page_size() -> u64 {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 {
        4096
    } else {
        size as u64
    }
}

#[cfg(test)]
mod tests {
    use std::fs::OpenOptions;
    use tempdir::TempDir;
    use trackable::result::TestResult;

    use super::*;

    #[test]
    fn reserve_works() -> TestResult {
        let region = track!(VmRegion::reserve(1 << 30, 1 << 21))?;
        assert_eq!(region.size(), 1 << 30);
        assert_eq!(region.base() as u64 % (1 << 21), 0);
        Ok(())
    }

    #[test]
    fn map_file_works() -> TestResult {
        let dir = track_any_err!(TempDir::new("permheap_test"))?;
        let path = dir.path().join("file");
        let file = track_any_err!(OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path))?;
        track_any_err!(file.set_len(8192))?;

        let region = track!(VmRegion::reserve(1 << 20, 4096))?;
        track!(region.map_file(4096, 8192, &file, true))?;
        unsafe {
            *region.base().add(4096) = 42;
            *region.base().add(4096 + 8191) = 7;
        }
        track!(region.sync(4096, 8192))?;
        drop(region);

        let bytes = track_any_err!(std::fs::read(&path))?;
        assert_eq!(bytes[0], 42);
        assert_eq!(bytes[8191], 7);
        Ok(())
    }

    #[test]
    fn out_of_range() -> TestResult {
        let region = track!(VmRegion::reserve(1 << 20, 4096))?;
        assert!(region.sync(1 << 20, 1).is_err());
        assert!(region.sync(0, (1 << 20) + 1).is_err());
        Ok(())
    }
}
