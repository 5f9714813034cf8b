//! 文件映射页与 mmap/munmap
//!
//! 每个映射区域持有一个独立 `reopen` 出来的文件句柄，区域内的每个页也各持有它的一份 `Arc`，
//! 最后一个引用释放时文件随之关闭

use alloc::{sync::Arc, vec::Vec};
use core::fmt;

use common::config::{KERNEL_BASE, PAGE_SIZE};
use defines::error::{errno, KResult};
use klocks::SpinMutex;
use scopeguard::ScopeGuard;

use crate::{
    address::{VirtAddr, VirtPageNum},
    hal::{AsId, File},
    page::{Page, PageInit},
    Vm,
};

/// 文件系统大锁，与系统调用层共用
///
/// 每次只包住一次文件操作，绝不能在持有它时申请物理页
#[derive(Default)]
pub struct FsLock {
    lock: SpinMutex<()>,
}

impl FsLock {
    pub const fn new() -> Self {
        Self {
            lock: SpinMutex::new(()),
        }
    }

    /// 在锁内执行一次文件操作
    #[track_caller]
    pub fn io<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.lock.lock();
        f()
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_locked()
    }
}

/// 页面在文件中的来源：从 `offset` 开始读 `read_bytes` 字节，页内剩余部分填 0
#[derive(Clone)]
pub struct FileSlice {
    file: Arc<dyn File>,
    offset: usize,
    read_bytes: usize,
}

impl FileSlice {
    pub fn new(file: Arc<dyn File>, offset: usize, read_bytes: usize) -> Self {
        assert!(read_bytes <= PAGE_SIZE);
        Self {
            file,
            offset,
            read_bytes,
        }
    }

    pub fn file(&self) -> &Arc<dyn File> {
        &self.file
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn read_bytes(&self) -> usize {
        self.read_bytes
    }

    pub fn zero_bytes(&self) -> usize {
        PAGE_SIZE - self.read_bytes
    }

    /// 同样的区间，换一个文件句柄
    pub(crate) fn with_file(&self, file: Arc<dyn File>) -> Self {
        Self {
            file,
            offset: self.offset,
            read_bytes: self.read_bytes,
        }
    }

    /// 读入页面并把尾部清零。读不满视为失败
    pub(crate) fn load(&self, frame: &mut [u8; PAGE_SIZE], fs: &FsLock) -> KResult<()> {
        let (data, tail) = frame.split_at_mut(self.read_bytes);
        let read = fs.io(|| self.file.read_at(data, self.offset));
        if read != self.read_bytes {
            error!(
                "short read at offset {:#x}: {read}/{} bytes",
                self.offset, self.read_bytes
            );
            return Err(errno::EIO);
        }
        tail.fill(0);
        Ok(())
    }

    pub(crate) fn write_back(&self, frame: &[u8; PAGE_SIZE], fs: &FsLock) -> KResult<()> {
        let data = &frame[..self.read_bytes];
        let written = fs.io(|| self.file.write_at(data, self.offset));
        if written != self.read_bytes {
            error!(
                "short write at offset {:#x}: {written}/{} bytes",
                self.offset, self.read_bytes
            );
            return Err(errno::EIO);
        }
        Ok(())
    }
}

impl fmt::Debug for FileSlice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileSlice")
            .field("offset", &self.offset)
            .field("read_bytes", &self.read_bytes)
            .field("zero_bytes", &self.zero_bytes())
            .finish_non_exhaustive()
    }
}

/// 文件映射页的后备信息
#[derive(Debug)]
pub struct FilePage {
    slice: FileSlice,
}

impl FilePage {
    pub fn new(slice: FileSlice) -> Self {
        Self { slice }
    }

    pub fn slice(&self) -> &FileSlice {
        &self.slice
    }

    /// 可以反复调用，每次都从文件重新读
    pub fn swap_in(&self, frame: &mut [u8; PAGE_SIZE], fs: &FsLock) -> KResult<()> {
        self.slice.load(frame, fs)
    }

    /// 只有脏页才写回，干净的页直接丢弃，之后可以从文件重新读出
    pub fn swap_out(&self, frame: &[u8; PAGE_SIZE], dirty: bool, fs: &FsLock) -> KResult<()> {
        if dirty {
            self.slice.write_back(frame, fs)?;
        }
        Ok(())
    }

    /// 销毁时同样要写回脏页。失败也只能记录下来，销毁总要完成
    pub fn destroy(self, frame: Option<&[u8; PAGE_SIZE]>, dirty: bool, fs: &FsLock) {
        if let Some(frame) = frame {
            if let Err(e) = self.swap_out(frame, dirty, fs) {
                error!("lose dirty page at offset {:#x}: {e}", self.slice.offset);
            }
        }
    }
}

/// 一次 mmap 建立的区域
pub struct MmapRegion {
    start: VirtPageNum,
    pages: usize,
    len: usize,
    writable: bool,
    file: Arc<dyn File>,
}

impl MmapRegion {
    pub fn start(&self) -> VirtPageNum {
        self.start
    }

    pub fn pages(&self) -> usize {
        self.pages
    }

    /// 实际映射的字节数，不超过文件在 `offset` 之后的长度
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn file(&self) -> &Arc<dyn File> {
        &self.file
    }

    pub(crate) fn with_file(&self, file: Arc<dyn File>) -> Self {
        Self {
            start: self.start,
            pages: self.pages,
            len: self.len,
            writable: self.writable,
            file,
        }
    }

    pub fn vpns(&self) -> impl Iterator<Item = VirtPageNum> {
        VirtPageNum::iter_range(self.start.span(self.pages))
    }
}

impl Vm {
    /// 把 `file` 从 `offset` 开始的内容映射到 `addr`，返回映射的起始地址
    ///
    /// 页面只是登记下来，真正的读取发生在第一次访问时
    pub fn mmap(
        &self,
        asid: AsId,
        addr: VirtAddr,
        len: usize,
        writable: bool,
        file: &Arc<dyn File>,
        offset: usize,
    ) -> KResult<VirtAddr> {
        trace!("mmap {addr:?}, len {len:#x}, offset {offset:#x}, writable {writable}");
        if len == 0 || addr.is_null() || !addr.is_page_aligned() {
            warn!("mmap rejects {addr:?} with length {len:#x}");
            return Err(errno::EINVAL);
        }
        let file_len = self.fs.io(|| file.len());
        if file_len == 0 {
            warn!("mmap an empty file");
            return Err(errno::EBADF);
        }
        if offset >= file_len {
            warn!("mmap offset {offset:#x} is beyond file length {file_len:#x}");
            return Err(errno::EINVAL);
        }
        let map_bytes = len.min(file_len - offset);
        let pages = map_bytes.div_ceil(PAGE_SIZE);
        if addr
            .0
            .checked_add(pages * PAGE_SIZE)
            .map_or(true, |end| end > KERNEL_BASE)
        {
            warn!("mmap at {addr:?} reaches kernel space");
            return Err(errno::EINVAL);
        }

        let start = addr.vpn_floor();
        let mut state = self.state.lock();
        let space = state.space_mut(asid)?;
        if let Some(vpn) =
            VirtPageNum::iter_range(start.span(pages)).find(|&vpn| space.spt.find(vpn).is_some())
        {
            warn!("mmap at {addr:?} overlaps page {:?}", vpn.page_start());
            return Err(errno::EEXIST);
        }
        let Some(file) = self.fs.io(|| file.reopen()) else {
            warn!("mmap fails to reopen file");
            return Err(errno::EBADF);
        };

        // 中途失败时撤回已经登记的页，重新打开的文件随 `file` 一起释放
        let mut inserted = scopeguard::guard(
            (&mut space.spt, Vec::with_capacity(pages)),
            |(spt, vpns)| {
                for vpn in vpns {
                    spt.remove(vpn);
                }
            },
        );
        for (i, vpn) in VirtPageNum::iter_range(start.span(pages)).enumerate() {
            let read_bytes = (map_bytes - i * PAGE_SIZE).min(PAGE_SIZE);
            let slice = FileSlice::new(Arc::clone(&file), offset + i * PAGE_SIZE, read_bytes);
            let (spt, vpns) = &mut *inserted;
            spt.insert(Page::new(vpn, writable, PageInit::Mapped(slice)))?;
            vpns.push(vpn);
        }
        ScopeGuard::into_inner(inserted);

        space.mmaps.insert(
            start,
            MmapRegion {
                start,
                pages,
                len: map_bytes,
                writable,
                file,
            },
        );
        debug!("{asid:?} maps {pages} pages at {addr:?}");
        Ok(addr)
    }

    /// 解除以 `addr` 为起点的映射，脏页写回文件
    ///
    /// `addr` 不是某个映射的起始地址时返回 `EINVAL`，不做任何修改
    pub fn munmap(&self, asid: AsId, addr: VirtAddr) -> KResult<()> {
        trace!("munmap {addr:?}");
        let mut state = self.state.lock();
        let space = state.space_mut(asid)?;
        let region = if addr.is_page_aligned() {
            space.mmaps.remove(&addr.vpn_floor())
        } else {
            None
        };
        let Some(region) = region else {
            warn!("munmap {addr:?} is not the start of a mapping");
            return Err(errno::EINVAL);
        };
        let backing = self.backing();
        for vpn in region.vpns() {
            state.remove_page(asid, vpn, &backing);
        }
        debug!("{asid:?} unmaps {} pages at {addr:?}", region.pages);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;

    use common::config::PAGE_SIZE;
    use defines::error::errno;

    use super::{FilePage, FileSlice, FsLock};
    use crate::{
        address::{VirtAddr, VirtPageNum},
        hal::{AsId, File},
        page::PageType,
        sim::MemFile,
        test_utils::{new_vm, pattern},
    };

    const ASID: AsId = AsId(1);
    const BASE: VirtAddr = VirtAddr(0x1000_0000);

    #[test]
    fn short_read_fails_load() {
        let file = MemFile::open(&[1; 100]);
        let slice = FileSlice::new(file, 0, 200);
        let mut frame = [0xff; PAGE_SIZE];
        assert_eq!(slice.load(&mut frame, &FsLock::new()), Err(errno::EIO));
    }

    #[test]
    fn load_zero_fills_tail() {
        let file = MemFile::open(&pattern(300));
        let slice = FileSlice::new(file, 100, 150);
        let mut frame = [0xff; PAGE_SIZE];
        slice.load(&mut frame, &FsLock::new()).unwrap();
        assert_eq!(&frame[..150], &pattern(300)[100..250]);
        assert!(frame[150..].iter().all(|&b| b == 0));
        assert_eq!(slice.zero_bytes(), PAGE_SIZE - 150);
    }

    #[test]
    fn only_dirty_pages_are_written_back() {
        let fs = FsLock::new();
        let file = MemFile::open(&[0; PAGE_SIZE]);
        let page = FilePage::new(FileSlice::new(file.clone(), 0, PAGE_SIZE));
        let frame = [5; PAGE_SIZE];

        page.swap_out(&frame, false, &fs).unwrap();
        assert_eq!(file.stats().bytes_written(), 0);

        page.swap_out(&frame, true, &fs).unwrap();
        assert_eq!(file.stats().bytes_written(), PAGE_SIZE);
        assert_eq!(file.contents(), [5; PAGE_SIZE]);
        assert!(!fs.is_locked());
    }

    #[test]
    fn mmap_splits_partial_page() {
        let (vm, _) = new_vm(8, 8);
        vm.create_space(ASID).unwrap();
        let file = MemFile::open(&pattern(5000));
        let handle: Arc<dyn File> = file.clone();

        assert_eq!(vm.mmap(ASID, BASE, 5000, true, &handle, 0), Ok(BASE));
        assert_eq!(vm.spt_len(ASID), Ok(2));
        let first = vm.page_info(ASID, BASE).unwrap();
        let second = vm.page_info(ASID, BASE + PAGE_SIZE).unwrap();
        assert_eq!((first.ty, first.pending), (PageType::File, true));
        assert_eq!((first.read_bytes, first.zero_bytes), (Some(4096), Some(0)));
        assert_eq!((second.read_bytes, second.zero_bytes), (Some(904), Some(3192)));

        let mut buf = [0; 1000];
        vm.copy_from_user(ASID, BASE + 4096, &mut buf).unwrap();
        assert_eq!(&buf[..904], &pattern(5000)[4096..]);
        assert!(buf[904..].iter().all(|&b| b == 0));

        // 调用者关掉自己的句柄不影响映射
        drop(handle);
        vm.munmap(ASID, BASE).unwrap();
        assert_eq!(vm.spt_len(ASID), Ok(0));
        assert_eq!(file.stats().opens(), 2);
        assert_eq!(file.stats().closes(), 1);
        assert!(vm.page_info(ASID, BASE).is_none());
    }

    #[test]
    fn mmap_rejects_invalid_requests() {
        let (vm, _) = new_vm(4, 4);
        vm.create_space(ASID).unwrap();
        let file: Arc<dyn File> = MemFile::open(&[1; 10]);
        let empty: Arc<dyn File> = MemFile::open(&[]);

        assert_eq!(vm.mmap(ASID, BASE, 0, true, &file, 0), Err(errno::EINVAL));
        assert_eq!(vm.mmap(ASID, VirtAddr(0), 10, true, &file, 0), Err(errno::EINVAL));
        assert_eq!(vm.mmap(ASID, BASE + 1, 10, true, &file, 0), Err(errno::EINVAL));
        assert_eq!(vm.mmap(ASID, BASE, 10, true, &empty, 0), Err(errno::EBADF));
        assert_eq!(vm.mmap(ASID, BASE, 10, true, &file, 10), Err(errno::EINVAL));
        assert_eq!(
            vm.mmap(ASID, VirtAddr(0x80_0400_0000), 10, true, &file, 0),
            Err(errno::EINVAL)
        );
        assert_eq!(vm.mmap(AsId(9), BASE, 10, true, &file, 0), Err(errno::ESRCH));
        assert_eq!(vm.spt_len(ASID), Ok(0));
    }

    #[test]
    fn mmap_conflict_leaves_table_untouched() {
        let (vm, _) = new_vm(4, 4);
        vm.create_space(ASID).unwrap();
        let file = MemFile::open(&pattern(3 * PAGE_SIZE));
        let handle: Arc<dyn File> = file.clone();
        vm.mmap(ASID, BASE + PAGE_SIZE, PAGE_SIZE, false, &handle, 0)
            .unwrap();
        let before = vm.spt_len(ASID).unwrap();

        assert_eq!(
            vm.mmap(ASID, BASE, 3 * PAGE_SIZE, true, &handle, 0),
            Err(errno::EEXIST)
        );
        assert_eq!(vm.spt_len(ASID).unwrap(), before);
        // 冲突检查在 reopen 之前
        assert_eq!(file.stats().opens(), 2);
    }

    #[test]
    fn mmap_reopen_failure() {
        let (vm, _) = new_vm(4, 4);
        vm.create_space(ASID).unwrap();
        let file = MemFile::open(&[1; 10]);
        file.forbid_reopen();
        let handle: Arc<dyn File> = file;
        assert_eq!(vm.mmap(ASID, BASE, 10, true, &handle, 0), Err(errno::EBADF));
        assert_eq!(vm.spt_len(ASID), Ok(0));
    }

    #[test]
    fn munmap_writes_back_dirty_pages_only() {
        let (vm, _) = new_vm(8, 8);
        vm.create_space(ASID).unwrap();
        let file = MemFile::open(&pattern(2 * PAGE_SIZE));
        let handle: Arc<dyn File> = file.clone();
        vm.mmap(ASID, BASE, 2 * PAGE_SIZE, true, &handle, 0).unwrap();

        let mut buf = [0; 16];
        vm.copy_from_user(ASID, BASE, &mut buf).unwrap();
        vm.copy_to_user(ASID, BASE + PAGE_SIZE + 8, b"written").unwrap();
        vm.munmap(ASID, BASE).unwrap();

        assert_eq!(file.stats().bytes_written(), PAGE_SIZE);
        let contents = file.contents();
        assert_eq!(&contents[PAGE_SIZE + 8..PAGE_SIZE + 15], b"written");
        assert_eq!(&contents[..PAGE_SIZE], &pattern(2 * PAGE_SIZE)[..PAGE_SIZE]);
    }

    #[test]
    fn munmap_requires_mapping_start() {
        let (vm, _) = new_vm(4, 4);
        vm.create_space(ASID).unwrap();
        let handle: Arc<dyn File> = MemFile::open(&pattern(2 * PAGE_SIZE));
        vm.mmap(ASID, BASE, 2 * PAGE_SIZE, true, &handle, 0).unwrap();

        assert_eq!(vm.munmap(ASID, BASE + PAGE_SIZE), Err(errno::EINVAL));
        assert_eq!(vm.munmap(ASID, BASE + 8), Err(errno::EINVAL));
        assert_eq!(vm.spt_len(ASID), Ok(2));
        vm.munmap(ASID, BASE).unwrap();
        assert_eq!(vm.munmap(ASID, BASE), Err(errno::EINVAL));
        assert!(vm.page_info(ASID, VirtPageNum(0x1_0000).page_start()).is_none());
    }
}
