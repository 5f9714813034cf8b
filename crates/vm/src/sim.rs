//! 协作者的宿主机模型：有界的物理内存、软件页表、内存盘以及内存文件
//!
//! 用于单元测试，也可以在宿主机上直接驱动整个虚存子系统。除 [`SimPhysMemory`] 外都是
//! 可以 `clone` 的句柄，内部状态共享，方便交给 [`Vm`](crate::Vm) 之后仍能从外部观察

use alloc::{boxed::Box, sync::Arc, vec, vec::Vec};
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use bitflags::bitflags;
use common::config::{PAGE_SIZE, SECTOR_SIZE};
use hashbrown::HashMap;
use klocks::SpinMutex;

use crate::{
    address::{PhysPageNum, VirtPageNum},
    hal::{AsId, BlockDevice, File, Mmu, PhysMemory},
};

const BUDDY_ORDER: usize = 32;

/// 模拟物理内存的起始页号，对应物理地址 `0x8000_0000`
const SIM_MEMORY_BASE: usize = 0x8_0000;

/// 只有 `frames` 个物理页的内存
pub struct SimPhysMemory {
    allocator: buddy_system_allocator::FrameAllocator<BUDDY_ORDER>,
    pages: Vec<Box<[u8; PAGE_SIZE]>>,
}

impl SimPhysMemory {
    pub fn new(frames: usize) -> Self {
        let mut allocator = buddy_system_allocator::FrameAllocator::new();
        allocator.add_frame(SIM_MEMORY_BASE, SIM_MEMORY_BASE + frames);
        Self {
            allocator,
            pages: (0..frames).map(|_| Box::new([0; PAGE_SIZE])).collect(),
        }
    }

    fn index(&self, ppn: PhysPageNum) -> usize {
        let index = ppn.0.wrapping_sub(SIM_MEMORY_BASE);
        assert!(index < self.pages.len(), "{ppn:?} is out of simulated memory");
        index
    }
}

impl PhysMemory for SimPhysMemory {
    fn alloc_page(&mut self) -> Option<PhysPageNum> {
        self.allocator.alloc(1).map(PhysPageNum)
    }

    fn dealloc_page(&mut self, ppn: PhysPageNum) {
        self.index(ppn);
        self.allocator.dealloc(ppn.0, 1);
    }

    fn page(&self, ppn: PhysPageNum) -> &[u8; PAGE_SIZE] {
        &self.pages[self.index(ppn)]
    }

    fn page_mut(&mut self, ppn: PhysPageNum) -> &mut [u8; PAGE_SIZE] {
        let index = self.index(ppn);
        &mut self.pages[index]
    }
}

bitflags! {
    /// page table entry flags
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PTEFlags: u16 {
        const V = 1 << 0;
        const R = 1 << 1;
        const W = 1 << 2;
        const U = 1 << 4;
        const A = 1 << 6;
        const D = 1 << 7;
    }
}

/// page table entry structure
#[derive(Copy, Clone, Debug)]
#[repr(C)]
pub struct PageTableEntry {
    bits: usize,
}

impl PageTableEntry {
    pub fn new(ppn: PhysPageNum, flags: PTEFlags) -> Self {
        PageTableEntry {
            bits: ppn.0 << 10 | flags.bits() as usize,
        }
    }

    pub fn ppn(&self) -> PhysPageNum {
        const LOW_44_MASK: usize = (1 << 44) - 1;
        PhysPageNum((self.bits >> 10) & LOW_44_MASK)
    }

    pub fn flags(&self) -> PTEFlags {
        PTEFlags::from_bits_truncate(self.bits as u16)
    }

    fn set_flag(&mut self, flag: PTEFlags, value: bool) {
        let mut flags = self.flags();
        flags.set(flag, value);
        *self = Self::new(self.ppn(), flags);
    }
}

#[derive(Default)]
struct SoftMmuInner {
    entries: HashMap<(AsId, VirtPageNum), PageTableEntry>,
    /// 还能新建多少条映射，`None` 表示不限
    map_budget: Option<usize>,
}

/// 用散列表模拟的页表，以 `(AsId, vpn)` 为键存放叶子页表项
#[derive(Clone, Default)]
pub struct SoftMmu {
    inner: Arc<SpinMutex<SoftMmuInner>>,
}

impl SoftMmu {
    pub fn new() -> Self {
        Self::default()
    }

    /// 模拟硬件的一次访存：置 A 位，写访问再置 D 位。映射不存在时返回 `false`
    pub fn touch(&self, asid: AsId, vpn: VirtPageNum, write: bool) -> bool {
        let mut inner = self.inner.lock();
        let Some(pte) = inner.entries.get_mut(&(asid, vpn)) else {
            return false;
        };
        pte.set_flag(PTEFlags::A, true);
        if write {
            pte.set_flag(PTEFlags::D, true);
        }
        true
    }

    /// 之后最多再成功建立 `budget` 条映射，用来模拟页表节点分配失败
    pub fn limit_maps(&self, budget: Option<usize>) {
        self.inner.lock().map_budget = budget;
    }

    pub fn entry(&self, asid: AsId, vpn: VirtPageNum) -> Option<PageTableEntry> {
        self.inner.lock().entries.get(&(asid, vpn)).copied()
    }

    /// 某个地址空间中有效映射的数量
    pub fn mapped_count(&self, asid: AsId) -> usize {
        self.inner
            .lock()
            .entries
            .keys()
            .filter(|(id, _)| *id == asid)
            .count()
    }

    fn update(&self, asid: AsId, vpn: VirtPageNum, flag: PTEFlags, value: bool) {
        if let Some(pte) = self.inner.lock().entries.get_mut(&(asid, vpn)) {
            pte.set_flag(flag, value);
        }
    }

    fn test(&self, asid: AsId, vpn: VirtPageNum, flag: PTEFlags) -> bool {
        self.entry(asid, vpn)
            .is_some_and(|pte| pte.flags().contains(flag))
    }
}

impl Mmu for SoftMmu {
    fn map(&mut self, asid: AsId, vpn: VirtPageNum, ppn: PhysPageNum, writable: bool) -> bool {
        let mut inner = self.inner.lock();
        if let Some(budget) = &mut inner.map_budget {
            if *budget == 0 {
                return false;
            }
            *budget -= 1;
        }
        let mut flags = PTEFlags::V | PTEFlags::R | PTEFlags::U;
        flags.set(PTEFlags::W, writable);
        let old = inner
            .entries
            .insert((asid, vpn), PageTableEntry::new(ppn, flags));
        debug_assert!(old.is_none(), "{vpn:?} is mapped before mapping");
        true
    }

    fn unmap(&mut self, asid: AsId, vpn: VirtPageNum) {
        self.inner.lock().entries.remove(&(asid, vpn));
    }

    fn translate(&self, asid: AsId, vpn: VirtPageNum) -> Option<(PhysPageNum, bool)> {
        self.entry(asid, vpn)
            .map(|pte| (pte.ppn(), pte.flags().contains(PTEFlags::W)))
    }

    fn is_accessed(&self, asid: AsId, vpn: VirtPageNum) -> bool {
        self.test(asid, vpn, PTEFlags::A)
    }

    fn set_accessed(&mut self, asid: AsId, vpn: VirtPageNum, accessed: bool) {
        self.update(asid, vpn, PTEFlags::A, accessed);
    }

    fn is_dirty(&self, asid: AsId, vpn: VirtPageNum) -> bool {
        self.test(asid, vpn, PTEFlags::D)
    }

    fn set_dirty(&mut self, asid: AsId, vpn: VirtPageNum, dirty: bool) {
        self.update(asid, vpn, PTEFlags::D, dirty);
    }
}

struct RamDiskInner {
    sectors: SpinMutex<Vec<[u8; SECTOR_SIZE]>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

/// 放在内存里的块设备，记录读写的扇区数
#[derive(Clone)]
pub struct RamDisk {
    inner: Arc<RamDiskInner>,
}

impl RamDisk {
    pub fn new(num_sectors: usize) -> Self {
        Self {
            inner: Arc::new(RamDiskInner {
                sectors: SpinMutex::new(vec![[0; SECTOR_SIZE]; num_sectors]),
                reads: AtomicUsize::new(0),
                writes: AtomicUsize::new(0),
            }),
        }
    }

    /// 能放下 `slots` 个页的盘
    pub fn with_slots(slots: usize) -> Self {
        Self::new(slots * (PAGE_SIZE / SECTOR_SIZE))
    }

    pub fn sectors_read(&self) -> usize {
        self.inner.reads.load(Ordering::Relaxed)
    }

    pub fn sectors_written(&self) -> usize {
        self.inner.writes.load(Ordering::Relaxed)
    }
}

impl BlockDevice for RamDisk {
    fn num_sectors(&self) -> usize {
        self.inner.sectors.lock().len()
    }

    fn read_sector(&mut self, sector: usize, buf: &mut [u8]) {
        buf.copy_from_slice(&self.inner.sectors.lock()[sector]);
        self.inner.reads.fetch_add(1, Ordering::Relaxed);
    }

    fn write_sector(&mut self, sector: usize, buf: &[u8]) {
        self.inner.sectors.lock()[sector].copy_from_slice(buf);
        self.inner.writes.fetch_add(1, Ordering::Relaxed);
    }
}

/// 内存文件的打开、关闭和读写统计，同一文件的所有句柄共用
#[derive(Default, Debug)]
pub struct FileStats {
    opens: AtomicUsize,
    closes: AtomicUsize,
    bytes_read: AtomicUsize,
    bytes_written: AtomicUsize,
}

impl FileStats {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::Relaxed)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::Relaxed)
    }

    pub fn bytes_read(&self) -> usize {
        self.bytes_read.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> usize {
        self.bytes_written.load(Ordering::Relaxed)
    }
}

struct MemFileInner {
    data: SpinMutex<Vec<u8>>,
    stats: FileStats,
    can_reopen: AtomicBool,
}

/// 内存文件的一个句柄。`reopen` 得到的句柄与之共享内容，句柄被 drop 即视为关闭
pub struct MemFile {
    inner: Arc<MemFileInner>,
}

impl MemFile {
    pub fn open(data: &[u8]) -> Arc<Self> {
        let inner = Arc::new(MemFileInner {
            data: SpinMutex::new(data.to_vec()),
            stats: FileStats::default(),
            can_reopen: AtomicBool::new(true),
        });
        inner.stats.opens.fetch_add(1, Ordering::Relaxed);
        Arc::new(Self { inner })
    }

    pub fn stats(&self) -> &FileStats {
        &self.inner.stats
    }

    pub fn contents(&self) -> Vec<u8> {
        self.inner.data.lock().clone()
    }

    /// 截断文件，之后越过新长度的读取都会是短读
    pub fn truncate(&self, len: usize) {
        self.inner.data.lock().truncate(len);
    }

    /// 让之后的 `reopen` 失败，模拟打开文件数耗尽
    pub fn forbid_reopen(&self) {
        self.inner
            .can_reopen
            .store(false, Ordering::Relaxed);
    }
}

impl File for MemFile {
    fn read_at(&self, buf: &mut [u8], offset: usize) -> usize {
        let data = self.inner.data.lock();
        let Some(src) = data.get(offset..) else {
            return 0;
        };
        let len = src.len().min(buf.len());
        buf[..len].copy_from_slice(&src[..len]);
        self.inner.stats.bytes_read.fetch_add(len, Ordering::Relaxed);
        len
    }

    fn write_at(&self, buf: &[u8], offset: usize) -> usize {
        let mut data = self.inner.data.lock();
        if data.len() < offset + buf.len() {
            data.resize(offset + buf.len(), 0);
        }
        data[offset..offset + buf.len()].copy_from_slice(buf);
        self.inner
            .stats
            .bytes_written
            .fetch_add(buf.len(), Ordering::Relaxed);
        buf.len()
    }

    fn len(&self) -> usize {
        self.inner.data.lock().len()
    }

    fn reopen(&self) -> Option<Arc<dyn File>> {
        if !self.inner.can_reopen.load(Ordering::Relaxed) {
            return None;
        }
        self.inner.stats.opens.fetch_add(1, Ordering::Relaxed);
        Some(Arc::new(MemFile {
            inner: Arc::clone(&self.inner),
        }))
    }
}

impl Drop for MemFile {
    fn drop(&mut self) {
        self.inner.stats.closes.fetch_add(1, Ordering::Relaxed);
    }
}
