//! 本模块之外的协作者：物理页分配、硬件页表、文件系统、块设备
//!
//! 虚存核心只通过这里的 trait 使用它们

use alloc::sync::Arc;

use common::config::{PAGE_SIZE, SECTOR_SIZE};

use crate::address::{PhysPageNum, VirtPageNum};

/// 地址空间标识，由进程管理分配，通常就是 pid
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AsId(pub usize);

/// 原始的物理页分配器，同时负责给出物理页在内核中的可访问视图
pub trait PhysMemory: Send {
    /// 分配一个物理页。物理内存耗尽时返回 `None`
    fn alloc_page(&mut self) -> Option<PhysPageNum>;
    fn dealloc_page(&mut self, ppn: PhysPageNum);
    fn page(&self, ppn: PhysPageNum) -> &[u8; PAGE_SIZE];
    fn page_mut(&mut self, ppn: PhysPageNum) -> &mut [u8; PAGE_SIZE];
}

/// 硬件页表。各个操作都假定是原子的
pub trait Mmu: Send {
    /// 建立 `vpn -> ppn` 的映射。需要分配页表节点但分配失败时返回 `false`
    fn map(&mut self, asid: AsId, vpn: VirtPageNum, ppn: PhysPageNum, writable: bool) -> bool;
    /// 清除映射，同时清掉 A/D 位。映射本就不存在时什么也不做
    fn unmap(&mut self, asid: AsId, vpn: VirtPageNum);
    /// 返回映射到的物理页以及是否可写
    fn translate(&self, asid: AsId, vpn: VirtPageNum) -> Option<(PhysPageNum, bool)>;
    fn is_accessed(&self, asid: AsId, vpn: VirtPageNum) -> bool;
    fn set_accessed(&mut self, asid: AsId, vpn: VirtPageNum, accessed: bool);
    fn is_dirty(&self, asid: AsId, vpn: VirtPageNum) -> bool;
    fn set_dirty(&mut self, asid: AsId, vpn: VirtPageNum, dirty: bool);
}

/// 打开的文件。
///
/// 句柄以 `Arc<dyn File>` 的形式共享，最后一个 `Arc` 被释放时即关闭文件
pub trait File: Send + Sync {
    /// 从 `offset` 处读入 `buf`，返回实际读到的字节数
    fn read_at(&self, buf: &mut [u8], offset: usize) -> usize;
    /// 从 `offset` 处写入 `buf`，返回实际写入的字节数
    fn write_at(&self, buf: &[u8], offset: usize) -> usize;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// 为同一个文件打开一个独立的新句柄
    fn reopen(&self) -> Option<Arc<dyn File>>;
}

/// 交换分区所在的块设备，以扇区为单位读写
pub trait BlockDevice: Send {
    fn num_sectors(&self) -> usize;
    /// `buf` 的长度必须是 [`SECTOR_SIZE`]
    fn read_sector(&mut self, sector: usize, buf: &mut [u8]);
    /// `buf` 的长度必须是 [`SECTOR_SIZE`]
    fn write_sector(&mut self, sector: usize, buf: &[u8]);
}

const _: () = assert!(PAGE_SIZE % SECTOR_SIZE == 0);
