//! 匿名页与交换分区
//!
//! 交换分区按页大小切成若干槽，用位图记录占用情况。匿名页被换出时占用一个槽，
//! 换入后立即归还

use alloc::{boxed::Box, vec, vec::Vec};

use common::config::{PAGE_SIZE, SECTORS_PER_PAGE, SECTOR_SIZE};
use defines::error::{errno, KResult};

use crate::hal::BlockDevice;

/// 交换槽编号
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapSlot(usize);

impl SwapSlot {
    pub fn index(self) -> usize {
        self.0
    }

    fn first_sector(self) -> usize {
        self.0 * SECTORS_PER_PAGE
    }
}

pub struct SwapTable {
    disk: Box<dyn BlockDevice>,
    bitmap: Vec<u64>,
    capacity: usize,
    used: usize,
}

impl SwapTable {
    /// 槽的数量是设备扇区数除以每页扇区数，多余的扇区不用
    pub fn new(disk: Box<dyn BlockDevice>) -> Self {
        let capacity = disk.num_sectors() / SECTORS_PER_PAGE;
        debug!("swap device holds {capacity} slots");
        Self {
            disk,
            bitmap: vec![0; capacity.div_ceil(u64::BITS as usize)],
            capacity,
            used: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn is_used(&self, slot: SwapSlot) -> bool {
        let (word, bit) = Self::locate(slot);
        self.bitmap[word] & (1 << bit) != 0
    }

    /// 找到第一个空闲槽并占用它
    pub fn alloc_slot(&mut self) -> Option<SwapSlot> {
        let (word, bits) = self
            .bitmap
            .iter_mut()
            .enumerate()
            .find(|(_, bits)| **bits != u64::MAX)?;
        let bit = bits.trailing_ones() as usize;
        let index = word * u64::BITS as usize + bit;
        if index >= self.capacity {
            return None;
        }
        *bits |= 1 << bit;
        self.used += 1;
        Some(SwapSlot(index))
    }

    pub fn free_slot(&mut self, slot: SwapSlot) {
        let (word, bit) = Self::locate(slot);
        assert!(
            self.bitmap[word] & (1 << bit) != 0,
            "{slot:?} is freed but not in use"
        );
        self.bitmap[word] &= !(1 << bit);
        self.used -= 1;
    }

    pub fn write_slot(&mut self, slot: SwapSlot, page: &[u8; PAGE_SIZE]) {
        for (i, sector) in page.chunks_exact(SECTOR_SIZE).enumerate() {
            self.disk.write_sector(slot.first_sector() + i, sector);
        }
    }

    pub fn read_slot(&mut self, slot: SwapSlot, page: &mut [u8; PAGE_SIZE]) {
        for (i, sector) in page.chunks_exact_mut(SECTOR_SIZE).enumerate() {
            self.disk.read_sector(slot.first_sector() + i, sector);
        }
    }

    fn locate(slot: SwapSlot) -> (usize, usize) {
        let bits = u64::BITS as usize;
        (slot.0 / bits, slot.0 % bits)
    }
}

/// 匿名页的后备信息。驻留或从未换出时没有交换槽
#[derive(Debug)]
pub struct AnonPage {
    slot: Option<SwapSlot>,
    stack: bool,
}

impl AnonPage {
    pub fn new(stack: bool) -> Self {
        Self { slot: None, stack }
    }

    pub fn slot(&self) -> Option<SwapSlot> {
        self.slot
    }

    pub fn is_stack(&self) -> bool {
        self.stack
    }

    /// 从交换槽读回页面并归还该槽。没有交换槽说明内容已经丢失
    pub fn swap_in(&mut self, frame: &mut [u8; PAGE_SIZE], swap: &mut SwapTable) -> KResult<()> {
        let Some(slot) = self.slot.take() else {
            error!("anonymous page has no swap slot to swap in");
            return Err(errno::EIO);
        };
        swap.read_slot(slot, frame);
        swap.free_slot(slot);
        trace!("swap in from slot {}", slot.index());
        Ok(())
    }

    /// 写入一个空闲交换槽。交换分区满时返回 `ENOMEM`，页面保持原样
    pub fn swap_out(&mut self, frame: &[u8; PAGE_SIZE], swap: &mut SwapTable) -> KResult<()> {
        debug_assert!(self.slot.is_none());
        let Some(slot) = swap.alloc_slot() else {
            error!("swap device is full ({} slots)", swap.capacity());
            return Err(errno::ENOMEM);
        };
        swap.write_slot(slot, frame);
        self.slot = Some(slot);
        trace!("swap out to slot {}", slot.index());
        Ok(())
    }

    /// 复制一个已换出页面的内容，不影响原有的交换槽
    pub fn peek(&self, frame: &mut [u8; PAGE_SIZE], swap: &mut SwapTable) -> KResult<()> {
        let slot = self.slot.ok_or(errno::EIO)?;
        swap.read_slot(slot, frame);
        Ok(())
    }

    pub fn destroy(self, swap: &mut SwapTable) {
        if let Some(slot) = self.slot {
            swap.free_slot(slot);
        }
    }
}
