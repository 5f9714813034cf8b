//! 物理页框表与时钟置换
//!
//! 页框存放在 [`Slab`] 中，页描述符只持有 [`FrameId`]。页框与页之间的双向关联只能通过
//! [`FrameTable::bind`] 和 [`FrameTable::unbind`] 同时建立、同时解除

use alloc::{boxed::Box, vec::Vec};

use common::config::PAGE_SIZE;
use defines::error::{errno, KResult};
use slab::Slab;

use crate::{
    address::{PhysPageNum, VirtPageNum},
    hal::{AsId, Mmu, PhysMemory},
    page::{Backing, Page},
    space::page_of,
    VmState,
};

/// 页框在页框表中的句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameId(usize);

impl FrameId {
    pub(crate) const fn new(index: usize) -> Self {
        Self(index)
    }
}

/// 占用页框的页
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageOwner {
    pub asid: AsId,
    pub vpn: VirtPageNum,
}

#[derive(Debug)]
struct Frame {
    ppn: PhysPageNum,
    owner: Option<PageOwner>,
}

pub struct FrameTable {
    mem: Box<dyn PhysMemory>,
    frames: Slab<Frame>,
    /// 按分配顺序排列，时钟指针在其上循环
    clock: Vec<FrameId>,
    hand: usize,
    evictions: usize,
}

impl FrameTable {
    pub fn new(mem: Box<dyn PhysMemory>) -> Self {
        Self {
            mem,
            frames: Slab::new(),
            clock: Vec::new(),
            hand: 0,
            evictions: 0,
        }
    }

    /// 使用中的页框数
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn evictions(&self) -> usize {
        self.evictions
    }

    pub fn ppn(&self, id: FrameId) -> PhysPageNum {
        self.frames[id.0].ppn
    }

    pub fn owner(&self, id: FrameId) -> Option<PageOwner> {
        self.frames[id.0].owner
    }

    pub fn bytes(&self, id: FrameId) -> &[u8; PAGE_SIZE] {
        self.mem.page(self.ppn(id))
    }

    pub fn bytes_mut(&mut self, id: FrameId) -> &mut [u8; PAGE_SIZE] {
        let ppn = self.ppn(id);
        self.mem.page_mut(ppn)
    }

    /// 通过物理页号访问，供用户内存拷贝使用
    pub fn phys_page(&self, ppn: PhysPageNum) -> &[u8; PAGE_SIZE] {
        self.mem.page(ppn)
    }

    pub fn phys_page_mut(&mut self, ppn: PhysPageNum) -> &mut [u8; PAGE_SIZE] {
        self.mem.page_mut(ppn)
    }

    pub fn copy(&mut self, src: FrameId, dst: FrameId) {
        let data = *self.bytes(src);
        *self.bytes_mut(dst) = data;
    }

    /// 从物理页分配器直接拿一个页框，清零后交出
    fn alloc_fresh(&mut self) -> Option<FrameId> {
        let ppn = self.mem.alloc_page()?;
        self.mem.page_mut(ppn).fill(0);
        let id = FrameId(self.frames.insert(Frame { ppn, owner: None }));
        self.clock.push(id);
        Some(id)
    }

    /// 时钟算法挑选被置换的页框
    ///
    /// 访问位置位的页框清除访问位后跳过，第一个访问位为零的页框被选中。
    /// 扫两圈仍找不到，说明没有可以置换的页框
    fn pick_victim(&mut self, mmu: &mut dyn Mmu) -> Option<(FrameId, PageOwner)> {
        let n = self.clock.len();
        for _ in 0..2 * n {
            let id = self.clock[self.hand];
            self.hand = (self.hand + 1) % n;
            let Some(owner) = self.frames[id.0].owner else {
                continue;
            };
            if mmu.is_accessed(owner.asid, owner.vpn) {
                mmu.set_accessed(owner.asid, owner.vpn, false);
                continue;
            }
            return Some((id, owner));
        }
        None
    }

    /// 同时设置页框和页两侧的关联
    pub fn bind(&mut self, id: FrameId, page: &mut Page, asid: AsId) {
        let frame = &mut self.frames[id.0];
        assert!(frame.owner.is_none(), "{id:?} is already bound to {:?}", frame.owner);
        assert!(page.frame.is_none(), "{:?} is already resident", page.vpn());
        frame.owner = Some(PageOwner {
            asid,
            vpn: page.vpn(),
        });
        page.frame = Some(id);
    }

    /// 同时解除页框和页两侧的关联
    pub fn unbind(&mut self, id: FrameId, page: &mut Page) {
        let frame = &mut self.frames[id.0];
        assert_eq!(page.frame, Some(id), "{id:?} is not held by the page");
        assert_eq!(frame.owner.map(|owner| owner.vpn), Some(page.vpn()));
        frame.owner = None;
        page.frame = None;
    }

    /// 归还页框。页框必须已经解除关联
    pub fn release(&mut self, id: FrameId) {
        let frame = self.frames.remove(id.0);
        assert!(frame.owner.is_none(), "release {id:?} still owned by {:?}", frame.owner);
        let pos = self
            .clock
            .iter()
            .position(|&other| other == id)
            .unwrap_or_else(|| panic!("{id:?} is missing from the clock"));
        self.clock.remove(pos);
        if pos < self.hand {
            self.hand -= 1;
        }
        if self.hand >= self.clock.len() {
            self.hand = 0;
        }
        self.mem.dealloc_page(frame.ppn);
    }
}

impl VmState {
    /// 分配一个清零的页框，物理内存耗尽时置换一个页面
    ///
    /// 被置换的页面写出失败时（如交换分区已满）返回错误，不会重试
    pub(crate) fn acquire_frame(&mut self, backing: &Backing<'_>) -> KResult<FrameId> {
        if let Some(id) = self.frames.alloc_fresh() {
            return Ok(id);
        }
        let Some((id, owner)) = self.frames.pick_victim(&mut *self.mmu) else {
            error!("no frame can be evicted");
            return Err(errno::ENOMEM);
        };

        let page = page_of(&mut self.spaces, owner.asid, owner.vpn);
        let dirty = self.mmu.is_dirty(owner.asid, owner.vpn);
        page.swap_out(self.frames.bytes(id), dirty, backing)?;
        self.mmu.unmap(owner.asid, owner.vpn);
        self.frames.unbind(id, page);

        self.frames.bytes_mut(id).fill(0);
        self.frames.evictions += 1;
        debug!(
            "evict {:?} of {:?}, dirty {dirty}",
            owner.vpn.page_start(),
            owner.asid
        );
        Ok(id)
    }
}
