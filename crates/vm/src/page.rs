//! 页描述符
//!
//! 一个页在 SPT 中的全部信息：是否可写、占用哪个物理页框、以及由哪种后备存储负责。
//! 三种后备存储在 [`PageKind`] 中穷尽匹配，每一种操作都必须处理全部情况

use common::config::PAGE_SIZE;
use defines::error::KResult;
use klocks::SpinMutex;

use crate::{
    address::VirtPageNum,
    anon::{AnonPage, SwapSlot, SwapTable},
    file::{FilePage, FileSlice, FsLock},
    frame::FrameId,
};

/// 页面第一次被访问时如何初始化
#[derive(Clone, Debug)]
pub enum PageInit {
    /// 全零的匿名页
    Zero { stack: bool },
    /// 从可执行文件段中载入的匿名页，之后与文件再无关系
    Segment(FileSlice),
    /// 文件映射页
    Mapped(FileSlice),
}

/// 页面的后备存储
#[derive(Debug)]
pub enum PageKind {
    Uninit(PageInit),
    Anon(AnonPage),
    File(FilePage),
}

/// 页面实际（或初始化后将会）属于的类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    Anon,
    File,
}

/// 对外暴露的页面状态快照
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageInfo {
    pub ty: PageType,
    /// 还没有初始化过
    pub pending: bool,
    pub writable: bool,
    pub resident: bool,
    pub stack: bool,
    pub swap_slot: Option<SwapSlot>,
    /// 来自文件的部分，只有以文件为来源的页才有
    pub read_bytes: Option<usize>,
    pub zero_bytes: Option<usize>,
}

/// 后备存储的 I/O 所需的共享资源。交换表只在确实要读写交换分区时才上锁
pub(crate) struct Backing<'a> {
    pub swap: &'a SpinMutex<SwapTable>,
    pub fs: &'a FsLock,
}

#[derive(Debug)]
pub struct Page {
    vpn: VirtPageNum,
    writable: bool,
    /// 只能由 [`FrameTable::bind`](crate::frame::FrameTable::bind) 和
    /// [`FrameTable::unbind`](crate::frame::FrameTable::unbind) 修改
    pub(crate) frame: Option<FrameId>,
    kind: PageKind,
}

impl Page {
    pub fn new(vpn: VirtPageNum, writable: bool, init: PageInit) -> Self {
        Self::with_kind(vpn, writable, PageKind::Uninit(init))
    }

    pub(crate) fn with_kind(vpn: VirtPageNum, writable: bool, kind: PageKind) -> Self {
        Self {
            vpn,
            writable,
            frame: None,
            kind,
        }
    }

    pub fn vpn(&self) -> VirtPageNum {
        self.vpn
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    pub fn frame(&self) -> Option<FrameId> {
        self.frame
    }

    pub fn is_resident(&self) -> bool {
        self.frame.is_some()
    }

    pub fn kind(&self) -> &PageKind {
        &self.kind
    }

    pub fn info(&self) -> PageInfo {
        let (ty, pending, stack, swap_slot, slice) = match &self.kind {
            PageKind::Uninit(PageInit::Zero { stack }) => (PageType::Anon, true, *stack, None, None),
            PageKind::Uninit(PageInit::Segment(slice)) => {
                (PageType::Anon, true, false, None, Some(slice))
            }
            PageKind::Uninit(PageInit::Mapped(slice)) => {
                (PageType::File, true, false, None, Some(slice))
            }
            PageKind::Anon(anon) => (PageType::Anon, false, anon.is_stack(), anon.slot(), None),
            PageKind::File(file) => (PageType::File, false, false, None, Some(file.slice())),
        };
        PageInfo {
            ty,
            pending,
            writable: self.writable,
            resident: self.is_resident(),
            stack,
            swap_slot,
            read_bytes: slice.map(FileSlice::read_bytes),
            zero_bytes: slice.map(FileSlice::zero_bytes),
        }
    }

    /// 填充刚分配给本页的物理页框：第一次访问时执行初始化，否则从后备存储换入
    ///
    /// 初始化失败时本页保持未初始化状态，可以再次尝试
    pub(crate) fn materialize(
        &mut self,
        frame: &mut [u8; PAGE_SIZE],
        backing: &Backing<'_>,
    ) -> KResult<()> {
        debug_assert!(self.is_resident());
        match &mut self.kind {
            PageKind::Uninit(init) => {
                let kind = match init {
                    // 页框交出时已经清零
                    PageInit::Zero { stack } => PageKind::Anon(AnonPage::new(*stack)),
                    PageInit::Segment(slice) => {
                        slice.load(frame, backing.fs)?;
                        PageKind::Anon(AnonPage::new(false))
                    }
                    PageInit::Mapped(slice) => {
                        slice.load(frame, backing.fs)?;
                        PageKind::File(FilePage::new(slice.clone()))
                    }
                };
                trace!("initialize {:?}", self.vpn.page_start());
                self.kind = kind;
                Ok(())
            }
            PageKind::Anon(anon) => anon.swap_in(frame, &mut backing.swap.lock()),
            PageKind::File(file) => file.swap_in(frame, backing.fs),
        }
    }

    /// 把页框中的内容交给后备存储保管。失败时本页不变
    pub(crate) fn swap_out(
        &mut self,
        frame: &[u8; PAGE_SIZE],
        dirty: bool,
        backing: &Backing<'_>,
    ) -> KResult<()> {
        match &mut self.kind {
            PageKind::Uninit(_) => panic!("resident page {:?} is uninitialized", self.vpn),
            PageKind::Anon(anon) => anon.swap_out(frame, &mut backing.swap.lock()),
            PageKind::File(file) => file.swap_out(frame, dirty, backing.fs),
        }
    }

    /// 释放后备存储中的资源。`frame` 是本页仍驻留时页框中的内容
    pub(crate) fn destroy(
        self,
        frame: Option<&[u8; PAGE_SIZE]>,
        dirty: bool,
        backing: &Backing<'_>,
    ) {
        debug_assert!(self.frame.is_none(), "destroy a page still bound to a frame");
        match self.kind {
            PageKind::Uninit(_) => {}
            PageKind::Anon(anon) => anon.destroy(&mut backing.swap.lock()),
            PageKind::File(file) => file.destroy(frame, dirty, backing.fs),
        }
    }
}
