//! 按需分页的虚拟内存管理
//!
//! 页面在第一次访问时才真正分配物理页框并载入内容；物理内存不足时用时钟算法置换页面，
//! 匿名页换出到交换分区，文件映射页写回文件。fork 时为子进程建立私有副本。
//!
//! 硬件页表、物理页分配、文件系统和块设备都是外部协作者，见 [`hal`]

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
extern crate kernel_tracer;

pub mod address;
pub mod anon;
pub mod fault;
pub mod file;
mod fork;
pub mod frame;
pub mod hal;
pub mod page;
pub mod sim;
pub mod space;
pub mod spt;
mod user_access;

pub use address::{PhysPageNum, VirtAddr, VirtPageNum};
pub use anon::SwapSlot;
pub use fault::PageFault;
pub use file::{FileSlice, FsLock};
pub use page::{PageInfo, PageInit, PageType};

use alloc::{boxed::Box, vec::Vec};

use common::config::{STACK_FAULT_SLACK, USER_STACK_LIMIT, USER_STACK_TOP};
use defines::error::{errno, KResult};
use hashbrown::HashMap;
use klocks::{Once, SpinMutex};

use crate::{
    anon::SwapTable,
    frame::FrameTable,
    hal::{AsId, BlockDevice, Mmu, PhysMemory},
    page::{Backing, Page},
    space::MemorySpace,
};

/// 运行时可调的参数，默认值来自 [`common::config`]
#[derive(Debug, Clone, Copy)]
pub struct VmConfig {
    /// 用户栈顶（不含）
    pub stack_top: VirtAddr,
    /// 栈最多增长到这里
    pub stack_floor: VirtAddr,
    /// 允许访问栈指针之下多远，如 push 指令先访存再移动栈指针
    pub stack_slack: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            stack_top: VirtAddr(USER_STACK_TOP),
            stack_floor: VirtAddr(USER_STACK_TOP - USER_STACK_LIMIT),
            stack_slack: STACK_FAULT_SLACK,
        }
    }
}

impl VmConfig {
    /// 栈指针为 `sp` 时，对 `addr` 的缺页是否应当扩展栈
    pub fn is_stack_access(&self, addr: VirtAddr, sp: VirtAddr) -> bool {
        !addr.is_kernel()
            && addr.0 >= sp.0.saturating_sub(self.stack_slack)
            && addr < self.stack_top
            && addr.vpn_floor().page_start() >= self.stack_floor
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VmStats {
    pub frames_in_use: usize,
    pub resident_pages: usize,
    pub swap_slots_used: usize,
    pub evictions: usize,
}

/// 虚存子系统的全部状态
///
/// 加锁顺序为 `state` → `swap`、`state` → `fs`
pub struct Vm {
    config: VmConfig,
    state: SpinMutex<VmState>,
    swap: SpinMutex<SwapTable>,
    fs: FsLock,
}

/// 页框表、硬件页表以及每个地址空间，它们总是一起修改
pub(crate) struct VmState {
    pub(crate) frames: FrameTable,
    pub(crate) mmu: Box<dyn Mmu>,
    pub(crate) spaces: HashMap<AsId, MemorySpace>,
}

impl VmState {
    pub(crate) fn space_mut(&mut self, asid: AsId) -> KResult<&mut MemorySpace> {
        self.spaces.get_mut(&asid).ok_or(errno::ESRCH)
    }
}

impl Vm {
    pub fn new(
        config: VmConfig,
        mem: Box<dyn PhysMemory>,
        mmu: Box<dyn Mmu>,
        swap_disk: Box<dyn BlockDevice>,
    ) -> Self {
        let swap = SwapTable::new(swap_disk);
        info!(
            "vm initialized, stack {:?}..{:?}, {} swap slots",
            config.stack_floor,
            config.stack_top,
            swap.capacity()
        );
        Self {
            config,
            state: SpinMutex::new(VmState {
                frames: FrameTable::new(mem),
                mmu,
                spaces: HashMap::new(),
            }),
            swap: SpinMutex::new(swap),
            fs: FsLock::new(),
        }
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    /// 文件系统大锁，系统调用层访问文件时也要持有它
    pub fn fs_lock(&self) -> &FsLock {
        &self.fs
    }

    pub(crate) fn backing(&self) -> Backing<'_> {
        Backing {
            swap: &self.swap,
            fs: &self.fs,
        }
    }

    /// 为新进程建立空的地址空间
    pub fn create_space(&self, asid: AsId) -> KResult<()> {
        let mut state = self.state.lock();
        if state.spaces.contains_key(&asid) {
            warn!("{asid:?} already exists");
            return Err(errno::EEXIST);
        }
        state.spaces.insert(asid, MemorySpace::new());
        trace!("create {asid:?}");
        Ok(())
    }

    /// 进程退出时销毁地址空间，释放所有页框和交换槽，脏的文件映射页写回
    pub fn destroy_space(&self, asid: AsId) -> KResult<()> {
        let mut state = self.state.lock();
        state.space_mut(asid)?;
        state.teardown_space(asid, &self.backing());
        Ok(())
    }

    /// 登记一个未初始化的页，内容在第一次访问时按 `init` 载入
    pub fn alloc_page(
        &self,
        asid: AsId,
        va: VirtAddr,
        writable: bool,
        init: PageInit,
    ) -> KResult<()> {
        if va.is_null() || va.is_kernel() || !va.is_page_aligned() {
            warn!("cannot allocate page at {va:?}");
            return Err(errno::EINVAL);
        }
        let mut state = self.state.lock();
        state
            .space_mut(asid)?
            .spt
            .insert(Page::new(va.vpn_floor(), writable, init))?;
        Ok(())
    }

    pub fn page_info(&self, asid: AsId, va: VirtAddr) -> Option<PageInfo> {
        let state = self.state.lock();
        let space = state.spaces.get(&asid)?;
        space.spt.find(va.vpn_floor()).map(Page::info)
    }

    /// 地址空间中登记的页数
    pub fn spt_len(&self, asid: AsId) -> KResult<usize> {
        Ok(self.state.lock().space_mut(asid)?.spt.len())
    }

    /// 陷入内核时记录用户栈指针
    pub fn set_user_sp(&self, asid: AsId, sp: VirtAddr) -> KResult<()> {
        self.state.lock().space_mut(asid)?.user_sp = Some(sp);
        Ok(())
    }

    pub fn stats(&self) -> VmStats {
        let state = self.state.lock();
        let swap_slots_used = self.swap.lock().used();
        VmStats {
            frames_in_use: state.frames.len(),
            resident_pages: state
                .spaces
                .values()
                .map(|space| space.spt.resident_count())
                .sum(),
            swap_slots_used,
            evictions: state.frames.evictions(),
        }
    }

    /// 关机前销毁所有地址空间
    pub fn shutdown(&self) {
        let mut state = self.state.lock();
        let backing = self.backing();
        let asids: Vec<_> = state.spaces.keys().copied().collect();
        for asid in asids {
            state.teardown_space(asid, &backing);
        }
        info!("vm shut down, {} frames still in use", state.frames.len());
    }
}

static VM: Once<Vm> = Once::new();

/// 初始化全局的虚存子系统，只有第一次调用生效
pub fn init(vm: Vm) -> &'static Vm {
    VM.call_once(|| vm)
}

pub fn get() -> Option<&'static Vm> {
    VM.get()
}
