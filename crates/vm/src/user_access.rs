//! 内核访问用户内存
//!
//! 逐页解析用户地址，遇到尚未驻留的页就像内核态缺页一样把它调入，
//! 并像硬件那样设置访问位和脏位

use core::ops::Range;

use common::config::PAGE_SIZE;
use defines::error::{errno, KResult};

use crate::{
    address::{PhysPageNum, VirtAddr},
    fault::PageFault,
    hal::AsId,
    Vm, VmState,
};

impl Vm {
    /// 从用户地址 `va` 读取 `buf.len()` 字节
    pub fn copy_from_user(&self, asid: AsId, va: VirtAddr, buf: &mut [u8]) -> KResult<()> {
        self.walk_user(asid, va, buf.len(), false, |state, ppn, in_page, in_buf| {
            buf[in_buf].copy_from_slice(&state.frames.phys_page(ppn)[in_page]);
        })
    }

    /// 向用户地址 `va` 写入 `data`，目标页必须可写
    pub fn copy_to_user(&self, asid: AsId, va: VirtAddr, data: &[u8]) -> KResult<()> {
        self.walk_user(asid, va, data.len(), true, |state, ppn, in_page, in_buf| {
            state.frames.phys_page_mut(ppn)[in_page].copy_from_slice(&data[in_buf]);
        })
    }

    /// 对 `[va, va + len)` 覆盖的每一页调用 `copy`，
    /// 参数为页内的范围以及对应的缓冲区范围
    fn walk_user(
        &self,
        asid: AsId,
        va: VirtAddr,
        len: usize,
        write: bool,
        mut copy: impl FnMut(&mut VmState, PhysPageNum, Range<usize>, Range<usize>),
    ) -> KResult<()> {
        if va.0.checked_add(len).is_none() {
            return Err(errno::EFAULT);
        }
        let mut state = self.state.lock();
        let mut done = 0;
        while done < len {
            let addr = va + done;
            let ppn = self.user_page(&mut state, asid, addr, write)?;
            let offset = addr.page_offset();
            let count = (PAGE_SIZE - offset).min(len - done);
            copy(&mut state, ppn, offset..offset + count, done..done + count);
            done += count;
        }
        Ok(())
    }

    fn user_page(
        &self,
        state: &mut VmState,
        asid: AsId,
        addr: VirtAddr,
        write: bool,
    ) -> KResult<PhysPageNum> {
        let vpn = addr.vpn_floor();
        if state.mmu.translate(asid, vpn).is_none() {
            let sp = state
                .space_mut(asid)?
                .user_sp
                .unwrap_or(self.config.stack_top);
            let fault = PageFault {
                addr,
                user: false,
                write,
                not_present: true,
                sp,
            };
            self.resolve_fault(state, asid, fault)?;
        }
        let Some((ppn, writable)) = state.mmu.translate(asid, vpn) else {
            return Err(errno::EFAULT);
        };
        if write && !writable {
            warn!("kernel writes to read-only user page {:?}", vpn.page_start());
            return Err(errno::EFAULT);
        }
        state.mmu.set_accessed(asid, vpn, true);
        if write {
            state.mmu.set_dirty(asid, vpn, true);
        }
        Ok(ppn)
    }
}
