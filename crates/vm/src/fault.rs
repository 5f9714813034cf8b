//! 缺页处理与页面认领（claim）

use defines::error::{errno, KResult};

use crate::{
    address::{VirtAddr, VirtPageNum},
    hal::AsId,
    page::{Backing, Page, PageInit},
    space::page_of,
    Vm, VmState,
};

/// 陷入时收集到的缺页信息
#[derive(Debug, Clone, Copy)]
pub struct PageFault {
    pub addr: VirtAddr,
    /// 是否在用户态触发
    pub user: bool,
    pub write: bool,
    /// 是否因为映射不存在。否则是对已有映射的权限违例
    pub not_present: bool,
    /// 陷入时的栈指针
    pub sp: VirtAddr,
}

impl Vm {
    /// 处理一次缺页，成功时对应的页已经映射好，可以重新执行访存指令
    ///
    /// 返回错误表示这次访问非法，应当结束出错的进程
    pub fn handle_page_fault(&self, asid: AsId, fault: PageFault) -> KResult<()> {
        let mut state = self.state.lock();
        self.resolve_fault(&mut state, asid, fault)
    }

    pub fn try_handle_fault(&self, asid: AsId, fault: PageFault) -> bool {
        self.handle_page_fault(asid, fault).is_ok()
    }

    /// 显式地让 `va` 所在的页驻留在内存中
    pub fn claim_page(&self, asid: AsId, va: VirtAddr) -> KResult<()> {
        let mut state = self.state.lock();
        let vpn = va.vpn_floor();
        let page = state
            .space_mut(asid)?
            .spt
            .find(vpn)
            .ok_or(errno::EFAULT)?;
        if page.is_resident() {
            return Ok(());
        }
        state.claim(asid, vpn, &self.backing())
    }

    pub(crate) fn resolve_fault(
        &self,
        state: &mut VmState,
        asid: AsId,
        fault: PageFault,
    ) -> KResult<()> {
        let PageFault {
            addr,
            user,
            write,
            not_present,
            sp,
        } = fault;
        trace!("page fault at {addr:?}, user {user}, write {write}, sp {sp:?}");
        if addr.is_null() || addr.is_kernel() || !not_present {
            warn!("reject page fault at {addr:?}, not present {not_present}");
            return Err(errno::EFAULT);
        }
        let vpn = addr.vpn_floor();
        let space = state.space_mut(asid)?;
        match space.spt.find(vpn) {
            Some(page) if write && !page.writable() => {
                warn!("write to read-only page {:?}", vpn.page_start());
                return Err(errno::EFAULT);
            }
            // 映射已经存在，可能是别的路径先一步处理了
            Some(page) if page.is_resident() => return Ok(()),
            Some(_) => {}
            None => {
                // 内核态的缺页要用陷入内核时保存的用户栈指针
                let sp = if user { sp } else { space.user_sp.unwrap_or(sp) };
                if !self.config.is_stack_access(addr, sp) {
                    warn!("no page at {addr:?}, sp {sp:?}");
                    return Err(errno::EFAULT);
                }
                space
                    .spt
                    .insert(Page::new(vpn, true, PageInit::Zero { stack: true }))?;
                debug!("grow stack to {:?}", vpn.page_start());
            }
        }
        state.claim(asid, vpn, &self.backing())
    }
}

impl VmState {
    /// 为尚未驻留的页分配页框、建立映射并填充内容
    ///
    /// 任何一步失败都会撤销已经完成的部分，不会留下页框或映射
    pub(crate) fn claim(&mut self, asid: AsId, vpn: VirtPageNum, backing: &Backing<'_>) -> KResult<()> {
        trace!("claim {:?} of {asid:?}", vpn.page_start());
        // 分配页框时可能置换其他页，之后才能拿着本页的引用
        let id = self.acquire_frame(backing)?;
        let page = page_of(&mut self.spaces, asid, vpn);
        self.frames.bind(id, page, asid);
        if !self
            .mmu
            .map(asid, vpn, self.frames.ppn(id), page.writable())
        {
            error!("fail to map {:?}", vpn.page_start());
            self.frames.unbind(id, page);
            self.frames.release(id);
            return Err(errno::ENOMEM);
        }
        if let Err(e) = page.materialize(self.frames.bytes_mut(id), backing) {
            warn!("fail to fill {:?}: {e}", vpn.page_start());
            self.mmu.unmap(asid, vpn);
            self.frames.unbind(id, page);
            self.frames.release(id);
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;

    use common::config::PAGE_SIZE;
    use defines::error::errno;

    use super::PageFault;
    use crate::{
        address::VirtAddr,
        hal::{AsId, File},
        sim::{MemFile, PTEFlags},
        test_utils::{new_vm, pattern},
        FileSlice, PageInit, PageType,
    };

    const ASID: AsId = AsId(1);
    const CODE: VirtAddr = VirtAddr(0x1_0000);

    fn fault(addr: VirtAddr, user: bool, write: bool, sp: VirtAddr) -> PageFault {
        PageFault {
            addr,
            user,
            write,
            not_present: true,
            sp,
        }
    }

    #[test]
    fn invalid_faults_are_rejected() {
        let (vm, _) = new_vm(4, 4);
        vm.create_space(ASID).unwrap();
        vm.alloc_page(ASID, CODE, true, PageInit::Zero { stack: false })
            .unwrap();
        let sp = vm.config().stack_top;
        let cases = [
            fault(VirtAddr(0), true, false, sp),
            fault(VirtAddr(0x80_0400_1000), false, false, sp),
            PageFault {
                not_present: false,
                ..fault(CODE, true, true, sp)
            },
            // 既不在 SPT 中也不像栈访问
            fault(CODE + PAGE_SIZE, true, false, sp),
        ];
        for case in cases {
            assert_eq!(vm.handle_page_fault(ASID, case), Err(errno::EFAULT));
        }
        assert!(!vm.try_handle_fault(AsId(2), fault(CODE, true, false, sp)));
        assert_eq!(vm.stats().frames_in_use, 0);
        assert!(vm.try_handle_fault(ASID, fault(CODE + 8, true, true, sp)));
        assert!(vm.page_info(ASID, CODE).unwrap().resident);
    }

    #[test]
    fn write_to_read_only_page() {
        let (vm, sim) = new_vm(4, 4);
        vm.create_space(ASID).unwrap();
        vm.alloc_page(ASID, CODE, false, PageInit::Zero { stack: false })
            .unwrap();
        let sp = vm.config().stack_top;
        assert_eq!(
            vm.handle_page_fault(ASID, fault(CODE, true, true, sp)),
            Err(errno::EFAULT)
        );
        vm.handle_page_fault(ASID, fault(CODE, true, false, sp)).unwrap();
        let pte = sim.mmu.entry(ASID, CODE.vpn_floor()).unwrap();
        assert!(!pte.flags().contains(PTEFlags::W));
        assert_eq!(vm.copy_to_user(ASID, CODE, b"x"), Err(errno::EFAULT));
    }

    #[test]
    fn stack_grows_near_sp() {
        let (vm, _) = new_vm(8, 4);
        vm.create_space(ASID).unwrap();
        let top = vm.config().stack_top;
        let sp = VirtAddr(top.0 - 2 * PAGE_SIZE);

        assert_eq!(
            vm.handle_page_fault(ASID, fault(VirtAddr(sp.0 - 64), true, true, sp)),
            Err(errno::EFAULT)
        );
        vm.handle_page_fault(ASID, fault(VirtAddr(sp.0 - 8), true, true, sp))
            .unwrap();
        let info = vm.page_info(ASID, VirtAddr(sp.0 - 8)).unwrap();
        assert_eq!(info.ty, PageType::Anon);
        assert!(info.stack && info.resident && info.writable && !info.pending);

        // 栈指针之上、栈顶之下的访问同样可以扩展
        vm.handle_page_fault(ASID, fault(VirtAddr(top.0 - 1), true, false, sp))
            .unwrap();
        assert_eq!(vm.spt_len(ASID), Ok(2));
    }

    #[test]
    fn stack_respects_floor() {
        let (vm, _) = new_vm(4, 4);
        vm.create_space(ASID).unwrap();
        let floor = vm.config().stack_floor;
        let sp = VirtAddr(floor.0 + 4);
        assert_eq!(
            vm.handle_page_fault(ASID, fault(VirtAddr(floor.0 - 4), true, true, sp)),
            Err(errno::EFAULT)
        );
        vm.handle_page_fault(ASID, fault(floor, true, true, sp)).unwrap();
        assert_eq!(vm.spt_len(ASID), Ok(1));
    }

    #[test]
    fn kernel_faults_use_saved_sp() {
        let (vm, _) = new_vm(4, 4);
        vm.create_space(ASID).unwrap();
        let top = vm.config().stack_top;
        let user_sp = VirtAddr(top.0 - 3 * PAGE_SIZE);
        let kernel_sp = VirtAddr(0xffff_ffc0_8000_0000);
        let addr = VirtAddr(user_sp.0 - 4);

        assert_eq!(
            vm.handle_page_fault(ASID, fault(addr, false, true, kernel_sp)),
            Err(errno::EFAULT)
        );
        vm.set_user_sp(ASID, user_sp).unwrap();
        vm.handle_page_fault(ASID, fault(addr, false, true, kernel_sp))
            .unwrap();
        // 用户态缺页只看陷入时的 sp
        let below = VirtAddr(user_sp.0 - 2 * PAGE_SIZE);
        assert_eq!(
            vm.handle_page_fault(ASID, fault(below, true, true, top)),
            Err(errno::EFAULT)
        );
    }

    #[test]
    fn failed_claim_is_undone() {
        let (vm, sim) = new_vm(4, 4);
        vm.create_space(ASID).unwrap();
        let file = MemFile::open(&pattern(PAGE_SIZE));
        let slice = FileSlice::new(file.clone(), 0, PAGE_SIZE);
        vm.alloc_page(ASID, CODE, false, PageInit::Segment(slice))
            .unwrap();
        file.truncate(100);

        assert_eq!(vm.claim_page(ASID, CODE), Err(errno::EIO));
        let info = vm.page_info(ASID, CODE).unwrap();
        assert!(info.pending && !info.resident);
        assert_eq!(vm.stats().frames_in_use, 0);
        assert_eq!(sim.mmu.mapped_count(ASID), 0);

        file.write_at(&pattern(PAGE_SIZE)[100..], 100);
        vm.claim_page(ASID, CODE).unwrap();
        let mut buf = [0; PAGE_SIZE];
        vm.copy_from_user(ASID, CODE, &mut buf).unwrap();
        assert_eq!(buf[..], pattern(PAGE_SIZE)[..]);
        assert!(!vm.page_info(ASID, CODE).unwrap().pending);
    }

    #[test]
    fn failed_mapping_releases_frame() {
        let (vm, sim) = new_vm(4, 4);
        vm.create_space(ASID).unwrap();
        vm.alloc_page(ASID, CODE, true, PageInit::Zero { stack: false })
            .unwrap();
        sim.mmu.limit_maps(Some(0));
        assert_eq!(vm.claim_page(ASID, CODE), Err(errno::ENOMEM));
        assert_eq!(vm.stats().frames_in_use, 0);
        assert!(vm.page_info(ASID, CODE).unwrap().pending);

        sim.mmu.limit_maps(None);
        vm.claim_page(ASID, CODE).unwrap();
        // 已经驻留时再次认领什么也不做
        vm.claim_page(ASID, CODE).unwrap();
        assert_eq!(vm.stats().frames_in_use, 1);
        assert_eq!(vm.claim_page(ASID, CODE + PAGE_SIZE), Err(errno::EFAULT));
    }

    #[test]
    fn segment_page_is_loaded_lazily() {
        let (vm, _) = new_vm(4, 4);
        vm.create_space(ASID).unwrap();
        let file = MemFile::open(&pattern(3000));
        let exe: Arc<dyn File> = file.clone();
        let slice = FileSlice::new(exe, 1000, 2000);
        vm.alloc_page(ASID, CODE, true, PageInit::Segment(slice))
            .unwrap();
        assert_eq!(file.stats().bytes_read(), 0);

        let mut buf = [0xff; 2100];
        vm.copy_from_user(ASID, CODE, &mut buf).unwrap();
        assert_eq!(file.stats().bytes_read(), 2000);
        assert_eq!(&buf[..2000], &pattern(3000)[1000..]);
        assert!(buf[2000..].iter().all(|&b| b == 0));
        assert_eq!(vm.page_info(ASID, CODE).unwrap().ty, PageType::Anon);
    }
}
