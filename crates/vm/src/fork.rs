//! fork 时复制地址空间
//!
//! 未初始化的页只复制初始化参数，父子进程各自在第一次访问时载入；
//! 已经初始化的页（无论驻留还是已换出）立即为子进程分配页框并复制内容，不共享页框

use alloc::{sync::Arc, vec::Vec};

use defines::error::{errno, KResult};
use smallvec::SmallVec;

use crate::{
    address::VirtPageNum,
    anon::AnonPage,
    file::{FilePage, FsLock},
    hal::{AsId, File},
    page::{Backing, Page, PageInit, PageKind},
    space::{page_of, MemorySpace},
    Vm, VmState,
};

/// 父进程文件句柄到子进程句柄的对应关系，同一个句柄只 reopen 一次
#[derive(Default)]
struct Handles(SmallVec<[(Arc<dyn File>, Arc<dyn File>); 4]>);

impl Handles {
    fn reopen(&mut self, file: &Arc<dyn File>, fs: &FsLock) -> KResult<Arc<dyn File>> {
        if let Some((_, copy)) = self.0.iter().find(|(origin, _)| Arc::ptr_eq(origin, file)) {
            return Ok(Arc::clone(copy));
        }
        let Some(copy) = fs.io(|| file.reopen()) else {
            warn!("fork fails to reopen file");
            return Err(errno::EBADF);
        };
        self.0.push((Arc::clone(file), Arc::clone(&copy)));
        Ok(copy)
    }

    fn remap(&mut self, init: &PageInit, fs: &FsLock) -> KResult<PageInit> {
        Ok(match init {
            PageInit::Zero { stack } => PageInit::Zero { stack: *stack },
            PageInit::Segment(slice) => {
                PageInit::Segment(slice.with_file(self.reopen(slice.file(), fs)?))
            }
            PageInit::Mapped(slice) => {
                PageInit::Mapped(slice.with_file(self.reopen(slice.file(), fs)?))
            }
        })
    }
}

impl Vm {
    /// 为子进程 `child` 建立 `parent` 地址空间的私有副本
    ///
    /// 失败时已经建立的部分全部销毁，`child` 不会留下
    pub fn fork_space(&self, parent: AsId, child: AsId) -> KResult<()> {
        let mut state = self.state.lock();
        state.space_mut(parent)?;
        if state.spaces.contains_key(&child) {
            warn!("{child:?} already exists");
            return Err(errno::EEXIST);
        }
        state.spaces.insert(child, MemorySpace::new());
        let backing = self.backing();
        if let Err(e) = state.duplicate(parent, child, &backing) {
            warn!("fork {parent:?} -> {child:?} failed: {e}");
            state.teardown_space(child, &backing);
            return Err(e);
        }
        debug!(
            "fork {parent:?} -> {child:?}, {} pages",
            state.spaces.get(&child).map_or(0, |space| space.spt.len())
        );
        Ok(())
    }
}

impl VmState {
    fn duplicate(&mut self, parent: AsId, child: AsId, backing: &Backing<'_>) -> KResult<()> {
        let mut handles = Handles::default();
        let Some(from) = self.spaces.get(&parent) else {
            panic!("{parent:?} disappears during fork");
        };
        let user_sp = from.user_sp;
        let vpns = from.spt.vpns();
        let mut regions = Vec::with_capacity(from.mmaps.len());
        for (&start, region) in &from.mmaps {
            let file = handles.reopen(region.file(), backing.fs)?;
            regions.push((start, region.with_file(file)));
        }
        let Some(to) = self.spaces.get_mut(&child) else {
            panic!("{child:?} disappears during fork");
        };
        to.user_sp = user_sp;
        to.mmaps.extend(regions);

        for vpn in vpns {
            let Some(page) = self.spaces.get(&parent).and_then(|space| space.spt.find(vpn)) else {
                continue;
            };
            let writable = page.writable();
            let kind = match page.kind() {
                PageKind::Uninit(init) => {
                    let init = handles.remap(init, backing.fs)?;
                    self.insert_child(child, Page::new(vpn, writable, init))?;
                    continue;
                }
                PageKind::Anon(anon) => PageKind::Anon(AnonPage::new(anon.is_stack())),
                PageKind::File(file) => {
                    let slice = file.slice();
                    let copy = slice.with_file(handles.reopen(slice.file(), backing.fs)?);
                    PageKind::File(FilePage::new(copy))
                }
            };
            self.insert_child(child, Page::with_kind(vpn, writable, kind))?;
            self.copy_page(parent, child, vpn, backing)?;
        }
        Ok(())
    }

    fn insert_child(&mut self, child: AsId, page: Page) -> KResult<()> {
        let Some(space) = self.spaces.get_mut(&child) else {
            panic!("{child:?} disappears during fork");
        };
        space.spt.insert(page)?;
        Ok(())
    }

    /// 为子进程的页分配页框，复制父进程该页的当前内容并建立映射
    fn copy_page(
        &mut self,
        parent: AsId,
        child: AsId,
        vpn: VirtPageNum,
        backing: &Backing<'_>,
    ) -> KResult<()> {
        // 分配页框可能把父进程的这一页换出，所以之后再看它在哪里
        let id = self.acquire_frame(backing)?;
        let source = page_of(&mut self.spaces, parent, vpn);
        let dirty = match (source.frame(), source.kind()) {
            (Some(src), _) => {
                self.frames.copy(src, id);
                self.mmu.is_dirty(parent, vpn)
            }
            (None, PageKind::Anon(anon)) => {
                let mut swap = backing.swap.lock();
                if let Err(e) = anon.peek(self.frames.bytes_mut(id), &mut swap) {
                    drop(swap);
                    self.frames.release(id);
                    return Err(e);
                }
                false
            }
            (None, PageKind::File(file)) => {
                if let Err(e) = file.swap_in(self.frames.bytes_mut(id), backing.fs) {
                    self.frames.release(id);
                    return Err(e);
                }
                false
            }
            (None, PageKind::Uninit(_)) => unreachable!("pending pages are not copied"),
        };

        let page = page_of(&mut self.spaces, child, vpn);
        self.frames.bind(id, page, child);
        if !self.mmu.map(child, vpn, self.frames.ppn(id), page.writable()) {
            error!("fail to map {:?} for {child:?}", vpn.page_start());
            self.frames.unbind(id, page);
            self.frames.release(id);
            return Err(errno::ENOMEM);
        }
        // 脏的文件页在子进程中同样是脏的，否则被置换时会丢掉修改
        self.mmu.set_dirty(child, vpn, dirty);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;

    use common::config::PAGE_SIZE;
    use defines::error::errno;

    use crate::{
        address::VirtAddr,
        hal::{AsId, File},
        sim::{MemFile, PTEFlags},
        test_utils::{new_vm, pattern},
        FileSlice, PageInit, PageType,
    };

    const PARENT: AsId = AsId(1);
    const CHILD: AsId = AsId(2);
    const HEAP: VirtAddr = VirtAddr(0x2000_0000);
    const MAPPED: VirtAddr = VirtAddr(0x3000_0000);

    fn read(vm: &crate::Vm, asid: AsId, va: VirtAddr, len: usize) -> Vec<u8> {
        let mut buf = vec![0; len];
        vm.copy_from_user(asid, va, &mut buf).unwrap();
        buf
    }

    #[test]
    fn child_gets_private_copies() {
        let (vm, _) = new_vm(8, 8);
        vm.create_space(PARENT).unwrap();
        vm.alloc_page(PARENT, HEAP, true, PageInit::Zero { stack: false })
            .unwrap();
        let file = MemFile::open(&pattern(PAGE_SIZE));
        let handle: Arc<dyn File> = file.clone();
        vm.mmap(PARENT, MAPPED, PAGE_SIZE, true, &handle, 0).unwrap();
        read(&vm, PARENT, MAPPED, 8);

        vm.fork_space(PARENT, CHILD).unwrap();
        assert_eq!(vm.spt_len(CHILD), Ok(2));
        let pending = vm.page_info(CHILD, HEAP).unwrap();
        assert!(pending.pending && !pending.resident);
        let copied = vm.page_info(CHILD, MAPPED).unwrap();
        assert_eq!(copied.ty, PageType::File);
        assert!(copied.resident && !copied.pending);
        // 映射区域和文件页共用一个重新打开的句柄
        assert_eq!(file.stats().opens(), 3);

        vm.copy_to_user(CHILD, MAPPED, b"child").unwrap();
        vm.copy_to_user(CHILD, HEAP, b"heap").unwrap();
        assert_eq!(read(&vm, PARENT, MAPPED, 5), &pattern(5)[..]);
        assert_eq!(read(&vm, PARENT, HEAP, 4), [0; 4]);
        assert_eq!(read(&vm, CHILD, MAPPED, 5), b"child");

        // 子进程的映射区域可以单独解除
        vm.munmap(CHILD, MAPPED).unwrap();
        assert!(vm.page_info(PARENT, MAPPED).unwrap().resident);
        vm.destroy_space(CHILD).unwrap();
        assert_eq!(file.stats().closes(), 1);
    }

    #[test]
    fn evicted_pages_are_copied_from_swap() {
        let (vm, _) = new_vm(3, 16);
        vm.create_space(PARENT).unwrap();
        for i in 0..4 {
            let va = HEAP + i * PAGE_SIZE;
            vm.alloc_page(PARENT, va, true, PageInit::Zero { stack: false })
                .unwrap();
            vm.copy_to_user(PARENT, va, &[i as u8 + 1; 32]).unwrap();
        }
        let swapped = vm.stats().swap_slots_used;
        assert!(swapped > 0);

        vm.fork_space(PARENT, CHILD).unwrap();
        for i in 0..4 {
            let va = HEAP + i * PAGE_SIZE;
            assert_eq!(read(&vm, CHILD, va, 32), [i as u8 + 1; 32]);
            assert_eq!(read(&vm, PARENT, va, 32), [i as u8 + 1; 32]);
        }
        vm.destroy_space(CHILD).unwrap();
        vm.destroy_space(PARENT).unwrap();
        assert_eq!(vm.stats().swap_slots_used, 0);
        assert_eq!(vm.stats().frames_in_use, 0);
    }

    #[test]
    fn dirty_file_page_stays_dirty() {
        let (vm, sim) = new_vm(8, 8);
        vm.create_space(PARENT).unwrap();
        let handle: Arc<dyn File> = MemFile::open(&pattern(2 * PAGE_SIZE));
        vm.mmap(PARENT, MAPPED, 2 * PAGE_SIZE, true, &handle, 0).unwrap();
        vm.copy_to_user(PARENT, MAPPED, b"x").unwrap();
        read(&vm, PARENT, MAPPED + PAGE_SIZE, 1);

        vm.fork_space(PARENT, CHILD).unwrap();
        let dirty = |va: VirtAddr| {
            sim.mmu
                .entry(CHILD, va.vpn_floor())
                .unwrap()
                .flags()
                .contains(PTEFlags::D)
        };
        assert!(dirty(MAPPED));
        assert!(!dirty(MAPPED + PAGE_SIZE));
    }

    #[test]
    fn pending_segment_is_shared_lazily() {
        let (vm, _) = new_vm(8, 8);
        vm.create_space(PARENT).unwrap();
        let file = MemFile::open(&pattern(PAGE_SIZE));
        let slice = FileSlice::new(file.clone(), 0, 512);
        vm.alloc_page(PARENT, HEAP, true, PageInit::Segment(slice.clone()))
            .unwrap();
        vm.alloc_page(PARENT, HEAP + PAGE_SIZE, true, PageInit::Segment(slice))
            .unwrap();

        vm.fork_space(PARENT, CHILD).unwrap();
        assert_eq!(file.stats().opens(), 2);
        assert_eq!(file.stats().bytes_read(), 0);
        assert_eq!(read(&vm, CHILD, HEAP, 512), &pattern(512)[..]);
        assert!(vm.page_info(PARENT, HEAP).unwrap().pending);
    }

    #[test]
    fn failed_fork_leaves_no_child() {
        let (vm, _) = new_vm(8, 8);
        vm.create_space(PARENT).unwrap();
        vm.alloc_page(PARENT, HEAP, true, PageInit::Zero { stack: false })
            .unwrap();
        vm.claim_page(PARENT, HEAP).unwrap();
        let file = MemFile::open(&pattern(PAGE_SIZE));
        let slice = FileSlice::new(file.clone(), 0, PAGE_SIZE);
        vm.alloc_page(PARENT, MAPPED, false, PageInit::Segment(slice))
            .unwrap();
        file.forbid_reopen();

        assert_eq!(vm.fork_space(PARENT, CHILD), Err(errno::EBADF));
        assert_eq!(vm.spt_len(CHILD), Err(errno::ESRCH));
        assert_eq!(vm.stats().frames_in_use, 1);
        assert_eq!(vm.spt_len(PARENT), Ok(2));
    }

    #[test]
    fn fork_checks_ids() {
        let (vm, _) = new_vm(2, 2);
        vm.create_space(PARENT).unwrap();
        vm.create_space(CHILD).unwrap();
        assert_eq!(vm.fork_space(PARENT, CHILD), Err(errno::EEXIST));
        assert_eq!(vm.fork_space(AsId(3), AsId(4)), Err(errno::ESRCH));
        assert_eq!(vm.fork_space(PARENT, PARENT), Err(errno::EEXIST));
    }
}
