//! 进程的用户地址空间：一张 SPT 加上 mmap 区域记录

use alloc::collections::BTreeMap;

use hashbrown::HashMap;

use crate::{
    address::{VirtAddr, VirtPageNum},
    file::MmapRegion,
    hal::AsId,
    page::{Backing, Page},
    spt::SupplementalPageTable,
    VmState,
};

#[derive(Default)]
pub struct MemorySpace {
    pub spt: SupplementalPageTable,
    /// 以起始页号为键
    pub mmaps: BTreeMap<VirtPageNum, MmapRegion>,
    /// 陷入内核时保存的用户栈指针，内核态缺页时用它判断栈增长
    pub user_sp: Option<VirtAddr>,
}

impl MemorySpace {
    pub fn new() -> Self {
        Self::default()
    }
}

/// 取出一个已知存在的页，例如页框的主人或刚检查过的页。找不到说明内部状态已被破坏
pub(crate) fn page_of(
    spaces: &mut HashMap<AsId, MemorySpace>,
    asid: AsId,
    vpn: VirtPageNum,
) -> &mut Page {
    let Some(page) = spaces
        .get_mut(&asid)
        .and_then(|space| space.spt.find_mut(vpn))
    else {
        panic!("{:?} of {asid:?} is not in its table", vpn.page_start());
    };
    page
}

impl VmState {
    /// 从 SPT 中移除一页，解除映射并释放页框和后备存储，脏的文件页会先写回
    ///
    /// 返回该页是否存在
    pub(crate) fn remove_page(
        &mut self,
        asid: AsId,
        vpn: VirtPageNum,
        backing: &Backing<'_>,
    ) -> bool {
        let Some(mut page) = self
            .spaces
            .get_mut(&asid)
            .and_then(|space| space.spt.remove(vpn))
        else {
            return false;
        };
        match page.frame() {
            Some(id) => {
                let dirty = self.mmu.is_dirty(asid, vpn);
                self.mmu.unmap(asid, vpn);
                self.frames.unbind(id, &mut page);
                page.destroy(Some(self.frames.bytes(id)), dirty, backing);
                self.frames.release(id);
            }
            None => page.destroy(None, false, backing),
        }
        true
    }

    /// 销毁整个地址空间：先解除所有 mmap（写回脏页），再移除剩余的页
    pub(crate) fn teardown_space(&mut self, asid: AsId, backing: &Backing<'_>) {
        let Some(space) = self.spaces.get_mut(&asid) else {
            return;
        };
        let regions = core::mem::take(&mut space.mmaps);
        let vpns = space.spt.vpns();
        let mapped = regions.len();
        // 区域记录持有的文件句柄在所有页释放后才关闭
        for region in regions.values() {
            for vpn in region.vpns() {
                self.remove_page(asid, vpn, backing);
            }
        }
        for &vpn in &vpns {
            self.remove_page(asid, vpn, backing);
        }
        drop(regions);
        self.spaces.remove(&asid);
        debug!("{asid:?} is torn down: {} pages, {mapped} mappings", vpns.len());
    }
}
