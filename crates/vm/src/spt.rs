//! 补充页表（SPT），记录硬件页表之外的逐页信息

use alloc::vec::Vec;

use defines::error::{errno, KResult};
use hashbrown::{hash_map::Entry, HashMap};

use crate::{address::VirtPageNum, page::Page};

/// 以虚拟页号为键的页描述符表，每个地址空间一张
#[derive(Debug, Default)]
pub struct SupplementalPageTable {
    pages: HashMap<VirtPageNum, Page>,
}

impl SupplementalPageTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, vpn: VirtPageNum) -> Option<&Page> {
        self.pages.get(&vpn)
    }

    pub fn find_mut(&mut self, vpn: VirtPageNum) -> Option<&mut Page> {
        self.pages.get_mut(&vpn)
    }

    /// 插入新页。该页号已有描述符时返回 `EEXIST`，原有描述符不受影响
    pub fn insert(&mut self, page: Page) -> KResult<&mut Page> {
        match self.pages.entry(page.vpn()) {
            Entry::Occupied(_) => {
                warn!("{:?} is already in the table", page.vpn().page_start());
                Err(errno::EEXIST)
            }
            Entry::Vacant(entry) => Ok(entry.insert(page)),
        }
    }

    /// 只把描述符从表中取出。页框和后备存储由调用者负责释放
    pub fn remove(&mut self, vpn: VirtPageNum) -> Option<Page> {
        self.pages.remove(&vpn)
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// 所有页号，升序
    pub fn vpns(&self) -> Vec<VirtPageNum> {
        let mut vpns: Vec<_> = self.pages.keys().copied().collect();
        vpns.sort_unstable();
        vpns
    }

    pub fn resident_count(&self) -> usize {
        self.pages.values().filter(|page| page.is_resident()).count()
    }
}
