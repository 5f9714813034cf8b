use core::{
    fmt,
    ops::{Add, Range, Sub},
};

use common::config::{KERNEL_BASE, PAGE_OFFSET_MASK, PAGE_SIZE, PAGE_SIZE_BITS};

/// 物理页号
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PhysPageNum(pub usize);

impl Add<usize> for PhysPageNum {
    type Output = Self;

    fn add(self, rhs: usize) -> Self::Output {
        Self(self.0 + rhs)
    }
}

/// 用户虚拟地址
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(C)]
pub struct VirtAddr(pub usize);

impl VirtAddr {
    pub const fn page_offset(&self) -> usize {
        self.0 & PAGE_OFFSET_MASK
    }

    pub const fn is_page_aligned(&self) -> bool {
        self.page_offset() == 0
    }

    /// 向下取整页号
    pub const fn vpn_floor(&self) -> VirtPageNum {
        VirtPageNum(self.0 >> PAGE_SIZE_BITS)
    }

    /// 向上取整页号
    pub const fn vpn_ceil(&self) -> VirtPageNum {
        VirtPageNum(self.0.div_ceil(PAGE_SIZE))
    }

    pub const fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// 内核地址（包括高于 [`KERNEL_BASE`] 的所有地址）不允许用户映射
    pub const fn is_kernel(&self) -> bool {
        self.0 >= KERNEL_BASE
    }
}

impl Add<usize> for VirtAddr {
    type Output = Self;

    fn add(self, rhs: usize) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#x})", self.0)
    }
}

/// 虚拟页号，SPT 以它为键
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VirtPageNum(pub usize);

impl VirtPageNum {
    pub const fn page_start(&self) -> VirtAddr {
        VirtAddr(self.0 << PAGE_SIZE_BITS)
    }

    /// `self..self + count` 这一段页号
    pub fn span(self, count: usize) -> Range<VirtPageNum> {
        self..self + count
    }

    /// 逐页遍历，`Range<VirtPageNum>` 自身不能迭代
    pub fn iter_range(range: Range<VirtPageNum>) -> impl Iterator<Item = VirtPageNum> {
        (range.start.0..range.end.0).map(VirtPageNum)
    }
}

impl Add<usize> for VirtPageNum {
    type Output = Self;

    fn add(self, len: usize) -> Self::Output {
        Self(self.0 + len)
    }
}

impl Sub<usize> for VirtPageNum {
    type Output = Self;

    fn sub(self, len: usize) -> Self::Output {
        Self(self.0 - len)
    }
}

impl fmt::Debug for VirtPageNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtPageNum({:#x})", self.0)
    }
}
