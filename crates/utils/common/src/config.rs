use crate::constant::MiB;

/// 一个页大小的 bit 数
pub const PAGE_SIZE_BITS: usize = 12;
/// 页大小
pub const PAGE_SIZE: usize = 1 << PAGE_SIZE_BITS;
pub const PAGE_OFFSET_MASK: usize = PAGE_SIZE - 1;

/// 磁盘扇区大小
pub const SECTOR_SIZE: usize = 512;
/// 一个交换槽（即一页）占用的扇区数
pub const SECTORS_PER_PAGE: usize = PAGE_SIZE / SECTOR_SIZE;

/// 内核地址空间的起点，此地址及以上都不属于用户
pub const KERNEL_BASE: usize = 0x80_0400_0000;

/// 用户栈顶（不含）
pub const USER_STACK_TOP: usize = 0x4748_0000;
/// 用户栈最多能增长到的大小
pub const USER_STACK_LIMIT: usize = MiB;

/// 缺页地址允许低于 sp 的距离。
///
/// `push` 之类的指令会先访问 sp 之下的地址再移动 sp
pub const STACK_FAULT_SLACK: usize = 8;

const _: () = assert!(PAGE_SIZE % SECTOR_SIZE == 0);
const _: () = assert!(USER_STACK_TOP % PAGE_SIZE == 0);
