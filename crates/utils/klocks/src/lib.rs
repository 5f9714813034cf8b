//! 内核中使用的锁
//!
//! 目前只跑在单核上，但共享状态仍然一律放在锁里，以后支持多核时只需要换掉锁的实现

#![cfg_attr(not(test), no_std)]

mod kspin;

pub use kspin::{SpinMutex, SpinMutexGuard};
pub use spin::{Lazy, Once};
