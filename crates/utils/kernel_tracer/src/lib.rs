//! 内核日志
//!
//! 日志等级在编译时决定，实际输出到哪里由启动时注册的 [`Log`] 决定

#![cfg_attr(not(test), no_std)]

#[macro_use]
mod macros;
mod level;

pub use level::{Level, LevelFilter, CLOG};

use core::fmt::{self, Arguments, Write};

use anstyle::Reset;
use klocks::Once;

#[derive(Clone, Debug)]
pub struct Record<'a> {
    level: Level,
    target: &'static str,
    args: Arguments<'a>,
}

impl<'a> Record<'a> {
    #[inline]
    pub fn new(level: Level, target: &'static str, args: Arguments<'a>) -> Self {
        Self {
            level,
            target,
            args,
        }
    }

    /// 消息内容
    #[inline]
    pub fn args(&self) -> &Arguments<'a> {
        &self.args
    }

    /// 消息的日志等级
    #[inline]
    pub fn level(&self) -> Level {
        self.level
    }

    /// 产生日志的模块路径
    #[inline]
    pub fn target(&self) -> &'static str {
        self.target
    }
}

pub trait Log: Sync {
    fn log(&self, record: &Record<'_>);
}

static LOGGER: Once<&'static dyn Log> = Once::new();

/// 注册日志输出，只有第一次注册生效。返回本次是否注册成功
pub fn set_logger(logger: &'static dyn Log) -> bool {
    let mut installed = false;
    LOGGER.call_once(|| {
        installed = true;
        logger
    });
    installed
}

#[inline]
#[doc(hidden)]
pub fn log_impl(level: Level, target: &'static str, args: Arguments<'_>) {
    if let Some(logger) = LOGGER.get() {
        logger.log(&Record::new(level, target, args));
    }
}

/// 按 `[ INFO] vm::fault: message` 的格式输出一条日志，等级部分带颜色
pub fn write_log(writer: &mut impl Write, record: &Record<'_>) -> fmt::Result {
    writeln!(
        writer,
        "{}[{:>5}]{} {}: {}",
        record.level().color().render_fg(),
        record.level(),
        Reset.render(),
        record.target(),
        record.args()
    )
}
