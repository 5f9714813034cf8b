use core::{cmp::Ordering, fmt};

use anstyle::AnsiColor;

static LOG_LEVEL_NAMES: [&str; 6] = ["OFF", "ERROR", "WARN", "INFO", "DEBUG", "TRACE"];

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
pub enum Level {
    Error = 1,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Level {
    pub fn as_str(&self) -> &'static str {
        LOG_LEVEL_NAMES[*self as usize]
    }

    /// 终端输出时该等级使用的前景色
    pub fn color(&self) -> AnsiColor {
        match self {
            Level::Error => AnsiColor::Red,
            Level::Warn => AnsiColor::BrightYellow,
            Level::Info => AnsiColor::Blue,
            Level::Debug => AnsiColor::Green,
            Level::Trace => AnsiColor::BrightBlack,
        }
    }
}

impl PartialEq<LevelFilter> for Level {
    #[inline]
    fn eq(&self, other: &LevelFilter) -> bool {
        *self as usize == *other as usize
    }
}

impl PartialOrd<LevelFilter> for Level {
    #[inline]
    fn partial_cmp(&self, other: &LevelFilter) -> Option<Ordering> {
        (*self as usize).partial_cmp(&(*other as usize))
    }
}

impl fmt::Display for Level {
    #[inline]
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.pad(self.as_str())
    }
}

#[repr(usize)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
pub enum LevelFilter {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LevelFilter {
    pub fn as_str(&self) -> &'static str {
        LOG_LEVEL_NAMES[*self as usize]
    }

    /// 按名字解析，大小写敏感，认不出来就关闭日志
    pub const fn from_name(name: Option<&str>) -> Self {
        let Some(name) = name else {
            return LevelFilter::Off;
        };
        let name = name.as_bytes();
        let filters = [
            LevelFilter::Error,
            LevelFilter::Warn,
            LevelFilter::Info,
            LevelFilter::Debug,
            LevelFilter::Trace,
        ];
        let mut i = 0;
        while i < filters.len() {
            if bytes_eq(name, LOG_LEVEL_NAMES[filters[i] as usize].as_bytes()) {
                return filters[i];
            }
            i += 1;
        }
        LevelFilter::Off
    }
}

const fn bytes_eq(lhs: &[u8], rhs: &[u8]) -> bool {
    if lhs.len() != rhs.len() {
        return false;
    }
    let mut i = 0;
    while i < lhs.len() {
        if lhs[i] != rhs[i] {
            return false;
        }
        i += 1;
    }
    true
}

impl PartialEq<Level> for LevelFilter {
    #[inline]
    fn eq(&self, other: &Level) -> bool {
        other.eq(self)
    }
}

impl PartialOrd<Level> for LevelFilter {
    #[inline]
    fn partial_cmp(&self, other: &Level) -> Option<Ordering> {
        (*self as usize).partial_cmp(&(*other as usize))
    }
}

impl fmt::Display for LevelFilter {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.pad(self.as_str())
    }
}

/// 控制台日志等级，编译时由 `KERNEL_CLOG` 决定
pub const CLOG: LevelFilter = LevelFilter::from_name(option_env!("KERNEL_CLOG"));
