use core::fmt;

/// 内核错误码，取值与 Linux errno 的相反数一致
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Error(core::ffi::c_int);

impl Error {
    #[inline]
    pub fn as_isize(self) -> isize {
        self.0 as isize
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(errno::error_info(self.as_isize()))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

pub type KResult<T = isize> = core::result::Result<T, Error>;

pub mod errno {
    macro_rules! declare_errno {
        ($($name:tt, $errno:literal, $desc:literal,)*) => {
            $(#[doc = $desc]
            pub const $name: super::Error = super::Error($errno);)*
            pub fn error_info(errno: isize) -> &'static str {
                match errno {
                    $($errno => ::core::concat!(stringify!($name), ", ", $desc),)*
                    _ => "Unknown error",
                }
            }
        };
    }

    #[rustfmt::skip]
    declare_errno!(
        EPERM,          -1,     "Operation not permitted.",
        ENOENT,         -2,     "No such file or directory.",
        ESRCH,          -3,     "No such process.",
        EIO,            -5,     "I/O error.",
        EBADF,          -9,     "Bad file number.",
        ENOMEM,         -12,    "Out of memory",
        EFAULT,         -14,    "Bad address.",
        EBUSY,          -16,    "Device or resource busy.",
        EEXIST,         -17,    "File exists.",
        EINVAL,         -22,    "Invalid argument.",
        ENOSPC,         -28,    "No space left on device.",
    );
}
