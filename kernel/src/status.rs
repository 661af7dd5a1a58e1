//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 内核状态码定义
//!
//! 所有内核入口点都返回 `status_t`（0 = 成功，正数 = 失败类别）。
//! 错误只在跨抽象层时才允许转换（例如磁盘 DEVICE_ERROR 在超级块
//! 不可读时变为文件系统 CORRUPT）。
//!
//! 使用方法：
//! ```no_run
//! use kiwi::status::{Status, KResult};
//!
//! fn lookup() -> KResult<u32> {
//!     Err(Status::NotFound)
//! }
//! # let _ = lookup();
//! ```

/// 内核状态码
///
/// 数值固定，构成系统调用 ABI 的一部分
#[repr(i32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Status {
    /// 成功
    Success = 0,

    /// 未实现 (STATUS_NOT_IMPLEMENTED)
    NotImplemented = 1,

    /// 操作在此对象上不受支持 (STATUS_NOT_SUPPORTED)
    NotSupported = 2,

    /// 内存不足 (STATUS_NO_MEMORY)
    NoMemory = 3,

    /// 句柄表已满 (STATUS_NO_HANDLES)
    NoHandles = 4,

    /// 进程数达到上限 (STATUS_PROCESS_LIMIT)
    ProcessLimit = 5,

    /// 无效参数 (STATUS_INVALID_ARG)
    InvalidArg = 6,

    /// 参数过小 (STATUS_TOO_SMALL)
    TooSmall = 7,

    /// 参数过大 (STATUS_TOO_LARGE)
    TooLarge = 8,

    /// 无效系统调用号 (STATUS_INVALID_SYSCALL)
    InvalidSyscall = 9,

    /// 无效句柄 (STATUS_INVALID_HANDLE)
    InvalidHandle = 10,

    /// 访问被拒绝 (STATUS_ACCESS_DENIED)
    AccessDenied = 11,

    /// 只读 (STATUS_READ_ONLY)
    ReadOnly = 12,

    /// 非所有者 (STATUS_NOT_OWNER)
    NotOwner = 13,

    /// 需要特权 (STATUS_PRIV_REQUIRED)
    PrivRequired = 14,

    /// 未找到 (STATUS_NOT_FOUND)
    NotFound = 15,

    /// 已存在 (STATUS_ALREADY_EXISTS)
    AlreadyExists = 16,

    /// 不是目录 (STATUS_NOT_DIR)
    NotDir = 17,

    /// 是目录 (STATUS_IS_DIR)
    IsDir = 18,

    /// 操作将会阻塞 (STATUS_WOULD_BLOCK)
    WouldBlock = 19,

    /// 超时 (STATUS_TIMED_OUT)
    TimedOut = 20,

    /// 被中断 (STATUS_INTERRUPTED)
    Interrupted = 21,

    /// 使用中 (STATUS_IN_USE)
    InUse = 22,

    /// 对象已死亡（例如弱引用的目标已释放）(STATUS_DEAD)
    Dead = 23,

    /// 设备错误 (STATUS_DEVICE_ERROR)
    DeviceError = 24,

    /// 数据损坏 (STATUS_CORRUPT)
    Corrupt = 25,
}

/// 内核内部的 Result 别名
pub type KResult<T> = core::result::Result<T, Status>;

impl Status {
    /// 获取状态码的数值（用于系统调用返回）
    #[inline]
    pub const fn as_i32(self) -> i32 {
        self as i32
    }

    /// 从 Result 生成系统调用返回值
    #[inline]
    pub fn from_result(result: KResult<()>) -> i32 {
        match result {
            Ok(()) => Status::Success.as_i32(),
            Err(status) => status.as_i32(),
        }
    }
}

/// 获取状态码对应的固定描述字符串
///
/// 用户可见表面通过本函数将每个类别映射到固定文本
pub fn kern_status_string(status: Status) -> &'static str {
    match status {
        Status::Success => "Operation completed successfully",
        Status::NotImplemented => "Operation not implemented",
        Status::NotSupported => "Operation not supported",
        Status::NoMemory => "Out of memory",
        Status::NoHandles => "No handles are available",
        Status::ProcessLimit => "Process limit reached",
        Status::InvalidArg => "Invalid argument",
        Status::TooSmall => "Value too small",
        Status::TooLarge => "Value too large",
        Status::InvalidSyscall => "Invalid system call number",
        Status::InvalidHandle => "Invalid handle",
        Status::AccessDenied => "Access denied",
        Status::ReadOnly => "Object is read only",
        Status::NotOwner => "Not the owner of the object",
        Status::PrivRequired => "Privilege required",
        Status::NotFound => "Not found",
        Status::AlreadyExists => "Already exists",
        Status::NotDir => "Not a directory",
        Status::IsDir => "Is a directory",
        Status::WouldBlock => "Operation would block",
        Status::TimedOut => "Timed out",
        Status::Interrupted => "Interrupted",
        Status::InUse => "Object is in use",
        Status::Dead => "Object is dead",
        Status::DeviceError => "Device error",
        Status::Corrupt => "Data is corrupted",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_values() {
        assert_eq!(Status::Success.as_i32(), 0);
        assert_eq!(Status::NoMemory.as_i32(), 3);
        assert_eq!(Status::InvalidArg.as_i32(), 6);
        assert_eq!(Status::AccessDenied.as_i32(), 11);
        assert_eq!(Status::WouldBlock.as_i32(), 19);
    }

    #[test]
    fn test_status_string() {
        assert_eq!(kern_status_string(Status::NoMemory), "Out of memory");
        assert_eq!(kern_status_string(Status::TimedOut), "Timed out");
    }

    #[test]
    fn test_from_result() {
        assert_eq!(Status::from_result(Ok(())), 0);
        assert_eq!(Status::from_result(Err(Status::NotFound)), 15);
    }
}
