//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 安全令牌
//!
//! 不可变的 (uid, gid, 有效特权集, 可继承特权集) 记录，线程携带。
//! 默认共享：只有当两个特权集不同（继承会语义分叉）时才在继承
//! 时复制，copy_on_inherit 标志在构造时算好。

use alloc::sync::Arc;

bitflags::bitflags! {
    /// 内核特权位
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct Privilege: u64 {
        /// 重启 / 关机
        const SHUTDOWN      = 1 << 0;
        /// 触发内核 fatal
        const FATAL         = 1 << 1;
        /// 原始设备 ioctl
        const DEVICE_RAW    = 1 << 2;
        /// 跨进程发布句柄
        const PUBLISH       = 1 << 3;
        /// 管理其他进程（杀死、改优先级）
        const PROCESS_ADMIN = 1 << 4;
    }
}

/// 安全令牌（构造后不可变）
#[derive(Debug)]
pub struct Token {
    uid: u32,
    gid: u32,
    effective: Privilege,
    inheritable: Privilege,
    copy_on_inherit: bool,
}

impl Token {
    pub fn new(uid: u32, gid: u32, effective: Privilege, inheritable: Privilege) -> Arc<Self> {
        Arc::new(Self {
            uid,
            gid,
            effective,
            inheritable,
            copy_on_inherit: effective != inheritable,
        })
    }

    /// 内核自身与 init 进程使用的全权令牌
    pub fn kernel() -> Arc<Self> {
        Self::new(0, 0, Privilege::all(), Privilege::all())
    }

    #[inline]
    pub fn uid(&self) -> u32 {
        self.uid
    }

    #[inline]
    pub fn gid(&self) -> u32 {
        self.gid
    }

    #[inline]
    pub fn effective(&self) -> Privilege {
        self.effective
    }

    #[inline]
    pub fn inheritable(&self) -> Privilege {
        self.inheritable
    }

    /// 当前令牌是否持有特权 priv
    #[inline]
    pub fn check_priv(&self, required: Privilege) -> bool {
        self.effective.contains(required)
    }

    /// 派生子进程的令牌
    ///
    /// 两个特权集一致时直接共享；否则生成新令牌，
    /// 有效集取父方的可继承集
    pub fn inherit(self: &Arc<Self>) -> Arc<Self> {
        if !self.copy_on_inherit {
            self.clone()
        } else {
            Self::new(self.uid, self.gid, self.inheritable, self.inheritable)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_priv() {
        let token = Token::new(100, 100, Privilege::SHUTDOWN, Privilege::SHUTDOWN);
        assert!(token.check_priv(Privilege::SHUTDOWN));
        assert!(!token.check_priv(Privilege::FATAL));
        assert!(!token.check_priv(Privilege::SHUTDOWN | Privilege::FATAL));
    }

    #[test]
    fn test_inherit_shares_when_sets_match() {
        let token = Token::new(1, 1, Privilege::SHUTDOWN, Privilege::SHUTDOWN);
        let child = token.inherit();
        assert!(Arc::ptr_eq(&token, &child));
    }

    #[test]
    fn test_inherit_copies_when_sets_diverge() {
        let token = Token::new(1, 1, Privilege::SHUTDOWN | Privilege::FATAL, Privilege::SHUTDOWN);
        let child = token.inherit();
        assert!(!Arc::ptr_eq(&token, &child));
        // 子方有效集取可继承集
        assert!(child.check_priv(Privilege::SHUTDOWN));
        assert!(!child.check_priv(Privilege::FATAL));
        // 再往下继承不再复制
        let grandchild = child.inherit();
        assert!(Arc::ptr_eq(&child, &grandchild));
    }

    #[test]
    fn test_kernel_token() {
        assert!(Token::kernel().check_priv(Privilege::all()));
    }
}
