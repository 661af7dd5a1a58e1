//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! MMU 上下文
//!
//! 每个地址空间持有一个 MMU 上下文：架构相关的根页表物理地址、
//! ASID，以及一个有界的待失效虚拟地址队列。修改映射必须在批次
//! （`MmuContext::lock()` 返回的守卫）内进行；批次结束时统一执行
//! 本地 TLB 失效与跨 CPU 击落：
//! - 队列条目 ≤ INVALIDATE_QUEUE_SIZE：逐页失效
//! - 队列溢出：整个上下文全量冲刷
//!
//! 击落 IPI 等待每个目标 CPU 应答；超时的 CPU 被标记 TLB-stale，
//! 在下次切换到该上下文时强制全量冲刷。
//!
//! 架构差异（页表格式、TLB 指令）由 `ArchMmuOps` 实现承担，
//! 见 arch/amd64/mm.rs 与 arch/arm64/mm.rs。

use core::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use spin::{Mutex, MutexGuard, Once};

use crate::arch;
use crate::config::{INVALIDATE_QUEUE_SIZE, MAX_CPUS};
use crate::mm::page::PhysAddr;
use crate::status::KResult;

bitflags::bitflags! {
    /// 叶映射的访问标志
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct MmuFlags: u32 {
        const READ  = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC  = 1 << 2;
        const USER  = 1 << 3;
    }
}

/// 架构 MMU 操作
///
/// 所有函数在调用方持有上下文批次锁的前提下执行；
/// map 相对失效队列必须是原子的（中间表分配失败时不得部分提交）
pub trait ArchMmuOps: Send + Sync {
    /// 分配并清零一个根页表，返回其物理地址
    fn create_root(&self) -> KResult<u64>;

    /// 释放根页表及全部中间表（叶页帧由地址空间负责）
    fn destroy_root(&self, root: u64);

    /// 安装叶映射；virt 已有映射时返回 ALREADY_EXISTS
    fn map(&self, root: u64, virt: usize, phys: u64, flags: MmuFlags) -> KResult<()>;

    /// 移除叶映射，返回之前映射的物理地址
    fn unmap(&self, root: u64, virt: usize) -> Option<u64>;

    /// 修改叶映射的访问标志，返回旧标志
    fn protect(&self, root: u64, virt: usize, flags: MmuFlags) -> Option<MmuFlags>;

    /// 查询叶映射
    fn query(&self, root: u64, virt: usize) -> Option<(u64, MmuFlags)>;

    /// 加载根页表指针并设置 ASID（切换地址空间）
    fn load(&self, root: u64, asid: u16);

    /// 本地逐页 TLB 失效
    fn invalidate_page(&self, asid: u16, virt: usize);

    /// 本地全量 TLB 冲刷
    fn flush(&self, asid: u16);
}

static MMU_OPS: Once<&'static dyn ArchMmuOps> = Once::new();

/// 注册架构 MMU 后端（引导早期调用一次）
pub fn install(ops: &'static dyn ArchMmuOps) {
    MMU_OPS.call_once(|| ops);
}

fn ops() -> &'static dyn ArchMmuOps {
    *MMU_OPS.get().expect("mmu: backend not installed")
}

/// ASID 分配（简单递增；回绕处理留给架构层的代际方案）
static NEXT_ASID: AtomicU16 = AtomicU16::new(1);

struct MmuInner {
    /// 根页表物理地址
    root: u64,
    /// 待失效虚拟地址队列
    queue: [usize; INVALIDATE_QUEUE_SIZE],
    queue_len: usize,
    /// 队列溢出，批次结束时全量冲刷
    full_flush: bool,
}

/// MMU 上下文
pub struct MmuContext {
    asid: u16,
    inner: Mutex<MmuInner>,
    /// 当前激活此上下文的 CPU 位图
    active_cpus: AtomicUsize,
    /// 击落应答超时的 CPU 位图；下次切换时强制冲刷
    stale_cpus: AtomicUsize,
}

impl MmuContext {
    /// 创建新的（用户）MMU 上下文
    pub fn new() -> KResult<Self> {
        let root = ops().create_root()?;
        Ok(Self {
            asid: NEXT_ASID.fetch_add(1, Ordering::AcqRel),
            inner: Mutex::new(MmuInner {
                root,
                queue: [0; INVALIDATE_QUEUE_SIZE],
                queue_len: 0,
                full_flush: false,
            }),
            active_cpus: AtomicUsize::new(0),
            stale_cpus: AtomicUsize::new(0),
        })
    }

    #[inline]
    pub fn asid(&self) -> u16 {
        self.asid
    }

    /// 开始一个映射修改批次
    ///
    /// 守卫释放时统一执行失效（见模块注释）。批次不可嵌套：
    /// 递归加锁是锁序违规，debug 构建会死锁在自旋上
    pub fn lock(&self) -> MmuBatch<'_> {
        MmuBatch {
            ctx: self,
            inner: self.inner.lock(),
        }
    }

    /// 切换到此上下文
    ///
    /// 加载根页表指针与 ASID，更新 per-CPU 的活动上下文记录；
    /// 若本 CPU 被标记 TLB-stale，则先全量冲刷
    pub fn switch_to(&self) {
        let cpu = arch::cpu_id();
        let bit = 1usize << cpu;

        let root = self.inner.lock().root;

        arch::memory_barrier();
        ops().load(root, self.asid);
        self.active_cpus.fetch_or(bit, Ordering::AcqRel);

        if self.stale_cpus.fetch_and(!bit, Ordering::AcqRel) & bit != 0 {
            ops().flush(self.asid);
        }
    }

    /// 离开此上下文（切换走之前调用）
    pub fn switch_away(&self) {
        let bit = 1usize << arch::cpu_id();
        self.active_cpus.fetch_and(!bit, Ordering::AcqRel);
    }

    /// 当前激活此上下文的 CPU 位图（击落 IPI 的目标集）
    pub fn active_mask(&self) -> usize {
        self.active_cpus.load(Ordering::Acquire)
    }

    fn flush_pending(&self, inner: &mut MmuInner) {
        if inner.queue_len == 0 && !inner.full_flush {
            return;
        }

        arch::memory_barrier();

        if inner.full_flush {
            ops().flush(self.asid);
        } else {
            for i in 0..inner.queue_len {
                ops().invalidate_page(self.asid, inner.queue[i]);
            }
        }

        // 向激活了本上下文的其他 CPU 发送击落 IPI；
        // 未应答的标记为 stale
        let this_cpu = arch::cpu_id();
        let active = self.active_cpus.load(Ordering::Acquire);
        for cpu in 0..MAX_CPUS.min(arch::cpu_count()) {
            if cpu == this_cpu || active & (1 << cpu) == 0 {
                continue;
            }
            if !arch::ops().send_shootdown(cpu) {
                log::warn!(
                    "mmu: shootdown timeout, marking cpu {} stale for asid {}",
                    cpu,
                    self.asid
                );
                self.stale_cpus.fetch_or(1 << cpu, Ordering::AcqRel);
            }
        }

        inner.queue_len = 0;
        inner.full_flush = false;
    }
}

impl Drop for MmuContext {
    fn drop(&mut self) {
        let root = self.inner.get_mut().root;
        ops().destroy_root(root);
    }
}

/// 映射修改批次守卫
pub struct MmuBatch<'a> {
    ctx: &'a MmuContext,
    inner: MutexGuard<'a, MmuInner>,
}

impl MmuBatch<'_> {
    fn queue_invalidate(&mut self, virt: usize) {
        if self.inner.queue_len < INVALIDATE_QUEUE_SIZE {
            let len = self.inner.queue_len;
            self.inner.queue[len] = virt;
            self.inner.queue_len = len + 1;
        } else {
            self.inner.full_flush = true;
        }
    }

    /// 安装叶映射
    ///
    /// 分配失败以 NO_MEMORY 传播；相对失效队列是原子的
    pub fn map(&mut self, virt: usize, phys: PhysAddr, flags: MmuFlags) -> KResult<()> {
        debug_assert!(virt & crate::config::PAGE_MASK == 0);
        ops().map(self.inner.root, virt, phys.0, flags)
    }

    /// 移除叶映射并把 virt 推入失效队列
    pub fn unmap(&mut self, virt: usize) -> Option<PhysAddr> {
        let prev = ops().unmap(self.inner.root, virt)?;
        self.queue_invalidate(virt);
        Some(PhysAddr(prev))
    }

    /// 修改访问标志
    ///
    /// 可写降级为只读时需要失效旧的 TLB 条目
    pub fn protect(&mut self, virt: usize, flags: MmuFlags) -> Option<MmuFlags> {
        let old = ops().protect(self.inner.root, virt, flags)?;
        if old.contains(MmuFlags::WRITE) && !flags.contains(MmuFlags::WRITE) {
            self.queue_invalidate(virt);
        }
        Some(old)
    }

    /// 查询叶映射
    pub fn query(&mut self, virt: usize) -> Option<(PhysAddr, MmuFlags)> {
        ops().query(self.inner.root, virt).map(|(p, f)| (PhysAddr(p), f))
    }
}

impl Drop for MmuBatch<'_> {
    fn drop(&mut self) {
        let ctx = self.ctx;
        let inner = &mut *self.inner;
        ctx.flush_pending(inner);
    }
}

/// 内核 MMU 上下文
static KERNEL_MMU: Once<MmuContext> = Once::new();

/// 初始化内核 MMU 上下文（mm::init 调用）
pub fn init() {
    KERNEL_MMU.call_once(|| MmuContext::new().expect("mmu: cannot create kernel context"));
}

/// 获取内核 MMU 上下文
pub fn kernel_context() -> &'static MmuContext {
    KERNEL_MMU.get().expect("mmu: kernel context not initialized")
}
