//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 线程
//!
//! 状态机（转换只经由调度器入口）：
//!
//! ```text
//!   Created → Ready ⇌ Running → Exited
//!                  ↘ Sleeping ↗
//! ```
//!
//! Exited 是终态，线程对象在最后一个引用释放时回收（内核栈
//! 随之归还）。退出原因分 Normal / Killed / Exception，父进程
//! 通过等待拿到。

use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use spin::mutex::SpinMutex as Mutex;

use crate::arch::CpuContext;
use crate::config::{KSTACK_SIZE, PRIORITY_COUNT};
use crate::mm::kmalloc;
use crate::proc::process::Process;
use crate::security::token::Token;
use crate::status::{KResult, Status};

pub type ThreadId = u32;

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ThreadState {
    Created = 0,
    Ready = 1,
    Running = 2,
    /// 在某个等待队列或定时器上
    Sleeping = 3,
    Exited = 4,
}

impl ThreadState {
    fn from_u8(v: u8) -> ThreadState {
        match v {
            0 => ThreadState::Created,
            1 => ThreadState::Ready,
            2 => ThreadState::Running,
            3 => ThreadState::Sleeping,
            _ => ThreadState::Exited,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExitReason {
    Normal,
    Killed,
    Exception,
}

/// kmalloc 出来的固定大小内核栈
#[derive(Debug)]
struct KernelStack {
    base: *mut u8,
}

impl KernelStack {
    fn alloc() -> KResult<Self> {
        let base = kmalloc::kmalloc(KSTACK_SIZE);
        if base.is_null() {
            return Err(Status::NoMemory);
        }
        Ok(Self { base })
    }

    fn top(&self) -> usize {
        self.base as usize + KSTACK_SIZE
    }
}

impl Drop for KernelStack {
    fn drop(&mut self) {
        unsafe { kmalloc::kfree(self.base) }
    }
}

unsafe impl Send for KernelStack {}
unsafe impl Sync for KernelStack {}

static NEXT_THREAD_ID: AtomicU32 = AtomicU32::new(1);

#[derive(Debug)]
pub struct Thread {
    id: ThreadId,
    name: Mutex<String>,
    state: AtomicU8,
    /// 基准优先级，0..PRIORITY_COUNT，越大越先运行
    priority: AtomicU8,
    /// 用满时间片累积的惩罚，压低有效优先级
    penalty: AtomicU8,
    /// 剩余时间片（纳秒）
    timeslice: AtomicU64,
    /// 上次运行的 CPU
    cpu: AtomicUsize,
    /// 允许运行的 CPU 位掩码
    affinity: AtomicUsize,
    context: Mutex<CpuContext>,
    kstack: KernelStack,
    tls_base: AtomicUsize,
    process: Weak<Process>,
    token: Mutex<Arc<Token>>,
    /// 唤醒方填写的阻塞结果
    wait_result: Mutex<Status>,
    /// 当前睡眠是否可中断
    interruptible: AtomicBool,
    /// 被要求退出（可中断睡眠返回 INTERRUPTED）
    killed: AtomicBool,
    /// 用户态析构函数地址，线程退出时在用户上下文执行
    dtors: Mutex<Vec<usize>>,
    exit: Mutex<Option<(i32, ExitReason)>>,
}

impl Thread {
    pub fn new(
        process: Weak<Process>,
        name: String,
        entry: usize,
        priority: u8,
        token: Arc<Token>,
    ) -> KResult<Arc<Self>> {
        if priority as usize >= PRIORITY_COUNT {
            return Err(Status::InvalidArg);
        }

        let kstack = KernelStack::alloc()?;
        let mut context = CpuContext::new();
        context.pc = entry as u64;
        context.sp = kstack.top() as u64;

        Ok(Arc::new(Self {
            id: NEXT_THREAD_ID.fetch_add(1, Ordering::AcqRel),
            name: Mutex::new(name),
            state: AtomicU8::new(ThreadState::Created as u8),
            priority: AtomicU8::new(priority),
            penalty: AtomicU8::new(0),
            timeslice: AtomicU64::new(0),
            cpu: AtomicUsize::new(0),
            affinity: AtomicUsize::new(usize::MAX),
            context: Mutex::new(context),
            kstack,
            tls_base: AtomicUsize::new(0),
            process,
            token: Mutex::new(token),
            wait_result: Mutex::new(Status::Success),
            interruptible: AtomicBool::new(false),
            killed: AtomicBool::new(false),
            dtors: Mutex::new(Vec::new()),
            exit: Mutex::new(None),
        }))
    }

    #[inline]
    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    pub fn set_name(&self, name: String) {
        *self.name.lock() = name;
    }

    #[inline]
    pub fn state(&self) -> ThreadState {
        ThreadState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_state(&self, state: ThreadState) {
        self.state.store(state as u8, Ordering::Release);
    }

    #[inline]
    pub fn priority(&self) -> u8 {
        self.priority.load(Ordering::Acquire)
    }

    pub fn set_priority(&self, priority: u8) -> KResult<()> {
        if priority as usize >= PRIORITY_COUNT {
            return Err(Status::InvalidArg);
        }
        self.priority.store(priority, Ordering::Release);
        Ok(())
    }

    #[inline]
    pub fn penalty(&self) -> u8 {
        self.penalty.load(Ordering::Acquire)
    }

    pub(crate) fn set_penalty(&self, penalty: u8) {
        self.penalty.store(penalty, Ordering::Release);
    }

    /// 惩罚后的有效优先级，调度队列用它索引
    #[inline]
    pub fn curr_priority(&self) -> u8 {
        self.priority().saturating_sub(self.penalty())
    }

    #[inline]
    pub fn timeslice(&self) -> u64 {
        self.timeslice.load(Ordering::Acquire)
    }

    pub(crate) fn set_timeslice(&self, ns: u64) {
        self.timeslice.store(ns, Ordering::Release);
    }

    #[inline]
    pub fn cpu(&self) -> usize {
        self.cpu.load(Ordering::Acquire)
    }

    pub(crate) fn set_cpu(&self, cpu: usize) {
        self.cpu.store(cpu, Ordering::Release);
    }

    #[inline]
    pub fn affinity(&self) -> usize {
        self.affinity.load(Ordering::Acquire)
    }

    pub fn set_affinity(&self, mask: usize) -> KResult<()> {
        if mask == 0 {
            return Err(Status::InvalidArg);
        }
        self.affinity.store(mask, Ordering::Release);
        Ok(())
    }

    #[inline]
    pub fn tls_base(&self) -> usize {
        self.tls_base.load(Ordering::Acquire)
    }

    pub fn set_tls_base(&self, base: usize) {
        self.tls_base.store(base, Ordering::Release);
    }

    pub fn process(&self) -> Option<Arc<Process>> {
        self.process.upgrade()
    }

    pub fn token(&self) -> Arc<Token> {
        self.token.lock().clone()
    }

    pub fn set_token(&self, token: Arc<Token>) {
        *self.token.lock() = token;
    }

    pub fn context(&self) -> &Mutex<CpuContext> {
        &self.context
    }

    pub fn kstack_top(&self) -> usize {
        self.kstack.top()
    }

    pub(crate) fn set_wait_result(&self, result: Status) {
        *self.wait_result.lock() = result;
    }

    pub(crate) fn take_wait_result(&self) -> Status {
        core::mem::replace(&mut *self.wait_result.lock(), Status::Success)
    }

    pub(crate) fn set_interruptible(&self, value: bool) {
        self.interruptible.store(value, Ordering::Release);
    }

    #[inline]
    pub(crate) fn interruptible(&self) -> bool {
        self.interruptible.load(Ordering::Acquire)
    }

    /// 要求线程退出；它的下一个可中断阻塞返回 INTERRUPTED
    pub fn kill(&self) {
        self.killed.store(true, Ordering::Release);
    }

    #[inline]
    pub fn killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }

    /// 注册线程退出时在用户上下文执行的析构函数
    pub fn add_dtor(&self, func: usize) {
        self.dtors.lock().push(func);
    }

    /// 取出全部析构函数（退出路径按注册的逆序执行）
    pub fn take_dtors(&self) -> Vec<usize> {
        let mut dtors = core::mem::take(&mut *self.dtors.lock());
        dtors.reverse();
        dtors
    }

    /// 标记线程退出；重复调用保留首个原因
    pub fn set_exited(&self, code: i32, reason: ExitReason) {
        let mut exit = self.exit.lock();
        if exit.is_none() {
            *exit = Some((code, reason));
        }
        self.set_state(ThreadState::Exited);
    }

    pub fn exit_info(&self) -> Option<(i32, ExitReason)> {
        *self.exit.lock()
    }
}

impl crate::object::KernelObject for Thread {
    fn type_id(&self) -> crate::object::ObjectType {
        crate::object::ObjectType::Thread
    }

    fn as_any(&self) -> &dyn core::any::Any {
        self
    }
}
