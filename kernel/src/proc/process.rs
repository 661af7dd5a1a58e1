//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 进程与会话
//!
//! 进程拥有地址空间、句柄表、凭证令牌和线程列表，本身也是
//! 句柄层对象：退出时投递 PROCESS_EVENT_EXITED，父进程经多路
//! 等待收割。克隆复制地址空间（COW）、可继承句柄和令牌（按
//! copy_on_inherit 决定共享还是复制），会话原样共享。
//!
//! 会话只是一个引用计数的编号，把进程分组给信号/终端用；
//! 最后一个进程退出时随引用计数消亡。

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use spin::Mutex;

use crate::config::PROCESS_LIMIT;
use crate::mm::vm::AddressSpace;
use crate::object::{EventList, EventWaiter, KernelObject, ObjectType};
use crate::proc::thread::{ExitReason, Thread};
use crate::security::token::Token;
use crate::status::{KResult, Status};

pub type ProcessId = u32;
pub type SessionId = u32;

/// 进程退出事件
pub const PROCESS_EVENT_EXITED: u32 = 1;

// process_control 请求号
/// 镜像装载完成，进程可以正常运行
pub const PROCESS_LOADED: u32 = 1;
/// 设置异常恢复入口
pub const PROCESS_SET_RESTORE: u32 = 2;

static NEXT_PROCESS_ID: AtomicU32 = AtomicU32::new(1);
static NEXT_SESSION_ID: AtomicU32 = AtomicU32::new(1);

/// 全局进程表；进程退出时摘除
static PROCESSES: Mutex<BTreeMap<ProcessId, Arc<Process>>> = Mutex::new(BTreeMap::new());

/// 会话
pub struct Session {
    id: SessionId,
}

impl Session {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::AcqRel),
        })
    }

    #[inline]
    pub fn id(&self) -> SessionId {
        self.id
    }
}

pub struct Process {
    id: ProcessId,
    name: Mutex<String>,
    aspace: Arc<AddressSpace>,
    handles: crate::object::handle::HandleTable,
    token: Mutex<Arc<Token>>,
    session: Mutex<Arc<Session>>,
    threads: Mutex<Vec<Arc<Thread>>>,
    /// 镜像装载完成标志（process_control LOADED）
    loaded: AtomicBool,
    /// 异常恢复入口（process_control SET_RESTORE）
    restore_addr: Mutex<Option<usize>>,
    exit: Mutex<Option<(i32, ExitReason)>>,
    events: EventList,
    exited_latch: AtomicBool,
    self_ref: Weak<Process>,
}

impl Process {
    /// 创建空进程（地址空间全新，线程由调用方随后挂入）
    pub fn create(name: String, token: Arc<Token>, session: Arc<Session>) -> KResult<Arc<Self>> {
        let aspace = AddressSpace::new()?;
        Self::attach(name, aspace, crate::object::handle::HandleTable::new(), token, session)
    }

    fn attach(
        name: String,
        aspace: Arc<AddressSpace>,
        handles: crate::object::handle::HandleTable,
        token: Arc<Token>,
        session: Arc<Session>,
    ) -> KResult<Arc<Self>> {
        let mut table = PROCESSES.lock();
        if table.len() >= PROCESS_LIMIT {
            return Err(Status::ProcessLimit);
        }

        let process = Arc::new_cyclic(|weak| Self {
            id: NEXT_PROCESS_ID.fetch_add(1, Ordering::AcqRel),
            name: Mutex::new(name),
            aspace,
            handles,
            token: Mutex::new(token),
            session: Mutex::new(session),
            threads: Mutex::new(Vec::new()),
            loaded: AtomicBool::new(false),
            restore_addr: Mutex::new(None),
            exit: Mutex::new(None),
            events: EventList::new(),
            exited_latch: AtomicBool::new(false),
            self_ref: weak.clone(),
        });
        table.insert(process.id, process.clone());
        log::debug!("proc: created process {} ({})", process.id, process.name());
        Ok(process)
    }

    #[inline]
    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    #[inline]
    pub fn aspace(&self) -> &Arc<AddressSpace> {
        &self.aspace
    }

    #[inline]
    pub fn handles(&self) -> &crate::object::handle::HandleTable {
        &self.handles
    }

    pub fn token(&self) -> Arc<Token> {
        self.token.lock().clone()
    }

    pub fn set_token(&self, token: Arc<Token>) {
        *self.token.lock() = token;
    }

    pub fn session(&self) -> Arc<Session> {
        self.session.lock().clone()
    }

    #[inline]
    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    pub fn restore_addr(&self) -> Option<usize> {
        *self.restore_addr.lock()
    }

    pub fn exit_info(&self) -> Option<(i32, ExitReason)> {
        *self.exit.lock()
    }

    pub fn thread_count(&self) -> usize {
        self.threads.lock().len()
    }

    /// 在本进程内创建线程，默认继承进程令牌
    pub fn spawn_thread(&self, name: String, entry: usize, priority: u8) -> KResult<Arc<Thread>> {
        if self.exit.lock().is_some() {
            return Err(Status::Dead);
        }
        let thread = Thread::new(
            self.self_ref.clone(),
            name,
            entry,
            priority,
            self.token(),
        )?;
        self.threads.lock().push(thread.clone());
        Ok(thread)
    }

    /// 线程退出回调；最后一个线程退出即进程退出
    pub fn note_thread_exit(&self, thread: &Arc<Thread>) {
        let last = {
            let mut threads = self.threads.lock();
            threads.retain(|t| !Arc::ptr_eq(t, thread));
            threads.is_empty()
        };
        if last {
            let (code, reason) = thread.exit_info().unwrap_or((0, ExitReason::Normal));
            self.exit_process(code, reason);
        }
    }

    /// 记录进程退出并投递退出事件；重复调用保留首个原因
    fn exit_process(&self, code: i32, reason: ExitReason) {
        {
            let mut exit = self.exit.lock();
            if exit.is_some() {
                return;
            }
            *exit = Some((code, reason));
        }
        PROCESSES.lock().remove(&self.id);
        log::info!("proc: process {} ({}) exited with {}", self.id, self.name(), code);
        if self.events.signal(PROCESS_EVENT_EXITED) == 0 {
            self.exited_latch.store(true, Ordering::Release);
        }
    }

    /// 要求所有线程退出（协作式：各线程在下个可中断点返回）
    pub fn kill(&self) {
        for thread in self.threads.lock().iter() {
            thread.kill();
        }
    }

    /// 克隆：COW 地址空间 + 可继承句柄 + 令牌继承 + 同一会话
    pub fn clone_process(&self, name: String) -> KResult<Arc<Process>> {
        let aspace = self.aspace.clone_regions()?;
        let handles = self.handles.clone_inheritable();
        let token = self.token.lock().inherit();
        let session = self.session();
        let child = Self::attach(name, aspace, handles, token, session)?;
        child.loaded.store(self.is_loaded(), Ordering::Release);
        Ok(child)
    }

    /// 类型私有控制消息（句柄层 handle_control 的进程分支）
    pub fn process_control(&self, request: u32, arg: u64) -> KResult<u64> {
        match request {
            PROCESS_LOADED => {
                self.loaded.store(true, Ordering::Release);
                Ok(0)
            }
            PROCESS_SET_RESTORE => {
                *self.restore_addr.lock() = Some(arg as usize);
                Ok(0)
            }
            _ => Err(Status::InvalidArg),
        }
    }
}

impl KernelObject for Process {
    fn type_id(&self) -> ObjectType {
        ObjectType::Process
    }

    fn as_any(&self) -> &dyn core::any::Any {
        self
    }

    fn wait_begin(&self, event: u32, index: usize, waiter: &Arc<EventWaiter>) -> KResult<()> {
        if event != PROCESS_EVENT_EXITED {
            return Err(Status::InvalidArg);
        }
        // 退出是单向的：已退出即触发
        if self.exit.lock().is_some() || self.exited_latch.swap(false, Ordering::AcqRel) {
            waiter.signal(index);
        } else {
            self.events.register(event, index, waiter);
        }
        Ok(())
    }

    fn wait_end(&self, event: u32, waiter: &Arc<EventWaiter>) {
        self.events.deregister(event, waiter);
    }

    fn control(&self, request: u32, arg: u64) -> KResult<u64> {
        self.process_control(request, arg)
    }
}

/// 按编号查进程
pub fn lookup(id: ProcessId) -> Option<Arc<Process>> {
    PROCESSES.lock().get(&id).cloned()
}

pub fn process_count() -> usize {
    PROCESSES.lock().len()
}
