//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 内核控制台
//!
//! log 门面的落点：一个固定容量的内核日志环，写满后丢最旧的
//! 字节。Console 是它的句柄层对象，用户态经 handle_control 读
//! 取日志（READ_LOG 的参数是指向 {buf, len} 描述符的用户指针，
//! 经安全拷贝通道解引用）。
//!
//! 引导程序调用 init 把环装成全局 logger；核心自身不往串口或
//! 显存写任何东西。

use alloc::collections::VecDeque;
use alloc::format;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};
use spin::Mutex;

use crate::object::{KernelObject, ObjectType};
use crate::status::{KResult, Status};

/// 日志环容量（字节）
const KLOG_CAPACITY: usize = 64 * 1024;

// 控制台控制请求号
pub const CONSOLE_GET_LOG_SIZE: u32 = 1;
pub const CONSOLE_READ_LOG: u32 = 2;
pub const CONSOLE_CLEAR_LOG: u32 = 3;
pub const CONSOLE_UPDATE_PROGRESS: u32 = 4;

static KLOG: Mutex<VecDeque<u8>> = Mutex::new(VecDeque::new());

/// 追加一段文本，容量不够时挤掉最旧的字节
pub fn klog_append(text: &str) {
    let mut ring = KLOG.lock();
    for &b in text.as_bytes() {
        if ring.len() >= KLOG_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(b);
    }
}

pub fn klog_size() -> usize {
    KLOG.lock().len()
}

/// 把日志头部拷入 buf，返回拷出的字节数；不消费环内容
pub fn klog_read(buf: &mut [u8]) -> usize {
    let ring = KLOG.lock();
    let n = ring.len().min(buf.len());
    for (dst, src) in buf.iter_mut().zip(ring.iter()) {
        *dst = *src;
    }
    n
}

pub fn klog_clear() {
    KLOG.lock().clear();
}

struct KlogLogger;

impl log::Log for KlogLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            klog_append(&format!("[{}] {}\n", record.level(), record.args()));
        }
    }

    fn flush(&self) {}
}

static LOGGER: KlogLogger = KlogLogger;

/// 把日志环装成全局 logger；重复调用是空操作
pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(log::LevelFilter::Debug);
    }
}

/// READ_LOG 的用户态描述符
#[repr(C)]
#[derive(Copy, Clone)]
struct LogRequest {
    buf: u64,
    len: u64,
}

/// 控制台对象
pub struct Console {
    /// 引导进度百分比，给启动画面用
    progress: AtomicU32,
}

impl Console {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { progress: AtomicU32::new(0) })
    }

    pub fn progress(&self) -> u32 {
        self.progress.load(Ordering::Acquire)
    }
}

impl KernelObject for Console {
    fn type_id(&self) -> ObjectType {
        ObjectType::Console
    }

    fn as_any(&self) -> &dyn core::any::Any {
        self
    }

    fn control(&self, request: u32, arg: u64) -> KResult<u64> {
        match request {
            CONSOLE_GET_LOG_SIZE => Ok(klog_size() as u64),
            CONSOLE_READ_LOG => {
                // 描述符和目标缓冲都在调用者的地址空间里
                let process = crate::proc::sched::current_thread()
                    .and_then(|t| t.process())
                    .ok_or(Status::AccessDenied)?;
                let aspace = process.aspace();
                let req: LogRequest = crate::mm::safe::read_user(aspace, arg as usize)?;

                let mut buf = alloc::vec![0u8; (req.len as usize).min(KLOG_CAPACITY)];
                let n = klog_read(&mut buf);
                crate::mm::safe::copy_to_user(aspace, req.buf as usize, &buf[..n])?;
                Ok(n as u64)
            }
            CONSOLE_CLEAR_LOG => {
                klog_clear();
                Ok(0)
            }
            CONSOLE_UPDATE_PROGRESS => {
                let percent = (arg as u32).min(100);
                self.progress.store(percent, Ordering::Release);
                Ok(0)
            }
            _ => Err(Status::InvalidArg),
        }
    }
}
