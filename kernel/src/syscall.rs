//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 系统调用分发
//!
//! 静态表按调用号索引到 (名字, 处理函数, 参数个数)。入口只做
//! 越界检查，其余验证全在处理函数里：用户指针一律走 mm::safe
//! 的安全拷贝通道，句柄经当前进程的句柄表解析。所有处理函数
//! 返回 status_t（0 成功，正数为失败类别）；产出值（新句柄、
//! 等待结果下标）经由出参指针写回用户态。
//!
//! 文件系统和网络的调用号保留在表里，处理函数返回
//! NOT_IMPLEMENTED（这两个子系统是外部协作者）。

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::arch;
use crate::config::PAGE_SIZE;
use crate::mm::safe;
use crate::mm::vm::{VmFlags, VmRights};
use crate::object::handle::{Handle, HandleFlags, HandleRights};
use crate::object::{self, KernelObject};
use crate::proc::process::Process;
use crate::proc::sched;
use crate::proc::thread::{ExitReason, Thread};
use crate::security::token::Privilege;
use crate::status::{KResult, Status};
use crate::sync::waitq::SleepFlags;
use crate::sync::{condition::Condition, futex, semaphore::Semaphore};
use crate::time::timer::{TimerMode, TimerObject};

/// 线程名等字符串参数的长度上限
const NAME_MAX: usize = 256;

/// 相对超时的"无限"哨兵
pub const TIMEOUT_INFINITE: u64 = u64::MAX;

// thread_control 请求号
pub const THREAD_SET_TLS: u32 = 1;

// system_shutdown 动作
pub const SHUTDOWN_REBOOT: u32 = 1;
pub const SHUTDOWN_POWEROFF: u32 = 2;

type Handler = fn(&[u64; 6]) -> i32;

struct SyscallEntry {
    name: &'static str,
    handler: Handler,
    arg_count: u8,
}

macro_rules! syscall_table {
    ($(($name:expr, $handler:expr, $argc:expr)),* $(,)?) => {
        &[$(SyscallEntry { name: $name, handler: $handler, arg_count: $argc }),*]
    };
}

static SYSCALLS: &[SyscallEntry] = syscall_table![
    // 进程 / 线程
    ("thread_create", sys_thread_create, 4),
    ("thread_exit", sys_thread_exit, 1),
    ("thread_control", sys_thread_control, 2),
    ("thread_add_dtor", sys_thread_add_dtor, 1),
    ("thread_id", sys_thread_id, 1),
    ("thread_sleep", sys_thread_sleep, 1),
    ("thread_yield", sys_thread_yield, 0),
    ("process_clone", sys_process_clone, 2),
    ("process_exit", sys_process_exit, 1),
    ("process_control", sys_process_control, 2),
    ("process_id", sys_process_id, 1),
    // 对象
    ("handle_close", sys_handle_close, 1),
    ("handle_duplicate", sys_handle_duplicate, 2),
    ("handle_wait", sys_handle_wait, 4),
    ("handle_control", sys_handle_control, 4),
    // 内存
    ("mem_map", sys_mem_map, 5),
    ("mem_unmap", sys_mem_unmap, 2),
    ("mem_protect", sys_mem_protect, 3),
    ("mem_reserve", sys_mem_reserve, 2),
    // 同步
    ("futex_wait", sys_futex_wait, 3),
    ("futex_wake", sys_futex_wake, 2),
    ("futex_requeue", sys_futex_requeue, 4),
    ("semaphore_create", sys_semaphore_create, 2),
    ("semaphore_down", sys_semaphore_down, 2),
    ("semaphore_up", sys_semaphore_up, 2),
    ("condition_create", sys_condition_create, 1),
    ("condition_set", sys_condition_set, 2),
    ("timer_create", sys_timer_create, 1),
    ("timer_start", sys_timer_start, 3),
    ("timer_stop", sys_timer_stop, 1),
    // 文件系统（外部协作者，未接入）
    ("fs_open", sys_not_implemented, 3),
    ("fs_read", sys_not_implemented, 4),
    ("fs_write", sys_not_implemented, 4),
    ("fs_mkdir", sys_not_implemented, 1),
    ("fs_unlink", sys_not_implemented, 1),
    ("fs_pipe", sys_not_implemented, 2),
    // 网络（外部协作者，未接入）
    ("net_socket", sys_not_implemented, 3),
    ("net_bind", sys_not_implemented, 3),
    ("net_connect", sys_not_implemented, 3),
    ("net_send", sys_not_implemented, 4),
    ("net_recv", sys_not_implemented, 4),
    // 系统
    ("system_info", sys_system_info, 1),
    ("system_shutdown", sys_system_shutdown, 1),
    ("system_fatal", sys_system_fatal, 1),
];

/// 系统调用入口（体系结构入口存根保存完用户帧后调用）
pub fn dispatch(num: usize, args: &[u64; 6]) -> i32 {
    let Some(entry) = SYSCALLS.get(num) else {
        log::warn!("syscall: invalid number {}", num);
        return Status::InvalidSyscall.as_i32();
    };
    log::trace!("syscall: {} ({} args)", entry.name, entry.arg_count);
    (entry.handler)(args)
}

#[cfg(test)]
pub fn syscall_number(name: &str) -> Option<usize> {
    SYSCALLS.iter().position(|e| e.name == name)
}

fn current_process() -> KResult<Arc<Process>> {
    sched::current_thread()
        .and_then(|t| t.process())
        .ok_or(Status::AccessDenied)
}

fn current_thread() -> KResult<Arc<Thread>> {
    sched::current_thread().ok_or(Status::AccessDenied)
}

/// 相对超时换算为绝对截止时刻；0 = 只轮询，u64::MAX = 无限
fn deadline_of(timeout_ns: u64) -> Option<u64> {
    match timeout_ns {
        TIMEOUT_INFINITE => None,
        0 => Some(0),
        t => Some(arch::timestamp() + t),
    }
}

// ============================================================
// 进程 / 线程
// ============================================================

fn sys_thread_create(args: &[u64; 6]) -> i32 {
    let (entry, name_ptr, priority, out_ptr) =
        (args[0] as usize, args[1] as usize, args[2] as u8, args[3] as usize);
    Status::from_result((|| -> KResult<()> {
        let process = current_process()?;
        let name = safe::strndup_from_user(process.aspace(), name_ptr, NAME_MAX)?;
        let thread = process.spawn_thread(name, entry, priority)?;
        let handle = process.handles().attach(
            thread.clone(),
            HandleRights::all(),
            HandleFlags::empty(),
        )?;
        sched::insert_thread(&thread);
        safe::write_user(process.aspace(), out_ptr, handle)?;
        Ok(())
    })())
}

fn sys_thread_exit(args: &[u64; 6]) -> i32 {
    sched::exit_current(args[0] as i32, ExitReason::Normal);
    Status::Success.as_i32()
}

fn sys_thread_control(args: &[u64; 6]) -> i32 {
    let (request, arg) = (args[0] as u32, args[1]);
    Status::from_result((|| -> KResult<()> {
        let thread = current_thread()?;
        match request {
            THREAD_SET_TLS => {
                // 硬件 TLS 寄存器在下次上下文恢复时装入
                thread.set_tls_base(arg as usize);
                Ok(())
            }
            _ => Err(Status::InvalidArg),
        }
    })())
}

fn sys_thread_add_dtor(args: &[u64; 6]) -> i32 {
    Status::from_result((|| -> KResult<()> {
        current_thread()?.add_dtor(args[0] as usize);
        Ok(())
    })())
}

fn sys_thread_id(args: &[u64; 6]) -> i32 {
    Status::from_result((|| -> KResult<()> {
        let thread = current_thread()?;
        let process = current_process()?;
        safe::write_user(process.aspace(), args[0] as usize, thread.id())
    })())
}

fn sys_thread_sleep(args: &[u64; 6]) -> i32 {
    let queue = crate::sync::waitq::WaitQueue::new("thread_sleep");
    match queue.sleep(deadline_of(args[0]), SleepFlags::INTERRUPTIBLE) {
        // 自然到期是这条调用的成功路径
        Status::TimedOut | Status::Success => Status::Success.as_i32(),
        status => status.as_i32(),
    }
}

fn sys_thread_yield(_args: &[u64; 6]) -> i32 {
    sched::yield_now();
    Status::Success.as_i32()
}

fn sys_process_clone(args: &[u64; 6]) -> i32 {
    let (name_ptr, out_ptr) = (args[0] as usize, args[1] as usize);
    Status::from_result((|| -> KResult<()> {
        let parent = current_process()?;
        let name = safe::strndup_from_user(parent.aspace(), name_ptr, NAME_MAX)?;
        let child = parent.clone_process(name)?;
        let handle = parent.handles().attach(
            child.clone(),
            HandleRights::all(),
            HandleFlags::empty(),
        )?;
        safe::write_user(parent.aspace(), out_ptr, handle)?;
        Ok(())
    })())
}

fn sys_process_exit(args: &[u64; 6]) -> i32 {
    let code = args[0] as i32;
    if let Ok(process) = current_process() {
        // 其余线程协作退出；当前线程立即走退出路径
        process.kill();
    }
    sched::exit_current(code, ExitReason::Normal);
    Status::Success.as_i32()
}

fn sys_process_control(args: &[u64; 6]) -> i32 {
    Status::from_result((|| -> KResult<()> {
        current_process()?.process_control(args[0] as u32, args[1])?;
        Ok(())
    })())
}

fn sys_process_id(args: &[u64; 6]) -> i32 {
    Status::from_result((|| -> KResult<()> {
        let process = current_process()?;
        safe::write_user(process.aspace(), args[0] as usize, process.id())
    })())
}

// ============================================================
// 对象
// ============================================================

fn sys_handle_close(args: &[u64; 6]) -> i32 {
    Status::from_result((|| -> KResult<()> {
        current_process()?.handles().detach(args[0] as Handle)
    })())
}

fn sys_handle_duplicate(args: &[u64; 6]) -> i32 {
    let (handle, out_ptr) = (args[0] as Handle, args[1] as usize);
    Status::from_result((|| -> KResult<()> {
        let process = current_process()?;
        let dup = process.handles().duplicate(handle)?;
        safe::write_user(process.aspace(), out_ptr, dup)
    })())
}

/// handle_wait 的用户态表项
#[repr(C)]
#[derive(Copy, Clone)]
struct WaitEntry {
    handle: Handle,
    event: u32,
}

fn sys_handle_wait(args: &[u64; 6]) -> i32 {
    let (entries_ptr, count, timeout_ns, out_ptr) =
        (args[0] as usize, args[1] as usize, args[2], args[3] as usize);
    Status::from_result((|| -> KResult<()> {
        if count == 0 || count > 64 {
            return Err(Status::InvalidArg);
        }
        let process = current_process()?;

        let mut raw = alloc::vec![0u8; count * core::mem::size_of::<WaitEntry>()];
        safe::copy_from_user(process.aspace(), &mut raw, entries_ptr)?;

        let mut entries: Vec<(Arc<dyn KernelObject>, u32)> = Vec::with_capacity(count);
        for i in 0..count {
            let entry: WaitEntry = unsafe {
                core::ptr::read_unaligned(
                    raw.as_ptr().add(i * core::mem::size_of::<WaitEntry>()) as *const WaitEntry
                )
            };
            let object = process.handles().lookup(entry.handle, HandleRights::WAIT)?;
            entries.push((object, entry.event));
        }

        let index = object::object_wait(&entries, deadline_of(timeout_ns))?;
        safe::write_user(process.aspace(), out_ptr, index as u32)
    })())
}

fn sys_handle_control(args: &[u64; 6]) -> i32 {
    let (handle, request, arg, out_ptr) =
        (args[0] as Handle, args[1] as u32, args[2], args[3] as usize);
    Status::from_result((|| -> KResult<()> {
        let process = current_process()?;
        let object = process.handles().lookup(handle, HandleRights::CONTROL)?;
        let value = object.control(request, arg)?;
        if out_ptr != 0 {
            safe::write_user(process.aspace(), out_ptr, value)?;
        }
        Ok(())
    })())
}

// ============================================================
// 内存
// ============================================================

fn sys_mem_map(args: &[u64; 6]) -> i32 {
    let (hint, size, rights, flags, out_ptr) = (
        args[0] as usize,
        args[1] as usize,
        VmRights::from_bits_truncate(args[2] as u32),
        VmFlags::from_bits_truncate(args[3] as u32),
        args[4] as usize,
    );
    Status::from_result((|| -> KResult<()> {
        let process = current_process()?;
        let addr = process.aspace().map_anon(hint, size, rights, flags)?;
        safe::write_user(process.aspace(), out_ptr, addr.0 as u64)
    })())
}

fn sys_mem_unmap(args: &[u64; 6]) -> i32 {
    Status::from_result((|| -> KResult<()> {
        current_process()?.aspace().unmap(args[0] as usize, args[1] as usize)
    })())
}

fn sys_mem_protect(args: &[u64; 6]) -> i32 {
    Status::from_result((|| -> KResult<()> {
        current_process()?.aspace().protect(
            args[0] as usize,
            args[1] as usize,
            VmRights::from_bits_truncate(args[2] as u32),
        )
    })())
}

fn sys_mem_reserve(args: &[u64; 6]) -> i32 {
    Status::from_result((|| -> KResult<()> {
        current_process()?.aspace().reserve(args[0] as usize, args[1] as usize)
    })())
}

// ============================================================
// 同步
// ============================================================

fn sys_futex_wait(args: &[u64; 6]) -> i32 {
    let result: KResult<Arc<Process>> = current_process();
    match result {
        Ok(process) => futex::wait(
            process.aspace(),
            args[0] as usize,
            args[1] as u32,
            deadline_of(args[2]),
            SleepFlags::empty(),
        )
        .as_i32(),
        Err(status) => status.as_i32(),
    }
}

fn sys_futex_wake(args: &[u64; 6]) -> i32 {
    Status::from_result((|| -> KResult<()> {
        let process = current_process()?;
        futex::wake(process.aspace(), args[0] as usize, args[1] as usize)?;
        Ok(())
    })())
}

fn sys_futex_requeue(args: &[u64; 6]) -> i32 {
    Status::from_result((|| -> KResult<()> {
        let process = current_process()?;
        futex::requeue(
            process.aspace(),
            args[0] as usize,
            args[1] as u32,
            args[2] as usize,
            args[3] as usize,
        )?;
        Ok(())
    })())
}

/// 句柄解析出的对象按具体类型派发
fn downcast<T: 'static>(object: &Arc<dyn KernelObject>) -> KResult<&T> {
    object.as_any().downcast_ref::<T>().ok_or(Status::NotSupported)
}

/// 新建对象挂进句柄表并把句柄写回 out_ptr
fn attach_new(object: Arc<dyn KernelObject>, out_ptr: usize) -> KResult<()> {
    let process = current_process()?;
    let handle = process.handles().attach(object, HandleRights::all(), HandleFlags::empty())?;
    safe::write_user(process.aspace(), out_ptr, handle)
}

fn sys_semaphore_create(args: &[u64; 6]) -> i32 {
    Status::from_result(attach_new(Semaphore::new(args[0] as u32), args[1] as usize))
}

fn sys_semaphore_down(args: &[u64; 6]) -> i32 {
    let (handle, timeout_ns) = (args[0] as Handle, args[1]);
    let object = match current_process()
        .and_then(|p| p.handles().lookup(handle, HandleRights::WAIT))
    {
        Ok(object) => object,
        Err(status) => return status.as_i32(),
    };
    let sem = match downcast::<Semaphore>(&object) {
        Ok(sem) => sem,
        Err(status) => return status.as_i32(),
    };
    let flags = if timeout_ns == 0 { SleepFlags::NONBLOCK } else { SleepFlags::INTERRUPTIBLE };
    sem.down(deadline_of(timeout_ns), flags).as_i32()
}

fn sys_semaphore_up(args: &[u64; 6]) -> i32 {
    let (handle, n) = (args[0] as Handle, args[1] as u32);
    Status::from_result((|| -> KResult<()> {
        let process = current_process()?;
        let object = process.handles().lookup(handle, HandleRights::WRITE)?;
        downcast::<Semaphore>(&object)?.up(n);
        Ok(())
    })())
}

fn sys_condition_create(args: &[u64; 6]) -> i32 {
    Status::from_result(attach_new(Condition::new(false), args[0] as usize))
}

fn sys_condition_set(args: &[u64; 6]) -> i32 {
    let (handle, value) = (args[0] as Handle, args[1] != 0);
    Status::from_result((|| -> KResult<()> {
        let process = current_process()?;
        let object = process.handles().lookup(handle, HandleRights::WRITE)?;
        downcast::<Condition>(&object)?.set(value);
        Ok(())
    })())
}

fn sys_timer_create(args: &[u64; 6]) -> i32 {
    Status::from_result(attach_new(TimerObject::create(), args[0] as usize))
}

fn sys_timer_start(args: &[u64; 6]) -> i32 {
    let (handle, interval, mode) = (args[0] as Handle, args[1], args[2]);
    Status::from_result((|| -> KResult<()> {
        let process = current_process()?;
        let object = process.handles().lookup(handle, HandleRights::WRITE)?;
        let mode = match mode {
            0 => TimerMode::OneShot,
            1 => TimerMode::Periodic,
            _ => return Err(Status::InvalidArg),
        };
        downcast::<TimerObject>(&object)?.start(interval, mode)
    })())
}

fn sys_timer_stop(args: &[u64; 6]) -> i32 {
    Status::from_result((|| -> KResult<()> {
        let process = current_process()?;
        let object = process.handles().lookup(args[0] as Handle, HandleRights::WRITE)?;
        downcast::<TimerObject>(&object)?.stop();
        Ok(())
    })())
}

// ============================================================
// 系统
// ============================================================

fn sys_not_implemented(_args: &[u64; 6]) -> i32 {
    Status::NotImplemented.as_i32()
}

/// system_info 的输出结构
#[repr(C)]
#[derive(Copy, Clone)]
struct SystemInfo {
    page_size: u64,
    cpu_count: u64,
    kernel_version: [u8; 16],
}

fn sys_system_info(args: &[u64; 6]) -> i32 {
    Status::from_result((|| -> KResult<()> {
        let process = current_process()?;
        let mut info = SystemInfo {
            page_size: PAGE_SIZE as u64,
            cpu_count: arch::cpu_count() as u64,
            kernel_version: [0; 16],
        };
        let version = crate::config::KERNEL_VERSION.as_bytes();
        let n = version.len().min(15);
        info.kernel_version[..n].copy_from_slice(&version[..n]);
        safe::write_user(process.aspace(), args[0] as usize, info)
    })())
}

fn sys_system_shutdown(args: &[u64; 6]) -> i32 {
    Status::from_result((|| -> KResult<()> {
        let thread = current_thread()?;
        if !thread.token().check_priv(Privilege::SHUTDOWN) {
            return Err(Status::PrivRequired);
        }
        let action = match args[0] as u32 {
            SHUTDOWN_REBOOT => "reboot",
            SHUTDOWN_POWEROFF => "poweroff",
            _ => return Err(Status::InvalidArg),
        };
        // 平台关机序列属于引导存根；核心只记账
        log::warn!("system: shutdown requested ({})", action);
        Err(Status::NotImplemented)
    })())
}

fn sys_system_fatal(args: &[u64; 6]) -> i32 {
    Status::from_result((|| -> KResult<()> {
        let thread = current_thread()?;
        if !thread.token().check_priv(Privilege::FATAL) {
            return Err(Status::PrivRequired);
        }
        let process = current_process()?;
        let message = safe::strndup_from_user(process.aspace(), args[0] as usize, NAME_MAX)
            .unwrap_or_else(|_| String::from("(unreadable)"));
        log::error!("system: fatal from process {}: {}", process.id(), message);
        sched::exit_current(-1, ExitReason::Exception);
        Ok(())
    })())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proc::process::Session;
    use crate::security::token::Token;
    use crate::test_util;

    fn no_args() -> [u64; 6] {
        [0; 6]
    }

    /// 当前线程挂成指定令牌的进程成员
    fn enter_process(token: Arc<Token>) -> Arc<Process> {
        let process =
            Process::create(String::from("syscall-test"), token, Session::new()).unwrap();
        let thread = process
            .spawn_thread(String::from("main"), 0x1000, 16)
            .unwrap();
        sched::adopt(thread);
        process
    }

    #[test]
    fn test_invalid_syscall_number() {
        test_util::bootstrap();

        assert_eq!(
            dispatch(SYSCALLS.len(), &no_args()),
            Status::InvalidSyscall.as_i32()
        );
        assert_eq!(dispatch(usize::MAX, &no_args()), Status::InvalidSyscall.as_i32());
    }

    #[test]
    fn test_fs_and_net_not_implemented() {
        test_util::bootstrap();

        let fs_open = syscall_number("fs_open").unwrap();
        let net_socket = syscall_number("net_socket").unwrap();
        assert_eq!(dispatch(fs_open, &no_args()), Status::NotImplemented.as_i32());
        assert_eq!(dispatch(net_socket, &no_args()), Status::NotImplemented.as_i32());
    }

    #[test]
    fn test_no_process_denied() {
        test_util::bootstrap();
        let _guard = test_util::serialize();

        sched::test_reset();
        let num = syscall_number("mem_map").unwrap();
        assert_eq!(dispatch(num, &no_args()), Status::AccessDenied.as_i32());
    }

    #[test]
    fn test_mem_map_and_unmap() {
        test_util::bootstrap();
        let _guard = test_util::serialize();

        let process = enter_process(Token::kernel());

        // 出参落在映射好的用户页里
        let out = process
            .aspace()
            .map_anon(0, PAGE_SIZE, VmRights::READ | VmRights::WRITE, VmFlags::empty())
            .unwrap()
            .0;

        let args = [
            0,
            (4 * PAGE_SIZE) as u64,
            (VmRights::READ | VmRights::WRITE).bits() as u64,
            0,
            out as u64,
            0,
        ];
        let num = syscall_number("mem_map").unwrap();
        assert_eq!(dispatch(num, &args), 0);

        let addr: u64 = safe::read_user(process.aspace(), out).unwrap();
        assert!(addr as usize >= crate::config::USER_BASE);

        let num = syscall_number("mem_unmap").unwrap();
        assert_eq!(dispatch(num, &[addr, (4 * PAGE_SIZE) as u64, 0, 0, 0, 0]), 0);

        sched::test_reset();
    }

    #[test]
    fn test_semaphore_syscalls() {
        test_util::bootstrap();
        let _guard = test_util::serialize();

        let process = enter_process(Token::kernel());
        let out = process
            .aspace()
            .map_anon(0, PAGE_SIZE, VmRights::READ | VmRights::WRITE, VmFlags::empty())
            .unwrap()
            .0;

        let num = syscall_number("semaphore_create").unwrap();
        assert_eq!(dispatch(num, &[1, out as u64, 0, 0, 0, 0]), 0);
        let handle: Handle = safe::read_user(process.aspace(), out).unwrap();
        assert!(handle >= 0);

        // 计数 1：立即成功；计数 0 非阻塞：WOULD_BLOCK
        let down = syscall_number("semaphore_down").unwrap();
        assert_eq!(dispatch(down, &[handle as u64, 0, 0, 0, 0, 0]), 0);
        assert_eq!(
            dispatch(down, &[handle as u64, 0, 0, 0, 0, 0]),
            Status::WouldBlock.as_i32()
        );

        let up = syscall_number("semaphore_up").unwrap();
        assert_eq!(dispatch(up, &[handle as u64, 1, 0, 0, 0, 0]), 0);
        assert_eq!(dispatch(down, &[handle as u64, 0, 0, 0, 0, 0]), 0);

        // 关闭后句柄失效
        let close = syscall_number("handle_close").unwrap();
        assert_eq!(dispatch(close, &[handle as u64, 0, 0, 0, 0, 0]), 0);
        assert_eq!(
            dispatch(down, &[handle as u64, 0, 0, 0, 0, 0]),
            Status::InvalidHandle.as_i32()
        );

        sched::test_reset();
    }

    #[test]
    fn test_handle_wait_polls_condition() {
        test_util::bootstrap();
        let _guard = test_util::serialize();

        let process = enter_process(Token::kernel());
        let scratch = process
            .aspace()
            .map_anon(0, PAGE_SIZE, VmRights::READ | VmRights::WRITE, VmFlags::empty())
            .unwrap()
            .0;

        let create = syscall_number("condition_create").unwrap();
        assert_eq!(dispatch(create, &[scratch as u64, 0, 0, 0, 0, 0]), 0);
        let handle: Handle = safe::read_user(process.aspace(), scratch).unwrap();

        let entry = WaitEntry { handle, event: crate::sync::condition::CONDITION_EVENT_SET };
        let entries_ptr = scratch + 64;
        let entry_bytes = unsafe {
            core::slice::from_raw_parts(
                &entry as *const WaitEntry as *const u8,
                core::mem::size_of::<WaitEntry>(),
            )
        };
        safe::copy_to_user(process.aspace(), entries_ptr, entry_bytes).unwrap();

        let out_ptr = scratch + 128;
        let wait = syscall_number("handle_wait").unwrap();
        let wait_args = [entries_ptr as u64, 1, 0, out_ptr as u64, 0, 0];
        // 未置位：轮询超时
        assert_eq!(dispatch(wait, &wait_args), Status::TimedOut.as_i32());

        let set = syscall_number("condition_set").unwrap();
        assert_eq!(dispatch(set, &[handle as u64, 1, 0, 0, 0, 0]), 0);
        assert_eq!(dispatch(wait, &wait_args), 0);
        let index: u32 = safe::read_user(process.aspace(), out_ptr).unwrap();
        assert_eq!(index, 0);

        sched::test_reset();
    }

    #[test]
    fn test_shutdown_requires_privilege() {
        test_util::bootstrap();
        let _guard = test_util::serialize();

        let plain = Token::new(1000, 1000, Privilege::empty(), Privilege::empty());
        enter_process(plain);
        let num = syscall_number("system_shutdown").unwrap();
        assert_eq!(
            dispatch(num, &[SHUTDOWN_REBOOT as u64, 0, 0, 0, 0, 0]),
            Status::PrivRequired.as_i32()
        );
        sched::test_reset();

        enter_process(Token::kernel());
        // 有特权：走到平台存根，返回未实现
        assert_eq!(
            dispatch(num, &[SHUTDOWN_REBOOT as u64, 0, 0, 0, 0, 0]),
            Status::NotImplemented.as_i32()
        );
        sched::test_reset();
    }

    #[test]
    fn test_system_info() {
        test_util::bootstrap();
        let _guard = test_util::serialize();

        let process = enter_process(Token::kernel());
        let out = process
            .aspace()
            .map_anon(0, PAGE_SIZE, VmRights::READ | VmRights::WRITE, VmFlags::empty())
            .unwrap()
            .0;

        let num = syscall_number("system_info").unwrap();
        assert_eq!(dispatch(num, &[out as u64, 0, 0, 0, 0, 0]), 0);
        let info: SystemInfo = safe::read_user(process.aspace(), out).unwrap();
        assert_eq!(info.page_size, PAGE_SIZE as u64);
        assert_eq!(info.cpu_count, arch::cpu_count() as u64);

        sched::test_reset();
    }
}
