//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! Futex
//!
//! 用户态锁的内核慢路径。键是用户地址背后的物理地址（页帧 +
//! 页内偏移），因此共享映射跨进程落到同一条队列。队列在首次
//! 等待时惰性建表，清空即回收。
//!
//! wait 的原子性：等待者先入队，再在表锁内复查取值与队列的
//! 表内身份；wake 改内存后要进同一把锁才能找到队列。复查失败
//! 说明唤醒已经发生，等待者撤下队列直接返回。

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use spin::Mutex;

use crate::arch;
use crate::mm::safe;
use crate::mm::vm::AddressSpace;
use crate::status::{KResult, Status};

use super::waitq::{SleepFlags, WaitQueue};

/// 物理地址键；4 字节对齐由调用路径保证
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct FutexKey(u64);

static TABLE: Mutex<BTreeMap<FutexKey, Arc<WaitQueue>>> = Mutex::new(BTreeMap::new());

fn key_for(aspace: &AddressSpace, addr: usize, write: bool) -> KResult<FutexKey> {
    if addr & 3 != 0 {
        return Err(Status::InvalidArg);
    }
    let phys = safe::user_phys(aspace, addr, write)?;
    Ok(FutexKey(phys.as_u64()))
}

/// 表锁内读取用户字的当前值
fn load_value(key: FutexKey) -> u32 {
    let ptr = arch::phys_map(key.0) as *const u32;
    unsafe { core::ptr::read_volatile(ptr) }
}

/// 入队之后的复查：值未变，且 queue 仍是表里 key 对应的那条
///
/// 队列被并发 wake 清空后会从表上回收，晚到的等待者若还睡在
/// 旧队列上就再也没人能唤醒它；复查到回收即视作唤醒已发生
fn still_parked(key: FutexKey, expected: u32, queue: &Arc<WaitQueue>) -> bool {
    let table = TABLE.lock();
    load_value(key) == expected
        && table.get(&key).map_or(false, |q| Arc::ptr_eq(q, queue))
}

/// `*addr == expected` 时阻塞，否则 WOULD_BLOCK
///
/// deadline 是绝对单调时刻
pub fn wait(
    aspace: &AddressSpace,
    addr: usize,
    expected: u32,
    deadline: Option<u64>,
    flags: SleepFlags,
) -> Status {
    let key = match key_for(aspace, addr, false) {
        Ok(key) => key,
        Err(status) => return status,
    };

    // 取值检查和建队在同一次表锁内；wake 必须进同一把锁
    let queue = {
        let mut table = TABLE.lock();
        if load_value(key) != expected {
            return Status::WouldBlock;
        }
        table
            .entry(key)
            .or_insert_with(|| WaitQueue::new("futex"))
            .clone()
    };

    let result = queue.sleep_if(
        || still_parked(key, expected, &queue),
        deadline,
        flags | SleepFlags::INTERRUPTIBLE,
    );
    gc(key, &queue);
    result
}

/// 唤醒至多 n 个等待者，返回实际唤醒数
pub fn wake(aspace: &AddressSpace, addr: usize, n: usize) -> KResult<usize> {
    let key = key_for(aspace, addr, false)?;
    let queue = TABLE.lock().get(&key).cloned();
    match queue {
        Some(queue) => {
            let woken = queue.wake_n(n);
            gc(key, &queue);
            Ok(woken)
        }
        None => Ok(0),
    }
}

/// `*addr == expected` 时唤醒 n 个，其余整体迁移到 target_addr 的队列
pub fn requeue(
    aspace: &AddressSpace,
    addr: usize,
    expected: u32,
    n: usize,
    target_addr: usize,
) -> KResult<usize> {
    let key = key_for(aspace, addr, false)?;
    let target_key = key_for(aspace, target_addr, false)?;
    if key == target_key {
        return Err(Status::InvalidArg);
    }

    let (queue, target) = {
        let mut table = TABLE.lock();
        if load_value(key) != expected {
            return Err(Status::WouldBlock);
        }
        let Some(queue) = table.get(&key).cloned() else {
            return Ok(0);
        };
        let target = table
            .entry(target_key)
            .or_insert_with(|| WaitQueue::new("futex"))
            .clone();
        (queue, target)
    };

    let woken = queue.wake_n(n);
    queue.requeue_to(&target, usize::MAX);
    gc(key, &queue);
    gc(target_key, &target);
    Ok(woken)
}

/// 清空的队列从表里摘除
fn gc(key: FutexKey, queue: &Arc<WaitQueue>) {
    let mut table = TABLE.lock();
    if queue.is_empty() {
        if let Some(current) = table.get(&key) {
            if Arc::ptr_eq(current, queue) {
                table.remove(&key);
            }
        }
    }
}

#[cfg(test)]
pub fn table_len() -> usize {
    TABLE.lock().len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::vm::{VmFlags, VmRights};
    use crate::proc::thread::Thread;
    use crate::security::token::Token;
    use crate::test_util;
    use alloc::string::String;
    use alloc::sync::Weak;

    fn mapped_word(aspace: &Arc<AddressSpace>) -> usize {
        let addr = aspace
            .map_anon(
                0,
                crate::config::PAGE_SIZE,
                VmRights::READ | VmRights::WRITE,
                VmFlags::empty(),
            )
            .unwrap()
            .0;
        // 触发缺页建立映射
        safe::copy_to_user(aspace, addr, &7u32.to_ne_bytes()).unwrap();
        addr
    }

    #[test]
    fn test_wait_value_mismatch() {
        test_util::bootstrap();
        let _guard = test_util::serialize();

        let aspace = AddressSpace::new().unwrap();
        let addr = mapped_word(&aspace);

        assert_eq!(
            wait(&aspace, addr, 99, None, SleepFlags::NONBLOCK),
            Status::WouldBlock
        );
        // 值不匹配不建队列
        assert_eq!(table_len(), 0);
    }

    #[test]
    fn test_wait_unmapped_denied() {
        test_util::bootstrap();
        let _guard = test_util::serialize();

        let aspace = AddressSpace::new().unwrap();
        assert_eq!(
            wait(&aspace, 0x20_0000, 0, None, SleepFlags::NONBLOCK),
            Status::AccessDenied
        );
    }

    #[test]
    fn test_misaligned_rejected() {
        test_util::bootstrap();
        let _guard = test_util::serialize();

        let aspace = AddressSpace::new().unwrap();
        let addr = mapped_word(&aspace);
        assert_eq!(
            wait(&aspace, addr + 2, 7, None, SleepFlags::NONBLOCK),
            Status::InvalidArg
        );
    }

    #[test]
    fn test_wake_without_waiters() {
        test_util::bootstrap();
        let _guard = test_util::serialize();

        let aspace = AddressSpace::new().unwrap();
        let addr = mapped_word(&aspace);
        assert_eq!(wake(&aspace, addr, 8).unwrap(), 0);
        assert_eq!(table_len(), 0);
    }

    #[test]
    fn test_key_is_physical() {
        test_util::bootstrap();
        let _guard = test_util::serialize();

        let aspace = AddressSpace::new().unwrap();
        let addr = mapped_word(&aspace);

        // 同一物理页从两个虚拟地址推出同一键
        let a = key_for(&aspace, addr, false).unwrap();
        let b = key_for(&aspace, addr + 4, false).unwrap();
        assert_eq!(a.0 & !(crate::config::PAGE_MASK as u64), b.0 & !(crate::config::PAGE_MASK as u64));
        assert_eq!(b.0 - a.0, 4);
    }

    #[test]
    fn test_parked_waiter_visible_to_wake() {
        test_util::bootstrap();
        let _guard = test_util::serialize();
        crate::proc::sched::test_reset();

        let runner = Thread::new(
            Weak::new(),
            String::from("runner"),
            0x1000,
            16,
            Token::kernel(),
        )
        .unwrap();
        crate::proc::sched::adopt(runner);

        let aspace = AddressSpace::new().unwrap();
        let addr = mapped_word(&aspace);

        // 宿主上的上下文切换是空操作：wait 登记完等待者就返回，
        // 等待者留在队列上
        assert_eq!(wait(&aspace, addr, 7, None, SleepFlags::empty()), Status::Success);
        assert_eq!(table_len(), 1);

        // 改值后的唤醒必须能经表找到已登记的等待者
        safe::copy_to_user(&aspace, addr, &8u32.to_ne_bytes()).unwrap();
        assert_eq!(wake(&aspace, addr, 1).unwrap(), 1);
        assert_eq!(table_len(), 0);

        crate::proc::sched::test_reset();
    }

    #[test]
    fn test_recheck_detects_change_and_recycled_queue() {
        test_util::bootstrap();
        let _guard = test_util::serialize();

        let aspace = AddressSpace::new().unwrap();
        let addr = mapped_word(&aspace);
        let key = key_for(&aspace, addr, false).unwrap();
        let queue = TABLE
            .lock()
            .entry(key)
            .or_insert_with(|| WaitQueue::new("futex"))
            .clone();

        assert!(still_parked(key, 7, &queue));
        // 值被并发改写：放弃睡眠
        assert!(!still_parked(key, 8, &queue));

        // 队列被并发 wake + 回收摘下表：旧引用作废
        TABLE.lock().remove(&key);
        assert!(!still_parked(key, 7, &queue));

        // 换上新队列后旧引用仍然作废，新队列有效
        let fresh = WaitQueue::new("futex");
        TABLE.lock().insert(key, fresh.clone());
        assert!(!still_parked(key, 7, &queue));
        assert!(still_parked(key, 7, &fresh));

        TABLE.lock().remove(&key);
    }

    #[test]
    fn test_requeue_same_key_rejected() {
        test_util::bootstrap();
        let _guard = test_util::serialize();

        let aspace = AddressSpace::new().unwrap();
        let addr = mapped_word(&aspace);
        assert_eq!(
            requeue(&aspace, addr, 7, 1, addr).unwrap_err(),
            Status::InvalidArg
        );
    }
}
