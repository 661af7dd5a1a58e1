//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 用户内存安全访问
//!
//! 内核触碰用户指针的唯一通道。地址先检查落在用户窗口内，
//! 再按页翻译：叶映射缺失或权限不足时走一次缺页解析，仍然
//! 失败的访问返回 ACCESS_DENIED 而不是崩溃。
//!
//! 所有拷贝通过物理直映射窗口进行，按页分段处理跨页范围。

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use crate::arch;
use crate::config::{PAGE_MASK, PAGE_SIZE, USER_BASE, USER_END};
use crate::mm::mmu::MmuFlags;
use crate::mm::page::PhysAddr;
use crate::mm::vm::AddressSpace;
use crate::status::{KResult, Status};

fn check_range(addr: usize, len: usize) -> KResult<()> {
    let end = addr.checked_add(len).ok_or(Status::InvalidArg)?;
    if addr < USER_BASE || end > USER_END {
        return Err(Status::InvalidArg);
    }
    Ok(())
}

/// 把用户虚拟地址翻译为物理地址
///
/// 叶映射缺失（或写访问遇到只读映射，COW 待断开）时先解析
/// 一次缺页再重查；用于拷贝路径和 futex 键派生
pub fn user_phys(aspace: &AddressSpace, addr: usize, write: bool) -> KResult<PhysAddr> {
    check_range(addr, 1)?;
    let page_addr = addr & !PAGE_MASK;

    for attempt in 0..2 {
        {
            let mut batch = aspace.mmu().lock();
            if let Some((phys, flags)) = batch.query(page_addr) {
                if !write || flags.contains(MmuFlags::WRITE) {
                    return Ok(PhysAddr(phys.0 + (addr & PAGE_MASK) as u64));
                }
            }
        }
        if attempt == 0 && aspace.fault(page_addr, write, true) != Status::Success {
            break;
        }
    }
    Err(Status::AccessDenied)
}

/// 从用户空间拷入
pub fn copy_from_user(aspace: &AddressSpace, dst: &mut [u8], uaddr: usize) -> KResult<()> {
    check_range(uaddr, dst.len())?;

    let mut copied = 0;
    while copied < dst.len() {
        let addr = uaddr + copied;
        let chunk = (PAGE_SIZE - (addr & PAGE_MASK)).min(dst.len() - copied);
        let phys = user_phys(aspace, addr, false)?;
        unsafe {
            core::ptr::copy_nonoverlapping(
                arch::phys_map(phys.0),
                dst[copied..].as_mut_ptr(),
                chunk,
            );
        }
        copied += chunk;
    }
    Ok(())
}

/// 向用户空间拷出
pub fn copy_to_user(aspace: &AddressSpace, uaddr: usize, src: &[u8]) -> KResult<()> {
    check_range(uaddr, src.len())?;

    let mut copied = 0;
    while copied < src.len() {
        let addr = uaddr + copied;
        let chunk = (PAGE_SIZE - (addr & PAGE_MASK)).min(src.len() - copied);
        let phys = user_phys(aspace, addr, true)?;
        unsafe {
            core::ptr::copy_nonoverlapping(
                src[copied..].as_ptr(),
                arch::phys_map(phys.0),
                chunk,
            );
        }
        copied += chunk;
    }
    Ok(())
}

/// 读取一个用户空间的标量值
pub fn read_user<T: Copy>(aspace: &AddressSpace, uaddr: usize) -> KResult<T> {
    let mut buf = vec![0u8; core::mem::size_of::<T>()];
    copy_from_user(aspace, &mut buf, uaddr)?;
    // 按字节拷入栈上值，避免对齐假设
    let mut value = core::mem::MaybeUninit::<T>::uninit();
    unsafe {
        core::ptr::copy_nonoverlapping(
            buf.as_ptr(),
            value.as_mut_ptr() as *mut u8,
            buf.len(),
        );
        Ok(value.assume_init())
    }
}

/// 写入一个用户空间的标量值
pub fn write_user<T: Copy>(aspace: &AddressSpace, uaddr: usize, value: T) -> KResult<()> {
    let bytes = unsafe {
        core::slice::from_raw_parts(&value as *const T as *const u8, core::mem::size_of::<T>())
    };
    copy_to_user(aspace, uaddr, bytes)
}

/// 复制用户空间的 NUL 结尾字符串，最长 max 字节（不含 NUL）
///
/// 超长返回 TOO_LARGE，非 UTF-8 返回 INVALID_ARG
pub fn strndup_from_user(aspace: &AddressSpace, uaddr: usize, max: usize) -> KResult<String> {
    let mut bytes: Vec<u8> = Vec::new();

    let mut addr = uaddr;
    loop {
        let chunk_len = (PAGE_SIZE - (addr & PAGE_MASK)).min(max + 1 - bytes.len());
        let mut chunk = vec![0u8; chunk_len];
        copy_from_user(aspace, &mut chunk, addr)?;

        if let Some(nul) = chunk.iter().position(|&b| b == 0) {
            bytes.extend_from_slice(&chunk[..nul]);
            return String::from_utf8(bytes).map_err(|_| Status::InvalidArg);
        }

        bytes.extend_from_slice(&chunk);
        if bytes.len() > max {
            return Err(Status::TooLarge);
        }
        addr += chunk_len;
    }
}
