//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 内核堆
//!
//! 全局分配器用 linked_list_allocator 的 LockedHeap，堆空间来自
//! 静态数组（页数据库本身依赖堆，窗口分配器无法先于堆工作）。
//!
//! kmalloc/kzalloc/krealloc/kfree 是面向大小未知调用方的 C 风格
//! 接口：分配头部记录长度，kfree 不需要调用方传大小。

use core::alloc::Layout;
use core::ptr;

#[cfg(not(test))]
use linked_list_allocator::LockedHeap;

#[cfg(not(test))]
use crate::config::KERNEL_HEAP_SIZE;

#[cfg(not(test))]
#[global_allocator]
static ALLOCATOR: LockedHeap = LockedHeap::empty();

#[cfg(not(test))]
static mut HEAP_SPACE: [u8; KERNEL_HEAP_SIZE] = [0; KERNEL_HEAP_SIZE];

/// 初始化内核堆（所有使用 alloc 的子系统之前调用）
pub fn init() {
    #[cfg(not(test))]
    unsafe {
        ALLOCATOR
            .lock()
            .init(ptr::addr_of_mut!(HEAP_SPACE) as *mut u8, KERNEL_HEAP_SIZE);
    }
}

/// 分配头大小；保证 16 字节对齐的用户数据
const HEADER_SIZE: usize = 16;
const KMALLOC_ALIGN: usize = 16;

fn layout_for(size: usize) -> Option<Layout> {
    Layout::from_size_align(size.checked_add(HEADER_SIZE)?, KMALLOC_ALIGN).ok()
}

/// 分配 size 字节；失败返回空指针
pub fn kmalloc(size: usize) -> *mut u8 {
    if size == 0 {
        return ptr::null_mut();
    }
    let layout = match layout_for(size) {
        Some(l) => l,
        None => return ptr::null_mut(),
    };
    let base = unsafe { alloc::alloc::alloc(layout) };
    if base.is_null() {
        return base;
    }
    unsafe {
        (base as *mut usize).write(size);
        base.add(HEADER_SIZE)
    }
}

/// 分配并清零
pub fn kzalloc(size: usize) -> *mut u8 {
    if size == 0 {
        return ptr::null_mut();
    }
    let layout = match layout_for(size) {
        Some(l) => l,
        None => return ptr::null_mut(),
    };
    let base = unsafe { alloc::alloc::alloc_zeroed(layout) };
    if base.is_null() {
        return base;
    }
    unsafe {
        (base as *mut usize).write(size);
        base.add(HEADER_SIZE)
    }
}

/// 释放 kmalloc/kzalloc/krealloc 的结果
///
/// # Safety
///
/// ptr 必须来自本模块的分配接口且未被释放过
pub unsafe fn kfree(ptr: *mut u8) {
    if ptr.is_null() {
        return;
    }
    let base = ptr.sub(HEADER_SIZE);
    let size = (base as *const usize).read();
    let layout = layout_for(size).expect("kmalloc: corrupt allocation header");
    alloc::alloc::dealloc(base, layout);
}

/// 调整分配大小，保留原内容的前 min(old, new) 字节
///
/// # Safety
///
/// ptr 为空或来自本模块的分配接口
pub unsafe fn krealloc(old: *mut u8, new_size: usize) -> *mut u8 {
    if old.is_null() {
        return kmalloc(new_size);
    }
    if new_size == 0 {
        kfree(old);
        return ptr::null_mut();
    }

    let old_size = (old.sub(HEADER_SIZE) as *const usize).read();
    let new = kmalloc(new_size);
    if !new.is_null() {
        ptr::copy_nonoverlapping(old, new, old_size.min(new_size));
        kfree(old);
    }
    new
}
