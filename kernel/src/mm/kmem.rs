//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 内核虚拟内存窗口
//!
//! 管理 [KERNEL_KMEM_BASE, KERNEL_KMEM_BASE + KERNEL_KMEM_SIZE) 这段
//! 内核虚拟地址：`kmem_raw_alloc` 只预留范围，`kmem_alloc` 另外分配
//! 后备页帧并通过内核 MMU 上下文安装映射。
//!
//! 空闲范围保存在有序映射（起址 -> 长度）中，首次适配分配，
//! 释放时与相邻空闲段合并。

use alloc::collections::BTreeMap;
use spin::{Mutex, Once};

use crate::config::{KERNEL_KMEM_BASE, KERNEL_KMEM_SIZE, PAGE_MASK, PAGE_SIZE};
use crate::mm::mmu::{self, MmuBatch, MmuFlags};
use crate::mm::page::{self, AllocFlags, VirtAddr, ZoneMask};
use crate::status::{KResult, Status};

struct Arena {
    /// 空闲范围：起址 -> 字节数
    free: BTreeMap<usize, usize>,
}

impl Arena {
    fn new(base: usize, size: usize) -> Self {
        let mut free = BTreeMap::new();
        free.insert(base, size);
        Self { free }
    }

    fn alloc(&mut self, size: usize) -> Option<usize> {
        let (start, len) = self
            .free
            .iter()
            .find(|(_, &len)| len >= size)
            .map(|(&s, &len)| (s, len))?;
        self.free.remove(&start);
        if len > size {
            self.free.insert(start + size, len - size);
        }
        Some(start)
    }

    fn free(&mut self, mut start: usize, mut len: usize) {
        if let Some((&prev, &plen)) = self.free.range(..start).next_back() {
            debug_assert!(prev + plen <= start, "kmem: overlapping free at {:#x}", start);
            if prev + plen == start {
                self.free.remove(&prev);
                start = prev;
                len += plen;
            }
        }
        if let Some((&next, &nlen)) = self.free.range(start + len..).next() {
            if start + len == next {
                self.free.remove(&next);
                len += nlen;
            }
        }
        self.free.insert(start, len);
    }
}

static ARENA: Once<Mutex<Arena>> = Once::new();

/// 初始化内核虚拟窗口（mm::init 调用）
pub fn init() {
    ARENA.call_once(|| Mutex::new(Arena::new(KERNEL_KMEM_BASE, KERNEL_KMEM_SIZE)));
}

fn arena() -> &'static Mutex<Arena> {
    ARENA.get().expect("kmem: not initialized")
}

#[inline]
fn page_ceil(size: usize) -> usize {
    (size + PAGE_MASK) & !PAGE_MASK
}

/// 预留一段内核虚拟范围，不分配后备页
pub fn kmem_raw_alloc(size: usize) -> KResult<VirtAddr> {
    if size == 0 {
        return Err(Status::InvalidArg);
    }
    let size = page_ceil(size);
    arena()
        .lock()
        .alloc(size)
        .map(VirtAddr)
        .ok_or(Status::NoMemory)
}

/// 归还虚拟范围
pub fn kmem_raw_free(virt: VirtAddr, size: usize) {
    debug_assert!(virt.is_aligned());
    arena().lock().free(virt.0, page_ceil(size));
}

fn unmap_and_release(batch: &mut MmuBatch<'_>, virt: VirtAddr, pages: usize) {
    for i in 0..pages {
        if let Some(phys) = batch.unmap(virt.0 + i * PAGE_SIZE) {
            page::phys_free(phys, 1);
        }
    }
}

/// 分配并映射一段内核内存
///
/// 预留虚拟范围、为每页取得清零页帧并通过内核 MMU 上下文安装；
/// 页帧分配失败时整体回滚，不留部分映射
pub fn kmem_alloc(size: usize, mmu_flags: MmuFlags) -> KResult<VirtAddr> {
    let size = page_ceil(size);
    let virt = kmem_raw_alloc(size)?;
    let pages = size / PAGE_SIZE;

    let mut batch = mmu::kernel_context().lock();
    for i in 0..pages {
        let result = page::phys_alloc(1, ZoneMask::any(), AllocFlags::ZERO)
            .and_then(|phys| batch.map(virt.0 + i * PAGE_SIZE, phys, mmu_flags));
        if let Err(err) = result {
            unmap_and_release(&mut batch, virt, i);
            drop(batch);
            kmem_raw_free(virt, size);
            return Err(err);
        }
    }

    Ok(virt)
}

/// 释放 kmem_alloc 的结果：解除映射、归还页帧与虚拟范围
pub fn kmem_free(virt: VirtAddr, size: usize) {
    let size = page_ceil(size);
    {
        let mut batch = mmu::kernel_context().lock();
        unmap_and_release(&mut batch, virt, size / PAGE_SIZE);
    }
    kmem_raw_free(virt, size);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util;

    #[test]
    fn test_arena_coalesce() {
        let mut arena = Arena::new(0x1000, 0x4000);
        let a = arena.alloc(0x1000).unwrap();
        let b = arena.alloc(0x2000).unwrap();
        assert_eq!(a, 0x1000);
        assert_eq!(b, 0x2000);

        arena.free(a, 0x1000);
        arena.free(b, 0x2000);
        // 相邻段合并回完整窗口
        assert_eq!(arena.free.len(), 1);
        assert_eq!(arena.alloc(0x4000), Some(0x1000));
    }

    #[test]
    fn test_arena_exhaustion() {
        let mut arena = Arena::new(0x1000, 0x2000);
        assert!(arena.alloc(0x3000).is_none());
        assert!(arena.alloc(0x2000).is_some());
        assert!(arena.alloc(0x1000).is_none());
    }

    #[test]
    fn test_raw_alloc_distinct() {
        test_util::bootstrap();

        let a = kmem_raw_alloc(PAGE_SIZE * 2).unwrap();
        let b = kmem_raw_alloc(PAGE_SIZE).unwrap();
        assert!(a.0 + PAGE_SIZE * 2 <= b.0 || b.0 + PAGE_SIZE <= a.0);
        kmem_raw_free(a, PAGE_SIZE * 2);
        kmem_raw_free(b, PAGE_SIZE);
    }

    #[test]
    fn test_kmem_alloc_maps_pages() {
        test_util::bootstrap();

        let virt = kmem_alloc(PAGE_SIZE * 3, MmuFlags::READ | MmuFlags::WRITE).unwrap();
        {
            let mut batch = mmu::kernel_context().lock();
            for i in 0..3 {
                let (_, flags) = batch.query(virt.0 + i * PAGE_SIZE).unwrap();
                assert!(flags.contains(MmuFlags::WRITE));
            }
        }

        kmem_free(virt, PAGE_SIZE * 3);
        {
            let mut batch = mmu::kernel_context().lock();
            for i in 0..3 {
                assert!(batch.query(virt.0 + i * PAGE_SIZE).is_none());
            }
        }
    }

    #[test]
    fn test_kmem_alloc_releases_frames_on_free() {
        test_util::bootstrap();

        let before = page::page_stats();
        let virt = kmem_alloc(PAGE_SIZE * 2, MmuFlags::READ).unwrap();
        assert_eq!(page::page_stats().allocated, before.allocated + 2);
        kmem_free(virt, PAGE_SIZE * 2);
        assert_eq!(page::page_stats().allocated, before.allocated);
    }
}
