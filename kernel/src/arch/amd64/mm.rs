//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! x86-64 页表实现（PML4，4 级，4 KiB 页）
//!
//! 页表内容通过物理直映射窗口访问；中间表按需从页分配器取得，
//! 全部标记 PRESENT|WRITE|USER，访问控制只在叶条目上实施。

use crate::arch;
use crate::mm::mmu::{ArchMmuOps, MmuFlags};
use crate::mm::page::{self, AllocFlags, PhysAddr, ZoneMask};
use crate::status::{KResult, Status};

const PTE_PRESENT: u64 = 1 << 0;
const PTE_WRITE: u64 = 1 << 1;
const PTE_USER: u64 = 1 << 2;
const PTE_NX: u64 = 1 << 63;
const PTE_ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

/// 每级页表覆盖的位移：L0（叶）=12，L3（PML4）=39
#[inline]
fn index(level: usize, virt: usize) -> usize {
    (virt >> (12 + 9 * level)) & 0x1ff
}

#[inline]
fn table(phys: u64) -> *mut u64 {
    arch::phys_map(phys) as *mut u64
}

fn encode(phys: u64, flags: MmuFlags) -> u64 {
    let mut pte = (phys & PTE_ADDR_MASK) | PTE_PRESENT;
    if flags.contains(MmuFlags::WRITE) {
        pte |= PTE_WRITE;
    }
    if flags.contains(MmuFlags::USER) {
        pte |= PTE_USER;
    }
    if !flags.contains(MmuFlags::EXEC) {
        pte |= PTE_NX;
    }
    pte
}

fn decode(pte: u64) -> MmuFlags {
    let mut flags = MmuFlags::READ;
    if pte & PTE_WRITE != 0 {
        flags |= MmuFlags::WRITE;
    }
    if pte & PTE_USER != 0 {
        flags |= MmuFlags::USER;
    }
    if pte & PTE_NX == 0 {
        flags |= MmuFlags::EXEC;
    }
    flags
}

/// 下行到叶表；alloc 为 true 时按需创建中间表
fn walk(root: u64, virt: usize, alloc: bool) -> KResult<*mut u64> {
    let mut table_phys = root;

    for level in (1..=3).rev() {
        let entry_ptr = unsafe { table(table_phys).add(index(level, virt)) };
        let entry = unsafe { entry_ptr.read_volatile() };

        if entry & PTE_PRESENT == 0 {
            if !alloc {
                return Err(Status::NotFound);
            }
            // 中间表分配失败时叶条目尚未写入，map 不会部分提交
            let new = page::phys_alloc(1, ZoneMask::any(), AllocFlags::ZERO)?;
            unsafe {
                entry_ptr.write_volatile(new.0 | PTE_PRESENT | PTE_WRITE | PTE_USER);
            }
            table_phys = new.0;
        } else {
            table_phys = entry & PTE_ADDR_MASK;
        }
    }

    Ok(unsafe { table(table_phys).add(index(0, virt)) })
}

fn free_table(phys: u64, level: usize) {
    if level > 1 {
        for i in 0..512 {
            let entry = unsafe { table(phys).add(i).read_volatile() };
            if entry & PTE_PRESENT != 0 {
                free_table(entry & PTE_ADDR_MASK, level - 1);
            }
        }
    }
    page::phys_free(PhysAddr(phys), 1);
}

pub struct Amd64Mmu;

/// 注册用的单例
pub static MMU: Amd64Mmu = Amd64Mmu;

impl ArchMmuOps for Amd64Mmu {
    fn create_root(&self) -> KResult<u64> {
        let root = page::phys_alloc(1, ZoneMask::any(), AllocFlags::ZERO)?;
        Ok(root.0)
    }

    fn destroy_root(&self, root: u64) {
        free_table(root, 4);
    }

    fn map(&self, root: u64, virt: usize, phys: u64, flags: MmuFlags) -> KResult<()> {
        let leaf = walk(root, virt, true)?;
        let existing = unsafe { leaf.read_volatile() };
        if existing & PTE_PRESENT != 0 {
            return Err(Status::AlreadyExists);
        }
        unsafe {
            leaf.write_volatile(encode(phys, flags));
        }
        Ok(())
    }

    fn unmap(&self, root: u64, virt: usize) -> Option<u64> {
        let leaf = walk(root, virt, false).ok()?;
        let entry = unsafe { leaf.read_volatile() };
        if entry & PTE_PRESENT == 0 {
            return None;
        }
        unsafe {
            leaf.write_volatile(0);
        }
        Some(entry & PTE_ADDR_MASK)
    }

    fn protect(&self, root: u64, virt: usize, flags: MmuFlags) -> Option<MmuFlags> {
        let leaf = walk(root, virt, false).ok()?;
        let entry = unsafe { leaf.read_volatile() };
        if entry & PTE_PRESENT == 0 {
            return None;
        }
        let old = decode(entry);
        unsafe {
            leaf.write_volatile(encode(entry & PTE_ADDR_MASK, flags));
        }
        Some(old)
    }

    fn query(&self, root: u64, virt: usize) -> Option<(u64, MmuFlags)> {
        let leaf = walk(root, virt, false).ok()?;
        let entry = unsafe { leaf.read_volatile() };
        if entry & PTE_PRESENT == 0 {
            return None;
        }
        Some((entry & PTE_ADDR_MASK, decode(entry)))
    }

    fn load(&self, root: u64, _asid: u16) {
        // amd64 无 ASID；直接装载 CR3
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) root, options(nostack));
        }
        #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
        let _ = root;
    }

    fn invalidate_page(&self, _asid: u16, virt: usize) {
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        unsafe {
            core::arch::asm!("invlpg [{}]", in(reg) virt, options(nostack));
        }
        #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
        let _ = virt;
    }

    fn flush(&self, _asid: u16) {
        // 重装 CR3 冲刷非全局条目
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        unsafe {
            let cr3: u64;
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nostack));
            core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pte_encode_decode() {
        let pte = encode(0x1234_5000, MmuFlags::READ | MmuFlags::WRITE | MmuFlags::USER);
        assert_eq!(pte & PTE_ADDR_MASK, 0x1234_5000);
        assert!(pte & PTE_PRESENT != 0);
        assert!(pte & PTE_NX != 0); // 无 EXEC 时置 NX

        let flags = decode(pte);
        assert!(flags.contains(MmuFlags::WRITE));
        assert!(flags.contains(MmuFlags::USER));
        assert!(!flags.contains(MmuFlags::EXEC));
    }

    #[test]
    fn test_index_split() {
        // 0x7fff_ffff_f000 的各级索引
        let virt = 0x7fff_ffff_f000usize;
        assert_eq!(index(3, virt), 255);
        assert_eq!(index(2, virt), 511);
        assert_eq!(index(1, virt), 511);
        assert_eq!(index(0, virt), 511);
    }
}
