//! Platform-Level Interrupt Controller (§4.3, §6): priority/enable/threshold
//! and claim/complete for the one HART this kernel supports.

use crate::config::{
    PLIC_BASE, PLIC_CLAIM_OFFSET, PLIC_ENABLE_OFFSET, PLIC_PRIORITY_OFFSET, PLIC_THRESHOLD_OFFSET,
};
use core::ptr::{read_volatile, write_volatile};

const MAX_IRQ: u32 = 8;

/// Sets priority 1 on IRQs 1..=8, enables them for this HART's S-mode
/// context, and sets the threshold to 0 so any nonzero-priority IRQ fires.
pub fn init() {
    for irq in 1..=MAX_IRQ {
        let priority_reg = (PLIC_BASE + PLIC_PRIORITY_OFFSET + 4 * irq as usize) as *mut u32;
        unsafe { write_volatile(priority_reg, 1) };
    }

    let enable_reg = (PLIC_BASE + PLIC_ENABLE_OFFSET) as *mut u32;
    let mask: u32 = ((1u64 << (MAX_IRQ + 1)) - 2) as u32; // bits 1..=8
    unsafe { write_volatile(enable_reg, mask) };

    let threshold_reg = (PLIC_BASE + PLIC_THRESHOLD_OFFSET) as *mut u32;
    unsafe { write_volatile(threshold_reg, 0) };
}

pub fn claim() -> u32 {
    let claim_reg = (PLIC_BASE + PLIC_CLAIM_OFFSET) as *mut u32;
    unsafe { read_volatile(claim_reg) }
}

pub fn complete(irq: u32) {
    let claim_reg = (PLIC_BASE + PLIC_CLAIM_OFFSET) as *mut u32;
    unsafe { write_volatile(claim_reg, irq) };
}
