// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! vCPU state dumps: registers, the code around RIP and a bounded walk of
//! the page tables. Used by the single-step trap, the PANIC path and the
//! DEBUG control message.

use std::io::{self, Write};

use kvm_bindings::kvm_segment;
use kvm_ioctls::VcpuFd;
use vm_memory::{Bytes, GuestAddress, GuestMemoryMmap};

const CODE_BYTES: u64 = 26;
const PTE_PRESENT: u64 = 0x1;
const PTE_LARGE: u64 = 0x80;
const CR0_PG: u64 = 1 << 31;
/// Entries shown per page-table level before the dump moves on.
const PT_DUMP_LIMIT: usize = 16;

fn segment_line(name: &str, seg: &kvm_segment) -> String {
    format!(
        " {}: selector {:04x} base {:016x} limit {:08x} type {:x}\n",
        name, seg.selector, seg.base, seg.limit, seg.type_
    )
}

/// Dump the complete architectural state of `vcpu_fd` to `out`.
pub fn dump_state(
    vcpu_fd: &VcpuFd,
    guest_memory: &GuestMemoryMmap,
    index: u8,
    out: &mut dyn Write,
) -> io::Result<()> {
    writeln!(out, "\n #\n # vCPU #{}'s dump:\n #", index)?;

    let regs = match vcpu_fd.get_regs() {
        Ok(regs) => regs,
        Err(e) => {
            writeln!(out, " <failed to read registers: {}>", e)?;
            return Ok(());
        }
    };
    let sregs = match vcpu_fd.get_sregs() {
        Ok(sregs) => sregs,
        Err(e) => {
            writeln!(out, " <failed to read segment registers: {}>", e)?;
            return Ok(());
        }
    };

    writeln!(out, "\n Registers:")?;
    writeln!(out, " rip: {:016x} rsp: {:016x} flags: {:016x}", regs.rip, regs.rsp, regs.rflags)?;
    writeln!(out, " rax: {:016x} rbx: {:016x} rcx: {:016x}", regs.rax, regs.rbx, regs.rcx)?;
    writeln!(out, " rdx: {:016x} rsi: {:016x} rdi: {:016x}", regs.rdx, regs.rsi, regs.rdi)?;
    writeln!(out, " rbp: {:016x} r8:  {:016x} r9:  {:016x}", regs.rbp, regs.r8, regs.r9)?;
    writeln!(out, " r10: {:016x} r11: {:016x} r12: {:016x}", regs.r10, regs.r11, regs.r12)?;
    writeln!(out, " r13: {:016x} r14: {:016x} r15: {:016x}", regs.r13, regs.r14, regs.r15)?;
    writeln!(
        out,
        " cr0: {:016x} cr2: {:016x} cr3: {:016x}\n cr4: {:016x} cr8: {:016x}",
        sregs.cr0, sregs.cr2, sregs.cr3, sregs.cr4, sregs.cr8
    )?;

    writeln!(out, "\n Segment registers:")?;
    out.write_all(segment_line("cs", &sregs.cs).as_bytes())?;
    out.write_all(segment_line("ss", &sregs.ss).as_bytes())?;
    out.write_all(segment_line("ds", &sregs.ds).as_bytes())?;
    out.write_all(segment_line("es", &sregs.es).as_bytes())?;
    out.write_all(segment_line("fs", &sregs.fs).as_bytes())?;
    out.write_all(segment_line("gs", &sregs.gs).as_bytes())?;

    // Code bytes at CS:RIP; the first byte is the next instruction.
    writeln!(out, "\n Code:")?;
    let rip = sregs.cs.base.wrapping_add(regs.rip);
    let mut code = [0u8; CODE_BYTES as usize];
    match guest_memory.read_slice(&mut code, GuestAddress(rip)) {
        Ok(()) => {
            write!(out, " {:016x}: <rip>", rip)?;
            for byte in code.iter() {
                write!(out, " {:02x}", byte)?;
            }
            writeln!(out)?;
        }
        Err(_) => writeln!(out, " <code at {:016x} is outside RAM>", rip)?,
    }

    writeln!(out, "\n Page tables:")?;
    if sregs.cr0 & CR0_PG == 0 {
        writeln!(out, " <paging disabled>")?;
        return Ok(());
    }
    dump_page_tables(guest_memory, sregs.cr3, out)
}

fn dump_page_tables(
    guest_memory: &GuestMemoryMmap,
    cr3: u64,
    out: &mut dyn Write,
) -> io::Result<()> {
    let pml4_base = cr3 & !0xfff;
    let mut shown = 0usize;

    for pml4_idx in 0..512u64 {
        let pml4e: u64 = match guest_memory.read_obj(GuestAddress(pml4_base + pml4_idx * 8)) {
            Ok(entry) => entry,
            Err(_) => break,
        };
        if pml4e & PTE_PRESENT == 0 {
            continue;
        }
        writeln!(out, " pml4[{:03}]: {:016x}", pml4_idx, pml4e)?;

        let pdpt_base = pml4e & 0x000f_ffff_ffff_f000;
        for pdpt_idx in 0..512u64 {
            let pdpte: u64 = match guest_memory.read_obj(GuestAddress(pdpt_base + pdpt_idx * 8)) {
                Ok(entry) => entry,
                Err(_) => break,
            };
            if pdpte & PTE_PRESENT == 0 {
                continue;
            }
            writeln!(out, "  pdpt[{:03}]: {:016x}{}", pdpt_idx, pdpte,
                if pdpte & PTE_LARGE != 0 { " (1G)" } else { "" })?;
            shown += 1;
            if shown >= PT_DUMP_LIMIT {
                writeln!(out, "  ...")?;
                return Ok(());
            }
        }
    }

    Ok(())
}
