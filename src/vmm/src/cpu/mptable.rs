// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! MP table generation, the only firmware table this platform carries.
//! SMP guests find their processors here; everything else on the table is
//! the minimal ISA bus / IOAPIC wiring Linux expects to parse.

use std::mem;
use std::result;

use vm_memory::{Address, ByteValued, Bytes, GuestAddress, GuestMemory, GuestMemoryMmap};

use super::mpspec::*;

/// The table lands in the EBDA, right under 640K.
const MPTABLE_START: u64 = 0x9fc00;
/// Most CPUs a single byte of APIC id can name on this table.
pub const MAX_SUPPORTED_CPUS: u32 = 254;

#[derive(Debug)]
pub enum Error {
    /// The MP table does not fit into guest memory.
    NotEnoughMemory,
    /// Failure to write to guest memory.
    WriteMpTable(vm_memory::GuestMemoryError),
    /// Too many CPUs for one table.
    TooManyCpus,
}

pub type Result<T> = result::Result<T, Error>;

fn compute_checksum<T: ByteValued>(v: &T) -> u8 {
    v.as_slice()
        .iter()
        .fold(0u8, |acc, byte| acc.wrapping_add(*byte))
}

fn mpf_intel_compute_checksum(v: &MpfIntel) -> u8 {
    let mut m = *v;
    m.checksum = 0;
    (!compute_checksum(&m)).wrapping_add(1)
}

fn mpc_table_compute_checksum(v: &MpcTable) -> u8 {
    let mut m = *v;
    m.checksum = 0;
    (!compute_checksum(&m)).wrapping_add(1)
}

/// Write the MP floating pointer and configuration table for `num_cpus`.
pub fn setup_mptable(guest_memory: &GuestMemoryMmap, num_cpus: u8) -> Result<()> {
    if u32::from(num_cpus) > MAX_SUPPORTED_CPUS {
        return Err(Error::TooManyCpus);
    }

    let mut base = GuestAddress(MPTABLE_START);
    let mpf_addr = base;
    base = base
        .checked_add(mem::size_of::<MpfIntel>() as u64)
        .ok_or(Error::NotEnoughMemory)?;
    let table_addr = base;

    // Entries follow the fixed table header.
    let mut entry_addr = table_addr
        .checked_add(mem::size_of::<MpcTable>() as u64)
        .ok_or(Error::NotEnoughMemory)?;
    let mut checksum = 0u8;
    let mut entry_count = 0u16;

    let mut write_entry = |entry_addr: &mut GuestAddress,
                           checksum: &mut u8,
                           bytes: &[u8]|
     -> Result<()> {
        guest_memory
            .write_slice(bytes, *entry_addr)
            .map_err(Error::WriteMpTable)?;
        for byte in bytes {
            *checksum = checksum.wrapping_add(*byte);
        }
        *entry_addr = entry_addr
            .checked_add(bytes.len() as u64)
            .ok_or(Error::NotEnoughMemory)?;
        Ok(())
    };

    for cpu_id in 0..num_cpus {
        let cpu = MpcCpu {
            type_: MP_PROCESSOR,
            apicid: cpu_id,
            apicver: APIC_VERSION,
            cpuflag: CPU_ENABLED
                | if cpu_id == 0 { CPU_BOOTPROCESSOR } else { 0 },
            cpufeature: CPU_STEPPING,
            featureflag: CPU_FEATURE_APIC | CPU_FEATURE_FPU,
            ..Default::default()
        };
        write_entry(&mut entry_addr, &mut checksum, cpu.as_slice())?;
        entry_count += 1;
    }

    let bus = MpcBus {
        type_: MP_BUS,
        busid: 0,
        bustype: BUS_TYPE_ISA,
    };
    write_entry(&mut entry_addr, &mut checksum, bus.as_slice())?;
    entry_count += 1;

    let ioapic_id = num_cpus + 1;
    let ioapic = MpcIoapic {
        type_: MP_IOAPIC,
        apicid: ioapic_id,
        apicver: APIC_VERSION,
        flags: MPC_APIC_USABLE,
        apicaddr: IO_APIC_DEFAULT_PHYS_BASE,
    };
    write_entry(&mut entry_addr, &mut checksum, ioapic.as_slice())?;
    entry_count += 1;

    // Identity-route the 16 ISA interrupts through the IOAPIC.
    for irq in 0..16u8 {
        let intsrc = MpcIntsrc {
            type_: MP_INTSRC,
            irqtype: MP_IRQ_SOURCE_TYPE_INT,
            irqflag: 0,
            srcbus: 0,
            srcbusirq: irq,
            dstapic: ioapic_id,
            dstirq: irq,
        };
        write_entry(&mut entry_addr, &mut checksum, intsrc.as_slice())?;
        entry_count += 1;
    }

    let lint0 = MpcLintsrc {
        type_: MP_LINTSRC,
        irqtype: MP_IRQ_SOURCE_TYPE_EXTINT,
        irqflag: 0,
        srcbusid: 0,
        srcbusirq: 0,
        destapic: 0,
        destapiclint: 0,
    };
    write_entry(&mut entry_addr, &mut checksum, lint0.as_slice())?;
    entry_count += 1;

    let lint1 = MpcLintsrc {
        type_: MP_LINTSRC,
        irqtype: MP_IRQ_SOURCE_TYPE_NMI,
        irqflag: 0,
        srcbusid: 0,
        srcbusirq: 0,
        destapic: 0xff,
        destapiclint: 1,
    };
    write_entry(&mut entry_addr, &mut checksum, lint1.as_slice())?;
    entry_count += 1;

    let table_len = entry_addr
        .checked_offset_from(table_addr)
        .ok_or(Error::NotEnoughMemory)? as u16;

    let mut table = MpcTable {
        signature: MPC_SIGNATURE,
        length: table_len,
        spec: MPC_SPEC,
        oem: MPC_OEM,
        productid: MPC_PRODUCT_ID,
        oemcount: entry_count,
        lapic: APIC_DEFAULT_PHYS_BASE,
        ..Default::default()
    };
    // Entries were summed while writing; fold in the header and negate.
    table.checksum = table
        .checksum
        .wrapping_sub(compute_checksum(&table))
        .wrapping_sub(checksum);
    guest_memory
        .write_obj(table, table_addr)
        .map_err(Error::WriteMpTable)?;

    let mut mpf = MpfIntel {
        signature: SMP_MAGIC_IDENT,
        physptr: table_addr.raw_value() as u32,
        length: 1,
        specification: MPC_SPEC,
        ..Default::default()
    };
    mpf.checksum = mpf_intel_compute_checksum(&mpf);
    guest_memory
        .write_obj(mpf, mpf_addr)
        .map_err(Error::WriteMpTable)?;

    Ok(())
}
