// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

// Intel MultiProcessor Specification 1.4 structures, trimmed to what the
// table builder emits. Layouts mirror the kernel's mpspec_def.h.

pub const SMP_MAGIC_IDENT: [u8; 4] = *b"_MP_";
pub const MPC_SIGNATURE: [u8; 4] = *b"PCMP";
pub const MPC_SPEC: u8 = 4;
pub const MPC_OEM: [u8; 8] = *b"KVMBOX  ";
pub const MPC_PRODUCT_ID: [u8; 12] = *b"0.1         ";

pub const MP_PROCESSOR: u8 = 0;
pub const MP_BUS: u8 = 1;
pub const MP_IOAPIC: u8 = 2;
pub const MP_INTSRC: u8 = 3;
pub const MP_LINTSRC: u8 = 4;

pub const CPU_ENABLED: u8 = 1;
pub const CPU_BOOTPROCESSOR: u8 = 2;

pub const CPU_STEPPING: u32 = 0x600;
pub const CPU_FEATURE_APIC: u32 = 0x200;
pub const CPU_FEATURE_FPU: u32 = 0x001;

pub const BUS_TYPE_ISA: [u8; 6] = *b"ISA   ";

pub const MPC_APIC_USABLE: u8 = 0x01;
pub const APIC_VERSION: u8 = 0x14;

// mp_irq_source_types
pub const MP_IRQ_SOURCE_TYPE_INT: u8 = 0;
pub const MP_IRQ_SOURCE_TYPE_NMI: u8 = 1;
pub const MP_IRQ_SOURCE_TYPE_EXTINT: u8 = 3;

pub const APIC_DEFAULT_PHYS_BASE: u32 = 0xfee0_0000;
pub const IO_APIC_DEFAULT_PHYS_BASE: u32 = 0xfec0_0000;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct MpfIntel {
    pub signature: [u8; 4],
    pub physptr: u32,
    pub length: u8,
    pub specification: u8,
    pub checksum: u8,
    pub feature1: u8,
    pub feature2: u8,
    pub feature3: u8,
    pub feature4: u8,
    pub feature5: u8,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct MpcTable {
    pub signature: [u8; 4],
    pub length: u16,
    pub spec: u8,
    pub checksum: u8,
    pub oem: [u8; 8],
    pub productid: [u8; 12],
    pub oemptr: u32,
    pub oemsize: u16,
    pub oemcount: u16,
    pub lapic: u32,
    pub reserved: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct MpcCpu {
    pub type_: u8,
    pub apicid: u8,
    pub apicver: u8,
    pub cpuflag: u8,
    pub cpufeature: u32,
    pub featureflag: u32,
    pub reserved: [u32; 2],
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct MpcBus {
    pub type_: u8,
    pub busid: u8,
    pub bustype: [u8; 6],
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct MpcIoapic {
    pub type_: u8,
    pub apicid: u8,
    pub apicver: u8,
    pub flags: u8,
    pub apicaddr: u32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct MpcIntsrc {
    pub type_: u8,
    pub irqtype: u8,
    pub irqflag: u16,
    pub srcbus: u8,
    pub srcbusirq: u8,
    pub dstapic: u8,
    pub dstirq: u8,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct MpcLintsrc {
    pub type_: u8,
    pub irqtype: u8,
    pub irqflag: u16,
    pub srcbusid: u8,
    pub srcbusirq: u8,
    pub destapic: u8,
    pub destapiclint: u8,
}

// All of these are plain bytes as far as guest memory is concerned.
unsafe impl vm_memory::ByteValued for MpfIntel {}
unsafe impl vm_memory::ByteValued for MpcTable {}
unsafe impl vm_memory::ByteValued for MpcCpu {}
unsafe impl vm_memory::ByteValued for MpcBus {}
unsafe impl vm_memory::ByteValued for MpcIoapic {}
unsafe impl vm_memory::ByteValued for MpcIntsrc {}
unsafe impl vm_memory::ByteValued for MpcLintsrc {}
