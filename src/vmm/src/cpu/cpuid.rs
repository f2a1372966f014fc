// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

use kvm_bindings::CpuId;

// CPUID bits in ebx, ecx, and edx.
const EBX_CLFLUSH_CACHELINE: u32 = 8; // Flush a cache line size.
const EBX_CLFLUSH_SIZE_SHIFT: u32 = 8; // Bytes flushed when executing CLFLUSH.
const EBX_CPU_COUNT_SHIFT: u32 = 16; // Index of this CPU.
const EBX_CPUID_SHIFT: u32 = 24; // Index of this CPU.
const ECX_HYPERVISOR_SHIFT: u32 = 31; // Flag to be set when the cpu is running on a hypervisor.
const EDX_HTT_SHIFT: u32 = 28; // Hyper Threading Enabled.

/// Trim the host CPUID down to what this monitor actually virtualizes and
/// stamp the topology for `vcpu_id`. Hypervisor-reserved leaves are blanked;
/// the guest discovers nothing there it could act on.
pub fn filter_cpuid(vcpu_id: u8, cpu_count: u8, cpuid: &mut CpuId) {
    for entry in cpuid.as_mut_slice().iter_mut() {
        match entry.function {
            0x01 => {
                // X86 hypervisor feature.
                if entry.index == 0 {
                    entry.ecx |= 1 << ECX_HYPERVISOR_SHIFT;
                }
                entry.ebx = u32::from(vcpu_id) << EBX_CPUID_SHIFT
                    | EBX_CLFLUSH_CACHELINE << EBX_CLFLUSH_SIZE_SHIFT;
                if cpu_count > 1 {
                    entry.ebx |= u32::from(cpu_count) << EBX_CPU_COUNT_SHIFT;
                    entry.edx |= 1 << EDX_HTT_SHIFT;
                }
            }
            0x0b => {
                // EDX bits 31..0 contain x2APIC ID of current logical processor.
                entry.edx = u32::from(vcpu_id);
            }
            0x4000_0000..=0x4000_00ff => {
                // Hypervisor-reserved leaves are not virtualized here.
                entry.eax = 0;
                entry.ebx = 0;
                entry.ecx = 0;
                entry.edx = 0;
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kvm_bindings::kvm_cpuid_entry2;

    fn entry(function: u32) -> kvm_cpuid_entry2 {
        kvm_cpuid_entry2 {
            function,
            eax: 0xdead,
            ebx: 0xdead,
            ecx: 0,
            edx: 0,
            ..Default::default()
        }
    }

    #[test]
    fn topology_and_hypervisor_bit() {
        let mut cpuid = CpuId::from_entries(&[entry(0x01), entry(0x0b)]).unwrap();
        filter_cpuid(2, 4, &mut cpuid);

        let entries = cpuid.as_slice();
        assert_ne!(entries[0].ecx & (1 << ECX_HYPERVISOR_SHIFT), 0);
        assert_eq!(entries[0].ebx >> EBX_CPUID_SHIFT, 2);
        assert_eq!((entries[0].ebx >> EBX_CPU_COUNT_SHIFT) & 0xff, 4);
        assert_eq!(entries[1].edx, 2);
    }

    #[test]
    fn hypervisor_leaves_are_blanked() {
        let mut cpuid = CpuId::from_entries(&[entry(0x4000_0001)]).unwrap();
        filter_cpuid(0, 1, &mut cpuid);
        let e = cpuid.as_slice()[0];
        assert_eq!((e.eax, e.ebx, e.ecx, e.edx), (0, 0, 0, 0));
    }
}
