// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

use kvm_bindings::{kvm_msr_entry, Msrs};

use super::msr_index::*;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to build the boot MSR list")]
    BootMsrList,
}

pub type Result<T> = std::result::Result<T, Error>;

fn msr_entry_default(index: u32) -> kvm_msr_entry {
    kvm_msr_entry {
        index,
        data: 0x0,
        ..Default::default()
    }
}

/// The MSR state a freshly reset vCPU boots with: SYSENTER and syscall
/// entry points zeroed, TSC zeroed, fast string operations on.
pub fn create_boot_msr_entries() -> Result<Msrs> {
    Msrs::from_entries(&[
        msr_entry_default(MSR_IA32_SYSENTER_CS),
        msr_entry_default(MSR_IA32_SYSENTER_ESP),
        msr_entry_default(MSR_IA32_SYSENTER_EIP),
        // x86_64 specific msrs, we only run on x86_64 not x86.
        msr_entry_default(MSR_STAR),
        msr_entry_default(MSR_CSTAR),
        msr_entry_default(MSR_KERNEL_GS_BASE),
        msr_entry_default(MSR_SYSCALL_MASK),
        msr_entry_default(MSR_LSTAR),
        // end of x86_64 specific code
        msr_entry_default(MSR_IA32_TSC),
        kvm_msr_entry {
            index: MSR_IA32_MISC_ENABLE,
            data: MSR_IA32_MISC_ENABLE_FAST_STRING,
            ..Default::default()
        },
    ])
    .map_err(|_| Error::BootMsrList)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_msrs_include_syscall_entry_points() {
        let msrs = create_boot_msr_entries().unwrap();
        let entries = msrs.as_slice();
        assert_eq!(entries.len() as u32, msrs.as_fam_struct_ref().nmsrs);
        assert!(entries.iter().any(|e| e.index == MSR_LSTAR));
        let misc = entries
            .iter()
            .find(|e| e.index == MSR_IA32_MISC_ENABLE)
            .unwrap();
        assert_eq!(misc.data, MSR_IA32_MISC_ENABLE_FAST_STRING);
    }
}
