// Copyright 2020 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

use std::io::{self, Write};
use std::result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use kvm_bindings::{
    kvm_fpu, kvm_guest_debug, kvm_regs, CpuId, KVM_GUESTDBG_ENABLE, KVM_GUESTDBG_SINGLESTEP,
};
use kvm_ioctls::{VcpuExit, VcpuFd, VmFd};
use log::{error, info, warn};
use vm_memory::GuestMemoryMmap;

use crate::devices::registry::{self, IoRegistry};
use crate::kernel::KernelLoad;

pub(crate) mod cpuid;
pub(crate) mod debug;
mod interrupts;
use interrupts::*;
pub(crate) mod mpspec;
pub(crate) mod mptable;
pub(crate) mod msr_index;
pub(crate) mod msrs;

/// Errors encountered during vCPU operation.
#[derive(Debug)]
pub enum Error {
    /// Error issuing an ioctl to KVM.
    KvmIoctl(kvm_ioctls::Error),
    /// Failed to configure mptables.
    Mptable(mptable::Error),
    /// Fewer MSRs set than requested.
    SetModelSpecificRegistersCount,
    /// Failed to build the MSR list.
    CreateMsr(msrs::Error),
}

/// Dedicated Result type.
pub type Result<T> = result::Result<T, Error>;

/// How a vCPU thread ended.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VcpuOutcome {
    /// The guest shut down or a reboot was broadcast.
    Shutdown,
    /// KVM reported an unrecoverable condition.
    Panic,
}

/// Run/pause/stop state shared by every vCPU thread and their owner.
pub struct VcpuRunState {
    running: AtomicBool,
    paused: Mutex<bool>,
    resumed: Condvar,
}

impl VcpuRunState {
    pub fn new() -> Self {
        VcpuRunState {
            running: AtomicBool::new(true),
            paused: Mutex::new(false),
            resumed: Condvar::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Ask every vCPU to leave its run loop.
    pub fn request_exit(&self) {
        self.running.store(false, Ordering::SeqCst);
        // A paused guest must still be able to die.
        self.resumed.notify_all();
    }

    pub fn pause(&self) {
        *self.paused.lock().unwrap() = true;
    }

    pub fn resume(&self) {
        *self.paused.lock().unwrap() = false;
        self.resumed.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.lock().unwrap()
    }

    /// Park briefly while paused. Bounded so the caller can keep serving
    /// debug requests in between.
    fn paused_tick(&self) {
        let paused = self.paused.lock().unwrap();
        if *paused && self.running.load(Ordering::SeqCst) {
            let _ = self
                .resumed
                .wait_timeout(paused, std::time::Duration::from_millis(50))
                .unwrap();
        }
    }
}

/// An out-of-band request for one vCPU to dump its state.
///
/// The requesting thread parks on `wait_done` after kicking the vCPU out of
/// its run call; the dump itself runs on the vCPU thread so registers are
/// coherent. The busy wait is acceptable: dumps are rare and short.
pub struct DebugDumpRequest {
    pending: AtomicBool,
    done: AtomicBool,
    sink: Mutex<Option<Box<dyn Write + Send>>>,
}

impl DebugDumpRequest {
    pub fn new() -> Self {
        DebugDumpRequest {
            pending: AtomicBool::new(false),
            done: AtomicBool::new(false),
            sink: Mutex::new(None),
        }
    }

    pub fn request(&self, sink: Box<dyn Write + Send>) {
        *self.sink.lock().unwrap() = Some(sink);
        self.done.store(false, Ordering::Release);
        self.pending.store(true, Ordering::Release);
    }

    /// Spin until the dump lands or `timeout` passes; dumps are rare and
    /// short, so the wait is a barrier-ordered flag, not a condvar.
    pub fn wait_done(&self, timeout: std::time::Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        while !self.done.load(Ordering::Acquire) {
            if std::time::Instant::now() >= deadline {
                return false;
            }
            std::thread::yield_now();
        }
        true
    }
}

/// Struct for interacting with vCPUs.
pub(crate) struct Vcpu {
    /// Index.
    pub index: u8,
    /// KVM file descriptor for a vCPU.
    pub vcpu_fd: VcpuFd,

    device_mgr: Arc<IoRegistry>,
    guest_memory: Arc<GuestMemoryMmap>,
    run_state: Arc<VcpuRunState>,
    pub debug_dump: Arc<DebugDumpRequest>,
    ioport_debug: bool,
    iodelay_ms: u64,
}

impl Vcpu {
    /// Create a new vCPU.
    pub fn new(
        vm_fd: &VmFd,
        index: u8,
        device_mgr: Arc<IoRegistry>,
        guest_memory: Arc<GuestMemoryMmap>,
        run_state: Arc<VcpuRunState>,
        ioport_debug: bool,
        iodelay_ms: u64,
    ) -> Result<Self> {
        Ok(Vcpu {
            index,
            vcpu_fd: vm_fd.create_vcpu(index.into()).map_err(Error::KvmIoctl)?,
            device_mgr,
            guest_memory,
            run_state,
            debug_dump: Arc::new(DebugDumpRequest::new()),
            ioport_debug,
            iodelay_ms,
        })
    }

    /// Set CPUID.
    pub fn configure_cpuid(&self, cpuid: &CpuId) -> Result<()> {
        self.vcpu_fd.set_cpuid2(cpuid).map_err(Error::KvmIoctl)
    }

    /// Configure MSRs.
    pub fn configure_msrs(&self) -> Result<()> {
        let msrs = msrs::create_boot_msr_entries().map_err(Error::CreateMsr)?;
        self.vcpu_fd
            .set_msrs(&msrs)
            .map_err(Error::KvmIoctl)
            .and_then(|msrs_written| {
                if msrs_written as u32 != msrs.as_fam_struct_ref().nmsrs {
                    Err(Error::SetModelSpecificRegistersCount)
                } else {
                    Ok(())
                }
            })
    }

    /// Configure general registers for the real-mode entry point.
    pub fn configure_regs(&self, kernel_load: KernelLoad) -> Result<()> {
        let regs = kvm_regs {
            // Bit 1 is always set, interrupts start masked.
            rflags: 0x0000_0000_0000_0002u64,
            rip: u64::from(kernel_load.boot_ip),
            rsp: u64::from(kernel_load.boot_sp),
            rbp: u64::from(kernel_load.boot_sp),
            ..Default::default()
        };
        self.vcpu_fd.set_regs(&regs).map_err(Error::KvmIoctl)
    }

    /// Configure segments for real mode: every selector points at the boot
    /// segment, base = selector << 4. The kernel's own setup code takes it
    /// from there; the A20 line is already open under KVM.
    pub fn configure_sregs(&self, kernel_load: KernelLoad) -> Result<()> {
        let mut sregs = self.vcpu_fd.get_sregs().map_err(Error::KvmIoctl)?;

        let selector = kernel_load.boot_selector;
        let base = u64::from(selector) << 4;

        sregs.cs.selector = selector;
        sregs.cs.base = base;
        sregs.ss.selector = selector;
        sregs.ss.base = base;
        sregs.ds.selector = selector;
        sregs.ds.base = base;
        sregs.es.selector = selector;
        sregs.es.base = base;
        sregs.fs.selector = selector;
        sregs.fs.base = base;
        sregs.gs.selector = selector;
        sregs.gs.base = base;

        self.vcpu_fd.set_sregs(&sregs).map_err(Error::KvmIoctl)
    }

    /// Configure FPU.
    pub fn configure_fpu(&self) -> Result<()> {
        let fpu = kvm_fpu {
            fcw: 0x37f,
            mxcsr: 0x1f80,
            ..Default::default()
        };
        self.vcpu_fd.set_fpu(&fpu).map_err(Error::KvmIoctl)
    }

    /// Configures LAPICs. LAPIC0 is set for external interrupts, LAPIC1 is set for NMI.
    pub fn configure_lapic(&self) -> Result<()> {
        let mut klapic = self.vcpu_fd.get_lapic().map_err(Error::KvmIoctl)?;

        let lvt_lint0 = get_klapic_reg(&klapic, APIC_LVT0);
        set_klapic_reg(
            &mut klapic,
            APIC_LVT0,
            set_apic_delivery_mode(lvt_lint0, APIC_MODE_EXTINT),
        );
        let lvt_lint1 = get_klapic_reg(&klapic, APIC_LVT1);
        set_klapic_reg(
            &mut klapic,
            APIC_LVT1,
            set_apic_delivery_mode(lvt_lint1, APIC_MODE_NMI),
        );

        self.vcpu_fd.set_lapic(&klapic).map_err(Error::KvmIoctl)
    }

    /// Trap back to the monitor after every guest instruction.
    pub fn enable_single_step(&self) -> Result<()> {
        let debug = kvm_guest_debug {
            control: KVM_GUESTDBG_ENABLE | KVM_GUESTDBG_SINGLESTEP,
            ..Default::default()
        };
        self.vcpu_fd
            .set_guest_debug(&debug)
            .map_err(Error::KvmIoctl)
    }

    fn service_debug_dump(&self) {
        if !self.debug_dump.pending.swap(false, Ordering::AcqRel) {
            return;
        }
        let mut sink = self.debug_dump.sink.lock().unwrap();
        let out: &mut dyn Write = match sink.as_mut() {
            Some(out) => out,
            None => return,
        };
        if let Err(e) = debug::dump_state(&self.vcpu_fd, &self.guest_memory, self.index, out) {
            warn!("vcpu {} state dump failed: {}", self.index, e);
        }
        let _ = out.flush();
        drop(sink);
        self.debug_dump.done.store(true, Ordering::Release);
    }

    fn dump_to_stderr(&self) {
        let stderr = io::stderr();
        let mut out = stderr.lock();
        let _ = debug::dump_state(&self.vcpu_fd, &self.guest_memory, self.index, &mut out);
    }

    /// vCPU emulation loop. Returns when the guest is done or broken.
    pub fn run(&mut self) -> VcpuOutcome {
        loop {
            if !self.run_state.is_running() {
                return VcpuOutcome::Shutdown;
            }
            self.service_debug_dump();
            if self.run_state.is_paused() {
                self.run_state.paused_tick();
                continue;
            }

            // Call into KVM to launch (VMLAUNCH) or resume (VMRESUME) the
            // virtual CPU. This blocks until an error or a VM-Exit.
            match self.vcpu_fd.run() {
                Ok(exit_reason) => match exit_reason {
                    VcpuExit::IoIn(port, data) => {
                        if !self.device_mgr.pio_read(port, data) {
                            registry::unhandled_read(u64::from(port), data, self.ioport_debug);
                        }
                    }
                    VcpuExit::IoOut(port, data) => {
                        if self.iodelay_ms > 0 {
                            std::thread::sleep(std::time::Duration::from_millis(self.iodelay_ms));
                        }
                        if !self.device_mgr.pio_write(port, data) {
                            registry::unhandled_write(u64::from(port), data, self.ioport_debug);
                        }
                    }
                    VcpuExit::MmioRead(addr, data) => {
                        if !self.device_mgr.mmio_read(addr, data) {
                            registry::unhandled_read(addr, data, self.ioport_debug);
                        }
                    }
                    VcpuExit::MmioWrite(addr, data) => {
                        if !self.device_mgr.mmio_write(addr, data) {
                            registry::unhandled_write(addr, data, self.ioport_debug);
                        }
                    }
                    // The in-kernel irqchip already waits for interrupts.
                    VcpuExit::Hlt => {}
                    VcpuExit::IrqWindowOpen => {}
                    VcpuExit::Intr => {}
                    VcpuExit::Shutdown => {
                        info!("vcpu {}: guest requested shutdown", self.index);
                        self.run_state.request_exit();
                        return VcpuOutcome::Shutdown;
                    }
                    VcpuExit::Debug => {
                        // Single-step trap.
                        self.dump_to_stderr();
                    }
                    VcpuExit::FailEntry => {
                        error!("vcpu {}: KVM_EXIT_FAIL_ENTRY", self.index);
                        self.dump_to_stderr();
                        self.run_state.request_exit();
                        return VcpuOutcome::Panic;
                    }
                    VcpuExit::InternalError => {
                        error!("vcpu {}: KVM_EXIT_INTERNAL_ERROR", self.index);
                        self.dump_to_stderr();
                        self.run_state.request_exit();
                        return VcpuOutcome::Panic;
                    }
                    other => {
                        error!("vcpu {}: unhandled VM-exit {:?}", self.index, other);
                        self.dump_to_stderr();
                        self.run_state.request_exit();
                        return VcpuOutcome::Panic;
                    }
                },
                Err(e) => match e.errno() {
                    // Kicked by a signal; the loop head re-reads the flags.
                    libc::EINTR | libc::EAGAIN => {}
                    errno => {
                        error!("vcpu {}: KVM_RUN failed: {}", self.index, errno);
                        self.run_state.request_exit();
                        return VcpuOutcome::Panic;
                    }
                },
            }
        }
    }
}
