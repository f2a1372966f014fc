// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

#![cfg(target_arch = "x86_64")]

//! A user-space monitor that boots an unmodified Linux kernel inside a
//! KVM virtual machine.
//!
//! The [`VMM`] owns guest RAM, the port-I/O and MMIO dispatch buses, the
//! PCI bus, the device set and one host thread per vCPU. Paravirtual I/O
//! is legacy virtio-PCI; the platform is otherwise the bare minimum a
//! kernel told `noapic noacpi pci=conf1` expects.

use std::io::{self, stdout, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use event_manager::{EventManager, MutEventSubscriber, SubscriberOps};
use kvm_bindings::{kvm_pit_config, KVM_API_VERSION, KVM_MAX_CPUID_ENTRIES};
use kvm_ioctls::{Cap, Kvm, VmFd};
use log::{info, warn};
use vm_memory::GuestMemoryMmap;
use vmm_sys_util::terminal::Terminal;

pub mod config;
use config::{ConsoleMode, DiskSpec, NetMode, NetSpec, VMMConfig};
mod cpu;
use cpu::{cpuid, mptable, DebugDumpRequest, Vcpu, VcpuOutcome, VcpuRunState};
pub mod devices;
use devices::ioevent::IoeventRegistry;
use devices::irq::IrqAllocator;
use devices::legacy;
use devices::pci::{PciBus, PCI_CONFIG_PORT, PCI_CONFIG_PORT_SIZE};
use devices::registry::IoRegistry;
use devices::serial::{SerialConsole, SERIAL_IRQ, SERIAL_PORT_BASE, SERIAL_PORT_SIZE};
use devices::stdin::{ActiveConsole, StdinRouter};
use devices::virtio::console::ConsoleHandle;
use devices::virtio::net::tap::Tap;
use devices::virtio::net::uip::UserStack;
use devices::virtio::net::NetBackend;
use devices::virtio::{balloon, blk, console as virtio_console, net, p9, rng};
pub mod disk;
use disk::RawImage;
pub mod ipc;
mod kernel;
pub mod memory;
mod threadpool;
use threadpool::ThreadPool;

/// Period of the platform tick that polls the virtio console.
const TIMER_PERIOD: Duration = Duration::from_millis(1);

/// Capabilities this monitor refuses to run without.
const REQUIRED_CAPS: &[Cap] = &[
    Cap::CoalescedMmio,
    Cap::SetTssAddr,
    Cap::UserMemory,
    Cap::IrqRouting,
    Cap::Irqchip,
    Cap::Hlt,
    Cap::IrqInjectStatus,
    Cap::ExtCpuid,
];

/// VMM errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    Config(#[from] config::Error),
    #[error("KVM API version {0} is not supported")]
    KvmApiVersion(i32),
    #[error("unsupported KVM extension: {0:?}")]
    KvmCap(Cap),
    #[error("KVM ioctl failed: {0}")]
    KvmIoctl(kvm_ioctls::Error),
    #[error("guest memory: {0}")]
    Memory(#[from] memory::Error),
    #[error("kernel: {0}")]
    Kernel(#[from] kernel::Error),
    #[error("vcpu: {0:?}")]
    Vcpu(cpu::Error),
    #[error("device: {0}")]
    Device(#[from] devices::virtio::Error),
    #[error("I/O registry: {0}")]
    Registry(#[from] devices::registry::Error),
    #[error("serial console: {0}")]
    Serial(io::Error),
    #[error("disk image {0}: {1}")]
    Disk(PathBuf, io::Error),
    #[error("control channel: {0}")]
    Ipc(io::Error),
    #[error("thread spawn: {0}")]
    Spawn(io::Error),
}

/// Dedicated [`Result`](https://doc.rust-lang.org/std/result/) type.
pub type Result<T> = std::result::Result<T, Error>;

type Subscriber = Arc<Mutex<dyn MutEventSubscriber>>;

pub struct VMM {
    config: VMMConfig,
    kvm: Kvm,
    vm_fd: Arc<VmFd>,
    guest_memory: Arc<GuestMemoryMmap>,

    // Buses and allocators; the registry is frozen into an Arc when the
    // vCPUs are created.
    device_mgr: Option<IoRegistry>,
    pci_bus: Arc<Mutex<PciBus>>,
    irq_alloc: IrqAllocator,

    pool: Arc<ThreadPool>,
    event_manager: EventManager<Subscriber>,
    ioevents: IoeventRegistry,

    serial: Arc<Mutex<SerialConsole>>,
    console: Option<Arc<ConsoleHandle>>,

    run_state: Arc<VcpuRunState>,
    device_stop: Arc<AtomicBool>,
    vcpus: Vec<Vcpu>,
    vcpu_handles: Vec<thread::JoinHandle<VcpuOutcome>>,
    vcpu_thread_ids: Arc<Mutex<Vec<libc::pthread_t>>>,
    vcpu_debug: Vec<Arc<DebugDumpRequest>>,

    control: Option<ipc::ControlServer>,
}

impl VMM {
    /// Build the whole machine described by `config`. Everything that can
    /// fail, fails here; `run` only executes.
    pub fn new(config: VMMConfig) -> Result<VMM> {
        let kvm = Kvm::new().map_err(Error::KvmIoctl)?;

        let kvm_api_ver = kvm.get_api_version();
        if kvm_api_ver != KVM_API_VERSION as i32 {
            return Err(Error::KvmApiVersion(kvm_api_ver));
        }
        VMM::check_kvm_capabilities(&kvm)?;

        let vm_fd = Arc::new(kvm.create_vm().map_err(Error::KvmIoctl)?);
        vm_fd.set_tss_address(0xfffb_d000).map_err(Error::KvmIoctl)?;
        vm_fd
            .create_pit2(kvm_pit_config::default())
            .map_err(Error::KvmIoctl)?;

        let guest_memory = Arc::new(memory::create_guest_memory(config.memory_bytes())?);
        memory::register_with_vm(&vm_fd, &guest_memory)?;

        // On `x86_64`, the irqchip _must_ exist before the vCPUs: it sets
        // up the virtual IOAPIC, the virtual PIC and the local APICs.
        vm_fd.create_irq_chip().map_err(Error::KvmIoctl)?;

        let serial = Arc::new(Mutex::new(
            SerialConsole::new(Box::new(stdout())).map_err(Error::Serial)?,
        ));
        vm_fd
            .register_irqfd(
                &serial.lock().unwrap().eventfd().map_err(Error::Serial)?,
                SERIAL_IRQ,
            )
            .map_err(Error::KvmIoctl)?;

        let mut vmm = VMM {
            kvm,
            vm_fd,
            guest_memory,
            device_mgr: Some(IoRegistry::new()?),
            pci_bus: Arc::new(Mutex::new(PciBus::new())),
            irq_alloc: IrqAllocator::new(),
            pool: Arc::new(ThreadPool::new(config::online_cpus() as usize)),
            event_manager: EventManager::new().map_err(|e| {
                Error::Ipc(io::Error::new(io::ErrorKind::Other, format!("{:?}", e)))
            })?,
            ioevents: IoeventRegistry::new(),
            serial,
            console: None,
            run_state: Arc::new(VcpuRunState::new()),
            device_stop: Arc::new(AtomicBool::new(false)),
            vcpus: Vec::new(),
            vcpu_handles: Vec::new(),
            vcpu_thread_ids: Arc::new(Mutex::new(Vec::new())),
            vcpu_debug: Vec::new(),
            control: None,
            config,
        };

        vmm.setup_legacy_platform()?;
        vmm.setup_virtio_devices()?;
        vmm.load_kernel_and_vcpus()?;

        Ok(vmm)
    }

    fn check_kvm_capabilities(kvm: &Kvm) -> Result<()> {
        if let Some(cap) = REQUIRED_CAPS
            .iter()
            .find(|cap| !kvm.check_extension(**cap))
        {
            return Err(Error::KvmCap(*cap));
        }
        Ok(())
    }

    fn registry(&mut self) -> &mut IoRegistry {
        // Only reachable before the registry is frozen.
        self.device_mgr.as_mut().expect("I/O registry already frozen")
    }

    fn setup_legacy_platform(&mut self) -> Result<()> {
        let serial = self.serial.clone();
        let pci_bus = self.pci_bus.clone();
        let registry = self.registry();

        registry.register_pio(SERIAL_PORT_BASE, SERIAL_PORT_SIZE, serial)?;
        registry.register_pio(
            legacy::I8042_PORT_BASE,
            legacy::I8042_PORT_SIZE,
            Arc::new(Mutex::new(legacy::I8042)),
        )?;
        registry.register_pio(
            legacy::RTC_PORT_BASE,
            legacy::RTC_PORT_SIZE,
            Arc::new(Mutex::new(legacy::Rtc::new())),
        )?;
        registry.register_pio(
            legacy::DEBUG_PORT_BASE,
            legacy::DEBUG_PORT_SIZE,
            Arc::new(Mutex::new(legacy::DebugPort)),
        )?;
        registry.register_pio(
            legacy::POST_PORT_BASE,
            legacy::POST_PORT_SIZE,
            Arc::new(Mutex::new(legacy::DebugPort)),
        )?;
        registry.register_pio(PCI_CONFIG_PORT, PCI_CONFIG_PORT_SIZE, pci_bus)?;

        Ok(())
    }

    fn setup_virtio_devices(&mut self) -> Result<()> {
        // Block images and shared roots, in the order given.
        for disk_spec in self.config.disks.clone() {
            match disk_spec {
                DiskSpec::Image { path, read_only } => {
                    let image = RawImage::open(&path, read_only)
                        .map_err(|e| Error::Disk(path.clone(), e))?;
                    blk::install(
                        self.device_mgr.as_mut().expect("registry frozen"),
                        &self.pci_bus,
                        &mut self.irq_alloc,
                        &self.vm_fd,
                        self.guest_memory.clone(),
                        &self.pool,
                        Box::new(image),
                    )?;
                }
                DiskSpec::SharedRoot { dir } => {
                    p9::install(
                        self.device_mgr.as_mut().expect("registry frozen"),
                        &self.pci_bus,
                        &mut self.irq_alloc,
                        &self.vm_fd,
                        self.guest_memory.clone(),
                        &self.pool,
                        dir,
                        "/dev/root",
                    )?;
                }
            }
        }

        for share in self.config.p9_shares.clone() {
            p9::install(
                self.device_mgr.as_mut().expect("registry frozen"),
                &self.pci_bus,
                &mut self.irq_alloc,
                &self.vm_fd,
                self.guest_memory.clone(),
                &self.pool,
                share.dir,
                &share.tag,
            )?;
        }

        if self.config.console == ConsoleMode::Virtio {
            let handle = virtio_console::install(
                self.device_mgr.as_mut().expect("registry frozen"),
                &self.pci_bus,
                &mut self.irq_alloc,
                &self.vm_fd,
                self.guest_memory.clone(),
                &self.pool,
                Box::new(stdout()),
            )?;
            self.console = Some(Arc::new(handle));
        }

        if self.config.rng {
            rng::install(
                self.device_mgr.as_mut().expect("registry frozen"),
                &self.pci_bus,
                &mut self.irq_alloc,
                &self.vm_fd,
                self.guest_memory.clone(),
                &self.pool,
            )?;
        }

        if self.config.balloon {
            balloon::install(
                self.device_mgr.as_mut().expect("registry frozen"),
                &self.pci_bus,
                &mut self.irq_alloc,
                &self.vm_fd,
                self.guest_memory.clone(),
                &self.pool,
            )?;
        }

        // NICs; with nothing specified the guest still gets a user-mode one.
        let mut nets = self.config.nets.clone();
        if nets.is_empty() {
            nets.push(NetSpec {
                mode: NetMode::User,
                ..NetSpec::default()
            });
        }
        for (index, mut spec) in nets.into_iter().enumerate() {
            if spec.mode == NetMode::None {
                continue;
            }
            // Default MACs get a per-NIC last-octet bump so guests can tell
            // the devices apart; a user-provided MAC is used as given.
            if !spec.guest_mac_explicit {
                spec.guest_mac[5] = spec.guest_mac[5].wrapping_add(index as u8);
            }
            self.add_net_device(&spec)?;
        }

        if self.config.has_framebuffer() {
            warn!("VNC/SDL framebuffers are external viewers; only vesafb vidmode is set up");
        }

        Ok(())
    }

    fn add_net_device(&mut self, spec: &NetSpec) -> Result<()> {
        if spec.vhost {
            warn!("vhost acceleration is not available, staying in user space");
        }

        let backend: Arc<dyn NetBackend> = match spec.mode {
            NetMode::Tap => {
                let tap = Tap::open_named("").map_err(|source| {
                    devices::virtio::Error::Backend {
                        device: "net",
                        source,
                    }
                })?;
                tap.set_offloads().map_err(|source| {
                    devices::virtio::Error::Backend {
                        device: "net",
                        source,
                    }
                })?;
                tap.bring_up(spec.script.as_deref(), spec.host_ip)
                    .map_err(|source| devices::virtio::Error::Backend {
                        device: "net",
                        source,
                    })?;
                info!("tap device {} is up", tap.if_name());
                Arc::new(tap)
            }
            NetMode::User => Arc::new(UserStack::new(
                spec.host_mac,
                spec.guest_mac,
                spec.host_ip,
                spec.guest_ip,
            )),
            NetMode::None => return Ok(()),
        };

        net::install(
            self.device_mgr.as_mut().expect("registry frozen"),
            &self.pci_bus,
            &mut self.irq_alloc,
            &self.vm_fd,
            self.guest_memory.clone(),
            backend,
            spec.guest_mac,
            &mut self.ioevents,
            self.device_stop.clone(),
        )?;
        Ok(())
    }

    fn load_kernel_and_vcpus(&mut self) -> Result<()> {
        let cmdline = self.config.build_cmdline();
        info!("kernel cmdline: {}", cmdline);

        let kernel_load = kernel::load_kernel(
            &self.guest_memory,
            &self.config.kernel,
            self.config.initrd.as_deref(),
            &cmdline,
            self.config.vid_mode(),
        )?;

        mptable::setup_mptable(&self.guest_memory, self.config.cpus)
            .map_err(|e| Error::Vcpu(cpu::Error::Mptable(e)))?;

        // Freeze the registry; from here on devices only dispatch.
        let shared_registry = Arc::new(self.device_mgr.take().expect("registry frozen"));

        let base_cpuid = self
            .kvm
            .get_supported_cpuid(KVM_MAX_CPUID_ENTRIES)
            .map_err(Error::KvmIoctl)?;

        for index in 0..self.config.cpus {
            let vcpu = Vcpu::new(
                &self.vm_fd,
                index,
                shared_registry.clone(),
                self.guest_memory.clone(),
                self.run_state.clone(),
                self.config.ioport_debug,
                self.config.iodelay_ms,
            )
            .map_err(Error::Vcpu)?;

            let mut vcpu_cpuid = base_cpuid.clone();
            cpuid::filter_cpuid(index, self.config.cpus, &mut vcpu_cpuid);
            vcpu.configure_cpuid(&vcpu_cpuid).map_err(Error::Vcpu)?;
            vcpu.configure_msrs().map_err(Error::Vcpu)?;
            vcpu.configure_regs(kernel_load).map_err(Error::Vcpu)?;
            vcpu.configure_sregs(kernel_load).map_err(Error::Vcpu)?;
            vcpu.configure_fpu().map_err(Error::Vcpu)?;
            vcpu.configure_lapic().map_err(Error::Vcpu)?;
            if self.config.single_step {
                vcpu.enable_single_step().map_err(Error::Vcpu)?;
            }

            self.vcpu_debug.push(vcpu.debug_dump.clone());
            self.vcpus.push(vcpu);
        }

        Ok(())
    }

    fn start_vcpus(&mut self) -> Result<()> {
        *self.vcpu_thread_ids.lock().unwrap() = vec![0; self.vcpus.len()];

        for mut vcpu in self.vcpus.drain(..) {
            let index = vcpu.index as usize;
            let thread_ids = self.vcpu_thread_ids.clone();
            let handle = thread::Builder::new()
                .name(format!("vcpu{}", index))
                .spawn(move || {
                    // Trivially safe; the id is only used for pthread_kill.
                    thread_ids.lock().unwrap()[index] = unsafe { libc::pthread_self() };
                    vcpu.run()
                })
                .map_err(Error::Spawn)?;
            self.vcpu_handles.push(handle);
        }
        Ok(())
    }

    fn kick_vcpus(&self) {
        kick_threads(&self.vcpu_thread_ids);
    }

    /// Wait for every vCPU thread, interrupting any still blocked in
    /// KVM_RUN.
    fn join_vcpus(&mut self) -> bool {
        self.kick_vcpus();

        let mut clean = true;
        for handle in self.vcpu_handles.drain(..) {
            match handle.join() {
                Ok(VcpuOutcome::Shutdown) => {}
                Ok(VcpuOutcome::Panic) | Err(_) => clean = false,
            }
        }
        self.vcpu_thread_ids.lock().unwrap().clear();
        clean
    }

    /// Stop every vCPU at the next exit and hold them (the BR-lock write
    /// side). Device workers keep running; the rings simply go quiet.
    pub fn pause(&self) {
        self.run_state.pause();
        self.kick_vcpus();
        info!("Guest paused");
    }

    pub fn resume(&self) {
        self.run_state.resume();
        info!("Guest resumed");
    }

    /// Broadcast reboot: every vCPU leaves its run loop and tears down.
    pub fn stop(&self) {
        self.run_state.request_exit();
        self.kick_vcpus();
    }

    /// Run the VM to completion. `Ok(true)` is a clean guest shutdown.
    pub fn run(&mut self) -> Result<bool> {
        println!(
            "  # kvm run -k {} -m {} -c {} --name {}",
            self.config.kernel.display(),
            self.config.memory_mib,
            self.config.cpus,
            self.config.name
        );

        // pthread_kill must interrupt KVM_RUN with EINTR, not kill us.
        install_kick_handler();

        if io::stdin().lock().set_raw_mode().is_err() {
            warn!("failed to set raw mode on the terminal, input will echo");
        }

        // Host input, ioeventfds, then the devices' own clock.
        let stdin_router: Subscriber = Arc::new(Mutex::new(StdinRouter::new(
            self.serial.clone(),
            self.console.clone(),
            match self.config.console {
                ConsoleMode::Serial => ActiveConsole::Serial,
                ConsoleMode::Virtio => ActiveConsole::Virtio,
            },
        )));
        self.event_manager.add_subscriber(stdin_router);
        self.ioevents.attach_all(&mut self.event_manager);
        self.start_timer_thread()?;

        self.start_vcpus()?;

        let control = ipc::ControlServer::spawn(
            &self.config.name,
            Arc::new(VmControl {
                run_state: self.run_state.clone(),
                thread_ids: self.vcpu_thread_ids.clone(),
                debug: self.vcpu_debug.clone(),
                serial: self.serial.clone(),
            }),
        )
        .map_err(Error::Ipc)?;
        self.control = Some(control);

        while self.run_state.is_running() {
            if let Err(e) = self.event_manager.run_with_timeout(100) {
                warn!("event loop error: {:?}", e);
            }
        }

        let clean = self.join_vcpus();
        self.device_stop.store(true, Ordering::Release);
        self.control.take();

        let _ = io::stdin().lock().set_canon_mode();
        Ok(clean)
    }

    fn start_timer_thread(&self) -> Result<()> {
        let console = self.console.clone();
        let stop = self.device_stop.clone();
        thread::Builder::new()
            .name("timer".to_string())
            .spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    thread::sleep(TIMER_PERIOD);
                    if let Some(console) = &console {
                        console.tick();
                    }
                }
            })
            .map_err(Error::Spawn)?;
        Ok(())
    }
}

impl Drop for VMM {
    fn drop(&mut self) {
        self.device_stop.store(true, Ordering::Release);
        self.run_state.request_exit();
    }
}

fn kick_threads(thread_ids: &Arc<Mutex<Vec<libc::pthread_t>>>) {
    for &tid in thread_ids.lock().unwrap().iter() {
        if tid != 0 {
            unsafe {
                libc::pthread_kill(tid, libc::SIGUSR1);
            }
        }
    }
}

/// No-op signal handler used to interrupt vCPU threads blocked in KVM_RUN.
extern "C" fn empty_signal_handler(_: libc::c_int) {}

fn install_kick_handler() {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = empty_signal_handler as usize;
        sa.sa_flags = 0;
        libc::sigaction(libc::SIGUSR1, &sa, std::ptr::null_mut());
    }
}

/// One writer shared by the per-vCPU dump passes of a DEBUG request.
struct SharedWriter(Arc<Mutex<Box<dyn Write + Send>>>);

impl Write for SharedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.lock().unwrap().flush()
    }
}

/// The control channel's view of a running guest.
struct VmControl {
    run_state: Arc<VcpuRunState>,
    thread_ids: Arc<Mutex<Vec<libc::pthread_t>>>,
    debug: Vec<Arc<DebugDumpRequest>>,
    serial: Arc<Mutex<SerialConsole>>,
}

impl ipc::ControlHandler for VmControl {
    fn pause(&self) {
        self.run_state.pause();
        kick_threads(&self.thread_ids);
        info!("Guest paused");
    }

    fn resume(&self) {
        self.run_state.resume();
        info!("Guest resumed");
    }

    fn stop(&self) {
        self.run_state.request_exit();
        kick_threads(&self.thread_ids);
    }

    fn debug(&self, out: Box<dyn Write + Send>) {
        let shared = Arc::new(Mutex::new(out));

        // One vCPU at a time, in id order; each dump runs on its own
        // vCPU thread so the register file is coherent.
        for (index, request) in self.debug.iter().enumerate() {
            request.request(Box::new(SharedWriter(shared.clone())));
            if let Some(&tid) = self.thread_ids.lock().unwrap().get(index) {
                if tid != 0 {
                    unsafe {
                        libc::pthread_kill(tid, libc::SIGUSR1);
                    }
                }
            }
            if !request.wait_done(Duration::from_secs(2)) {
                warn!("vcpu {} did not produce a dump in time", index);
            }
        }

        // Ask the guest for its own view too.
        self.serial.lock().unwrap().inject_sysrq(b'p');
    }
}
