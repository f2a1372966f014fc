// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

use std::path::PathBuf;

use super::{
    default_ram_mib, find_kernel, online_cpus, ConsoleMode, DiskSpec, Error, NetSpec, P9Spec,
    Result, VMMConfig, DEFAULT_CONSOLE, KVM_NR_CPUS, MAX_DISK_IMAGES, MIN_RAM_SIZE_MB,
};

/// Collects raw flag values; `build` applies the defaulting and validation
/// rules and produces a [`VMMConfig`].
#[derive(Debug, Default)]
pub struct VMMConfigBuilder {
    name: Option<String>,
    cpus: u32,
    memory_mib: u64,
    kernel: Option<PathBuf>,
    initrd: Option<PathBuf>,
    params: Option<String>,
    disks: Vec<DiskSpec>,
    nets: Vec<NetSpec>,
    no_dhcp: bool,
    balloon: bool,
    rng: bool,
    vnc: bool,
    sdl: bool,
    p9_shares: Vec<P9Spec>,
    console: Option<ConsoleMode>,
    debug: bool,
    single_step: bool,
    ioport_debug: bool,
    iodelay_ms: u64,
}

impl VMMConfigBuilder {
    pub fn name(mut self, name: Option<String>) -> Self {
        self.name = name;
        self
    }

    /// Zero means "use every online CPU".
    pub fn cpus(mut self, cpus: u32) -> Self {
        self.cpus = cpus;
        self
    }

    /// Zero means "derive from the CPU count".
    pub fn memory_mib(mut self, memory_mib: u64) -> Self {
        self.memory_mib = memory_mib;
        self
    }

    pub fn kernel(mut self, kernel: Option<PathBuf>) -> Self {
        self.kernel = kernel;
        self
    }

    pub fn initrd(mut self, initrd: Option<PathBuf>) -> Self {
        self.initrd = initrd;
        self
    }

    pub fn params(mut self, params: Option<String>) -> Self {
        self.params = params;
        self
    }

    pub fn disks(mut self, disks: Vec<DiskSpec>) -> Self {
        self.disks = disks;
        self
    }

    pub fn nets(mut self, nets: Vec<NetSpec>) -> Self {
        self.nets = nets;
        self
    }

    pub fn no_dhcp(mut self, no_dhcp: bool) -> Self {
        self.no_dhcp = no_dhcp;
        self
    }

    pub fn balloon(mut self, balloon: bool) -> Self {
        self.balloon = balloon;
        self
    }

    pub fn rng(mut self, rng: bool) -> Self {
        self.rng = rng;
        self
    }

    pub fn vnc(mut self, vnc: bool) -> Self {
        self.vnc = vnc;
        self
    }

    pub fn sdl(mut self, sdl: bool) -> Self {
        self.sdl = sdl;
        self
    }

    pub fn p9_shares(mut self, p9_shares: Vec<P9Spec>) -> Self {
        self.p9_shares = p9_shares;
        self
    }

    pub fn console(mut self, console: Option<ConsoleMode>) -> Self {
        self.console = console;
        self
    }

    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn single_step(mut self, single_step: bool) -> Self {
        self.single_step = single_step;
        self
    }

    pub fn ioport_debug(mut self, ioport_debug: bool) -> Self {
        self.ioport_debug = ioport_debug;
        self
    }

    pub fn iodelay_ms(mut self, iodelay_ms: u64) -> Self {
        self.iodelay_ms = iodelay_ms;
        self
    }

    pub fn build(self) -> Result<VMMConfig> {
        let cpus = match self.cpus {
            0 => online_cpus().min(KVM_NR_CPUS),
            cpus if cpus > KVM_NR_CPUS => return Err(Error::CpusOutOfRange(cpus)),
            cpus => cpus,
        } as u8;

        let memory_mib = match self.memory_mib {
            0 => default_ram_mib(cpus),
            mib => mib,
        };
        if memory_mib < MIN_RAM_SIZE_MB {
            return Err(Error::NotEnoughMemory(memory_mib));
        }

        if self.disks.len() > MAX_DISK_IMAGES {
            return Err(Error::TooManyDisks);
        }

        let kernel = match self.kernel {
            Some(kernel) => kernel,
            None => find_kernel()?,
        };

        Ok(VMMConfig {
            name: self
                .name
                .unwrap_or_else(|| format!("guest-{}", std::process::id())),
            cpus,
            memory_mib,
            kernel,
            initrd: self.initrd,
            params: self.params,
            disks: self.disks,
            nets: self.nets,
            no_dhcp: self.no_dhcp,
            balloon: self.balloon,
            rng: self.rng,
            vnc: self.vnc,
            sdl: self.sdl,
            p9_shares: self.p9_shares,
            console: self.console.unwrap_or(DEFAULT_CONSOLE),
            debug: self.debug,
            single_step: self.single_step,
            ioport_debug: self.ioport_debug,
            iodelay_ms: self.iodelay_ms,
        })
    }
}
