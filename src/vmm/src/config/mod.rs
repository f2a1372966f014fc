// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Guest configuration: flag parsing helpers, defaulting rules and the
//! canonical kernel command line.

use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;

mod builder;
pub use builder::VMMConfigBuilder;

/// The PIC only names this many APIC ids.
pub const KVM_NR_CPUS: u32 = 255;
pub const MAX_DISK_IMAGES: usize = 4;
pub const MIN_RAM_SIZE_MB: u64 = 64;
/// Default RAM never fills more than this share of the host.
const RAM_SIZE_RATIO: f64 = 0.8;

pub const DEFAULT_CONSOLE: ConsoleMode = ConsoleMode::Serial;
pub const DEFAULT_HOST_ADDR: Ipv4Addr = Ipv4Addr::new(192, 168, 33, 1);
pub const DEFAULT_GUEST_ADDR: Ipv4Addr = Ipv4Addr::new(192, 168, 33, 15);
pub const DEFAULT_GUEST_MAC: [u8; 6] = [0x02, 0x15, 0x15, 0x15, 0x15, 0x15];
pub const DEFAULT_HOST_MAC: [u8; 6] = [0x02, 0x01, 0x01, 0x01, 0x01, 0x01];

const CMDLINE_BASE: &str = "noapic noacpi pci=conf1 reboot=k panic=1 i8042.direct=1 \
                            i8042.dumbkbd=1 i8042.nopnp=1";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Number of CPUs {0} is out of [1;{}] range", KVM_NR_CPUS)]
    CpusOutOfRange(u32),
    #[error("Not enough memory specified: {0}MB (min {}MB)", MIN_RAM_SIZE_MB)]
    NotEnoughMemory(u64),
    #[error("could not find default kernel image")]
    KernelNotFound(Vec<PathBuf>),
    #[error("Currently only {} images are supported", MAX_DISK_IMAGES)]
    TooManyDisks,
    #[error("bad --network parameter: {0}")]
    BadNetSpec(String),
    #[error("bad MAC address: {0}")]
    BadMac(String),
    #[error("bad --9p parameter: {0} (expected dir,tag)")]
    Bad9pSpec(String),
    #[error("bad --console parameter: {0} (expected serial or virtio)")]
    BadConsole(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Console transport handed to the guest.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConsoleMode {
    Serial,
    Virtio,
}

impl std::str::FromStr for ConsoleMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "serial" => Ok(ConsoleMode::Serial),
            "virtio" => Ok(ConsoleMode::Virtio),
            other => Err(Error::BadConsole(other.to_string())),
        }
    }
}

/// One `--disk` argument: a block image, or a directory shared as the
/// guest root over 9p.
#[derive(Debug, Clone, PartialEq)]
pub enum DiskSpec {
    Image { path: PathBuf, read_only: bool },
    SharedRoot { dir: PathBuf },
}

impl DiskSpec {
    pub fn parse(arg: &str) -> DiskSpec {
        let (path, read_only) = match arg.strip_suffix(",ro") {
            Some(path) => (path, true),
            None => (arg, false),
        };
        let path = PathBuf::from(path);
        if path.is_dir() {
            DiskSpec::SharedRoot { dir: path }
        } else {
            DiskSpec::Image { path, read_only }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NetMode {
    Tap,
    User,
    None,
}

/// One `--network` argument.
#[derive(Debug, Clone, PartialEq)]
pub struct NetSpec {
    pub mode: NetMode,
    pub guest_ip: Ipv4Addr,
    pub host_ip: Ipv4Addr,
    pub guest_mac: [u8; 6],
    /// Whether `guest_mac` was given by the user. Only synthesized
    /// defaults get the per-NIC last-octet bump.
    pub guest_mac_explicit: bool,
    pub host_mac: [u8; 6],
    pub script: Option<String>,
    pub vhost: bool,
}

impl Default for NetSpec {
    fn default() -> Self {
        NetSpec {
            mode: NetMode::Tap,
            guest_ip: DEFAULT_GUEST_ADDR,
            host_ip: DEFAULT_HOST_ADDR,
            guest_mac: DEFAULT_GUEST_MAC,
            guest_mac_explicit: false,
            host_mac: DEFAULT_HOST_MAC,
            script: None,
            vhost: false,
        }
    }
}

pub fn parse_mac(s: &str) -> Result<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut parts = s.split(':');
    for byte in mac.iter_mut() {
        let part = parts.next().ok_or_else(|| Error::BadMac(s.to_string()))?;
        *byte = u8::from_str_radix(part, 16).map_err(|_| Error::BadMac(s.to_string()))?;
    }
    if parts.next().is_some() {
        return Err(Error::BadMac(s.to_string()));
    }
    Ok(mac)
}

impl NetSpec {
    /// Parse `mode=…,guest_ip=…,host_ip=…,guest_mac=…,script=…,vhost=0|1`.
    pub fn parse(arg: &str) -> Result<NetSpec> {
        let mut spec = NetSpec::default();
        for piece in arg.split(',').filter(|piece| !piece.is_empty()) {
            let (key, value) = piece
                .split_once('=')
                .ok_or_else(|| Error::BadNetSpec(arg.to_string()))?;
            match key {
                "mode" => {
                    spec.mode = match value {
                        "tap" => NetMode::Tap,
                        "user" => NetMode::User,
                        "none" => NetMode::None,
                        _ => return Err(Error::BadNetSpec(arg.to_string())),
                    }
                }
                "guest_ip" => {
                    spec.guest_ip = value
                        .parse()
                        .map_err(|_| Error::BadNetSpec(arg.to_string()))?
                }
                "host_ip" => {
                    spec.host_ip = value
                        .parse()
                        .map_err(|_| Error::BadNetSpec(arg.to_string()))?
                }
                "guest_mac" => {
                    spec.guest_mac = parse_mac(value)?;
                    spec.guest_mac_explicit = true;
                }
                "host_mac" => spec.host_mac = parse_mac(value)?,
                "script" => {
                    spec.script = if value == "none" {
                        None
                    } else {
                        Some(value.to_string())
                    }
                }
                "vhost" => spec.vhost = value == "1",
                _ => return Err(Error::BadNetSpec(arg.to_string())),
            }
        }
        Ok(spec)
    }
}

/// One `--9p dir,tag` share.
#[derive(Debug, Clone, PartialEq)]
pub struct P9Spec {
    pub dir: PathBuf,
    pub tag: String,
}

impl P9Spec {
    pub fn parse(arg: &str) -> Result<P9Spec> {
        let (dir, tag) = arg
            .split_once(',')
            .ok_or_else(|| Error::Bad9pSpec(arg.to_string()))?;
        if dir.is_empty() || tag.is_empty() {
            return Err(Error::Bad9pSpec(arg.to_string()));
        }
        Ok(P9Spec {
            dir: PathBuf::from(dir),
            tag: tag.to_string(),
        })
    }
}

/// A fully resolved guest description.
#[derive(Debug, Clone)]
pub struct VMMConfig {
    pub name: String,
    pub cpus: u8,
    pub memory_mib: u64,
    pub kernel: PathBuf,
    pub initrd: Option<PathBuf>,
    pub params: Option<String>,
    pub disks: Vec<DiskSpec>,
    pub nets: Vec<NetSpec>,
    pub no_dhcp: bool,
    pub balloon: bool,
    pub rng: bool,
    pub vnc: bool,
    pub sdl: bool,
    pub p9_shares: Vec<P9Spec>,
    pub console: ConsoleMode,
    pub debug: bool,
    pub single_step: bool,
    pub ioport_debug: bool,
    pub iodelay_ms: u64,
}

impl VMMConfig {
    pub fn builder() -> VMMConfigBuilder {
        VMMConfigBuilder::default()
    }

    pub fn memory_bytes(&self) -> usize {
        (self.memory_mib << 20) as usize
    }

    pub fn has_framebuffer(&self) -> bool {
        self.vnc || self.sdl
    }

    pub fn vid_mode(&self) -> u16 {
        if self.has_framebuffer() {
            0x312
        } else {
            0
        }
    }

    fn uses_9p_root(&self) -> bool {
        self.disks
            .iter()
            .any(|disk| matches!(disk, DiskSpec::SharedRoot { .. }))
    }

    fn has_block_root(&self) -> bool {
        self.disks
            .iter()
            .any(|disk| matches!(disk, DiskSpec::Image { .. }))
    }

    /// The canonical platform line, console selection, user parameters,
    /// then the root specification.
    pub fn build_cmdline(&self) -> String {
        let mut cmdline = String::from(CMDLINE_BASE);

        if self.has_framebuffer() {
            cmdline.push_str(" console=tty0 video=vesafb");
        } else {
            cmdline.push_str(" console=ttyS0 earlyprintk=serial i8042.noaux=1");
        }

        if let Some(params) = &self.params {
            cmdline.push(' ');
            cmdline.push_str(params);
        }

        if self.uses_9p_root() {
            cmdline.push_str(
                " root=/dev/root rw rootflags=rw,trans=virtio,version=9p2000.L rootfstype=9p",
            );
            if !self.no_dhcp {
                cmdline.push_str(" ip=dhcp");
            }
        } else if self.has_block_root() && !cmdline.contains("root=") {
            cmdline.push_str(" root=/dev/vda rw");
        }

        cmdline
    }
}

impl fmt::Display for VMMConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} ({} vcpus, {} MiB)",
            self.name, self.cpus, self.memory_mib
        )
    }
}

pub(crate) fn online_cpus() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1)
}

/// Host RAM in MiB.
pub(crate) fn host_ram_size_mib() -> u64 {
    // sysconf only reads kernel-provided constants.
    let pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) };
    if pages <= 0 || page_size <= 0 {
        return 0;
    }
    (pages as u64 * page_size as u64) >> 20
}

/// What the original always did: scale with the CPU count, stay under 80 %
/// of the host.
pub(crate) fn default_ram_mib(cpus: u8) -> u64 {
    let mut ram = 64 * (u64::from(cpus) + 3);
    let available = (host_ram_size_mib() as f64 * RAM_SIZE_RATIO) as u64;
    let available = if available == 0 {
        MIN_RAM_SIZE_MB
    } else {
        available
    };
    if ram > available {
        ram = available;
    }
    ram
}

fn uname_release() -> Option<String> {
    let mut uts: libc::utsname = unsafe { std::mem::zeroed() };
    // uname only fills the struct we pass.
    if unsafe { libc::uname(&mut uts) } != 0 {
        return None;
    }
    let release = unsafe { std::ffi::CStr::from_ptr(uts.release.as_ptr()) };
    Some(release.to_string_lossy().into_owned())
}

/// Kernel candidates in search order.
pub(crate) fn kernel_candidates() -> Vec<PathBuf> {
    let mut candidates = vec![
        PathBuf::from("./bzImage"),
        PathBuf::from("../../arch/x86/boot/bzImage"),
    ];
    if let Some(release) = uname_release() {
        candidates.push(PathBuf::from(format!("/boot/vmlinuz-{}", release)));
        candidates.push(PathBuf::from(format!("/boot/bzImage-{}", release)));
    }
    candidates
}

pub(crate) fn find_kernel() -> Result<PathBuf> {
    let candidates = kernel_candidates();
    for candidate in &candidates {
        if candidate.is_file() {
            return Ok(candidate.clone());
        }
    }
    Err(Error::KernelNotFound(candidates))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_builder() -> VMMConfigBuilder {
        VMMConfig::builder().kernel(Some(PathBuf::from("/boot/fake-kernel")))
    }

    #[test]
    fn zero_cpus_defaults_to_online_cpus() {
        let config = base_builder().cpus(0).build().unwrap();
        assert_eq!(u32::from(config.cpus), online_cpus().min(KVM_NR_CPUS));
    }

    #[test]
    fn too_many_cpus_is_rejected() {
        let err = base_builder().cpus(256).build().unwrap_err();
        assert!(err.to_string().contains("out of [1;255] range"));
    }

    #[test]
    fn memory_minimum_is_enforced() {
        let err = base_builder().memory_mib(63).build().unwrap_err();
        assert!(matches!(err, Error::NotEnoughMemory(63)));
        assert!(base_builder().memory_mib(64).build().is_ok());
    }

    #[test]
    fn default_memory_scales_with_cpus() {
        let config = base_builder().cpus(1).build().unwrap();
        assert!(config.memory_mib >= MIN_RAM_SIZE_MB);
        assert!(config.memory_mib <= 64 * 4);
    }

    #[test]
    fn default_name_carries_the_pid() {
        let config = base_builder().build().unwrap();
        assert_eq!(config.name, format!("guest-{}", std::process::id()));
    }

    #[test]
    fn disk_spec_parses_readonly_suffix() {
        assert_eq!(
            DiskSpec::parse("/path/root.img,ro"),
            DiskSpec::Image {
                path: PathBuf::from("/path/root.img"),
                read_only: true,
            }
        );
        assert_eq!(
            DiskSpec::parse("/path/root.img"),
            DiskSpec::Image {
                path: PathBuf::from("/path/root.img"),
                read_only: false,
            }
        );
    }

    #[test]
    fn disk_spec_detects_shared_directories() {
        assert!(matches!(
            DiskSpec::parse("/tmp"),
            DiskSpec::SharedRoot { .. }
        ));
    }

    #[test]
    fn net_spec_parses_the_usual_soup() {
        let spec =
            NetSpec::parse("mode=user,guest_ip=10.0.0.2,host_ip=10.0.0.1,guest_mac=02:aa:bb:cc:dd:ee,vhost=1")
                .unwrap();
        assert_eq!(spec.mode, NetMode::User);
        assert_eq!(spec.guest_ip, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(spec.host_ip, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(spec.guest_mac, [0x02, 0xaa, 0xbb, 0xcc, 0xdd, 0xee]);
        assert!(spec.guest_mac_explicit);
        assert!(spec.vhost);

        // A MAC the user did not set stays a bumpable default.
        let spec = NetSpec::parse("mode=user").unwrap();
        assert_eq!(spec.guest_mac, DEFAULT_GUEST_MAC);
        assert!(!spec.guest_mac_explicit);

        assert!(NetSpec::parse("mode=banana").is_err());
        assert!(NetSpec::parse("bogus").is_err());
    }

    #[test]
    fn p9_spec_needs_dir_and_tag() {
        let spec = P9Spec::parse("/srv/share,hostfs").unwrap();
        assert_eq!(spec.tag, "hostfs");
        assert!(P9Spec::parse("/srv/share").is_err());
    }

    #[test]
    fn cmdline_serial_with_block_root() {
        let config = base_builder()
            .disks(vec![DiskSpec::Image {
                path: PathBuf::from("root.img"),
                read_only: false,
            }])
            .build()
            .unwrap();
        let cmdline = config.build_cmdline();
        assert!(cmdline.starts_with(CMDLINE_BASE));
        assert!(cmdline.contains("console=ttyS0 earlyprintk=serial i8042.noaux=1"));
        assert!(cmdline.ends_with("root=/dev/vda rw"));
    }

    #[test]
    fn cmdline_framebuffer_and_9p_root() {
        let config = base_builder()
            .vnc(true)
            .disks(vec![DiskSpec::SharedRoot {
                dir: PathBuf::from("/srv/root"),
            }])
            .build()
            .unwrap();
        let cmdline = config.build_cmdline();
        assert!(cmdline.contains("console=tty0 video=vesafb"));
        assert!(cmdline.contains(
            "root=/dev/root rw rootflags=rw,trans=virtio,version=9p2000.L rootfstype=9p"
        ));
        assert!(cmdline.ends_with("ip=dhcp"));

        let config = base_builder()
            .no_dhcp(true)
            .disks(vec![DiskSpec::SharedRoot {
                dir: PathBuf::from("/srv/root"),
            }])
            .build()
            .unwrap();
        assert!(!config.build_cmdline().contains("ip=dhcp"));
    }

    #[test]
    fn user_params_ride_between_console_and_root() {
        let config = base_builder()
            .params(Some("loglevel=8".to_string()))
            .disks(vec![DiskSpec::Image {
                path: PathBuf::from("root.img"),
                read_only: false,
            }])
            .build()
            .unwrap();
        let cmdline = config.build_cmdline();
        let params_at = cmdline.find("loglevel=8").unwrap();
        let root_at = cmdline.find("root=/dev/vda").unwrap();
        assert!(params_at < root_at);
    }

    #[test]
    fn user_root_param_suppresses_the_default_root() {
        let config = base_builder()
            .params(Some("root=/dev/sda1".to_string()))
            .disks(vec![DiskSpec::Image {
                path: PathBuf::from("root.img"),
                read_only: false,
            }])
            .build()
            .unwrap();
        assert!(!config.build_cmdline().contains("/dev/vda"));
    }

    #[test]
    fn too_many_disks_is_rejected() {
        let disks = (0..5)
            .map(|i| DiskSpec::Image {
                path: PathBuf::from(format!("disk{}.img", i)),
                read_only: false,
            })
            .collect();
        assert!(matches!(
            base_builder().disks(disks).build(),
            Err(Error::TooManyDisks)
        ));
    }

    #[test]
    fn mac_parser_rejects_junk() {
        assert!(parse_mac("02:15:15:15:15:15").is_ok());
        assert!(parse_mac("02:15:15:15:15").is_err());
        assert!(parse_mac("02:15:15:15:15:zz").is_err());
        assert!(parse_mac("02:15:15:15:15:15:15").is_err());
    }
}
