use std::path::PathBuf;
use std::process::exit;

use clap::{Args, Parser, Subcommand};

use vmm::config::{ConsoleMode, DiskSpec, NetSpec, P9Spec, VMMConfig};
use vmm::{ipc, VMM};

#[derive(Parser)]
#[clap(version = "0.1", about = "Boot unmodified Linux kernels under KVM")]
struct Cli {
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a guest
    Run(RunArgs),
    /// Pause a running instance
    Pause { name: String },
    /// Resume a paused instance
    Resume { name: String },
    /// Stop an instance
    Stop { name: String },
    /// Collect per-vCPU state dumps from an instance
    Debug { name: String },
}

#[derive(Args)]
struct RunArgs {
    /// A name for the guest
    #[clap(long)]
    name: Option<String>,

    /// Number of CPUs (0 = all online CPUs)
    #[clap(short, long, default_value = "0")]
    cpus: u32,

    /// Virtual machine memory size in MiB (0 = derive from CPU count)
    #[clap(short, long, default_value = "0")]
    mem: u64,

    /// Disk image or rootfs directory, `path[,ro]`; up to four
    #[clap(short, long = "disk")]
    disk: Vec<String>,

    /// Kernel to boot in the virtual machine
    #[clap(short, long)]
    kernel: Option<PathBuf>,

    /// Initial RAM disk image
    #[clap(short, long)]
    initrd: Option<PathBuf>,

    /// Kernel command line arguments
    #[clap(short, long)]
    params: Option<String>,

    /// Create a guest NIC:
    /// `mode=tap|user|none,guest_ip=…,host_ip=…,guest_mac=…,script=…,vhost=0|1`
    #[clap(short, long = "network")]
    network: Vec<String>,

    /// Disable kernel DHCP in rootfs mode
    #[clap(long)]
    no_dhcp: bool,

    /// Enable virtio balloon
    #[clap(long)]
    balloon: bool,

    /// Enable virtio Random Number Generator
    #[clap(long)]
    rng: bool,

    /// Enable VNC framebuffer
    #[clap(long)]
    vnc: bool,

    /// Enable SDL framebuffer
    #[clap(long)]
    sdl: bool,

    /// Share a host directory with the guest: `dir,tag`
    #[clap(long = "9p")]
    p9: Vec<String>,

    /// Console to use: serial or virtio
    #[clap(long)]
    console: Option<String>,

    /// Enable debug messages
    #[clap(long)]
    debug: bool,

    /// Enable single stepping
    #[clap(long)]
    debug_single_step: bool,

    /// Enable ioport debugging
    #[clap(long)]
    debug_ioport: bool,

    /// Delay I/O by the given number of milliseconds
    #[clap(long, default_value = "0")]
    debug_iodelay: u64,
}

fn build_config(args: &RunArgs) -> Result<VMMConfig, vmm::config::Error> {
    let disks = args
        .disk
        .iter()
        .map(|arg| DiskSpec::parse(arg))
        .collect::<Vec<_>>();

    let mut nets = Vec::new();
    for spec in &args.network {
        nets.push(NetSpec::parse(spec)?);
    }

    let mut p9_shares = Vec::new();
    for spec in &args.p9 {
        p9_shares.push(P9Spec::parse(spec)?);
    }

    let console = match &args.console {
        Some(value) => Some(value.parse::<ConsoleMode>()?),
        None => None,
    };

    VMMConfig::builder()
        .name(args.name.clone())
        .cpus(args.cpus)
        .memory_mib(args.mem)
        .kernel(args.kernel.clone())
        .initrd(args.initrd.clone())
        .params(args.params.clone())
        .disks(disks)
        .nets(nets)
        .no_dhcp(args.no_dhcp)
        .balloon(args.balloon)
        .rng(args.rng)
        .vnc(args.vnc)
        .sdl(args.sdl)
        .p9_shares(p9_shares)
        .console(console)
        .debug(args.debug)
        .single_step(args.debug_single_step)
        .ioport_debug(args.debug_ioport)
        .iodelay_ms(args.debug_iodelay)
        .build()
}

fn run(args: RunArgs) -> i32 {
    let config = match build_config(&args) {
        Ok(config) => config,
        Err(vmm::config::Error::KernelNotFound(searched)) => {
            eprintln!("Fatal: could not find default kernel image in:");
            for path in searched {
                eprintln!("\t{}", path.display());
            }
            eprintln!("\nPlease see 'kvmbox run --help' for more options.\n");
            return libc::EINVAL;
        }
        Err(e) => {
            eprintln!("Fatal: {}", e);
            return 1;
        }
    };

    let mut vmm = match VMM::new(config) {
        Ok(vmm) => vmm,
        Err(e) => {
            eprintln!("Fatal: {}", e);
            return 1;
        }
    };

    match vmm.run() {
        Ok(true) => {
            println!("\n  # KVM session ended normally.");
            0
        }
        Ok(false) => 1,
        Err(e) => {
            eprintln!("Fatal: {}", e);
            1
        }
    }
}

fn control(name: &str, msg_type: u32) -> i32 {
    match ipc::send_command(name, msg_type, &[]) {
        Ok(reply) => {
            if !reply.is_empty() {
                print!("{}", String::from_utf8_lossy(&reply));
            }
            0
        }
        Err(e) => {
            eprintln!("Failed to reach instance {}: {}", name, e);
            1
        }
    }
}

fn init_logger(debug: bool) {
    let level = if debug {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();
}

fn main() {
    let cli = Cli::parse();

    let code = match cli.command {
        Command::Run(args) => {
            init_logger(args.debug);
            run(args)
        }
        Command::Pause { name } => control(&name, ipc::IPC_PAUSE),
        Command::Resume { name } => control(&name, ipc::IPC_RESUME),
        Command::Stop { name } => control(&name, ipc::IPC_STOP),
        Command::Debug { name } => control(&name, ipc::IPC_DEBUG),
    };
    exit(code);
}
