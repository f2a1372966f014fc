// SPDX-License-Identifier: Apache-2.0

//! Virtio 9p filesystem device.
//!
//! A compact 9P2000.L server over one host directory: version, attach,
//! walk, open/create, read, write, readdir, getattr, statfs, readlink,
//! clunk and remove. Enough protocol for a shared (even root) filesystem;
//! everything fancier earns an Rlerror.

use std::collections::{BTreeMap, HashMap};
use std::ffi::CString;
use std::fs::{File, Metadata, OpenOptions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileExt, MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use kvm_ioctls::VmFd;
use log::warn;
use vm_memory::GuestMemoryMmap;

use crate::devices::irq::{IrqAllocator, IrqLine};
use crate::devices::pci::PciBus;
use crate::devices::registry::IoRegistry;
use crate::threadpool::{JobHandle, ThreadPool};

use super::queue::Virtqueue;
use super::{
    config_blob_read, pci, Error, Result, VirtioDevice, VirtioInterrupt,
    PCI_DEVICE_ID_VIRTIO_P9, VIRTIO_ID_9P,
};

pub const VIRTIO_P9_QUEUE_SIZE: u16 = 128;
/// Mount tag announced in the config space.
const VIRTIO_9P_MOUNT_TAG: u32 = 0;

const P9_MSIZE: u32 = 8192;

// 9P2000.L message types.
const TLERROR_R: u8 = 7;
const TSTATFS: u8 = 8;
const TLOPEN: u8 = 12;
const TLCREATE: u8 = 14;
const TREADLINK: u8 = 22;
const TGETATTR: u8 = 24;
const TREADDIR: u8 = 40;
const TVERSION: u8 = 100;
const TATTACH: u8 = 104;
const TWALK: u8 = 110;
const TREAD: u8 = 116;
const TWRITE: u8 = 118;
const TCLUNK: u8 = 120;
const TREMOVE: u8 = 122;

const QTDIR: u8 = 0x80;
const QTSYMLINK: u8 = 0x02;
const QTFILE: u8 = 0x00;

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn bytes(&mut self, n: usize) -> io::Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(io::Error::from_raw_os_error(libc::EPROTO));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn u8(&mut self) -> io::Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u16(&mut self) -> io::Result<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> io::Result<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> io::Result<u64> {
        let b = self.bytes(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn string(&mut self) -> io::Result<String> {
        let len = self.u16()? as usize;
        let raw = self.bytes(len)?;
        String::from_utf8(raw.to_vec()).map_err(|_| io::Error::from_raw_os_error(libc::EILSEQ))
    }
}

struct Builder {
    buf: Vec<u8>,
}

impl Builder {
    fn reply(rtype: u8, tag: u16) -> Self {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&[0, 0, 0, 0]); // size, patched in finish()
        buf.push(rtype);
        buf.extend_from_slice(&tag.to_le_bytes());
        Builder { buf }
    }

    fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    fn u16(&mut self, v: u16) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn u64(&mut self, v: u64) -> &mut Self {
        self.buf.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn string(&mut self, s: &str) -> &mut Self {
        self.u16(s.len() as u16);
        self.buf.extend_from_slice(s.as_bytes());
        self
    }

    fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    fn qid(&mut self, meta: &Metadata) -> &mut Self {
        let kind = if meta.is_dir() {
            QTDIR
        } else if meta.file_type().is_symlink() {
            QTSYMLINK
        } else {
            QTFILE
        };
        self.u8(kind);
        self.u32(0);
        self.u64(meta.ino())
    }

    fn finish(mut self) -> Vec<u8> {
        let size = (self.buf.len() as u32).to_le_bytes();
        self.buf[..4].copy_from_slice(&size);
        self.buf
    }
}

fn rlerror(tag: u16, errno: i32) -> Vec<u8> {
    let mut b = Builder::reply(TLERROR_R, tag);
    b.u32(errno as u32);
    b.finish()
}

struct Fid {
    path: PathBuf,
    file: Option<File>,
}

/// The filesystem half: one exported root, a fid table, one request at a
/// time (the queue is drained by a single job).
struct P9Server {
    root: PathBuf,
    msize: u32,
    fids: HashMap<u32, Fid>,
}

impl P9Server {
    fn new(root: PathBuf) -> Self {
        P9Server {
            root,
            msize: P9_MSIZE,
            fids: HashMap::new(),
        }
    }

    /// Resolve `name` under `base` without letting ".." out of the export.
    fn resolve(&self, base: &Path, name: &str) -> io::Result<PathBuf> {
        if name.contains('/') {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        let joined = match name {
            "." => base.to_path_buf(),
            ".." => {
                if base == self.root.as_path() {
                    base.to_path_buf()
                } else {
                    base.parent().unwrap_or(&self.root).to_path_buf()
                }
            }
            name => base.join(name),
        };
        if !joined.starts_with(&self.root) {
            return Err(io::Error::from_raw_os_error(libc::EACCES));
        }
        Ok(joined)
    }

    fn fid(&self, id: u32) -> io::Result<&Fid> {
        self.fids
            .get(&id)
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))
    }

    fn handle(&mut self, request: &[u8]) -> Vec<u8> {
        let mut r = Reader::new(request);
        let (_size, mtype, tag) = match (r.u32(), r.u8(), r.u16()) {
            (Ok(size), Ok(mtype), Ok(tag)) => (size, mtype, tag),
            _ => return rlerror(0, libc::EPROTO),
        };

        let reply = match mtype {
            TVERSION => self.version(&mut r, tag),
            TATTACH => self.attach(&mut r, tag),
            TWALK => self.walk(&mut r, tag),
            TLOPEN => self.lopen(&mut r, tag),
            TLCREATE => self.lcreate(&mut r, tag),
            TGETATTR => self.getattr(&mut r, tag),
            TREADDIR => self.readdir(&mut r, tag),
            TREAD => self.read(&mut r, tag),
            TWRITE => self.write(&mut r, tag),
            TREADLINK => self.readlink(&mut r, tag),
            TSTATFS => self.statfs(&mut r, tag),
            TCLUNK => self.clunk(&mut r, tag),
            TREMOVE => self.remove(&mut r, tag),
            other => {
                warn!("9p: unsupported message type {}", other);
                Err(io::Error::from_raw_os_error(libc::EOPNOTSUPP))
            }
        };

        match reply {
            Ok(reply) => reply,
            Err(e) => rlerror(tag, e.raw_os_error().unwrap_or(libc::EIO)),
        }
    }

    fn version(&mut self, r: &mut Reader, tag: u16) -> io::Result<Vec<u8>> {
        let msize = r.u32()?;
        let version = r.string()?;
        self.msize = msize.min(P9_MSIZE);
        self.fids.clear();

        let mut b = Builder::reply(TVERSION + 1, tag);
        b.u32(self.msize);
        if version == "9P2000.L" {
            b.string("9P2000.L");
        } else {
            b.string("unknown");
        }
        Ok(b.finish())
    }

    fn attach(&mut self, r: &mut Reader, tag: u16) -> io::Result<Vec<u8>> {
        let fid = r.u32()?;
        let _afid = r.u32()?;
        let _uname = r.string()?;
        let _aname = r.string()?;

        let meta = std::fs::metadata(&self.root)?;
        self.fids.insert(
            fid,
            Fid {
                path: self.root.clone(),
                file: None,
            },
        );
        let mut b = Builder::reply(TATTACH + 1, tag);
        b.qid(&meta);
        Ok(b.finish())
    }

    fn walk(&mut self, r: &mut Reader, tag: u16) -> io::Result<Vec<u8>> {
        let fid = r.u32()?;
        let newfid = r.u32()?;
        let nwname = r.u16()?;

        let mut path = self.fid(fid)?.path.clone();
        let mut qids = Vec::new();
        for _ in 0..nwname {
            let name = r.string()?;
            path = self.resolve(&path, &name)?;
            let meta = std::fs::symlink_metadata(&path)?;
            qids.push(meta);
        }

        self.fids.insert(
            newfid,
            Fid {
                path,
                file: None,
            },
        );

        let mut b = Builder::reply(TWALK + 1, tag);
        b.u16(qids.len() as u16);
        for meta in &qids {
            b.qid(meta);
        }
        Ok(b.finish())
    }

    fn lopen(&mut self, r: &mut Reader, tag: u16) -> io::Result<Vec<u8>> {
        let fid = r.u32()?;
        let flags = r.u32()?;

        let path = self.fid(fid)?.path.clone();
        let meta = std::fs::metadata(&path)?;
        if !meta.is_dir() {
            let file = OpenOptions::new()
                .read(flags & 0x3 != libc::O_WRONLY as u32)
                .write(flags & 0x3 != 0)
                .custom_flags((flags & !0x3) as i32 & !(libc::O_CREAT | libc::O_EXCL))
                .open(&path)?;
            if let Some(entry) = self.fids.get_mut(&fid) {
                entry.file = Some(file);
            }
        }

        let mut b = Builder::reply(TLOPEN + 1, tag);
        b.qid(&meta);
        b.u32(self.msize - 24); // iounit
        Ok(b.finish())
    }

    fn lcreate(&mut self, r: &mut Reader, tag: u16) -> io::Result<Vec<u8>> {
        let fid = r.u32()?;
        let name = r.string()?;
        let _flags = r.u32()?;
        let mode = r.u32()?;
        let _gid = r.u32()?;

        let dir = self.fid(fid)?.path.clone();
        let path = self.resolve(&dir, &name)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(mode)
            .open(&path)?;
        let meta = file.metadata()?;

        if let Some(entry) = self.fids.get_mut(&fid) {
            entry.path = path;
            entry.file = Some(file);
        }

        let mut b = Builder::reply(TLCREATE + 1, tag);
        b.qid(&meta);
        b.u32(self.msize - 24);
        Ok(b.finish())
    }

    fn getattr(&mut self, r: &mut Reader, tag: u16) -> io::Result<Vec<u8>> {
        let fid = r.u32()?;
        let _mask = r.u64()?;

        let path = &self.fid(fid)?.path;
        let meta = std::fs::symlink_metadata(path)?;

        let mut b = Builder::reply(TGETATTR + 1, tag);
        b.u64(0x0000_07ff); // P9_GETATTR_BASIC
        b.qid(&meta);
        b.u32(meta.mode());
        b.u32(meta.uid());
        b.u32(meta.gid());
        b.u64(meta.nlink());
        b.u64(meta.rdev());
        b.u64(meta.size());
        b.u64(4096); // blksize
        b.u64(meta.blocks());
        b.u64(meta.atime() as u64);
        b.u64(meta.atime_nsec() as u64);
        b.u64(meta.mtime() as u64);
        b.u64(meta.mtime_nsec() as u64);
        b.u64(meta.ctime() as u64);
        b.u64(meta.ctime_nsec() as u64);
        // btime, gen, data_version: not provided.
        b.u64(0).u64(0).u64(0).u64(0);
        Ok(b.finish())
    }

    fn readdir(&mut self, r: &mut Reader, tag: u16) -> io::Result<Vec<u8>> {
        let fid = r.u32()?;
        let offset = r.u64()?;
        let count = r.u32()?;

        let dir = self.fid(fid)?.path.clone();
        let mut names: BTreeMap<String, Metadata> = BTreeMap::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            names.insert(
                entry.file_name().to_string_lossy().into_owned(),
                entry.metadata()?,
            );
        }

        let mut b = Builder::reply(TREADDIR + 1, tag);
        let mut data = Vec::new();
        for (index, (name, meta)) in names.iter().enumerate() {
            let index = index as u64 + 1;
            if index <= offset {
                continue;
            }
            let mut entry = Builder {
                buf: Vec::with_capacity(32),
            };
            entry.qid(meta);
            entry.u64(index); // offset of the next entry
            entry.u8(if meta.is_dir() { libc::DT_DIR } else { libc::DT_REG });
            entry.string(name);
            if data.len() + entry.buf.len() > count as usize {
                break;
            }
            data.extend_from_slice(&entry.buf);
        }
        b.u32(data.len() as u32);
        b.raw(&data);
        Ok(b.finish())
    }

    fn read(&mut self, r: &mut Reader, tag: u16) -> io::Result<Vec<u8>> {
        let fid = r.u32()?;
        let offset = r.u64()?;
        let count = r.u32()?.min(self.msize - 24);

        let entry = self.fid(fid)?;
        let file = entry
            .file
            .as_ref()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))?;
        let mut data = vec![0u8; count as usize];
        let n = file.read_at(&mut data, offset)?;

        let mut b = Builder::reply(TREAD + 1, tag);
        b.u32(n as u32);
        b.raw(&data[..n]);
        Ok(b.finish())
    }

    fn write(&mut self, r: &mut Reader, tag: u16) -> io::Result<Vec<u8>> {
        let fid = r.u32()?;
        let offset = r.u64()?;
        let count = r.u32()?;
        let data = r.bytes(count as usize)?;

        let entry = self.fid(fid)?;
        let file = entry
            .file
            .as_ref()
            .ok_or_else(|| io::Error::from_raw_os_error(libc::EBADF))?;
        let n = file.write_at(data, offset)?;

        let mut b = Builder::reply(TWRITE + 1, tag);
        b.u32(n as u32);
        Ok(b.finish())
    }

    fn readlink(&mut self, r: &mut Reader, tag: u16) -> io::Result<Vec<u8>> {
        let fid = r.u32()?;
        let target = std::fs::read_link(&self.fid(fid)?.path)?;
        let mut b = Builder::reply(TREADLINK + 1, tag);
        b.string(&target.to_string_lossy());
        Ok(b.finish())
    }

    fn statfs(&mut self, r: &mut Reader, tag: u16) -> io::Result<Vec<u8>> {
        let fid = r.u32()?;
        let path = CString::new(self.fid(fid)?.path.as_os_str().as_bytes())
            .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;

        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        // Safe: the path is NUL terminated and stat is a plain out struct.
        if unsafe { libc::statvfs(path.as_ptr(), &mut stat) } < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut b = Builder::reply(TSTATFS + 1, tag);
        b.u32(0x0102_1997); // V9FS_MAGIC
        b.u32(stat.f_bsize as u32);
        b.u64(stat.f_blocks);
        b.u64(stat.f_bfree);
        b.u64(stat.f_bavail);
        b.u64(stat.f_files);
        b.u64(stat.f_ffree);
        b.u64(0); // fsid
        b.u32(stat.f_namemax as u32);
        Ok(b.finish())
    }

    fn clunk(&mut self, r: &mut Reader, tag: u16) -> io::Result<Vec<u8>> {
        let fid = r.u32()?;
        self.fids.remove(&fid);
        Ok(Builder::reply(TCLUNK + 1, tag).finish())
    }

    fn remove(&mut self, r: &mut Reader, tag: u16) -> io::Result<Vec<u8>> {
        let fid = r.u32()?;
        let path = self.fid(fid)?.path.clone();
        self.fids.remove(&fid);
        if std::fs::metadata(&path)?.is_dir() {
            std::fs::remove_dir(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
        Ok(Builder::reply(TREMOVE + 1, tag).finish())
    }
}

pub struct P9 {
    guest_memory: Arc<GuestMemoryMmap>,
    intr: VirtioInterrupt,
    vq: Virtqueue,
    server: P9Server,
    config: Vec<u8>,
    guest_features: u32,
    pool: Option<Arc<ThreadPool>>,
    job: Option<JobHandle>,
}

impl P9 {
    pub fn new(
        guest_memory: Arc<GuestMemoryMmap>,
        intr: VirtioInterrupt,
        root: PathBuf,
        tag: &str,
    ) -> Result<Self> {
        let mut config = Vec::with_capacity(2 + tag.len());
        config.extend_from_slice(&(tag.len() as u16).to_le_bytes());
        config.extend_from_slice(tag.as_bytes());

        Ok(P9 {
            guest_memory,
            intr,
            vq: Virtqueue::new(VIRTIO_P9_QUEUE_SIZE)?,
            server: P9Server::new(root),
            config,
            guest_features: 0,
            pool: None,
            job: None,
        })
    }
}

/// Serve every pending 9p request. Runs as a threadpool job.
pub(crate) fn process_queue(p9: &Arc<Mutex<P9>>) {
    let (mem, intr) = {
        let locked = p9.lock().unwrap();
        (locked.guest_memory.clone(), locked.intr.clone())
    };

    loop {
        let chain = match p9.lock().unwrap().vq.pop(&mem) {
            Some(chain) => chain,
            None => break,
        };

        let request = match chain.read_out(&mem) {
            Ok(request) => request,
            Err(e) => {
                warn!("9p request unreadable: {}", e);
                p9.lock().unwrap().vq.add_used(&mem, chain.head_index, 0);
                continue;
            }
        };

        let reply = p9.lock().unwrap().server.handle(&request);
        let written = chain.write_in(&mem, &reply).unwrap_or(0);

        let mut locked = p9.lock().unwrap();
        locked.vq.add_used(&mem, chain.head_index, written);
        if locked.vq.needs_notification(&mem) {
            intr.signal_vring();
        }
    }
}

impl VirtioDevice for P9 {
    fn host_features(&self) -> u32 {
        1 << VIRTIO_9P_MOUNT_TAG
    }

    fn set_guest_features(&mut self, features: u32) {
        self.guest_features = features;
    }

    fn config_read(&self, offset: u64, data: &mut [u8]) {
        config_blob_read(&self.config, offset, data);
    }

    fn config_write(&mut self, _offset: u64, _data: &[u8]) {}

    fn num_queues(&self) -> u16 {
        1
    }

    fn queue_max_size(&self, _index: u16) -> u16 {
        VIRTIO_P9_QUEUE_SIZE
    }

    fn init_queue(&mut self, index: u16, pfn: u32) -> Result<()> {
        if index != 0 {
            return Err(Error::BadQueueIndex(index));
        }
        let mem = self.guest_memory.clone();
        self.vq.bind(pfn, &mem)
    }

    fn queue_pfn(&self, index: u16) -> u32 {
        if index == 0 {
            self.vq.pfn()
        } else {
            0
        }
    }

    fn notify_queue(&mut self, index: u16) {
        if index != 0 {
            warn!("notify for bogus 9p queue {}", index);
            return;
        }
        if let (Some(pool), Some(job)) = (&self.pool, &self.job) {
            pool.do_job(job);
        }
    }

    fn reset(&mut self) {
        self.vq.reset();
        self.guest_features = 0;
    }
}

/// Export `root` under `tag` and put the device on the buses.
pub fn install(
    io_registry: &mut IoRegistry,
    pci_bus: &Arc<Mutex<PciBus>>,
    irq_alloc: &mut IrqAllocator,
    vm_fd: &Arc<VmFd>,
    guest_memory: Arc<GuestMemoryMmap>,
    pool: &Arc<ThreadPool>,
    root: PathBuf,
    tag: &str,
) -> Result<()> {
    let root = root.canonicalize().map_err(|source| Error::Backend {
        device: "9p",
        source,
    })?;

    let assigned = irq_alloc.register_device()?;
    let intr = VirtioInterrupt::new(IrqLine::new(vm_fd.clone(), assigned.line));

    let p9 = Arc::new(Mutex::new(P9::new(guest_memory, intr.clone(), root, tag)?));
    let job = {
        let p9 = p9.clone();
        pool.add_job(move || process_queue(&p9))
    };
    {
        let mut locked = p9.lock().unwrap();
        locked.pool = Some(pool.clone());
        locked.job = Some(job);
    }

    pci::attach(
        io_registry,
        pci_bus,
        &assigned,
        p9,
        intr,
        PCI_DEVICE_ID_VIRTIO_P9,
        VIRTIO_ID_9P,
        0x020000,
    )?;
    Ok(())
}
