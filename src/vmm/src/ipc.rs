// SPDX-License-Identifier: Apache-2.0

//! Per-instance control channel.
//!
//! A unix socket under `~/.kvmbox/` accepts framed messages
//! `{type: u32, len: u32, body}` and drives the running monitor: pause and
//! resume the guest, stop it, or collect a per-vCPU debug dump.

use std::fs;
use std::io::{self, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;

use log::{info, warn};

pub const IPC_PAUSE: u32 = 1;
pub const IPC_RESUME: u32 = 2;
pub const IPC_STOP: u32 = 3;
pub const IPC_DEBUG: u32 = 4;

/// Longest body any known message carries.
const MAX_BODY: u32 = 4096;

/// What the monitor does when a message arrives.
pub trait ControlHandler: Send + Sync {
    fn pause(&self);
    fn resume(&self);
    fn stop(&self);
    /// Dump state to the connection that asked.
    fn debug(&self, out: Box<dyn Write + Send>);
}

fn runtime_dir() -> io::Result<PathBuf> {
    let home = std::env::var_os("HOME").ok_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, "HOME is not set")
    })?;
    let dir = PathBuf::from(home).join(".kvmbox");
    fs::create_dir_all(&dir)?;
    Ok(dir)
}

pub fn socket_path(name: &str) -> io::Result<PathBuf> {
    Ok(runtime_dir()?.join(format!("{}.sock", name)))
}

pub struct ControlServer {
    path: PathBuf,
}

impl ControlServer {
    /// Bind the instance socket and serve it from its own thread.
    pub fn spawn(name: &str, handler: Arc<dyn ControlHandler>) -> io::Result<ControlServer> {
        let path = socket_path(name)?;
        let _ = fs::remove_file(&path);
        let listener = UnixListener::bind(&path)?;

        thread::Builder::new()
            .name("control".to_string())
            .spawn(move || {
                for stream in listener.incoming() {
                    match stream {
                        Ok(stream) => {
                            if let Err(e) = serve_connection(stream, &handler) {
                                if e.kind() != io::ErrorKind::UnexpectedEof {
                                    warn!("control connection error: {}", e);
                                }
                            }
                        }
                        Err(e) => {
                            warn!("control accept failed: {}", e);
                            return;
                        }
                    }
                }
            })?;

        Ok(ControlServer { path })
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn serve_connection(mut stream: UnixStream, handler: &Arc<dyn ControlHandler>) -> io::Result<()> {
    loop {
        let mut header = [0u8; 8];
        stream.read_exact(&mut header)?;
        let msg_type = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if len > MAX_BODY {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "oversized control message",
            ));
        }
        let mut body = vec![0u8; len as usize];
        stream.read_exact(&mut body)?;

        match msg_type {
            IPC_PAUSE => handler.pause(),
            IPC_RESUME => handler.resume(),
            IPC_STOP => {
                handler.stop();
                return Ok(());
            }
            IPC_DEBUG => {
                handler.debug(Box::new(stream.try_clone()?));
                return Ok(());
            }
            other => {
                info!("ignoring unknown control message type {}", other);
            }
        }
    }
}

/// Client side, used by the subcommands. For DEBUG the reply is everything
/// the monitor writes back before closing.
pub fn send_command(name: &str, msg_type: u32, body: &[u8]) -> io::Result<Vec<u8>> {
    let mut stream = UnixStream::connect(socket_path(name)?)?;
    stream.write_all(&msg_type.to_le_bytes())?;
    stream.write_all(&(body.len() as u32).to_le_bytes())?;
    stream.write_all(body)?;

    let mut reply = Vec::new();
    if msg_type == IPC_DEBUG {
        stream.read_to_end(&mut reply)?;
    }
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        pauses: AtomicUsize,
        resumes: AtomicUsize,
        stops: AtomicUsize,
    }

    impl ControlHandler for Recorder {
        fn pause(&self) {
            self.pauses.fetch_add(1, Ordering::SeqCst);
        }
        fn resume(&self) {
            self.resumes.fetch_add(1, Ordering::SeqCst);
        }
        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
        fn debug(&self, mut out: Box<dyn Write + Send>) {
            let _ = out.write_all(b"vcpu #0 dump");
        }
    }

    #[test]
    fn pause_resume_stop_roundtrip() {
        let name = format!("ipc-test-{}", std::process::id());
        let handler = Arc::new(Recorder::default());
        let _server = ControlServer::spawn(&name, handler.clone()).unwrap();

        send_command(&name, IPC_PAUSE, &[]).unwrap();
        send_command(&name, IPC_RESUME, &[]).unwrap();
        send_command(&name, IPC_STOP, &[]).unwrap();

        for _ in 0..100 {
            if handler.stops.load(Ordering::SeqCst) == 1 {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(handler.pauses.load(Ordering::SeqCst), 1);
        assert_eq!(handler.resumes.load(Ordering::SeqCst), 1);
        assert_eq!(handler.stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn debug_streams_the_dump_back() {
        let name = format!("ipc-dump-{}", std::process::id());
        let _server = ControlServer::spawn(&name, Arc::new(Recorder::default())).unwrap();

        let reply = send_command(&name, IPC_DEBUG, &[]).unwrap();
        assert_eq!(reply, b"vcpu #0 dump");
    }
}
