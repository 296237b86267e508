//! Task I/O multiplexer and console wire protocol.
//!
//! Grounded on `console/server.py`/`console/client.py`/`tasks/__init__.py`'s
//! `TaskIO`: every task owns pipes for output and log records, a journal
//! file, and a Unix stream socket that live subscribers attach to. A
//! dispatcher thread fans frames out to every attached subscriber and to
//! the journal, replaying the journal from byte 0 to a newly attached
//! subscriber before it sees anything new — matching `spec.md` §4.8 and the
//! E4 scenario. Framing and concurrency follow `wire.rs`'s `ConsoleFrame`
//! DTO and the blocking-I/O-with-timeout idiom used throughout this crate
//! (`timer.rs`'s condvar wait, `containers.rs`'s `duct::cmd` blocking runs).

use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display("unable to create console socket at {path:?}: {source}"))]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("unable to create journal file {path:?}: {source}"))]
    Journal {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("unable to write console frame: {source}"))]
    Write { source: std::io::Error },

    #[snafu(display("unable to read console frame: {source}"))]
    Read { source: std::io::Error },

    #[snafu(display("truncated console frame"))]
    Truncated,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Frame command codes, per `spec.md` §6.1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum FrameKind {
    Log = 0,
    Bytes = 1,
    RawEnable = 2,
    RawDisable = 3,
    Winch = 4,
}

impl FrameKind {
    fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(FrameKind::Log),
            1 => Some(FrameKind::Bytes),
            2 => Some(FrameKind::RawEnable),
            3 => Some(FrameKind::RawDisable),
            4 => Some(FrameKind::Winch),
            _ => None,
        }
    }
}

/// One `cmd:u16_le, size:u32_le, payload:size bytes` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn log(level: u8, message: &str) -> Self {
        Frame {
            kind: FrameKind::Log,
            payload: format!("{level}:{message}").into_bytes(),
        }
    }

    pub fn bytes(data: Vec<u8>) -> Self {
        Frame {
            kind: FrameKind::Bytes,
            payload: data,
        }
    }

    pub fn raw_enable() -> Self {
        Frame {
            kind: FrameKind::RawEnable,
            payload: Vec::new(),
        }
    }

    pub fn raw_disable() -> Self {
        Frame {
            kind: FrameKind::RawDisable,
            payload: Vec::new(),
        }
    }

    pub fn winch(rows: u16, cols: u16) -> Self {
        let mut payload = Vec::with_capacity(4);
        payload.extend_from_slice(&rows.to_le_bytes());
        payload.extend_from_slice(&cols.to_le_bytes());
        Frame {
            kind: FrameKind::Winch,
            payload,
        }
    }

    pub fn write_to(&self, writer: &mut impl Write) -> Result<()> {
        writer.write_all(&(self.kind as u16).to_le_bytes()).context(WriteSnafu)?;
        writer
            .write_all(&(self.payload.len() as u32).to_le_bytes())
            .context(WriteSnafu)?;
        writer.write_all(&self.payload).context(WriteSnafu)?;
        Ok(())
    }

    pub fn read_from(reader: &mut impl Read) -> Result<Self> {
        let mut cmd_buf = [0u8; 2];
        reader.read_exact(&mut cmd_buf).context(ReadSnafu)?;
        let cmd = u16::from_le_bytes(cmd_buf);
        let kind = FrameKind::from_u16(cmd).ok_or(Error::Truncated)?;

        let mut size_buf = [0u8; 4];
        reader.read_exact(&mut size_buf).context(ReadSnafu)?;
        let size = u32::from_le_bytes(size_buf) as usize;

        let mut payload = vec![0u8; size];
        reader.read_exact(&mut payload).context(ReadSnafu)?;
        Ok(Frame { kind, payload })
    }
}

/// Appends frames to a journal file and replays it to new subscribers;
/// broadcasts frames to every attached subscriber socket.
struct Subscribers {
    streams: Vec<UnixStream>,
}

/// Per-task I/O multiplexer: owns the journal and socket, and serializes
/// every outbound frame through a single writer so subscribers always see
/// a consistent total order (`spec.md` §5 ordering guarantees).
pub struct TaskIo {
    journal_path: PathBuf,
    journal: Mutex<std::fs::File>,
    subscribers: Mutex<Subscribers>,
    socket_path: PathBuf,
    running: Arc<AtomicBool>,
}

impl TaskIo {
    pub fn open(workspace: &Path) -> Result<Self> {
        let journal_path = workspace.join("task.journal");
        let journal = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&journal_path)
            .context(JournalSnafu { path: journal_path.clone() })?;
        let socket_path = workspace.join("console.sock");
        if socket_path.exists() {
            let _ = std::fs::remove_file(&socket_path);
        }
        Ok(TaskIo {
            journal_path,
            journal: Mutex::new(journal),
            subscribers: Mutex::new(Subscribers { streams: Vec::new() }),
            socket_path,
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Write a frame to the journal then broadcast it to every currently
    /// attached subscriber, serialized by this single call holding both
    /// locks for its duration — the dispatcher is this method's only
    /// caller, so there is exactly one writer.
    pub fn dispatch(&self, frame: &Frame) -> Result<()> {
        {
            let mut journal = self.journal.lock().unwrap();
            frame.write_to(&mut *journal).context(WriteSnafu)?;
            journal.flush().context(WriteSnafu)?;
        }
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.streams.retain_mut(|stream| frame.write_to(stream).is_ok());
        Ok(())
    }

    /// Accept one subscriber: replay the whole journal from byte 0 (the
    /// writer has already flushed by the time `dispatch` returns, so a
    /// fresh read sees everything written so far), then register it for
    /// future broadcasts.
    pub fn accept_subscriber(&self, mut stream: UnixStream) -> Result<()> {
        {
            let mut journal_reader = std::fs::File::open(&self.journal_path).context(JournalSnafu {
                path: self.journal_path.clone(),
            })?;
            std::io::copy(&mut journal_reader, &mut stream).context(WriteSnafu)?;
        }
        self.subscribers.lock().unwrap().streams.push(stream);
        Ok(())
    }

    pub fn listener(&self) -> Result<UnixListener> {
        UnixListener::bind(&self.socket_path).context(BindSnafu {
            path: self.socket_path.clone(),
        })
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn running(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    pub fn close(&self) {
        self.stop();
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

/// Runs the accept loop for a task's console socket on its own thread,
/// polling the stop flag with a short timeout so it notices task
/// completion promptly without busy-looping, mirroring the original's
/// epoll-with-timeout dispatcher.
pub fn spawn_acceptor(io: Arc<TaskIo>) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let listener = match io.listener() {
            Ok(listener) => listener,
            Err(err) => {
                log::warn!("unable to bind console socket: {err}");
                return;
            }
        };
        listener
            .set_nonblocking(true)
            .expect("console socket supports nonblocking mode");
        let running = io.running();
        while running.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, _)) => {
                    if let Err(err) = io.accept_subscriber(stream) {
                        log::warn!("unable to accept console subscriber: {err}");
                    }
                }
                Err(ref err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(200));
                }
                Err(err) => {
                    log::warn!("console socket accept error: {err}");
                    break;
                }
            }
        }
    })
}

/// Renders frames read from a live socket or an archived journal to a
/// terminal, matching `console/client.py`'s renderer: `BYTES` frames go to
/// stdout unchanged, `LOG` frames through a level-prefixed formatter, and a
/// log line starting with `Task failed`/`Task succeeded` ends the stream.
pub struct ClientRenderer;

impl ClientRenderer {
    /// Returns `true` once an end-of-stream marker has been rendered.
    pub fn render(frame: &Frame, out: &mut impl Write) -> std::io::Result<bool> {
        match frame.kind {
            FrameKind::Bytes => {
                out.write_all(&frame.payload)?;
                out.flush()?;
                Ok(false)
            }
            FrameKind::Log => {
                let text = String::from_utf8_lossy(&frame.payload);
                let (level, message) = text.split_once(':').unwrap_or(("20", &text));
                writeln!(out, "[{}] {}", level_label(level), message)?;
                Ok(message.starts_with("Task failed") || message.starts_with("Task succeeded"))
            }
            FrameKind::RawEnable | FrameKind::RawDisable | FrameKind::Winch => Ok(false),
        }
    }

    pub fn render_stream(mut reader: impl Read, mut out: impl Write) -> std::io::Result<()> {
        loop {
            let frame = match Frame::read_from(&mut reader) {
                Ok(frame) => frame,
                Err(Error::Read { source }) if source.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(err) => return Err(std::io::Error::new(std::io::ErrorKind::Other, err.to_string())),
            };
            if Self::render(&frame, &mut out)? {
                return Ok(());
            }
        }
    }
}

fn level_label(level: &str) -> &'static str {
    match level.parse::<u8>().unwrap_or(20) {
        40 => "ERROR",
        30 => "WARN",
        20 => "INFO",
        _ => "DEBUG",
    }
}

/// Interactive PTY-attached subprocess handling, per `spec.md` §4.8's
/// "interactive subprocess" paragraph. Requires `forkpty`/`TIOCSWINSZ`, so
/// it is behind a feature flag per the spec's design note; the
/// non-interactive path above does not depend on it.
#[cfg(feature = "interactive-console")]
pub mod interactive {
    use super::*;
    use nix::pty::{openpty, Winsize};
    use nix::unistd::{read, write};
    use std::os::fd::{AsRawFd, OwnedFd};
    use std::os::unix::process::CommandExt;

    /// Runs `command` attached to a PTY, streaming its output as `BYTES`
    /// frames through `io` and feeding inbound `BYTES` frames from
    /// `inbound` to the child's stdin, until the child exits.
    pub fn run_interactive(
        io: &TaskIo,
        command: &mut std::process::Command,
        inbound: std::sync::mpsc::Receiver<Frame>,
    ) -> std::io::Result<i32> {
        let pty = openpty(None, None)?;
        let master: OwnedFd = pty.master;
        let slave: OwnedFd = pty.slave;

        io.dispatch(&Frame::raw_enable())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;

        unsafe {
            command.pre_exec(move || {
                nix::unistd::setsid().ok();
                let fd = slave.as_raw_fd();
                nix::libc::ioctl(fd, nix::libc::TIOCSCTTY as _, 0);
                nix::unistd::dup2(fd, 0)?;
                nix::unistd::dup2(fd, 1)?;
                nix::unistd::dup2(fd, 2)?;
                Ok(())
            });
        }
        let mut child = command.spawn()?;

        let master_fd = master.as_raw_fd();
        let io_reader = io;
        let reader_handle = std::thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match read(master_fd, &mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if io_reader.dispatch(&Frame::bytes(buf[..n].to_vec())).is_err() {
                            break;
                        }
                    }
                }
            }
        });

        while let Ok(frame) = inbound.recv() {
            match frame.kind {
                FrameKind::Bytes => {
                    let _ = write(master_fd, &frame.payload);
                }
                FrameKind::Winch => {
                    if frame.payload.len() == 4 {
                        let rows = u16::from_le_bytes([frame.payload[0], frame.payload[1]]);
                        let cols = u16::from_le_bytes([frame.payload[2], frame.payload[3]]);
                        let winsize = Winsize {
                            ws_row: rows,
                            ws_col: cols,
                            ws_xpixel: 0,
                            ws_ypixel: 0,
                        };
                        unsafe {
                            nix::libc::ioctl(master_fd, nix::libc::TIOCSWINSZ as _, &winsize);
                        }
                    }
                }
                _ => {}
            }
        }

        let status = child.wait()?;
        let _ = reader_handle.join();
        io.dispatch(&Frame::raw_disable())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        Ok(status.code().unwrap_or(-1))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn frame_roundtrips_through_write_and_read() {
        let frame = Frame::log(30, "disk almost full");
        let mut buf = Vec::new();
        frame.write_to(&mut buf).unwrap();
        let restored = Frame::read_from(&mut buf.as_slice()).unwrap();
        assert_eq!(restored, frame);
    }

    #[test]
    fn winch_frame_encodes_rows_and_cols_little_endian() {
        let frame = Frame::winch(24, 80);
        assert_eq!(frame.payload, vec![24, 0, 80, 0]);
    }

    #[test]
    fn journal_replay_then_live_frame_preserves_order() {
        let tmp = tempfile::tempdir().unwrap();
        let io = TaskIo::open(tmp.path()).unwrap();
        io.dispatch(&Frame::log(20, "first")).unwrap();
        io.dispatch(&Frame::bytes(b"hello".to_vec())).unwrap();

        let (client, server) = UnixStream::pair().unwrap();
        io.accept_subscriber(server).unwrap();
        io.dispatch(&Frame::log(20, "second")).unwrap();
        drop(io);

        let mut received = Vec::new();
        let mut reader = client;
        while let Ok(frame) = Frame::read_from(&mut reader) {
            received.push(frame);
        }
        assert_eq!(received.len(), 3);
        assert_eq!(received[2].payload, b"20:second".to_vec());
    }

    #[test]
    fn client_renderer_flags_task_succeeded_as_end_of_stream() {
        let frame = Frame::log(20, "Task succeeded");
        let mut out = Vec::new();
        assert!(ClientRenderer::render(&frame, &mut out).unwrap());
    }
}
