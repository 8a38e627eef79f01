//! Pseudo-terminal allocation and child-process lifecycle.
//!
//! Grounded on
//! `examples/other_examples/d68f26f1_bottlerocket-os-bottlerocket__sources-api-apiserver-src-server-exec-child.rs.rs`:
//! `nix::pty::openpty` to allocate the pty pair, `Command::pre_exec` calling
//! `libc::login_tty` to attach the slave as the child's controlling
//! terminal, and a blocking reader pumped via `spawn_blocking` since no
//! async-native fd type covers every supported platform.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};

use nix::pty::{openpty, OpenptyResult};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use tracing::{debug, warn};

/// Terminal window size, matching the `[cols, rows]` pair the broker sends
/// in an `open-terminal` instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for WindowSize {
    fn default() -> Self {
        WindowSize { cols: 80, rows: 24 }
    }
}

/// An owned PTY + child process bundle. All three resources (master fd,
/// slave fd, child pid) are released together, on every exit path, via
/// `Drop`.
pub struct PtyChild {
    master: OwnedFd,
    child: Child,
    closed: bool,
}

impl PtyChild {
    /// Spawn `command` attached to a freshly allocated pty. `user`/`group`
    /// switch the child's effective identity when given (requires running
    /// as root); `size` sets the initial window size.
    pub fn spawn(
        command: &str,
        user: Option<&str>,
        group: Option<&str>,
        size: WindowSize,
    ) -> anyhow::Result<PtyChild> {
        let OpenptyResult { master, slave } = openpty(None, None)?;
        set_window_size(&master, size)?;

        let mut parts = command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| anyhow::anyhow!("empty terminal command"))?;
        let mut cmd = Command::new(program);
        cmd.args(parts);

        if let Some(uid) = user.and_then(resolve_user) {
            cmd.uid(uid);
        }
        if let Some(gid) = group.and_then(resolve_group) {
            cmd.gid(gid);
        }

        let slave_fd = slave.as_raw_fd();
        // Safety: pre_exec runs in the forked child before exec, single
        // threaded; login_tty replaces fds 0/1/2 with the pty slave and
        // makes it the controlling terminal.
        unsafe {
            cmd.pre_exec(move || {
                nix::unistd::setsid().map_err(to_io_error)?;
                login_tty(slave_fd).map_err(to_io_error)?;
                Ok(())
            });
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());

        let child = cmd.spawn()?;
        drop(slave); // the child holds its own copy via login_tty; parent doesn't need it

        Ok(PtyChild {
            master,
            child,
            closed: false,
        })
    }

    pub fn master_fd(&self) -> RawFd {
        self.master.as_raw_fd()
    }

    pub fn pid(&self) -> i32 {
        self.child.id() as i32
    }

    /// Blocking read from the pty master. Retries on `EINTR`; treats `EIO`
    /// (the slave side has closed) as a clean end-of-file.
    pub fn read_master(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            match nix::unistd::read(self.master.as_raw_fd(), buf) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(nix::errno::Errno::EIO) => return Ok(0),
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Blocking write to the pty master.
    pub fn write_master(&self, data: &[u8]) -> std::io::Result<()> {
        let mut written = 0;
        while written < data.len() {
            match nix::unistd::write(&self.master, &data[written..]) {
                Ok(n) => written += n,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    pub fn resize(&self, size: WindowSize) -> anyhow::Result<()> {
        set_window_size(&self.master, size)
    }

    /// Idempotent. Sends SIGTERM, gives the child a short grace period,
    /// escalates to SIGKILL if still alive, then reaps it. A documented
    /// refinement of the original's unconditional SIGKILL.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let pid = Pid::from_raw(self.child.id() as i32);
        let _ = kill(pid, Signal::SIGTERM);
        let deadline = std::time::Instant::now() + std::time::Duration::from_millis(500);
        loop {
            match waitpid(pid, Some(nix::sys::wait::WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => {
                    if std::time::Instant::now() >= deadline {
                        let _ = kill(pid, Signal::SIGKILL);
                        let _ = waitpid(pid, None);
                        break;
                    }
                    std::thread::sleep(std::time::Duration::from_millis(20));
                }
                Ok(_) => break,
                Err(e) => {
                    warn!(error = %e, "waitpid failed while closing terminal child");
                    break;
                }
            }
        }
        debug!(pid = pid.as_raw(), "terminal child reaped");
    }
}

impl Drop for PtyChild {
    fn drop(&mut self) {
        self.close();
    }
}

fn set_window_size(fd: &OwnedFd, size: WindowSize) -> anyhow::Result<()> {
    let winsize = libc::winsize {
        ws_row: size.rows,
        ws_col: size.cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    let ret = unsafe { libc::ioctl(fd.as_raw_fd(), libc::TIOCSWINSZ, &winsize) };
    if ret != 0 {
        return Err(anyhow::anyhow!(std::io::Error::last_os_error()));
    }
    Ok(())
}

/// Make `slave_fd` the calling process's controlling terminal and duplicate
/// it onto stdin/stdout/stderr, matching `login_tty(3)`.
unsafe fn login_tty(slave_fd: RawFd) -> std::io::Result<()> {
    if libc::setsid() < 0 {
        // Already a session leader is fine; any other failure is not.
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EPERM) {
            return Err(err);
        }
    }
    if libc::ioctl(slave_fd, libc::TIOCSCTTY as _, 0) != 0 {
        return Err(std::io::Error::last_os_error());
    }
    for fd in 0..=2 {
        if libc::dup2(slave_fd, fd) < 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    if slave_fd > 2 {
        libc::close(slave_fd);
    }
    Ok(())
}

fn to_io_error(e: nix::Error) -> std::io::Error {
    e.into()
}

fn resolve_user(name: &str) -> Option<u32> {
    // SAFETY: getpwnam is not thread-safe in general, but this is called
    // once from a single-threaded pre_exec context.
    let cname = std::ffi::CString::new(name).ok()?;
    let pw = unsafe { libc::getpwnam(cname.as_ptr()) };
    if pw.is_null() {
        warn!(user = name, "unknown user, ignoring");
        return None;
    }
    Some(unsafe { (*pw).pw_uid })
}

fn resolve_group(name: &str) -> Option<u32> {
    let cname = std::ffi::CString::new(name).ok()?;
    let gr = unsafe { libc::getgrnam(cname.as_ptr()) };
    if gr.is_null() {
        warn!(group = name, "unknown group, ignoring");
        return None;
    }
    Some(unsafe { (*gr).gr_gid })
}
