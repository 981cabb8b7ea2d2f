//! Named-pipe transport for QMP.
//!
//! `-qmp pipe:<base>` makes QEMU read commands from `<base>.in` and write
//! replies and events to `<base>.out`. Opening a FIFO blocks until the peer
//! opens the other end, and that rendezvous is what orders the handshake.
//! Both of our ends are opened concurrently so QEMU may open its ends in
//! either order.

use crate::error::{HarnessError, Result};
use colored::Colorize;
use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

/// How often the rendezvous checks whether QEMU is still alive.
const RENDEZVOUS_POLL: Duration = Duration::from_millis(20);

/// The pair of monitor FIFOs. Removed on [`close`](Self::close) or drop.
#[derive(Debug)]
pub struct ControlChannel {
    base: PathBuf,
    command_path: PathBuf,
    reply_path: PathBuf,
    command_created: bool,
    reply_created: bool,
}

/// Our open ends of the channel.
pub struct ControlStreams {
    /// Host -> QEMU.
    pub commands: File,
    /// QEMU -> host.
    pub replies: BufReader<File>,
}

impl ControlChannel {
    /// Create `<base>.in` and `<base>.out`.
    ///
    /// Fails if either already exists. If only the first one could be made,
    /// it is removed again before returning.
    pub fn create(base: &Path) -> Result<Self> {
        let mut channel = Self {
            base: base.to_path_buf(),
            command_path: with_extension(base, "in"),
            reply_path: with_extension(base, "out"),
            command_created: false,
            reply_created: false,
        };

        mkfifo(&channel.command_path)?;
        channel.command_created = true;
        // On failure, dropping `channel` removes the command pipe
        mkfifo(&channel.reply_path)?;
        channel.reply_created = true;

        Ok(channel)
    }

    /// Base path handed to QEMU as `pipe:<base>`.
    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn command_path(&self) -> &Path {
        &self.command_path
    }

    pub fn reply_path(&self) -> &Path {
        &self.reply_path
    }

    /// Open our ends, blocking until QEMU has opened its ends.
    ///
    /// `peer_alive` is polled while waiting. Once it reports the peer gone,
    /// the pending opens are released and the rendezvous fails instead of
    /// blocking forever.
    pub fn connect<F>(&self, mut peer_alive: F) -> Result<ControlStreams>
    where
        F: FnMut() -> bool,
    {
        let (commands, replies, abandoned) = thread::scope(|s| {
            let commands = s.spawn(|| OpenOptions::new().write(true).open(&self.command_path));
            let replies = s.spawn(|| File::open(&self.reply_path));

            // Held until both openers are joined; an opener that only reaches
            // open() after the peer died still finds a partner.
            let mut stand_ins: Option<Vec<File>> = None;
            while !(commands.is_finished() && replies.is_finished()) {
                if stand_ins.is_none() && !peer_alive() {
                    stand_ins = Some(self.stand_in_peers());
                }
                thread::sleep(RENDEZVOUS_POLL);
            }
            let joined = (commands.join(), replies.join());
            (joined.0, joined.1, stand_ins.is_some())
        });

        if abandoned {
            return Err(HarnessError::transport(
                &self.base,
                "emulator exited before opening the control channel",
            ));
        }

        let commands = opened(commands, &self.command_path)?;
        let replies = opened(replies, &self.reply_path)?;
        Ok(ControlStreams {
            commands,
            replies: BufReader::new(replies),
        })
    }

    /// Open both FIFOs ourselves so pending and future opens of our ends
    /// complete.
    fn stand_in_peers(&self) -> Vec<File> {
        [&self.command_path, &self.reply_path]
            .into_iter()
            // O_RDWR on a FIFO never blocks on Linux
            .filter_map(|path| OpenOptions::new().read(true).write(true).open(path).ok())
            .collect()
    }

    /// Remove whichever pipes we created. Safe to call repeatedly; removal
    /// failures are reported but never propagated.
    pub fn close(&mut self) {
        if self.command_created {
            remove_pipe(&self.command_path);
            self.command_created = false;
        }
        if self.reply_created {
            remove_pipe(&self.reply_path);
            self.reply_created = false;
        }
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        self.close();
    }
}

fn with_extension(base: &Path, ext: &str) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(".");
    name.push(ext);
    PathBuf::from(name)
}

fn mkfifo(path: &Path) -> Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| HarnessError::transport(path, "path contains a NUL byte"))?;

    // SAFETY: `c_path` is a valid NUL-terminated string that outlives the call.
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600 as libc::mode_t) };
    if rc != 0 {
        let err = io::Error::last_os_error();
        let message = if err.kind() == io::ErrorKind::AlreadyExists {
            "already exists (left over from an earlier run?)".to_string()
        } else {
            format!("mkfifo failed: {}", err)
        };
        return Err(HarnessError::transport(path, message));
    }
    Ok(())
}

fn opened(joined: thread::Result<io::Result<File>>, path: &Path) -> Result<File> {
    match joined {
        Ok(Ok(file)) => Ok(file),
        Ok(Err(e)) => Err(HarnessError::transport(path, format!("open failed: {}", e))),
        Err(_) => Err(HarnessError::transport(path, "opener thread panicked")),
    }
}

fn remove_pipe(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => eprintln!(
            "{} failed to remove {}: {}",
            "warning:".yellow(),
            path.display(),
            e
        ),
    }
}
