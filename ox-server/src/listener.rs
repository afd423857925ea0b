// Copyright 2025 the oxserver authors
//
// SPDX-License-Identifier: MIT

//! Acquires the listening endpoint: either inherited from a supervisor via
//! the LISTEN_FDS convention, or bound to the well-known runtime path. A
//! path we bound ourselves is unlinked on drop; an inherited socket never
//! is.

use std::{
    os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd},
    os::unix::net::{UnixListener, UnixStream},
    path::{Path, PathBuf},
};

use nix::sys::socket::{bind, listen, socket, AddressFamily, Backlog, SockFlag, SockType, UnixAddr};
use tracing::{debug, info, warn};

pub const SOCKET_NAME: &str = "oxserver_ipc";

/// Accept backlog; also the most clients that can ever be waiting, since
/// only one is serviced at a time.
pub const MAX_CLIENTS: i32 = 8;

#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("supervisor passed {0} sockets, expected exactly 1")]
    TooManyInheritedSockets(usize),
    #[error("supervisor handoff requested, but no socket was passed")]
    NoInheritedSocket,
    #[error(
        "binding {path:?} failed: {source} (is another runtime server running, \
         or a supervisor socket unit active?)"
    )]
    Bind {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },
    #[error("listen on {path:?} failed: {source}")]
    Listen {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub struct Listener {
    inner: UnixListener,
    /// Set iff this process bound the path and owes it an unlink.
    bound_path: Option<PathBuf>,
}

impl Listener {
    /// Takes the supervisor's socket if one was passed, otherwise binds the
    /// well-known path. With `require_systemd` the fallback bind is
    /// disabled and a missing handoff is an error. More than one inherited
    /// socket is a configuration error either way.
    pub fn bootstrap(socket_path: &Path, require_systemd: bool) -> Result<Self, ListenerError> {
        let mut inherited = listenfd::ListenFd::from_env();
        match inherited.len() {
            0 if require_systemd => return Err(ListenerError::NoInheritedSocket),
            0 => {}
            1 => {
                let listener = inherited
                    .take_unix_listener(0)?
                    .ok_or(ListenerError::NoInheritedSocket)?;
                listener.set_nonblocking(true)?;

                info!("listening on inherited supervisor socket");
                return Ok(Self {
                    inner: listener,
                    bound_path: None,
                });
            }
            n => return Err(ListenerError::TooManyInheritedSockets(n)),
        }

        let listener = bind_path(socket_path)?;
        listener.set_nonblocking(true)?;

        info!(path = ?socket_path, "listening");
        Ok(Self {
            inner: listener,
            bound_path: Some(socket_path.to_owned()),
        })
    }

    pub fn launched_by_socket(&self) -> bool {
        self.bound_path.is_none()
    }

    /// Non-blocking accept. Returns None once the pending queue is drained.
    pub fn accept(&self) -> std::io::Result<Option<UnixStream>> {
        match self.inner.accept() {
            Ok((stream, _)) => Ok(Some(stream)),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl AsFd for Listener {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.as_fd()
    }
}

impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(path) = self.bound_path.take() {
            debug!(?path, "removing socket");
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(?path, "failed to remove socket: {e}");
            }
        }
    }
}

/// bind + listen with an explicit backlog, which std's UnixListener does
/// not expose.
fn bind_path(path: &Path) -> Result<UnixListener, ListenerError> {
    let sock = socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::SOCK_CLOEXEC,
        None,
    )
    .map_err(|e| ListenerError::Bind {
        path: path.to_owned(),
        source: e,
    })?;

    let addr = UnixAddr::new(path).map_err(|e| ListenerError::Bind {
        path: path.to_owned(),
        source: e,
    })?;

    bind(sock.as_raw_fd(), &addr).map_err(|e| ListenerError::Bind {
        path: path.to_owned(),
        source: e,
    })?;

    listen(&sock, Backlog::new(MAX_CLIENTS).expect("backlog in range")).map_err(|e| {
        ListenerError::Listen {
            path: path.to_owned(),
            source: e,
        }
    })?;

    Ok(UnixListener::from(OwnedFd::from(sock)))
}
