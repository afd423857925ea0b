// Copyright 2025 the oxserver authors
//
// SPDX-License-Identifier: MIT

//! Level-triggered readiness over the listener and (when we own the
//! terminal) stdin. Polled with a zero timeout once per main-loop
//! iteration; the loop's pacing comes from the compositor, not from here.

use std::os::fd::AsRawFd;

use mio::unix::SourceFd;
use tracing::warn;

use crate::listener::Listener;

const LISTENER: mio::Token = mio::Token(0);
const STDIN: mio::Token = mio::Token(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    NewConnection,
    /// Stdin saw EOF or operator input.
    ShutdownRequested,
    /// The poll itself failed; the server treats this as fatal.
    Error(i32),
}

pub struct EventPoller {
    poll: mio::Poll,
    events: mio::Events,
    watch_stdin: bool,
}

impl EventPoller {
    /// Registers the listener, and stdin iff `watch_stdin` (i.e. we were
    /// not launched by a supervisor).
    pub fn new(listener: &Listener, watch_stdin: bool) -> std::io::Result<Self> {
        let poll = mio::Poll::new()?;

        poll.registry().register(
            &mut SourceFd(&listener.as_raw_fd()),
            LISTENER,
            mio::Interest::READABLE,
        )?;

        let mut watch_stdin = watch_stdin;
        if watch_stdin {
            if let Err(e) = poll.registry().register(
                &mut SourceFd(&libc::STDIN_FILENO),
                STDIN,
                mio::Interest::READABLE,
            ) {
                // Stdin may be a regular file or closed; shutdown then
                // comes from SIGINT only.
                warn!("stdin not pollable, disabling terminal shutdown: {e}");
                watch_stdin = false;
            }
        }

        Ok(Self {
            poll,
            events: mio::Events::with_capacity(8),
            watch_stdin,
        })
    }

    /// A single zero-timeout poll.
    pub fn poll(&mut self) -> Vec<Event> {
        match self
            .poll
            .poll(&mut self.events, Some(std::time::Duration::ZERO))
        {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => return Vec::new(),
            Err(e) => return vec![Event::Error(e.raw_os_error().unwrap_or(-1))],
        }

        let mut out = Vec::new();
        for event in self.events.iter() {
            match event.token() {
                LISTENER => out.push(Event::NewConnection),
                STDIN => {
                    if self.watch_stdin && stdin_wants_shutdown() {
                        out.push(Event::ShutdownRequested);
                    }
                }
                _ => unreachable!(),
            }
        }

        out
    }
}

/// Drains whatever is readable on stdin. EOF and input both mean quit.
fn stdin_wants_shutdown() -> bool {
    let mut buf = [0u8; 64];
    let n = unsafe { libc::read(libc::STDIN_FILENO, buf.as_mut_ptr() as *mut _, buf.len()) };

    // 0 is EOF; anything read is an operator keypress. A transient error
    // (EAGAIN after a level-triggered wakeup we lost a race on) is neither.
    n >= 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;

    #[test]
    fn listener_readiness() {
        let dir = mktemp::Temp::new_dir().unwrap();
        let path = dir.join(crate::listener::SOCKET_NAME);
        let listener = Listener::bootstrap(&path, false).unwrap();

        let mut poller = EventPoller::new(&listener, false).unwrap();
        assert!(poller.poll().is_empty());

        let _client = UnixStream::connect(&path).unwrap();

        // Level-triggered: the event stays up until we accept.
        let events = poller.poll();
        assert_eq!(events, vec![Event::NewConnection]);
        let events = poller.poll();
        assert_eq!(events, vec![Event::NewConnection]);

        listener.accept().unwrap().unwrap();
        assert!(poller.poll().is_empty());
    }
}
