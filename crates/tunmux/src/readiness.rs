//! Readiness worker for one non-blocking device descriptor.
//!
//! The device is registered edge-triggered in a private epoll set. A single
//! worker thread waits on it and hands "data may be available" to the one
//! reader that asked for it. The reader must arm the worker (`retry`) before
//! every wait on `ready`; the worker never re-enters `epoll_wait` on its own
//! after signalling, otherwise one edge would be reported forever.
//!
//! Shutdown needs a second descriptor: an eventfd registered level-triggered in
//! the same epoll set. Writing to it forces a parked `epoll_wait` to return.
//! The owner side only holds a `Weak` reference to it and upgrades it just
//! for the duration of a wake write. The worker closes the epoll descriptor;
//! the eventfd is closed by whichever side drops the last strong reference,
//! which is the owner only if the worker exits during that write.
//!
//! Teardown order (owner, then worker):
//!
//! 1. owner marks the device closed (done by [`Interface`](crate::Interface)),
//! 2. owner writes the wake value,
//! 3. owner drops the cancel sender,
//! 4. owner joins the worker; the worker, having observed 2 or 3, drops its
//!    channel ends, the eventfd and the epoll descriptor,
//! 5. owner closes the device.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, TryRecvError, bounded, select};
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};

/// epoll user data for the device descriptor.
const DEVICE_TOKEN: u64 = 0;

/// epoll user data for the wake eventfd.
const WAKE_TOKEN: u64 = 1;

/// One slot per registered descriptor.
const MAX_EVENTS: usize = 2;

/// Block in `epoll_wait` until an event occurs.
const EPOLL_TIMEOUT_MS: i32 = -1;

/// Worker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Waiting for a reader to ask for readiness, or for cancellation.
    Armed,
    /// Parked in `epoll_wait`.
    Waiting,
    /// Handing readiness to the reader.
    Signaling,
    /// Releasing the epoll set and the wake source.
    ShuttingDown,
    /// Terminal.
    Stopped,
}

/// Owner side of a running worker.
#[derive(Debug)]
pub(crate) struct Readiness {
    wake: Weak<OwnedFd>,
    cancel: Option<Sender<()>>,
    worker: Option<JoinHandle<()>>,
}

/// Reader side of a running worker.
#[derive(Debug)]
pub(crate) struct Consumer {
    retry: Sender<()>,
    ready: Receiver<()>,
}

/// Start a worker watching `fd` for readability.
///
/// `fd` must stay open until [`Readiness::shutdown`] has returned.
pub(crate) fn start(fd: RawFd, name: &str) -> Result<(Readiness, Consumer)> {
    let epoll = epoll_create()?;
    register(
        &epoll,
        fd,
        (libc::EPOLLIN | libc::EPOLLET) as u32,
        DEVICE_TOKEN,
        "registering device",
    )?;

    let wake = eventfd()?;
    register(
        &epoll,
        wake.as_raw_fd(),
        libc::EPOLLIN as u32,
        WAKE_TOKEN,
        "registering wake source",
    )?;
    let wake = Arc::new(wake);

    let (retry_tx, retry_rx) = bounded(0);
    let (ready_tx, ready_rx) = bounded(0);
    let (cancel_tx, cancel_rx) = bounded(0);

    let owner_wake = Arc::downgrade(&wake);
    let worker = Worker {
        state: State::Armed,
        epoll,
        wake,
        retry: retry_rx,
        ready: ready_tx,
        cancel: cancel_rx,
    };

    let handle = thread::Builder::new()
        .name(format!("tunmux-{name}"))
        .spawn(move || worker.run())
        .map_err(|source| Error::Readiness {
            operation: "spawning worker",
            source,
        })?;

    debug!(device = name, fd, "readiness worker started");

    Ok((
        Readiness {
            wake: owner_wake,
            cancel: Some(cancel_tx),
            worker: Some(handle),
        },
        Consumer {
            retry: retry_tx,
            ready: ready_rx,
        },
    ))
}

impl Readiness {
    /// Wake, cancel and join the worker.
    ///
    /// The device descriptor must not be closed before this returns.
    pub(crate) fn shutdown(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };

        self.wake();
        drop(self.cancel.take());

        if worker.join().is_err() {
            warn!("readiness worker panicked");
        }
    }

    /// Force a parked `epoll_wait` to return.
    fn wake(&self) {
        // A dead reference means the worker already released the eventfd and
        // is not waiting anymore. While upgraded, this may be the last strong
        // reference, in which case the eventfd closes here.
        let Some(wake) = self.wake.upgrade() else {
            return;
        };

        let value: u64 = 1;
        let ret = unsafe {
            libc::write(
                wake.as_raw_fd(),
                &value as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            trace!(error = %io::Error::last_os_error(), "wake write failed");
        }
    }
}

impl Drop for Readiness {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Consumer {
    /// Arm the worker and block until the device may be readable.
    ///
    /// Returns `false` once the worker has stopped.
    pub(crate) fn wait_ready(&self) -> bool {
        if self.retry.send(()).is_err() {
            return false;
        }
        self.ready.recv().is_ok()
    }
}

struct Worker {
    state: State,
    epoll: OwnedFd,
    wake: Arc<OwnedFd>,
    retry: Receiver<()>,
    ready: Sender<()>,
    cancel: Receiver<()>,
}

impl Worker {
    fn run(mut self) {
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

        loop {
            let next = match self.state {
                State::Armed => self.armed(),
                State::Waiting => self.waiting(&mut events),
                State::Signaling => self.signaling(),
                State::ShuttingDown => State::Stopped,
                State::Stopped => break,
            };
            trace!(from = ?self.state, to = ?next, "readiness transition");
            self.state = next;
        }

        self.release();
    }

    fn armed(&self) -> State {
        select! {
            recv(self.retry) -> msg => match msg {
                Ok(()) => State::Waiting,
                // The reader side is gone.
                Err(_) => State::ShuttingDown,
            },
            recv(self.cancel) -> _ => State::ShuttingDown,
        }
    }

    fn waiting(&self, events: &mut [libc::epoll_event; MAX_EVENTS]) -> State {
        let n = unsafe {
            libc::epoll_wait(
                self.epoll.as_raw_fd(),
                events.as_mut_ptr(),
                MAX_EVENTS as i32,
                EPOLL_TIMEOUT_MS,
            )
        };
        let err = (n < 0).then(io::Error::last_os_error);
        let ready = &events[..n.max(0) as usize];

        if !self.is_live(ready) {
            return State::ShuttingDown;
        }

        match err {
            Some(err) if err.kind() == io::ErrorKind::Interrupted => State::Waiting,
            Some(err) => {
                warn!(error = %err, "epoll_wait failed, stopping readiness worker");
                State::ShuttingDown
            }
            None if ready.is_empty() => State::Waiting,
            None => State::Signaling,
        }
    }

    fn signaling(&self) -> State {
        select! {
            send(self.ready, ()) -> res => match res {
                Ok(()) => State::Armed,
                Err(_) => State::ShuttingDown,
            },
            recv(self.cancel) -> _ => State::ShuttingDown,
        }
    }

    /// False once the owner has woken or cancelled the worker.
    fn is_live(&self, ready: &[libc::epoll_event]) -> bool {
        let woken = ready.iter().any(|event| {
            let token = event.u64;
            token == WAKE_TOKEN
        });
        let cancelled = !matches!(self.cancel.try_recv(), Err(TryRecvError::Empty));
        !(woken || cancelled)
    }

    fn release(self) {
        let Worker {
            epoll,
            wake,
            retry,
            ready,
            cancel,
            ..
        } = self;

        // Readers blocked on either channel observe end-of-stream.
        drop(ready);
        drop(retry);
        drop(cancel);
        drop(wake);
        drop(epoll);

        debug!("readiness worker stopped");
    }
}

fn epoll_create() -> Result<OwnedFd> {
    let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
    if fd < 0 {
        return Err(Error::last_readiness("creating epoll"));
    }
    // SAFETY: fd was just returned by epoll_create1() and is owned by nobody else.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn eventfd() -> Result<OwnedFd> {
    let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
    if fd < 0 {
        return Err(Error::last_readiness("creating wake source"));
    }
    // SAFETY: fd was just returned by eventfd() and is owned by nobody else.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn register(
    epoll: &OwnedFd,
    fd: RawFd,
    events: u32,
    token: u64,
    operation: &'static str,
) -> Result<()> {
    let mut event = libc::epoll_event { events, u64: token };
    let ret = unsafe { libc::epoll_ctl(epoll.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut event) };
    if ret < 0 {
        return Err(Error::last_readiness(operation));
    }
    Ok(())
}
