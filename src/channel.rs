//! Raw communication channel to the FUSE kernel driver.
//!
//! A `Channel` is just a shared handle on the mounted `/dev/fuse` descriptor. The kernel
//! supports concurrent `read(2)`/`write(2)` calls against the same fd from multiple
//! threads (each `read` pulls the next queued request; each `write` is one complete
//! reply), so the worker pool in [`crate::session`] dispatches requests by sharing one
//! `Channel` rather than juggling a clone-per-worker descriptor.

use std::io::{self, IoSlice, Read, Write};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::sync::Arc;

use crate::dev_fuse::DevFuse;

/// A raw communication channel to the FUSE kernel driver.
#[derive(Debug, Clone)]
pub struct Channel {
    device: Arc<DevFuse>,
}

impl Channel {
    pub(crate) fn new(device: Arc<DevFuse>) -> Self {
        Self { device }
    }

    /// Block until the kernel has a request ready, and read it into `buf`. Returns the
    /// number of bytes read.
    pub(crate) fn receive(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.device.0).read(buf)
    }

    pub(crate) fn sender(&self) -> ChannelSender {
        ChannelSender {
            device: self.device.clone(),
        }
    }
}

impl AsRawFd for Channel {
    fn as_raw_fd(&self) -> RawFd {
        self.device.as_raw_fd()
    }
}

impl AsFd for Channel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.device.as_fd()
    }
}

/// The write half of a [`Channel`], cheap to clone and `Send + Sync` so it can be handed to
/// every worker thread and to [`crate::notify::Notifier`].
#[derive(Debug, Clone)]
pub struct ChannelSender {
    device: Arc<DevFuse>,
}

impl ChannelSender {
    pub(crate) fn send(&self, bufs: &[IoSlice<'_>]) -> io::Result<()> {
        let expected = bufs.iter().map(|b| b.len()).sum::<usize>();
        let written = (&self.device.0).write_vectored(bufs)?;
        if written != expected {
            return Err(io::Error::other(format!(
                "short write to /dev/fuse: wrote {written} of {expected} bytes"
            )));
        }
        Ok(())
    }
}

impl crate::reply::ReplySender for ChannelSender {
    fn send(&self, data: &[IoSlice<'_>]) -> io::Result<()> {
        ChannelSender::send(self, data)
    }
}
