//! Filesystem session: owns the mount, the shared channel to `/dev/fuse`, and the worker
//! thread pool that drives [`Bridge::handle`] for every request the kernel sends.
//!
//! A session begins by mounting the filesystem and ends by unmounting it. While mounted,
//! a bounded pool of OS threads shares one [`crate::channel::Channel`]: each worker blocks
//! on `Channel::receive`, dispatches the request synchronously through [`Bridge`], and
//! writes its reply before reading again. A slow handler call only blocks its own worker
//! thread; the rest of the pool keeps servicing other in-flight requests.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;

use log::{error, info, warn};

use crate::bridge::Bridge;
use crate::handler::Node;
use crate::mnt::Mount;
use crate::mnt::mount_options::{Config, check_option_conflicts};
use crate::mnt::unmount_options::UnmountOption;
use crate::mnt::mount_options::MountOption;
use crate::timeouts::MountConfig;

/// Who is allowed to issue requests against the mount, mirroring the kernel's own
/// `allow_other`/`allow_root` mount options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionACL {
    /// Only the user that mounted the filesystem may use it.
    #[default]
    Owner,
    /// The mounting user and root may use it.
    RootAndOwner,
    /// Any local user may use it.
    All,
}

impl SessionACL {
    /// The extra libfuse-style mount option this ACL implies, if any.
    pub(crate) fn to_mount_option(self) -> Option<&'static str> {
        match self {
            SessionACL::Owner => None,
            SessionACL::RootAndOwner => Some("allow_root"),
            SessionACL::All => Some("allow_other"),
        }
    }

    fn permits(self, owner_uid: u32, caller_uid: u32) -> bool {
        match self {
            SessionACL::Owner => caller_uid == owner_uid,
            SessionACL::RootAndOwner => caller_uid == owner_uid || caller_uid == 0,
            SessionACL::All => true,
        }
    }
}

/// Size of the buffer each worker thread uses to read one request from the kernel. Must
/// cover the largest possible `WRITE` payload plus header overhead.
const BUFFER_SIZE: usize = crate::bridge::MAX_WRITE_SIZE as usize + 4096;

/// A mounted filesystem and the thread pool driving it.
pub struct Session {
    bridge: Arc<Bridge>,
    channel: crate::channel::Channel,
    mount: Option<Mount>,
    mountpoint: PathBuf,
    owner_uid: u32,
    acl: SessionACL,
    n_threads: usize,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("mountpoint", &self.mountpoint)
            .field("acl", &self.acl)
            .field("n_threads", &self.n_threads)
            .finish()
    }
}

impl Session {
    /// Mount `root` at `mountpoint` and build the request dispatcher around it. Does not
    /// start servicing requests; call [`Session::run`] or [`Session::spawn`] for that.
    pub fn mount(
        root: Arc<dyn Node>,
        mountpoint: &Path,
        options: &[MountOption],
        acl: SessionACL,
        mount_config: MountConfig,
    ) -> io::Result<Session> {
        let config = Config {
            mount_options: options.to_vec(),
            ..Config::default()
        };
        check_option_conflicts(&config)?;

        let (device, mount) = Mount::new(mountpoint, options, acl)?;
        let channel = crate::channel::Channel::new(device);
        let bridge = Arc::new(Bridge::new(root, mount_config));
        let owner_uid = nix::unistd::Uid::current().as_raw();

        Ok(Session {
            bridge,
            channel,
            mount: Some(mount),
            mountpoint: mountpoint.to_path_buf(),
            owner_uid,
            acl,
            n_threads: 1,
        })
    }

    /// Override the number of worker threads sharing the channel. Must be called before
    /// [`Session::run`]/[`Session::spawn`].
    pub fn with_threads(mut self, n_threads: usize) -> Self {
        self.n_threads = n_threads.max(1);
        self
    }

    /// Path this session is mounted at.
    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    /// A handle usable to push cache-invalidation notifications to the kernel for this
    /// mount, independent of any request dispatch.
    pub fn notifier(&self) -> crate::notify::Notifier {
        crate::notify::Notifier::new(self.channel.sender())
    }

    /// Run the session loop until the filesystem is unmounted. Blocks the calling thread;
    /// spawns `n_threads - 1` additional workers and also services requests on the caller's
    /// own thread.
    pub fn run(mut self) -> io::Result<()> {
        let mount = self.mount.take();
        let workers = self.n_threads.saturating_sub(1);
        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            handles.push(self.spawn_worker());
        }
        self.worker_loop();
        for handle in handles {
            if let Err(err) = handle.join() {
                warn!("session worker panicked: {err:?}");
            }
        }
        drop(mount);
        Ok(())
    }

    /// Run the session loop in a background thread pool, returning a handle that unmounts
    /// the filesystem and joins the workers when dropped.
    pub fn spawn(mut self) -> io::Result<BackgroundSession> {
        let mountpoint = self.mountpoint.clone();
        let mount = self
            .mount
            .take()
            .ok_or_else(|| io::Error::other("session already running"))?;
        let n_threads = self.n_threads;
        let session = Arc::new(self);
        let mut handles = Vec::with_capacity(n_threads);
        for _ in 0..n_threads {
            let session = session.clone();
            handles.push(std::thread::spawn(move || session.worker_loop()));
        }
        Ok(BackgroundSession {
            mountpoint,
            mount: Some(mount),
            handles,
        })
    }

    fn spawn_worker(&self) -> JoinHandle<()> {
        let bridge = self.bridge.clone();
        let channel = self.channel.clone();
        let owner_uid = self.owner_uid;
        let acl = self.acl;
        std::thread::spawn(move || worker_loop(&bridge, &channel, owner_uid, acl))
    }

    fn worker_loop(&self) {
        worker_loop(&self.bridge, &self.channel, self.owner_uid, self.acl);
    }
}

fn worker_loop(
    bridge: &Bridge,
    channel: &crate::channel::Channel,
    owner_uid: u32,
    acl: SessionACL,
) {
    let mut buffer = vec![0u8; BUFFER_SIZE];
    loop {
        let len = match channel.receive(&mut buffer) {
            Ok(0) => {
                info!("FUSE channel closed, worker exiting");
                return;
            }
            Ok(len) => len,
            Err(err) => match err.raw_os_error() {
                // Interrupted or transient; the kernel expects a retry.
                Some(libc::ENOENT) | Some(libc::EINTR) | Some(libc::EAGAIN) => continue,
                // The mount has gone away.
                Some(libc::ENODEV) => {
                    info!("FUSE filesystem was unmounted, worker exiting");
                    return;
                }
                _ => {
                    error!("error reading from /dev/fuse: {err}");
                    return;
                }
            },
        };

        let data = &buffer[..len];
        let header = match peek_header(data) {
            Some(header) => header,
            None => {
                warn!("short FUSE request ({len} bytes), dropping");
                continue;
            }
        };
        let caller_uid = crate::request_param::Request::ref_cast(header).uid();

        if !acl.permits(owner_uid, caller_uid) {
            warn!("rejecting request from uid {caller_uid} (mount owner is {owner_uid})");
            continue;
        }

        bridge.handle(data, channel.sender());
    }
}

fn peek_header(data: &[u8]) -> Option<&crate::ll::fuse_abi::fuse_in_header> {
    crate::ll::argument::ArgumentIterator::new(data).fetch()
}

/// A session running in a background thread pool. Unmounts and joins the workers on drop.
pub struct BackgroundSession {
    mountpoint: PathBuf,
    mount: Option<Mount>,
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundSession {
    /// Path this session is mounted at.
    pub fn mountpoint(&self) -> &Path {
        &self.mountpoint
    }

    /// Unmount the filesystem and wait for every worker thread to exit.
    pub fn join(mut self) {
        self.unmount_and_join();
    }

    fn unmount_and_join(&mut self) {
        if let Some(mount) = self.mount.take() {
            if let Err((_, err)) = mount.umount(&[UnmountOption::Detach]) {
                error!("failed to unmount {}: {err}", self.mountpoint.display());
            }
        }
        for handle in self.handles.drain(..) {
            if let Err(err) = handle.join() {
                warn!("session worker panicked: {err:?}");
            }
        }
    }
}

impl Drop for BackgroundSession {
    fn drop(&mut self) {
        self.unmount_and_join();
    }
}

impl std::fmt::Debug for BackgroundSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundSession")
            .field("mountpoint", &self.mountpoint)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_acl_rejects_other_uids() {
        assert!(SessionACL::Owner.permits(1000, 1000));
        assert!(!SessionACL::Owner.permits(1000, 1001));
    }

    #[test]
    fn root_and_owner_acl_admits_root() {
        assert!(SessionACL::RootAndOwner.permits(1000, 0));
        assert!(SessionACL::RootAndOwner.permits(1000, 1000));
        assert!(!SessionACL::RootAndOwner.permits(1000, 1001));
    }

    #[test]
    fn all_acl_admits_everyone() {
        assert!(SessionACL::All.permits(1000, 42));
    }

    #[test]
    fn mount_option_hint_matches_acl() {
        assert_eq!(SessionACL::Owner.to_mount_option(), None);
        assert_eq!(
            SessionACL::RootAndOwner.to_mount_option(),
            Some("allow_root")
        );
        assert_eq!(SessionACL::All.to_mount_option(), Some("allow_other"));
    }
}
