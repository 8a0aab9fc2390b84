//! Wire encoding for kernel-bound notifications (`FUSE_NOTIFY_*`). These are written to the
//! channel outside the request/reply cycle: the header is shaped like an ordinary reply's,
//! but with the notify code in the `error` field and `unique` left at zero, which is how the
//! kernel tells a notification apart from a reply it's expecting.

use std::ffi::OsStr;
use std::io::IoSlice;
use std::num::TryFromIntError;
use std::os::unix::ffi::OsStrExt;

use smallvec::SmallVec;
use zerocopy::IntoBytes;

use super::INodeNo;
use super::fuse_abi as abi;
use super::fuse_abi::fuse_notify_code as notify_code;

pub(crate) enum Notification<'a> {
    InvalInode(abi::fuse_notify_inval_inode_out),
    InvalEntry(abi::fuse_notify_inval_entry_out, &'a OsStr),
    Store(abi::fuse_notify_store_out, &'a [u8]),
    Delete(abi::fuse_notify_delete_out, &'a OsStr),
}

impl<'a> Notification<'a> {
    pub(crate) fn new_inval_inode(ino: INodeNo, off: i64, len: i64) -> Self {
        Notification::InvalInode(abi::fuse_notify_inval_inode_out {
            ino: ino.into(),
            off,
            len,
        })
    }

    pub(crate) fn new_inval_entry(parent: INodeNo, name: &'a OsStr) -> Result<Self, TryFromIntError> {
        Ok(Notification::InvalEntry(
            abi::fuse_notify_inval_entry_out {
                parent: parent.into(),
                namelen: name.as_bytes().len().try_into()?,
                padding: 0,
            },
            name,
        ))
    }

    pub(crate) fn new_store(ino: INodeNo, offset: u64, data: &'a [u8]) -> Result<Self, TryFromIntError> {
        Ok(Notification::Store(
            abi::fuse_notify_store_out {
                nodeid: ino.into(),
                offset,
                size: data.len().try_into()?,
                padding: 0,
            },
            data,
        ))
    }

    pub(crate) fn new_delete(
        parent: INodeNo,
        child: INodeNo,
        name: &'a OsStr,
    ) -> Result<Self, TryFromIntError> {
        Ok(Notification::Delete(
            abi::fuse_notify_delete_out {
                parent: parent.into(),
                child: child.into(),
                namelen: name.as_bytes().len().try_into()?,
                padding: 0,
            },
            name,
        ))
    }

    /// Frame this notification as `[out_header, fixed body, trailing bytes]` and hand the
    /// complete iovec to `f`. A trailing name is NUL-terminated the same way libfuse's own
    /// notifications are; trailing `store` data is not, since it isn't a string.
    pub(crate) fn with_iovec<F: FnOnce(&[IoSlice<'_>]) -> T, T>(
        &self,
        code: notify_code,
        f: F,
    ) -> Result<T, TryFromIntError> {
        let body: &[u8] = match self {
            Notification::InvalInode(body) => body.as_bytes(),
            Notification::InvalEntry(body, _) => body.as_bytes(),
            Notification::Store(body, _) => body.as_bytes(),
            Notification::Delete(body, _) => body.as_bytes(),
        };
        let trailing: Option<(&[u8], bool)> = match self {
            Notification::InvalInode(_) => None,
            Notification::InvalEntry(_, name) => Some((name.as_bytes(), true)),
            Notification::Delete(_, name) => Some((name.as_bytes(), true)),
            Notification::Store(_, data) => Some((data, false)),
        };
        let mut len = size_of::<abi::fuse_out_header>() + body.len();
        if let Some((bytes, nul_terminated)) = trailing {
            len += bytes.len();
            if nul_terminated {
                len += 1;
            }
        }
        let header = abi::fuse_out_header {
            len: len.try_into()?,
            error: code as i32,
            unique: 0,
        };
        let mut v: SmallVec<[IoSlice<'_>; 4]> = SmallVec::new();
        v.push(IoSlice::new(header.as_bytes()));
        v.push(IoSlice::new(body));
        if let Some((bytes, nul_terminated)) = trailing {
            v.push(IoSlice::new(bytes));
            if nul_terminated {
                v.push(IoSlice::new(b"\0"));
            }
        }
        Ok(f(&v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inval_entry_frames_header_body_and_nul_terminated_name() {
        let notif = Notification::new_inval_entry(INodeNo(1), OsStr::new("a")).unwrap();
        let total = notif
            .with_iovec(notify_code::FUSE_NOTIFY_INVAL_ENTRY, |iov| {
                iov.iter().map(|s| s.len()).sum::<usize>()
            })
            .unwrap();
        let expected = size_of::<abi::fuse_out_header>()
            + size_of::<abi::fuse_notify_inval_entry_out>()
            + 1 // "a"
            + 1; // NUL
        assert_eq!(total, expected);
    }

    #[test]
    fn store_trailing_data_is_not_nul_terminated() {
        let notif = Notification::new_store(INodeNo(1), 0, b"hello").unwrap();
        let total = notif
            .with_iovec(notify_code::FUSE_NOTIFY_STORE, |iov| {
                iov.iter().map(|s| s.len()).sum::<usize>()
            })
            .unwrap();
        let expected =
            size_of::<abi::fuse_out_header>() + size_of::<abi::fuse_notify_store_out>() + 5;
        assert_eq!(total, expected);
    }

    #[test]
    fn inval_inode_has_no_trailing_bytes() {
        let notif = Notification::new_inval_inode(INodeNo(1), 0, -1);
        let total = notif
            .with_iovec(notify_code::FUSE_NOTIFY_INVAL_INODE, |iov| {
                iov.iter().map(|s| s.len()).sum::<usize>()
            })
            .unwrap();
        let expected =
            size_of::<abi::fuse_out_header>() + size_of::<abi::fuse_notify_inval_inode_out>();
        assert_eq!(total, expected);
    }
}
