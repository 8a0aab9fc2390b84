//! Directory listing encoding, on top of the wire-level entry buffers in [`crate::ll::reply`].
//!
//! Handlers hand back a plain, offset-indexed snapshot of a directory's entries rather than
//! a stateful iterator: the kernel addresses directory position purely by the offset it was
//! given in a previous entry, and re-requests from any offset it still remembers (including
//! after a `seekdir`/`rewinddir`, or never at all if the directory fits one `READDIR`).
//! Treating the snapshot as a plain slice indexed by offset makes resuming trivial and
//! makes a stale offset (the directory changed shape since the offset was issued) a simple
//! bounds check rather than a piece of protocol state this module has to track.

use std::ffi::OsString;
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::ll::reply::{Attr, DirEntList, DirEntOffset, DirEntPlusList, DirEntry, DirEntryPlus};
use crate::ll::{Generation, INodeNo};
use crate::reply::{FileAttr, FileType};

/// One entry of a directory snapshot, as a handler's `readdir` returns it.
#[derive(Debug, Clone)]
pub struct Entry {
    pub ino: INodeNo,
    pub kind: FileType,
    pub name: OsString,
}

/// The same, plus the attributes and entry cache metadata `READDIRPLUS` also primes the
/// kernel's entry cache with.
#[derive(Debug, Clone)]
pub struct EntryPlus {
    pub ino: INodeNo,
    pub generation: Generation,
    pub kind: FileType,
    pub name: OsString,
    pub attr: FileAttr,
    pub attr_valid: Duration,
    pub entry_valid: Duration,
}

/// Fill a plain `READDIR` reply buffer from `entries[offset..]`, stopping once `max_size`
/// bytes of encoded entries have been produced. The kernel calls back with the offset of
/// the last entry it received, so offsets here are simply indices into `entries`.
pub(crate) fn fill_dir(entries: &[Entry], offset: i64, max_size: usize) -> Result<DirEntList> {
    let start = validate_offset(entries.len(), offset)?;
    let mut list = DirEntList::new(max_size);
    for (i, entry) in entries.iter().enumerate().skip(start) {
        let full = list.push(&DirEntry::new(
            entry.ino,
            DirEntOffset((i + 1) as u64),
            entry.kind,
            AsOsStrPath(&entry.name),
        ));
        if full {
            break;
        }
    }
    Ok(list)
}

pub(crate) fn fill_dir_plus(
    entries: &[EntryPlus],
    offset: i64,
    max_size: usize,
) -> Result<DirEntPlusList> {
    let start = validate_offset(entries.len(), offset)?;
    let mut list = DirEntPlusList::new(max_size);
    for (i, entry) in entries.iter().enumerate().skip(start) {
        let full = list.push(&DirEntryPlus::new(
            entry.ino,
            entry.generation,
            DirEntOffset((i + 1) as u64),
            AsOsStrPath(&entry.name),
            entry.entry_valid,
            Attr::from(entry.attr),
            entry.attr_valid,
        ));
        if full {
            break;
        }
    }
    Ok(list)
}

fn validate_offset(len: usize, offset: i64) -> Result<usize> {
    if offset < 0 {
        return Err(Error::InvalidArgument);
    }
    let offset = offset as usize;
    if offset > len {
        return Err(Error::InvalidArgument);
    }
    Ok(offset)
}

/// Adapts `&OsString` to `AsRef<Path>` without an intermediate allocation, matching what
/// [`DirEntry`]/[`DirEntryPlus`] want.
struct AsOsStrPath<'a>(&'a OsString);

impl AsRef<Path> for AsOsStrPath<'_> {
    fn as_ref(&self) -> &Path {
        Path::new(self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(i: u64, name: &str) -> Entry {
        Entry {
            ino: INodeNo(i),
            kind: FileType::RegularFile,
            name: name.into(),
        }
    }

    #[test]
    fn offset_zero_starts_from_the_beginning() {
        let entries = vec![entry(2, "a"), entry(3, "b")];
        let list = fill_dir(&entries, 0, 4096).unwrap();
        let _ = list; // encoding correctness is covered by ll::reply's own unit tests
    }

    #[test]
    fn offset_past_the_end_is_rejected() {
        let entries = vec![entry(2, "a")];
        assert_eq!(fill_dir(&entries, 5, 4096), Err(Error::InvalidArgument));
    }

    #[test]
    fn negative_offset_is_rejected() {
        let entries = vec![entry(2, "a")];
        assert_eq!(fill_dir(&entries, -1, 4096), Err(Error::InvalidArgument));
    }

    #[test]
    fn offset_equal_to_length_yields_an_empty_page() {
        let entries = vec![entry(2, "a")];
        // Resuming exactly at the end (the kernel re-requesting after the last page) is
        // valid and simply produces no further entries.
        assert!(fill_dir(&entries, 1, 4096).is_ok());
    }
}
