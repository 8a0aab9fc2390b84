//! Native FFI bindings to libfuse2.
//!
//! Just enough of `fuse_opt.h` and `fuse_common.h` to mount and unmount a filesystem through
//! the compat25 ABI that libfuse2 and libfuse3 both still export.

#![allow(non_camel_case_types)]

use libc::c_char;
use libc::c_int;

/// Mirrors libfuse's `struct fuse_args`: an argv-style option list libfuse parses itself.
#[repr(C)]
pub(crate) struct fuse_args {
    pub(crate) argc: c_int,
    pub(crate) argv: *const *const c_char,
    pub(crate) allocated: c_int,
}

unsafe extern "C" {
    pub(crate) fn fuse_mount_compat25(mountpoint: *const c_char, args: *mut fuse_args) -> c_int;
}
