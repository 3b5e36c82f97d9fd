// SPDX-License-Identifier: Apache-2.0

//! Syscalls a virtual guest performs directly
//!
//! Every syscall number not listed here is forwarded to the host.

use libc::c_long;

/// Syscall numbers executed in the guest process without forwarding
#[cfg(target_arch = "x86_64")]
pub const DIRECT: &[c_long] = &[
    libc::SYS_read,
    libc::SYS_write,
    libc::SYS_close,
    libc::SYS_brk,
    libc::SYS_rt_sigaction,
    libc::SYS_ioctl,
    libc::SYS_pipe,
    libc::SYS_shmat,
    libc::SYS_dup,
    libc::SYS_nanosleep,
    libc::SYS_getpid,
    libc::SYS_recvmsg,
    libc::SYS_socketpair,
    libc::SYS_fork,
    libc::SYS_execve,
    libc::SYS_exit,
    libc::SYS_wait4,
    libc::SYS_kill,
    libc::SYS_getrlimit,
    libc::SYS_arch_prctl,
    libc::SYS_gettid,
    libc::SYS_tkill,
    libc::SYS_futex,
    libc::SYS_clock_gettime,
    libc::SYS_tgkill,
];

/// Syscall numbers executed in the guest process without forwarding
#[cfg(not(target_arch = "x86_64"))]
pub const DIRECT: &[c_long] = &[];

/// Whether the guest executes syscall `num` itself.
#[inline]
pub fn is_direct(num: c_long) -> bool {
    DIRECT.contains(&num)
}
