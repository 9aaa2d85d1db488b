//! Declarations for Darwin calls that `libc` and `mach2` do not cover, or only
//! cover on some targets.
//!
//! Kept in one place so the unsafe surface of the JIT trick is easy to audit.

use libc::{c_char, c_int, c_uint, c_void, pid_t, size_t};
use mach2::kern_return::kern_return_t;
use mach2::message::mach_msg_header_t;
use mach2::port::mach_port_t;

/// `csops` operation returning the code-signing status word.
pub const CS_OPS_STATUS: c_uint = 0;
/// Status bit set while the process is (or was) being debugged.
pub const CS_DEBUGGED: u32 = 0x1000_0000;

pub const PT_TRACE_ME: c_int = 0;
pub const PT_SIGEXC: c_int = 12;
pub const PT_THUPDATE: c_int = 13;

pub const EXC_MASK_SOFTWARE: u32 = 1 << 5;
pub const EXCEPTION_DEFAULT: c_int = 1;

#[cfg(target_arch = "aarch64")]
pub const THREAD_STATE_NONE: c_int = 5;
#[cfg(not(target_arch = "aarch64"))]
pub const THREAD_STATE_NONE: c_int = 13;

unsafe extern "C" {
    pub fn csops(pid: pid_t, ops: c_uint, useraddr: *mut c_void, usersize: size_t) -> c_int;

    pub fn ptrace(request: c_int, pid: pid_t, addr: *mut c_char, data: c_int) -> c_int;

    pub fn task_set_exception_ports(
        task: mach_port_t,
        exception_mask: u32,
        new_port: mach_port_t,
        behavior: c_int,
        new_flavor: c_int,
    ) -> kern_return_t;

    pub fn mach_port_destroy(task: mach_port_t, name: mach_port_t) -> kern_return_t;

    pub fn mach_msg_destroy(msg: *mut mach_msg_header_t);
}
