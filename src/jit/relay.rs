//! Exception relay.
//!
//! Once a process traces itself and asks for `PT_SIGEXC`, every signal it
//! receives is turned into an `EXC_SOFTWARE` Mach exception. Nobody else is
//! listening for those, so without this relay the faulting thread blocks
//! forever. The relay receives each `exception_raise` request on the port
//! claimed by [`HostPlatform`](crate::jit::HostPlatform), re-delivers the
//! signal with `PT_THUPDATE`, and replies so the kernel resumes the thread.
//!
//! ```text
//! kernel ──exception_raise (2401)──► relay thread
//!                                      ├─ EXC_SOFT_SIGNAL → ptrace(PT_THUPDATE) → KERN_SUCCESS
//!                                      └─ anything else   → KERN_FAILURE
//! relay  ──reply (2501)──────────────► kernel
//! ```
//!
//! Only one relay may exist per process. A second [`start`] is rejected with
//! [`JitError::RelayAlreadyRunning`]. The relay never exits; its thread and
//! port are reclaimed with the process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::error::JitError;
use crate::jit::ExceptionEndpoint;

/// MIG id of `exception_raise` (`EXCEPTION_DEFAULT` behaviour, 32-bit codes).
pub const EXCEPTION_RAISE_ID: i32 = 2401;
/// MIG replies carry the request id plus 100.
pub const EXCEPTION_REPLY_ID: i32 = EXCEPTION_RAISE_ID + 100;

pub const EXC_SOFTWARE: i32 = 5;
pub const EXC_SOFT_SIGNAL: i32 = 0x10003;

pub const KERN_SUCCESS: i32 = 0;
pub const KERN_FAILURE: i32 = 5;

/// Size of an `exception_raise` request without its trailer.
pub const REQUEST_SIZE: usize = 76;
/// Size of the `exception_raise` reply.
pub const REPLY_SIZE: usize = 36;

const MACH_MSGH_BITS_REMOTE_MASK: u32 = 0x0000_001f;

static RELAY_RUNNING: AtomicBool = AtomicBool::new(false);

/// Returns `true` once a relay has been started in this process.
pub fn is_running() -> bool {
    RELAY_RUNNING.load(Ordering::Acquire)
}

/// Starts the process-wide relay on its own detached thread.
///
/// Only Apple targets have exceptions to relay; elsewhere this returns
/// [`JitError::Unsupported`] without spawning anything.
pub fn start(endpoint: ExceptionEndpoint) -> Result<(), JitError> {
    if cfg!(not(target_vendor = "apple")) {
        return Err(JitError::Unsupported);
    }
    spawn_guarded(&RELAY_RUNNING, endpoint, imp::serve)
}

/// Spawns `serve` on the relay thread unless `running` is already set.
fn spawn_guarded(
    running: &'static AtomicBool,
    endpoint: ExceptionEndpoint,
    serve: fn(ExceptionEndpoint),
) -> Result<(), JitError> {
    if running
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return Err(JitError::RelayAlreadyRunning);
    }

    let spawned = std::thread::Builder::new()
        .name("exception-relay".to_string())
        .spawn(move || serve(endpoint));

    match spawned {
        Ok(_detached) => {
            tracing::info!(port = endpoint.raw(), "exception relay started");
            Ok(())
        }
        Err(e) => {
            running.store(false, Ordering::Release);
            Err(JitError::RelaySpawnFailed(e))
        }
    }
}

// ---------------------------------------------------------------------------
// Receive back-off
// ---------------------------------------------------------------------------

/// Paces the receive loop after consecutive `mach_msg` failures.
///
/// The first failure retries immediately; each further one doubles the pause
/// up to [`ReceiveBackoff::MAX_DELAY`]. Only the first failure of a run and
/// every [`ReceiveBackoff::LOG_EVERY`]th after it are worth a warning.
#[derive(Debug, Default)]
pub struct ReceiveBackoff {
    failures: u32,
}

impl ReceiveBackoff {
    pub const MAX_DELAY: Duration = Duration::from_secs(1);
    pub const LOG_EVERY: u32 = 64;
    const BASE_DELAY: Duration = Duration::from_millis(1);

    /// Records a failure and returns how long to pause before retrying.
    pub fn failed(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        if self.failures == 1 {
            return Duration::ZERO;
        }
        let shift = (self.failures - 2).min(16);
        (Self::BASE_DELAY * (1u32 << shift)).min(Self::MAX_DELAY)
    }

    /// Whether the failure just recorded should be logged.
    pub fn should_log(&self) -> bool {
        self.failures == 1 || self.failures % Self::LOG_EVERY == 0
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn succeeded(&mut self) {
        self.failures = 0;
    }
}

// ---------------------------------------------------------------------------
// Message decoding
// ---------------------------------------------------------------------------

/// A decoded `exception_raise` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionRequest {
    pub bits: u32,
    pub reply_port: u32,
    pub thread_port: u32,
    pub task_port: u32,
    pub ndr: [u8; 8],
    pub exception: i32,
    pub codes: Vec<i32>,
}

/// What the relay does with a decoded request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Re-deliver `signal` to `thread` and report success.
    ForwardSignal { thread: u32, signal: i32 },
    /// Report failure so the kernel falls back to its default handling.
    Decline,
}

/// Why a received message was dropped without a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    Truncated { len: usize },
    UnexpectedId(i32),
    UnexpectedDescriptors(u32),
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_ne_bytes(word)
}

fn read_i32(buf: &[u8], offset: usize) -> i32 {
    read_u32(buf, offset) as i32
}

/// Decodes an `exception_raise` request from a raw Mach message.
pub fn decode_request(buf: &[u8]) -> Result<ExceptionRequest, DropReason> {
    if buf.len() < REQUEST_SIZE {
        return Err(DropReason::Truncated { len: buf.len() });
    }

    let id = read_i32(buf, 20);
    if id != EXCEPTION_RAISE_ID {
        return Err(DropReason::UnexpectedId(id));
    }

    let descriptors = read_u32(buf, 24);
    if descriptors != 2 {
        return Err(DropReason::UnexpectedDescriptors(descriptors));
    }

    let mut ndr = [0u8; 8];
    ndr.copy_from_slice(&buf[52..60]);

    let code_count = (read_u32(buf, 64) as usize).min(2);
    let codes = (0..code_count).map(|i| read_i32(buf, 68 + 4 * i)).collect();

    Ok(ExceptionRequest {
        bits: read_u32(buf, 0),
        reply_port: read_u32(buf, 8),
        thread_port: read_u32(buf, 28),
        task_port: read_u32(buf, 40),
        ndr,
        exception: read_i32(buf, 60),
        codes,
    })
}

impl ExceptionRequest {
    /// Signals are forwarded; every other exception is declined.
    pub fn disposition(&self) -> Disposition {
        match self.codes.as_slice() {
            [EXC_SOFT_SIGNAL, signal, ..] if self.exception == EXC_SOFTWARE => {
                Disposition::ForwardSignal {
                    thread: self.thread_port,
                    signal: *signal,
                }
            }
            _ => Disposition::Decline,
        }
    }

    /// Encodes the MIG reply carrying `ret_code`.
    pub fn encode_reply(&self, ret_code: i32) -> [u8; REPLY_SIZE] {
        let mut reply = [0u8; REPLY_SIZE];
        let bits = self.bits & MACH_MSGH_BITS_REMOTE_MASK;
        reply[0..4].copy_from_slice(&bits.to_ne_bytes());
        reply[4..8].copy_from_slice(&(REPLY_SIZE as u32).to_ne_bytes());
        reply[8..12].copy_from_slice(&self.reply_port.to_ne_bytes());
        // local and voucher ports stay MACH_PORT_NULL
        reply[20..24].copy_from_slice(&EXCEPTION_REPLY_ID.to_ne_bytes());
        reply[24..32].copy_from_slice(&self.ndr);
        reply[32..36].copy_from_slice(&ret_code.to_ne_bytes());
        reply
    }
}

// ---------------------------------------------------------------------------
// Apple serve loop
// ---------------------------------------------------------------------------

#[cfg(target_vendor = "apple")]
mod imp {
    use mach2::message::{
        MACH_MSG_SUCCESS, MACH_MSG_TIMEOUT_NONE, MACH_RCV_MSG, MACH_SEND_MSG, mach_msg,
        mach_msg_header_t,
    };
    use mach2::port::MACH_PORT_NULL;
    use mach2::traps::mach_task_self;
    use tracing::{debug, error, warn};

    use super::{
        Disposition, KERN_FAILURE, KERN_SUCCESS, REPLY_SIZE, ReceiveBackoff, decode_request,
    };
    use crate::jit::ExceptionEndpoint;
    use crate::jit::ffi::{PT_THUPDATE, mach_msg_destroy, ptrace};

    /// Room for the request plus the largest trailer the kernel appends.
    const RECEIVE_SIZE: usize = 256;

    #[repr(C, align(8))]
    struct MessageBuffer<const N: usize>([u8; N]);

    pub(super) fn serve(endpoint: ExceptionEndpoint) {
        let port = endpoint.raw();
        let mut backoff = ReceiveBackoff::default();
        loop {
            let mut request = MessageBuffer([0u8; RECEIVE_SIZE]);
            // SAFETY: the buffer is aligned for a Mach header and RECEIVE_SIZE
            // bytes long; the kernel writes at most that many bytes.
            let rc = unsafe {
                mach_msg(
                    request.0.as_mut_ptr().cast::<mach_msg_header_t>(),
                    MACH_RCV_MSG,
                    0,
                    RECEIVE_SIZE as u32,
                    port,
                    MACH_MSG_TIMEOUT_NONE,
                    MACH_PORT_NULL,
                )
            };
            if rc != MACH_MSG_SUCCESS {
                let pause = backoff.failed();
                if backoff.should_log() {
                    warn!(
                        port,
                        mach_msg = rc,
                        failures = backoff.failures(),
                        "exception receive failed; retrying"
                    );
                }
                std::thread::sleep(pause);
                continue;
            }
            backoff.succeeded();

            let size = u32::from_ne_bytes([request.0[4], request.0[5], request.0[6], request.0[7]])
                as usize;
            let message = match decode_request(&request.0[..size.min(RECEIVE_SIZE)]) {
                Ok(message) => message,
                Err(reason) => {
                    warn!(port, ?reason, "uninterpretable message on exception port; dropping");
                    // SAFETY: the buffer holds a message just received from
                    // the kernel; destroying it releases every right it carries.
                    unsafe { mach_msg_destroy(request.0.as_mut_ptr().cast::<mach_msg_header_t>()) };
                    continue;
                }
            };

            let ret_code = match message.disposition() {
                Disposition::ForwardSignal { thread, signal } => {
                    debug!(thread, signal, "re-delivering signal");
                    // SAFETY: PT_THUPDATE only reads its arguments.
                    let rc = unsafe {
                        ptrace(
                            PT_THUPDATE,
                            libc::getpid(),
                            thread as usize as *mut libc::c_char,
                            signal,
                        )
                    };
                    if rc == 0 {
                        KERN_SUCCESS
                    } else {
                        warn!(
                            thread,
                            signal,
                            error = %std::io::Error::last_os_error(),
                            "PT_THUPDATE failed"
                        );
                        KERN_FAILURE
                    }
                }
                Disposition::Decline => {
                    debug!(exception = message.exception, codes = ?message.codes, "declining exception");
                    KERN_FAILURE
                }
            };

            release_rights(&[message.thread_port, message.task_port]);

            let mut reply = MessageBuffer(message.encode_reply(ret_code));
            // SAFETY: the reply buffer is a complete, aligned MIG reply.
            let rc = unsafe {
                mach_msg(
                    reply.0.as_mut_ptr().cast::<mach_msg_header_t>(),
                    MACH_SEND_MSG,
                    REPLY_SIZE as u32,
                    0,
                    MACH_PORT_NULL,
                    MACH_MSG_TIMEOUT_NONE,
                    MACH_PORT_NULL,
                )
            };
            if rc != MACH_MSG_SUCCESS {
                error!(port, mach_msg = rc, "failed to reply to exception");
            }
        }
    }

    fn release_rights(names: &[u32]) {
        for &name in names {
            // SAFETY: each name is a send right moved to us by the request.
            unsafe {
                mach2::mach_port::mach_port_deallocate(mach_task_self(), name);
            }
        }
    }
}

#[cfg(not(target_vendor = "apple"))]
mod imp {
    use crate::jit::ExceptionEndpoint;

    /// Never reached: [`start`](super::start) refuses before spawning.
    pub(super) fn serve(endpoint: ExceptionEndpoint) {
        tracing::error!(port = endpoint.raw(), "exception relay has nothing to serve on this platform");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_request(id: i32, exception: i32, codes: &[i32]) -> Vec<u8> {
        let mut buf = vec![0u8; REQUEST_SIZE];
        let mut put = |offset: usize, value: u32| {
            buf[offset..offset + 4].copy_from_slice(&value.to_ne_bytes());
        };
        put(0, 0x8000_1112); // complex | send-once remote
        put(4, REQUEST_SIZE as u32);
        put(8, 0x0707); // reply port
        put(20, id as u32);
        put(24, 2);
        put(28, 0x1103); // thread
        put(40, 0x0203); // task
        put(60, exception as u32);
        put(64, codes.len() as u32);
        for (i, code) in codes.iter().enumerate() {
            put(68 + 4 * i, *code as u32);
        }
        buf[52..60].copy_from_slice(&[0, 0, 0, 0, 1, 0, 0, 0]);
        buf
    }

    #[test]
    fn decodes_signal_exception_into_forward() {
        let raw = raw_request(EXCEPTION_RAISE_ID, EXC_SOFTWARE, &[EXC_SOFT_SIGNAL, 11]);
        let request = decode_request(&raw).expect("valid request");

        assert_eq!(request.thread_port, 0x1103);
        assert_eq!(request.task_port, 0x0203);
        assert_eq!(
            request.disposition(),
            Disposition::ForwardSignal {
                thread: 0x1103,
                signal: 11
            }
        );
    }

    #[test]
    fn other_software_exceptions_are_declined() {
        let raw = raw_request(EXCEPTION_RAISE_ID, EXC_SOFTWARE, &[0x1, 0]);
        let request = decode_request(&raw).expect("valid request");
        assert_eq!(request.disposition(), Disposition::Decline);

        let raw = raw_request(EXCEPTION_RAISE_ID, 1, &[EXC_SOFT_SIGNAL, 11]);
        let request = decode_request(&raw).expect("valid request");
        assert_eq!(request.disposition(), Disposition::Decline);
    }

    #[test]
    fn single_code_is_declined() {
        let raw = raw_request(EXCEPTION_RAISE_ID, EXC_SOFTWARE, &[EXC_SOFT_SIGNAL]);
        let request = decode_request(&raw).expect("valid request");
        assert_eq!(request.codes, vec![EXC_SOFT_SIGNAL]);
        assert_eq!(request.disposition(), Disposition::Decline);
    }

    #[test]
    fn malformed_messages_are_dropped() {
        assert_eq!(
            decode_request(&[0u8; 12]),
            Err(DropReason::Truncated { len: 12 })
        );

        let raw = raw_request(72, EXC_SOFTWARE, &[EXC_SOFT_SIGNAL, 11]);
        assert_eq!(decode_request(&raw), Err(DropReason::UnexpectedId(72)));

        let mut raw = raw_request(EXCEPTION_RAISE_ID, EXC_SOFTWARE, &[EXC_SOFT_SIGNAL, 11]);
        raw[24..28].copy_from_slice(&0u32.to_ne_bytes());
        assert_eq!(
            decode_request(&raw),
            Err(DropReason::UnexpectedDescriptors(0))
        );
    }

    #[test]
    fn reply_targets_the_reply_port_with_mig_reply_id() {
        let raw = raw_request(EXCEPTION_RAISE_ID, EXC_SOFTWARE, &[EXC_SOFT_SIGNAL, 2]);
        let request = decode_request(&raw).expect("valid request");
        let reply = request.encode_reply(KERN_SUCCESS);

        assert_eq!(read_u32(&reply, 0), 0x12, "only the remote disposition survives");
        assert_eq!(read_u32(&reply, 4), REPLY_SIZE as u32);
        assert_eq!(read_u32(&reply, 8), 0x0707);
        assert_eq!(read_u32(&reply, 12), 0);
        assert_eq!(read_i32(&reply, 20), EXCEPTION_REPLY_ID);
        assert_eq!(&reply[24..32], &request.ndr);
        assert_eq!(read_i32(&reply, 32), KERN_SUCCESS);
    }

    fn serve_forever(_: ExceptionEndpoint) {
        loop {
            std::thread::park();
        }
    }

    #[test]
    fn second_relay_is_rejected() {
        static RUNNING: AtomicBool = AtomicBool::new(false);

        let first = spawn_guarded(&RUNNING, ExceptionEndpoint::from_raw(1), serve_forever);
        let second = spawn_guarded(&RUNNING, ExceptionEndpoint::from_raw(2), serve_forever);

        assert!(first.is_ok());
        assert!(matches!(second, Err(JitError::RelayAlreadyRunning)));
        assert!(RUNNING.load(Ordering::Acquire));
    }

    #[cfg(not(target_vendor = "apple"))]
    #[test]
    fn nothing_to_relay_off_apple() {
        let err = start(ExceptionEndpoint::from_raw(1)).expect_err("unsupported");
        assert!(matches!(err, JitError::Unsupported));
        assert!(!is_running());
    }

    #[test]
    fn receive_failures_back_off_to_the_cap() {
        let mut backoff = ReceiveBackoff::default();

        assert_eq!(backoff.failed(), Duration::ZERO);
        assert!(backoff.should_log());
        assert_eq!(backoff.failed(), Duration::from_millis(1));
        assert_eq!(backoff.failed(), Duration::from_millis(2));
        assert!(!backoff.should_log());

        let pauses: Vec<_> = (0..100).map(|_| backoff.failed()).collect();
        assert!(pauses.iter().all(|p| *p <= ReceiveBackoff::MAX_DELAY));
        assert_eq!(pauses.last(), Some(&ReceiveBackoff::MAX_DELAY));
    }

    #[test]
    fn persistent_failures_log_sparsely() {
        let mut backoff = ReceiveBackoff::default();
        let logged = (0..ReceiveBackoff::LOG_EVERY * 3)
            .filter(|_| {
                backoff.failed();
                backoff.should_log()
            })
            .count();
        assert_eq!(logged, 4);
    }

    #[test]
    fn success_resets_the_backoff() {
        let mut backoff = ReceiveBackoff::default();
        for _ in 0..10 {
            backoff.failed();
        }
        backoff.succeeded();

        assert_eq!(backoff.failures(), 0);
        assert_eq!(backoff.failed(), Duration::ZERO);
    }
}
