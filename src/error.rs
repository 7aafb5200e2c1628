use core::fmt;

use crate::breakpoint::BreakpointKind;

/// Every way a command against the target, or an operation on the local
/// callback bookkeeping, can fail.
///
/// Variants are grouped the way [`spec.md`'s error taxonomy] is: transport,
/// protocol, semantic, and callback-registry errors. Transport errors are
/// terminal for the connection; the rest are reported back to whichever
/// caller issued the command and leave target state untouched.
#[derive(Debug)]
pub enum RspError {
    /// Could not open a TCP connection to the stub.
    Connect {
        host: String,
        port: u16,
        source: std::io::Error,
    },
    /// The peer reset the connection mid-read.
    ConnectionReset,
    /// A write to the socket failed because the peer closed its end.
    BrokenPipe,
    /// A frame was missing its `$` or `#cc` delimiters. Detected and
    /// dropped silently inside [`crate::io::PacketIO`]'s receiver loop;
    /// this variant exists only so that internal parsing has a typed
    /// error to return before the drop happens, and never reaches a
    /// caller.
    CorruptFrame,
    /// A reply did not match what the calling command expected.
    UnexpectedReply { context: &'static str, reply: String },
    /// `read_register`/`write_register` was given a name not present in the
    /// register layout discovered at connect time.
    RegisterUnknown { name: String },
    /// `p<index>` returned an error reply.
    RegisterRead {
        name: String,
        index: u32,
        reply: String,
    },
    /// `M<addr>,<size>,<data>` did not reply `OK`.
    MemoryWrite { addr: u64 },
    /// `Z<kind>,<addr>,<size>` did not reply `OK`.
    BreakpointSet {
        kind: BreakpointKind,
        addr: u64,
        reply: String,
    },
    /// `z<kind>,<addr>,<size>` replied with an error code.
    ///
    /// Raised by [`crate::rsp_target::RspTarget`]; callers at the façade
    /// level routinely swallow this, since gdbstubs frequently report an
    /// error on a successful remove.
    BreakpointRemove {
        kind: BreakpointKind,
        addr: u64,
        reply: String,
    },
    /// An execution command was called somewhere it isn't allowed to run
    /// from (a callback worker thread), or while the target is in a state
    /// that forbids it.
    ExecutionDisallowed {
        cmd: &'static str,
        reason: &'static str,
    },
    /// An execution command, or `close`, was called from a thread other
    /// than the owner thread or the event thread.
    NotOwningThread,
    /// [`CallbackManager`](crate::callback::CallbackManager) was asked to
    /// register/remove a callback under an event kind it doesn't recognize.
    UnknownKind,
    /// [`CallbackManager::remove_callback`](crate::callback::CallbackManager::remove_callback)
    /// was given a handle that isn't currently registered.
    NoSuchCallback,
}

impl fmt::Display for RspError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RspError::Connect { host, port, source } => {
                write!(f, "unable to connect to gdbstub at {host}:{port}: {source}")
            }
            RspError::ConnectionReset => write!(f, "connection reset by peer"),
            RspError::BrokenPipe => write!(f, "broken pipe while writing to gdbstub"),
            RspError::CorruptFrame => write!(f, "malformed packet frame"),
            RspError::UnexpectedReply { context, reply } => {
                write!(f, "unexpected reply to {context}: {reply:?}")
            }
            RspError::RegisterUnknown { name } => {
                write!(f, "register '{name}' is not in the discovered layout")
            }
            RspError::RegisterRead { name, index, reply } => write!(
                f,
                "unable to read register '{name}' (index {index}): {reply}"
            ),
            RspError::MemoryWrite { addr } => {
                write!(f, "failed to write memory at {addr:#x}")
            }
            RspError::BreakpointSet { kind, addr, reply } => write!(
                f,
                "unable to set {kind:?} breakpoint at {addr:#x}: {reply}"
            ),
            RspError::BreakpointRemove { kind, addr, reply } => write!(
                f,
                "unable to remove {kind:?} breakpoint at {addr:#x}: {reply}"
            ),
            RspError::ExecutionDisallowed { cmd, reason } => {
                write!(f, "cannot run '{cmd}': {reason}")
            }
            RspError::NotOwningThread => {
                write!(f, "this operation may only be called from the owner thread or the event thread")
            }
            RspError::UnknownKind => write!(f, "unrecognized callback event kind"),
            RspError::NoSuchCallback => write!(f, "no matching callback registration found"),
        }
    }
}

impl std::error::Error for RspError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RspError::Connect { source, .. } => Some(source),
            _ => None,
        }
    }
}

pub type Result<T> = core::result::Result<T, RspError>;
