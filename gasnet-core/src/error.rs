use std::fmt;

/// The four kinds of failure described in spec §7.
///
/// `Resource` is never returned to a caller: every site that would produce
/// one instead calls [`fatal`], logs, and aborts the process, matching spec
/// §7's propagation policy ("Setup-time resource failures terminate
/// immediately... Steady-state RDMA completion errors are fatal").
#[derive(Debug)]
pub enum Error {
    /// Argument validation failed at an API boundary: out-of-range node,
    /// misaligned address, length beyond segment, handler index out of
    /// bounds, reattach.
    BadArg(String),

    /// A `try_sync*` call found work still outstanding.
    NotReady,

    /// A split-phase barrier observed mismatched id/flags across peers.
    BarrierMismatch,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BadArg(msg) => write!(f, "bad argument: {msg}"),
            Self::NotReady => write!(f, "operation not yet complete"),
            Self::BarrierMismatch => write!(f, "split-phase barrier id/flags mismatch"),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// Log a fatal condition and terminate the process.
///
/// Per spec §7, `RESOURCE` failures (transport/OS failure during setup, or
/// on posting that exhausts retry) are never returned to the caller: they
/// terminate the job. This matches the teacher's treatment of verbs
/// completion errors as always-a-bug conditions
/// (`rpc_protocol::server::ring::check_completion_error`), generalized from
/// "panics on a specific errno" to "logs an identifying message, then
/// aborts" since a production GASNet job must leave a trace before dying.
#[cold]
pub fn fatal(context: &str, cause: impl fmt::Display) -> ! {
    log::error!("fatal GASNet resource failure in {context}: {cause}");
    std::process::abort();
}
