use std::io;
use thiserror::Error;

/// Failures surfaced by the verbs wrapper layer.
///
/// Every variant here maps onto spec-level `RESOURCE` failures once it
/// crosses into `gasnet-core`: setup-time verbs failures are never
/// recoverable by this crate, only by the caller deciding whether to retry
/// (e.g. firehose registration backing off and evicting victims first).
#[derive(Debug, Error)]
pub enum Error {
    #[error("no RDMA devices found")]
    NoDevices,

    #[error("failed to open device: {0}")]
    OpenDevice(io::Error),

    #[error("failed to query port {1}: {0}")]
    QueryPort(io::Error, u8),

    #[error("failed to query gid: {0}")]
    QueryGid(io::Error),

    #[error("failed to allocate protection domain: {0}")]
    AllocPd(io::Error),

    #[error("failed to create completion queue: {0}")]
    CreateCq(io::Error),

    #[error("failed to create queue pair: {0}")]
    CreateQp(io::Error),

    #[error("failed to modify queue pair to {1:?}: {0}")]
    ModifyQp(io::Error, crate::qp::QpState),

    #[error("failed to register memory region: {0}")]
    RegMr(io::Error),

    #[error("failed to post send work request: {0}")]
    PostSend(io::Error),

    #[error("failed to post receive work request: {0}")]
    PostRecv(io::Error),

    #[error("failed to poll completion queue: {0}")]
    PollCq(io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Turn a verbs `int` return code into a `Result`, the way `ibv_*` calls do:
/// 0 on success, a positive `errno` value (not `-1` with `errno` set, as is
/// conventional for most of libc) on failure.
pub(crate) fn check(ret: i32, wrap: impl FnOnce(io::Error) -> Error) -> Result<()> {
    if ret == 0 {
        Ok(())
    } else {
        Err(wrap(io::Error::from_raw_os_error(ret)))
    }
}
