//! GASNet Extended API (spec §4.6): non-blocking one-sided get/put/memset
//! and access regions, layered on `gasnet-core`'s Active Message engine and
//! segment/firehose tables. Bootstrap, transport, and AM dispatch all stay
//! in `gasnet-core`; this crate only adds the Extended operation surface
//! and the handle bookkeeping (`eop`/`iop`) it needs.

pub mod eop;
pub mod explicit;
pub mod implicit;
pub mod memset;

pub use eop::Eop;

use gasnet_core::am::{HandlerFn, HandlerRange};

/// `(handler_index, range, function)` entries every client must fold into
/// the handler list it passes to `gasnet_core::endpoint::Endpoint::attach`
/// for this crate's Extended-range handlers (currently just the large-memset
/// ack handler) to be registered.
pub fn handlers() -> Vec<(u8, HandlerRange, HandlerFn)> {
    memset::handlers()
}
