//! A request-processing engine that translates generic file-system
//! operations into FUSE-protocol exchanges with a remote server.
//!
//! The host submits [`FsRequest`] records and shuttles wire messages:
//! [`Instance::next_message`] produces outbound requests,
//! [`Instance::deliver_response`] consumes inbound responses, and
//! completed operations come back through the host's [`ResponseSink`].
//! Multi-turn operations are coroutine handlers resumed once per
//! response; resolved names live in an LRU entry cache whose evictions
//! are reported to the remote side as FORGET turns, deferred until no
//! in-flight operation could still depend on them.

mod access;
pub mod cache;
pub mod config;
mod context;
pub mod coro;
pub mod error;
mod instance;
pub mod ioq;
mod ops;
pub mod path;
pub mod proto;
pub mod request;

pub use config::VolumeParams;
pub use error::Status;
pub use instance::{Clock, Instance, MonotonicClock};
pub use request::{
    Caller, CreateOptions, DirInfo, Disposition, FileAccess, FsOp, FsReply, FsRequest, FsResponse,
    ResponseSink, SecurityMapper, SetInfo, VolumeInfo,
};
