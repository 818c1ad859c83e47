//! Purpose: Define the public Rust API boundary for relaybuf.
//! Exports: Pipeline building blocks needed by the CLI and integration tests.
//! Role: Public, additive-only surface over the core modules.
//! Invariants: OS glue (`core::sys`) stays private.

pub use crate::core::backlog::Backlog;
pub use crate::core::delivery::{deliver, DeliveryConfig, DeliveryEngine, DeliveryStats};
pub use crate::core::destination::{open_destination, DestState, Destination};
#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::frame::{FrameBuffer, DEFAULT_CAPACITY};
pub use crate::core::mux::{Multiplexer, MuxStats};
pub use crate::core::queue::{Entry, MessageQueue, RecordQueue};
pub use crate::core::record::Record;
pub use crate::core::shutdown::ShutdownToken;
pub use crate::core::source::{open_source, ReadStatus, Reporter, Source, SourceKind};
pub use crate::endpoint::{Endpoint, TransportKind};
