// Core modules implementing framing, queuing, transports, delivery, and error modeling.
pub mod backlog;
pub mod delivery;
pub mod destination;
pub mod error;
pub mod frame;
pub mod mux;
pub mod queue;
pub mod record;
pub mod shutdown;
pub mod source;
pub(crate) mod sys;
