//! Email channel: message building for drip sends and the transports that
//! deliver them.

pub mod email;
pub mod transport;

pub use email::{
    strip_tags, BuilderRegistry, DripEmail, EmailBuilderFactory, EmailMessage, EmailSpec,
    StandardEmailFactory,
};
pub use transport::{LogTransport, RecordingTransport, Transport};
