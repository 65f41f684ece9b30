pub mod bus;
pub mod error;
pub mod record;
pub mod schema;
pub mod source;
pub mod store;
pub mod topic;
pub mod worker;

pub use bus::{MessageBus, MessageHandler, Transport, TransportFactory, TransportSettings, TlsSettings};
pub use error::{ErrorKind, UnsError};
pub use record::{Message, TransportMessage};
pub use source::{NodeReading, TagSource, TagSourceFactory, TagSourceSettings, WireValue};
pub use store::RetainedStore;
pub use worker::Worker;
