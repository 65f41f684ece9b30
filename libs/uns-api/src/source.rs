use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::UnsError;
use crate::schema::SchemaDictionary;

/// Value of a remote tag as it arrived on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum WireValue {
    /// Built-in scalar, usable as-is.
    Scalar(serde_json::Value),
    /// Opaque binary body of a structured value; needs a schema to decode.
    Structured(Vec<u8>),
}

/// A read of one node: raw value plus the node's declared data type.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeReading {
    pub value: WireValue,
    /// Display name of the node's data type. For structured values this is
    /// also the root type name inside the dictionary.
    pub data_type: String,
}

/// Remote tag/variable reader (field-device server).
pub trait TagSource: Send + Sync {
    fn connect(&self) -> Pin<Box<dyn Future<Output = Result<(), UnsError>> + Send + '_>>;

    /// Read the current value and type of a node.
    fn read(
        &self,
        node: &str,
    ) -> Pin<Box<dyn Future<Output = Result<NodeReading, UnsError>> + Send + '_>>;

    /// Locate the schema dictionary declaring `data_type`.
    fn schema(
        &self,
        data_type: &str,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<SchemaDictionary>, UnsError>> + Send + '_>>;

    fn close(&self) -> Pin<Box<dyn Future<Output = Result<(), UnsError>> + Send + '_>> {
        Box::pin(async { Ok(()) })
    }
}

/// Settings of one acquisition worker's remote endpoint.
#[derive(Debug, Clone)]
pub struct TagSourceSettings {
    /// Worker name; becomes the source id in published topics.
    pub source_id: String,
    pub endpoint_url: String,
    pub username: String,
    pub password: String,
    /// Source-specific configuration as a JSON document (`"{}"` when absent).
    pub config_json: String,
}

/// Creates tag sources. Resolved by the endpoint URL scheme.
pub trait TagSourceFactory: Send + Sync {
    fn create(&self, settings: &TagSourceSettings) -> Result<Arc<dyn TagSource>, UnsError>;
}
