use uns_api::UnsError;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("type '{name}' not found in schema dictionary '{namespace}'")]
    UnknownType { name: String, namespace: String },

    #[error("field '{field}': type '{type_name}' not found in schema dictionary '{namespace}'")]
    UnknownFieldType {
        field: String,
        type_name: String,
        namespace: String,
    },

    #[error("type '{0}' is not a structured type")]
    NotStructured(String),

    #[error("field '{field}': primitive '{name}' is not supported")]
    UnsupportedPrimitive { field: String, name: String },

    #[error("unexpected end of buffer at offset {offset}: needed {needed} bytes, {remaining} left")]
    UnexpectedEof {
        offset: usize,
        needed: usize,
        remaining: usize,
    },

    #[error("field '{field}': invalid string: {source}")]
    InvalidString {
        field: String,
        source: std::string::FromUtf8Error,
    },

    #[error("nesting deeper than {0} levels")]
    TooDeep(usize),
}

impl From<DecodeError> for UnsError {
    fn from(e: DecodeError) -> Self {
        match e {
            DecodeError::UnknownType { .. }
            | DecodeError::UnknownFieldType { .. }
            | DecodeError::NotStructured(_)
            | DecodeError::UnsupportedPrimitive { .. }
            | DecodeError::TooDeep(_) => UnsError::schema(e.to_string()),
            DecodeError::UnexpectedEof { .. } | DecodeError::InvalidString { .. } => {
                UnsError::format(e.to_string())
            }
        }
    }
}
