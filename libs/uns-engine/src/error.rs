use uns_api::UnsError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("config error: {0}")]
    Config(String),

    #[error("unknown worker: {0}")]
    UnknownWorker(String),

    #[error("unknown messaging client: {0}")]
    UnknownMessagingClient(String),

    #[error("unknown retained store: {0}")]
    UnknownRetainedStore(String),

    #[error("no transport factory registered as '{0}'")]
    UnknownTransport(String),

    #[error("no tag source factory for endpoint '{0}'")]
    UnknownTagSource(String),

    #[error(transparent)]
    Uns(#[from] UnsError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    /// Add context to the error.
    ///
    /// For `Uns` the context goes to the inner `UnsError`; for message
    /// variants it is prepended.
    pub fn with_context(self, ctx: impl std::fmt::Display) -> Self {
        match self {
            EngineError::Uns(e) => EngineError::Uns(e.with_context(ctx)),
            EngineError::Config(msg) => EngineError::Config(format!("{ctx}: {msg}")),
            EngineError::UnknownWorker(msg) => EngineError::UnknownWorker(format!("{ctx}: {msg}")),
            EngineError::UnknownMessagingClient(msg) => {
                EngineError::UnknownMessagingClient(format!("{ctx}: {msg}"))
            }
            EngineError::UnknownRetainedStore(msg) => {
                EngineError::UnknownRetainedStore(format!("{ctx}: {msg}"))
            }
            other => other,
        }
    }
}
