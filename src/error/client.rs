use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Connection error to {addr}: {source}")]
    Connection {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("I/O error during {context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("Connection closed.")]
    ConnectionClosed,
    #[error("Message exceeded max size ({max_bytes} bytes).")]
    MessageTooLarge { max_bytes: usize },
    #[error("Message was not valid UTF-8: {source}")]
    MessageInvalidUtf8 {
        #[source]
        source: std::str::Utf8Error,
    },
    #[error("Serialization error during {context}: {source}")]
    Serialize {
        context: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("Deserialization error during {context}: {source}")]
    Deserialize {
        context: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("Send queue closed.")]
    SendQueueClosed,
    #[cfg(test)]
    #[error("Test expectation failed: {message}")]
    TestExpectation { message: &'static str },
    #[cfg(test)]
    #[error("Test expectation failed: {message}: {value}")]
    TestExpectationValue {
        message: &'static str,
        value: String,
    },
}
