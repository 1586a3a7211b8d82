use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::error::ClientError;
use crate::stats::StatsPayload;

/// One message on the master link, tagged by `type`. Inbound payloads are
/// decoded into typed fields here at the edge; nothing downstream touches
/// raw JSON.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageBody {
    // Master -> worker.
    Hatch { hatch_rate: f64, num_clients: i64 },
    Stop,
    // Worker -> master.
    ClientReady,
    Hatching,
    HatchComplete { count: i64 },
    ClientStopped,
    Stats(Box<StatsPayload>),
    // Both directions.
    Quit,
}

/// A message plus the identifier of the node that produced it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    #[serde(flatten)]
    pub body: MessageBody,
    pub node_id: String,
}

impl Envelope {
    #[must_use]
    pub fn new<N>(body: MessageBody, node_id: N) -> Self
    where
        N: Into<String>,
    {
        Self {
            body,
            node_id: node_id.into(),
        }
    }
}

const MAX_MESSAGE_BYTES: usize = 4 * 1024 * 1024;

/// Reads one newline-delimited JSON message.
///
/// # Errors
///
/// Returns an error on I/O failure, oversized or non-UTF-8 frames, or
/// frames that do not decode as an [`Envelope`].
pub async fn read_message(
    reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
) -> Result<Envelope, ClientError> {
    let mut buffer: Vec<u8> = Vec::with_capacity(1024);
    let bytes = reader
        .read_until(b'\n', &mut buffer)
        .await
        .map_err(|err| ClientError::Io {
            context: "read message",
            source: err,
        })?;
    if bytes == 0 {
        return Err(ClientError::ConnectionClosed);
    }
    if buffer.len() > MAX_MESSAGE_BYTES {
        return Err(ClientError::MessageTooLarge {
            max_bytes: MAX_MESSAGE_BYTES,
        });
    }
    if buffer.ends_with(b"\n") {
        buffer.pop();
        if buffer.ends_with(b"\r") {
            buffer.pop();
        }
    }
    let line = std::str::from_utf8(&buffer)
        .map_err(|err| ClientError::MessageInvalidUtf8 { source: err })?;
    serde_json::from_str::<Envelope>(line).map_err(|err| ClientError::Deserialize {
        context: "decode message",
        source: err,
    })
}

/// Writes one newline-delimited JSON message.
///
/// # Errors
///
/// Returns an error if encoding or the socket write fails.
pub async fn send_message(
    writer: &mut tokio::net::tcp::OwnedWriteHalf,
    message: &Envelope,
) -> Result<(), ClientError> {
    let mut payload = serde_json::to_string(message).map_err(|err| ClientError::Serialize {
        context: "encode message",
        source: err,
    })?;
    payload.push('\n');
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|err| ClientError::Io {
            context: "send message",
            source: err,
        })
}
