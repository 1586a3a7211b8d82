//! Bidirectional link to the master.
//!
//! The façade owns a send queue drained by a single writer task (so send
//! order is preserved) and a receive stream fed by a reader task. Either
//! task flips the disconnection watch when the transport dies; the
//! runner treats that as terminal.

pub mod protocol;

use std::sync::Mutex;

use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::{AppResult, ClientError};

use protocol::{Envelope, MessageBody, read_message, send_message};

pub struct MasterClient {
    addr: String,
    node_id: String,
    send_tx: mpsc::UnboundedSender<Envelope>,
    send_rx: Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
    recv_tx: mpsc::UnboundedSender<Envelope>,
    recv_rx: Mutex<Option<mpsc::UnboundedReceiver<Envelope>>>,
    disconnected_tx: watch::Sender<bool>,
}

impl MasterClient {
    /// Builds the queues without touching the network; `connect` wires
    /// them to a socket later.
    #[must_use]
    pub fn new<H, N>(host: H, port: u16, node_id: N) -> Self
    where
        H: std::fmt::Display,
        N: Into<String>,
    {
        let (send_tx, send_rx) = mpsc::unbounded_channel();
        let (recv_tx, recv_rx) = mpsc::unbounded_channel();
        let (disconnected_tx, _) = watch::channel(false);
        Self {
            addr: format!("{}:{}", host, port),
            node_id: node_id.into(),
            send_tx,
            send_rx: Mutex::new(Some(send_rx)),
            recv_tx,
            recv_rx: Mutex::new(Some(recv_rx)),
            disconnected_tx,
        }
    }

    /// Queues a message for the master. Safe to call from any context;
    /// messages queued while connected are never dropped.
    pub fn send(&self, body: MessageBody) {
        let envelope = Envelope::new(body, self.node_id.clone());
        if self.send_tx.send(envelope).is_err() {
            warn!("Send queue closed; dropping outbound message");
        }
    }

    /// The inbound message stream. Yields `None` once per client; the
    /// runner's receive loop takes it.
    #[must_use]
    pub fn take_receiver(&self) -> Option<mpsc::UnboundedReceiver<Envelope>> {
        match self.recv_rx.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        }
    }

    /// Watch that flips to `true` once the transport terminates.
    #[must_use]
    pub fn disconnected(&self) -> watch::Receiver<bool> {
        self.disconnected_tx.subscribe()
    }

    /// Dials the master and spawns the reader and writer loops.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established or
    /// `connect` was already called.
    pub async fn connect(&self) -> AppResult<()> {
        let send_rx = match self.send_rx.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        let mut send_rx = send_rx.ok_or(ClientError::SendQueueClosed)?;

        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|err| ClientError::Connection {
                addr: self.addr.clone(),
                source: err,
            })?;
        info!("Connected to master {}", self.addr);
        let (read_half, mut write_half) = stream.into_split();

        let writer_disconnected = self.disconnected_tx.clone();
        tokio::spawn(async move {
            while let Some(message) = send_rx.recv().await {
                if let Err(err) = send_message(&mut write_half, &message).await {
                    warn!("Failed to send to master: {}", err);
                    break;
                }
            }
            drop(writer_disconnected.send(true));
        });

        let reader_disconnected = self.disconnected_tx.clone();
        let recv_tx = self.recv_tx.clone();
        let mut reader = BufReader::new(read_half);
        tokio::spawn(async move {
            loop {
                match read_message(&mut reader).await {
                    Ok(message) => {
                        debug!("Received {:?} from master", message.body);
                        if recv_tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        info!("Master link closed: {}", err);
                        break;
                    }
                }
            }
            drop(reader_disconnected.send(true));
        });

        Ok(())
    }

    /// Outbound queue end, for exercising the runner without a socket.
    #[cfg(test)]
    pub(crate) fn take_outbox(&self) -> Option<mpsc::UnboundedReceiver<Envelope>> {
        match self.send_rx.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        }
    }
}
