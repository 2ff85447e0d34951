// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire format shared by [`RemoteBroker`](super::RemoteBroker) and
//! [`BrokerServer`](super::BrokerServer).
//!
//! Each TCP connection carries a sequence of frames in both directions:
//! - 4 bytes: payload length (big-endian)
//! - 2 bytes: message type
//! - N bytes: JSON payload
//!
//! Requests carry an id and are answered by a reply with the same id. Events
//! are one-way. Both peers send requests: the client asks the server to route
//! RPCs and tasks, the server hands deliveries for the client's subscribers
//! back over the same connection.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{BroadcastMessage, CommunicatorError, SubscriberId};

/// Maximum frame payload (16 MB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Frame header size (4 bytes length + 2 bytes type).
pub const HEADER_SIZE: usize = 6;

/// Message types of the wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageType {
    /// Expects a reply.
    Request = 1,
    /// Answers a request.
    Reply = 2,
    /// One-way notification.
    Event = 3,
}

impl TryFrom<u16> for MessageType {
    type Error = FrameError;

    fn try_from(value: u16) -> Result<Self, <Self as TryFrom<u16>>::Error> {
        match value {
            1 => Ok(MessageType::Request),
            2 => Ok(MessageType::Reply),
            3 => Ok(MessageType::Event),
            _ => Err(FrameError::InvalidMessageType(value)),
        }
    }
}

/// Errors raised while reading or writing frames.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too large: {0} bytes (max: {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    #[error("invalid message type: {0}")]
    InvalidMessageType(u16),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("connection closed")]
    ConnectionClosed,
}

impl From<FrameError> for CommunicatorError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Io(_) | FrameError::ConnectionClosed => CommunicatorError::ConnectionClosed,
            other => CommunicatorError::Encoding(other.to_string()),
        }
    }
}

/// A typed JSON payload.
#[derive(Debug, Clone)]
pub struct Frame {
    pub message_type: MessageType,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Serialize `value` into a frame of `message_type`.
    pub fn new<T: Serialize>(message_type: MessageType, value: &T) -> Result<Self, FrameError> {
        let payload = serde_json::to_vec(value)?;
        if payload.len() > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(payload.len()));
        }
        Ok(Self {
            message_type,
            payload,
        })
    }

    /// Deserialize the payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, FrameError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

/// Write a frame to an async writer.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<(), FrameError> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + frame.payload.len());
    buf.extend_from_slice(&(frame.payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&(frame.message_type as u16).to_be_bytes());
    buf.extend_from_slice(&frame.payload);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a frame from an async reader.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, FrameError> {
    let mut header = [0u8; HEADER_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::ConnectionClosed);
        }
        Err(e) => return Err(e.into()),
    }

    let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let message_type = MessageType::try_from(u16::from_be_bytes([header[4], header[5]]))?;
    if length > MAX_FRAME_SIZE {
        return Err(FrameError::FrameTooLarge(length));
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;
    Ok(Frame {
        message_type,
        payload,
    })
}

/// Body of a [`MessageType::Request`] frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub operation: Operation,
}

/// What a request asks for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    /// Route an RPC to `recipient`, or, from the server, deliver one to it.
    Rpc { recipient: String, body: Value },
    /// Queue a task.
    Task { body: Value },
    /// Deliver a queued task to the client's `subscriber`.
    Deliver { subscriber: SubscriberId, body: Value },
    /// Answered once every earlier frame of the connection was applied.
    Flush,
}

/// Body of a [`MessageType::Reply`] frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub id: u64,
    pub result: Result<Value, CommunicatorError>,
}

/// Body of a [`MessageType::Event`] frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    AddRpcSubscriber { identifier: String },
    RemoveRpcSubscriber { identifier: String },
    AddTaskSubscriber { subscriber: SubscriberId },
    RemoveTaskSubscriber { subscriber: SubscriberId },
    Broadcast { message: BroadcastMessage },
}

type Waiter = oneshot::Sender<Result<Value, CommunicatorError>>;

/// One side of a connection: an ordered writer and the requests waiting for
/// a reply.
pub struct Peer {
    outbound: mpsc::UnboundedSender<Frame>,
    pending: Mutex<HashMap<u64, Waiter>>,
    next_id: AtomicU64,
    closed: CancellationToken,
}

impl Peer {
    /// Split `stream` and start its writer task.
    pub fn start(stream: TcpStream) -> (Arc<Self>, OwnedReadHalf) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to disable Nagle's algorithm");
        }
        let (reader, writer) = stream.into_split();
        let (outbound, frames) = mpsc::unbounded_channel();
        let peer = Arc::new(Self {
            outbound,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: CancellationToken::new(),
        });
        tokio::spawn(write_loop(writer, frames, Arc::clone(&peer)));
        (peer, reader)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn closed(&self) -> &CancellationToken {
        &self.closed
    }

    /// Send `operation` and wait for the peer's reply.
    pub async fn request(&self, operation: Operation) -> Result<Value, CommunicatorError> {
        if self.is_closed() {
            return Err(CommunicatorError::ConnectionClosed);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let frame = Frame::new(MessageType::Request, &Request { id, operation });
        if let Err(e) = frame.map_err(CommunicatorError::from).and_then(|f| self.send(f)) {
            self.pending.lock().remove(&id);
            return Err(e);
        }
        tokio::select! {
            _ = self.closed.cancelled() => {
                self.pending.lock().remove(&id);
                Err(CommunicatorError::ConnectionClosed)
            }
            reply = rx => reply.map_err(|_| CommunicatorError::ConnectionClosed)?,
        }
    }

    /// Send a one-way event.
    pub fn event(&self, event: &Event) -> Result<(), CommunicatorError> {
        self.send(Frame::new(MessageType::Event, event)?)
    }

    /// Answer request `id`.
    pub fn reply(&self, id: u64, result: Result<Value, CommunicatorError>) {
        let frame = match Frame::new(MessageType::Reply, &Reply { id, result }) {
            Ok(frame) => frame,
            Err(e) => match Frame::new(
                MessageType::Reply,
                &Reply {
                    id,
                    result: Err(CommunicatorError::Encoding(e.to_string())),
                },
            ) {
                Ok(frame) => frame,
                Err(_) => return,
            },
        };
        if self.send(frame).is_err() {
            trace!(id, "Reply dropped, connection closed");
        }
    }

    /// Hand a reply to the request waiting for it.
    pub fn complete(&self, reply: Reply) {
        match self.pending.lock().remove(&reply.id) {
            Some(waiter) => {
                let _ = waiter.send(reply.result);
            }
            None => trace!(id = reply.id, "Reply for an abandoned request"),
        }
    }

    /// Mark the connection closed and fail every waiting request.
    pub fn shutdown(&self) {
        self.closed.cancel();
        let waiters: Vec<Waiter> = self.pending.lock().drain().map(|(_, w)| w).collect();
        for waiter in waiters {
            let _ = waiter.send(Err(CommunicatorError::ConnectionClosed));
        }
    }

    fn send(&self, frame: Frame) -> Result<(), CommunicatorError> {
        if self.is_closed() {
            return Err(CommunicatorError::ConnectionClosed);
        }
        self.outbound
            .send(frame)
            .map_err(|_| CommunicatorError::ConnectionClosed)
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut frames: mpsc::UnboundedReceiver<Frame>, peer: Arc<Peer>) {
    loop {
        let frame = tokio::select! {
            _ = peer.closed.cancelled() => break,
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        if let Err(e) = write_frame(&mut writer, &frame).await {
            debug!(error = %e, "Write failed, closing connection");
            peer.shutdown();
            break;
        }
    }
    let _ = writer.shutdown().await;
}
