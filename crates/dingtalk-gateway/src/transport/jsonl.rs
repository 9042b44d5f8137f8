//! JSON Lines stream transport.
//!
//! Reads one [`StreamFrame`] per line and feeds callback frames to the
//! registered callbacks. Used by the subprocess binary, where a parent process
//! relays the DingTalk stream over stdin, and by tests.
//!
//! Stdin is read on a dedicated OS thread rather than through
//! `tokio::io::stdin`, whose blocking read would keep the runtime from shutting
//! down while the parent holds the pipe open.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, info, warn};

use dingtalk_gateway_protocol::StreamFrame;

use super::{Connector, Delivery, EventCallback, StreamConnection};
use crate::config::AccountConfig;
use crate::error::TransportError;

/// Frames longer than this are skipped.
const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Lines buffered between a reader thread and its connection.
const LINE_BUFFER: usize = 256;

pub type LineResult = Result<String, LinesCodecError>;

// ============================================================================
// StdinConnector
// ============================================================================

/// Builds a [`JsonLinesConnection`] over the process's stdin.
///
/// Stdin can back a single connection per process; later builds fail.
#[derive(Debug, Default)]
pub struct StdinConnector {
    attached: AtomicBool,
}

impl StdinConnector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Connector for StdinConnector {
    fn build(
        &self,
        account_id: &str,
        _account: &AccountConfig,
    ) -> Result<Box<dyn StreamConnection>, TransportError> {
        if self.attached.swap(true, Ordering::SeqCst) {
            return Err(TransportError::Construct(
                "stdin is already attached to a connection".to_string(),
            ));
        }
        debug!(account = %account_id, "Reading stream frames from stdin");
        let lines = spawn_line_reader("stdin-reader", std::io::stdin())?;
        Ok(Box::new(JsonLinesConnection::from_lines(lines)))
    }
}

/// Read lines from `reader` on a new OS thread.
///
/// The thread exits at end of input, on a read error, or once the returned
/// stream is dropped and the next line arrives.
fn spawn_line_reader<R>(
    name: &str,
    reader: R,
) -> Result<impl Stream<Item = LineResult> + Send + Unpin + 'static, TransportError>
where
    R: Read + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel(LINE_BUFFER);
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || read_lines(BufReader::new(reader), &tx))
        .map_err(|e| TransportError::Construct(format!("failed to spawn reader thread: {e}")))?;
    Ok(futures::stream::poll_fn(move |cx| rx.poll_recv(cx)))
}

fn read_lines<R: BufRead>(mut reader: R, tx: &mpsc::Sender<LineResult>) {
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let limit = MAX_FRAME_BYTES as u64 + 1;
        let item = match (&mut reader).take(limit).read_until(b'\n', &mut buf) {
            Ok(0) => return,
            Ok(_) if buf.len() > MAX_FRAME_BYTES && buf.last() != Some(&b'\n') => {
                match reader.skip_until(b'\n') {
                    Ok(_) => Err(LinesCodecError::MaxLineLengthExceeded),
                    Err(e) => Err(LinesCodecError::Io(e)),
                }
            }
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                Ok(line.trim_end_matches(['\n', '\r']).to_string())
            }
            Err(e) => Err(LinesCodecError::Io(e)),
        };

        let fatal = matches!(item, Err(LinesCodecError::Io(_)));
        if tx.blocking_send(item).is_err() || fatal {
            return;
        }
    }
}

// ============================================================================
// JsonLinesConnection
// ============================================================================

pub struct JsonLinesConnection<S> {
    frames: S,
    callbacks: HashMap<String, EventCallback>,
    connected: bool,
}

impl<R: AsyncRead> JsonLinesConnection<FramedRead<R, LinesCodec>> {
    /// Read frames from an async reader.
    pub fn new(reader: R) -> Self {
        Self::from_lines(FramedRead::new(
            reader,
            LinesCodec::new_with_max_length(MAX_FRAME_BYTES),
        ))
    }
}

impl<S> JsonLinesConnection<S> {
    /// Read frames from a stream of already split lines.
    pub fn from_lines(lines: S) -> Self {
        Self {
            frames: lines,
            callbacks: HashMap::new(),
            connected: false,
        }
    }

    fn dispatch_line(&self, line: &str) {
        let line = line.trim();
        if line.is_empty() {
            return;
        }

        let frame: StreamFrame = match serde_json::from_str(line) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Skipping unparseable frame");
                return;
            }
        };

        if frame.frame_type == "SYSTEM" {
            debug!(topic = %frame.headers.topic, "System frame");
            return;
        }

        match self.callbacks.get(&frame.headers.topic) {
            Some(callback) => {
                let ack = callback(Delivery::from(frame));
                debug!(ack = %ack.to_frame(), "Acknowledged frame");
            }
            None => {
                debug!(topic = %frame.headers.topic, "No callback registered for topic");
            }
        }
    }
}

#[async_trait]
impl<S> StreamConnection for JsonLinesConnection<S>
where
    S: Stream<Item = LineResult> + Unpin + Send,
{
    fn register_callback(&mut self, topic: &str, callback: EventCallback) {
        self.callbacks.insert(topic.to_string(), callback);
    }

    async fn connect(&mut self) -> Result<(), TransportError> {
        if self.connected {
            return Err(TransportError::Connect("already connected".to_string()));
        }
        self.connected = true;
        info!(topics = self.callbacks.len(), "JSON Lines stream open");
        Ok(())
    }

    async fn closed(&mut self) -> Result<(), TransportError> {
        while let Some(next) = self.frames.next().await {
            match next {
                Ok(line) => self.dispatch_line(&line),
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    warn!(max_bytes = MAX_FRAME_BYTES, "Skipping oversized frame");
                }
                Err(LinesCodecError::Io(e)) => return Err(e.into()),
            }
        }
        info!("End of stream input");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        if !self.connected {
            return Ok(());
        }
        self.connected = false;
        self.callbacks.clear();
        debug!("JSON Lines stream closed");
        Ok(())
    }
}
