//! One physical websocket carrying every protocol message.

use crate::broadcast::{Broadcaster, Subscription};
use crate::error::{HandlerError, TransportError};
use async_trait::async_trait;
use buildlink_core::Message;
use futures_util::{Sink, SinkExt, Stream, StreamExt, TryStreamExt, future};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message as Frame;
use tokio_util::sync::CancellationToken;

const INPUT_CAPACITY: usize = 10;

type FrameSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;
type FrameStream = Pin<Box<dyn Stream<Item = Result<String, TransportError>> + Send>>;

/// Synchronous hook run for every inbound message before it reaches the bus.
pub type MessageHandler = Box<dyn FnMut(&Message) -> Result<(), HandlerError> + Send>;

/// A bidirectional message channel shared by every protocol component.
#[async_trait]
pub trait Messages: Send + Sync {
    /// Subscribe to inbound messages. Close or drop the subscription to stop.
    fn recv(&self) -> Subscription<Arc<Message>>;
    async fn send(&self, msg: &Message) -> Result<(), TransportError>;
    /// Orderly shutdown: already received messages still reach subscribers.
    async fn close(&self);
}

struct Reader {
    stream: FrameStream,
    input: mpsc::Sender<Arc<Message>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct WebsocketMessages {
    sink: tokio::sync::Mutex<FrameSink>,
    reader: Mutex<Option<Reader>>,
    handler: Mutex<Option<MessageHandler>>,
    broadcaster: Arc<Broadcaster<Arc<Message>>>,
    stop: CancellationToken,
}

impl WebsocketMessages {
    /// Wrap a text-frame sink and stream. The stream ending cleanly is an
    /// orderly disconnect; an error item is a broken connection.
    pub fn new<S, R>(sink: S, stream: R) -> Arc<Self>
    where
        S: Sink<String, Error = TransportError> + Send + 'static,
        R: Stream<Item = Result<String, TransportError>> + Send + 'static,
    {
        let (input, broadcaster) = Broadcaster::channel(INPUT_CAPACITY);
        Arc::new(Self {
            sink: tokio::sync::Mutex::new(Box::pin(sink)),
            reader: Mutex::new(Some(Reader {
                stream: Box::pin(stream),
                input,
            })),
            handler: Mutex::new(None),
            broadcaster: Arc::new(broadcaster),
            stop: CancellationToken::new(),
        })
    }

    pub fn from_websocket<T>(ws: WebSocketStream<T>) -> Arc<Self>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = ws.split();
        let sink = sink
            .sink_map_err(TransportError::from)
            .with(|text: String| future::ready(Ok::<_, TransportError>(Frame::Text(text.into()))));
        let stream = stream
            .map_err(TransportError::from)
            .try_take_while(|frame| future::ready(Ok(!frame.is_close())))
            .try_filter_map(|frame| future::ready(Ok(frame_text(frame))));
        Self::new(sink, stream)
    }

    /// Register the synchronous handler. It runs inline in the read loop, so
    /// the next frame is not read until it returns. Must be set before
    /// [`start`](Self::start).
    pub fn on_message(&self, handler: MessageHandler) -> Result<(), TransportError> {
        let mut slot = lock(&self.handler);
        if slot.is_some() {
            return Err(TransportError::HandlerAlreadySet);
        }
        *slot = Some(handler);
        Ok(())
    }

    /// Spawn the bus pump and the read loop. Cancelling `cancel` is a hard
    /// close of the bus.
    pub fn start(self: &Arc<Self>, cancel: &CancellationToken) {
        let reader = lock(&self.reader).take();
        let Some(reader) = reader else {
            tracing::warn!("websocket messages already started");
            return;
        };
        let handler = lock(&self.handler).take();

        let broadcaster = self.broadcaster.clone();
        let bus_cancel = cancel.clone();
        tokio::spawn(async move { broadcaster.start(bus_cancel).await });

        let this = self.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = this.run(reader, handler, cancel).await {
                tracing::debug!(error = %e, "run loop error");
            }
        });
    }

    async fn run(
        &self,
        reader: Reader,
        mut handler: Option<MessageHandler>,
        cancel: CancellationToken,
    ) -> Result<(), TransportError> {
        let Reader { mut stream, input } = reader;
        loop {
            let frame = tokio::select! {
                _ = self.stop.cancelled() => return Ok(()),
                _ = cancel.cancelled() => return Ok(()),
                frame = stream.next() => frame,
            };

            let text = match frame {
                Some(Ok(text)) => text,
                Some(Err(e)) => {
                    self.broadcaster.close();
                    return Err(e);
                }
                None => {
                    tracing::trace!("connection closed by peer");
                    self.broadcaster.shutdown();
                    return Ok(());
                }
            };

            let msg = match Message::decode(&text) {
                Ok(msg) => msg,
                Err(e) => {
                    self.broadcaster.close();
                    return Err(e.into());
                }
            };
            tracing::trace!(message = %msg, "read build message");

            if msg.kind().is_none() {
                tracing::debug!("dropping message without a discriminant");
                continue;
            }

            if let Some(handler) = handler.as_mut()
                && let Err(e) = handler(&msg)
            {
                self.broadcaster.close();
                return Err(TransportError::Handler(e));
            }

            tokio::select! {
                _ = self.stop.cancelled() => return Ok(()),
                sent = input.send(Arc::new(msg)) => {
                    if sent.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

fn frame_text(frame: Frame) -> Option<String> {
    match frame {
        Frame::Text(text) => Some(text.as_str().to_owned()),
        Frame::Binary(data) => String::from_utf8(data.to_vec()).ok(),
        _ => None,
    }
}

#[async_trait]
impl Messages for WebsocketMessages {
    fn recv(&self) -> Subscription<Arc<Message>> {
        self.broadcaster.subscribe()
    }

    async fn send(&self, msg: &Message) -> Result<(), TransportError> {
        tracing::trace!(message = %msg, "send build message");
        let frame = msg.encode()?;
        let mut sink = self.sink.lock().await;
        sink.send(frame).await
    }

    async fn close(&self) {
        self.stop.cancel();
        self.broadcaster.shutdown();
        let mut sink = self.sink.lock().await;
        if let Err(e) = sink.close().await {
            tracing::debug!(error = %e, "closing websocket");
        }
    }
}
