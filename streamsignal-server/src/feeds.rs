use std::{collections::HashMap, sync::Arc};

use axum::extract::ws::Message;
use futures::{channel::mpsc, select, SinkExt, StreamExt};
use streamsignal_api::{ChangeEvent, ChannelSpec, ClientMessage, FeedMessage, SubscribeStatus, Uuid};
use tokio::sync::RwLock;

#[derive(Debug)]
struct Socket {
    sender: mpsc::UnboundedSender<FeedMessage>,
    channels: HashMap<String, ChannelSpec>,
}

/// Open realtime websockets and the channels they subscribed to
#[derive(Clone, Debug, Default)]
pub struct Feeds(Arc<RwLock<HashMap<Uuid, Socket>>>);

impl Feeds {
    pub fn new() -> Feeds {
        Feeds::default()
    }

    /// Serves one websocket until it closes
    pub async fn serve<W, R>(self, mut write: W, read: R)
    where
        W: 'static + Send + Unpin + futures::Sink<Message>,
        <W as futures::Sink<Message>>::Error: Send,
        R: 'static + Send + Unpin + futures::Stream<Item = Result<Message, axum::Error>>,
    {
        // Note: if this were bounded, there would be a deadlock between the write-lock to remove
        // a socket and the read-lock to relay an event to all interested sockets
        let (sender, mut receiver) = mpsc::unbounded();
        let socket_id = Uuid::new_v4();
        self.0.write().await.insert(
            socket_id,
            Socket {
                sender,
                channels: HashMap::new(),
            },
        );
        tracing::debug!(?socket_id, "realtime socket connected");

        let mut read = read.fuse();
        macro_rules! send_message {
            ( $msg:expr ) => {{
                let msg: FeedMessage = $msg;
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(err) => {
                        tracing::error!(?err, ?msg, "failed serializing message to json");
                        continue;
                    }
                };
                if write.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }};
        }
        loop {
            select! {
                msg = receiver.next() => match msg {
                    None => break,
                    Some(msg) => send_message!(msg),
                },
                msg = read.next() => match msg {
                    None | Some(Ok(Message::Close(_))) => break,
                    Some(Ok(Message::Text(msg))) => match serde_json::from_str::<ClientMessage>(&msg) {
                        Ok(msg) => send_message!(self.handle(socket_id, msg).await),
                        Err(err) => {
                            tracing::warn!(?err, "received unparseable message from client: {msg:?}");
                            break;
                        }
                    },
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => (),
                    Some(msg) => {
                        tracing::warn!("received unexpected message from client: {msg:?}");
                        break;
                    }
                },
            }
        }

        self.0.write().await.remove(&socket_id);
        tracing::debug!(?socket_id, "realtime socket disconnected");
    }

    async fn handle(&self, socket_id: Uuid, msg: ClientMessage) -> FeedMessage {
        match msg {
            ClientMessage::Ping => FeedMessage::Pong,
            ClientMessage::Subscribe { channel, spec } => {
                let mut sockets = self.0.write().await;
                let status = match sockets.get_mut(&socket_id) {
                    Some(s) => {
                        tracing::debug!(?socket_id, channel, filter = %spec.filter, "subscribing");
                        s.channels.insert(channel.clone(), spec);
                        SubscribeStatus::Subscribed
                    }
                    None => SubscribeStatus::ChannelError,
                };
                FeedMessage::Status { channel, status }
            }
            ClientMessage::Unsubscribe { channel } => {
                if let Some(s) = self.0.write().await.get_mut(&socket_id) {
                    s.channels.remove(&channel);
                }
                FeedMessage::Status {
                    channel,
                    status: SubscribeStatus::Closed,
                }
            }
        }
    }

    /// Sends `events` to every channel whose spec matches them
    pub async fn relay(&self, events: &[ChangeEvent]) {
        let sockets = self.0.read().await;
        for event in events {
            for s in sockets.values() {
                for (channel, spec) in s.channels.iter() {
                    if spec.matches(event) {
                        let _ = s.sender.unbounded_send(FeedMessage::Change {
                            channel: channel.clone(),
                            event: event.clone(),
                        });
                    }
                }
            }
        }
    }
}
