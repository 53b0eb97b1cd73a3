use std::pin::Pin;

use anyhow::Context;
use async_trait::async_trait;
use futures::{channel::mpsc, StreamExt};
use tokio::{
    sync::watch,
    time::{Instant, Sleep},
};

use super::{ChannelKind, ChannelManager, Command};
use crate::api::{ChangeEvent, ChannelSpec, Filter, SubscribeStatus};

#[derive(Clone, Debug, PartialEq)]
pub enum ChannelMessage {
    Status(SubscribeStatus),
    Change(ChangeEvent),
}

/// Receiving end of one realtime channel
///
/// Dropping it closes the channel.
#[derive(Debug)]
pub struct Subscription {
    messages: mpsc::UnboundedReceiver<ChannelMessage>,
}

impl Subscription {
    /// Returns the sending end to be kept by the realtime backend
    pub fn channel() -> (mpsc::UnboundedSender<ChannelMessage>, Subscription) {
        let (sender, messages) = mpsc::unbounded();
        (sender, Subscription { messages })
    }

    pub async fn next(&mut self) -> Option<ChannelMessage> {
        self.messages.next().await
    }
}

/// A managed pub/sub service delivering row changes
#[async_trait]
pub trait Realtime: Send + Sync {
    /// Opens a channel named `channel`
    ///
    /// The subscription status is reported as a `ChannelMessage::Status` on
    /// the returned subscription.
    async fn subscribe(&self, channel: &str, spec: ChannelSpec) -> anyhow::Result<Subscription>;
}

#[derive(Debug, Default)]
struct Pair {
    attempt: u64,
    content: Option<Subscription>,
    votes: Option<Subscription>,
}

impl Pair {
    async fn next(&mut self) -> (ChannelKind, Option<ChannelMessage>) {
        match (&mut self.content, &mut self.votes) {
            (Some(c), Some(v)) => tokio::select! {
                m = c.next() => (ChannelKind::Content, m),
                m = v.next() => (ChannelKind::Votes, m),
            },
            (Some(c), None) => (ChannelKind::Content, c.next().await),
            (None, Some(v)) => (ChannelKind::Votes, v.next().await),
            (None, None) => futures::future::pending().await,
        }
    }
}

/// The realtime channels of one review view
pub struct ReviewChannels<R> {
    realtime: R,
    name: String,
    manager: ChannelManager,
}

impl<R: Realtime> ReviewChannels<R> {
    /// Channels are named `{name}:content` and `{name}:votes`
    pub fn new(realtime: R, name: impl Into<String>, scope: Filter) -> ReviewChannels<R> {
        ReviewChannels {
            realtime,
            name: name.into(),
            manager: ChannelManager::new(scope),
        }
    }

    /// Keeps the channels open while `visible` is true, calling `on_event`
    /// with every first delivery of a change
    ///
    /// Returns once the sending end of `visible` is dropped, after closing
    /// the channels. Dropping the future also closes them.
    pub async fn run<F>(mut self, mut visible: watch::Receiver<bool>, mut on_event: F)
    where
        F: FnMut(ChannelKind, ChangeEvent),
    {
        let mut pair = Pair::default();
        let retry = tokio::time::sleep(std::time::Duration::ZERO);
        tokio::pin!(retry);
        let mut retry_armed = false;

        let initially_visible = *visible.borrow();
        let cmds = self.manager.set_visible(initially_visible, Instant::now());
        self.execute(cmds, &mut pair, retry.as_mut(), &mut retry_armed)
            .await;

        loop {
            let cmds = tokio::select! {
                changed = visible.changed() => match changed {
                    Ok(()) => {
                        let now_visible = *visible.borrow();
                        self.manager.set_visible(now_visible, Instant::now())
                    }
                    Err(_) => {
                        let cmds = self.manager.teardown();
                        self.execute(cmds, &mut pair, retry.as_mut(), &mut retry_armed)
                            .await;
                        tracing::info!(name = %self.name, "realtime channels torn down");
                        return;
                    }
                },
                () = &mut retry, if retry_armed => {
                    retry_armed = false;
                    self.manager.on_retry(Instant::now())
                }
                (kind, msg) = pair.next() => {
                    let attempt = pair.attempt;
                    match msg {
                        Some(ChannelMessage::Status(status)) => {
                            self.manager.on_status(attempt, kind, status, Instant::now())
                        }
                        Some(ChannelMessage::Change(event)) => {
                            if let Some(event) = self.manager.on_event(attempt, kind, event) {
                                on_event(kind, event);
                            }
                            Vec::new()
                        }
                        None => self.manager.on_status(
                            attempt,
                            kind,
                            SubscribeStatus::Closed,
                            Instant::now(),
                        ),
                    }
                }
            };
            self.execute(cmds, &mut pair, retry.as_mut(), &mut retry_armed)
                .await;
        }
    }

    async fn execute(
        &mut self,
        mut cmds: Vec<Command>,
        pair: &mut Pair,
        mut retry: Pin<&mut Sleep>,
        retry_armed: &mut bool,
    ) {
        // failing to open feeds more commands back
        while !cmds.is_empty() {
            let mut next = Vec::new();
            for cmd in cmds {
                match cmd {
                    Command::Open {
                        attempt,
                        content,
                        votes,
                    } => match self.open(attempt, content, votes).await {
                        Ok(p) => *pair = p,
                        Err(err) => {
                            tracing::warn!(?err, name = %self.name, "failed opening realtime channels");
                            // the manager still believes the pair is open
                            *pair = Pair {
                                attempt,
                                content: None,
                                votes: None,
                            };
                            next.extend(self.manager.on_status(
                                attempt,
                                ChannelKind::Content,
                                SubscribeStatus::ChannelError,
                                Instant::now(),
                            ));
                        }
                    },
                    Command::Close => *pair = Pair::default(),
                    Command::RetryIn(delay) => {
                        retry.as_mut().reset(Instant::now() + delay);
                        *retry_armed = true;
                    }
                    Command::CancelRetry => *retry_armed = false,
                }
            }
            cmds = next;
        }
    }

    async fn open(
        &self,
        attempt: u64,
        content: ChannelSpec,
        votes: ChannelSpec,
    ) -> anyhow::Result<Pair> {
        let content = self
            .realtime
            .subscribe(&format!("{}:content", self.name), content)
            .await
            .context("subscribing to the content channel")?;
        let votes = self
            .realtime
            .subscribe(&format!("{}:votes", self.name), votes)
            .await
            .context("subscribing to the votes channel")?;
        Ok(Pair {
            attempt,
            content: Some(content),
            votes: Some(votes),
        })
    }
}
