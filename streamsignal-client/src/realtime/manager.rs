use std::time::Duration;

use tokio::time::Instant;

use super::{retry_delay, Deduplicator, COOLDOWN};
use crate::api::{ChangeEvent, ChannelSpec, Filter, SubscribeStatus, Table};

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ChannelKind {
    /// Comment and reply rows
    Content,
    Votes,
}

impl ChannelKind {
    pub fn table(&self) -> Table {
        match self {
            ChannelKind::Content => Table::Comments,
            ChannelKind::Votes => Table::Votes,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum State {
    Idle,
    Subscribing,
    Subscribed,
    Cooldown { until: Instant },
}

/// What the owner of a `ChannelManager` must do after a transition
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Command {
    /// Open both channels, tagging them with `attempt`
    Open {
        attempt: u64,
        content: ChannelSpec,
        votes: ChannelSpec,
    },

    /// Close both channels
    Close,

    /// Call `on_retry` after this delay, replacing any pending retry
    RetryIn(Duration),

    CancelRetry,
}

/// Subscription lifecycle of one view's channel pair
///
/// Every transition is a method taking the current time and returning the
/// commands to execute. Status and event callbacks carry the attempt number
/// they were opened with, so that stragglers from a closed pair are ignored.
#[derive(Debug)]
pub struct ChannelManager {
    scope: Filter,
    state: State,
    mounted: bool,
    visible: bool,

    /// Set from `Open` until both channels are subscribed or one failed
    in_flight: bool,
    has_channels: bool,
    content_subscribed: bool,
    votes_subscribed: bool,

    attempt: u64,
    failures: u32,
    cooldown_until: Option<Instant>,
    retry_pending: bool,

    dedup: Deduplicator,
}

impl ChannelManager {
    /// `scope` is applied to both the comments and the votes channels
    pub fn new(scope: Filter) -> ChannelManager {
        ChannelManager {
            scope,
            state: State::Idle,
            mounted: true,
            visible: false,
            in_flight: false,
            has_channels: false,
            content_subscribed: false,
            votes_subscribed: false,
            attempt: 0,
            failures: 0,
            cooldown_until: None,
            retry_pending: false,
            dedup: Deduplicator::new(),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    /// Number of consecutive failed subscriptions
    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn has_channels(&self) -> bool {
        self.has_channels
    }

    pub fn spec(&self, kind: ChannelKind) -> ChannelSpec {
        ChannelSpec {
            table: kind.table(),
            filter: self.scope.clone(),
        }
    }

    pub fn set_visible(&mut self, visible: bool, now: Instant) -> Vec<Command> {
        if !self.mounted {
            return Vec::new();
        }
        self.visible = visible;
        if visible {
            self.try_open(now)
        } else {
            self.close()
        }
    }

    pub fn on_status(
        &mut self,
        attempt: u64,
        kind: ChannelKind,
        status: SubscribeStatus,
        now: Instant,
    ) -> Vec<Command> {
        if !self.is_current(attempt) {
            tracing::debug!(attempt, ?kind, ?status, "ignoring status of a closed channel");
            return Vec::new();
        }
        match status {
            SubscribeStatus::Subscribed => {
                match kind {
                    ChannelKind::Content => self.content_subscribed = true,
                    ChannelKind::Votes => self.votes_subscribed = true,
                }
                if self.content_subscribed && self.votes_subscribed {
                    tracing::info!(scope = %self.scope, "realtime channels subscribed");
                    self.state = State::Subscribed;
                    self.in_flight = false;
                    self.failures = 0;
                }
                Vec::new()
            }
            SubscribeStatus::ChannelError | SubscribeStatus::TimedOut | SubscribeStatus::Closed => {
                self.fail(kind, status, now)
            }
        }
    }

    /// Returns the event if it should be passed on to the view
    pub fn on_event(
        &mut self,
        attempt: u64,
        kind: ChannelKind,
        event: ChangeEvent,
    ) -> Option<ChangeEvent> {
        if !self.is_current(attempt) {
            return None;
        }
        if event.table != kind.table() {
            tracing::warn!(?kind, table = ?event.table, "event delivered on the wrong channel");
            return None;
        }
        if !self.dedup.first_delivery(&event) {
            tracing::debug!(?kind, "dropping duplicate realtime event");
            return None;
        }
        Some(event)
    }

    pub fn on_retry(&mut self, now: Instant) -> Vec<Command> {
        self.retry_pending = false;
        if !self.mounted || !self.visible {
            return Vec::new();
        }
        self.try_open(now)
    }

    /// The view goes away for good: close everything and ignore any further
    /// callback
    pub fn teardown(&mut self) -> Vec<Command> {
        let res = self.close();
        self.mounted = false;
        res
    }

    fn is_current(&self, attempt: u64) -> bool {
        self.mounted && self.has_channels && attempt == self.attempt
    }

    fn try_open(&mut self, now: Instant) -> Vec<Command> {
        if self.has_channels || self.in_flight {
            return Vec::new();
        }
        if let Some(until) = self.cooldown_until {
            if now < until {
                if self.retry_pending {
                    return Vec::new();
                }
                self.retry_pending = true;
                return vec![Command::RetryIn(until - now)];
            }
            self.cooldown_until = None;
        }
        self.attempt += 1;
        self.in_flight = true;
        self.has_channels = true;
        self.content_subscribed = false;
        self.votes_subscribed = false;
        self.state = State::Subscribing;
        vec![Command::Open {
            attempt: self.attempt,
            content: self.spec(ChannelKind::Content),
            votes: self.spec(ChannelKind::Votes),
        }]
    }

    fn close(&mut self) -> Vec<Command> {
        let mut res = Vec::new();
        if self.has_channels {
            res.push(Command::Close);
        }
        if self.retry_pending {
            res.push(Command::CancelRetry);
        }
        self.has_channels = false;
        self.in_flight = false;
        self.content_subscribed = false;
        self.votes_subscribed = false;
        self.retry_pending = false;
        self.state = State::Idle;
        res
    }

    fn fail(&mut self, kind: ChannelKind, status: SubscribeStatus, now: Instant) -> Vec<Command> {
        self.failures = self.failures.saturating_add(1);
        let mut res = self.close();
        let until = now + COOLDOWN;
        self.cooldown_until = Some(until);
        self.state = State::Cooldown { until };
        let delay = retry_delay(self.failures);
        tracing::warn!(
            ?kind,
            ?status,
            failures = self.failures,
            ?delay,
            "realtime channel failed, retrying later"
        );
        if self.visible {
            self.retry_pending = true;
            res.push(Command::RetryIn(delay));
        }
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ChangeKind, Uuid};
    use serde_json::json;

    fn manager() -> ChannelManager {
        ChannelManager::new(Filter::eq("review_id", "r1"))
    }

    fn open(m: &mut ChannelManager, now: Instant) -> u64 {
        let cmds = m.set_visible(true, now);
        match cmds.as_slice() {
            [Command::Open { attempt, .. }] => *attempt,
            cmds => panic!("expected an open command, got {cmds:?}"),
        }
    }

    fn subscribe_both(m: &mut ChannelManager, attempt: u64, now: Instant) {
        assert!(m
            .on_status(attempt, ChannelKind::Content, SubscribeStatus::Subscribed, now)
            .is_empty());
        assert!(m
            .on_status(attempt, ChannelKind::Votes, SubscribeStatus::Subscribed, now)
            .is_empty());
    }

    fn comment_insert(id: Uuid) -> ChangeEvent {
        ChangeEvent {
            table: Table::Comments,
            kind: ChangeKind::Insert,
            new: json!({ "id": id.to_string(), "review_id": "r1" }),
            old: serde_json::Value::Null,
            commit_timestamp: chrono::Utc::now(),
        }
    }

    #[test]
    fn opens_both_channels_on_visibility() {
        let mut m = manager();
        let now = Instant::now();
        assert_eq!(m.state(), State::Idle);
        let cmds = m.set_visible(true, now);
        assert_eq!(
            cmds,
            vec![Command::Open {
                attempt: 1,
                content: ChannelSpec {
                    table: Table::Comments,
                    filter: Filter::eq("review_id", "r1"),
                },
                votes: ChannelSpec {
                    table: Table::Votes,
                    filter: Filter::eq("review_id", "r1"),
                },
            }]
        );
        assert_eq!(m.state(), State::Subscribing);
        m.on_status(1, ChannelKind::Content, SubscribeStatus::Subscribed, now);
        assert_eq!(m.state(), State::Subscribing);
        m.on_status(1, ChannelKind::Votes, SubscribeStatus::Subscribed, now);
        assert_eq!(m.state(), State::Subscribed);
    }

    #[test]
    fn never_opens_two_pairs() {
        let mut m = manager();
        let now = Instant::now();
        open(&mut m, now);
        assert!(m.set_visible(true, now).is_empty());
        assert!(m.on_retry(now).is_empty());
        assert_eq!(m.attempt(), 1);
    }

    #[test]
    fn hiding_closes_channels() {
        let mut m = manager();
        let now = Instant::now();
        let attempt = open(&mut m, now);
        subscribe_both(&mut m, attempt, now);
        assert_eq!(m.set_visible(false, now), vec![Command::Close]);
        assert_eq!(m.state(), State::Idle);
        assert!(!m.has_channels());
        // late events from the closed pair are ignored
        assert!(m.on_event(attempt, ChannelKind::Content, comment_insert(Uuid::new_v4())).is_none());
        // showing again reopens with a new attempt
        assert_eq!(open(&mut m, now), attempt + 1);
    }

    #[test]
    fn failure_enters_cooldown_and_schedules_retry() {
        let mut m = manager();
        let t0 = Instant::now();
        let attempt = open(&mut m, t0);
        let cmds = m.on_status(attempt, ChannelKind::Votes, SubscribeStatus::TimedOut, t0);
        assert_eq!(cmds, vec![Command::Close, Command::RetryIn(Duration::from_secs(2))]);
        assert_eq!(m.failures(), 1);
        assert_eq!(m.state(), State::Cooldown { until: t0 + COOLDOWN });

        // the retry fires inside the cooldown: wait for the rest of it
        let t2 = t0 + Duration::from_secs(2);
        assert_eq!(m.on_retry(t2), vec![Command::RetryIn(Duration::from_secs(1))]);
        // and visibility changes during the cooldown do not open anything
        assert!(m.set_visible(true, t2).is_empty());

        let t3 = t0 + Duration::from_secs(3);
        match m.on_retry(t3).as_slice() {
            [Command::Open { attempt: 2, .. }] => (),
            cmds => panic!("expected a second attempt, got {cmds:?}"),
        }
        subscribe_both(&mut m, 2, t3);
        assert_eq!(m.failures(), 0);
    }

    #[test]
    fn exponential_backoff_after_five_failures() {
        let mut m = manager();
        let mut now = Instant::now();
        for n in 1..=10u32 {
            now += Duration::from_secs(60);
            let cmds = if n == 1 {
                m.set_visible(true, now)
            } else {
                m.on_retry(now)
            };
            let attempt = match cmds.as_slice() {
                [Command::Open { attempt, .. }] => *attempt,
                cmds => panic!("expected an open command, got {cmds:?}"),
            };
            let cmds = m.on_status(attempt, ChannelKind::Content, SubscribeStatus::ChannelError, now);
            let expected = if n <= 5 {
                Duration::from_secs(2)
            } else {
                Duration::from_millis(std::cmp::min(1000 * 2u64.pow(n - 5), 30000))
            };
            assert_eq!(cmds, vec![Command::Close, Command::RetryIn(expected)], "failure {n}");
        }
    }

    #[test]
    fn stale_status_is_ignored() {
        let mut m = manager();
        let now = Instant::now();
        let first = open(&mut m, now);
        m.set_visible(false, now);
        let second = open(&mut m, now);
        assert!(m
            .on_status(first, ChannelKind::Content, SubscribeStatus::ChannelError, now)
            .is_empty());
        assert_eq!(m.failures(), 0);
        subscribe_both(&mut m, second, now);
        assert_eq!(m.state(), State::Subscribed);
    }

    #[test]
    fn failure_while_hidden_does_not_retry() {
        let mut m = manager();
        let now = Instant::now();
        let attempt = open(&mut m, now);
        m.set_visible(false, now);
        assert!(m.on_status(attempt, ChannelKind::Content, SubscribeStatus::Closed, now).is_empty());
        assert!(m.on_retry(now + Duration::from_secs(10)).is_empty());
    }

    #[test]
    fn hiding_cancels_pending_retry() {
        let mut m = manager();
        let now = Instant::now();
        let attempt = open(&mut m, now);
        m.on_status(attempt, ChannelKind::Content, SubscribeStatus::Closed, now);
        assert_eq!(m.set_visible(false, now), vec![Command::CancelRetry]);
    }

    #[test]
    fn duplicate_events_are_dropped() {
        let mut m = manager();
        let now = Instant::now();
        let attempt = open(&mut m, now);
        subscribe_both(&mut m, attempt, now);
        let e = comment_insert(Uuid::new_v4());
        assert!(m.on_event(attempt, ChannelKind::Content, e.clone()).is_some());
        assert!(m.on_event(attempt, ChannelKind::Content, e.clone()).is_none());
        // also across reconnections
        m.set_visible(false, now);
        let attempt = open(&mut m, now);
        assert!(m.on_event(attempt, ChannelKind::Content, e.clone()).is_none());
        // and never on the wrong channel
        assert!(m.on_event(attempt, ChannelKind::Votes, comment_insert(Uuid::new_v4())).is_none());
    }

    #[test]
    fn teardown_is_final() {
        let mut m = manager();
        let now = Instant::now();
        let attempt = open(&mut m, now);
        assert_eq!(m.teardown(), vec![Command::Close]);
        assert!(m.set_visible(true, now).is_empty());
        assert!(m.on_status(attempt, ChannelKind::Content, SubscribeStatus::Subscribed, now).is_empty());
        assert!(m.on_retry(now).is_empty());
        assert!(m.on_event(attempt, ChannelKind::Content, comment_insert(Uuid::new_v4())).is_none());
    }
}
