//! Simulator channel adapter.
//!
//! An ordinary adapter registered under `channel_id = "simulator"`; the
//! HTTP `message` route feeds inbounds through it like any external
//! channel, and its sends land in an inspectable outbox instead of a
//! network. No bridge or router code branches on this channel.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;

use crate::agent::transport::BoxFuture;
use crate::bridge::adapter::ChannelAdapter;
use crate::Result;

/// Channel id the simulator registers under.
pub const SIMULATOR_CHANNEL: &str = "simulator";

/// One delivery captured by the simulator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatorDelivery {
    /// Reply target: the inbound message id for replies, the chat key for
    /// free-standing sends.
    pub target: String,
    /// Delivered text.
    pub text: String,
    /// Whether this was a threaded reply.
    pub is_reply: bool,
    /// Capture timestamp.
    pub at: DateTime<Utc>,
}

/// Loopback adapter whose sends are captured in memory.
#[derive(Default)]
pub struct SimulatorAdapter {
    outbox: Mutex<VecDeque<SimulatorDelivery>>,
    notify: Notify,
}

impl SimulatorAdapter {
    /// Create an empty simulator adapter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Pop the oldest captured delivery.
    #[must_use]
    pub fn take_delivery(&self) -> Option<SimulatorDelivery> {
        self.outbox.lock().ok().and_then(|mut o| o.pop_front())
    }

    /// Await the next delivery.
    pub async fn next_delivery(&self) -> SimulatorDelivery {
        loop {
            let notified = self.notify.notified();
            if let Some(delivery) = self.take_delivery() {
                return delivery;
            }
            notified.await;
        }
    }

    /// Snapshot of all captured deliveries, oldest first.
    #[must_use]
    pub fn deliveries(&self) -> Vec<SimulatorDelivery> {
        self.outbox.lock().map(|o| o.iter().cloned().collect()).unwrap_or_default()
    }

    fn capture(&self, target: &str, text: &str, is_reply: bool) {
        if let Ok(mut outbox) = self.outbox.lock() {
            outbox.push_back(SimulatorDelivery {
                target: target.to_owned(),
                text: text.to_owned(),
                is_reply,
                at: Utc::now(),
            });
        }
        self.notify.notify_waiters();
    }
}

impl ChannelAdapter for SimulatorAdapter {
    fn channel_id(&self) -> &str {
        SIMULATOR_CHANNEL
    }

    fn send_text<'a>(&'a self, to: &'a str, text: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.capture(to, text, false);
            Ok(())
        })
    }

    fn reply_text<'a>(&'a self, reply_to_id: &'a str, text: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.capture(reply_to_id, text, true);
            Ok(())
        })
    }

    fn send_typing<'a>(&'a self, _to: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { Ok(()) })
    }
}
