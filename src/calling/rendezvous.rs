//! Identity exchange between the two parties.
//!
//! The responder writes its fabric identity to an out-of-band channel; the
//! initiator polls that channel on a fixed interval until the identity shows
//! up or the attempt budget runs out.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tokio::time;
use url::Url;

use super::error::CallError;
use super::fabric::PeerIdentity;
use super::session::Role;

/// Out-of-band channel the two parties share.
pub trait RendezvousChannel: Send + Sync {
    /// Make our identity visible to the other party.
    fn publish(&self, identity: &PeerIdentity) -> Result<()>;

    /// The other party's identity, if it has been published.
    fn lookup(&self) -> Option<PeerIdentity>;
}

/// The navigation location both parties have open.
#[derive(Debug, Clone)]
pub struct SharedLocation {
    inner: Arc<Mutex<Url>>,
}

impl SharedLocation {
    pub fn parse(href: &str) -> Result<Self> {
        let url = Url::parse(href)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(url)),
        })
    }

    pub fn href(&self) -> String {
        self.lock().to_string()
    }

    pub fn query_param(&self, name: &str) -> Option<String> {
        self.lock()
            .query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
    }

    /// Set `name` to `value`, replacing any earlier value and keeping the
    /// other parameters in place.
    pub fn replace_query_param(&self, name: &str, value: &str) {
        let mut url = self.lock();
        let kept: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(k, _)| k != name)
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        url.query_pairs_mut()
            .clear()
            .extend_pairs(kept)
            .append_pair(name, value);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Url> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Rendezvous over a single query parameter of a shared location.
pub struct LocationRendezvous {
    location: SharedLocation,
    param: String,
}

impl LocationRendezvous {
    pub fn new(location: SharedLocation, param: impl Into<String>) -> Self {
        Self {
            location,
            param: param.into(),
        }
    }
}

impl RendezvousChannel for LocationRendezvous {
    fn publish(&self, identity: &PeerIdentity) -> Result<()> {
        self.location
            .replace_query_param(&self.param, identity.as_str());
        tracing::info!("Published identity {} as ?{}", identity, self.param);
        Ok(())
    }

    fn lookup(&self) -> Option<PeerIdentity> {
        self.location
            .query_param(&self.param)
            .filter(|v| !v.is_empty())
            .map(PeerIdentity::new)
    }
}

/// Bounded, monotonic attempt counter. Only a new counter starts over.
#[derive(Debug, Clone)]
pub struct AttemptCounter {
    attempts: u32,
    max: u32,
}

impl AttemptCounter {
    pub fn new(max: u32) -> Self {
        Self { attempts: 0, max }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn remaining(&self) -> u32 {
        self.max - self.attempts
    }

    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max
    }

    /// Use up one attempt. Returns the attempt number, or `None` when the
    /// budget is gone.
    pub fn try_consume(&mut self) -> Option<u32> {
        if self.is_exhausted() {
            return None;
        }
        self.attempts += 1;
        Some(self.attempts)
    }
}

/// One step of a resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolutionStep {
    /// Lookup `attempt` found nothing; another one is scheduled.
    Waiting { attempt: u32 },
    Found(PeerIdentity),
    TimedOut,
}

/// Finds the other party's identity.
pub struct IdentityResolver {
    channel: Arc<dyn RendezvousChannel>,
    role: Role,
    counter: AttemptCounter,
    interval: Duration,
    finished: bool,
}

impl IdentityResolver {
    pub fn new(
        channel: Arc<dyn RendezvousChannel>,
        role: Role,
        max_attempts: u32,
        interval: Duration,
    ) -> Self {
        Self {
            channel,
            role,
            counter: AttemptCounter::new(max_attempts),
            interval,
            finished: false,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.counter.attempts()
    }

    /// Publish our own identity. Only the responder publishes.
    pub fn publish(&self, self_id: &PeerIdentity) -> Result<()> {
        match self.role {
            Role::Responder => self.channel.publish(self_id),
            Role::Initiator => {
                tracing::debug!("Initiator does not publish its identity");
                Ok(())
            }
        }
    }

    /// Run the next lookup. Every lookup after the first waits one interval.
    ///
    /// Returns `None` once the resolution has finished.
    pub async fn next_step(&mut self) -> Option<ResolutionStep> {
        if self.finished {
            return None;
        }

        if self.counter.attempts() > 0 {
            time::sleep(self.interval).await;
        }

        let attempt = match self.counter.try_consume() {
            Some(n) => n,
            None => {
                self.finished = true;
                return Some(ResolutionStep::TimedOut);
            }
        };

        if let Some(identity) = self.channel.lookup() {
            tracing::info!("Resolved remote identity {} on attempt {}", identity, attempt);
            self.finished = true;
            return Some(ResolutionStep::Found(identity));
        }

        if self.counter.is_exhausted() {
            tracing::warn!("No remote identity after {} attempts", attempt);
            self.finished = true;
            return Some(ResolutionStep::TimedOut);
        }

        tracing::debug!(
            "Remote identity not published yet (attempt {}, {} left)",
            attempt,
            self.counter.remaining()
        );
        Some(ResolutionStep::Waiting { attempt })
    }

    /// Poll until the identity appears or the budget runs out.
    pub async fn resolve(mut self) -> Result<PeerIdentity, CallError> {
        while let Some(step) = self.next_step().await {
            match step {
                ResolutionStep::Waiting { .. } => continue,
                ResolutionStep::Found(identity) => return Ok(identity),
                ResolutionStep::TimedOut => break,
            }
        }
        Err(CallError::ResolutionTimeout)
    }
}
