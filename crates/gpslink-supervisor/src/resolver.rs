//! Candidate channel resolution.
//!
//! Produces a confidence-ranked, deduplicated, never-empty list of RFCOMM
//! channels to try for a device. Service discovery is consulted first;
//! any failure of it (error, timeout, empty answer) silently degrades to
//! the configured default and extended channel lists.

use std::fmt;
use std::sync::Arc;

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use gpslink_bluez::{ServiceDiscovery, ServiceRecord};
use gpslink_core::{BtAddress, Channel};

use crate::config::DiscoveryConfig;
use crate::diagnostics::{Diagnostic, DiagnosticSink};

// ============================================================================
// Candidate List
// ============================================================================

/// Why a channel is on the list, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Confidence {
    /// Forced by the caller.
    Override,
    /// Advertised under a matching service name.
    Advertised,
    /// Low-numbered default range.
    Default,
    /// Last-resort channel used by some relays.
    Extended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub channel: Channel,
    pub confidence: Confidence,
}

/// Ordered channel candidates.
///
/// Invariants: never empty, no duplicate channels. Entries keep their
/// insertion order, which callers build strongest-first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelCandidateList {
    candidates: Vec<Candidate>,
}

impl ChannelCandidateList {
    /// Builds a list from ranked entries, dropping repeats.
    ///
    /// An empty input yields the standard SPP channel.
    pub fn from_ranked(entries: impl IntoIterator<Item = (Channel, Confidence)>) -> Self {
        let mut list = Self {
            candidates: Vec::new(),
        };
        for (channel, confidence) in entries {
            list.push(channel, confidence);
        }
        if list.candidates.is_empty() {
            list.push(Channel::SPP_DEFAULT, Confidence::Default);
        }
        list
    }

    /// Builds a list of default-confidence channels in the given order.
    pub fn from_channels(channels: &[Channel]) -> Self {
        Self::from_ranked(channels.iter().map(|c| (*c, Confidence::Default)))
    }

    fn push(&mut self, channel: Channel, confidence: Confidence) {
        if !self.contains(channel) {
            self.candidates.push(Candidate {
                channel,
                confidence,
            });
        }
    }

    /// The channel tried first.
    pub fn primary(&self) -> Channel {
        self.candidates
            .first()
            .map_or(Channel::SPP_DEFAULT, |c| c.channel)
    }

    pub fn channels(&self) -> Vec<Channel> {
        self.candidates.iter().map(|c| c.channel).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Candidate> {
        self.candidates.iter()
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    /// Always false; present for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn contains(&self, channel: Channel) -> bool {
        self.candidates.iter().any(|c| c.channel == channel)
    }

    /// The candidate following `channel`, or the first other candidate
    /// if `channel` is not on the list.
    pub fn after(&self, channel: Channel) -> Option<Channel> {
        match self.candidates.iter().position(|c| c.channel == channel) {
            Some(index) => self.candidates.get(index + 1).map(|c| c.channel),
            None => self
                .candidates
                .iter()
                .map(|c| c.channel)
                .find(|c| *c != channel),
        }
    }

    /// Moves `channel` to the front (used after it connected).
    pub fn promote(&mut self, channel: Channel) {
        if let Some(index) = self.candidates.iter().position(|c| c.channel == channel) {
            let candidate = self.candidates.remove(index);
            self.candidates.insert(0, candidate);
        }
    }
}

impl fmt::Display for ChannelCandidateList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for candidate in &self.candidates {
            if !first {
                f.write_str(",")?;
            }
            write!(f, "{}", candidate.channel)?;
            first = false;
        }
        Ok(())
    }
}

// ============================================================================
// Resolver
// ============================================================================

pub struct ChannelResolver {
    discovery: Arc<dyn ServiceDiscovery>,
    config: DiscoveryConfig,
    diagnostics: DiagnosticSink,
}

impl ChannelResolver {
    pub fn new(
        discovery: Arc<dyn ServiceDiscovery>,
        config: DiscoveryConfig,
        diagnostics: DiagnosticSink,
    ) -> Self {
        Self {
            discovery,
            config,
            diagnostics,
        }
    }

    /// Discovers candidates for `address`. Never fails and never returns
    /// an empty list; bounded by the discovery deadline.
    pub async fn resolve(&self, address: BtAddress, cancel: &CancellationToken) -> ChannelCandidateList {
        self.diagnostics.emit(Diagnostic::ScanningServices { address });

        let browse = timeout(self.config.timeout(), self.discovery.browse(address));
        let records = tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Service discovery cancelled");
                Vec::new()
            }
            result = browse => match result {
                Ok(Ok(records)) => records,
                Ok(Err(e)) => {
                    warn!(%address, error = %e, "Service discovery failed; using defaults");
                    self.diagnostics.emit(Diagnostic::ServiceScanError { reason: e.to_string() });
                    Vec::new()
                }
                Err(_) => {
                    warn!(%address, timeout = ?self.config.timeout(), "Service discovery timed out; using defaults");
                    self.diagnostics.emit(Diagnostic::ServiceScanError {
                        reason: format!("timed out after {}s", self.config.timeout().as_secs()),
                    });
                    Vec::new()
                }
            },
        };

        let advertised = self.matching(&records);
        for record in &advertised {
            self.diagnostics.emit(Diagnostic::FoundService {
                channel: record.channel,
                name: record.name.clone().unwrap_or_default(),
            });
        }

        let list = ChannelCandidateList::from_ranked(
            advertised
                .iter()
                .map(|r| (r.channel, Confidence::Advertised))
                .chain(self.fallback_entries()),
        );
        info!(%address, candidates = %list, "Resolved candidate channels");
        self.diagnostics.emit(Diagnostic::Channels {
            channels: list.channels(),
        });
        list
    }

    /// Candidates when the caller forces a channel; no discovery runs.
    pub fn with_override(&self, channel: Channel) -> ChannelCandidateList {
        let list = ChannelCandidateList::from_ranked(
            std::iter::once((channel, Confidence::Override)).chain(self.fallback_entries()),
        );
        self.diagnostics.emit(Diagnostic::Channels {
            channels: list.channels(),
        });
        list
    }

    fn matching<'a>(&self, records: &'a [ServiceRecord]) -> Vec<&'a ServiceRecord> {
        records
            .iter()
            .filter(|record| record.matches_any(&self.config.keywords))
            .collect()
    }

    fn fallback_entries(&self) -> impl Iterator<Item = (Channel, Confidence)> + '_ {
        self.config
            .default_channels
            .iter()
            .map(|c| (*c, Confidence::Default))
            .chain(
                self.config
                    .extended_channels
                    .iter()
                    .map(|c| (*c, Confidence::Extended)),
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(n: u16) -> Channel {
        Channel::new(n).unwrap()
    }

    fn channels(list: &ChannelCandidateList) -> Vec<u8> {
        list.channels().iter().map(|c| c.get()).collect()
    }

    #[test]
    fn test_list_dedupes_and_keeps_first_confidence() {
        let list = ChannelCandidateList::from_ranked([
            (channel(17), Confidence::Advertised),
            (channel(1), Confidence::Default),
            (channel(17), Confidence::Extended),
        ]);

        assert_eq!(channels(&list), vec![17, 1]);
        assert_eq!(
            list.iter().next().map(|c| c.confidence),
            Some(Confidence::Advertised)
        );
    }

    #[test]
    fn test_list_is_never_empty() {
        let list = ChannelCandidateList::from_ranked(std::iter::empty());
        assert_eq!(list.len(), 1);
        assert!(!list.is_empty());
        assert_eq!(list.primary(), Channel::SPP_DEFAULT);
    }

    #[test]
    fn test_after_and_promote() {
        let mut list = ChannelCandidateList::from_channels(&[channel(1), channel(2), channel(3)]);

        assert_eq!(list.after(channel(1)), Some(channel(2)));
        assert_eq!(list.after(channel(3)), None);
        assert_eq!(list.after(channel(9)), Some(channel(1)));

        list.promote(channel(3));
        assert_eq!(channels(&list), vec![3, 1, 2]);
        assert_eq!(list.to_string(), "3,1,2");
    }

    #[test]
    fn test_confidence_ordering() {
        assert!(Confidence::Override < Confidence::Advertised);
        assert!(Confidence::Advertised < Confidence::Default);
        assert!(Confidence::Default < Confidence::Extended);
    }
}
