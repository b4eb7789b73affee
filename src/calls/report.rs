//! Per-session negotiation report.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::transport::{IceCandidate, SessionDescription};

/// Everything exchanged during a negotiation, sent to the signaling
/// service when the session closes.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NegotiationReport {
    pub start_time: Option<DateTime<Utc>>,
    pub stop_time: Option<DateTime<Utc>>,
    pub last_sdp: Option<String>,
    pub descriptors_sent: Vec<SessionDescription>,
    pub descriptors_received: Vec<SessionDescription>,
    pub candidates_sent: Vec<IceCandidate>,
    pub candidates_received: Vec<IceCandidate>,
    pub stop_reason: Option<String>,
}

impl NegotiationReport {
    pub fn mark_started(&mut self) {
        if self.start_time.is_none() {
            self.start_time = Some(Utc::now());
        }
    }

    pub fn mark_stopped(&mut self) {
        self.stop_time = Some(Utc::now());
    }

    /// Record why the session stopped. The first reason is kept.
    pub fn record_stop_reason(&mut self, reason: impl Into<String>) {
        if self.stop_reason.is_none() {
            self.stop_reason = Some(reason.into());
        }
    }

    pub fn record_sent(&mut self, description: &SessionDescription) {
        self.descriptors_sent.push(description.clone());
    }

    pub fn record_received(&mut self, description: &SessionDescription) {
        self.last_sdp = Some(description.sdp.clone());
        self.descriptors_received.push(description.clone());
    }

    pub fn duration_secs(&self) -> Option<i64> {
        match (self.start_time, self.stop_time) {
            (Some(start), Some(stop)) => Some((stop - start).num_seconds()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_stop_reason_wins() {
        let mut report = NegotiationReport::default();
        report.record_stop_reason("setRemoteDescription failed at answer.");
        report.record_stop_reason("Remote side hung up");
        assert_eq!(
            report.stop_reason.as_deref(),
            Some("setRemoteDescription failed at answer.")
        );
    }

    #[test]
    fn test_received_description_updates_last_sdp() {
        let mut report = NegotiationReport::default();
        report.record_received(&SessionDescription::answer("v=0 answer"));
        assert_eq!(report.last_sdp.as_deref(), Some("v=0 answer"));
        assert_eq!(report.descriptors_received.len(), 1);
        assert!(report.descriptors_sent.is_empty());
    }

    #[test]
    fn test_duration_needs_both_timestamps() {
        let mut report = NegotiationReport::default();
        assert_eq!(report.duration_secs(), None);
        report.mark_started();
        let started = report.start_time;
        report.mark_started();
        assert_eq!(report.start_time, started);
        report.mark_stopped();
        assert!(report.duration_secs().unwrap() >= 0);
    }
}
