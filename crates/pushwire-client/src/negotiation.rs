//! Handshake validation and the timing parameters derived from it.

use std::time::Duration;

use pushwire_core::{NegotiationResponse, ProtocolVersion};

use crate::error::{ClientError, ClientResult};

/// Keep-alive parameters offered by the server.
///
/// The slow warning fires at two thirds of the timeout and the heartbeat
/// checks three times per timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepAliveData {
    pub timeout: Duration,
    pub timeout_warning: Duration,
    pub check_interval: Duration,
}

impl KeepAliveData {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            timeout_warning: timeout * 2 / 3,
            check_interval: timeout / 3,
        }
    }
}

/// A validated handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiationResult {
    pub protocol_version: ProtocolVersion,
    pub connection_id: String,
    pub connection_token: String,
    pub disconnect_timeout: Duration,
    pub keep_alive_timeout: Option<Duration>,
}

impl NegotiationResult {
    /// Validate a raw handshake response.
    ///
    /// The version must be exactly [`ProtocolVersion::SUPPORTED`]; a missing
    /// or unparsable version is reported as a mismatch too.
    pub fn from_response(response: NegotiationResponse) -> ClientResult<Self> {
        let raw = response.protocol_version.as_deref();
        let protocol_version = raw
            .and_then(|v| v.parse::<ProtocolVersion>().ok())
            .filter(ProtocolVersion::is_supported)
            .ok_or_else(|| ClientError::protocol_incompatible(raw))?;

        if response.connection_token.is_empty() {
            return Err(ClientError::negotiation("handshake carried no connection token"));
        }

        let disconnect_timeout = seconds("disconnectTimeout", response.disconnect_timeout)?;
        let keep_alive_timeout = match response.keep_alive_timeout {
            Some(secs) => Some(seconds("keepAliveTimeout", secs)?).filter(|d| !d.is_zero()),
            None => None,
        };

        Ok(Self {
            protocol_version,
            connection_id: response.connection_id,
            connection_token: response.connection_token,
            disconnect_timeout,
            keep_alive_timeout,
        })
    }

    pub fn keep_alive(&self) -> Option<KeepAliveData> {
        self.keep_alive_timeout.map(KeepAliveData::new)
    }

    /// How long the client may stay in reconnecting before giving up.
    pub fn reconnect_window(&self) -> Duration {
        match self.keep_alive_timeout {
            Some(keep_alive) => self.disconnect_timeout + keep_alive,
            None => self.disconnect_timeout,
        }
    }
}

fn seconds(field: &str, value: f64) -> ClientResult<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| ClientError::negotiation(format!("{field} is not a valid duration: {value}")))
}

/// Timing in force for one start attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Timing {
    pub disconnect_timeout: Duration,
    pub keep_alive: Option<KeepAliveData>,
    pub reconnect_window: Duration,
    pub heartbeat_period: Duration,
}

/// Shortest heartbeat tick; tokio intervals reject a zero period.
const MIN_HEARTBEAT_PERIOD: Duration = Duration::from_millis(1);

impl Timing {
    /// The heartbeat ticks at least twice per reconnect window, so a healthy
    /// connection is never mistaken for a suspended one.
    pub fn new(negotiated: &NegotiationResult, default_period: Duration) -> Self {
        let keep_alive = negotiated.keep_alive();
        let reconnect_window = negotiated.reconnect_window();
        let period = keep_alive.map_or(default_period, |k| k.check_interval);
        Self {
            disconnect_timeout: negotiated.disconnect_timeout,
            keep_alive,
            reconnect_window,
            heartbeat_period: period.min(reconnect_window / 2).max(MIN_HEARTBEAT_PERIOD),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(version: Option<&str>, keep_alive: Option<f64>) -> NegotiationResponse {
        NegotiationResponse {
            protocol_version: version.map(str::to_string),
            connection_id: "conn-1".into(),
            connection_token: "token-1".into(),
            disconnect_timeout: 30.0,
            keep_alive_timeout: keep_alive,
        }
    }

    #[test]
    fn accepts_supported_version() {
        let result = NegotiationResult::from_response(response(Some("1.2"), Some(10.0))).unwrap();
        assert_eq!(result.protocol_version, ProtocolVersion::SUPPORTED);
        assert_eq!(result.connection_id, "conn-1");
        assert_eq!(result.disconnect_timeout, Duration::from_secs(30));
    }

    #[test]
    fn rejects_other_versions() {
        for version in [Some("2.0"), Some("1.1"), Some("garbage"), None] {
            let err = NegotiationResult::from_response(response(version, None)).unwrap_err();
            assert!(
                matches!(err, ClientError::ProtocolIncompatible { .. }),
                "{version:?} gave {err:?}"
            );
        }
    }

    #[test]
    fn reconnect_window_with_keep_alive() {
        let result = NegotiationResult::from_response(response(Some("1.2"), Some(10.0))).unwrap();
        assert_eq!(result.reconnect_window(), Duration::from_secs(40));
    }

    #[test]
    fn reconnect_window_without_keep_alive() {
        let result = NegotiationResult::from_response(response(Some("1.2"), None)).unwrap();
        assert_eq!(result.reconnect_window(), Duration::from_secs(30));
        assert!(result.keep_alive().is_none());
    }

    #[test]
    fn zero_keep_alive_means_none() {
        let result = NegotiationResult::from_response(response(Some("1.2"), Some(0.0))).unwrap();
        assert!(result.keep_alive_timeout.is_none());
    }

    #[test]
    fn rejects_negative_timeouts() {
        let mut resp = response(Some("1.2"), None);
        resp.disconnect_timeout = -1.0;
        let err = NegotiationResult::from_response(resp).unwrap_err();
        assert!(matches!(err, ClientError::Negotiation { .. }));

        let err = NegotiationResult::from_response(response(Some("1.2"), Some(f64::NAN)))
            .unwrap_err();
        assert!(matches!(err, ClientError::Negotiation { .. }));
    }

    #[test]
    fn keep_alive_thresholds() {
        let k = KeepAliveData::new(Duration::from_secs(9));
        assert_eq!(k.timeout_warning, Duration::from_secs(6));
        assert_eq!(k.check_interval, Duration::from_secs(3));
    }

    #[test]
    fn heartbeat_period_falls_back_to_default() {
        let result = NegotiationResult::from_response(response(Some("1.2"), None)).unwrap();
        let timing = Timing::new(&result, Duration::from_secs(5));
        assert_eq!(timing.heartbeat_period, Duration::from_secs(5));

        let result = NegotiationResult::from_response(response(Some("1.2"), Some(12.0))).unwrap();
        let timing = Timing::new(&result, Duration::from_secs(5));
        assert_eq!(timing.heartbeat_period, Duration::from_secs(4));
        assert_eq!(timing.reconnect_window, Duration::from_secs(42));
    }

    #[test]
    fn heartbeat_period_stays_inside_short_window() {
        let mut resp = response(Some("1.2"), None);
        resp.disconnect_timeout = 3.0;
        let result = NegotiationResult::from_response(resp).unwrap();
        let timing = Timing::new(&result, Duration::from_secs(5));
        assert_eq!(timing.heartbeat_period, Duration::from_millis(1500));

        let mut resp = response(Some("1.2"), None);
        resp.disconnect_timeout = 0.0;
        let result = NegotiationResult::from_response(resp).unwrap();
        let timing = Timing::new(&result, Duration::from_secs(5));
        assert_eq!(timing.heartbeat_period, Duration::from_millis(1));
    }
}
