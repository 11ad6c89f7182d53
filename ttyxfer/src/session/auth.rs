//! Authorization gate: password bypass or user consent.
//!
//! A session that presents `bypass=sha256:<hex>` is decided immediately by
//! comparing against `sha256(id ";" secret)`. Everything else goes to the
//! [`ConsentProvider`], which may answer now or later through
//! [`SessionManager::deliver_consent`](super::SessionManager::deliver_consent).

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::debug;

use super::Direction;
use crate::config::ConsentPolicy;
use crate::protocol::{BypassCredential, SessionRequest};

/// Bypass timestamps further than this from the receive time are rejected
pub const BYPASS_WINDOW_SECS: i64 = 5 * 60;

const NANOS_PER_SEC: i64 = 1_000_000_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Consent {
    Granted,
    Denied(String),
}

/// What the consent provider is asked about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub id: String,
    pub direction: Direction,
    /// Number of specs a receive session will query
    pub expected_files: u64,
}

/// Source of user consent. `None` means the answer will arrive later.
pub trait ConsentProvider {
    fn request_consent(&mut self, summary: &SessionSummary) -> Option<Consent>;
}

/// Answers every request according to a fixed policy.
#[derive(Debug, Clone, Copy)]
pub struct StaticConsent {
    policy: ConsentPolicy,
}

impl StaticConsent {
    pub fn new(policy: ConsentPolicy) -> Self {
        Self { policy }
    }
}

impl ConsentProvider for StaticConsent {
    fn request_consent(&mut self, summary: &SessionSummary) -> Option<Consent> {
        debug!("Consent requested for session {} ({:?})", summary.id, summary.direction);
        match self.policy {
            ConsentPolicy::Allow => Some(Consent::Granted),
            ConsentPolicy::Deny => Some(Consent::Denied("User refused the transfer".to_string())),
            ConsentPolicy::Ask => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Decided(Consent),
    Pending,
}

#[derive(Debug, Clone, Default)]
pub struct AuthorizationGate {
    secret: Option<String>,
}

impl AuthorizationGate {
    /// An empty secret disables the bypass path.
    pub fn new(secret: Option<String>) -> Self {
        Self {
            secret: secret.filter(|secret| !secret.is_empty()),
        }
    }

    /// Decide a new session. `received_at` is the receive time of the
    /// initiating command, nanoseconds since the epoch.
    pub fn authorize(
        &self,
        summary: &SessionSummary,
        request: &SessionRequest,
        received_at: i64,
        consent: &mut dyn ConsentProvider,
    ) -> GateDecision {
        if let (Some(secret), Some(credential)) = (&self.secret, &request.bypass) {
            return GateDecision::Decided(check_bypass(
                &summary.id,
                secret,
                credential,
                request.timestamp,
                received_at,
            ));
        }

        match consent.request_consent(summary) {
            Some(decision) => GateDecision::Decided(decision),
            None => GateDecision::Pending,
        }
    }
}

/// Hex `sha256(session_id ";" secret)`
pub fn bypass_digest(session_id: &str, secret: &str) -> String {
    hex::encode(raw_bypass_digest(session_id, secret))
}

fn raw_bypass_digest(session_id: &str, secret: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(session_id.as_bytes());
    hasher.update(b";");
    hasher.update(secret.as_bytes());
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&hasher.finalize());
    digest
}

fn check_bypass(
    session_id: &str,
    secret: &str,
    credential: &BypassCredential,
    timestamp: Option<i64>,
    received_at: i64,
) -> Consent {
    if let Some(timestamp) = timestamp {
        let skew = received_at.saturating_sub(timestamp).unsigned_abs();
        if skew > (BYPASS_WINDOW_SECS * NANOS_PER_SEC) as u64 {
            return Consent::Denied("Bypass timestamp is stale".to_string());
        }
    }

    if credential.algorithm != "sha256" {
        return Consent::Denied(format!(
            "Unsupported bypass hash {}",
            credential.algorithm
        ));
    }

    let Ok(provided) = hex::decode(&credential.digest) else {
        return Consent::Denied("Bypass digest is not hex".to_string());
    };
    let expected = raw_bypass_digest(session_id, secret);
    if bool::from(expected.as_slice().ct_eq(provided.as_slice())) {
        Consent::Granted
    } else {
        Consent::Denied("Incorrect bypass password".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::QuietLevel;

    struct Counting {
        calls: usize,
        answer: Option<Consent>,
    }

    impl ConsentProvider for Counting {
        fn request_consent(&mut self, _summary: &SessionSummary) -> Option<Consent> {
            self.calls += 1;
            self.answer.clone()
        }
    }

    fn summary(id: &str) -> SessionSummary {
        SessionSummary {
            id: id.to_string(),
            direction: Direction::Send,
            expected_files: 0,
        }
    }

    fn request(bypass: Option<String>, timestamp: Option<i64>) -> SessionRequest {
        SessionRequest {
            quiet: QuietLevel::Verbose,
            bypass: bypass.map(|b| BypassCredential::parse(&b).unwrap()),
            timestamp,
            expected_files: 0,
        }
    }

    const NOW: i64 = 1_700_000_000 * NANOS_PER_SEC;

    #[test]
    fn test_digest_is_hex_sha256() {
        let digest = bypass_digest("s1", "secret");
        assert_eq!(digest.len(), 64);
        assert!(digest.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_ne!(digest, bypass_digest("s2", "secret"));
    }

    #[test]
    fn test_valid_bypass_skips_consent() {
        let gate = AuthorizationGate::new(Some("secret".to_string()));
        let mut consent = Counting { calls: 0, answer: None };
        let bypass = format!("sha256:{}", bypass_digest("s1", "secret"));

        let decision = gate.authorize(&summary("s1"), &request(Some(bypass), Some(NOW)), NOW, &mut consent);
        assert_eq!(decision, GateDecision::Decided(Consent::Granted));
        assert_eq!(consent.calls, 0);
    }

    #[test]
    fn test_wrong_digest_denied_without_consent() {
        let gate = AuthorizationGate::new(Some("secret".to_string()));
        let mut consent = Counting { calls: 0, answer: Some(Consent::Granted) };
        let bypass = format!("sha256:{}", bypass_digest("s1", "other"));

        let decision = gate.authorize(&summary("s1"), &request(Some(bypass), None), NOW, &mut consent);
        assert!(matches!(decision, GateDecision::Decided(Consent::Denied(_))));
        assert_eq!(consent.calls, 0);
    }

    #[test]
    fn test_stale_timestamp_denied() {
        let gate = AuthorizationGate::new(Some("secret".to_string()));
        let mut consent = Counting { calls: 0, answer: None };
        let bypass = format!("sha256:{}", bypass_digest("s1", "secret"));
        let stale = NOW - (BYPASS_WINDOW_SECS + 1) * NANOS_PER_SEC;

        let decision = gate.authorize(&summary("s1"), &request(Some(bypass.clone()), Some(stale)), NOW, &mut consent);
        assert!(matches!(decision, GateDecision::Decided(Consent::Denied(_))));

        let fresh = NOW - (BYPASS_WINDOW_SECS - 1) * NANOS_PER_SEC;
        let decision = gate.authorize(&summary("s1"), &request(Some(bypass), Some(fresh)), NOW, &mut consent);
        assert_eq!(decision, GateDecision::Decided(Consent::Granted));
    }

    #[test]
    fn test_no_bypass_asks_consent() {
        let gate = AuthorizationGate::new(Some("secret".to_string()));
        let mut consent = Counting { calls: 0, answer: None };

        let decision = gate.authorize(&summary("s1"), &request(None, None), NOW, &mut consent);
        assert_eq!(decision, GateDecision::Pending);
        assert_eq!(consent.calls, 1);
    }

    #[test]
    fn test_bypass_without_secret_falls_back_to_consent() {
        let gate = AuthorizationGate::new(Some(String::new()));
        let mut consent = Counting { calls: 0, answer: Some(Consent::Granted) };
        let bypass = format!("sha256:{}", bypass_digest("s1", ""));

        let decision = gate.authorize(&summary("s1"), &request(Some(bypass), None), NOW, &mut consent);
        assert_eq!(decision, GateDecision::Decided(Consent::Granted));
        assert_eq!(consent.calls, 1);
    }

    #[test]
    fn test_bypass_digest_must_be_hex() {
        let gate = AuthorizationGate::new(Some("secret".to_string()));
        let mut consent = Counting { calls: 0, answer: None };
        let truncated = format!("sha256:{}", &bypass_digest("s1", "secret")[..62]);
        let garbage = format!("sha256:{}", "zz".repeat(32));

        for bypass in [truncated, garbage] {
            let decision = gate.authorize(&summary("s1"), &request(Some(bypass), None), NOW, &mut consent);
            assert!(matches!(decision, GateDecision::Decided(Consent::Denied(_))));
        }
        assert_eq!(consent.calls, 0);
    }

    #[test]
    fn test_static_policies() {
        let s = summary("s1");
        assert_eq!(StaticConsent::new(ConsentPolicy::Allow).request_consent(&s), Some(Consent::Granted));
        assert!(matches!(
            StaticConsent::new(ConsentPolicy::Deny).request_consent(&s),
            Some(Consent::Denied(_))
        ));
        assert_eq!(StaticConsent::new(ConsentPolicy::Ask).request_consent(&s), None);
    }
}
