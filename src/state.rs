//! The certificate state predicate: given a loaded secret and the policy
//! that governs it, decide whether it is missing, ready, or due for
//! rotation.

use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use cron::Schedule;

use crate::secret_repo::{SecretRecord, DURATION_ANNOTATION, VALID_UPTO_ANNOTATION};

/// Fixed lead time ahead of the next scheduled rotation a certificate must
/// clear to still be considered `Ready`.
const EXPIRY_LEAD_TIME: Duration = Duration::hours(1);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CertState {
    /// No secret, a required data key is absent, or the secret carries no
    /// certificate annotations at all (never written by this tool).
    Missing,
    /// Present, annotated, hash-consistent, and not due for rotation.
    Ready,
    /// Present but stale, with the reason as one of the fixed strings:
    /// `"Secret data altered"`, `"Duration mismatch"`, `"About to expire"`,
    /// `"Expiry annotation invalid"`, `"Invalid cron"`.
    RotationRequired(String),
}

/// Returns the instant a cron expression next fires at or after `now`.
pub fn next_cron_fire(expr: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    Schedule::from_str(expr).ok().and_then(|s| s.after(&now).next())
}

/// Evaluate the state of a certificate secret.
///
/// `required_keys` are the data keys that must be present (e.g.
/// `["tls.crt", "tls.key"]`). `configured_duration` is the lifetime this
/// tool is currently configured to mint certs with; a stored cert minted
/// under a different duration is stale so a policy change takes effect on
/// the next run. `cron_expr` is the rotation schedule for this leaf.
///
/// Ready iff `valid-upto - nextCronFire >= 1h`; `RotationRequired("About to
/// expire")` iff `valid-upto - nextCronFire < 1h`.
pub fn evaluate(
    record: Option<&SecretRecord>,
    required_keys: &[&str],
    configured_duration: Duration,
    cron_expr: &str,
    now: DateTime<Utc>,
) -> CertState {
    let Some(record) = record else {
        return CertState::Missing;
    };

    for key in required_keys {
        if !record.data.contains_key(*key) {
            return CertState::Missing;
        }
    }

    let (valid_upto_str, duration_str) = match (
        record.annotations.get(VALID_UPTO_ANNOTATION),
        record.annotations.get(DURATION_ANNOTATION),
    ) {
        (Some(valid_upto), Some(duration)) => (valid_upto, duration),
        _ => return CertState::Missing,
    };

    if !record.hash_matches() {
        return CertState::RotationRequired("Secret data altered".to_string());
    }

    let stored_duration_secs = match duration_str.parse::<i64>() {
        Ok(secs) => secs,
        Err(_) => return CertState::RotationRequired("Duration mismatch".to_string()),
    };
    if stored_duration_secs != configured_duration.num_seconds() {
        return CertState::RotationRequired("Duration mismatch".to_string());
    }

    let valid_upto = match DateTime::parse_from_rfc3339(valid_upto_str) {
        Ok(dt) => dt.with_timezone(&Utc),
        Err(_) => return CertState::RotationRequired("Expiry annotation invalid".to_string()),
    };

    let next_fire = match next_cron_fire(cron_expr, now) {
        Some(next_fire) => next_fire,
        None => return CertState::RotationRequired("Invalid cron".to_string()),
    };

    if valid_upto - next_fire >= EXPIRY_LEAD_TIME {
        CertState::Ready
    } else {
        CertState::RotationRequired("About to expire".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secret_repo::SecretRecord;
    use std::collections::BTreeMap;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-07-27T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn data(keys: &[&str]) -> BTreeMap<String, Vec<u8>> {
        keys.iter()
            .map(|k| (k.to_string(), b"material".to_vec()))
            .collect()
    }

    fn annotated_record(valid_upto: DateTime<Utc>, duration: Duration) -> SecretRecord {
        SecretRecord::for_certificate(
            data(&["tls.crt", "tls.key"]),
            valid_upto - duration,
            valid_upto,
            duration,
            "kubernetes.io/tls",
        )
    }

    #[test]
    fn missing_when_no_secret() {
        let state = evaluate(None, &["tls.crt", "tls.key"], Duration::hours(1), "0 0 1 * *", now());
        assert_eq!(state, CertState::Missing);
    }

    #[test]
    fn missing_when_required_key_absent() {
        let rec = SecretRecord::new(data(&["tls.crt"]));
        let state = evaluate(Some(&rec), &["tls.crt", "tls.key"], Duration::hours(1), "0 0 1 * *", now());
        assert_eq!(state, CertState::Missing);
    }

    #[test]
    fn missing_when_data_complete_but_unannotated() {
        let rec = SecretRecord::new(data(&["tls.crt", "tls.key"]));
        let state = evaluate(Some(&rec), &["tls.crt", "tls.key"], Duration::hours(1), "0 0 1 * *", now());
        assert_eq!(state, CertState::Missing);
    }

    #[test]
    fn rotation_required_when_hash_tampered() {
        let mut rec = annotated_record(now() + Duration::days(400), Duration::days(365));
        rec.data.insert("tls.crt".to_string(), b"different".to_vec());
        let state = evaluate(Some(&rec), &["tls.crt", "tls.key"], Duration::days(365), "0 0 1 1 *", now());
        assert_eq!(state, CertState::RotationRequired("Secret data altered".to_string()));
    }

    #[test]
    fn rotation_required_when_duration_changed() {
        let rec = annotated_record(now() + Duration::days(400), Duration::days(365));
        let state = evaluate(Some(&rec), &["tls.crt", "tls.key"], Duration::days(100), "0 0 1 1 *", now());
        assert_eq!(state, CertState::RotationRequired("Duration mismatch".to_string()));
    }

    #[test]
    fn ready_when_comfortably_before_next_fire() {
        let rec = annotated_record(now() + Duration::days(400), Duration::days(365));
        let state = evaluate(Some(&rec), &["tls.crt", "tls.key"], Duration::days(365), "0 0 1 1 *", now());
        assert_eq!(state, CertState::Ready);
    }

    #[test]
    fn ready_at_exactly_one_hour_past_the_boundary() {
        // next fire for "0 0 1 8 *" starting 2026-07-27 is 2026-08-01T00:00:00Z.
        let next_fire = DateTime::parse_from_rfc3339("2026-08-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let valid_upto = next_fire + Duration::hours(1);
        let rec = annotated_record(valid_upto, Duration::days(365));
        let state = evaluate(Some(&rec), &["tls.crt", "tls.key"], Duration::days(365), "0 0 1 8 *", now());
        assert_eq!(state, CertState::Ready);
    }

    #[test]
    fn rotation_required_fifty_nine_minutes_past_the_boundary() {
        let next_fire = DateTime::parse_from_rfc3339("2026-08-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let valid_upto = next_fire + Duration::minutes(59);
        let rec = annotated_record(valid_upto, Duration::days(365));
        let state = evaluate(Some(&rec), &["tls.crt", "tls.key"], Duration::days(365), "0 0 1 8 *", now());
        assert_eq!(state, CertState::RotationRequired("About to expire".to_string()));
    }

    #[test]
    fn rotation_required_when_cron_unparseable() {
        let rec = annotated_record(now() + Duration::days(400), Duration::days(365));
        let state = evaluate(
            Some(&rec),
            &["tls.crt", "tls.key"],
            Duration::days(365),
            "not a cron expression",
            now(),
        );
        assert_eq!(state, CertState::RotationRequired("Invalid cron".to_string()));
    }

    #[test]
    fn rotation_required_when_expiry_annotation_invalid() {
        let mut rec = annotated_record(now() + Duration::days(400), Duration::days(365));
        rec.annotations
            .insert(VALID_UPTO_ANNOTATION.to_string(), "not-a-date".to_string());
        rec.refresh_hash();
        let state = evaluate(Some(&rec), &["tls.crt", "tls.key"], Duration::days(365), "0 0 1 1 *", now());
        assert_eq!(
            state,
            CertState::RotationRequired("Expiry annotation invalid".to_string())
        );
    }
}
