//! Property tests: key rings never hold two ACTIVE or two NEXT keys, and only
//! a lapsed TLS ring may be without an ACTIVE key once provisioned.

use chrono::{Duration, Utc};
use firmups_keys::{ExpiryOutcome, KeyRing};
use firmups_types::{CryptoAlgorithm, DeviceId, KeyMaterial, KeyStatus, KeyType};
use proptest::prelude::*;

// ---------------------------------------------------------------------------
// Helpers / Strategies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum RingOp {
    Provision,
    BeginRotation,
    Commit,
    Cancel,
    /// Advance the clock by this many days and check expiry
    Tick(i64),
}

fn op_strategy() -> impl Strategy<Value = Vec<RingOp>> {
    prop::collection::vec(
        prop_oneof![
            Just(RingOp::Provision),
            Just(RingOp::BeginRotation),
            Just(RingOp::Commit),
            Just(RingOp::Cancel),
            (0i64..60).prop_map(RingOp::Tick),
        ],
        0..40,
    )
}

fn material(key_type: KeyType, now: chrono::DateTime<Utc>) -> KeyMaterial {
    match key_type {
        KeyType::Lightweight => KeyMaterial::Lightweight {
            algorithm: CryptoAlgorithm::AsconAead128,
            key: vec![0x5a; 16].into(),
        },
        KeyType::Tls => KeyMaterial::Tls {
            valid_from: now,
            valid_to: now + Duration::days(30),
        },
    }
}

fn count(ring: &KeyRing, status: KeyStatus) -> usize {
    ring.rows().iter().filter(|k| k.status == status).count()
}

// ---------------------------------------------------------------------------
// Property Tests
// ---------------------------------------------------------------------------

proptest! {
    #[test]
    fn ring_invariants_hold_for_any_sequence(
        ops in op_strategy(),
        tls in any::<bool>(),
    ) {
        let key_type = if tls { KeyType::Tls } else { KeyType::Lightweight };
        let mut now = Utc::now();
        let mut ring = KeyRing::empty(DeviceId::generate(), key_type);
        let mut provisioned = false;
        let mut rows_seen = 0;

        for op in ops {
            let before = ring.clone();
            let result = match op {
                RingOp::Provision => ring.provision(material(key_type, now), now).map(Some),
                RingOp::BeginRotation => ring.begin_rotation(material(key_type, now), now).map(Some),
                RingOp::Commit => ring.commit_rotation().map(Some),
                RingOp::Cancel => ring.cancel_rotation().map(Some),
                RingOp::Tick(days) => {
                    now += Duration::days(days);
                    let (changed, outcome) = ring.expire_overdue(now, Duration::days(5));
                    if !tls {
                        prop_assert_eq!(outcome, ExpiryOutcome::NotApplicable);
                    }
                    Ok(changed)
                }
            };

            match result {
                Ok(Some(next)) => {
                    prop_assert_eq!(next.revision, before.revision + 1);
                    ring = next;
                }
                Ok(None) => prop_assert_eq!(&ring, &before),
                // Failed transitions never touch the ring
                Err(_) => prop_assert_eq!(&ring, &before),
            }

            provisioned |= ring.active().is_some();

            prop_assert!(count(&ring, KeyStatus::Active) <= 1);
            prop_assert!(count(&ring, KeyStatus::Next) <= 1);
            if provisioned && count(&ring, KeyStatus::Active) == 0 {
                prop_assert!(tls && ring.is_lapsed());
            }

            // Keys are never deleted
            let rows = ring.rows().len();
            prop_assert!(rows >= rows_seen);
            rows_seen = rows;
        }
    }
}
