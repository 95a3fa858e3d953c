use log::{debug, warn};

use crate::error::{ProtocolError, Result};
use crate::identity::IdentityKey;
use crate::prekey::{OneTimePreKey, PreKeyBundle, SignedPreKey};

/// Freshness rules for a fetched signed pre-key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FreshnessPolicy {
    pub max_lifetime_secs: i64,
    pub max_clock_skew_secs: i64,
}

impl Default for FreshnessPolicy {
    fn default() -> Self {
        Self {
            // 30 days
            max_lifetime_secs: 30 * 24 * 60 * 60,
            max_clock_skew_secs: 5 * 60,
        }
    }
}

/// A bundle whose signature and freshness have been checked.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidBundle {
    bundle: PreKeyBundle,
}

impl ValidBundle {
    pub fn identity_key(&self) -> &IdentityKey {
        &self.bundle.identity_key
    }

    pub fn signed_pre_key(&self) -> &SignedPreKey {
        &self.bundle.signed_pre_key
    }

    pub fn one_time_pre_keys(&self) -> &[OneTimePreKey] {
        &self.bundle.one_time_pre_keys
    }

    /// No one-time pre-key was available; the agreement runs with three terms.
    pub fn degraded(&self) -> bool {
        self.bundle.one_time_pre_keys.is_empty()
    }

    /// Picks the first advertised one-time pre-key.
    pub fn select_one_time_pre_key(&self) -> Option<OneTimePreKey> {
        self.bundle.one_time_pre_keys.first().copied()
    }

    pub fn into_inner(self) -> PreKeyBundle {
        self.bundle
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct BundleValidator {
    policy: FreshnessPolicy,
}

impl BundleValidator {
    pub fn new(policy: FreshnessPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &FreshnessPolicy {
        &self.policy
    }

    /// `now` is unix seconds.
    pub fn validate(&self, bundle: PreKeyBundle, now: i64) -> Result<ValidBundle> {
        let spk = &bundle.signed_pre_key;
        if !spk.verify(&bundle.identity_key) {
            warn!(
                "Rejecting bundle of {}: signed pre-key {} signature does not verify",
                bundle.identity_key, spk.key_id
            );
            return Err(ProtocolError::InvalidSignature);
        }

        let age = now.saturating_sub(spk.created_at);
        if age > self.policy.max_lifetime_secs || age < -self.policy.max_clock_skew_secs {
            warn!(
                "Rejecting bundle of {}: signed pre-key {} has age {}s",
                bundle.identity_key, spk.key_id, age
            );
            return Err(ProtocolError::Expired {
                key_id: spk.key_id,
                created_at: spk.created_at,
            });
        }

        if bundle.one_time_pre_keys.is_empty() {
            debug!(
                "Bundle of {} carries no one-time pre-keys",
                bundle.identity_key
            );
        }

        Ok(ValidBundle { bundle })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curve::{SIGNATURE_LENGTH, Signature};
    use crate::identity::IdentityKeyPair;
    use crate::prekey::{OneTimePreKeyRecord, SignedPreKeyRecord};

    const NOW: i64 = 1_750_000_000;

    fn bundle(created_at: i64, one_time: usize) -> PreKeyBundle {
        let mut csprng = rand::rng();
        let identity = IdentityKeyPair::generate(&mut csprng);
        let spk = SignedPreKeyRecord::generate(1, &identity, created_at, &mut csprng);
        PreKeyBundle {
            identity_key: *identity.identity_key(),
            signed_pre_key: spk.public(),
            one_time_pre_keys: (0..one_time as u32)
                .map(|id| OneTimePreKeyRecord::generate(id + 7, &mut csprng).public())
                .collect(),
        }
    }

    #[test]
    fn fresh_signed_bundle_is_valid() {
        let valid = BundleValidator::default().validate(bundle(NOW - 60, 2), NOW).unwrap();
        assert!(!valid.degraded());
        assert_eq!(valid.select_one_time_pre_key().map(|k| k.key_id), Some(7));
    }

    #[test]
    fn empty_pool_is_degraded_but_valid() {
        let valid = BundleValidator::default().validate(bundle(NOW, 0), NOW).unwrap();
        assert!(valid.degraded());
        assert_eq!(valid.select_one_time_pre_key(), None);
    }

    #[test]
    fn any_flipped_signature_bit_is_rejected() {
        let original = bundle(NOW, 1);
        let validator = BundleValidator::default();
        for bit in 0..SIGNATURE_LENGTH * 8 {
            let mut tampered = original.clone();
            let mut bytes = tampered.signed_pre_key.signature.to_bytes();
            bytes[bit / 8] ^= 1 << (bit % 8);
            tampered.signed_pre_key.signature = Signature::from_bytes(bytes);
            assert_eq!(
                validator.validate(tampered, NOW),
                Err(ProtocolError::InvalidSignature)
            );
        }
    }

    #[test]
    fn substituted_identity_is_rejected() {
        let mut b = bundle(NOW, 1);
        b.identity_key = *IdentityKeyPair::generate(&mut rand::rng()).identity_key();
        assert_eq!(
            BundleValidator::default().validate(b, NOW),
            Err(ProtocolError::InvalidSignature)
        );
    }

    #[test]
    fn old_and_future_keys_are_expired() {
        let policy = FreshnessPolicy {
            max_lifetime_secs: 1000,
            max_clock_skew_secs: 10,
        };
        let validator = BundleValidator::new(policy);

        assert!(validator.validate(bundle(NOW - 1000, 1), NOW).is_ok());
        assert!(matches!(
            validator.validate(bundle(NOW - 1001, 1), NOW),
            Err(ProtocolError::Expired { key_id: 1, .. })
        ));
        assert!(validator.validate(bundle(NOW + 10, 1), NOW).is_ok());
        assert!(matches!(
            validator.validate(bundle(NOW + 11, 1), NOW),
            Err(ProtocolError::Expired { .. })
        ));
    }
}
