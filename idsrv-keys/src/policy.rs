//! Key lifecycle policy
//!
//! A key moves through four states purely as a function of its age:
//!
//! ```text
//! created        +activation_delay        +expiration        +expiration+retirement
//!    |---- Pending ----|------ Active ------|---- Retired ----|---- Expired ...
//! ```
//!
//! All classification takes `now` as an argument so that it can be exercised
//! without a real clock.
// Copyright 2025 Francisco F. Pinochet
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.


use crate::error::{KeyError, KeyResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Upper bound for any configured duration (100 years)
const MAX_POLICY_DURATION: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Lifecycle state of a signing key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    /// Stored but still propagating; must not sign
    Pending,
    /// Signs new material and validates existing signatures
    Active,
    /// Validates existing signatures only
    Retired,
    /// Eligible for permanent deletion
    Expired,
}

impl KeyStatus {
    pub fn can_sign(&self) -> bool {
        matches!(self, KeyStatus::Active)
    }

    pub fn can_validate(&self) -> bool {
        matches!(self, KeyStatus::Active | KeyStatus::Retired)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            KeyStatus::Pending => "pending",
            KeyStatus::Active => "active",
            KeyStatus::Retired => "retired",
            KeyStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// The three lifecycle windows, all measured from a key's creation time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyPolicy {
    pub activation_delay: Duration,
    pub expiration: Duration,
    pub retirement: Duration,
    /// Generate the successor while the current key is still active, so that
    /// it has finished propagating by the time the current key expires.
    pub pregenerate: bool,
}

impl Default for KeyPolicy {
    fn default() -> Self {
        Self {
            activation_delay: Duration::from_secs(14 * 24 * 60 * 60),
            expiration: Duration::from_secs(90 * 24 * 60 * 60),
            retirement: Duration::from_secs(14 * 24 * 60 * 60),
            pregenerate: false,
        }
    }
}

impl KeyPolicy {
    pub fn new(activation_delay: Duration, expiration: Duration, retirement: Duration) -> Self {
        Self {
            activation_delay,
            expiration,
            retirement,
            pregenerate: false,
        }
    }

    pub fn with_pregenerate(mut self, pregenerate: bool) -> Self {
        self.pregenerate = pregenerate;
        self
    }

    /// Reject orderings under which no key could ever sign
    pub fn validate(&self) -> KeyResult<()> {
        for (name, value) in [
            ("activation delay", self.activation_delay),
            ("expiration", self.expiration),
            ("retirement", self.retirement),
        ] {
            if value.is_zero() {
                return Err(KeyError::PolicyViolation(format!("{} must be positive", name)));
            }
            if value > MAX_POLICY_DURATION {
                return Err(KeyError::PolicyViolation(format!(
                    "{} of {}s is out of range",
                    name,
                    value.as_secs()
                )));
            }
        }

        if self.activation_delay >= self.expiration {
            return Err(KeyError::PolicyViolation(format!(
                "activation delay ({}s) must be shorter than expiration ({}s)",
                self.activation_delay.as_secs(),
                self.expiration.as_secs()
            )));
        }

        Ok(())
    }

    /// Classify a key created at `created` as of `now`.
    ///
    /// A creation time in the future (clock skew between nodes) counts as
    /// Pending.
    pub fn classify(&self, created: DateTime<Utc>, now: DateTime<Utc>) -> KeyStatus {
        let age = match (now - created).to_std() {
            Ok(age) => age,
            Err(_) => return KeyStatus::Pending,
        };

        if age < self.activation_delay {
            KeyStatus::Pending
        } else if age < self.expiration {
            KeyStatus::Active
        } else if age < self.expiration.saturating_add(self.retirement) {
            KeyStatus::Retired
        } else {
            KeyStatus::Expired
        }
    }

    /// Whether a rotation cycle at `now` must generate a new key, given the
    /// creation times of every stored key.
    pub fn needs_new_key<I>(&self, created: I, now: DateTime<Utc>) -> bool
    where
        I: IntoIterator<Item = DateTime<Utc>>,
    {
        let mut has_pending = false;
        let mut active_ages = Vec::new();

        for created in created {
            match self.classify(created, now) {
                KeyStatus::Pending => has_pending = true,
                KeyStatus::Active => {
                    active_ages.push((now - created).to_std().unwrap_or_default());
                }
                KeyStatus::Retired | KeyStatus::Expired => {}
            }
        }

        if has_pending {
            return false;
        }
        if active_ages.is_empty() {
            return true;
        }

        self.pregenerate
            && active_ages
                .iter()
                .all(|age| age.saturating_add(self.activation_delay) >= self.expiration)
    }
}

/// Scheduling knobs that sit alongside the policy windows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationSchedule {
    pub policy: KeyPolicy,
    pub rotation_interval: Duration,
    pub cache_ttl: Duration,
}

impl RotationSchedule {
    pub fn new(policy: KeyPolicy, rotation_interval: Duration, cache_ttl: Duration) -> Self {
        Self {
            policy,
            rotation_interval,
            cache_ttl,
        }
    }

    pub fn validate(&self) -> KeyResult<()> {
        self.policy.validate()?;

        if self.rotation_interval.is_zero() {
            return Err(KeyError::PolicyViolation(
                "rotation interval must be positive".to_string(),
            ));
        }
        if self.cache_ttl.is_zero() {
            return Err(KeyError::PolicyViolation("cache TTL must be positive".to_string()));
        }
        // A newly activated key has to be discovered before it is needed
        if self.cache_ttl >= self.policy.activation_delay {
            return Err(KeyError::PolicyViolation(format!(
                "cache TTL ({}s) must be shorter than activation delay ({}s)",
                self.cache_ttl.as_secs(),
                self.policy.activation_delay.as_secs()
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn demo_policy() -> KeyPolicy {
        KeyPolicy::new(
            Duration::from_secs(20),
            Duration::from_secs(40),
            Duration::from_secs(80),
        )
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_classification_boundaries() {
        let policy = demo_policy();
        let created = at(0);

        assert_eq!(policy.classify(created, at(0)), KeyStatus::Pending);
        assert_eq!(policy.classify(created, at(19)), KeyStatus::Pending);
        assert_eq!(policy.classify(created, at(20)), KeyStatus::Active);
        assert_eq!(policy.classify(created, at(39)), KeyStatus::Active);
        assert_eq!(policy.classify(created, at(40)), KeyStatus::Retired);
        assert_eq!(policy.classify(created, at(119)), KeyStatus::Retired);
        assert_eq!(policy.classify(created, at(120)), KeyStatus::Expired);
        assert_eq!(policy.classify(created, at(10_000)), KeyStatus::Expired);
    }

    #[test]
    fn test_classification_is_a_partition() {
        let policy = demo_policy();
        let created = at(0);

        for d in 0..200 {
            let status = policy.classify(created, at(d));
            let d = Duration::from_secs(d as u64);
            let expected = [
                d < policy.activation_delay,
                policy.activation_delay <= d && d < policy.expiration,
                policy.expiration <= d && d < policy.expiration + policy.retirement,
                d >= policy.expiration + policy.retirement,
            ];
            assert_eq!(expected.iter().filter(|b| **b).count(), 1);
            let index = match status {
                KeyStatus::Pending => 0,
                KeyStatus::Active => 1,
                KeyStatus::Retired => 2,
                KeyStatus::Expired => 3,
            };
            assert!(expected[index], "age {:?} classified as {}", d, status);
        }
    }

    #[test]
    fn test_future_creation_is_pending() {
        let policy = demo_policy();
        assert_eq!(policy.classify(at(30), at(0)), KeyStatus::Pending);
    }

    #[test]
    fn test_status_capabilities() {
        assert!(!KeyStatus::Pending.can_sign());
        assert!(!KeyStatus::Pending.can_validate());
        assert!(KeyStatus::Active.can_sign());
        assert!(KeyStatus::Active.can_validate());
        assert!(!KeyStatus::Retired.can_sign());
        assert!(KeyStatus::Retired.can_validate());
        assert!(!KeyStatus::Expired.can_validate());
    }

    #[test]
    fn test_needs_new_key() {
        let policy = demo_policy();

        assert!(policy.needs_new_key(Vec::new(), at(0)));
        // pending key covers the upcoming window
        assert!(!policy.needs_new_key(vec![at(0)], at(5)));
        // active key
        assert!(!policy.needs_new_key(vec![at(0)], at(25)));
        // only retired and expired keys left
        assert!(policy.needs_new_key(vec![at(0)], at(45)));
        assert!(policy.needs_new_key(vec![at(0)], at(500)));
    }

    #[test]
    fn test_pregenerate_creates_successor_before_expiry() {
        let policy = demo_policy().with_pregenerate(true);

        // 25s old: expires in 15s, sooner than the 20s activation delay
        assert!(policy.needs_new_key(vec![at(0)], at(25)));
        // a successor is already propagating
        assert!(!policy.needs_new_key(vec![at(0), at(25)], at(30)));
        // 21s old: still 19s left, so only just inside the window
        assert!(policy.needs_new_key(vec![at(0)], at(21)));
        assert!(!demo_policy().needs_new_key(vec![at(0)], at(21)));
    }

    #[test]
    fn test_policy_validation() {
        assert!(demo_policy().validate().is_ok());
        assert!(KeyPolicy::default().validate().is_ok());

        let inverted = KeyPolicy::new(
            Duration::from_secs(40),
            Duration::from_secs(40),
            Duration::from_secs(80),
        );
        assert!(matches!(inverted.validate(), Err(KeyError::PolicyViolation(_))));

        let zero = KeyPolicy::new(
            Duration::from_secs(20),
            Duration::from_secs(40),
            Duration::ZERO,
        );
        assert!(matches!(zero.validate(), Err(KeyError::PolicyViolation(_))));
    }

    #[test]
    fn test_schedule_validation() {
        let ok = RotationSchedule::new(demo_policy(), Duration::from_secs(5), Duration::from_secs(10));
        assert!(ok.validate().is_ok());

        let slow_cache =
            RotationSchedule::new(demo_policy(), Duration::from_secs(5), Duration::from_secs(20));
        assert!(matches!(slow_cache.validate(), Err(KeyError::PolicyViolation(_))));

        let no_interval = RotationSchedule::new(demo_policy(), Duration::ZERO, Duration::from_secs(10));
        assert!(matches!(no_interval.validate(), Err(KeyError::PolicyViolation(_))));
    }
}
