//! The per-connection authentication state machine.
//!
//! A connection is authenticated by a set of factors evaluated in the
//! fixed order of [`Factor::ORDER`]. Each factor is either required or
//! not, and every required factor has a tri-state verification result:
//! unset, verified, or failed.
//!
//! The aggregate state is derived, never stored:
//!
//! - walk the required factors in order;
//! - the first one that is not verified decides the result (unset or
//!   failed);
//! - if every required factor is verified, the connection is
//!   authenticated.
//!
//! What *is* stored is the last aggregate announced to the client, so
//! that each change is emitted exactly once.

use serde::{Deserialize, Serialize};
use tether_protocol::Factor;

use crate::SessionError;

/// Which factors are required. The persisted form of the factor set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FactorConfig {
    pub confirmation: bool,
    pub passport: bool,
}

impl Default for FactorConfig {
    fn default() -> Self {
        Self {
            confirmation: true,
            passport: false,
        }
    }
}

impl FactorConfig {
    /// Returns whether `factor` is required.
    pub fn requires(&self, factor: Factor) -> bool {
        match factor {
            Factor::Passport => self.passport,
            Factor::Confirmation => self.confirmation,
        }
    }

    /// Checks the at-least-one-required rule.
    ///
    /// # Errors
    /// [`SessionError::NoRequiredFactor`] if no factor is required.
    pub fn validate(&self) -> Result<(), SessionError> {
        if Factor::ORDER.iter().any(|f| self.requires(*f)) {
            Ok(())
        } else {
            Err(SessionError::NoRequiredFactor)
        }
    }

    fn set(&mut self, factor: Factor, required: bool) {
        match factor {
            Factor::Passport => self.passport = required,
            Factor::Confirmation => self.confirmation = required,
        }
    }
}

/// State of one factor on one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FactorState {
    pub factor: Factor,
    pub required: bool,
    /// An ask was sent for the current socket.
    pub asked: bool,
    /// `None` until a result is recorded.
    pub verified: Option<bool>,
}

impl FactorState {
    fn new(factor: Factor, required: bool) -> Self {
        Self {
            factor,
            required,
            asked: false,
            verified: None,
        }
    }
}

/// Ordered factor states for one connection.
#[derive(Debug, Clone)]
pub struct AuthFactors {
    states: [FactorState; 2],
    announced: Option<bool>,
}

impl AuthFactors {
    /// Builds the factor set.
    ///
    /// # Errors
    /// [`SessionError::NoRequiredFactor`] if no factor is required.
    pub fn new(config: FactorConfig) -> Result<Self, SessionError> {
        config.validate()?;
        Ok(Self {
            states: Factor::ORDER.map(|f| FactorState::new(f, config.requires(f))),
            announced: None,
        })
    }

    /// Returns the current required set as a config.
    pub fn config(&self) -> FactorConfig {
        let mut config = FactorConfig {
            confirmation: false,
            passport: false,
        };
        for state in &self.states {
            config.set(state.factor, state.required);
        }
        config
    }

    /// Marks a factor required or optional.
    ///
    /// # Errors
    /// [`SessionError::NoRequiredFactor`] if the change would leave no
    /// factor required. The set is unchanged in that case.
    pub fn set_required(&mut self, factor: Factor, required: bool) -> Result<(), SessionError> {
        let mut config = self.config();
        config.set(factor, required);
        config.validate()?;
        self.state_mut(factor).required = required;
        Ok(())
    }

    pub fn get(&self, factor: Factor) -> FactorState {
        self.states[index(factor)]
    }

    pub fn is_required(&self, factor: Factor) -> bool {
        self.get(factor).required
    }

    /// Iterates the factors in evaluation order.
    pub fn iter(&self) -> impl Iterator<Item = &FactorState> {
        self.states.iter()
    }

    /// Clears every result and ask, as on a fresh socket.
    pub fn reset(&mut self) {
        for state in &mut self.states {
            state.asked = false;
            state.verified = None;
        }
        self.announced = None;
    }

    /// Picks the factor to ask for next and marks it asked.
    ///
    /// That is the first required factor without a result. Returns `None`
    /// if there is none, or if it was already asked.
    pub fn next_ask(&mut self) -> Option<Factor> {
        let state = self
            .states
            .iter_mut()
            .find(|s| s.required && s.verified.is_none())?;
        if state.asked {
            return None;
        }
        state.asked = true;
        Some(state.factor)
    }

    /// Records the result of one factor.
    pub fn record(&mut self, factor: Factor, verified: bool) {
        let state = self.state_mut(factor);
        state.asked = true;
        state.verified = Some(verified);
    }

    /// The derived aggregate: `None` while undecided.
    pub fn aggregate(&self) -> Option<bool> {
        for state in self.states.iter().filter(|s| s.required) {
            if state.verified != Some(true) {
                return state.verified;
            }
        }
        Some(true)
    }

    pub fn is_authenticated(&self) -> bool {
        self.aggregate() == Some(true)
    }

    /// `true` while some required factor is verified and another
    /// required factor has not been asked yet. No aggregate is announced
    /// in that window.
    pub fn in_transition(&self) -> bool {
        let required = || self.states.iter().filter(|s| s.required);
        required().any(|s| s.verified == Some(true))
            && required().any(|s| !s.asked && s.verified.is_none())
    }

    /// Returns the aggregate if it should be announced now, and remembers
    /// it as announced.
    ///
    /// Nothing is returned while in transition, while undecided, or when
    /// the value equals the last one announced.
    pub fn take_aggregate_change(&mut self) -> Option<bool> {
        if self.in_transition() {
            return None;
        }
        let value = self.aggregate()?;
        if self.announced == Some(value) {
            return None;
        }
        self.announced = Some(value);
        Some(value)
    }

    fn state_mut(&mut self, factor: Factor) -> &mut FactorState {
        &mut self.states[index(factor)]
    }
}

fn index(factor: Factor) -> usize {
    match factor {
        Factor::Passport => 0,
        Factor::Confirmation => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn both() -> AuthFactors {
        AuthFactors::new(FactorConfig {
            confirmation: true,
            passport: true,
        })
        .unwrap()
    }

    #[test]
    fn test_new_with_no_required_factor_fails() {
        let result = AuthFactors::new(FactorConfig {
            confirmation: false,
            passport: false,
        });
        assert!(matches!(result, Err(SessionError::NoRequiredFactor)));
    }

    #[test]
    fn test_set_required_refuses_to_clear_last_factor() {
        let mut factors = AuthFactors::new(FactorConfig::default()).unwrap();
        let result = factors.set_required(Factor::Confirmation, false);
        assert!(matches!(result, Err(SessionError::NoRequiredFactor)));
        assert!(factors.is_required(Factor::Confirmation));
    }

    #[test]
    fn test_set_required_swaps_factors() {
        let mut factors = AuthFactors::new(FactorConfig::default()).unwrap();
        factors.set_required(Factor::Passport, true).unwrap();
        factors.set_required(Factor::Confirmation, false).unwrap();
        assert_eq!(
            factors.config(),
            FactorConfig {
                confirmation: false,
                passport: true
            }
        );
    }

    #[test]
    fn test_aggregate_follows_first_unverified_factor() {
        let mut factors = both();
        assert_eq!(factors.aggregate(), None);

        factors.record(Factor::Passport, true);
        assert_eq!(factors.aggregate(), None);

        factors.record(Factor::Confirmation, false);
        assert_eq!(factors.aggregate(), Some(false));

        factors.record(Factor::Confirmation, true);
        assert_eq!(factors.aggregate(), Some(true));
    }

    #[test]
    fn test_aggregate_ignores_optional_factors() {
        let mut factors = AuthFactors::new(FactorConfig::default()).unwrap();
        factors.record(Factor::Passport, false);
        factors.record(Factor::Confirmation, true);
        assert!(factors.is_authenticated());
    }

    #[test]
    fn test_next_ask_walks_required_order_once() {
        let mut factors = both();
        assert_eq!(factors.next_ask(), Some(Factor::Passport));
        assert_eq!(factors.next_ask(), None);

        factors.record(Factor::Passport, true);
        assert_eq!(factors.next_ask(), Some(Factor::Confirmation));
        assert_eq!(factors.next_ask(), None);
    }

    #[test]
    fn test_take_aggregate_change_suppressed_in_transition() {
        let mut factors = both();
        factors.next_ask();
        factors.record(Factor::Passport, true);
        // confirmation not yet asked
        assert!(factors.in_transition());
        assert_eq!(factors.take_aggregate_change(), None);

        factors.next_ask();
        factors.record(Factor::Confirmation, true);
        assert_eq!(factors.take_aggregate_change(), Some(true));
        assert_eq!(factors.take_aggregate_change(), None);
    }

    #[test]
    fn test_take_aggregate_change_reports_deny_once() {
        let mut factors = both();
        factors.next_ask();
        factors.record(Factor::Passport, false);
        // a failure is not a transition, even with confirmation unasked
        assert!(!factors.in_transition());
        assert_eq!(factors.take_aggregate_change(), Some(false));
        assert_eq!(factors.take_aggregate_change(), None);
    }

    #[test]
    fn test_reset_clears_results_and_announcement() {
        let mut factors = AuthFactors::new(FactorConfig::default()).unwrap();
        factors.next_ask();
        factors.record(Factor::Confirmation, true);
        assert_eq!(factors.take_aggregate_change(), Some(true));

        factors.reset();
        let state = factors.get(Factor::Confirmation);
        assert_eq!(state.verified, None);
        assert!(!state.asked);
        assert_eq!(factors.next_ask(), Some(Factor::Confirmation));
    }

    #[test]
    fn test_factor_config_json_shape() {
        let json = serde_json::to_value(FactorConfig::default()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "confirmation": true, "passport": false })
        );
    }
}
