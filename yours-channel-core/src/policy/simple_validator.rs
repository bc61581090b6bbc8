use crate::prelude::*;

use bitcoin::absolute::LockTime;
use bitcoin::hashes::hash160;
use bitcoin::{Network, Sequence};
use log::warn;
use serde_derive::{Deserialize, Serialize};

use crate::channel::ChannelBalance;
use crate::policy::filter::{FilterResult, PolicyFilter};
use crate::policy::validator::Validator;
use crate::policy::{Policy, DEFAULT_DUST_LIMIT_SAT, DEFAULT_FEE_PER_KB_SAT, MAX_MONEY_SAT};
use crate::tx::tx::CommitmentTerms;
use crate::util::status::{invalid_proposal, Status};

use super::error::{policy_error, ValidationError};

/// Channel configuration and the thresholds enforced on counterparty proposals
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SimplePolicy {
    /// Network for addresses
    pub network: Network,
    /// Fee rate, charged per started kilobyte
    pub fee_per_kb_sat: u64,
    /// Largest fee a counterparty may charge
    pub max_fee_sat: u64,
    /// Non-zero outputs below this are rejected
    pub dust_limit_sat: u64,
    /// Relative delay of the RHTLC HTLC branch, in blocks
    pub htlc_delay: u16,
    /// Relative delay of the refund branches, in blocks.  Must exceed `htlc_delay`.
    pub refund_delay: u16,
    /// Largest amount a channel may lock
    pub max_funding_sat: u64,
    /// Policy filter
    #[serde(default)]
    pub filter: PolicyFilter,
}

impl SimplePolicy {
    /// Fails unless the refund delay is strictly longer than the HTLC delay
    pub fn check_delays(&self) -> Result<(), Status> {
        if self.refund_delay <= self.htlc_delay {
            return Err(invalid_proposal(format!(
                "refund delay {} must exceed htlc delay {}",
                self.refund_delay, self.htlc_delay
            )));
        }
        Ok(())
    }
}

impl Policy for SimplePolicy {
    fn policy_error(&self, tag: String, msg: String) -> Result<(), ValidationError> {
        if self.filter.filter(tag.clone()) == FilterResult::Error {
            Err(policy_error(msg))
        } else {
            warn!("policy failed: {} {}", tag, msg);
            #[cfg(feature = "use_backtrace")]
            warn!("BACKTRACE:\n{:?}", backtrace::Backtrace::new());
            Ok(())
        }
    }
}

/// Default policy for a network
pub fn make_simple_policy(network: Network) -> SimplePolicy {
    if network == Network::Bitcoin {
        SimplePolicy {
            network,
            fee_per_kb_sat: DEFAULT_FEE_PER_KB_SAT,
            max_fee_sat: 100_000,
            dust_limit_sat: DEFAULT_DUST_LIMIT_SAT,
            htlc_delay: 6 * 24,  // a day
            refund_delay: 6 * 48, // two days
            max_funding_sat: MAX_MONEY_SAT,
            filter: PolicyFilter::default(),
        }
    } else {
        SimplePolicy {
            network,
            fee_per_kb_sat: DEFAULT_FEE_PER_KB_SAT,
            max_fee_sat: 100_000,
            dust_limit_sat: DEFAULT_DUST_LIMIT_SAT,
            htlc_delay: 6,
            refund_delay: 12,
            max_funding_sat: MAX_MONEY_SAT,
            filter: PolicyFilter::default(),
        }
    }
}

/// A simple validator
pub struct SimpleValidator {
    policy: SimplePolicy,
}

impl SimpleValidator {
    /// A validator enforcing `policy`
    pub fn new(policy: SimplePolicy) -> Self {
        SimpleValidator { policy }
    }

    /// The enforced policy
    pub fn simple_policy(&self) -> &SimplePolicy {
        &self.policy
    }

    fn validate_fee(&self, fee_sat: u64) -> Result<(), ValidationError> {
        if fee_sat > self.policy.max_fee_sat {
            policy_err!(
                self,
                "policy-fee-range",
                "fee {} exceeds maximum {}",
                fee_sat,
                self.policy.max_fee_sat
            );
        }
        Ok(())
    }

    fn validate_output_value(&self, tag: &str, name: &str, value_sat: u64) -> Result<(), ValidationError> {
        if value_sat != 0 && value_sat < self.policy.dust_limit_sat {
            policy_err!(self, tag, "{} output {} below dust limit {}", name, value_sat, self.policy.dust_limit_sat);
        }
        Ok(())
    }
}

impl SendSync for SimpleValidator {}

impl Validator for SimpleValidator {
    fn validate_funding_amount(&self, funding_sat: u64) -> Result<(), ValidationError> {
        if funding_sat < self.policy.dust_limit_sat || funding_sat > self.policy.max_funding_sat {
            policy_err!(
                self,
                "policy-funding-amount",
                "funding {} outside [{}, {}]",
                funding_sat,
                self.policy.dust_limit_sat,
                self.policy.max_funding_sat
            );
        }
        Ok(())
    }

    fn validate_delays(&self, htlc_delay: u16, refund_delay: u16) -> Result<(), ValidationError> {
        if refund_delay <= htlc_delay {
            policy_err!(
                self,
                "policy-delay-order",
                "refund delay {} must exceed htlc delay {}",
                refund_delay,
                htlc_delay
            );
        }
        if htlc_delay != self.policy.htlc_delay || refund_delay != self.policy.refund_delay {
            policy_err!(
                self,
                "policy-delay-value",
                "delays {}/{} differ from configured {}/{}",
                htlc_delay,
                refund_delay,
                self.policy.htlc_delay,
                self.policy.refund_delay
            );
        }
        Ok(())
    }

    fn validate_refund_tx(
        &self,
        funding_sat: u64,
        refund_sat: u64,
        fee_sat: u64,
        lock_time: LockTime,
        sequence: Sequence,
    ) -> Result<(), ValidationError> {
        if refund_sat.checked_add(fee_sat) != Some(funding_sat) {
            policy_err!(
                self,
                "policy-refund-amount",
                "refund {} + fee {} != funding {}",
                refund_sat,
                fee_sat,
                funding_sat
            );
        }
        self.validate_fee(fee_sat)?;
        self.validate_output_value("policy-refund-amount", "refund", refund_sat)?;
        if lock_time == LockTime::ZERO {
            policy_err!(self, "policy-refund-locktime", "refund must be time locked");
        }
        if !sequence.enables_absolute_lock_time() {
            policy_err!(self, "policy-refund-locktime", "sequence {} disables the lock time", sequence);
        }
        Ok(())
    }

    fn validate_payment_lock(&self, lock_time: LockTime, sequence: Sequence) -> Result<(), ValidationError> {
        // a payment maturing after the refund could be undercut by it
        if lock_time != LockTime::ZERO || sequence != Sequence::MAX {
            policy_err!(
                self,
                "policy-payment-locktime",
                "payment is time locked: lock time {} sequence {}",
                lock_time,
                sequence
            );
        }
        Ok(())
    }

    fn validate_payment_tx(
        &self,
        funding_sat: u64,
        previous_paid_sat: u64,
        paid_sat: u64,
        change_sat: u64,
        fee_sat: u64,
    ) -> Result<(), ValidationError> {
        if paid_sat.checked_add(change_sat).and_then(|v| v.checked_add(fee_sat)) != Some(funding_sat)
        {
            policy_err!(
                self,
                "policy-payment-amount",
                "paid {} + change {} + fee {} != funding {}",
                paid_sat,
                change_sat,
                fee_sat,
                funding_sat
            );
        }
        if paid_sat <= previous_paid_sat {
            policy_err!(
                self,
                "policy-payment-monotonic",
                "payment total {} does not exceed previous {}",
                paid_sat,
                previous_paid_sat
            );
        }
        self.validate_fee(fee_sat)?;
        self.validate_output_value("policy-payment-dust", "payee", paid_sat)?;
        self.validate_output_value("policy-payment-dust", "change", change_sat)?;
        Ok(())
    }

    fn validate_commitment_proposal(
        &self,
        funding_sat: u64,
        terms: &CommitmentTerms,
        expected_fee_sat: u64,
        receiver_is_funder: bool,
        agreed: &ChannelBalance,
    ) -> Result<(), ValidationError> {
        if terms.fee_sat != expected_fee_sat {
            policy_err!(
                self,
                "policy-commitment-fee-range",
                "fee {} differs from expected {}",
                terms.fee_sat,
                expected_fee_sat
            );
        }
        self.validate_fee(terms.fee_sat)?;
        let total = terms
            .to_owner_sat
            .checked_add(terms.to_counterparty_sat)
            .and_then(|v| v.checked_add(terms.fee_sat));
        if total != Some(funding_sat) {
            policy_err!(
                self,
                "policy-commitment-amount",
                "outputs {} + {} + fee {} != funding {}",
                terms.to_owner_sat,
                terms.to_counterparty_sat,
                terms.fee_sat,
                funding_sat
            );
        }
        self.validate_output_value("policy-commitment-dust", "owner", terms.to_owner_sat)?;
        self.validate_output_value("policy-commitment-dust", "counterparty", terms.to_counterparty_sat)?;
        self.validate_delays(terms.htlc_delay, terms.refund_delay)?;

        let (_, receiver_sat) = terms.balances(!receiver_is_funder);
        match agreed.sequence {
            Some(sequence) if sequence == terms.sequence =>
                if receiver_sat != agreed.holder_sat {
                    policy_err!(
                        self,
                        "policy-commitment-mirror",
                        "state {} gives us {} but we agreed on {}",
                        terms.sequence,
                        receiver_sat,
                        agreed.holder_sat
                    );
                },
            Some(sequence) if sequence > terms.sequence => {
                policy_err!(
                    self,
                    "policy-commitment-sequence",
                    "state {} is older than agreed state {}",
                    terms.sequence,
                    sequence
                );
            }
            _ =>
                if receiver_sat < agreed.holder_sat {
                    policy_err!(
                        self,
                        "policy-commitment-balance",
                        "our balance would drop from {} to {}",
                        agreed.holder_sat,
                        receiver_sat
                    );
                },
        }
        Ok(())
    }

    fn validate_revocation_hash(
        &self,
        revocation_hash: &hash160::Hash,
        htlc_hash: &hash160::Hash,
        seen: &UnorderedSet<hash160::Hash>,
        own: &UnorderedSet<hash160::Hash>,
    ) -> Result<(), ValidationError> {
        if seen.contains(revocation_hash) {
            policy_err!(self, "policy-revocation-fresh", "revocation hash {} reused", revocation_hash);
        }
        // secrets are party-private, so equality with one of ours means reuse
        if own.contains(revocation_hash) || revocation_hash == htlc_hash {
            policy_err!(
                self,
                "policy-revocation-fresh",
                "revocation hash {} collides with a local secret",
                revocation_hash
            );
        }
        Ok(())
    }

    fn policy(&self) -> Box<&dyn Policy> {
        Box::new(&self.policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::error::ValidationErrorKind;
    use crate::policy::filter::FilterRule;
    use bitcoin::hashes::Hash;
    use test_log::test;

    fn make_test_validator() -> SimpleValidator {
        SimpleValidator::new(make_simple_policy(Network::Regtest))
    }

    fn assert_policy_err<T: core::fmt::Debug>(res: Result<T, ValidationError>, contains: &str) {
        match res {
            Err(ValidationError { kind: ValidationErrorKind::Policy(msg), .. }) =>
                assert!(msg.contains(contains), "{} does not contain {}", msg, contains),
            other => panic!("expected policy error, got {:?}", other),
        }
    }

    fn terms(sequence: u64, to_owner_sat: u64, to_counterparty_sat: u64) -> CommitmentTerms {
        CommitmentTerms {
            sequence,
            to_owner_sat,
            to_counterparty_sat,
            fee_sat: 10_000,
            revocation_hash: [1; 20],
            htlc_hash: [2; 20],
            htlc_delay: 6,
            refund_delay: 12,
        }
    }

    #[test]
    fn default_policy_test() {
        let mainnet = make_simple_policy(Network::Bitcoin);
        assert_eq!((mainnet.htlc_delay, mainnet.refund_delay), (144, 288));
        mainnet.check_delays().unwrap();
        let mut bad = mainnet.clone();
        bad.refund_delay = bad.htlc_delay;
        assert!(bad.check_delays().is_err());
    }

    #[test]
    fn policy_json_test() {
        let policy = make_simple_policy(Network::Testnet);
        let json = serde_json::to_string(&policy).unwrap();
        assert_eq!(serde_json::from_str::<SimplePolicy>(&json).unwrap(), policy);
    }

    #[test]
    fn validate_payment_test() {
        let validator = make_test_validator();
        validator.validate_payment_tx(1_000_000, 0, 100_000, 890_000, 10_000).unwrap();
        validator.validate_payment_tx(1_000_000, 100_000, 990_000, 0, 10_000).unwrap();
        assert_policy_err(
            validator.validate_payment_tx(1_000_000, 100_000, 100_000, 890_000, 10_000),
            "does not exceed previous",
        );
        assert_policy_err(
            validator.validate_payment_tx(1_000_000, 0, 100_000, 890_001, 10_000),
            "!= funding",
        );
        assert_policy_err(
            validator.validate_payment_tx(1_000_000, 0, 989_500, 500, 10_000),
            "below dust limit",
        );
        assert_policy_err(
            validator.validate_payment_tx(1_000_000, 0, 100_000, 700_000, 200_000),
            "exceeds maximum",
        );
    }

    #[test]
    fn validate_payment_lock_test() {
        let validator = make_test_validator();
        validator.validate_payment_lock(LockTime::ZERO, Sequence::MAX).unwrap();
        let lock_time = LockTime::from_height(400_000).unwrap();
        assert_policy_err(validator.validate_payment_lock(lock_time, Sequence::MAX), "time locked");
        assert_policy_err(
            validator.validate_payment_lock(LockTime::ZERO, Sequence::ENABLE_LOCKTIME_NO_RBF),
            "time locked",
        );
        assert_policy_err(
            validator.validate_payment_lock(LockTime::ZERO, Sequence::from_height(10)),
            "time locked",
        );
    }

    #[test]
    fn validate_refund_test() {
        let validator = make_test_validator();
        let lock_time = LockTime::from_height(500).unwrap();
        validator
            .validate_refund_tx(1_000_000, 990_000, 10_000, lock_time, Sequence::ENABLE_LOCKTIME_NO_RBF)
            .unwrap();
        assert_policy_err(
            validator.validate_refund_tx(1_000_000, 990_000, 10_000, LockTime::ZERO, Sequence::ENABLE_LOCKTIME_NO_RBF),
            "time locked",
        );
        assert_policy_err(
            validator.validate_refund_tx(1_000_000, 990_000, 10_000, lock_time, Sequence::MAX),
            "disables the lock time",
        );
    }

    #[test]
    fn validate_commitment_balance_test() {
        let validator = make_test_validator();
        let agreed = ChannelBalance { sequence: Some(4), holder_sat: 100_000, counterparty_sat: 900_000 };
        // receiver is not the funder, so its balance is the htlc output
        validator.validate_commitment_proposal(1_000_000, &terms(5, 790_000, 200_000), 10_000, false, &agreed).unwrap();
        validator.validate_commitment_proposal(1_000_000, &terms(4, 890_000, 100_000), 10_000, false, &agreed).unwrap();
        assert_policy_err(
            validator.validate_commitment_proposal(1_000_000, &terms(5, 940_000, 50_000), 10_000, false, &agreed),
            "would drop",
        );
        assert_policy_err(
            validator.validate_commitment_proposal(1_000_000, &terms(4, 790_000, 200_000), 10_000, false, &agreed),
            "agreed on",
        );
        assert_policy_err(
            validator.validate_commitment_proposal(1_000_000, &terms(3, 890_000, 100_000), 10_000, false, &agreed),
            "older than",
        );
        assert_policy_err(
            validator.validate_commitment_proposal(1_000_000, &terms(5, 790_000, 200_000), 20_000, false, &agreed),
            "differs from expected",
        );
    }

    #[test]
    fn validate_commitment_funder_receiver_test() {
        let validator = make_test_validator();
        let agreed = ChannelBalance { sequence: Some(0), holder_sat: 1_000_000, counterparty_sat: 0 };
        // funder receives the mirror of the opening state: everything but the fee
        validator.validate_commitment_proposal(1_000_000, &terms(0, 0, 990_000), 10_000, true, &agreed).unwrap();
    }

    #[test]
    fn validate_commitment_delays_test() {
        let validator = make_test_validator();
        let agreed = ChannelBalance { sequence: None, holder_sat: 0, counterparty_sat: 1_000_000 };
        let mut t = terms(0, 990_000, 0);
        t.refund_delay = 6;
        assert_policy_err(
            validator.validate_commitment_proposal(1_000_000, &t, 10_000, false, &agreed),
            "must exceed",
        );
        t.refund_delay = 13;
        assert_policy_err(
            validator.validate_commitment_proposal(1_000_000, &t, 10_000, false, &agreed),
            "differ from configured",
        );
    }

    #[test]
    fn validate_revocation_hash_test() {
        let validator = make_test_validator();
        let fresh = hash160::Hash::from_byte_array([1; 20]);
        let htlc = hash160::Hash::from_byte_array([2; 20]);
        let mut seen = UnorderedSet::new();
        let mut own = UnorderedSet::new();
        validator.validate_revocation_hash(&fresh, &htlc, &seen, &own).unwrap();
        assert_policy_err(validator.validate_revocation_hash(&htlc, &htlc, &seen, &own), "collides");
        own.insert(fresh);
        assert_policy_err(validator.validate_revocation_hash(&fresh, &htlc, &seen, &own), "collides");
        own.clear();
        seen.insert(fresh);
        assert_policy_err(validator.validate_revocation_hash(&fresh, &htlc, &seen, &own), "reused");
    }

    #[test]
    fn filter_demotes_to_warning_test() {
        let mut policy = make_simple_policy(Network::Regtest);
        policy.filter.rules.push(FilterRule {
            tag: "policy-payment-dust".to_string(),
            is_prefix: false,
            action: FilterResult::Warn,
        });
        let validator = SimpleValidator::new(policy);
        validator.validate_payment_tx(1_000_000, 0, 989_500, 500, 10_000).unwrap();
    }
}
