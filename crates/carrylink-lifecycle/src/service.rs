//! Match service: the public entry point.
//!
//! Every operation authenticates the caller, checks that they may act on
//! the match in their role, validates the payload, and hands the event to
//! the state machine. Mutations carry an idempotency key; replaying a key
//! returns the original outcome without side effects.

use std::sync::Arc;

use carrylink_challenge::ChallengeEngine;
use carrylink_ledger::{EscrowLedger, PaymentProcessor};
use carrylink_types::{
    AuthToken, CarrylinkError, ChallengeGrant, ChallengeStatus, Clock, DeliveryToken,
    EngineConfig, EscrowEntry, Match, MatchEvent, MatchId, MatchStatus, Money, PartyId,
    PartyRole, Principal, RequestId, Result, TripId, constants,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::identity::IdentityProvider;
use crate::idempotency::{CreateReplayCache, Operation, Reply};
use crate::machine::{Command, MatchStateMachine, Request, Resolution};
use crate::repository::MatchRepository;

/// Payload of `CreateMatch`, as produced by the matching trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMatch {
    pub trip_id: TripId,
    pub request_id: RequestId,
    pub carrier_id: PartyId,
    pub sender_id: PartyId,
    pub unlock_fee: Money,
}

/// Façade over the match lifecycle.
pub struct MatchService {
    identity: Arc<dyn IdentityProvider>,
    machine: MatchStateMachine,
    creates: CreateReplayCache,
    clock: Arc<dyn Clock>,
    config: Arc<EngineConfig>,
}

impl MatchService {
    /// Wire the service to its collaborators.
    ///
    /// # Errors
    /// [`CarrylinkError::Configuration`] if `config` does not validate.
    pub fn new(
        config: EngineConfig,
        identity: Arc<dyn IdentityProvider>,
        repo: Arc<dyn MatchRepository>,
        processor: Arc<dyn PaymentProcessor>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let ledger = Arc::new(EscrowLedger::new(
            processor,
            Arc::clone(&clock),
            config.processor_timeout(),
        ));
        let challenges = Arc::new(ChallengeEngine::new(
            Arc::clone(&clock),
            config.challenge_ttl(),
        ));
        let machine = MatchStateMachine::new(
            repo,
            ledger,
            challenges,
            Arc::clone(&clock),
            Arc::clone(&config),
        );
        tracing::info!(
            engine = constants::ENGINE_NAME,
            version = constants::VERSION,
            two_step = config.require_sender_confirmation,
            "match service ready"
        );
        Ok(Self {
            identity,
            machine,
            creates: CreateReplayCache::new(config.create_replay_cache_size),
            clock,
            config,
        })
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // -----------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------

    /// Record a new proposal for a trip/request pair.
    ///
    /// The caller must be one of the two parties or an arbiter acting for
    /// the platform's matcher.
    pub async fn create_match(
        &self,
        token: &AuthToken,
        draft: NewMatch,
        idempotency_key: &str,
    ) -> Result<Match> {
        validate_key(idempotency_key)?;
        let caller = self.identity.authenticate(token).await?;
        let involved = caller.party_id == draft.carrier_id || caller.party_id == draft.sender_id;
        if !involved && !caller.is_arbiter() {
            return Err(CarrylinkError::Forbidden {
                reason: "only a party to the match or the platform may create it".into(),
            });
        }

        if let Some(existing) = self.creates.get(caller.party_id, idempotency_key) {
            tracing::debug!(match_id = %existing, key = idempotency_key, "idempotent create replay");
            return self.machine.current(existing).await;
        }
        self.validate_draft(&draft)?;

        let now = self.clock.now();
        let record = Match {
            id: MatchId::new(),
            trip_id: draft.trip_id,
            request_id: draft.request_id,
            carrier_id: draft.carrier_id,
            sender_id: draft.sender_id,
            status: MatchStatus::Proposed,
            escrow_ref: None,
            unlock_fee: draft.unlock_fee,
            created_at: now,
            updated_at: now,
            expires_at: now + self.config.proposal_ttl(),
            status_since: now,
            cancel_requested_by: None,
            dispute: None,
            challenge_verified: false,
            version: 0,
        };

        if let Err(err) = self
            .machine
            .create(&record, caller.party_id, idempotency_key)
            .await
        {
            // A concurrent request with the same key may have won the pair.
            if let Some(existing) = self.creates.get(caller.party_id, idempotency_key) {
                return self.machine.current(existing).await;
            }
            return Err(err);
        }
        self.creates
            .remember(caller.party_id, idempotency_key, record.id);
        tracing::info!(
            match_id = %record.id,
            trip_id = %record.trip_id,
            request_id = %record.request_id,
            fee = %record.unlock_fee,
            "match proposed"
        );
        Ok(record)
    }

    /// Sender pays the unlock fee into escrow: proposed → contact_unlocked.
    pub async fn unlock_contact(
        &self,
        token: &AuthToken,
        match_id: MatchId,
        idempotency_key: &str,
    ) -> Result<Match> {
        self.mutate(token, match_id, Command::Unlock, idempotency_key)
            .await?
            .into_match()
    }

    /// Carrier departs: contact_unlocked → in_transit. Returns the token pair;
    /// the transport layer shows each party only their own token.
    pub async fn issue_delivery_challenge(
        &self,
        token: &AuthToken,
        match_id: MatchId,
        idempotency_key: &str,
    ) -> Result<ChallengeGrant> {
        self.mutate(token, match_id, Command::Depart, idempotency_key)
            .await?
            .into_grant()
    }

    /// Submit both scanned tokens. Completes the match (releasing funds to
    /// the carrier) unless sender confirmation is required.
    pub async fn confirm_delivery(
        &self,
        token: &AuthToken,
        match_id: MatchId,
        carrier_token: DeliveryToken,
        sender_token: DeliveryToken,
        idempotency_key: &str,
    ) -> Result<Match> {
        if carrier_token.is_empty() || sender_token.is_empty() {
            return Err(CarrylinkError::InvalidRequest {
                reason: "both delivery tokens are required".into(),
            });
        }
        let command = Command::Scan {
            carrier_token,
            sender_token,
        };
        self.mutate(token, match_id, command, idempotency_key)
            .await?
            .into_match()
    }

    /// Sender acknowledges receipt: delivery_pending_confirmation → completed.
    /// Also retries a payout that failed after a successful scan.
    pub async fn confirm_receipt(
        &self,
        token: &AuthToken,
        match_id: MatchId,
        idempotency_key: &str,
    ) -> Result<Match> {
        self.mutate(token, match_id, Command::ConfirmReceipt, idempotency_key)
            .await?
            .into_match()
    }

    /// Cancel, or ask the counterparty to agree to a cancellation.
    ///
    /// Before unlock either party cancels alone. After unlock the match is
    /// cancelled (with refund) once both parties asked, or once the grace
    /// period has passed; until then the request is only recorded.
    pub async fn cancel_match(
        &self,
        token: &AuthToken,
        match_id: MatchId,
        idempotency_key: &str,
    ) -> Result<Match> {
        self.mutate(token, match_id, Command::Cancel, idempotency_key)
            .await?
            .into_match()
    }

    /// Freeze funds pending arbitration.
    pub async fn raise_dispute(
        &self,
        token: &AuthToken,
        match_id: MatchId,
        reason: &str,
        idempotency_key: &str,
    ) -> Result<Match> {
        let reason = reason.trim();
        let chars = reason.chars().count();
        if chars == 0 || chars > constants::MAX_DISPUTE_REASON_LEN {
            return Err(CarrylinkError::InvalidRequest {
                reason: format!(
                    "dispute reason must be 1..={} characters",
                    constants::MAX_DISPUTE_REASON_LEN
                ),
            });
        }
        let command = Command::Dispute {
            reason: reason.to_string(),
        };
        self.mutate(token, match_id, command, idempotency_key)
            .await?
            .into_match()
    }

    /// Arbiter settles a dispute.
    pub async fn resolve_dispute(
        &self,
        token: &AuthToken,
        match_id: MatchId,
        resolution: Resolution,
        idempotency_key: &str,
    ) -> Result<Match> {
        self.mutate(token, match_id, Command::Resolve(resolution), idempotency_key)
            .await?
            .into_match()
    }

    /// Carrier replaces an expired, unused challenge.
    pub async fn reissue_delivery_challenge(
        &self,
        token: &AuthToken,
        match_id: MatchId,
        idempotency_key: &str,
    ) -> Result<ChallengeGrant> {
        self.mutate(token, match_id, Command::Reissue, idempotency_key)
            .await?
            .into_grant()
    }

    // -----------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------

    pub async fn get_match(&self, token: &AuthToken, match_id: MatchId) -> Result<Match> {
        let caller = self.identity.authenticate(token).await?;
        let record = self.machine.current(match_id).await?;
        ensure_visible(&record, &caller)?;
        Ok(record)
    }

    /// The caller's matches, newest first.
    pub async fn list_matches(&self, token: &AuthToken) -> Result<Vec<Match>> {
        let caller = self.identity.authenticate(token).await?;
        let stored = self
            .machine
            .repository()
            .list_for_party(caller.party_id)
            .await?;
        let mut matches = Vec::with_capacity(stored.len());
        for record in stored {
            matches.push(self.machine.current(record.id).await?);
        }
        Ok(matches)
    }

    /// Audit trail of a match, in order.
    pub async fn match_events(&self, token: &AuthToken, match_id: MatchId) -> Result<Vec<MatchEvent>> {
        let caller = self.identity.authenticate(token).await?;
        let record = self.machine.current(match_id).await?;
        ensure_visible(&record, &caller)?;
        self.machine.repository().events(match_id).await
    }

    pub async fn escrow_status(&self, token: &AuthToken, match_id: MatchId) -> Result<EscrowEntry> {
        let caller = self.identity.authenticate(token).await?;
        let record = self.machine.load(match_id).await?;
        ensure_visible(&record, &caller)?;
        self.machine
            .ledger()
            .entry(match_id)
            .ok_or(CarrylinkError::EscrowNotFound(match_id))
    }

    /// Token-free view of the delivery challenge.
    pub async fn challenge_status(
        &self,
        token: &AuthToken,
        match_id: MatchId,
    ) -> Result<ChallengeStatus> {
        let caller = self.identity.authenticate(token).await?;
        let record = self.machine.load(match_id).await?;
        ensure_visible(&record, &caller)?;
        self.machine
            .challenges()
            .status(match_id)
            .ok_or(CarrylinkError::ChallengeNotFound(match_id))
    }

    // -----------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------

    async fn mutate(
        &self,
        token: &AuthToken,
        match_id: MatchId,
        command: Command,
        idempotency_key: &str,
    ) -> Result<Reply> {
        validate_key(idempotency_key)?;
        let caller = self.identity.authenticate(token).await?;
        let record = self.machine.load(match_id).await?;
        check_role(&record, &caller, command.operation())?;
        let request = Request {
            caller,
            key: idempotency_key.to_string(),
        };
        self.machine.apply(match_id, command, &request).await
    }

    fn validate_draft(&self, draft: &NewMatch) -> Result<()> {
        if draft.carrier_id == draft.sender_id {
            return Err(CarrylinkError::InvalidRequest {
                reason: "carrier and sender must be different parties".into(),
            });
        }
        let fee = &draft.unlock_fee;
        let limit = self
            .config
            .fees
            .limit_for(&fee.currency)
            .ok_or_else(|| CarrylinkError::InvalidRequest {
                reason: format!("currency {} is not accepted", fee.currency),
            })?;
        if fee.amount <= Decimal::ZERO || fee.exceeds_minor_units() {
            return Err(CarrylinkError::InvalidRequest {
                reason: format!("unlock fee {fee} is not a payable amount"),
            });
        }
        if fee.amount < limit.min || fee.amount > limit.max {
            return Err(CarrylinkError::AmountOutOfRange {
                amount: fee.amount,
                min: limit.min,
                max: limit.max,
            });
        }
        Ok(())
    }
}

/// Idempotency keys are 1..=128 printable ASCII characters.
fn validate_key(key: &str) -> Result<()> {
    let printable = key.bytes().all(|b| (0x20..=0x7e).contains(&b));
    if key.is_empty() || key.len() > constants::MAX_IDEMPOTENCY_KEY_LEN || !printable {
        return Err(CarrylinkError::InvalidRequest {
            reason: format!(
                "idempotency key must be 1..={} printable ASCII characters",
                constants::MAX_IDEMPOTENCY_KEY_LEN
            ),
        });
    }
    Ok(())
}

/// Parties see their own matches; arbiters see all.
fn ensure_visible(record: &Match, caller: &Principal) -> Result<()> {
    if caller.is_arbiter() || record.is_party(caller.party_id) {
        Ok(())
    } else {
        Err(CarrylinkError::NotAParty(record.id))
    }
}

/// Who may perform `operation` on `record`.
fn check_role(record: &Match, caller: &Principal, operation: Operation) -> Result<()> {
    if operation == Operation::ResolveDispute {
        return if caller.is_arbiter() {
            Ok(())
        } else {
            Err(CarrylinkError::Forbidden {
                reason: "only an arbiter may resolve disputes".into(),
            })
        };
    }

    let role = record
        .role_of(caller.party_id)
        .ok_or(CarrylinkError::NotAParty(record.id))?;
    let required = match operation {
        Operation::UnlockContact | Operation::ConfirmReceipt => Some(PartyRole::Sender),
        Operation::IssueDeliveryChallenge | Operation::ReissueDeliveryChallenge => {
            Some(PartyRole::Carrier)
        }
        _ => None,
    };
    match required {
        Some(needed) if needed != role => Err(CarrylinkError::Forbidden {
            reason: format!(
                "{operation} is reserved for the {}",
                match needed {
                    PartyRole::Carrier => "carrier",
                    PartyRole::Sender => "sender",
                }
            ),
        }),
        _ => Ok(()),
    }
}
