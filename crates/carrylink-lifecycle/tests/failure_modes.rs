//! Processor failures, lost commits, races and rejected input.

mod common;

use std::sync::Arc;

use carrylink_ledger::Step;
use carrylink_lifecycle::Resolution;
use carrylink_types::{
    AuthToken, CarrylinkError, Currency, EngineConfig, EscrowState, EventKind, EventOutcome,
    LifecycleEvent, MatchStatus, Money,
};
use common::Harness;
use rust_decimal::Decimal;

fn two_step() -> EngineConfig {
    EngineConfig {
        require_sender_confirmation: true,
        ..EngineConfig::default()
    }
}

#[tokio::test]
async fn expired_proposal_cannot_be_unlocked() {
    let h = Harness::new();
    let m = h.propose().await;
    h.clock
        .advance(h.service.config().proposal_ttl() + chrono::Duration::seconds(1));

    let err = h
        .service
        .unlock_contact(&h.sender, m.id, "unlock-1")
        .await
        .unwrap_err();
    assert!(matches!(err, CarrylinkError::MatchExpired(id) if id == m.id), "{err}");
    assert_eq!(h.processor.authorize_calls(), 0);

    let m = h.service.get_match(&h.carrier, m.id).await.unwrap();
    assert_eq!(m.status, MatchStatus::Expired);
    assert!(h.service.escrow_status(&h.sender, m.id).await.is_err());
}

#[tokio::test]
async fn declined_payment_is_journaled_and_a_new_key_can_retry() {
    let h = Harness::new();
    let m = h.propose().await;
    h.processor.on_authorize(Step::Decline("insufficient funds".into()));

    let err = h
        .service
        .unlock_contact(&h.sender, m.id, "unlock-1")
        .await
        .unwrap_err();
    assert!(matches!(err, CarrylinkError::PaymentDeclined { .. }), "{err}");
    assert_eq!(
        h.service.get_match(&h.sender, m.id).await.unwrap().status,
        MatchStatus::Proposed
    );
    assert_eq!(
        h.service.escrow_status(&h.sender, m.id).await.unwrap().state,
        EscrowState::Failed
    );

    let events = h.service.match_events(&h.sender, m.id).await.unwrap();
    assert!(events.iter().any(|e| {
        matches!(e.kind, EventKind::Escrow { to: EscrowState::Failed, .. })
            && matches!(&e.outcome, EventOutcome::Rejected { code, .. } if code == "CL_ERR_203")
    }));

    // The decline is a final answer for this key.
    let again = h
        .service
        .unlock_contact(&h.sender, m.id, "unlock-1")
        .await
        .unwrap_err();
    assert!(matches!(again, CarrylinkError::PaymentDeclined { .. }));
    assert_eq!(h.processor.authorize_calls(), 1);

    let m = h.service.unlock_contact(&h.sender, m.id, "unlock-2").await.unwrap();
    assert_eq!(m.status, MatchStatus::ContactUnlocked);
    assert_eq!(h.processor.authorize_calls(), 2);
}

#[tokio::test]
async fn processor_timeout_is_not_cached_against_the_key() {
    let config = EngineConfig {
        processor_timeout_ms: 50,
        ..EngineConfig::default()
    };
    let h = Harness::with_config(config);
    let m = h.propose().await;
    h.processor.on_authorize(Step::Hang);

    let err = h
        .service
        .unlock_contact(&h.sender, m.id, "unlock-1")
        .await
        .unwrap_err();
    assert!(matches!(err, CarrylinkError::ProcessorTimeout { timeout_ms: 50 }), "{err}");
    assert!(err.is_retryable());

    let m = h.service.unlock_contact(&h.sender, m.id, "unlock-1").await.unwrap();
    assert_eq!(m.status, MatchStatus::ContactUnlocked);
    assert_eq!(h.processor.authorize_calls(), 2);
}

#[tokio::test]
async fn failed_capture_voids_the_hold() {
    let h = Harness::new();
    let m = h.propose().await;
    h.processor.on_capture(Step::Decline("card expired".into()));

    let err = h
        .service
        .unlock_contact(&h.sender, m.id, "unlock-1")
        .await
        .unwrap_err();
    assert!(matches!(err, CarrylinkError::PaymentDeclined { .. }), "{err}");
    assert_eq!(h.processor.refund_calls(), 1);

    let m = h.service.get_match(&h.sender, m.id).await.unwrap();
    assert_eq!(m.status, MatchStatus::Proposed);
    assert!(m.escrow_ref.is_none());
    assert_eq!(
        h.service.escrow_status(&h.sender, m.id).await.unwrap().state,
        EscrowState::Refunded
    );

    // A voided hold is final; the proposal can still be cancelled.
    let err = h
        .service
        .unlock_contact(&h.sender, m.id, "unlock-2")
        .await
        .unwrap_err();
    assert!(matches!(err, CarrylinkError::EscrowInvalidState { .. }), "{err}");
    let m = h.service.cancel_match(&h.carrier, m.id, "cancel-1").await.unwrap();
    assert_eq!(m.status, MatchStatus::Cancelled);
}

#[tokio::test]
async fn failed_payout_after_scan_is_retried_by_receipt() {
    let h = Harness::new();
    let (m, grant) = h.in_transit().await;
    h.processor.on_payout(Step::Unavailable("bank offline".into()));

    let err = h
        .service
        .confirm_delivery(
            &h.carrier,
            m.id,
            grant.carrier_token.clone(),
            grant.sender_token.clone(),
            "scan-1",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CarrylinkError::ProcessorUnavailable { .. }), "{err}");

    // The scan moved the match, so its key keeps the original outcome.
    let again = h
        .service
        .confirm_delivery(
            &h.carrier,
            m.id,
            grant.carrier_token.clone(),
            grant.sender_token.clone(),
            "scan-1",
        )
        .await
        .unwrap_err();
    assert!(matches!(again, CarrylinkError::ProcessorUnavailable { .. }), "{again}");
    assert_eq!(h.processor.payout_calls(), 1);

    let m = h.service.get_match(&h.sender, m.id).await.unwrap();
    assert_eq!(m.status, MatchStatus::DeliveryPendingConfirmation);
    assert!(m.challenge_verified);
    assert_eq!(
        h.service.escrow_status(&h.sender, m.id).await.unwrap().state,
        EscrowState::Captured
    );

    let m = h.service.confirm_receipt(&h.sender, m.id, "receipt-1").await.unwrap();
    assert_eq!(m.status, MatchStatus::Completed);
    assert_eq!(h.processor.payout_calls(), 2);
}

#[tokio::test]
async fn lost_commit_after_capture_freezes_the_match() {
    let h = Harness::new();
    let m = h.propose().await;
    h.repo.fail_next_commits(1);

    let err = h
        .service
        .unlock_contact(&h.sender, m.id, "unlock-1")
        .await
        .unwrap_err();
    assert!(matches!(err, CarrylinkError::Storage(_)), "{err}");
    assert_eq!(
        h.service.escrow_status(&h.sender, m.id).await.unwrap().state,
        EscrowState::Captured
    );

    // The next mutation finds a proposed match with captured funds.
    let err = h
        .service
        .unlock_contact(&h.sender, m.id, "unlock-2")
        .await
        .unwrap_err();
    assert!(matches!(err, CarrylinkError::InconsistentState { .. }), "{err}");
    assert_eq!(h.processor.authorize_calls(), 1);

    let frozen = h.service.get_match(&h.sender, m.id).await.unwrap();
    assert_eq!(frozen.status, MatchStatus::Disputed);
    let dispute = frozen.dispute.unwrap();
    assert_eq!(dispute.raised_by, None);
    assert_eq!(dispute.raised_from, MatchStatus::Proposed);

    let events = h.service.match_events(&h.arbiter, m.id).await.unwrap();
    assert!(events.iter().any(|e| matches!(
        e.kind,
        EventKind::Lifecycle {
            event: LifecycleEvent::InconsistencyDetected,
            ..
        }
    )));

    let m = h
        .service
        .resolve_dispute(&h.arbiter, m.id, Resolution::RefundSender, "resolve-1")
        .await
        .unwrap();
    assert_eq!(m.status, MatchStatus::Cancelled);
    assert_eq!(
        h.service.escrow_status(&h.sender, m.id).await.unwrap().state,
        EscrowState::Refunded
    );
}

#[tokio::test]
async fn reads_freeze_an_inconsistent_match_instead_of_failing() {
    let h = Harness::new();
    let m = h.propose().await;
    h.repo.fail_next_commits(1);
    let _ = h.service.unlock_contact(&h.sender, m.id, "unlock-1").await;

    let read = h.service.get_match(&h.carrier, m.id).await.unwrap();
    assert_eq!(read.status, MatchStatus::Disputed);
    let listed = h.service.list_matches(&h.sender).await.unwrap();
    assert_eq!(listed[0].status, MatchStatus::Disputed);
}

#[tokio::test]
async fn verified_handoff_survives_a_lost_commit() {
    let h = Harness::with_config(two_step());
    let (m, grant) = h.in_transit().await;
    h.repo.fail_next_commits(1);

    let err = h
        .service
        .confirm_delivery(
            &h.carrier,
            m.id,
            grant.carrier_token.clone(),
            grant.sender_token.clone(),
            "scan-1",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CarrylinkError::Storage(_)), "{err}");

    // The consumed challenge outlives the lost write and freezes the match.
    let frozen = h.service.get_match(&h.carrier, m.id).await.unwrap();
    assert_eq!(frozen.status, MatchStatus::Disputed);
    assert!(frozen.challenge_verified);

    let done = h
        .service
        .resolve_dispute(&h.arbiter, m.id, Resolution::ReleaseToCarrier, "resolve-1")
        .await
        .unwrap();
    assert_eq!(done.status, MatchStatus::Completed);
    let escrow = h.service.escrow_status(&h.sender, m.id).await.unwrap();
    assert_eq!(escrow.state, EscrowState::Released);
    assert_eq!(escrow.released_to, Some(h.carrier_id));
}

#[tokio::test]
async fn payout_survives_a_lost_commit() {
    let h = Harness::new();
    let (m, grant) = h.in_transit().await;
    h.repo.fail_next_commits(1);

    let err = h
        .service
        .confirm_delivery(&h.sender, m.id, grant.carrier_token, grant.sender_token, "scan-1")
        .await
        .unwrap_err();
    assert!(matches!(err, CarrylinkError::Storage(_)), "{err}");
    assert_eq!(
        h.service.escrow_status(&h.sender, m.id).await.unwrap().state,
        EscrowState::Released
    );

    let frozen = h.service.get_match(&h.sender, m.id).await.unwrap();
    assert_eq!(frozen.status, MatchStatus::Disputed);
    assert!(frozen.challenge_verified);

    // Money already left escrow; it cannot be refunded.
    let err = h
        .service
        .resolve_dispute(&h.arbiter, m.id, Resolution::RefundSender, "resolve-1")
        .await
        .unwrap_err();
    assert!(
        matches!(
            err,
            CarrylinkError::EscrowInvalidState {
                state: EscrowState::Released,
                ..
            }
        ),
        "{err}"
    );

    let done = h
        .service
        .resolve_dispute(&h.arbiter, m.id, Resolution::ReleaseToCarrier, "resolve-2")
        .await
        .unwrap();
    assert_eq!(done.status, MatchStatus::Completed);
    assert_eq!(h.processor.payout_calls(), 1);
    assert_eq!(
        h.service.get_match(&h.carrier, m.id).await.unwrap().status,
        MatchStatus::Completed
    );
}

#[tokio::test]
async fn lost_commit_on_departure_mints_a_fresh_pair() {
    let h = Harness::new();
    let m = h.unlocked().await;
    h.repo.fail_next_commits(1);

    let err = h
        .service
        .issue_delivery_challenge(&h.carrier, m.id, "depart-1")
        .await
        .unwrap_err();
    assert!(matches!(err, CarrylinkError::Storage(_)), "{err}");
    assert_eq!(
        h.service.get_match(&h.carrier, m.id).await.unwrap().status,
        MatchStatus::ContactUnlocked
    );

    let grant = h
        .service
        .issue_delivery_challenge(&h.carrier, m.id, "depart-2")
        .await
        .unwrap();
    assert_eq!(grant.generation, 2);

    let done = h
        .service
        .confirm_delivery(&h.sender, m.id, grant.carrier_token, grant.sender_token, "scan-1")
        .await
        .unwrap();
    assert_eq!(done.status, MatchStatus::Completed);
}

#[tokio::test]
async fn concurrent_cancel_and_unlock_have_one_winner() {
    for _ in 0..16 {
        let h = Harness::new();
        let m = h.propose().await;

        let unlock = {
            let service = Arc::clone(&h.service);
            let token = h.sender.clone();
            tokio::spawn(async move { service.unlock_contact(&token, m.id, "unlock-1").await })
        };
        let cancel = {
            let service = Arc::clone(&h.service);
            let token = h.carrier.clone();
            tokio::spawn(async move { service.cancel_match(&token, m.id, "cancel-1").await })
        };
        let unlocked = unlock.await.unwrap();
        let cancelled = cancel.await.unwrap();

        let settled = h.service.get_match(&h.sender, m.id).await.unwrap();
        match settled.status {
            MatchStatus::Cancelled => {
                assert!(matches!(
                    unlocked,
                    Err(CarrylinkError::IllegalTransition {
                        from: MatchStatus::Cancelled,
                        ..
                    })
                ));
                assert!(cancelled.is_ok());
                assert_eq!(h.processor.authorize_calls(), 0);
                assert!(h.service.escrow_status(&h.sender, m.id).await.is_err());
            }
            MatchStatus::ContactUnlocked => {
                // Cancel arrived after the unlock; it is kept as a request.
                assert!(unlocked.is_ok());
                assert!(matches!(
                    cancelled,
                    Err(CarrylinkError::IllegalTransition {
                        from: MatchStatus::ContactUnlocked,
                        event: LifecycleEvent::CancelAfterUnlock,
                    })
                ));
                assert_eq!(settled.cancel_requested_by, Some(h.carrier_id));
                assert_eq!(
                    h.service.escrow_status(&h.sender, m.id).await.unwrap().state,
                    EscrowState::Captured
                );
            }
            other => panic!("unexpected status after race: {other}"),
        }
    }
}

#[tokio::test]
async fn completed_matches_always_have_released_escrow() {
    let h = Harness::new();
    let (m, grant) = h.in_transit().await;
    h.service
        .confirm_delivery(&h.sender, m.id, grant.carrier_token, grant.sender_token, "scan-1")
        .await
        .unwrap();

    for m in h.service.list_matches(&h.carrier).await.unwrap() {
        if m.status == MatchStatus::Completed {
            let escrow = h.service.escrow_status(&h.carrier, m.id).await.unwrap();
            assert_eq!(escrow.state, EscrowState::Released);
            assert_eq!(escrow.released_to, Some(m.carrier_id));
        }
    }
}

#[tokio::test]
async fn one_live_match_per_trip_and_request() {
    let h = Harness::new();
    let draft = h.draft(Decimal::new(2000, 2));

    let first = h
        .service
        .create_match(&h.sender, draft.clone(), "create-1")
        .await
        .unwrap();
    let replay = h
        .service
        .create_match(&h.sender, draft.clone(), "create-1")
        .await
        .unwrap();
    assert_eq!(replay.id, first.id);

    let err = h
        .service
        .create_match(&h.carrier, draft.clone(), "create-2")
        .await
        .unwrap_err();
    assert!(matches!(err, CarrylinkError::DuplicateMatch(id) if id == first.id), "{err}");

    // Once the first proposal lapses the pair can be matched again.
    h.clock
        .advance(h.service.config().proposal_ttl() + chrono::Duration::seconds(1));
    let second = h
        .service
        .create_match(&h.carrier, draft, "create-3")
        .await
        .unwrap();
    assert_ne!(second.id, first.id);
    assert_eq!(
        h.service.get_match(&h.sender, first.id).await.unwrap().status,
        MatchStatus::Expired
    );
}

#[tokio::test]
async fn malformed_requests_are_rejected() {
    let h = Harness::new();
    let invalid = |err: CarrylinkError| matches!(err, CarrylinkError::InvalidRequest { .. });

    let err = h
        .service
        .create_match(&h.sender, h.draft(Decimal::ZERO), "c-1")
        .await
        .unwrap_err();
    assert!(invalid(err));

    let err = h
        .service
        .create_match(&h.sender, h.draft(Decimal::new(20_001, 3)), "c-2")
        .await
        .unwrap_err();
    assert!(invalid(err));

    let err = h
        .service
        .create_match(&h.sender, h.draft(Decimal::new(100_000, 2)), "c-3")
        .await
        .unwrap_err();
    assert!(matches!(err, CarrylinkError::AmountOutOfRange { .. }), "{err}");

    let mut draft = h.draft(Decimal::new(2000, 2));
    draft.unlock_fee = Money::new(Decimal::new(2000, 2), Currency::new("XYZ"));
    let err = h.service.create_match(&h.sender, draft, "c-4").await.unwrap_err();
    assert!(invalid(err));

    let mut draft = h.draft(Decimal::new(2000, 2));
    draft.carrier_id = h.sender_id;
    let err = h.service.create_match(&h.sender, draft, "c-5").await.unwrap_err();
    assert!(invalid(err));

    let m = h.propose().await;
    let err = h
        .service
        .unlock_contact(&h.sender, m.id, &"k".repeat(129))
        .await
        .unwrap_err();
    assert!(invalid(err));

    let (m, _) = h.in_transit().await;
    let err = h
        .service
        .raise_dispute(&h.sender, m.id, "   ", "dispute-1")
        .await
        .unwrap_err();
    assert!(invalid(err));
    assert_eq!(h.processor.authorize_calls(), 1);
}

#[tokio::test]
async fn outsiders_cannot_touch_a_match() {
    let h = Harness::new();
    let m = h.propose().await;

    let err = h
        .service
        .unlock_contact(&AuthToken::new("forged"), m.id, "unlock-1")
        .await
        .unwrap_err();
    assert!(matches!(err, CarrylinkError::Unauthenticated { .. }), "{err}");

    let err = h
        .service
        .cancel_match(&h.stranger, m.id, "cancel-1")
        .await
        .unwrap_err();
    assert!(matches!(err, CarrylinkError::NotAParty(id) if id == m.id), "{err}");
    assert!(h.service.get_match(&h.stranger, m.id).await.is_err());

    let err = h
        .service
        .unlock_contact(&h.carrier, m.id, "unlock-1")
        .await
        .unwrap_err();
    assert!(matches!(err, CarrylinkError::Forbidden { .. }), "{err}");

    // The arbiter can read but not act as a party.
    assert!(h.service.get_match(&h.arbiter, m.id).await.is_ok());
    assert!(h.service.cancel_match(&h.arbiter, m.id, "cancel-2").await.is_err());
}
