//! The payment collaborator.
//!
//! The ledger is a thin state-tracking layer above these primitives; it
//! never moves money itself.

use async_trait::async_trait;
use carrylink_types::{Currency, PartyId, ProcessorRef};
use rust_decimal::Decimal;

/// Failure reported by the payment processor.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessorError {
    /// The processor refused the operation (insufficient funds, fraud check).
    #[error("declined: {reason}")]
    Declined { reason: String },
    /// The processor could not be reached or failed internally.
    #[error("unavailable: {reason}")]
    Unavailable { reason: String },
}

/// Primitive money movements offered by an external payment processor.
///
/// Implementations should treat `idempotency_key` on `authorize` as the
/// processor-side idempotency key so retried holds are not duplicated.
#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    /// Place a hold of `amount` on the payer's funds.
    async fn authorize(
        &self,
        amount: Decimal,
        currency: &Currency,
        payer: PartyId,
        idempotency_key: &str,
    ) -> Result<ProcessorRef, ProcessorError>;

    /// Take the held funds.
    async fn capture(&self, processor_ref: &ProcessorRef) -> Result<(), ProcessorError>;

    /// Pay `amount` of the captured funds out to `payee`.
    async fn payout(
        &self,
        processor_ref: &ProcessorRef,
        payee: PartyId,
        amount: Decimal,
    ) -> Result<(), ProcessorError>;

    /// Return `amount` to the payer (voids the hold if not yet captured).
    async fn refund(&self, processor_ref: &ProcessorRef, amount: Decimal)
        -> Result<(), ProcessorError>;
}

#[cfg(any(test, feature = "test-helpers"))]
pub use scripted::{ScriptedProcessor, Step};

#[cfg(any(test, feature = "test-helpers"))]
mod scripted {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::{async_trait, Currency, Decimal, PartyId, PaymentProcessor, ProcessorError, ProcessorRef};

    /// Scripted behaviour of the next call to one processor primitive.
    #[derive(Debug, Clone)]
    pub enum Step {
        Succeed,
        Decline(String),
        Unavailable(String),
        /// Never answer; exercises the ledger's timeout.
        Hang,
    }

    #[derive(Default)]
    struct Script {
        authorize: VecDeque<Step>,
        capture: VecDeque<Step>,
        payout: VecDeque<Step>,
        refund: VecDeque<Step>,
    }

    /// In-memory processor for tests. Succeeds unless a step was queued.
    /// **Never use in production.**
    #[derive(Default)]
    pub struct ScriptedProcessor {
        script: Mutex<Script>,
        authorize_calls: AtomicUsize,
        capture_calls: AtomicUsize,
        payout_calls: AtomicUsize,
        refund_calls: AtomicUsize,
        refs: AtomicUsize,
    }

    impl ScriptedProcessor {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        fn with_script(&self, f: impl FnOnce(&mut Script)) {
            let mut script = self
                .script
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            f(&mut script);
        }

        pub fn on_authorize(&self, step: Step) {
            self.with_script(|s| s.authorize.push_back(step));
        }

        pub fn on_capture(&self, step: Step) {
            self.with_script(|s| s.capture.push_back(step));
        }

        pub fn on_payout(&self, step: Step) {
            self.with_script(|s| s.payout.push_back(step));
        }

        pub fn on_refund(&self, step: Step) {
            self.with_script(|s| s.refund.push_back(step));
        }

        pub fn authorize_calls(&self) -> usize {
            self.authorize_calls.load(Ordering::SeqCst)
        }

        pub fn capture_calls(&self) -> usize {
            self.capture_calls.load(Ordering::SeqCst)
        }

        pub fn payout_calls(&self) -> usize {
            self.payout_calls.load(Ordering::SeqCst)
        }

        pub fn refund_calls(&self) -> usize {
            self.refund_calls.load(Ordering::SeqCst)
        }

        fn next(&self, pick: impl FnOnce(&mut Script) -> &mut VecDeque<Step>) -> Step {
            let mut step = Step::Succeed;
            self.with_script(|s| {
                if let Some(next) = pick(s).pop_front() {
                    step = next;
                }
            });
            step
        }
    }

    async fn play(step: Step) -> Result<(), ProcessorError> {
        match step {
            Step::Succeed => Ok(()),
            Step::Decline(reason) => Err(ProcessorError::Declined { reason }),
            Step::Unavailable(reason) => Err(ProcessorError::Unavailable { reason }),
            Step::Hang => std::future::pending().await,
        }
    }

    #[async_trait]
    impl PaymentProcessor for ScriptedProcessor {
        async fn authorize(
            &self,
            _amount: Decimal,
            _currency: &Currency,
            _payer: PartyId,
            _idempotency_key: &str,
        ) -> Result<ProcessorRef, ProcessorError> {
            self.authorize_calls.fetch_add(1, Ordering::SeqCst);
            let step = self.next(|s| &mut s.authorize);
            play(step).await?;
            let n = self.refs.fetch_add(1, Ordering::SeqCst);
            Ok(ProcessorRef(format!("pi_test_{n}")))
        }

        async fn capture(&self, _processor_ref: &ProcessorRef) -> Result<(), ProcessorError> {
            self.capture_calls.fetch_add(1, Ordering::SeqCst);
            let step = self.next(|s| &mut s.capture);
            play(step).await
        }

        async fn payout(
            &self,
            _processor_ref: &ProcessorRef,
            _payee: PartyId,
            _amount: Decimal,
        ) -> Result<(), ProcessorError> {
            self.payout_calls.fetch_add(1, Ordering::SeqCst);
            let step = self.next(|s| &mut s.payout);
            play(step).await
        }

        async fn refund(
            &self,
            _processor_ref: &ProcessorRef,
            _amount: Decimal,
        ) -> Result<(), ProcessorError> {
            self.refund_calls.fetch_add(1, Ordering::SeqCst);
            let step = self.next(|s| &mut s.refund);
            play(step).await
        }
    }
}
