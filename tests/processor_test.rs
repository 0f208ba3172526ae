mod common;

use chrono::Utc;
use std::collections::BTreeMap;

use common::{
    fund_wallet, harness, harness_with, test_config, BankMode, MockBank, MockBiller,
    SETTLEMENT_ACCOUNT,
};
use fincore::domain::{
    account, BusinessKind, BusinessRecord, BusinessStatus, EntryCategory, OutcomeStatus,
    TransferStatus,
};
use fincore::error::AppError;
use fincore::ports::{Store, UnitOfWork};
use fincore::services::{BillPaymentRequest, LoanRequest, SavingsRequest, ServiceType};

fn airtime(user: &str, amount: i64, key: &str) -> BillPaymentRequest {
    BillPaymentRequest {
        user_id: user.to_string(),
        service: ServiceType::Airtime,
        amount,
        fields: BTreeMap::from([
            ("phone_number".to_string(), "08030000000".to_string()),
            ("network".to_string(), "mtn".to_string()),
        ]),
        idempotency_key: key.to_string(),
    }
}

fn savings(user: &str, plan: &str, amount: i64, key: &str) -> SavingsRequest {
    SavingsRequest {
        user_id: user.to_string(),
        plan_id: plan.to_string(),
        amount,
        idempotency_key: key.to_string(),
    }
}

#[tokio::test]
async fn test_bill_payment_completes_and_posts_business_pair() {
    let bank = MockBank::new(BankMode::Succeed);
    let biller = MockBiller::working();
    let h = harness(bank.clone(), biller.clone());
    fund_wallet(&h.services, "u1", 10_000).await;

    let outcome = h.operations.pay_bill(airtime("u1", 1_500, "bill-1")).await.unwrap();

    assert_eq!(outcome.status, OutcomeStatus::Completed);
    assert_eq!(biller.purchases(), 1);
    let receipt = outcome.data.as_ref().unwrap();
    assert_eq!(
        receipt["biller_reference"],
        format!("BIL-{}", outcome.business_id)
    );

    let record = h.store.business_record(outcome.business_id).await.unwrap().unwrap();
    assert_eq!(record.status, BusinessStatus::Completed);
    assert_eq!(record.reference, outcome.reference);
    assert!(!record.needs_review);

    // the pool-sourced transfer writes no entries; the posting pair is the ledger record
    let transfer = h
        .services
        .transfers
        .get_transfer(outcome.reference.as_deref().unwrap())
        .await
        .unwrap();
    assert_eq!(transfer.status, TransferStatus::Completed);
    assert_eq!(transfer.to_account, SETTLEMENT_ACCOUNT);
    assert_eq!(transfer.subtype.as_deref(), Some("airtime"));

    let entries = h.services.ledger.get_by_trace_id(&outcome.trace_id).await.unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].account, account::wallet("u1"));
    assert_eq!(entries[1].account, account::bill_payment("airtime"));
    assert!(entries.iter().all(|e| e.category == EntryCategory::BillPayment));

    assert_eq!(h.services.ledger.user_wallet_balance("u1").await.unwrap(), 8_500);
    assert_eq!(h.store.cached_balance("u1").await.unwrap(), Some(8_500));
}

#[tokio::test]
async fn test_replay_returns_cached_outcome_without_provider_call() {
    let bank = MockBank::new(BankMode::Succeed);
    let h = harness(bank.clone(), MockBiller::working());
    fund_wallet(&h.services, "u1", 10_000).await;

    let first = h
        .operations
        .deposit_savings(savings("u1", "plan-9", 2_000, "dep-1"))
        .await
        .unwrap();
    let second = h
        .operations
        .deposit_savings(savings("u1", "plan-9", 2_000, "dep-1"))
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(bank.transfer_calls(), 1);
    assert_eq!(h.services.ledger.user_wallet_balance("u1").await.unwrap(), 8_000);
    assert_eq!(
        h.store
            .completed_balance(&account::savings("plan-9"))
            .await
            .unwrap(),
        2_000
    );

    let err = h
        .operations
        .deposit_savings(savings("u1", "plan-9", 2_500, "dep-1"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));

    let err = h
        .operations
        .deposit_savings(savings("u2", "plan-9", 2_000, "dep-1"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
    assert_eq!(bank.transfer_calls(), 1);
}

#[tokio::test]
async fn test_key_held_by_in_flight_operation_conflicts() {
    let bank = MockBank::new(BankMode::Succeed);
    let h = harness(bank.clone(), MockBiller::working());
    fund_wallet(&h.services, "u1", 10_000).await;

    // the first attempt has claimed the key but not yet cached an outcome
    let now = Utc::now();
    let in_flight = BusinessRecord {
        id: uuid::Uuid::new_v4(),
        kind: BusinessKind::SavingsDeposit,
        subtype: "plan-9".to_string(),
        user_id: "u1".to_string(),
        trace_id: "trace-in-flight".to_string(),
        amount: 2_000,
        currency: "NGN".to_string(),
        status: BusinessStatus::Pending,
        reference: None,
        idempotency_key: "dep-busy".to_string(),
        request_hash: "hash".to_string(),
        needs_review: false,
        failure_reason: None,
        details: None,
        created_at: now,
        updated_at: now,
    };
    let mut uow = h.store.begin().await.unwrap();
    uow.insert_business_record(&in_flight).await.unwrap();
    uow.commit().await.unwrap();

    let err = h
        .operations
        .deposit_savings(savings("u1", "plan-9", 2_000, "dep-busy"))
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::Conflict(_)));
    assert_eq!(bank.transfer_calls(), 0);
    assert_eq!(h.services.ledger.user_wallet_balance("u1").await.unwrap(), 10_000);
    let stored = h.store.business_record(in_flight.id).await.unwrap().unwrap();
    assert_eq!(stored.status, BusinessStatus::Pending);
}

#[tokio::test]
async fn test_fulfilment_failure_flags_record_for_review() {
    let bank = MockBank::new(BankMode::Succeed);
    let biller = MockBiller::broken();
    let h = harness(bank.clone(), biller.clone());
    fund_wallet(&h.services, "u1", 10_000).await;

    let outcome = h.operations.pay_bill(airtime("u1", 1_000, "bill-2")).await.unwrap();

    assert_eq!(outcome.status, OutcomeStatus::Failed);
    assert!(outcome.message.contains("biller timed out"));
    assert_eq!(biller.purchases(), 1);

    let record = h.store.business_record(outcome.business_id).await.unwrap().unwrap();
    assert_eq!(record.status, BusinessStatus::Failed);
    assert!(record.needs_review);

    // money moved; nothing is compensated and no business pair is posted
    let transfer = h
        .services
        .transfers
        .get_transfer(outcome.reference.as_deref().unwrap())
        .await
        .unwrap();
    assert_eq!(transfer.status, TransferStatus::Completed);
    assert!(h
        .services
        .ledger
        .get_by_trace_id(&outcome.trace_id)
        .await
        .unwrap()
        .is_empty());

    let review = h.services.reconciler.needs_review().await.unwrap();
    assert_eq!(review.len(), 1);
    assert_eq!(review[0].id, outcome.business_id);

    // the failed outcome is cached too
    let replay = h.operations.pay_bill(airtime("u1", 1_000, "bill-2")).await.unwrap();
    assert_eq!(replay, outcome);
    assert_eq!(biller.purchases(), 1);
}

#[tokio::test]
async fn test_declined_movement_fails_record_without_fulfilment() {
    let bank = MockBank::new(BankMode::Decline);
    let biller = MockBiller::working();
    let h = harness(bank.clone(), biller.clone());

    let outcome = h.operations.pay_bill(airtime("u1", 1_000, "bill-3")).await.unwrap();

    assert_eq!(outcome.status, OutcomeStatus::Failed);
    assert_eq!(biller.purchases(), 0);
    let record = h.store.business_record(outcome.business_id).await.unwrap().unwrap();
    assert_eq!(record.status, BusinessStatus::Failed);
    assert!(!record.needs_review);
    assert_eq!(record.failure_reason.as_deref(), Some("Insufficient funds"));
}

#[tokio::test]
async fn test_bill_payment_rejects_missing_fields() {
    let bank = MockBank::new(BankMode::Succeed);
    let h = harness(bank.clone(), MockBiller::working());

    let mut request = airtime("u1", 1_000, "bill-4");
    request.fields.remove("network");
    let err = h.operations.pay_bill(request).await.unwrap_err();

    assert!(err.is_validation());
    assert_eq!(bank.transfer_calls(), 0);
}

#[tokio::test]
async fn test_bill_payment_disabled_without_settlement_account() {
    let config = test_config(&[("BILLER_SETTLEMENT_ACCOUNT", "")]);
    let bank = MockBank::new(BankMode::Succeed);
    let biller = MockBiller::working();
    let h = harness_with(&config, bank.clone(), biller.clone());
    fund_wallet(&h.services, "u1", 5_000).await;

    let err = h.operations.pay_bill(airtime("u1", 1_000, "bill-5")).await.unwrap_err();
    assert!(err.is_validation());
    assert_eq!(bank.transfer_calls(), 0);
    assert_eq!(biller.purchases(), 0);

    // operations that never reach the biller are unaffected
    let outcome = h
        .operations
        .deposit_savings(savings("u1", "plan-2", 1_000, "dep-5"))
        .await
        .unwrap();
    assert!(outcome.is_completed());
}

#[tokio::test]
async fn test_loan_disbursement_and_repayment() {
    let h = harness(MockBank::new(BankMode::Succeed), MockBiller::working());

    let disbursed = h
        .operations
        .disburse_loan(LoanRequest {
            user_id: "u3".to_string(),
            loan_id: "loan-1".to_string(),
            amount: 20_000,
            idempotency_key: "loan-out".to_string(),
        })
        .await
        .unwrap();
    assert!(disbursed.is_completed());
    assert_eq!(h.services.ledger.user_wallet_balance("u3").await.unwrap(), 20_000);

    let repaid = h
        .operations
        .repay_loan(LoanRequest {
            user_id: "u3".to_string(),
            loan_id: "loan-1".to_string(),
            amount: 5_000,
            idempotency_key: "loan-in".to_string(),
        })
        .await
        .unwrap();
    assert!(repaid.is_completed());
    assert_eq!(h.services.ledger.user_wallet_balance("u3").await.unwrap(), 15_000);
    assert_eq!(
        h.store.completed_balance(account::LOAN_REPAYMENT).await.unwrap(),
        5_000
    );
    assert_eq!(h.store.cached_balance("u3").await.unwrap(), Some(15_000));
    assert!(h.services.ledger.find_inconsistencies().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_savings_withdrawal_credits_wallet() {
    let h = harness(MockBank::new(BankMode::Succeed), MockBiller::working());
    fund_wallet(&h.services, "u4", 3_000).await;

    h.operations
        .deposit_savings(savings("u4", "plan-1", 3_000, "dep-u4"))
        .await
        .unwrap();
    assert_eq!(h.services.ledger.user_wallet_balance("u4").await.unwrap(), 0);

    let outcome = h
        .operations
        .withdraw_savings(savings("u4", "plan-1", 1_200, "wd-u4"))
        .await
        .unwrap();
    assert!(outcome.is_completed());
    assert_eq!(h.services.ledger.user_wallet_balance("u4").await.unwrap(), 1_200);
    assert_eq!(
        h.store.completed_balance(&account::savings("plan-1")).await.unwrap(),
        1_800
    );
}
