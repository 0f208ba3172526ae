mod common;

use common::{fund_wallet, harness, BankMode, MockBank, MockBiller};
use fincore::domain::{
    account, EntryStatus, EntryType, OutcomeStatus, TransferRequest, TransferStatus, TransferType,
};
use fincore::error::AppError;
use fincore::ports::Store;
use fincore::services::WalletTransferRequest;

fn wallet_transfer(user: &str, to: &str, amount: i64, key: &str) -> WalletTransferRequest {
    WalletTransferRequest {
        user_id: user.to_string(),
        to_account: account::wallet(to),
        transfer_type: TransferType::Intra,
        amount,
        narration: Some("rent".to_string()),
        idempotency_key: key.to_string(),
    }
}

#[tokio::test]
async fn test_intra_transfer_moves_balance_between_wallets() {
    let bank = MockBank::new(BankMode::Succeed);
    let h = harness(bank.clone(), MockBiller::working());
    fund_wallet(&h.services, "w1", 50_000).await;

    let outcome = h
        .operations
        .transfer(wallet_transfer("w1", "w2", 10_000, "key-a"))
        .await
        .unwrap();

    assert_eq!(outcome.status, OutcomeStatus::Completed);
    assert_eq!(bank.transfer_calls(), 1);
    assert_eq!(h.services.ledger.user_wallet_balance("w1").await.unwrap(), 40_000);
    assert_eq!(h.services.ledger.user_wallet_balance("w2").await.unwrap(), 10_000);

    let reference = outcome.reference.unwrap();
    let transfer = h.services.transfers.get_transfer(&reference).await.unwrap();
    assert_eq!(transfer.status, TransferStatus::Completed);
    assert_eq!(transfer.provider_ref.as_deref(), Some(format!("SES-{reference}").as_str()));

    let entries = h.services.ledger.get_by_trace_id(&outcome.trace_id).await.unwrap();
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|e| e.amount == 10_000));
    assert!(entries.iter().all(|e| e.status == EntryStatus::Completed));
    assert_eq!(entries[0].entry_type, EntryType::Debit);
    assert_eq!(entries[0].account, account::wallet("w1"));
    assert_eq!(entries[1].entry_type, EntryType::Credit);
    assert_eq!(entries[1].account, account::wallet("w2"));

    // cached counters follow the ledger
    assert_eq!(h.store.cached_balance("w1").await.unwrap(), Some(40_000));
    assert_eq!(h.store.cached_balance("w2").await.unwrap(), Some(10_000));
    assert!(h.services.ledger.find_inconsistencies().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_provider_error_fails_transfer_and_leaves_balance() {
    let bank = MockBank::new(BankMode::Error);
    let h = harness(bank.clone(), MockBiller::working());
    fund_wallet(&h.services, "w1", 50_000).await;

    let outcome = h
        .operations
        .transfer(wallet_transfer("w1", "w2", 10_000, "key-b"))
        .await
        .unwrap();

    assert_eq!(outcome.status, OutcomeStatus::Failed);
    let transfer = h
        .services
        .transfers
        .get_transfer(outcome.reference.as_deref().unwrap())
        .await
        .unwrap();
    assert_eq!(transfer.status, TransferStatus::Failed);
    assert!(transfer.failure_reason.is_some());

    assert_eq!(h.services.ledger.user_wallet_balance("w1").await.unwrap(), 50_000);
    assert_eq!(h.services.ledger.user_wallet_balance("w2").await.unwrap(), 0);
    assert_eq!(h.store.cached_balance("w1").await.unwrap(), Some(50_000));

    let entries = h.services.ledger.get_by_trace_id(&outcome.trace_id).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].entry_type, EntryType::Debit);
    assert_eq!(entries[0].status, EntryStatus::Failed);
}

#[tokio::test]
async fn test_provider_decline_fails_transfer() {
    let bank = MockBank::new(BankMode::Decline);
    let h = harness(bank, MockBiller::working());
    fund_wallet(&h.services, "w1", 5_000).await;

    let outcome = h
        .operations
        .transfer(wallet_transfer("w1", "w2", 1_000, "key-decline"))
        .await
        .unwrap();

    assert_eq!(outcome.status, OutcomeStatus::Failed);
    assert_eq!(outcome.message, "Insufficient funds");
    assert_eq!(h.services.ledger.user_wallet_balance("w1").await.unwrap(), 5_000);
}

#[tokio::test]
async fn test_initiate_twice_with_same_key_returns_first_receipt() {
    let h = harness(MockBank::new(BankMode::Succeed), MockBiller::working());
    let request = TransferRequest::new(
        "w1",
        account::wallet("w1"),
        account::wallet("w2"),
        2_500,
        TransferType::Intra,
    )
    .with_idempotency_key("init-1");

    let first = h
        .services
        .transfers
        .initiate_transfer(request.clone(), None)
        .await
        .unwrap();
    let second = h
        .services
        .transfers
        .initiate_transfer(request.clone(), None)
        .await
        .unwrap();

    assert_eq!(first, second);
    let transfers = h.store.transfers_by_trace(&first.trace_id).await.unwrap();
    assert_eq!(transfers.len(), 1);
    assert_eq!(transfers[0].status, TransferStatus::Pending);
    assert_eq!(h.store.cached_balance("w1").await.unwrap(), Some(-2_500));

    let mut changed = request;
    changed.amount = 3_000;
    let err = h
        .services
        .transfers
        .initiate_transfer(changed, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
}

#[tokio::test]
async fn test_inter_transfer_credits_bank_settlement() {
    let h = harness(MockBank::new(BankMode::Succeed), MockBiller::working());
    fund_wallet(&h.services, "w1", 9_000).await;

    let outcome = h
        .operations
        .transfer(WalletTransferRequest {
            user_id: "w1".to_string(),
            to_account: account::external("044", "0123456789"),
            transfer_type: TransferType::Inter,
            amount: 4_000,
            narration: None,
            idempotency_key: "key-inter".to_string(),
        })
        .await
        .unwrap();

    assert!(outcome.is_completed());
    let entries = h.services.ledger.get_by_trace_id(&outcome.trace_id).await.unwrap();
    assert_eq!(entries[1].account, account::BANK_SETTLEMENT);
    assert_eq!(h.services.ledger.user_wallet_balance("w1").await.unwrap(), 5_000);
}

#[tokio::test]
async fn test_transfer_type_must_match_destination() {
    let bank = MockBank::new(BankMode::Succeed);
    let h = harness(bank.clone(), MockBiller::working());

    let err = h
        .operations
        .transfer(WalletTransferRequest {
            user_id: "w1".to_string(),
            to_account: account::external("044", "0123456789"),
            transfer_type: TransferType::Intra,
            amount: 100,
            narration: None,
            idempotency_key: "key-mismatch".to_string(),
        })
        .await
        .unwrap_err();

    assert!(err.is_validation());
    assert_eq!(bank.transfer_calls(), 0);
}

#[tokio::test]
async fn test_complete_and_fail_are_exactly_once() {
    let h = harness(MockBank::new(BankMode::Succeed), MockBiller::working());
    let receipt = h
        .services
        .transfers
        .initiate_transfer(
            TransferRequest::new(
                "w1",
                account::wallet("w1"),
                account::wallet("w2"),
                700,
                TransferType::Intra,
            ),
            None,
        )
        .await
        .unwrap();

    let completed = h
        .services
        .transfers
        .complete_transfer(&receipt.reference, None)
        .await
        .unwrap();
    assert_eq!(completed.status, TransferStatus::Completed);
    assert!(completed.completed_at.is_some());

    // repeat is a no-op, crossing terminals is refused
    let again = h
        .services
        .transfers
        .complete_transfer(&receipt.reference, None)
        .await
        .unwrap();
    assert_eq!(again.status, TransferStatus::Completed);
    assert_eq!(
        h.services.ledger.get_by_trace_id(&receipt.trace_id).await.unwrap().len(),
        2
    );

    let err = h
        .services
        .transfers
        .fail_transfer(&receipt.reference)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidTransition(_)));

    let err = h
        .services
        .transfers
        .complete_transfer("TRFMISSING", None)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}
