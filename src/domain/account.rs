//! Ledger account keys.
//!
//! Accounts are plain strings in storage. These helpers keep the naming in
//! one place so a wallet key is always `user_wallet:<id>`.

pub const WALLET_PREFIX: &str = "user_wallet:";
pub const EXTERNAL_PREFIX: &str = "external:";

pub const PLATFORM_REVENUE: &str = "platform_revenue";
/// Platform's pooled account at the bank; source of provider-side movements.
pub const PLATFORM_POOL: &str = "platform_pool";
pub const LOAN_DISBURSEMENT: &str = "loan_disbursement";
pub const LOAN_REPAYMENT: &str = "loan_repayment";
/// Clearing account credited when wallet money leaves to another bank.
pub const BANK_SETTLEMENT: &str = "bank_settlement";
/// Holds a force-failed transfer's debit until it is refunded.
pub const TRANSFER_SUSPENSE: &str = "transfer_suspense";

pub fn wallet(user_id: &str) -> String {
    format!("{}{}", WALLET_PREFIX, user_id)
}

pub fn savings(plan_id: &str) -> String {
    format!("savings:{}", plan_id)
}

pub fn bill_payment(service: &str) -> String {
    format!("bill-payment:{}", service)
}

pub fn external(bank_code: &str, account_no: &str) -> String {
    format!("{}{}:{}", EXTERNAL_PREFIX, bank_code, account_no)
}

/// Owner id of a wallet account, `None` for anything else.
pub fn wallet_owner(account: &str) -> Option<&str> {
    account
        .strip_prefix(WALLET_PREFIX)
        .filter(|owner| !owner.is_empty())
}

pub fn is_wallet(account: &str) -> bool {
    wallet_owner(account).is_some()
}

pub fn is_external(account: &str) -> bool {
    account.starts_with(EXTERNAL_PREFIX)
}

/// Split `external:<bank>:<account>` into its parts.
pub fn parse_external(account: &str) -> Option<(&str, &str)> {
    let rest = account.strip_prefix(EXTERNAL_PREFIX)?;
    let (bank, number) = rest.split_once(':')?;
    if bank.is_empty() || number.is_empty() {
        return None;
    }
    Some((bank, number))
}
