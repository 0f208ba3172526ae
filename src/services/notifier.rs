use async_trait::async_trait;

use crate::domain::Transfer;

/// Tells the account holder that a transfer settled.
///
/// Delivery is best-effort: it runs after the settling scope committed and a
/// failure never affects the transfer.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn transfer_completed(&self, transfer: &Transfer) -> anyhow::Result<()>;

    async fn transfer_failed(&self, transfer: &Transfer) -> anyhow::Result<()>;
}

/// Writes notifications to the log only.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn transfer_completed(&self, transfer: &Transfer) -> anyhow::Result<()> {
        tracing::info!(
            user_id = %transfer.user_id,
            reference = %transfer.reference,
            amount = transfer.amount,
            "Notify: transfer completed"
        );
        Ok(())
    }

    async fn transfer_failed(&self, transfer: &Transfer) -> anyhow::Result<()> {
        tracing::info!(
            user_id = %transfer.user_id,
            reference = %transfer.reference,
            reason = transfer.failure_reason.as_deref().unwrap_or("unknown"),
            "Notify: transfer failed"
        );
        Ok(())
    }
}

pub(crate) async fn notify(notifier: &dyn Notifier, transfer: &Transfer) {
    let result = match transfer.status {
        crate::domain::TransferStatus::Completed => notifier.transfer_completed(transfer).await,
        crate::domain::TransferStatus::Failed => notifier.transfer_failed(transfer).await,
        crate::domain::TransferStatus::Pending => return,
    };

    if let Err(e) = result {
        tracing::warn!(reference = %transfer.reference, "Transfer notification failed: {:#}", e);
    }
}
