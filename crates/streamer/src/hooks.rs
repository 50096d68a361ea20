use crate::engine::TxResult;
use crate::error::TxError;

/// Filters applied around each locally sequenced transaction.
pub trait SequencingHooks: Send + Sync {
    /// Runs before the transaction touches the block.
    fn pre_tx_filter(&self, _tx: &[u8]) -> Result<(), TxError> {
        Ok(())
    }

    /// Runs after execution; rejecting here rolls the transaction back out of the block.
    fn post_tx_filter(&self, _tx: &[u8], _result: &TxResult) -> Result<(), TxError> {
        Ok(())
    }
}

pub struct NoopHooks;

impl SequencingHooks for NoopHooks {}

/// Drops transactions that revert after burning more than `max_revert_gas`.
pub struct RevertGasReject {
    pub max_revert_gas: u64,
}

impl SequencingHooks for RevertGasReject {
    fn post_tx_filter(&self, _tx: &[u8], result: &TxResult) -> Result<(), TxError> {
        if result.reverted && result.gas_used > self.max_revert_gas {
            return Err(TxError::Filtered(format!(
                "reverted transaction used {} gas, limit {}",
                result.gas_used, self.max_revert_gas
            )));
        }
        Ok(())
    }
}

/// Admits only transactions whose first bytes match an allowed prefix.
pub struct PrefixAllowList {
    pub allowed: Vec<Vec<u8>>,
}

impl SequencingHooks for PrefixAllowList {
    fn pre_tx_filter(&self, tx: &[u8]) -> Result<(), TxError> {
        if self.allowed.iter().any(|p| tx.starts_with(p)) {
            Ok(())
        } else {
            Err(TxError::Filtered("sender not allowed".to_string()))
        }
    }
}

/// Runs each hook in order; the first rejection wins.
pub struct HookChain(pub Vec<Box<dyn SequencingHooks>>);

impl SequencingHooks for HookChain {
    fn pre_tx_filter(&self, tx: &[u8]) -> Result<(), TxError> {
        self.0.iter().try_for_each(|h| h.pre_tx_filter(tx))
    }

    fn post_tx_filter(&self, tx: &[u8], result: &TxResult) -> Result<(), TxError> {
        self.0.iter().try_for_each(|h| h.post_tx_filter(tx, result))
    }
}
