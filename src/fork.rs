use crate::error::{compact_error_message, Result, RpcError};
use crate::fork_db::{ForkDb, PinnedBlockMeta};
use alloy::primitives::{Address, U256};
use alloy::sol_types::SolCall;
use revm::{
    db::CacheDB,
    primitives::{
        Address as rAddress, BlockEnv, Bytes as rBytes, ExecutionResult, Output, TransactTo,
        U256 as rU256,
    },
    Evm,
};
use std::collections::HashSet;

const CALL_GAS_LIMIT: u64 = 30_000_000;

alloy::sol! {
    interface IVault {
        function totalSupply() external view returns (uint256 supply);
        function balanceOf(address owner) external view returns (uint256 balance);
        function withdraw(uint256 maxShares) external returns (uint256 withdrawn);
    }
}

/// One isolated point-in-time fork. All reads and redemption replays for a
/// vault go through the same session, so each withdrawal observes the
/// liquidity left behind by the previous one.
pub trait VaultStateSession: Send {
    fn total_supply(&mut self, vault: Address) -> Result<U256>;
    fn balance_of(&mut self, vault: Address, account: Address) -> Result<U256>;
    /// Replay a full-balance redemption impersonating `account`. An
    /// executed-but-reverted call is `Ok(false)`; that is the measured
    /// signal. A database or transport fault is `Err` and aborts the scan.
    fn withdraw(&mut self, vault: Address, account: Address, amount: U256) -> Result<bool>;
}

/// Seam mirroring the injected fork factory of the reference monitor: the
/// producer opens one session per vault per scan, pre-authorizing exactly
/// the ranked holder accounts.
pub trait SessionFactory: Send + Sync {
    fn open(&self, block: u64, accounts: &[Address]) -> Result<Box<dyn VaultStateSession>>;
}

fn to_revm_address(addr: Address) -> rAddress {
    rAddress::from_slice(addr.as_slice())
}

/// Mirror the pinned header into the execution environment. `timestamp`
/// matters: vault share pricing degrades locked profit by
/// `block.timestamp - lastReport`, which underflows against the default
/// zero timestamp. Basefee stays zero; replayed redemptions must not fail
/// on gas funding.
fn apply_block_env(env: &mut BlockEnv, number: u64, meta: PinnedBlockMeta) {
    env.number = rU256::from(number);
    env.timestamp = rU256::from(meta.timestamp);
    env.coinbase = to_revm_address(meta.coinbase);
}

fn decode_word(raw: &[u8]) -> Option<U256> {
    if raw.len() < 32 {
        return None;
    }
    let mut word = [0u8; 32];
    word.copy_from_slice(&raw[0..32]);
    Some(U256::from_be_bytes(word))
}

/// revm-backed fork session. Impersonation is inherent to local execution
/// (`tx.caller` is unauthenticated inside the EVM); the session still
/// enforces the pre-authorized set so a replay can never widen it.
pub struct ForkSession {
    db: CacheDB<ForkDb>,
    block: u64,
    meta: PinnedBlockMeta,
    unlocked: HashSet<Address>,
}

impl ForkSession {
    pub fn open(rpc_url: &str, block: u64, accounts: &[Address]) -> Result<Self> {
        let fork = ForkDb::open(rpc_url, block).map_err(|e| {
            RpcError::Fork(compact_error_message(&e.to_string(), 220))
        })?;
        // Fail fast: a fork whose header cannot be read cannot execute
        // anything meaningfully either.
        let meta = fork
            .pinned_block_meta()
            .map_err(|e| RpcError::Fork(compact_error_message(&e.to_string(), 220)))?;
        Ok(Self {
            db: CacheDB::new(fork),
            block,
            meta,
            unlocked: accounts.iter().copied().collect(),
        })
    }

    fn transact(
        &mut self,
        caller: Address,
        to: Address,
        calldata: Vec<u8>,
        commit: bool,
    ) -> Result<Option<Vec<u8>>> {
        let block = self.block;
        let meta = self.meta;
        let caller = to_revm_address(caller);
        let target = to_revm_address(to);
        let data = rBytes::from(calldata);

        let mut evm = Evm::builder()
            .with_db(&mut self.db)
            .modify_block_env(|env| {
                apply_block_env(env, block, meta);
            })
            .modify_tx_env(|tx| {
                tx.caller = caller;
                tx.transact_to = TransactTo::Call(target);
                tx.data = data;
                tx.value = rU256::ZERO;
                tx.gas_limit = CALL_GAS_LIMIT;
            })
            .build();

        let result = if commit {
            evm.transact_commit()
                .map_err(|e| RpcError::Fork(compact_error_message(&e.to_string(), 220)))?
        } else {
            evm.transact()
                .map_err(|e| RpcError::Fork(compact_error_message(&e.to_string(), 220)))?
                .result
        };
        drop(evm);

        match result {
            ExecutionResult::Success {
                output: Output::Call(bytes),
                ..
            } => Ok(Some(bytes.to_vec())),
            ExecutionResult::Success { .. } => Ok(Some(Vec::new())),
            _ => Ok(None),
        }
    }

    fn view_word(&mut self, vault: Address, calldata: Vec<u8>, what: &str) -> Result<U256> {
        let raw = self
            .transact(Address::ZERO, vault, calldata, false)?
            .ok_or_else(|| RpcError::Fork(format!("{what} reverted on vault {vault:#x}")))?;
        decode_word(&raw).ok_or_else(|| {
            RpcError::BadReturnData(format!(
                "{what} returned {} bytes for vault {vault:#x}",
                raw.len()
            ))
            .into()
        })
    }
}

impl VaultStateSession for ForkSession {
    fn total_supply(&mut self, vault: Address) -> Result<U256> {
        self.view_word(
            vault,
            IVault::totalSupplyCall {}.abi_encode(),
            "totalSupply()",
        )
    }

    fn balance_of(&mut self, vault: Address, account: Address) -> Result<U256> {
        self.view_word(
            vault,
            IVault::balanceOfCall { owner: account }.abi_encode(),
            "balanceOf(address)",
        )
    }

    fn withdraw(&mut self, vault: Address, account: Address, amount: U256) -> Result<bool> {
        if !self.unlocked.contains(&account) {
            tracing::warn!(
                "[FORK] refusing withdrawal for non-impersonated account {:#x}",
                account
            );
            return Ok(false);
        }
        let calldata = IVault::withdrawCall { maxShares: amount }.abi_encode();
        Ok(self.transact(account, vault, calldata, true)?.is_some())
    }
}

/// Factory producing real fork sessions against the configured RPC endpoint.
pub struct ForkSessionFactory {
    rpc_url: String,
}

impl ForkSessionFactory {
    pub fn new(rpc_url: String) -> Self {
        Self { rpc_url }
    }
}

impl SessionFactory for ForkSessionFactory {
    fn open(&self, block: u64, accounts: &[Address]) -> Result<Box<dyn VaultStateSession>> {
        Ok(Box::new(ForkSession::open(&self.rpc_url, block, accounts)?))
    }
}
