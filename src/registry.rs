use crate::error::{compact_error_message, Result, RpcError};
use alloy::primitives::{Address, Bytes};
use alloy::providers::{Provider, ProviderBuilder, RootProvider};
use alloy::rpc::types::{TransactionInput, TransactionRequest};
use alloy::sol_types::SolCall;
use alloy::transports::http::{Client, Http};

pub type HttpProvider = RootProvider<Http<Client>>;

alloy::sol! {
    interface IVaultRegistry {
        function assetsAddresses() external view returns (address[] memory assets);
    }
}

pub fn build_provider(url: &str) -> Result<HttpProvider> {
    let parsed = url.parse().map_err(|e| RpcError::InvalidUrl {
        url: url.to_string(),
        reason: format!("{e}"),
    })?;
    Ok(ProviderBuilder::new().on_http(parsed))
}

/// Read-only client for the vault registry contract. No caching: every scan
/// re-reads the registry, so vault set membership may change between scans.
pub struct RegistryClient {
    provider: HttpProvider,
    registry: Address,
}

impl RegistryClient {
    pub fn new(provider: HttpProvider, registry: Address) -> Self {
        Self { provider, registry }
    }

    /// Current vault list at `block`. Any error propagates and aborts the
    /// in-progress scan iteration.
    pub async fn list_vaults(&self, block: u64) -> Result<Vec<Address>> {
        let calldata = Bytes::from(IVaultRegistry::assetsAddressesCall {}.abi_encode());
        let tx = TransactionRequest::default()
            .to(self.registry)
            .input(TransactionInput::new(calldata));

        let raw = self
            .provider
            .call(&tx)
            .block(block.into())
            .await
            .map_err(|e| RpcError::Transport(compact_error_message(&e.to_string(), 220)))?;

        let decoded = IVaultRegistry::assetsAddressesCall::abi_decode_returns(raw.as_ref(), true)
            .map_err(|e| {
                RpcError::BadReturnData(format!(
                    "assetsAddresses() decode failed for registry={:#x}: {e}",
                    self.registry
                ))
            })?;
        Ok(decoded.assets)
    }
}
