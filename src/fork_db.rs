use alloy::primitives::{Address, U256};
use alloy::providers::{Provider, ProviderBuilder};
use dashmap::DashMap;
use revm::{
    primitives::{keccak256, AccountInfo, Address as rAddress, Bytecode, B256, U256 as rU256},
    DatabaseRef,
};
use std::future::Future;
use std::sync::{Arc, OnceLock};

use crate::registry::HttpProvider;

const FETCH_RETRIES: u32 = 3;
const BRIDGE_WORKER_QUEUE_CAPACITY: usize = 64;
const BRIDGE_TIMEOUT_MS: u64 = 10_000;

type BridgeJob = Box<dyn FnOnce() + Send + 'static>;

/// Execution-relevant fields of the pinned block's header. Vault logic reads
/// `block.timestamp` (locked-profit degradation), so replays must see the
/// real pinned values, not `BlockEnv` defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinnedBlockMeta {
    pub timestamp: u64,
    pub coinbase: Address,
}

/// Remote-state revm database pinned at one block. Every account/storage read
/// hydrates lazily over RPC at the pinned height and is cached for the
/// lifetime of the fork. Writes never reach here: the session layers a
/// `CacheDB` on top, so mutation stays local to the fork.
pub struct ForkDb {
    provider: Arc<HttpProvider>,
    block: u64,
    handle: tokio::runtime::Handle,
    runtime_guard: Option<Arc<tokio::runtime::Runtime>>,
    account_cache: DashMap<Address, AccountInfo>,
    storage_cache: DashMap<(Address, U256), U256>,
    block_hash_cache: DashMap<u64, B256>,
    code_cache: Arc<DashMap<B256, Bytecode>>,
    pinned_meta: OnceLock<PinnedBlockMeta>,
}

impl ForkDb {
    pub fn open(url: &str, block: u64) -> anyhow::Result<Self> {
        let parsed = url
            .parse()
            .map_err(|e| anyhow::anyhow!("fork RPC URL `{url}` invalid: {e}"))?;
        let provider = Arc::new(ProviderBuilder::new().on_http(parsed));

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            return Ok(Self::with_handle(provider, block, handle, None));
        }

        // Synchronous call sites (tests/tools) have no ambient runtime;
        // bootstrap a private one for them.
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .map_err(|e| anyhow::anyhow!("failed to bootstrap tokio runtime for ForkDb: {e}"))?;
        let runtime = Arc::new(runtime);
        let handle = runtime.handle().clone();
        Ok(Self::with_handle(provider, block, handle, Some(runtime)))
    }

    fn with_handle(
        provider: Arc<HttpProvider>,
        block: u64,
        handle: tokio::runtime::Handle,
        runtime_guard: Option<Arc<tokio::runtime::Runtime>>,
    ) -> Self {
        Self {
            provider,
            block,
            handle,
            runtime_guard,
            account_cache: DashMap::new(),
            storage_cache: DashMap::new(),
            block_hash_cache: DashMap::new(),
            code_cache: Arc::new(DashMap::new()),
            pinned_meta: OnceLock::new(),
        }
    }

    pub fn block_number(&self) -> u64 {
        self.block
    }

    fn bridge_worker_sender() -> &'static std::sync::mpsc::SyncSender<BridgeJob> {
        static TX: OnceLock<std::sync::mpsc::SyncSender<BridgeJob>> = OnceLock::new();
        TX.get_or_init(|| {
            let (tx, rx) = std::sync::mpsc::sync_channel::<BridgeJob>(BRIDGE_WORKER_QUEUE_CAPACITY);
            let _ = std::thread::Builder::new()
                .name("forkdb-bridge-worker".to_string())
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                });
            tx
        })
    }

    /// Re-enter async from this synchronous DB trait surface. On an ambient
    /// multithread runtime, `block_in_place` is legal; a current-thread
    /// runtime bridges through a dedicated helper thread instead.
    fn block_on_bridge<T, Fut>(&self, fut: Fut) -> anyhow::Result<T>
    where
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        if let Ok(current) = tokio::runtime::Handle::try_current() {
            if self.runtime_guard.is_none()
                && current.runtime_flavor() == tokio::runtime::RuntimeFlavor::MultiThread
            {
                return tokio::task::block_in_place(|| self.handle.block_on(fut));
            }

            let (tx, rx) = std::sync::mpsc::sync_channel(1);
            let job: BridgeJob = Box::new(move || {
                let out = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .map_err(|e| anyhow::anyhow!("bridge helper runtime bootstrap failed: {e}"))
                    .and_then(|rt| rt.block_on(fut));
                let _ = tx.send(out);
            });
            match Self::bridge_worker_sender().try_send(job) {
                Ok(()) => {}
                Err(_) => {
                    anyhow::bail!("fork bridge worker unavailable; dropping call fail-closed");
                }
            }
            return match rx.recv_timeout(std::time::Duration::from_millis(BRIDGE_TIMEOUT_MS)) {
                Ok(result) => result,
                Err(_) => Err(anyhow::anyhow!(
                    "fork bridge helper timed out after {BRIDGE_TIMEOUT_MS}ms"
                )),
            };
        }

        // Private runtime path: direct blocking is valid.
        self.handle.block_on(fut)
    }

    async fn with_retry<T, F, Fut>(label: &'static str, mut op: F) -> anyhow::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let mut last_err = None;
        for attempt in 0..FETCH_RETRIES {
            if attempt > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(
                    200 * 2u64.pow(attempt - 1),
                ))
                .await;
            }
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("{label}: no attempts made")))
    }

    fn parse_hex_u256(raw: &str) -> anyhow::Result<U256> {
        let trimmed = raw.trim_start_matches("0x");
        if trimmed.is_empty() {
            return Ok(U256::ZERO);
        }
        U256::from_str_radix(trimmed, 16).map_err(anyhow::Error::from)
    }

    async fn fetch_hex_word(
        provider: Arc<HttpProvider>,
        method: &'static str,
        params: serde_json::Value,
    ) -> anyhow::Result<U256> {
        Self::with_retry(method, move || {
            let provider = provider.clone();
            let params = params.clone();
            async move {
                let raw: String = provider
                    .raw_request(std::borrow::Cow::Borrowed(method), params)
                    .await
                    .map_err(|e| anyhow::anyhow!("{e}"))?;
                Self::parse_hex_u256(&raw)
            }
        })
        .await
    }

    async fn fetch_code(
        provider: Arc<HttpProvider>,
        address: Address,
        block_tag: String,
    ) -> anyhow::Result<Vec<u8>> {
        Self::with_retry("eth_getCode", move || {
            let provider = provider.clone();
            let block_tag = block_tag.clone();
            async move {
                let raw: String = provider
                    .raw_request(
                        std::borrow::Cow::Borrowed("eth_getCode"),
                        serde_json::json!([address, block_tag]),
                    )
                    .await
                    .map_err(|e| anyhow::anyhow!("{e}"))?;
                hex::decode(raw.trim_start_matches("0x")).map_err(anyhow::Error::from)
            }
        })
        .await
    }

    async fn fetch_block(
        provider: Arc<HttpProvider>,
        number: u64,
    ) -> anyhow::Result<serde_json::Value> {
        Self::with_retry("eth_getBlockByNumber", move || {
            let provider = provider.clone();
            async move {
                let raw: serde_json::Value = provider
                    .raw_request(
                        std::borrow::Cow::Borrowed("eth_getBlockByNumber"),
                        serde_json::json!([format!("0x{number:x}"), false]),
                    )
                    .await
                    .map_err(|e| anyhow::anyhow!("{e}"))?;
                if raw.is_null() {
                    anyhow::bail!("block 0x{number:x} not found on this endpoint");
                }
                Ok(raw)
            }
        })
        .await
    }

    fn parse_block_hash(block: &serde_json::Value) -> anyhow::Result<B256> {
        let hash = block
            .get("hash")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("eth_getBlockByNumber missing hash field"))?;
        let bytes = hex::decode(hash.trim_start_matches("0x"))?;
        if bytes.len() != 32 {
            anyhow::bail!("block hash wrong length: {}", bytes.len());
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(B256::from(arr))
    }

    fn parse_block_meta(block: &serde_json::Value) -> anyhow::Result<PinnedBlockMeta> {
        let timestamp_raw = block
            .get("timestamp")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow::anyhow!("eth_getBlockByNumber missing timestamp field"))?;
        let timestamp = Self::parse_hex_u256(timestamp_raw)?
            .try_into()
            .map_err(|_| anyhow::anyhow!("block timestamp out of u64 range"))?;

        // Some endpoints omit `miner`; coinbase-free execution is fine.
        let coinbase = block
            .get("miner")
            .and_then(|v| v.as_str())
            .and_then(|raw| raw.parse::<Address>().ok())
            .unwrap_or(Address::ZERO);

        Ok(PinnedBlockMeta {
            timestamp,
            coinbase,
        })
    }

    /// Header fields of the pinned block, fetched once and cached for the
    /// fork's lifetime.
    pub fn pinned_block_meta(&self) -> anyhow::Result<PinnedBlockMeta> {
        if let Some(meta) = self.pinned_meta.get() {
            return Ok(*meta);
        }
        let provider = self.provider.clone();
        let number = self.block;
        let block = self.block_on_bridge(async move { Self::fetch_block(provider, number).await })?;
        let meta = Self::parse_block_meta(&block)?;
        Ok(*self.pinned_meta.get_or_init(|| meta))
    }

    fn load_account(&self, address: Address) -> anyhow::Result<AccountInfo> {
        if let Some(hit) = self.account_cache.get(&address) {
            return Ok(hit.value().clone());
        }

        let block_tag = format!("0x{:x}", self.block);
        let balance_provider = self.provider.clone();
        let nonce_provider = self.provider.clone();
        let code_provider = self.provider.clone();
        let balance_tag = block_tag.clone();
        let nonce_tag = block_tag.clone();

        let (balance, nonce, code_bytes) = self.block_on_bridge(async move {
            let balance = Self::fetch_hex_word(
                balance_provider.clone(),
                "eth_getBalance",
                serde_json::json!([address, balance_tag]),
            );
            let nonce = Self::fetch_hex_word(
                nonce_provider.clone(),
                "eth_getTransactionCount",
                serde_json::json!([address, nonce_tag]),
            );
            let code = Self::fetch_code(code_provider, address, block_tag);
            let (balance, nonce, code) = tokio::join!(balance, nonce, code);
            Ok((balance?, nonce?, code?))
        })?;

        let code_hash = if code_bytes.is_empty() {
            revm::primitives::KECCAK_EMPTY
        } else {
            keccak256(&code_bytes)
        };
        let bytecode = Bytecode::new_raw(code_bytes.into());
        self.code_cache.insert(code_hash, bytecode.clone());

        let info = AccountInfo {
            balance: rU256::from_be_bytes(balance.to_be_bytes::<32>()),
            nonce: nonce.try_into().unwrap_or(u64::MAX),
            code_hash,
            code: Some(bytecode),
        };
        self.account_cache.insert(address, info.clone());
        Ok(info)
    }
}

impl DatabaseRef for ForkDb {
    type Error = anyhow::Error;

    fn basic_ref(&self, address: rAddress) -> Result<Option<AccountInfo>, Self::Error> {
        let addr = Address::from_slice(address.as_slice());
        Ok(Some(self.load_account(addr)?))
    }

    fn code_by_hash_ref(&self, code_hash: B256) -> Result<Bytecode, Self::Error> {
        if code_hash == revm::primitives::KECCAK_EMPTY {
            return Ok(Bytecode::default());
        }
        self.code_cache
            .get(&code_hash)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| anyhow::anyhow!("code for hash {code_hash:#x} not hydrated"))
    }

    fn storage_ref(&self, address: rAddress, index: rU256) -> Result<rU256, Self::Error> {
        let addr = Address::from_slice(address.as_slice());
        let slot = U256::from_be_bytes(index.to_be_bytes::<32>());
        if let Some(hit) = self.storage_cache.get(&(addr, slot)) {
            return Ok(rU256::from_be_bytes(hit.value().to_be_bytes::<32>()));
        }

        let provider = self.provider.clone();
        let block_tag = format!("0x{:x}", self.block);
        let value = self.block_on_bridge(async move {
            Self::fetch_hex_word(
                provider,
                "eth_getStorageAt",
                serde_json::json!([addr, slot, block_tag]),
            )
            .await
        })?;

        self.storage_cache.insert((addr, slot), value);
        Ok(rU256::from_be_bytes(value.to_be_bytes::<32>()))
    }

    fn block_hash_ref(&self, number: u64) -> Result<B256, Self::Error> {
        if let Some(hit) = self.block_hash_cache.get(&number) {
            return Ok(*hit.value());
        }
        let provider = self.provider.clone();
        let block =
            self.block_on_bridge(async move { Self::fetch_block(provider, number).await })?;
        let hash = Self::parse_block_hash(&block)?;
        self.block_hash_cache.insert(number, hash);
        Ok(hash)
    }
}
