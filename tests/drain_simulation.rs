use alloy::primitives::{Address, U256};
use proptest::prelude::*;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use vault_sentinel::error::RpcError;
use vault_sentinel::fork::{SessionFactory, VaultStateSession};
use vault_sentinel::ranking::Stakeholder;
use vault_sentinel::simulator::drain_vault;

const BLOCK: u64 = 14_000_000;

fn vault_addr() -> Address {
    Address::repeat_byte(0xda)
}

fn holder(tag: u8) -> Address {
    Address::repeat_byte(tag)
}

fn stakeholder(account: Address, nominal: u64) -> Stakeholder {
    Stakeholder {
        vault: vault_addr(),
        account,
        nominal_shares: U256::from(nominal),
    }
}

/// In-memory vault model: a share ledger and one liquid reserve that every
/// redemption draws down. `all_or_nothing` makes a withdrawal revert unless
/// the reserve covers the full request, mimicking vaults without partial
/// fills. `fault_on_withdraw` injects an RPC-style fault on the n-th
/// redemption call.
struct FakeVaultSession {
    total_supply: U256,
    reserve: U256,
    balances: HashMap<Address, U256>,
    unlocked: HashSet<Address>,
    all_or_nothing: bool,
    fault_on_withdraw: Option<usize>,
    withdraw_calls: usize,
}

impl VaultStateSession for FakeVaultSession {
    fn total_supply(&mut self, _vault: Address) -> vault_sentinel::error::Result<U256> {
        Ok(self.total_supply)
    }

    fn balance_of(
        &mut self,
        _vault: Address,
        account: Address,
    ) -> vault_sentinel::error::Result<U256> {
        Ok(self.balances.get(&account).copied().unwrap_or(U256::ZERO))
    }

    fn withdraw(
        &mut self,
        _vault: Address,
        account: Address,
        amount: U256,
    ) -> vault_sentinel::error::Result<bool> {
        let call_index = self.withdraw_calls;
        self.withdraw_calls += 1;
        if self.fault_on_withdraw == Some(call_index) {
            return Err(RpcError::Transport("connection reset by peer".into()).into());
        }
        if !self.unlocked.contains(&account) {
            return Ok(false);
        }
        let balance = self.balances.get(&account).copied().unwrap_or(U256::ZERO);
        let requested = amount.min(balance);
        if self.all_or_nothing && requested > self.reserve {
            return Ok(false);
        }
        let filled = requested.min(self.reserve);
        if filled.is_zero() {
            return Ok(false);
        }
        self.reserve -= filled;
        self.balances.insert(account, balance - filled);
        Ok(true)
    }
}

struct FakeForkFactory {
    total_supply: U256,
    reserve: U256,
    balances: Vec<(Address, U256)>,
    all_or_nothing: bool,
    fault_on_withdraw: Option<usize>,
    opened: Mutex<Vec<(u64, Vec<Address>)>>,
}

impl FakeForkFactory {
    fn new(total_supply: u64, reserve: u64, balances: &[(Address, u64)]) -> Self {
        Self {
            total_supply: U256::from(total_supply),
            reserve: U256::from(reserve),
            balances: balances
                .iter()
                .map(|(a, b)| (*a, U256::from(*b)))
                .collect(),
            all_or_nothing: false,
            fault_on_withdraw: None,
            opened: Mutex::new(Vec::new()),
        }
    }

    fn all_or_nothing(mut self) -> Self {
        self.all_or_nothing = true;
        self
    }

    fn fault_on_withdraw(mut self, call_index: usize) -> Self {
        self.fault_on_withdraw = Some(call_index);
        self
    }
}

impl SessionFactory for FakeForkFactory {
    fn open(
        &self,
        block: u64,
        accounts: &[Address],
    ) -> vault_sentinel::error::Result<Box<dyn VaultStateSession>> {
        self.opened
            .lock()
            .expect("factory lock")
            .push((block, accounts.to_vec()));
        Ok(Box::new(FakeVaultSession {
            total_supply: self.total_supply,
            reserve: self.reserve,
            balances: self.balances.iter().copied().collect(),
            unlocked: accounts.iter().copied().collect(),
            all_or_nothing: self.all_or_nothing,
            fault_on_withdraw: self.fault_on_withdraw,
            withdraw_calls: 0,
        }))
    }
}

#[test]
fn test_reserve_capped_sequential_drain() {
    // Canonical scenario: holders [900, 500] against a reserve of 1000.
    // The first exits fully, the second only gets the 100 left behind.
    let (a, b) = (holder(0x01), holder(0x02));
    let factory = FakeForkFactory::new(2000, 1000, &[(a, 900), (b, 500)]);
    let holders = [stakeholder(a, 900), stakeholder(b, 500)];

    let summary = drain_vault(&factory, BLOCK, vault_addr(), &holders)
        .expect("drain")
        .expect("summary");

    assert_eq!(summary.total_supply, U256::from(2000u64));
    assert_eq!(summary.holder_shares, U256::from(1400u64));
    assert_eq!(
        summary.withdrawable_shares,
        U256::from(1000u64),
        "1000 redeemable, not the 1400 an independent-session replay would report"
    );
}

#[test]
fn test_replay_order_changes_outcome_when_liquidity_is_short() {
    let (a, b) = (holder(0x01), holder(0x02));
    let balances = [(a, 900u64), (b, 500u64)];

    // All-or-nothing fills make ordering observable in the totals.
    let descending = [stakeholder(a, 900), stakeholder(b, 500)];
    let factory = FakeForkFactory::new(2000, 1000, &balances).all_or_nothing();
    let summary = drain_vault(&factory, BLOCK, vault_addr(), &descending)
        .expect("drain")
        .expect("summary");
    assert_eq!(summary.withdrawable_shares, U256::from(900u64));

    let ascending = [stakeholder(b, 500), stakeholder(a, 900)];
    let factory = FakeForkFactory::new(2000, 1000, &balances).all_or_nothing();
    let summary = drain_vault(&factory, BLOCK, vault_addr(), &ascending)
        .expect("drain")
        .expect("summary");
    assert_eq!(summary.withdrawable_shares, U256::from(500u64));
}

#[test]
fn test_zero_holders_yield_no_summary() {
    let factory = FakeForkFactory::new(999, 999, &[]);
    let result = drain_vault(&factory, BLOCK, vault_addr(), &[]).expect("drain");
    assert!(result.is_none());
    assert!(
        factory.opened.lock().expect("factory lock").is_empty(),
        "no fork is opened for a vault with no rankable holders"
    );
}

#[test]
fn test_fork_balances_override_stale_nominals() {
    let a = holder(0x01);
    // The indexer claims 10_000 shares; the fork says 700.
    let factory = FakeForkFactory::new(5000, 5000, &[(a, 700)]);
    let holders = [stakeholder(a, 10_000)];

    let summary = drain_vault(&factory, BLOCK, vault_addr(), &holders)
        .expect("drain")
        .expect("summary");
    assert_eq!(summary.holder_shares, U256::from(700u64));
    assert_eq!(summary.withdrawable_shares, U256::from(700u64));
}

#[test]
fn test_transport_fault_mid_drain_aborts_instead_of_reporting_zero() {
    // An RPC fault during a redemption call is a failed scan, not a
    // zero-redemption measurement: no summary may escape for this vault.
    let (a, b) = (holder(0x01), holder(0x02));
    let factory =
        FakeForkFactory::new(2000, 1000, &[(a, 900), (b, 500)]).fault_on_withdraw(1);
    let holders = [stakeholder(a, 900), stakeholder(b, 500)];

    let err = drain_vault(&factory, BLOCK, vault_addr(), &holders)
        .expect_err("a transport fault must propagate, not measure as redeemed=0");
    assert!(err.to_string().contains("transport failure"));
}

#[test]
fn test_failed_withdrawals_measure_as_zero_not_error() {
    let (a, b) = (holder(0x01), holder(0x02));
    let factory = FakeForkFactory::new(2000, 0, &[(a, 900), (b, 500)]);
    let holders = [stakeholder(a, 900), stakeholder(b, 500)];

    let summary = drain_vault(&factory, BLOCK, vault_addr(), &holders)
        .expect("a dry vault is a signal, not a fault")
        .expect("summary");
    assert_eq!(summary.holder_shares, U256::from(1400u64));
    assert_eq!(summary.withdrawable_shares, U256::ZERO);
}

#[test]
fn test_session_opens_pinned_with_exact_holder_set() {
    let (a, b, c) = (holder(0x01), holder(0x02), holder(0x03));
    let factory = FakeForkFactory::new(100, 100, &[(a, 10), (b, 20), (c, 30)]);
    let holders = [stakeholder(c, 30), stakeholder(b, 20), stakeholder(a, 10)];

    drain_vault(&factory, BLOCK, vault_addr(), &holders).expect("drain");

    let opened = factory.opened.lock().expect("factory lock");
    assert_eq!(opened.len(), 1, "one session per vault per scan");
    assert_eq!(opened[0].0, BLOCK);
    assert_eq!(opened[0].1, vec![c, b, a], "ranked order, nothing extra");
}

proptest! {
    /// A holder can never redeem more than its balance, so the vault total
    /// can never exceed the holders' combined (corrected) shares.
    #[test]
    fn prop_withdrawable_never_exceeds_holder_shares(
        balances in proptest::collection::vec(0u64..1_000_000, 1..10),
        reserve in 0u64..2_000_000,
        all_or_nothing in proptest::bool::ANY,
    ) {
        let accounts = (0..balances.len())
            .map(|i| holder(0x10 + i as u8))
            .collect::<Vec<_>>();
        let ledger = accounts
            .iter()
            .copied()
            .zip(balances.iter().copied())
            .collect::<Vec<_>>();

        let mut factory = FakeForkFactory::new(10_000_000, reserve, &ledger);
        if all_or_nothing {
            factory = factory.all_or_nothing();
        }
        let holders = ledger
            .iter()
            .map(|(a, b)| stakeholder(*a, *b))
            .collect::<Vec<_>>();

        let summary = drain_vault(&factory, BLOCK, vault_addr(), &holders)
            .expect("drain")
            .expect("summary");

        let nominal_total: u64 = balances.iter().sum();
        prop_assert_eq!(summary.holder_shares, U256::from(nominal_total));
        prop_assert!(summary.withdrawable_shares <= summary.holder_shares);
        prop_assert!(summary.withdrawable_shares <= U256::from(reserve));
    }
}
