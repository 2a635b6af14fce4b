//! alloy-backed chain gateway.
//!
//! Reads go through an unsigned HTTP provider. Writes go through a wallet
//! provider per signer and are serialized by that signer's mutex so nonces
//! are never raced. Every RPC is bounded by `rpc_timeout`.

use super::abi::{self, IBitredictPool, IGuidedOracle, IOddyssey, IReputationSystem};
use super::types::*;
use super::{check_resolve_inputs, ChainGateway};
use crate::config::{ChainConfig, GasCeilings};
use crate::error::{KeeperError, Result};
use crate::indexer::events::{sort_events, ChainEvent};
use crate::indexer::{decode::decode_log, LogSource};
use crate::outcome::{CycleState, MatchResultCodes, MoneylineCode, OracleType, OverUnderCode};
use crate::results::MATCHES_PER_CYCLE;
use crate::store::models::{CycleMatch, SlipPrediction};
use alloy::network::{EthereumWallet, TransactionBuilder};
use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::rpc::types::{Filter, TransactionRequest};
use alloy::signers::local::PrivateKeySigner;
use alloy::sol_types::SolCall;
use async_trait::async_trait;
use std::future::IntoFuture;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

const RECEIPT_TIMEOUT: Duration = Duration::from_secs(180);
/// Pre-broadcast attempts on transient RPC failures.
const SEND_ATTEMPTS: u32 = 3;

struct Signer {
    provider: DynProvider,
    address: Address,
    nonce_lock: Mutex<()>,
}

pub struct EvmGateway {
    reader: DynProvider,
    keeper: Option<Arc<Signer>>,
    oracle: Option<Arc<Signer>>,
    contracts: ContractAddresses,
    rpc_timeout: Duration,
    gas_buffer_pct: u64,
    ceilings: GasCeilings,
}

fn parse_address(raw: &str, field: &str) -> Result<Address> {
    if raw.is_empty() {
        return Ok(Address::ZERO);
    }
    Address::from_str(raw).map_err(|e| KeeperError::Config(format!("invalid {}: {}", field, e)))
}

fn require(addr: Address, name: &str) -> Result<Address> {
    if addr == Address::ZERO {
        return Err(KeeperError::Config(format!("{} address not configured", name)));
    }
    Ok(addr)
}

async fn connect_signer(rpc_url: &str, key: &str, role: &str) -> Result<Arc<Signer>> {
    let signer = PrivateKeySigner::from_str(key.trim_start_matches("0x"))
        .map_err(|e| KeeperError::Config(format!("invalid {} private key: {}", role, e)))?;
    let address = signer.address();
    let provider = ProviderBuilder::new()
        .wallet(EthereumWallet::from(signer))
        .connect(rpc_url)
        .await
        .map_err(|e| KeeperError::Config(format!("failed to build {} provider: {}", role, e)))?
        .erased();
    info!(role = role, address = %address, "signer ready");
    Ok(Arc::new(Signer {
        provider,
        address,
        nonce_lock: Mutex::new(()),
    }))
}

impl EvmGateway {
    /// Build providers for the configured RPC endpoint. Without a keeper key
    /// the gateway is read-only; without an oracle key, oracle calls are
    /// signed by the keeper key.
    pub async fn connect(config: &ChainConfig) -> Result<Self> {
        if config.rpc_url.is_empty() {
            return Err(KeeperError::Config("RPC_URL is not set".into()));
        }
        let reader = ProviderBuilder::new()
            .connect(&config.rpc_url)
            .await
            .map_err(|e| KeeperError::Config(format!("failed to build provider: {}", e)))?
            .erased();

        let keeper = if config.private_key.is_empty() {
            warn!("no PRIVATE_KEY configured, chain gateway is read-only");
            None
        } else {
            Some(connect_signer(&config.rpc_url, &config.private_key, "keeper").await?)
        };
        let oracle = if config.oracle_private_key.is_empty() || config.oracle_private_key == config.private_key {
            keeper.clone()
        } else {
            Some(connect_signer(&config.rpc_url, &config.oracle_private_key, "oracle").await?)
        };

        let reputation = parse_address(&config.reputation_address, "REPUTATION_ADDRESS")?;
        let contracts = ContractAddresses {
            oddyssey: parse_address(&config.oddyssey_address, "ODDYSSEY_ADDRESS")?,
            pool: parse_address(&config.pool_address, "POOL_ADDRESS")?,
            guided_oracle: parse_address(&config.guided_oracle_address, "GUIDED_ORACLE_ADDRESS")?,
            reputation: (reputation != Address::ZERO).then_some(reputation),
        };

        info!(
            oddyssey = %contracts.oddyssey,
            pool = %contracts.pool,
            guided_oracle = %contracts.guided_oracle,
            "chain gateway configured"
        );

        Ok(Self {
            reader,
            keeper,
            oracle,
            contracts,
            rpc_timeout: Duration::from_secs(config.rpc_timeout_secs),
            gas_buffer_pct: config.gas_buffer_pct,
            ceilings: config.gas_ceilings.clone(),
        })
    }

    pub fn contracts(&self) -> ContractAddresses {
        self.contracts
    }

    /// Addresses the indexer follows, skipping unconfigured ones.
    pub fn indexed_contracts(&self) -> Vec<Address> {
        [self.contracts.oddyssey, self.contracts.pool, self.contracts.guided_oracle]
            .into_iter()
            .filter(|a| *a != Address::ZERO)
            .collect()
    }

    fn topics_for(&self, contract: Address) -> Vec<B256> {
        if contract == self.contracts.oddyssey {
            abi::oddyssey_topics()
        } else if contract == self.contracts.pool {
            abi::pool_topics()
        } else if contract == self.contracts.guided_oracle {
            abi::oracle_topics()
        } else {
            Vec::new()
        }
    }

    /// Await an RPC future with the configured timeout, classifying errors.
    async fn rpc<F, T, E>(&self, fut: F) -> Result<T>
    where
        F: IntoFuture<Output = std::result::Result<T, E>> + Send,
        F::IntoFuture: Send,
        E: std::fmt::Display,
    {
        match tokio::time::timeout(self.rpc_timeout, fut.into_future()).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(KeeperError::from_rpc(e)),
            Err(_) => Err(KeeperError::TransientRpc(format!(
                "rpc call timed out after {}s",
                self.rpc_timeout.as_secs()
            ))),
        }
    }

    async fn read<C>(&self, to: Address, call: C) -> Result<C::Return>
    where
        C: SolCall + Send + Sync,
        C::Return: Send,
    {
        let tx = TransactionRequest::default().with_to(to).with_input(call.abi_encode());
        let out: Bytes = self.rpc(self.reader.call(tx)).await?;
        C::abi_decode_returns(&out)
            .map_err(|e| KeeperError::Validation(format!("undecodable {} return: {}", C::SIGNATURE, e)))
    }

    fn keeper(&self) -> Result<&Signer> {
        self.keeper
            .as_deref()
            .ok_or_else(|| KeeperError::Config("PRIVATE_KEY is not set, cannot sign".into()))
    }

    fn oracle(&self) -> Result<&Signer> {
        self.oracle
            .as_deref()
            .ok_or_else(|| KeeperError::Config("ORACLE_PRIVATE_KEY is not set, cannot sign".into()))
    }

    /// Estimate gas for `tx`. A reverting estimate falls back to the write's
    /// ceiling; the revert reason is returned alongside.
    async fn estimate(
        &self,
        kind: WriteKind,
        signer: &Signer,
        tx: &TransactionRequest,
        value: U256,
    ) -> Result<(GasEstimate, Option<String>)> {
        let gas_price: u128 = self.rpc(signer.provider.get_gas_price()).await?;
        let ceiling = kind.ceiling(&self.ceilings);
        let (estimate, revert_reason) = match self.rpc(signer.provider.estimate_gas(tx.clone())).await {
            Ok(g) => (Some(g), None),
            Err(KeeperError::TxRevert { reason, .. }) => {
                warn!(write = %kind, reason = %reason, ceiling = ceiling, "gas estimation reverted, using ceiling");
                (None, Some(reason))
            }
            Err(e) => return Err(e),
        };
        Ok((
            GasEstimate::compute(estimate, ceiling, self.gas_buffer_pct, gas_price, value),
            revert_reason,
        ))
    }

    /// estimate → balance check → send, retried on transient failures.
    /// Returns the broadcast hash with the estimate it was sent under.
    async fn broadcast(
        &self,
        kind: WriteKind,
        signer: &Signer,
        to: Address,
        input: Vec<u8>,
        value: U256,
    ) -> Result<(B256, GasEstimate, Option<String>)> {
        let base = TransactionRequest::default()
            .with_from(signer.address)
            .with_to(to)
            .with_input(input)
            .with_value(value);

        let mut last_error = String::new();
        for attempt in 1..=SEND_ATTEMPTS {
            let result = async {
                let (gas, revert_reason) = self.estimate(kind, signer, &base, value).await?;
                let balance: U256 = self.rpc(signer.provider.get_balance(signer.address)).await?;
                if gas.total_cost_wei > balance {
                    return Err(KeeperError::InsufficientFunds {
                        needed: gas.total_cost_wei.to_string(),
                        available: balance.to_string(),
                    });
                }
                info!(
                    write = %kind,
                    estimate = gas.estimate,
                    gas_limit = gas.gas_limit,
                    total_cost_wei = %gas.total_cost_wei,
                    used_ceiling = gas.used_ceiling,
                    "sending transaction"
                );
                let tx = base
                    .clone()
                    .with_gas_limit(gas.gas_limit)
                    .with_gas_price(gas.gas_price);
                let pending = self.rpc(signer.provider.send_transaction(tx)).await?;
                Ok((*pending.tx_hash(), gas, revert_reason))
            }
            .await;

            match result {
                Ok(sent) => return Ok(sent),
                Err(KeeperError::TransientRpc(msg)) => {
                    warn!(write = %kind, attempt = attempt, error = %msg, "transient failure before broadcast");
                    last_error = msg;
                    tokio::time::sleep(Duration::from_millis(500 * u64::from(attempt))).await;
                }
                Err(e) => return Err(e),
            }
        }
        Err(KeeperError::TransactionFailed {
            attempts: SEND_ATTEMPTS,
            last_error,
        })
    }

    async fn send(
        &self,
        kind: WriteKind,
        signer: &Signer,
        to: Address,
        input: Vec<u8>,
        value: U256,
    ) -> Result<TxOutcome> {
        let _nonce = signer.nonce_lock.lock().await;

        let (tx_hash, gas, estimate_revert) = self.broadcast(kind, signer, to, input, value).await?;
        debug!(write = %kind, tx_hash = %tx_hash, "transaction broadcast, waiting for receipt");

        let receipt = self.wait_for_receipt(signer, tx_hash).await?;

        if !receipt.status() {
            let reason = estimate_revert.unwrap_or_else(|| format!("{} reverted on-chain", kind));
            error!(write = %kind, tx_hash = %tx_hash, reason = %reason, "transaction reverted");
            return Err(KeeperError::TxRevert {
                reason,
                tx_hash: Some(format!("{:#x}", tx_hash)),
            });
        }

        let outcome = TxOutcome {
            tx_hash,
            gas_used: receipt.gas_used,
            block_number: receipt.block_number,
            gas,
        };
        info!(
            write = %kind,
            tx_hash = %tx_hash,
            gas_used = outcome.gas_used,
            block = outcome.block_number.unwrap_or(0),
            "transaction confirmed"
        );
        Ok(outcome)
    }

    /// Poll for the receipt until it appears or `RECEIPT_TIMEOUT` elapses.
    async fn wait_for_receipt(
        &self,
        signer: &Signer,
        tx_hash: B256,
    ) -> Result<alloy::rpc::types::TransactionReceipt> {
        let deadline = tokio::time::Instant::now() + RECEIPT_TIMEOUT;
        loop {
            match self.rpc(signer.provider.get_transaction_receipt(tx_hash)).await {
                Ok(Some(receipt)) => return Ok(receipt),
                Ok(None) => {}
                Err(KeeperError::TransientRpc(msg)) => {
                    debug!(tx_hash = %tx_hash, error = %msg, "receipt poll failed");
                }
                Err(e) => return Err(e),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(KeeperError::TransientRpc(format!(
                    "no receipt for {:#x} after {}s",
                    tx_hash,
                    RECEIPT_TIMEOUT.as_secs()
                )));
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }
}

#[async_trait]
impl ChainGateway for EvmGateway {
    async fn current_cycle_id(&self) -> Result<u64> {
        let oddyssey = require(self.contracts.oddyssey, "Oddyssey")?;
        let id = self.read(oddyssey, IOddyssey::dailyCycleIdCall {}).await?;
        u256_to_u64(id, "cycle id")
    }

    async fn cycle_status(&self, cycle_id: u64) -> Result<CycleStatus> {
        let oddyssey = require(self.contracts.oddyssey, "Oddyssey")?;
        let ret = self
            .read(
                oddyssey,
                IOddyssey::getCycleStatusCall {
                    cycleId: U256::from(cycle_id),
                },
            )
            .await?;
        Ok(CycleStatus {
            exists: ret.exists,
            state: CycleState::from_u8(ret.state),
            end_time: u256_to_u64(ret.endTime, "end time")?,
            prize_pool: ret.prizePool,
            slip_count: ret.cycleSlipCount,
        })
    }

    async fn cycle_matches(&self, cycle_id: u64) -> Result<Vec<OnChainMatch>> {
        let oddyssey = require(self.contracts.oddyssey, "Oddyssey")?;
        let matches = self
            .read(
                oddyssey,
                IOddyssey::getDailyMatchesCall {
                    cycleId: U256::from(cycle_id),
                },
            )
            .await?;
        Ok(matches
            .iter()
            .map(|m| OnChainMatch {
                id: m.id,
                start_time: m.startTime,
                odds_home: m.oddsHome,
                odds_draw: m.oddsDraw,
                odds_away: m.oddsAway,
                odds_over: m.oddsOver,
                odds_under: m.oddsUnder,
                result: MatchResultCodes {
                    moneyline: MoneylineCode::from_u8(m.result.moneyline),
                    over_under: OverUnderCode::from_u8(m.result.overUnder),
                },
            })
            .collect())
    }

    async fn slip(&self, slip_id: u64) -> Result<OnChainSlip> {
        let oddyssey = require(self.contracts.oddyssey, "Oddyssey")?;
        let s = self
            .read(
                oddyssey,
                IOddyssey::getSlipCall {
                    slipId: U256::from(slip_id),
                },
            )
            .await?;
        if s.player == Address::ZERO {
            return Err(KeeperError::NotFound(format!("slip {} not on chain", slip_id)));
        }
        Ok(OnChainSlip {
            slip_id,
            player: s.player,
            cycle_id: u256_to_u64(s.cycleId, "cycle id")?,
            placed_at: u256_to_u64(s.placedAt, "placed at")?,
            predictions: s
                .predictions
                .iter()
                .map(|p| OnChainPrediction {
                    match_id: p.matchId,
                    bet_type: p.betType,
                    selection: p.selection,
                    selected_odd: p.selectedOdd,
                })
                .collect(),
            final_score: s.finalScore,
            correct_count: s.correctCount,
            is_evaluated: s.isEvaluated,
        })
    }

    async fn pool(&self, pool_id: u64) -> Result<OnChainPool> {
        let pool_addr = require(self.contracts.pool, "pool")?;
        let p = self
            .read(
                pool_addr,
                IBitredictPool::getPoolCall {
                    poolId: U256::from(pool_id),
                },
            )
            .await?;
        if p.creator == Address::ZERO {
            return Err(KeeperError::NotFound(format!("pool {} not on chain", pool_id)));
        }
        Ok(OnChainPool {
            pool_id,
            creator: p.creator,
            odds: p.odds,
            settled: p.settled,
            creator_side_won: p.creatorSideWon,
            is_private: p.isPrivate,
            uses_bitr: p.usesBitr,
            oracle_type: OracleType::from_u8(p.oracleType)?,
            predicted_outcome: p.predictedOutcome,
            result: p.result,
            market_id: p.marketId,
            creator_stake: p.creatorStake,
            event_start_time: u256_to_u64(p.eventStartTime, "event start")?,
            event_end_time: u256_to_u64(p.eventEndTime, "event end")?,
            betting_end_time: u256_to_u64(p.bettingEndTime, "betting end")?,
        })
    }

    async fn reputation(&self, user: Address) -> Result<U256> {
        let addr = self
            .contracts
            .reputation
            .ok_or_else(|| KeeperError::Config("REPUTATION_ADDRESS is not set".into()))?;
        self.read(addr, IReputationSystem::getUserReputationCall { user }).await
    }

    async fn oracle_outcome(&self, market_id: &str) -> Result<Option<Bytes>> {
        let oracle = require(self.contracts.guided_oracle, "guided oracle")?;
        let ret = self
            .read(
                oracle,
                IGuidedOracle::getOutcomeCall {
                    marketId: market_id.to_string(),
                },
            )
            .await?;
        Ok(ret.isSet.then_some(ret.resultData))
    }

    async fn start_daily_cycle(&self, matches: &[CycleMatch]) -> Result<TxOutcome> {
        if matches.len() != MATCHES_PER_CYCLE {
            return Err(KeeperError::InvariantViolation(format!(
                "a cycle needs {} matches, got {}",
                MATCHES_PER_CYCLE,
                matches.len()
            )));
        }
        let oddyssey = require(self.contracts.oddyssey, "Oddyssey")?;
        let encoded: Vec<IOddyssey::Match> = matches
            .iter()
            .map(|m| {
                Ok(IOddyssey::Match {
                    id: u64::try_from(m.fixture_id).map_err(|_| {
                        KeeperError::Validation(format!("negative fixture id {}", m.fixture_id))
                    })?,
                    startTime: u64::try_from(m.kickoff.timestamp()).map_err(|_| {
                        KeeperError::Validation(format!("kickoff of {} before epoch", m.fixture_id))
                    })?,
                    oddsHome: m.odds_home,
                    oddsDraw: m.odds_draw,
                    oddsAway: m.odds_away,
                    oddsOver: m.odds_over,
                    oddsUnder: m.odds_under,
                    result: IOddyssey::MatchResult {
                        moneyline: 0,
                        overUnder: 0,
                    },
                })
            })
            .collect::<Result<_>>()?;
        let matches: [IOddyssey::Match; 10] = encoded
            .try_into()
            .map_err(|_| KeeperError::InvariantViolation("cycle match array length".into()))?;
        let call = IOddyssey::startDailyCycleCall { matches };
        self.send(WriteKind::StartCycle, self.keeper()?, oddyssey, call.abi_encode(), U256::ZERO)
            .await
    }

    async fn resolve_cycle(&self, cycle_id: u64, results: &[MatchResultCodes]) -> Result<TxOutcome> {
        check_resolve_inputs(cycle_id, results)?;
        let oddyssey = require(self.contracts.oddyssey, "Oddyssey")?;
        let encoded: Vec<IOddyssey::MatchResult> = results
            .iter()
            .map(|r| IOddyssey::MatchResult {
                moneyline: r.moneyline as u8,
                overUnder: r.over_under as u8,
            })
            .collect();
        let results: [IOddyssey::MatchResult; 10] = encoded
            .try_into()
            .map_err(|_| KeeperError::InvariantViolation("result array length".into()))?;
        let call = IOddyssey::resolveDailyCycleCall {
            cycleId: U256::from(cycle_id),
            results,
        };
        self.send(WriteKind::ResolveCycle, self.keeper()?, oddyssey, call.abi_encode(), U256::ZERO)
            .await
    }

    async fn evaluate_slip(&self, slip_id: u64) -> Result<TxOutcome> {
        let oddyssey = require(self.contracts.oddyssey, "Oddyssey")?;
        let call = IOddyssey::evaluateSlipCall {
            slipId: U256::from(slip_id),
        };
        self.send(WriteKind::EvaluateSlip, self.keeper()?, oddyssey, call.abi_encode(), U256::ZERO)
            .await
    }

    async fn place_slip(&self, predictions: &[SlipPrediction], entry_fee: U256) -> Result<TxOutcome> {
        let oddyssey = require(self.contracts.oddyssey, "Oddyssey")?;
        let encoded: Vec<IOddyssey::UserPrediction> = predictions
            .iter()
            .map(|p| {
                Ok(IOddyssey::UserPrediction {
                    matchId: u64::try_from(p.match_id)
                        .map_err(|_| KeeperError::Validation(format!("negative match id {}", p.match_id)))?,
                    betType: p.bet_type.code(),
                    selection: abi::selection_hash(p.selection),
                    selectedOdd: p.selected_odd,
                })
            })
            .collect::<Result<_>>()?;
        let predictions: [IOddyssey::UserPrediction; 10] = encoded.try_into().map_err(|v: Vec<_>| {
            KeeperError::Validation(format!("a slip needs {} predictions, got {}", MATCHES_PER_CYCLE, v.len()))
        })?;
        let call = IOddyssey::placeSlipCall { predictions };
        self.send(WriteKind::PlaceSlip, self.keeper()?, oddyssey, call.abi_encode(), entry_fee)
            .await
    }

    async fn settle_pool(&self, pool_id: u64, outcome: B256) -> Result<TxOutcome> {
        let pool_addr = require(self.contracts.pool, "pool")?;
        let oracle = require(self.contracts.guided_oracle, "guided oracle")?;
        let inner = IBitredictPool::settlePoolCall {
            poolId: U256::from(pool_id),
            outcome,
        }
        .abi_encode();
        let call = IGuidedOracle::executeCallCall {
            target: pool_addr,
            data: Bytes::from(inner),
        };
        self.send(WriteKind::SettlePool, self.oracle()?, oracle, call.abi_encode(), U256::ZERO)
            .await
    }

    async fn create_pool(&self, params: &CreatePoolParams, value: U256) -> Result<TxOutcome> {
        let pool_addr = require(self.contracts.pool, "pool")?;
        let call = IBitredictPool::createPoolCall {
            predictedOutcome: params.predicted_outcome,
            odds: U256::from(params.odds),
            creatorStake: params.creator_stake,
            eventStartTime: U256::from(params.event_start_time),
            eventEndTime: U256::from(params.event_end_time),
            league: params.league.clone(),
            category: params.category.clone(),
            marketId: params.market_id.clone(),
            isPrivate: params.is_private,
            maxBetPerUser: params.max_bet_per_user,
            useBitr: params.uses_bitr,
            oracleType: match params.oracle_type {
                OracleType::Guided => 0,
                OracleType::Open => 1,
            },
        };
        self.send(WriteKind::CreatePool, self.keeper()?, pool_addr, call.abi_encode(), value)
            .await
    }

    async fn claim(&self, pool_id: u64) -> Result<TxOutcome> {
        let pool_addr = require(self.contracts.pool, "pool")?;
        let call = IBitredictPool::claimCall {
            poolId: U256::from(pool_id),
        };
        self.send(WriteKind::Claim, self.keeper()?, pool_addr, call.abi_encode(), U256::ZERO)
            .await
    }
}

#[async_trait]
impl LogSource for EvmGateway {
    async fn head_block(&self) -> Result<u64> {
        self.rpc(self.reader.get_block_number()).await
    }

    async fn fetch_events(&self, contract: Address, from_block: u64, to_block: u64) -> Result<Vec<ChainEvent>> {
        let topics = self.topics_for(contract);
        if topics.is_empty() {
            return Ok(Vec::new());
        }
        let filter = Filter::new()
            .address(contract)
            .event_signature(topics)
            .from_block(from_block)
            .to_block(to_block);
        let logs = self.rpc(self.reader.get_logs(&filter)).await?;

        let mut events = Vec::with_capacity(logs.len());
        for log in &logs {
            match decode_log(log) {
                Ok(Some(ev)) => events.push(ev),
                Ok(None) => {}
                Err(e) => warn!(
                    contract = %contract,
                    block = log.block_number.unwrap_or(0),
                    error = %e,
                    "skipping undecodable log"
                ),
            }
        }
        sort_events(&mut events);
        debug!(
            contract = %contract,
            from = from_block,
            to = to_block,
            logs = logs.len(),
            events = events.len(),
            "fetched events"
        );
        Ok(events)
    }
}
