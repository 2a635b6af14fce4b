//! Contract ABI definitions and topic hash computation.
//!
//! Minimal ABIs covering only the functions and events the keeper calls or
//! decodes. Enum arguments are carried as `uint8` and converted through
//! `crate::outcome`.

use crate::outcome::Selection;
use alloy::primitives::B256;
use alloy::sol;
use alloy::sol_types::SolEvent;

sol! {
    interface IOddyssey {
        struct MatchResult {
            uint8 moneyline;
            uint8 overUnder;
        }

        struct Match {
            uint64 id;
            uint64 startTime;
            uint32 oddsHome;
            uint32 oddsDraw;
            uint32 oddsAway;
            uint32 oddsOver;
            uint32 oddsUnder;
            MatchResult result;
        }

        struct UserPrediction {
            uint64 matchId;
            uint8 betType;
            bytes32 selection;
            uint32 selectedOdd;
        }

        struct Slip {
            address player;
            uint256 cycleId;
            uint256 placedAt;
            UserPrediction[10] predictions;
            uint256 finalScore;
            uint8 correctCount;
            bool isEvaluated;
        }

        function dailyCycleId() external view returns (uint256);
        function getCycleStatus(uint256 cycleId) external view returns (bool exists, uint8 state, uint256 endTime, uint256 prizePool, uint32 cycleSlipCount, bool hasWinner);
        function getDailyMatches(uint256 cycleId) external view returns (Match[10] memory);
        function getSlip(uint256 slipId) external view returns (Slip memory);

        function startDailyCycle(Match[10] memory matches) external;
        function resolveDailyCycle(uint256 cycleId, MatchResult[10] memory results) external;
        function evaluateSlip(uint256 slipId) external;
        function placeSlip(UserPrediction[10] memory predictions) external payable;

        event CycleStarted(uint256 indexed cycleId, uint256 endTime);
        event SlipPlaced(uint256 indexed cycleId, address indexed player, uint256 indexed slipId);
        event CycleResolved(uint256 indexed cycleId, uint256 prizePool);
        event SlipEvaluated(uint256 indexed slipId, address indexed player, uint256 indexed cycleId, uint8 correctCount, uint256 finalScore);
    }
}

sol! {
    interface IBitredictPool {
        struct PoolInfo {
            address creator;
            uint16 odds;
            bool settled;
            bool creatorSideWon;
            bool isPrivate;
            bool usesBitr;
            uint8 oracleType;
            bytes32 predictedOutcome;
            bytes32 result;
            string marketId;
            uint256 creatorStake;
            uint256 eventStartTime;
            uint256 eventEndTime;
            uint256 bettingEndTime;
        }

        function getPool(uint256 poolId) external view returns (PoolInfo memory);
        function settlePool(uint256 poolId, bytes32 outcome) external;
        function claim(uint256 poolId) external;
        function createPool(
            bytes32 predictedOutcome,
            uint256 odds,
            uint256 creatorStake,
            uint256 eventStartTime,
            uint256 eventEndTime,
            string memory league,
            string memory category,
            string memory marketId,
            bool isPrivate,
            uint256 maxBetPerUser,
            bool useBitr,
            uint8 oracleType
        ) external payable returns (uint256);

        event PoolCreated(uint256 indexed poolId, address indexed creator, uint256 eventStartTime, uint256 eventEndTime, uint8 oracleType, string indexed marketId);
        event BetPlaced(uint256 indexed poolId, address indexed bettor, uint256 amount, bool isForOutcome);
        event LiquidityAdded(uint256 indexed poolId, address indexed provider, uint256 amount);
        event PoolSettled(uint256 indexed poolId, bytes32 result, bool creatorSideWon, uint256 timestamp);
        event RewardClaimed(uint256 indexed poolId, address indexed user, uint256 amount);
    }
}

sol! {
    interface IGuidedOracle {
        function executeCall(address target, bytes calldata data) external;
        function getOutcome(string calldata marketId) external view returns (bool isSet, bytes memory resultData);

        event OutcomeSubmitted(string indexed marketId, bytes resultData, uint256 timestamp);
    }
}

sol! {
    interface IReputationSystem {
        function getUserReputation(address user) external view returns (uint256);
    }
}

/// Compute keccak256 hash of a byte slice.
pub fn keccak256(data: &[u8]) -> B256 {
    use tiny_keccak::{Hasher, Keccak};
    let mut hasher = Keccak::v256();
    let mut output = [0u8; 32];
    hasher.update(data);
    hasher.finalize(&mut output);
    B256::from(output)
}

/// Topic under which an `indexed string` market id appears in logs.
pub fn market_id_hash(market_id: &str) -> B256 {
    keccak256(market_id.as_bytes())
}

/// Hex form used as the key of `oracle.market_id_lookup`.
pub fn hash_hex(hash: &B256) -> String {
    format!("{:#x}", hash)
}

/// The contract stores a selection as the keccak of its label
/// (`"1"`, `"X"`, `"2"`, `"Over"`, `"Under"`).
pub fn selection_hash(selection: Selection) -> B256 {
    keccak256(selection.contract_label().as_bytes())
}

pub fn selection_from_hash(hash: B256) -> Option<Selection> {
    Selection::ALL.into_iter().find(|s| selection_hash(*s) == hash)
}

/// Every event the indexer subscribes to, by topic0.
pub fn oddyssey_topics() -> Vec<B256> {
    vec![
        IOddyssey::CycleStarted::SIGNATURE_HASH,
        IOddyssey::SlipPlaced::SIGNATURE_HASH,
        IOddyssey::CycleResolved::SIGNATURE_HASH,
        IOddyssey::SlipEvaluated::SIGNATURE_HASH,
    ]
}

pub fn pool_topics() -> Vec<B256> {
    vec![
        IBitredictPool::PoolCreated::SIGNATURE_HASH,
        IBitredictPool::BetPlaced::SIGNATURE_HASH,
        IBitredictPool::LiquidityAdded::SIGNATURE_HASH,
        IBitredictPool::PoolSettled::SIGNATURE_HASH,
        IBitredictPool::RewardClaimed::SIGNATURE_HASH,
    ]
}

pub fn oracle_topics() -> Vec<B256> {
    vec![IGuidedOracle::OutcomeSubmitted::SIGNATURE_HASH]
}

/// Verify that the topic hashes used in log filters match the event
/// signatures. Call this at startup to catch any signature mismatches.
pub fn verify_topic_hashes() -> Vec<(String, bool)> {
    let checks = vec![
        (IOddyssey::CycleStarted::SIGNATURE, IOddyssey::CycleStarted::SIGNATURE_HASH),
        (IOddyssey::SlipPlaced::SIGNATURE, IOddyssey::SlipPlaced::SIGNATURE_HASH),
        (IOddyssey::CycleResolved::SIGNATURE, IOddyssey::CycleResolved::SIGNATURE_HASH),
        (IOddyssey::SlipEvaluated::SIGNATURE, IOddyssey::SlipEvaluated::SIGNATURE_HASH),
        (IBitredictPool::PoolCreated::SIGNATURE, IBitredictPool::PoolCreated::SIGNATURE_HASH),
        (IBitredictPool::BetPlaced::SIGNATURE, IBitredictPool::BetPlaced::SIGNATURE_HASH),
        (IBitredictPool::LiquidityAdded::SIGNATURE, IBitredictPool::LiquidityAdded::SIGNATURE_HASH),
        (IBitredictPool::PoolSettled::SIGNATURE, IBitredictPool::PoolSettled::SIGNATURE_HASH),
        (IBitredictPool::RewardClaimed::SIGNATURE, IBitredictPool::RewardClaimed::SIGNATURE_HASH),
        (IGuidedOracle::OutcomeSubmitted::SIGNATURE, IGuidedOracle::OutcomeSubmitted::SIGNATURE_HASH),
    ];

    checks
        .into_iter()
        .map(|(sig, expected)| {
            let computed = keccak256(sig.as_bytes());
            (sig.to_string(), computed == expected)
        })
        .collect()
}
