//! Canonical result and prediction enums.
//!
//! Every boundary that touches an outcome string (database rows, feed
//! payloads, contract calls) routes through this module. The canonical form
//! is the full word (`Home`, `Draw`, `Away`, `Over`, `Under`, `Yes`, `No`);
//! short forms are only accepted by the explicit legacy normalizers used by
//! repair tooling.

use crate::error::{KeeperError, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Full-time 1X2 result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Moneyline {
    Home,
    Draw,
    Away,
}

/// Over/Under 2.5 goals result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OverUnder {
    Over,
    Under,
}

/// Both-teams-to-score result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Btts {
    Yes,
    No,
}

impl Moneyline {
    pub fn as_str(&self) -> &'static str {
        match self {
            Moneyline::Home => "Home",
            Moneyline::Draw => "Draw",
            Moneyline::Away => "Away",
        }
    }

    /// Accepts legacy spellings (`1`, `X`, `2`, lowercase words) and returns
    /// the canonical value. Only repair paths should call this.
    pub fn normalize_legacy(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "home" | "1" | "homewin" | "home_win" => Some(Moneyline::Home),
            "draw" | "x" => Some(Moneyline::Draw),
            "away" | "2" | "awaywin" | "away_win" => Some(Moneyline::Away),
            _ => None,
        }
    }

    pub fn code(&self) -> MoneylineCode {
        match self {
            Moneyline::Home => MoneylineCode::HomeWin,
            Moneyline::Draw => MoneylineCode::Draw,
            Moneyline::Away => MoneylineCode::AwayWin,
        }
    }
}

impl OverUnder {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverUnder::Over => "Over",
            OverUnder::Under => "Under",
        }
    }

    pub fn normalize_legacy(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "over" | "o" => Some(OverUnder::Over),
            "under" | "u" => Some(OverUnder::Under),
            _ => None,
        }
    }

    pub fn code(&self) -> OverUnderCode {
        match self {
            OverUnder::Over => OverUnderCode::Over,
            OverUnder::Under => OverUnderCode::Under,
        }
    }
}

impl Btts {
    pub fn as_str(&self) -> &'static str {
        match self {
            Btts::Yes => "Yes",
            Btts::No => "No",
        }
    }

    pub fn normalize_legacy(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "yes" | "y" => Some(Btts::Yes),
            "no" | "n" => Some(Btts::No),
            _ => None,
        }
    }
}

impl FromStr for Moneyline {
    type Err = KeeperError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Home" => Ok(Moneyline::Home),
            "Draw" => Ok(Moneyline::Draw),
            "Away" => Ok(Moneyline::Away),
            other => Err(KeeperError::Validation(format!(
                "non-canonical 1X2 outcome {:?} (expected Home, Draw or Away)",
                other
            ))),
        }
    }
}

impl FromStr for OverUnder {
    type Err = KeeperError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Over" => Ok(OverUnder::Over),
            "Under" => Ok(OverUnder::Under),
            other => Err(KeeperError::Validation(format!(
                "non-canonical O/U outcome {:?} (expected Over or Under)",
                other
            ))),
        }
    }
}

impl FromStr for Btts {
    type Err = KeeperError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Yes" => Ok(Btts::Yes),
            "No" => Ok(Btts::No),
            other => Err(KeeperError::Validation(format!(
                "non-canonical BTTS outcome {:?} (expected Yes or No)",
                other
            ))),
        }
    }
}

impl std::fmt::Display for Moneyline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::fmt::Display for OverUnder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::fmt::Display for Btts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ─── On-chain result codes ───────────────────────────────────────────────────

/// `MoneylineResult` as encoded by the Oddyssey contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MoneylineCode {
    NotSet = 0,
    HomeWin = 1,
    Draw = 2,
    AwayWin = 3,
}

/// `OverUnderResult` as encoded by the Oddyssey contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OverUnderCode {
    NotSet = 0,
    Over = 1,
    Under = 2,
}

impl MoneylineCode {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => MoneylineCode::HomeWin,
            2 => MoneylineCode::Draw,
            3 => MoneylineCode::AwayWin,
            _ => MoneylineCode::NotSet,
        }
    }
}

impl OverUnderCode {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => OverUnderCode::Over,
            2 => OverUnderCode::Under,
            _ => OverUnderCode::NotSet,
        }
    }
}

/// Convert a stored 1X2 string to its contract code.
///
/// Only canonical strings map to a set code; anything else (including the
/// legacy short forms and `None`) is `NotSet` and means "result not available".
pub fn moneyline_code(raw: Option<&str>) -> MoneylineCode {
    raw.and_then(|s| s.parse::<Moneyline>().ok())
        .map(|m| m.code())
        .unwrap_or(MoneylineCode::NotSet)
}

/// Convert a stored O/U string to its contract code. See [`moneyline_code`].
pub fn over_under_code(raw: Option<&str>) -> OverUnderCode {
    raw.and_then(|s| s.parse::<OverUnder>().ok())
        .map(|o| o.code())
        .unwrap_or(OverUnderCode::NotSet)
}

/// One match's entry in the `resolveDailyCycle` argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchResultCodes {
    pub moneyline: MoneylineCode,
    pub over_under: OverUnderCode,
}

impl MatchResultCodes {
    pub fn is_complete(&self) -> bool {
        self.moneyline != MoneylineCode::NotSet && self.over_under != OverUnderCode::NotSet
    }
}

/// Count the matches with at least one `NotSet` field.
pub fn incomplete_count(results: &[MatchResultCodes]) -> usize {
    results.iter().filter(|r| !r.is_complete()).count()
}

// ─── Predictions ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BetType {
    Moneyline,
    OverUnder,
}

impl BetType {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(BetType::Moneyline),
            1 => Ok(BetType::OverUnder),
            other => Err(KeeperError::Validation(format!("unknown bet type code {}", other))),
        }
    }

    pub fn code(&self) -> u8 {
        match self {
            BetType::Moneyline => 0,
            BetType::OverUnder => 1,
        }
    }
}

/// A slip selection. The contract stores selections as
/// `keccak256(bytes(label))` with labels `1`, `X`, `2`, `Over`, `Under`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Selection {
    Home,
    Draw,
    Away,
    Over,
    Under,
}

impl Selection {
    pub const ALL: [Selection; 5] = [
        Selection::Home,
        Selection::Draw,
        Selection::Away,
        Selection::Over,
        Selection::Under,
    ];

    /// The label hashed by the contract.
    pub fn contract_label(&self) -> &'static str {
        match self {
            Selection::Home => "1",
            Selection::Draw => "X",
            Selection::Away => "2",
            Selection::Over => "Over",
            Selection::Under => "Under",
        }
    }

    pub fn bet_type(&self) -> BetType {
        match self {
            Selection::Home | Selection::Draw | Selection::Away => BetType::Moneyline,
            Selection::Over | Selection::Under => BetType::OverUnder,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Selection::Home => "Home",
            Selection::Draw => "Draw",
            Selection::Away => "Away",
            Selection::Over => "Over",
            Selection::Under => "Under",
        }
    }

    /// Whether this selection won given the match's canonical results.
    pub fn is_correct(&self, moneyline: Moneyline, over_under: OverUnder) -> bool {
        match self {
            Selection::Home => moneyline == Moneyline::Home,
            Selection::Draw => moneyline == Moneyline::Draw,
            Selection::Away => moneyline == Moneyline::Away,
            Selection::Over => over_under == OverUnder::Over,
            Selection::Under => over_under == OverUnder::Under,
        }
    }
}

// ─── Contract state enums ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OracleType {
    Guided,
    Open,
}

impl OracleType {
    pub fn from_u8(v: u8) -> Result<Self> {
        match v {
            0 => Ok(OracleType::Guided),
            1 => Ok(OracleType::Open),
            other => Err(KeeperError::Validation(format!("unknown oracle type {}", other))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OracleType::Guided => "guided",
            OracleType::Open => "open",
        }
    }
}

impl FromStr for OracleType {
    type Err = KeeperError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "guided" => Ok(OracleType::Guided),
            "open" => Ok(OracleType::Open),
            other => Err(KeeperError::Validation(format!("unknown oracle type {:?}", other))),
        }
    }
}

/// Cycle state as reported by the Oddyssey contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CycleState {
    NotStarted,
    Active,
    Ended,
    Resolved,
}

impl CycleState {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => CycleState::Active,
            2 => CycleState::Ended,
            3 => CycleState::Resolved,
            _ => CycleState::NotStarted,
        }
    }
}

impl std::fmt::Display for CycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CycleState::NotStarted => write!(f, "NOT_STARTED"),
            CycleState::Active => write!(f, "ACTIVE"),
            CycleState::Ended => write!(f, "ENDED"),
            CycleState::Resolved => write!(f, "RESOLVED"),
        }
    }
}

/// Validate the three outcome columns of a fixture result row.
///
/// Mirrors the `oracle.validate_fixture_result_format` trigger so the
/// in-memory store and the Postgres store reject the same writes.
pub fn validate_result_strings(
    outcome_1x2: Option<&str>,
    outcome_ou25: Option<&str>,
    outcome_btts: Option<&str>,
) -> Result<()> {
    if let Some(s) = outcome_1x2 {
        s.parse::<Moneyline>()?;
    }
    if let Some(s) = outcome_ou25 {
        s.parse::<OverUnder>()?;
    }
    if let Some(s) = outcome_btts {
        s.parse::<Btts>()?;
    }
    Ok(())
}
