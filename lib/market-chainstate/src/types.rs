use std::{fmt, str::FromStr};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Block number as reported by the marketplace chain.
pub type BlockNumber = u64;

/// Token amounts, as specified by the marketplace contract.
pub type Currency = u128;

/// Proof period index, as computed by the [`ProofOracle`](crate::period::ProofOracle).
pub type PeriodNumber = u64;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum HexBytesError {
    #[error("expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error(transparent)]
    Hex(#[from] hex::FromHexError),
}

/// Fixed-size byte identifiers that travel as `0x`-prefixed hex strings.
macro_rules! hex_bytes_newtype {
    ($(#[$meta:meta])* $name:ident, $len:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub [u8; $len]);

        impl From<[u8; $len]> for $name {
            fn from(value: [u8; $len]) -> Self {
                Self(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "0x{}", hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_tuple(stringify!($name))
                    .field(&format_args!("{}", self))
                    .finish()
            }
        }

        impl FromStr for $name {
            type Err = HexBytesError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let s = s.strip_prefix("0x").unwrap_or(s);
                if s.len() != $len * 2 {
                    return Err(HexBytesError::InvalidLength {
                        expected: $len,
                        actual: s.len() / 2,
                    });
                }
                let mut bytes = [0u8; $len];
                hex::decode_to_slice(s, &mut bytes)?;
                Ok(Self(bytes))
            }
        }

        impl Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

hex_bytes_newtype!(
    /// Unique identifier of a storage request, the keccak hash the contract derives from it.
    RequestId,
    32
);

hex_bytes_newtype!(
    /// Account address of a client or host.
    Address,
    20
);

/// The terms a client asks for when requesting storage.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ask {
    /// Number of slots the dataset is split into.
    pub slots: u64,
    /// Size of each slot, in bytes.
    pub slot_size: u64,
    /// How long the storage lasts once the request starts, in seconds.
    pub duration: u64,
    /// Average number of periods between two required proofs.
    pub proof_probability: u64,
    /// Reward paid to hosts, per byte per second.
    #[serde(with = "currency")]
    pub price_per_byte_per_second: Currency,
    /// Collateral a host must put down, per byte.
    #[serde(with = "currency")]
    pub collateral_per_byte: Currency,
    /// Number of slots that may be lost before the request fails.
    pub max_slot_loss: u64,
}

impl Ask {
    /// Total duration of the storage, saturating at [`TimeDelta::MAX`].
    pub fn storage_duration(&self) -> TimeDelta {
        i64::try_from(self.duration)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .unwrap_or(TimeDelta::MAX)
    }
}

/// A storage request as published on-chain. Never changes after creation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageRequest {
    pub id: RequestId,
    pub client: Address,
    pub ask: Ask,
    /// Content identifier of the dataset being stored.
    pub content_cid: String,
    /// Moment after which the request can no longer be started.
    pub expiry: DateTime<Utc>,
}

/// [`Currency`] amounts travel as decimal strings, JSON numbers cannot hold every `u128`.
///
/// Plain integers are accepted as well when they fit in a `u64`.
mod currency {
    use std::fmt;

    use serde::{de, Deserializer, Serializer};

    use super::Currency;

    pub fn serialize<S>(amount: &Currency, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(amount)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Currency, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct CurrencyVisitor;

        impl<'de> de::Visitor<'de> for CurrencyVisitor {
            type Value = Currency;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a decimal token amount")
            }

            fn visit_u64<E>(self, value: u64) -> Result<Currency, E>
            where
                E: de::Error,
            {
                Ok(Currency::from(value))
            }

            fn visit_str<E>(self, value: &str) -> Result<Currency, E>
            where
                E: de::Error,
            {
                value.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_any(CurrencyVisitor)
    }
}

/// Lifecycle of a [`StorageRequest`].
///
/// Transitions only move forward: `New -> Started -> Finished`, `New -> Cancelled`,
/// or `New | Started -> Failed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    /// Published, waiting for hosts to fill its slots.
    New,
    /// All slots were filled and the storage contract is running.
    Started,
    /// The storage duration elapsed while running.
    Finished,
    /// The request expired before starting.
    Cancelled,
    /// Too many slots were lost while running.
    Failed,
}

impl RequestState {
    pub fn can_transition_to(self, next: RequestState) -> bool {
        use RequestState::*;
        matches!(
            (self, next),
            (New, Started) | (New, Cancelled) | (New, Failed) | (Started, Finished) | (Started, Failed)
        )
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestState::New => "new",
            RequestState::Started => "started",
            RequestState::Finished => "finished",
            RequestState::Cancelled => "cancelled",
            RequestState::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RangeError {
    #[error("block interval is inverted: {from} > {to}")]
    InvertedBlocks { from: BlockNumber, to: BlockNumber },

    #[error("time range is inverted: {from} > {to}")]
    InvertedTimes { from: DateTime<Utc>, to: DateTime<Utc> },
}

/// Closed interval of block numbers, `from..=to`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct BlockInterval {
    from: BlockNumber,
    to: BlockNumber,
}

impl BlockInterval {
    pub fn new(from: BlockNumber, to: BlockNumber) -> Result<Self, RangeError> {
        if from > to {
            return Err(RangeError::InvertedBlocks { from, to });
        }
        Ok(Self { from, to })
    }

    pub fn from(&self) -> BlockNumber {
        self.from
    }

    pub fn to(&self) -> BlockNumber {
        self.to
    }

    pub fn number_of_blocks(&self) -> u64 {
        // PRE-COND: from <= to, so this never underflows
        self.to - self.from + 1
    }

    pub fn contains(&self, block: BlockNumber) -> bool {
        (self.from..=self.to).contains(&block)
    }
}

impl fmt::Display for BlockInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}..={}]", self.from, self.to)
    }
}

/// Closed range of wall-clock time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct TimeRange {
    from: DateTime<Utc>,
    to: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Self, RangeError> {
        if from > to {
            return Err(RangeError::InvertedTimes { from, to });
        }
        Ok(Self { from, to })
    }

    pub fn from(&self) -> DateTime<Utc> {
        self.from
    }

    pub fn to(&self) -> DateTime<Utc> {
        self.to
    }

    pub fn duration(&self) -> TimeDelta {
        self.to - self.from
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} - {}]", self.from, self.to)
    }
}
