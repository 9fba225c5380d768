use alloy::primitives::U256;
use std::{
    cmp::Ordering,
    fmt,
};

/// Largest precision any supported currency uses. `10^77` is the biggest power of ten a
/// `U256` can hold, so anything above that is rejected before it can overflow.
const MAX_DECIMALS: u8 = 77;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AmountError {
    Empty,
    Malformed(String),
    TooManyFractionalDigits { decimals: u8, input: String },
    Overflow(String),
    UnsupportedPrecision(u8),
}

impl fmt::Display for AmountError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "amount is empty"),
            Self::Malformed(input) => write!(f, "'{input}' is not a decimal amount"),
            Self::TooManyFractionalDigits { decimals, input } => write!(
                f,
                "'{input}' has more than {decimals} fractional digits"
            ),
            Self::Overflow(input) => write!(f, "'{input}' does not fit in 256 bits"),
            Self::UnsupportedPrecision(decimals) => {
                write!(f, "precision of {decimals} decimals is not supported")
            }
        }
    }
}

impl std::error::Error for AmountError {}

/// A raw on-chain integer together with the fixed-point precision of the currency it
/// belongs to. Amounts of different precision never compare or combine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TokenAmount {
    raw: U256,
    decimals: u8,
}

impl TokenAmount {
    pub fn from_raw(raw: U256, decimals: u8) -> Self {
        Self { raw, decimals }
    }

    pub fn zero(decimals: u8) -> Self {
        Self::from_raw(U256::ZERO, decimals)
    }

    /// Parse a human decimal string ("12", "0.5", ".25") into raw units.
    pub fn parse(input: &str, decimals: u8) -> Result<Self, AmountError> {
        if decimals > MAX_DECIMALS {
            return Err(AmountError::UnsupportedPrecision(decimals));
        }
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(AmountError::Empty);
        }
        let (whole, fraction) = match trimmed.split_once('.') {
            Some((whole, fraction)) => (whole, fraction),
            None => (trimmed, ""),
        };
        if whole.is_empty() && fraction.is_empty() {
            return Err(AmountError::Malformed(input.to_string()));
        }
        let all_digits = |s: &str| s.chars().all(|c| c.is_ascii_digit());
        if !all_digits(whole) || !all_digits(fraction) {
            return Err(AmountError::Malformed(input.to_string()));
        }
        let fraction = fraction.trim_end_matches('0');
        if fraction.len() > decimals as usize {
            return Err(AmountError::TooManyFractionalDigits {
                decimals,
                input: input.to_string(),
            });
        }

        let scale = pow10(decimals);
        let whole_units = if whole.is_empty() {
            U256::ZERO
        } else {
            U256::from_str_radix(whole, 10)
                .map_err(|_| AmountError::Overflow(input.to_string()))?
        };
        let fraction_units = if fraction.is_empty() {
            U256::ZERO
        } else {
            let padded = format!("{fraction:0<width$}", width = decimals as usize);
            U256::from_str_radix(&padded, 10)
                .map_err(|_| AmountError::Overflow(input.to_string()))?
        };
        let raw = whole_units
            .checked_mul(scale)
            .and_then(|units| units.checked_add(fraction_units))
            .ok_or_else(|| AmountError::Overflow(input.to_string()))?;
        Ok(Self { raw, decimals })
    }

    pub fn raw(&self) -> U256 {
        self.raw
    }

    pub fn decimals(&self) -> u8 {
        self.decimals
    }

    pub fn is_zero(&self) -> bool {
        self.raw.is_zero()
    }

    /// `None` when the two amounts carry different precisions.
    pub fn checked_sub(&self, other: &Self) -> Option<Self> {
        if self.decimals != other.decimals {
            return None;
        }
        self.raw
            .checked_sub(other.raw)
            .map(|raw| Self::from_raw(raw, self.decimals))
    }
}

impl PartialOrd for TokenAmount {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if self.decimals != other.decimals {
            return None;
        }
        Some(self.raw.cmp(&other.raw))
    }
}

impl fmt::Display for TokenAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let digits = self.raw.to_string();
        let decimals = self.decimals as usize;
        if decimals == 0 {
            return write!(f, "{digits}");
        }
        let padded = format!("{digits:0>width$}", width = decimals + 1);
        let (whole, fraction) = padded.split_at(padded.len() - decimals);
        let fraction = fraction.trim_end_matches('0');
        if fraction.is_empty() {
            write!(f, "{whole}")
        } else {
            write!(f, "{whole}.{fraction}")
        }
    }
}

fn pow10(decimals: u8) -> U256 {
    U256::from(10u64).pow(U256::from(decimals))
}
