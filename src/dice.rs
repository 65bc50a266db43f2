//! Dice expressions (`2d6+3`, `d20`, `4`) and rolling.

use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest number of dice in one expression.
pub const MAX_COUNT: u32 = 100;
/// Largest die size.
pub const MAX_SIDES: u32 = 1000;
/// Largest flat modifier, either sign.
pub const MAX_BONUS: i32 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("bad dice expression {0:?}")]
pub struct DiceParseError(pub String);

/// `count`d`sides` + `bonus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DiceExpr {
    pub count: u32,
    pub sides: u32,
    pub bonus: i32,
}

impl DiceExpr {
    /// Values past the limits are clamped to them.
    pub fn new(count: u32, sides: u32, bonus: i32) -> Self {
        Self {
            count: count.min(MAX_COUNT),
            sides: sides.min(MAX_SIDES),
            bonus: bonus.clamp(-MAX_BONUS, MAX_BONUS),
        }
    }

    pub fn d20() -> Self {
        Self::new(1, 20, 0)
    }

    pub fn roll<R: Rng + ?Sized>(&self, rng: &mut R) -> i32 {
        self.roll_dice(rng, self.count)
    }

    /// Roll with every die doubled, as on a critical hit.
    pub fn roll_critical<R: Rng + ?Sized>(&self, rng: &mut R) -> i32 {
        self.roll_dice(rng, self.count.saturating_mul(2))
    }

    fn roll_dice<R: Rng + ?Sized>(&self, rng: &mut R, count: u32) -> i32 {
        let sides = self.sides.min(MAX_SIDES);
        let mut total = self.bonus;
        if sides > 0 {
            for _ in 0..count.min(MAX_COUNT * 2) {
                total = total.saturating_add(rng.gen_range(1..=sides) as i32);
            }
        }
        total
    }
}

impl FromStr for DiceExpr {
    type Err = DiceParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || DiceParseError(s.to_string());
        let text: String = s.chars().filter(|c| !c.is_whitespace()).collect();
        let text = text.to_ascii_lowercase();
        if text.is_empty() {
            return Err(bad());
        }

        let (dice, bonus) = match text.rfind(|c: char| c == '+' || c == '-') {
            Some(i) if i > 0 => {
                let bonus: i32 = text[i..]
                    .trim_start_matches('+')
                    .parse()
                    .map_err(|_| bad())?;
                (&text[..i], bonus)
            }
            _ => (text.as_str(), 0),
        };

        match dice.split_once('d') {
            Some((count, sides)) => {
                let count = if count.is_empty() {
                    1
                } else {
                    count.parse().map_err(|_| bad())?
                };
                let sides = sides.parse().map_err(|_| bad())?;
                if count > MAX_COUNT || sides > MAX_SIDES || bonus.unsigned_abs() > MAX_BONUS as u32 {
                    return Err(bad());
                }
                Ok(Self::new(count, sides, bonus))
            }
            None => {
                let flat: i32 = dice.parse().map_err(|_| bad())?;
                let flat = flat.checked_add(bonus).ok_or_else(bad)?;
                if flat.unsigned_abs() > MAX_BONUS as u32 {
                    return Err(bad());
                }
                Ok(Self::new(0, 0, flat))
            }
        }
    }
}

impl TryFrom<String> for DiceExpr {
    type Error = DiceParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<DiceExpr> for String {
    fn from(value: DiceExpr) -> Self {
        value.to_string()
    }
}

impl fmt::Display for DiceExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.count == 0 || self.sides == 0 {
            return write!(f, "{}", self.bonus);
        }
        write!(f, "{}d{}", self.count, self.sides)?;
        match self.bonus {
            0 => Ok(()),
            b if b > 0 => write!(f, "+{b}"),
            b => write!(f, "{b}"),
        }
    }
}
