//! Option masks and the prediction/filter step.
//!
//! Every item can be played with any combination of the toggleable
//! [`GameOption`]s. A request may pin some options on (`+HR`) and some off
//! (`-DT`); [`predict_item`] asks the model about every combination that
//! honours those pins.

use std::fmt;

use thiserror::Error;
use tracing::warn;

use crate::models::Prediction;
use crate::traits::{Item, Model};

/// A toggleable option that changes an item's difficulty and score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GameOption {
    DoubleTime,
    Hidden,
    HardRock,
}

impl GameOption {
    /// All options, in display order.
    pub const ALL: [GameOption; 3] = [
        GameOption::DoubleTime,
        GameOption::Hidden,
        GameOption::HardRock,
    ];

    /// Two-letter code used in chat (`DT`, `HD`, `HR`).
    pub fn code(self) -> &'static str {
        match self {
            GameOption::DoubleTime => "DT",
            GameOption::Hidden => "HD",
            GameOption::HardRock => "HR",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        GameOption::ALL
            .into_iter()
            .find(|o| o.code().eq_ignore_ascii_case(code))
    }

    fn bit(self) -> u8 {
        match self {
            GameOption::DoubleTime => 0b001,
            GameOption::Hidden => 0b010,
            GameOption::HardRock => 0b100,
        }
    }
}

/// A boolean assignment over every [`GameOption`]. Also used to describe a
/// set of options (the pinned-on or pinned-off set of a request).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct OptionMask(u8);

impl OptionMask {
    pub const NONE: OptionMask = OptionMask(0);

    pub fn of(options: &[GameOption]) -> Self {
        options.iter().fold(Self::NONE, |mask, o| mask.with(*o))
    }

    pub fn with(self, option: GameOption) -> Self {
        OptionMask(self.0 | option.bit())
    }

    pub fn contains(self, option: GameOption) -> bool {
        self.0 & option.bit() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn is_superset_of(self, other: OptionMask) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_disjoint(self, other: OptionMask) -> bool {
        self.0 & other.0 == 0
    }

    pub fn intersection(self, other: OptionMask) -> OptionMask {
        OptionMask(self.0 & other.0)
    }

    pub fn options(self) -> impl Iterator<Item = GameOption> {
        GameOption::ALL.into_iter().filter(move |o| self.contains(*o))
    }

    /// Every assignment over [`GameOption::ALL`], starting with no options.
    pub fn power_set() -> impl Iterator<Item = OptionMask> {
        (0..(1u8 << GameOption::ALL.len())).map(OptionMask)
    }
}

impl fmt::Display for OptionMask {
    /// Concatenated codes, e.g. `DTHD`. Empty for no options.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for option in self.options() {
            f.write_str(option.code())?;
        }
        Ok(())
    }
}

/// Every mask that includes all of `with` and none of `without`.
pub fn consistent_masks(with: OptionMask, without: OptionMask) -> Vec<OptionMask> {
    OptionMask::power_set()
        .filter(|mask| mask.is_superset_of(with) && mask.is_disjoint(without))
        .collect()
}

/// Ask `model` about `item` under every mask consistent with the pins.
///
/// A model failure (typically an item outside the model's domain) is logged
/// and produces an empty result so that callers iterating over many
/// candidates simply move on.
pub fn predict_item(
    model: &dyn Model,
    item: &dyn Item,
    with: OptionMask,
    without: OptionMask,
) -> Vec<(OptionMask, Prediction)> {
    let masks = consistent_masks(with, without);
    let mut out = Vec::with_capacity(masks.len());
    for mask in masks {
        match model.predict(item, mask) {
            Ok(prediction) => out.push((mask, prediction)),
            Err(e) => {
                warn!(
                    item = item.id(),
                    options = %mask,
                    error = %e,
                    "prediction failed, skipping item"
                );
                return Vec::new();
            }
        }
    }
    out
}

// ============ Modifier parsing ============

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModifierError {
    #[error("failed to parse modifiers from {token:?}: unknown option {code:?}")]
    UnknownOption { token: String, code: String },
    #[error("failed to parse modifiers from {0:?}: expected option codes like HD, HR or DT")]
    Malformed(String),
    #[error("{0} cannot be both required and excluded")]
    Conflict(String),
}

/// Parse `+CODES` / `-CODES` / `CODES` tokens into (pinned-on, pinned-off).
///
/// Codes are case-insensitive and may be concatenated (`+hdhr`). `NM`
/// (no mod) is accepted and pins nothing.
pub fn parse_modifiers(args: &str) -> Result<(OptionMask, OptionMask), ModifierError> {
    let mut with = OptionMask::NONE;
    let mut without = OptionMask::NONE;

    for token in args.split_whitespace() {
        let (body, exclude) = match token.as_bytes()[0] {
            b'+' => (&token[1..], false),
            b'-' => (&token[1..], true),
            _ => (token, false),
        };

        let mask = parse_codes(token, body)?;
        if exclude {
            without = OptionMask(without.0 | mask.0);
        } else {
            with = OptionMask(with.0 | mask.0);
        }
    }

    let conflict = with.intersection(without);
    if !conflict.is_empty() {
        return Err(ModifierError::Conflict(conflict.to_string()));
    }

    Ok((with, without))
}

fn parse_codes(token: &str, body: &str) -> Result<OptionMask, ModifierError> {
    if body.is_empty() || !body.is_ascii() || body.len() % 2 != 0 {
        return Err(ModifierError::Malformed(token.to_string()));
    }

    let mut mask = OptionMask::NONE;
    for i in (0..body.len()).step_by(2) {
        let code = &body[i..i + 2];
        if code.eq_ignore_ascii_case("NM") {
            continue;
        }
        match GameOption::from_code(code) {
            Some(option) => mask = mask.with(option),
            None => {
                return Err(ModifierError::UnknownOption {
                    token: token.to_string(),
                    code: code.to_string(),
                })
            }
        }
    }
    Ok(mask)
}
