//! Blue/green weight split.

use serde::{Deserialize, Serialize};

use crate::error::{RoutingError, RoutingResult};

/// Share of listener traffic sent to each color, in percent.
///
/// The fields are private so a split can only be built through the
/// constructors below, all of which keep `blue + green == 100`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawSplit", into = "RawSplit")]
pub struct WeightSplit {
    blue: u8,
    green: u8,
}

#[derive(Serialize, Deserialize)]
struct RawSplit {
    blue: u8,
    green: u8,
}

impl TryFrom<RawSplit> for WeightSplit {
    type Error = RoutingError;

    fn try_from(raw: RawSplit) -> RoutingResult<Self> {
        WeightSplit::new(raw.blue, raw.green)
    }
}

impl From<WeightSplit> for RawSplit {
    fn from(split: WeightSplit) -> Self {
        RawSplit {
            blue: split.blue,
            green: split.green,
        }
    }
}

impl WeightSplit {
    /// Validate an explicit split.
    pub fn new(blue: u8, green: u8) -> RoutingResult<Self> {
        if blue as u16 + green as u16 != 100 {
            return Err(RoutingError::InvalidSplit { blue, green });
        }
        Ok(Self { blue, green })
    }

    /// Everything on blue.
    pub fn all_blue() -> Self {
        Self { blue: 100, green: 0 }
    }

    /// Everything on green.
    pub fn all_green() -> Self {
        Self { blue: 0, green: 100 }
    }

    /// `green` percent on green, clamped to 100, the rest on blue.
    pub fn with_green(green: u32) -> Self {
        let green = green.min(100) as u8;
        Self {
            blue: 100 - green,
            green,
        }
    }

    pub fn blue(&self) -> u8 {
        self.blue
    }

    pub fn green(&self) -> u8 {
        self.green
    }

    /// Move `step` percent from blue to green, clamping at 100.
    pub fn shifted(&self, step: u32) -> Self {
        Self::with_green(self.green as u32 + step)
    }
}

impl Default for WeightSplit {
    fn default() -> Self {
        Self::all_blue()
    }
}
