//! Pin grid layouts
//!
//! A grid is a flat, row-major array of pin levels. Levels are 0 (flat),
//! 1 (mid) and 2 (high). Pins outside the DIY zone are binary-only.

use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Pin levels for one frame
pub type Grid = Vec<u8>;

pub const LEVEL_OFF: u8 = 0;
pub const LEVEL_MID: u8 = 1;
pub const LEVEL_HIGH: u8 = 2;

/// Rows and columns of the ternary DIY block (also the whole compact layout)
pub const DIY_ROWS: usize = 3;
pub const DIY_COLS: usize = 5;

/// Position of the wearer inside the DIY block
pub const SELF_ROW: usize = 1;
pub const SELF_COL: usize = 2;

/// Number of binary braille pins in front of the DIY block
pub const BRAILLE_PINS: usize = 90;

/// Known physical layouts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayoutPreset {
    /// 3x5 ternary grid
    Compact15,
    /// 90 braille pins followed by a 3x5 ternary DIY block
    Braille105,
}

impl Default for LayoutPreset {
    fn default() -> Self {
        Self::Compact15
    }
}

/// Geometry of the pin array the device exposes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridLayout {
    /// Number of pins (N)
    pub len: usize,
    /// Pin that represents the wearer; always transmitted as 0
    pub self_index: usize,
    /// Pins allowed to use all three levels
    pub diy_zone: Range<usize>,
}

impl GridLayout {
    pub fn from_preset(preset: LayoutPreset) -> Self {
        match preset {
            LayoutPreset::Compact15 => Self::compact15(),
            LayoutPreset::Braille105 => Self::braille105(),
        }
    }

    pub fn compact15() -> Self {
        let len = DIY_ROWS * DIY_COLS;
        Self {
            len,
            self_index: SELF_ROW * DIY_COLS + SELF_COL,
            diy_zone: 0..len,
        }
    }

    pub fn braille105() -> Self {
        let diy_start = BRAILLE_PINS;
        let len = diy_start + DIY_ROWS * DIY_COLS;
        Self {
            len,
            self_index: diy_start + SELF_ROW * DIY_COLS + SELF_COL,
            diy_zone: diy_start..len,
        }
    }

    /// Whether the pin may take the high level
    pub fn is_diy_pin(&self, index: usize) -> bool {
        self.diy_zone.contains(&index)
    }

    /// Index of the first DIY pin, used to place zoom glyphs
    pub fn diy_start(&self) -> usize {
        self.diy_zone.start
    }

    /// Clamp a producer grid into something the device can render.
    ///
    /// Binary pins are capped at 1, every pin at 2, and the self pin is
    /// forced to 0. The caller validates the length beforehand.
    pub fn sanitize(&self, grid: &[u8]) -> Grid {
        grid.iter()
            .enumerate()
            .map(|(i, &level)| {
                if i == self.self_index {
                    LEVEL_OFF
                } else if self.is_diy_pin(i) {
                    level.min(LEVEL_HIGH)
                } else {
                    level.min(LEVEL_MID)
                }
            })
            .collect()
    }
}

impl Default for GridLayout {
    fn default() -> Self {
        Self::compact15()
    }
}

/// All-zero grid of the given length
pub fn empty_grid(len: usize) -> Grid {
    vec![LEVEL_OFF; len]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compact_layout_geometry() {
        let layout = GridLayout::compact15();
        assert_eq!(layout.len, 15);
        assert_eq!(layout.self_index, 7);
        assert!((0..15).all(|i| layout.is_diy_pin(i)));
    }

    #[test]
    fn test_braille_layout_geometry() {
        let layout = GridLayout::braille105();
        assert_eq!(layout.len, 105);
        assert_eq!(layout.self_index, 97);
        assert!(!layout.is_diy_pin(89));
        assert!(layout.is_diy_pin(90));
        assert!(layout.is_diy_pin(104));
    }

    #[test]
    fn test_sanitize_clamps_binary_pins() {
        let layout = GridLayout::braille105();
        let mut grid = vec![2u8; 105];
        grid[0] = 1;
        let clean = layout.sanitize(&grid);
        assert!(clean[..90].iter().all(|&l| l == 1));
        assert_eq!(clean[90], 2);
        assert_eq!(clean[97], 0);
    }

    #[test]
    fn test_sanitize_forces_self_pin_off() {
        let layout = GridLayout::compact15();
        let grid = vec![2u8; 15];
        let clean = layout.sanitize(&grid);
        assert_eq!(clean[7], 0);
        assert_eq!(clean.iter().filter(|&&l| l == 2).count(), 14);
    }

    #[test]
    fn test_sanitize_caps_out_of_range_levels() {
        let layout = GridLayout::compact15();
        let mut grid = empty_grid(15);
        grid[0] = 9;
        assert_eq!(layout.sanitize(&grid)[0], 2);
    }
}
