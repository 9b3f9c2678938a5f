//! Grid producers
//!
//! The perception pipeline is not wired in yet; [`RandomGridProducer`] emits
//! plausible placeholder frames so the rest of the chain can be exercised.

use crate::domain::grid::{empty_grid, Grid, GridLayout, DIY_COLS, DIY_ROWS, LEVEL_OFF};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Cells in one zoom glyph (3 rows x 2 cols)
pub const GLYPH_CELLS: usize = 6;
const GLYPH_COLS: usize = 2;
const RIGHT_GLYPH_COL: usize = 3;

/// Source of one grid per tick
pub trait GridProducer: Send {
    fn produce_map(&mut self) -> Grid;
    fn produce_zoom(&mut self) -> Grid;
}

/// Two glyphs shown side by side in zoom mode, row-major 3x2 each
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ZoomContent {
    pub left: [u8; GLYPH_CELLS],
    pub right: [u8; GLYPH_CELLS],
}

pub struct RandomGridProducer {
    layout: GridLayout,
    zoom: ZoomContent,
    rng: StdRng,
}

impl RandomGridProducer {
    pub fn new(layout: GridLayout) -> Self {
        Self::with_rng(layout, StdRng::from_os_rng())
    }

    pub fn seeded(layout: GridLayout, seed: u64) -> Self {
        Self::with_rng(layout, StdRng::seed_from_u64(seed))
    }

    fn with_rng(layout: GridLayout, rng: StdRng) -> Self {
        Self {
            layout,
            zoom: ZoomContent::default(),
            rng,
        }
    }

    pub fn set_zoom_content(&mut self, content: ZoomContent) {
        self.zoom = content;
    }
}

impl GridProducer for RandomGridProducer {
    fn produce_map(&mut self) -> Grid {
        let mut grid = empty_grid(self.layout.len);
        for (i, level) in grid.iter_mut().enumerate() {
            let raised = self.rng.random_bool(0.25);
            *level = match (raised, self.layout.is_diy_pin(i)) {
                (false, _) => 0,
                (true, false) => 1,
                (true, true) => {
                    if self.rng.random_bool(0.5) {
                        1
                    } else {
                        2
                    }
                }
            };
        }
        grid[self.layout.self_index] = LEVEL_OFF;
        grid
    }

    fn produce_zoom(&mut self) -> Grid {
        let mut grid = empty_grid(self.layout.len);
        let base = self.layout.diy_start();
        for row in 0..DIY_ROWS {
            for col in 0..GLYPH_COLS {
                let cell = row * GLYPH_COLS + col;
                let left = base + row * DIY_COLS + col;
                let right = base + row * DIY_COLS + RIGHT_GLYPH_COL + col;
                if right < grid.len() {
                    grid[left] = self.zoom.left[cell];
                    grid[right] = self.zoom.right[cell];
                }
            }
        }
        grid
    }
}
