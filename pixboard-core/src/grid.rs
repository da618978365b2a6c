//! Authoritative pixel grid.
//!
//! A dense `width × height` array of [`Color`]s stored row-major. There is no
//! empty cell state: every cell starts at the background color and only ever
//! holds a valid color. Writes are last-write-wins with no history; the
//! caller is responsible for serializing access.
//!
//! An optional editable [`Region`] restricts which cells `set` accepts. Reads
//! and snapshots always cover the whole grid so clients can still draw the
//! locked area.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::color::Color;

/// Cell coordinate as carried on the wire. Signed so that negative input
/// reaches bounds checking instead of failing to decode.
pub type Coord = i32;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GridError {
    #[error("cell ({x}, {y}) is outside the {width}x{height} grid")]
    OutOfBounds {
        x: Coord,
        y: Coord,
        width: u32,
        height: u32,
    },
    #[error("cell ({x}, {y}) is outside the editable region")]
    OutsideEditableRegion { x: Coord, y: Coord },
    #[error("editable region {0:?} is empty or does not fit in the grid")]
    InvalidRegion(Region),
    #[error("grid shape mismatch: expected {expected_width}x{expected_height}, got {width}x{height}")]
    DimensionMismatch {
        expected_width: u32,
        expected_height: u32,
        width: u32,
        height: u32,
    },
}

/// Axis-aligned rectangle of cells, `[x, x + width) × [y, y + height)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn contains(&self, x: Coord, y: Coord) -> bool {
        let (x, y) = (x as i64, y as i64);
        x >= self.x as i64
            && y >= self.y as i64
            && x < self.x as i64 + self.width as i64
            && y < self.y as i64 + self.height as i64
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Whether the region lies entirely inside a `width × height` grid.
    pub fn fits_within(&self, width: u32, height: u32) -> bool {
        self.x as u64 + self.width as u64 <= width as u64
            && self.y as u64 + self.height as u64 <= height as u64
    }
}

/// Full copy of a grid, `rows[y][x]`.
///
/// This is the `init` payload shape: `height` rows of `width` colors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GridSnapshot {
    pub rows: Vec<Vec<Color>>,
}

impl GridSnapshot {
    pub fn height(&self) -> u32 {
        self.rows.len() as u32
    }

    /// Width of the first row (0 for an empty snapshot).
    pub fn width(&self) -> u32 {
        self.rows.first().map_or(0, |r| r.len() as u32)
    }

    /// Whether all rows have the same length.
    pub fn is_rectangular(&self) -> bool {
        let w = self.width() as usize;
        self.rows.iter().all(|r| r.len() == w)
    }

    pub fn get(&self, x: Coord, y: Coord) -> Option<Color> {
        if x < 0 || y < 0 {
            return None;
        }
        self.rows.get(y as usize)?.get(x as usize).copied()
    }
}

/// In-memory grid with optional editable region.
#[derive(Debug, Clone)]
pub struct GridStore {
    width: u32,
    height: u32,
    background: Color,
    cells: Vec<Color>,
    editable: Option<Region>,
}

impl GridStore {
    /// Create a grid with every cell set to `background`.
    pub fn new(width: u32, height: u32, background: Color) -> Self {
        Self {
            width,
            height,
            background,
            cells: vec![background; width as usize * height as usize],
            editable: None,
        }
    }

    /// Restrict `set` to `region`. The region must be non-empty and fit.
    pub fn with_editable_region(mut self, region: Region) -> Result<Self, GridError> {
        if region.is_empty() || !region.fits_within(self.width, self.height) {
            return Err(GridError::InvalidRegion(region));
        }
        self.editable = Some(region);
        Ok(self)
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn background(&self) -> Color {
        self.background
    }

    pub fn editable_region(&self) -> Option<Region> {
        self.editable
    }

    pub fn in_bounds(&self, x: Coord, y: Coord) -> bool {
        x >= 0 && y >= 0 && (x as u32) < self.width && (y as u32) < self.height
    }

    /// In bounds and inside the editable region (if any).
    pub fn is_editable(&self, x: Coord, y: Coord) -> bool {
        self.in_bounds(x, y) && self.editable.map_or(true, |r| r.contains(x, y))
    }

    fn index(&self, x: Coord, y: Coord) -> Result<usize, GridError> {
        if !self.in_bounds(x, y) {
            return Err(GridError::OutOfBounds {
                x,
                y,
                width: self.width,
                height: self.height,
            });
        }
        Ok(y as usize * self.width as usize + x as usize)
    }

    pub fn get(&self, x: Coord, y: Coord) -> Result<Color, GridError> {
        let idx = self.index(x, y)?;
        Ok(self.cells[idx])
    }

    /// Write one cell and return the color it replaced.
    ///
    /// Fails without touching the grid if the cell is out of bounds or
    /// outside the editable region.
    pub fn set(&mut self, x: Coord, y: Coord, color: Color) -> Result<Color, GridError> {
        let idx = self.index(x, y)?;
        if let Some(region) = self.editable {
            if !region.contains(x, y) {
                return Err(GridError::OutsideEditableRegion { x, y });
            }
        }
        Ok(std::mem::replace(&mut self.cells[idx], color))
    }

    pub fn snapshot(&self) -> GridSnapshot {
        let rows = if self.width == 0 {
            vec![Vec::new(); self.height as usize]
        } else {
            self.cells
                .chunks(self.width as usize)
                .map(|row| row.to_vec())
                .collect()
        };
        GridSnapshot { rows }
    }

    /// Overwrite every cell from a snapshot of identical shape.
    ///
    /// Used by client mirrors on `init`. The editable region does not apply:
    /// the snapshot includes locked cells.
    pub fn replace(&mut self, snapshot: &GridSnapshot) -> Result<(), GridError> {
        if snapshot.height() != self.height
            || !snapshot.is_rectangular()
            || (self.height > 0 && snapshot.width() != self.width)
        {
            return Err(GridError::DimensionMismatch {
                expected_width: self.width,
                expected_height: self.height,
                width: snapshot.width(),
                height: snapshot.height(),
            });
        }
        for (dst, src) in self
            .cells
            .chunks_mut(self.width.max(1) as usize)
            .zip(&snapshot.rows)
        {
            dst.copy_from_slice(src);
        }
        log::debug!("Grid replaced from {}x{} snapshot", self.width, self.height);
        Ok(())
    }

    /// Number of cells that differ from the background.
    pub fn painted_cells(&self) -> usize {
        self.cells.iter().filter(|c| **c != self.background).count()
    }
}
