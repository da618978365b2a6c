//! # pixboard-core: canvas data model
//!
//! The authoritative pixel grid and its cell color type. Nothing here knows
//! about connections or wire formats; `pixboard-sync` layers the protocol on
//! top.
//!
//! - [`color`]: validated RGB colors with a `#RRGGBB` wire form
//! - [`grid`]: [`GridStore`], snapshots and the editable [`Region`]

pub mod color;
pub mod grid;

pub use color::{Color, ColorError};
pub use grid::{Coord, GridError, GridSnapshot, GridStore, Region};
