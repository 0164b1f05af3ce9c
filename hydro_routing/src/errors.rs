/*
This file is part of the Hydrological Routing Tool
Copyright (C) 2022 Novel-T

The Hydrological Routing Tool is free software: you can redistribute it and/or modify
it under the terms of the GNU General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU General Public License for more details.

You should have received a copy of the GNU General Public License
along with this program.  If not, see <http://www.gnu.org/licenses/>.
*/
use std::path::PathBuf;

use thiserror::Error;

/// Failures the routing core raises itself.  GDAL failures are propagated
/// unchanged through `anyhow`.
#[derive(Clone, PartialEq, Debug, Error)]
pub enum RoutingError {
    #[error("invalid raster argument: {0}")]
    InvalidArgument(String),

    #[error(
        "block size {block_x}x{block_y} of {path:?} is not a power of two in both dimensions"
    )]
    BadBlockGeometry {
        block_x: usize,
        block_y: usize,
        path: PathBuf,
    },

    #[error("the depression seeded at ({x}, {y}) has no pour point; the raster cannot drain")]
    UndrainedRaster { x: i32, y: i32 },
}
