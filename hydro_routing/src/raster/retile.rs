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
use std::path::{Path, PathBuf};

use anyhow::Result;
use gdal::Dataset;
use log::warn;

use crate::errors::RoutingError;
use crate::raster::{copy_band, BandRef};

/// The flow-direction engines accept any tiling but the managed raster
/// requires power-of-two blocks.  Returns a 256x256-tiled copy of the band
/// under `scratch` when the input needs rewriting, `None` when it is already
/// compatible.
pub fn ensure_power_of_two_blocks(band_ref: BandRef, scratch: &Path) -> Result<Option<PathBuf>> {
    band_ref.validate()?;

    let dataset = Dataset::open(band_ref.path)?;
    if band_ref.band > dataset.raster_count() {
        return Err(RoutingError::InvalidArgument(format!(
            "band index {} out of range, raster has {} band(s)",
            band_ref.band,
            dataset.raster_count()
        ))
        .into());
    }
    let (block_x, block_y) = dataset.rasterband(band_ref.band)?.block_size();
    if block_x.is_power_of_two() && block_y.is_power_of_two() {
        return Ok(None);
    }

    warn!(
        "{:?} has {}x{} blocks, not powers of two; rewriting to a 256x256 tiled copy",
        band_ref.path, block_x, block_y
    );
    let retiled = scratch.join("retiled_dem.tif");
    copy_band(&band_ref, &retiled)?;
    Ok(Some(retiled))
}
