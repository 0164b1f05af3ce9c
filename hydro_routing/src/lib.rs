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

//! Out-of-core hydrological routing over GDAL rasters.
//!
//! A DEM flows through the pipeline as
//! `fill_pits` -> `flow_dir_d8`/`flow_dir_mfd` -> `flow_accumulation_*`,
//! `distance_to_channel_*`, `delineate_watersheds`.  Every algorithm
//! addresses pixels through [`raster::ManagedRaster`], a block-cached view
//! that keeps rasters far larger than memory behind plain `get`/`set`
//! calls, and runs single threaded with bit-exact deterministic output.

pub mod errors;
pub mod raster;
pub mod routing;
pub mod util;
pub mod vector;

pub use crate::errors::RoutingError;
pub use crate::raster::{BandRef, ManagedRaster, RasterMode};
pub use crate::routing::{
    delineate_watersheds, distance_to_channel_d8, distance_to_channel_mfd, fill_pits,
    flow_accumulation_d8, flow_accumulation_mfd, flow_dir_d8, flow_dir_mfd,
};
