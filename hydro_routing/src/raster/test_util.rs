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
use gdal::raster::{Buffer, GdalDataType};
use gdal::spatial_ref::SpatialRef;
use gdal::Dataset;
use uuid::Uuid;

use crate::raster::{open_for_update, RasterInfo};

pub fn temp_raster_path(file_name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{}_{}", Uuid::new_v4(), file_name))
}

/// A template positioned over Geneva, the way the production rasters are.
pub fn test_raster_info(
    num_cols: usize,
    num_rows: usize,
    gdal_type: GdalDataType,
    no_data_value: f64,
) -> RasterInfo {
    RasterInfo {
        num_cols,
        num_rows,
        no_data_value,
        gdal_type,
        geo_transform: [6.021557, 0.004, 0.0, 46.242485, 0.0, -0.005],
        projection: SpatialRef::from_epsg(4326)
            .and_then(|srs| srs.to_wkt())
            .unwrap_or_default(),
    }
}

/// Creates a raster under the system temp dir holding the literal pixel
/// values of `data`, row major.
pub fn create_test_raster(file_name: &str, info: &RasterInfo, data: &[f64]) -> Result<PathBuf> {
    let path = temp_raster_path(file_name);
    create_test_raster_with_path(&path, info, data)?;
    Ok(path)
}

pub fn create_test_raster_with_path(path: &Path, info: &RasterInfo, data: &[f64]) -> Result<()> {
    assert!(!path.exists());
    assert_eq!(data.len(), info.num_cols * info.num_rows);

    info.create_raster(path, info.gdal_type, info.no_data_value, None)?;

    let dataset = open_for_update(path)?;
    let mut band = dataset.rasterband(1)?;
    band.write(
        (0, 0),
        (info.num_cols, info.num_rows),
        &Buffer::new((info.num_cols, info.num_rows), data.to_vec()),
    )?;
    Ok(())
}

/// Reads a whole band as f64, row major.
pub fn read_band_f64(path: &Path, band_index: isize) -> Result<Vec<f64>> {
    let dataset = Dataset::open(path)?;
    let band = dataset.rasterband(band_index)?;
    let (num_cols, num_rows) = dataset.raster_size();
    let buffer = band.read_as::<f64>((0, 0), (num_cols, num_rows), (num_cols, num_rows), None)?;
    Ok(buffer.data)
}
