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
use std::fmt;
use std::path::Path;

use anyhow::{bail, Result};
use float_cmp::{ApproxEq, F64Margin};
use gdal::raster::{GdalDataType, RasterCreationOption};
use gdal::{Dataset, DatasetOptions, Driver, DriverManager, GdalOpenFlags};
use log::debug;

use crate::errors::RoutingError;
use crate::util::BlockWindowIterator;

mod managed;
mod retile;
pub mod test_util;

pub use managed::*;
pub use retile::*;

/// Creation options for every raster the routing core writes: tiled with
/// power-of-two blocks so pixel addressing reduces to shifts and masks,
/// losslessly compressed, large-file capable.
pub const ROUTING_RASTER_OPTIONS: [RasterCreationOption; 5] = [
    RasterCreationOption {
        key: "TILED",
        value: "YES",
    },
    RasterCreationOption {
        key: "BLOCKXSIZE",
        value: "256",
    },
    RasterCreationOption {
        key: "BLOCKYSIZE",
        value: "256",
    },
    RasterCreationOption {
        key: "COMPRESS",
        value: "LZW",
    },
    RasterCreationOption {
        key: "BIGTIFF",
        value: "IF_SAFER",
    },
];

pub const GTIFF_DRIVER: &str = "GTiff";

/// A `(path, band)` raster argument.  Every public entry point takes its
/// raster inputs in this form and validates them up front.
#[derive(Debug, Clone, Copy)]
pub struct BandRef<'a> {
    pub path: &'a Path,
    pub band: isize,
}

impl<'a> BandRef<'a> {
    pub fn new(path: &'a Path, band: isize) -> Self {
        BandRef { path, band }
    }

    pub fn validate(&self) -> Result<()> {
        if self.band < 1 {
            return Err(RoutingError::InvalidArgument(format!(
                "band index {} for {:?} must be >= 1",
                self.band, self.path
            ))
            .into());
        }
        if !self.path.exists() {
            return Err(RoutingError::InvalidArgument(format!(
                "raster path {:?} does not exist",
                self.path
            ))
            .into());
        }
        Ok(())
    }
}

impl<'a> fmt::Display for BandRef<'a> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?} band {}", self.path, self.band)
    }
}

/// Metadata snapshot of one raster band, and the template new rasters are
/// created from.
#[derive(Debug, Clone)]
pub struct RasterInfo {
    pub num_cols: usize,
    pub num_rows: usize,
    pub no_data_value: f64,
    pub gdal_type: GdalDataType,
    pub geo_transform: [f64; 6],
    pub projection: String,
}

impl RasterInfo {
    pub fn read(band_ref: &BandRef) -> Result<RasterInfo> {
        band_ref.validate()?;
        let dataset = Dataset::open(band_ref.path)?;
        RasterInfo::from_dataset(&dataset, band_ref.band)
    }

    pub fn from_dataset(dataset: &Dataset, band_index: isize) -> Result<RasterInfo> {
        if band_index < 1 || band_index > dataset.raster_count() {
            return Err(RoutingError::InvalidArgument(format!(
                "band index {} out of range, raster has {} band(s)",
                band_index,
                dataset.raster_count()
            ))
            .into());
        }
        let band = dataset.rasterband(band_index)?;

        let (num_cols, num_rows) = dataset.raster_size();
        let geo_transform = dataset
            .geo_transform()
            .unwrap_or([0.0, 1.0, 0.0, 0.0, 0.0, -1.0]);

        Ok(RasterInfo {
            num_cols,
            num_rows,
            no_data_value: band.no_data_value().unwrap_or(f64::MIN),
            gdal_type: band.band_type(),
            geo_transform,
            projection: dataset.projection(),
        })
    }

    pub fn origin_x(&self) -> f64 {
        self.geo_transform[0]
    }

    pub fn origin_y(&self) -> f64 {
        self.geo_transform[3]
    }

    pub fn pixel_width(&self) -> f64 {
        self.geo_transform[1]
    }

    /// Note pixel height is negative for north-up rasters.
    pub fn pixel_height(&self) -> f64 {
        self.geo_transform[5]
    }

    //Converts projected coordinate to raster_x
    pub fn calc_x(&self, x_coord: f64) -> i32 {
        ((x_coord - self.origin_x()) / self.pixel_width()).floor() as i32
    }

    pub fn calc_y(&self, y_coord: f64) -> i32 {
        ((y_coord - self.origin_y()) / self.pixel_height()).floor() as i32
    }

    pub fn contains_pixel(&self, x: i32, y: i32) -> bool {
        x >= 0 && y >= 0 && x < self.num_cols as i32 && y < self.num_rows as i32
    }

    pub fn is_nodata(&self, value: f64) -> bool {
        is_nodata_f64(value, self.no_data_value)
    }

    /// Creates an empty raster at `path` with this template's extent,
    /// geotransform and projection, the given pixel type and nodata value,
    /// and the routing creation options.
    pub fn create_raster(
        &self,
        path: &Path,
        gdal_type: GdalDataType,
        no_data_value: f64,
        fill_value: Option<f64>,
    ) -> Result<()> {
        debug!("creating {:?} as {} {}x{}", path, gdal_type, self.num_cols, self.num_rows);

        let driver = DriverManager::get_driver_by_name(GTIFF_DRIVER)?;
        let mut dataset = create_with_type(
            &driver,
            gdal_type,
            path,
            self.num_cols as isize,
            self.num_rows as isize,
        )?;

        {
            let mut band = dataset.rasterband(1)?;
            band.set_no_data_value(Some(no_data_value))?;
            if let Some(fill) = fill_value {
                let err = unsafe { gdal_sys::GDALFillRaster(band.c_rasterband(), fill, 0.0) };
                if err != gdal_sys::CPLErr::CE_None {
                    bail!("GDALFillRaster failed with CPLErr {}", err);
                }
            }
        }

        dataset.set_geo_transform(&self.geo_transform)?;
        if !self.projection.is_empty() {
            dataset.set_projection(&self.projection)?;
        }

        Ok(())
    }
}

fn create_with_type(
    driver: &Driver,
    gdal_type: GdalDataType,
    path: &Path,
    num_cols: isize,
    num_rows: isize,
) -> Result<Dataset> {
    let dataset = match gdal_type {
        GdalDataType::UInt8 => driver.create_with_band_type_with_options::<u8, _>(
            path,
            num_cols,
            num_rows,
            1,
            &ROUTING_RASTER_OPTIONS,
        )?,
        GdalDataType::UInt16 => driver.create_with_band_type_with_options::<u16, _>(
            path,
            num_cols,
            num_rows,
            1,
            &ROUTING_RASTER_OPTIONS,
        )?,
        GdalDataType::Int16 => driver.create_with_band_type_with_options::<i16, _>(
            path,
            num_cols,
            num_rows,
            1,
            &ROUTING_RASTER_OPTIONS,
        )?,
        GdalDataType::UInt32 => driver.create_with_band_type_with_options::<u32, _>(
            path,
            num_cols,
            num_rows,
            1,
            &ROUTING_RASTER_OPTIONS,
        )?,
        GdalDataType::Int32 => driver.create_with_band_type_with_options::<i32, _>(
            path,
            num_cols,
            num_rows,
            1,
            &ROUTING_RASTER_OPTIONS,
        )?,
        GdalDataType::Float32 => driver.create_with_band_type_with_options::<f32, _>(
            path,
            num_cols,
            num_rows,
            1,
            &ROUTING_RASTER_OPTIONS,
        )?,
        _ => driver.create_with_band_type_with_options::<f64, _>(
            path,
            num_cols,
            num_rows,
            1,
            &ROUTING_RASTER_OPTIONS,
        )?,
    };
    Ok(dataset)
}

/// Opens a raster dataset for in-place pixel updates.
pub fn open_for_update(path: &Path) -> Result<Dataset> {
    let dataset = Dataset::open_ex(
        path,
        DatasetOptions {
            open_flags: GdalOpenFlags::GDAL_OF_RASTER | GdalOpenFlags::GDAL_OF_UPDATE,
            ..Default::default()
        },
    )?;
    Ok(dataset)
}

/// Copies one band of `src` into a fresh raster at `dst_path`, keeping the
/// source pixel type, nodata value, geotransform and projection, but laid
/// out with the routing creation options.
pub fn copy_band(src: &BandRef, dst_path: &Path) -> Result<RasterInfo> {
    let info = RasterInfo::read(src)?;
    info.create_raster(dst_path, info.gdal_type, info.no_data_value, None)?;

    let src_dataset = Dataset::open(src.path)?;
    let src_band = src_dataset.rasterband(src.band)?;
    let dst_dataset = open_for_update(dst_path)?;
    let mut dst_band = dst_dataset.rasterband(1)?;

    for window in BlockWindowIterator::new(info.num_cols, info.num_rows, 256, 256) {
        let buffer = src_band.read_as::<f64>(
            (window.xoff as isize, window.yoff as isize),
            (window.win_x as usize, window.win_y as usize),
            (window.win_x as usize, window.win_y as usize),
            None,
        )?;
        dst_band.write(
            (window.xoff as isize, window.yoff as isize),
            (window.win_x as usize, window.win_y as usize),
            &buffer,
        )?;
    }

    Ok(info)
}

//Gdal can hand back nodata as NaN, and f32 nodata values round-trip through
//f64 with more error than a f64 ulp comparison tolerates.
#[inline]
pub fn is_nodata_f64(val: f64, no_data_value: f64) -> bool {
    if !val.is_finite() {
        return true;
    }

    if !no_data_value.is_finite() {
        return false;
    }

    no_data_value.approx_eq(
        val,
        F64Margin {
            ulps: 5,
            epsilon: f64::EPSILON * 5.0,
        },
    )
}
