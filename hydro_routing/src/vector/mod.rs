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
use std::collections::BTreeSet;
use std::ffi::CString;
use std::path::Path;
use std::ptr::null_mut;

use anyhow::{bail, Result};
use gdal::spatial_ref::SpatialRef;
use gdal::vector::{FieldValue, Geometry, LayerAccess, OGRFieldType};
use gdal::{Dataset, DriverManager, LayerOptions};
use gdal_sys::{
    CPLErr, GDALClose, GDALDatasetGetLayer, GDALGetRasterBand, GDALOpenEx, GDALPolygonize,
};
use itertools::Itertools;
use log::debug;

use crate::errors::RoutingError;
use crate::raster::RasterInfo;

pub const GPKG_DRIVER: &str = "GPKG";

pub const GDAL_OF_READONLY: u32 = 0x00;
pub const GDAL_OF_UPDATE: u32 = 0x01;
pub const GDAL_OF_RASTER: u32 = 0x02;
pub const GDAL_OF_VECTOR: u32 = 0x04;
pub const GDAL_OF_VERBOSE_ERROR: u32 = 0x40;

/// The fragment id column, and the internal field name the delineator
/// never copies from its input.
pub const WS_ID_FIELD: &str = "ws_id";
pub const INTERNAL_WS_ID_FIELD: &str = "__ws_id__";
pub const UPSTREAM_FIELD: &str = "upstream_fragments";

/// A copied outflow attribute.  Only integer/real/string fields survive the
/// trip into the fragment layer.
#[derive(Debug, Clone)]
pub enum AttrValue {
    Int(i32),
    Long(i64),
    Real(f64),
    Text(String),
}

impl AttrValue {
    fn to_field_value(&self) -> FieldValue {
        match self {
            AttrValue::Int(v) => FieldValue::IntegerValue(*v),
            AttrValue::Long(v) => FieldValue::Integer64Value(*v),
            AttrValue::Real(v) => FieldValue::RealValue(*v),
            AttrValue::Text(v) => FieldValue::StringValue(v.clone()),
        }
    }
}

/// An outflow point clipped to the raster, with its dense 1-based id, its
/// pixel coordinate, and the attributes to copy onto its fragments.
#[derive(Debug)]
pub struct OutflowPoint {
    pub ws_id: i32,
    pub raster_x: i32,
    pub raster_y: i32,
    pub geometry_wkt: String,
    pub fields: Vec<(String, Option<AttrValue>)>,
}

/// Field names and types of the outflow layer that the fragment writer
/// copies through.
pub type OutflowSchema = Vec<(String, u32)>;

fn supported_field(field_type: u32) -> bool {
    field_type == OGRFieldType::OFTInteger
        || field_type == OGRFieldType::OFTInteger64
        || field_type == OGRFieldType::OFTReal
        || field_type == OGRFieldType::OFTString
}

/// Reads the first layer of the outflow vector, drops features outside the
/// raster bound, and numbers the survivors from 1 in feature order.
pub fn read_outflow_points(
    vector_path: &Path,
    info: &RasterInfo,
) -> Result<(OutflowSchema, Vec<OutflowPoint>)> {
    if !vector_path.exists() {
        return Err(RoutingError::InvalidArgument(format!(
            "outflow vector {:?} does not exist",
            vector_path
        ))
        .into());
    }
    let dataset = Dataset::open(vector_path)?;
    let mut layer = dataset.layer(0)?;

    let schema: OutflowSchema = layer
        .defn()
        .fields()
        .map(|field| (field.name(), field.field_type()))
        .filter(|(name, field_type)| name != INTERNAL_WS_ID_FIELD && supported_field(*field_type))
        .collect();

    let mut points = Vec::new();
    for feature in layer.features() {
        let geometry = match feature.geometry() {
            Some(geometry) => geometry,
            None => continue,
        };
        let (x_coord, y_coord, _) = geometry.get_point(0);
        let raster_x = info.calc_x(x_coord);
        let raster_y = info.calc_y(y_coord);
        if !info.contains_pixel(raster_x, raster_y) {
            debug!(
                "outflow at ({}, {}) falls outside the raster, skipped",
                x_coord, y_coord
            );
            continue;
        }

        let mut fields = Vec::with_capacity(schema.len());
        for (name, _) in &schema {
            let value = match feature.field(name)? {
                Some(FieldValue::IntegerValue(v)) => Some(AttrValue::Int(v)),
                Some(FieldValue::Integer64Value(v)) => Some(AttrValue::Long(v)),
                Some(FieldValue::RealValue(v)) => Some(AttrValue::Real(v)),
                Some(FieldValue::StringValue(v)) => Some(AttrValue::Text(v)),
                _ => None,
            };
            fields.push((name.clone(), value));
        }

        points.push(OutflowPoint {
            ws_id: points.len() as i32 + 1,
            raster_x,
            raster_y,
            geometry_wkt: geometry.wkt()?,
            fields,
        });
    }

    Ok((schema, points))
}

fn layer_spatial_ref(projection_wkt: &str) -> Option<SpatialRef> {
    if projection_wkt.is_empty() {
        None
    } else {
        SpatialRef::from_wkt(projection_wkt).ok()
    }
}

/// Creates the single-field polygon layer GDALPolygonize writes into.
pub fn create_raw_fragment_layer(path: &Path, projection_wkt: &str) -> Result<()> {
    let driver = DriverManager::get_driver_by_name(GPKG_DRIVER)?;
    let mut dataset = driver.create_vector_only(path)?;
    let srs = layer_spatial_ref(projection_wkt);
    let layer = dataset.create_layer(LayerOptions {
        name: "raw_fragments",
        srs: srs.as_ref(),
        ty: gdal_sys::OGRwkbGeometryType::wkbPolygon,
        ..Default::default()
    })?;
    layer.create_defn_fields(&[(WS_ID_FIELD, OGRFieldType::OFTInteger)])?;
    Ok(())
}

/// 8-connected polygonization of the label raster masked by the visited
/// mask, into field 0 of the target layer.  The safe wrapper has no
/// polygonize binding, so this drops to gdal-sys.
pub fn polygonize_fragments(
    label_raster: &Path,
    mask_raster: &Path,
    vector_path: &Path,
) -> Result<()> {
    let label_c = CString::new(label_raster.to_string_lossy().as_ref())?;
    let mask_c = CString::new(mask_raster.to_string_lossy().as_ref())?;
    let vector_c = CString::new(vector_path.to_string_lossy().as_ref())?;

    unsafe {
        let label_ds = GDALOpenEx(
            label_c.as_ptr(),
            GDAL_OF_RASTER | GDAL_OF_READONLY | GDAL_OF_VERBOSE_ERROR,
            null_mut(),
            null_mut(),
            null_mut(),
        );
        if label_ds.is_null() {
            bail!("GDALOpenEx failed on {:?}", label_raster);
        }
        let mask_ds = GDALOpenEx(
            mask_c.as_ptr(),
            GDAL_OF_RASTER | GDAL_OF_READONLY | GDAL_OF_VERBOSE_ERROR,
            null_mut(),
            null_mut(),
            null_mut(),
        );
        if mask_ds.is_null() {
            GDALClose(label_ds);
            bail!("GDALOpenEx failed on {:?}", mask_raster);
        }
        let vector_ds = GDALOpenEx(
            vector_c.as_ptr(),
            GDAL_OF_VECTOR | GDAL_OF_UPDATE | GDAL_OF_VERBOSE_ERROR,
            null_mut(),
            null_mut(),
            null_mut(),
        );
        if vector_ds.is_null() {
            GDALClose(mask_ds);
            GDALClose(label_ds);
            bail!("GDALOpenEx failed on {:?}", vector_path);
        }

        let label_band = GDALGetRasterBand(label_ds, 1);
        let mask_band = GDALGetRasterBand(mask_ds, 1);
        let layer = GDALDatasetGetLayer(vector_ds, 0);

        //do this locally since we don't want the CString to be deallocated
        //until the call returns
        let connected = CString::new("8CONNECTED=8")?;
        let mut options: Vec<*mut libc::c_char> =
            vec![connected.as_ptr() as *mut libc::c_char, null_mut()];

        let err = GDALPolygonize(
            label_band,
            mask_band,
            layer,
            0,
            options.as_mut_ptr(),
            None,
            null_mut(),
        );

        GDALClose(vector_ds);
        GDALClose(mask_ds);
        GDALClose(label_ds);

        if err != CPLErr::CE_None {
            bail!("GDALPolygonize failed with CPLErr {}", err);
        }
    }
    Ok(())
}

/// Writes the final fragment layer: one feature per polygon, carrying the
/// originating outflow's attributes, its `ws_id`, and the comma-joined
/// ascending list of fragment ids nested upstream of it.
pub fn write_fragments(
    target: &Path,
    projection_wkt: &str,
    schema: &OutflowSchema,
    outflows: &[OutflowPoint],
    nested: &[BTreeSet<i32>],
    raw_polygons: &Path,
) -> Result<()> {
    let driver = DriverManager::get_driver_by_name(GPKG_DRIVER)?;
    let mut dataset = driver.create_vector_only(target)?;
    let srs = layer_spatial_ref(projection_wkt);
    let mut layer = dataset.create_layer(LayerOptions {
        name: "watershed_fragments",
        srs: srs.as_ref(),
        ty: gdal_sys::OGRwkbGeometryType::wkbPolygon,
        ..Default::default()
    })?;

    let mut field_defs: Vec<(&str, u32)> = schema
        .iter()
        .map(|(name, field_type)| (name.as_str(), *field_type))
        .collect();
    field_defs.push((WS_ID_FIELD, OGRFieldType::OFTInteger));
    field_defs.push((UPSTREAM_FIELD, OGRFieldType::OFTString));
    layer.create_defn_fields(&field_defs)?;

    if outflows.is_empty() {
        return Ok(());
    }

    let raw_dataset = Dataset::open(raw_polygons)?;
    let mut raw_layer = raw_dataset.layer(0)?;
    for feature in raw_layer.features() {
        let ws_id = match feature.field(WS_ID_FIELD)? {
            Some(FieldValue::IntegerValue(v)) => v,
            _ => continue,
        };
        if ws_id < 1 || ws_id as usize > outflows.len() {
            continue;
        }
        let geometry = match feature.geometry() {
            Some(geometry) => geometry.clone(),
            None => continue,
        };

        let outflow = &outflows[(ws_id - 1) as usize];
        let upstream = nested[(ws_id - 1) as usize]
            .iter()
            .map(|id| id.to_string())
            .join(",");

        let mut names: Vec<&str> = Vec::with_capacity(outflow.fields.len() + 2);
        let mut values: Vec<FieldValue> = Vec::with_capacity(outflow.fields.len() + 2);
        for (name, value) in &outflow.fields {
            if let Some(value) = value {
                names.push(name.as_str());
                values.push(value.to_field_value());
            }
        }
        names.push(WS_ID_FIELD);
        values.push(FieldValue::IntegerValue(ws_id));
        names.push(UPSTREAM_FIELD);
        values.push(FieldValue::StringValue(upstream));

        layer.create_feature_fields(geometry, &names, &values)?;
    }

    Ok(())
}

/// Creates a point layer for tests and small tools: one feature per
/// `(x, y, name)` with a single string attribute.
pub fn write_point_layer(
    target: &Path,
    projection_wkt: &str,
    points: &[(f64, f64, &str)],
) -> Result<()> {
    let driver = DriverManager::get_driver_by_name(GPKG_DRIVER)?;
    let mut dataset = driver.create_vector_only(target)?;
    let srs = layer_spatial_ref(projection_wkt);
    let mut layer = dataset.create_layer(LayerOptions {
        name: "outflows",
        srs: srs.as_ref(),
        ty: gdal_sys::OGRwkbGeometryType::wkbPoint,
        ..Default::default()
    })?;
    layer.create_defn_fields(&[("name", OGRFieldType::OFTString)])?;

    for (x, y, name) in points {
        let geometry = Geometry::from_wkt(&format!("POINT ({} {})", x, y))?;
        layer.create_feature_fields(
            geometry,
            &["name"],
            &[FieldValue::StringValue(name.to_string())],
        )?;
    }
    Ok(())
}
