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
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::fs::remove_dir_all;
use std::path::Path;

use anyhow::Result;
use gdal::raster::{rasterize, GdalDataType, RasterizeOptions};
use gdal::vector::Geometry;
use log::info;

use crate::raster::{open_for_update, BandRef, ManagedRaster, RasterInfo, RasterMode};
use crate::routing::{D8_DX, D8_DY, D8_NODATA, D8_REVERSE};
use crate::util::{scratch_dir, ProgressLog};
use crate::vector::{
    create_raw_fragment_layer, polygonize_fragments, read_outflow_points, write_fragments,
};

const NO_WATERSHED: f64 = -1.0;

/// Delineates one watershed fragment per outflow point over a D8 flow
/// field and writes them as polygons tagged with `ws_id` and the ids of the
/// fragments nested upstream.
///
/// Each outflow floods backwards over the flow graph.  A neighbor is taken
/// when it drains into the frontier or belongs to the outflow's own
/// rasterised footprint; a neighbor already claimed by another outflow is
/// recorded as nested and never entered, which keeps fragments disjoint and
/// lets callers assemble full watersheds by unioning fragment sets.
pub fn delineate_watersheds(
    flow_dir: BandRef,
    outflow_vector: &Path,
    target_vector: &Path,
) -> Result<()> {
    flow_dir.validate()?;

    let info = RasterInfo::read(&flow_dir)?;
    let (schema, outflows) = read_outflow_points(outflow_vector, &info)?;
    if outflows.is_empty() {
        info!("no outflow point falls inside {}, writing an empty fragment layer", flow_dir);
        return write_fragments(
            target_vector,
            &info.projection,
            &schema,
            &[],
            &[],
            outflow_vector,
        );
    }

    let scratch = scratch_dir(target_vector, "delineate_watersheds")?;
    let labels_path = scratch.join("watershed_labels.tif");
    let mask_path = scratch.join("visited_mask.tif");
    info.create_raster(&labels_path, GdalDataType::Int32, NO_WATERSHED, Some(NO_WATERSHED))?;
    info.create_raster(&mask_path, GdalDataType::UInt8, 255.0, Some(0.0))?;

    // burn each outflow's footprint with its id, all-touched
    {
        let mut labels_dataset = open_for_update(&labels_path)?;
        for outflow in &outflows {
            let geometry = Geometry::from_wkt(&outflow.geometry_wkt)?;
            rasterize(
                &mut labels_dataset,
                &[1],
                &[geometry],
                &[outflow.ws_id as f64],
                Some(RasterizeOptions {
                    all_touched: true,
                    ..Default::default()
                }),
            )?;
        }
    }

    let mut direction = ManagedRaster::open(flow_dir, RasterMode::Read)?;
    let mut labels = ManagedRaster::open(BandRef::new(&labels_path, 1), RasterMode::ReadWrite)?;
    let mut visited = ManagedRaster::open(BandRef::new(&mask_path, 1), RasterMode::ReadWrite)?;

    let num_cols = info.num_cols as i32;
    let num_rows = info.num_rows as i32;
    let mut nested: Vec<BTreeSet<i32>> = vec![BTreeSet::new(); outflows.len()];
    let mut progress = ProgressLog::new();

    for (index, outflow) in outflows.iter().enumerate() {
        progress.tick(index, outflows.len(), "delineate_watersheds");
        let ws_id = outflow.ws_id as f64;

        let mut queue = VecDeque::new();
        let mut queued: HashSet<(i32, i32)> = HashSet::new();
        queue.push_back((outflow.raster_x, outflow.raster_y));
        queued.insert((outflow.raster_x, outflow.raster_y));

        while let Some((cx, cy)) = queue.pop_front() {
            visited.set(cx, cy, 1.0)?;
            labels.set(cx, cy, ws_id)?;

            for neighbor_index in 0..8 {
                let nx = cx + D8_DX[neighbor_index];
                let ny = cy + D8_DY[neighbor_index];
                if nx < 0 || ny < 0 || nx >= num_cols || ny >= num_rows {
                    continue;
                }

                let label = labels.get(nx, ny)?;
                let neighbor_direction = direction.get(nx, ny)?;
                let flows_in = neighbor_direction != D8_NODATA
                    && neighbor_direction as u8 == D8_REVERSE[neighbor_index];
                if !flows_in && label != ws_id {
                    continue;
                }
                if label != NO_WATERSHED && label != ws_id {
                    // drains into us but belongs to another outflow: record
                    // the nesting, never enter its territory
                    nested[index].insert(label as i32);
                    continue;
                }
                if visited.get(nx, ny)? == 1.0 {
                    continue;
                }
                if queued.contains(&(nx, ny)) {
                    continue;
                }
                queued.insert((nx, ny));
                queue.push_back((nx, ny));
            }
        }
    }

    direction.close()?;
    labels.close()?;
    visited.close()?;

    let raw_path = scratch.join("raw_fragments.gpkg");
    create_raw_fragment_layer(&raw_path, &info.projection)?;
    polygonize_fragments(&labels_path, &mask_path, &raw_path)?;
    write_fragments(
        target_vector,
        &info.projection,
        &schema,
        &outflows,
        &nested,
        &raw_path,
    )?;

    remove_dir_all(&scratch)?;
    Ok(())
}
