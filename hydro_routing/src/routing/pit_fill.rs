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
use std::collections::{BinaryHeap, VecDeque};
use std::fs::remove_dir_all;
use std::path::Path;

use anyhow::Result;
use gdal::raster::GdalDataType;
use gdal::Dataset;
use log::debug;

use crate::errors::RoutingError;
use crate::raster::{copy_band, is_nodata_f64, BandRef, ManagedRaster, RasterMode};
use crate::routing::{PixelRecord, D8_DX, D8_DY};
use crate::util::{scratch_dir, BlockWindowIterator, ProgressLog};

/// Copies the DEM to `target_path` (same pixel type) and raises every
/// hydrologically undrained region to the elevation of its lowest pour
/// point.
///
/// The scan reads the source band tile by tile with a one-pixel halo; a
/// pixel with a lower, nodata or off-raster neighbor drains locally and is
/// skipped.  Everything else seeds a same-height sweep that either proves
/// the region is a plateau or priority-floods it to find the pour point.
pub fn fill_pits(dem: BandRef, target_path: &Path) -> Result<()> {
    dem.validate()?;

    let info = copy_band(&dem, target_path)?;
    let scratch = scratch_dir(target_path, "fill_pits")?;
    let flat_mask_path = scratch.join("flat_region_mask.tif");
    let pit_mask_path = scratch.join("pit_mask.tif");
    info.create_raster(&flat_mask_path, GdalDataType::UInt8, 255.0, Some(0.0))?;
    info.create_raster(&pit_mask_path, GdalDataType::Int32, -1.0, Some(0.0))?;

    let source_dataset = Dataset::open(dem.path)?;
    let source_band = source_dataset.rasterband(dem.band)?;
    let source_nodata = info.no_data_value;

    let mut filled = ManagedRaster::open(BandRef::new(target_path, 1), RasterMode::ReadWrite)?;
    let mut flat_mask =
        ManagedRaster::open(BandRef::new(&flat_mask_path, 1), RasterMode::ReadWrite)?;
    let mut pit_mask = ManagedRaster::open(BandRef::new(&pit_mask_path, 1), RasterMode::ReadWrite)?;

    let num_cols = info.num_cols as i32;
    let num_rows = info.num_rows as i32;
    let mut feature_id = 0i32;
    let mut progress = ProgressLog::new();

    for window in BlockWindowIterator::new(
        info.num_cols,
        info.num_rows,
        filled.block_xsize(),
        filled.block_ysize(),
    ) {
        progress.tick(window.current_step, window.num_steps, "fill_pits");

        // window plus a one-pixel halo, clipped to the raster
        let halo_x0 = (window.xoff - 1).max(0);
        let halo_y0 = (window.yoff - 1).max(0);
        let halo_x1 = (window.xoff + window.win_x + 1).min(num_cols);
        let halo_y1 = (window.yoff + window.win_y + 1).min(num_rows);
        let halo_cols = (halo_x1 - halo_x0) as usize;
        let halo = source_band.read_as::<f64>(
            (halo_x0 as isize, halo_y0 as isize),
            (halo_cols, (halo_y1 - halo_y0) as usize),
            (halo_cols, (halo_y1 - halo_y0) as usize),
            None,
        )?;
        let halo_value =
            |x: i32, y: i32| halo.data[(y - halo_y0) as usize * halo_cols + (x - halo_x0) as usize];

        for y in window.yoff..window.yoff + window.win_y {
            for x in window.xoff..window.xoff + window.win_x {
                let base_value = halo_value(x, y);
                if is_nodata_f64(base_value, source_nodata) {
                    continue;
                }
                if flat_mask.get(x, y)? == 1.0 {
                    continue;
                }

                let mut drains = false;
                for direction in 0..8 {
                    let nx = x + D8_DX[direction];
                    let ny = y + D8_DY[direction];
                    if nx < 0 || ny < 0 || nx >= num_cols || ny >= num_rows {
                        drains = true;
                        break;
                    }
                    let neighbor = halo_value(nx, ny);
                    if is_nodata_f64(neighbor, source_nodata) || neighbor < base_value {
                        drains = true;
                        break;
                    }
                }
                if drains {
                    continue;
                }

                // sweep the connected same-height region on the filled view
                let region_height = filled.get(x, y)?;
                let mut region = VecDeque::new();
                region.push_back((x, y));
                flat_mask.set(x, y, 1.0)?;
                let mut region_drains = false;
                while let Some((cx, cy)) = region.pop_front() {
                    for direction in 0..8 {
                        let nx = cx + D8_DX[direction];
                        let ny = cy + D8_DY[direction];
                        if nx < 0 || ny < 0 || nx >= num_cols || ny >= num_rows {
                            region_drains = true;
                            continue;
                        }
                        let neighbor = filled.get(nx, ny)?;
                        if filled.is_nodata(neighbor) || neighbor < region_height {
                            region_drains = true;
                        } else if neighbor == region_height && flat_mask.get(nx, ny)? == 0.0 {
                            flat_mask.set(nx, ny, 1.0)?;
                            region.push_back((nx, ny));
                        }
                    }
                }
                if region_drains {
                    // plateau; the mask keeps other seeds from rediscovering it
                    continue;
                }

                feature_id += 1;
                debug!("pit {} seeded at ({}, {})", feature_id, x, y);
                let fill_height =
                    find_pour_height(&mut filled, &mut pit_mask, x, y, region_height, feature_id)?
                        .ok_or(RoutingError::UndrainedRaster { x, y })?;
                raise_to(&mut filled, x, y, fill_height)?;
            }
        }
    }

    filled.close()?;
    flat_mask.close()?;
    pit_mask.close()?;
    remove_dir_all(&scratch)?;
    Ok(())
}

/// Expands the pit outward in increasing-elevation order.  The first popped
/// pixel with a lower, nodata or off-raster neighbor is the pour point and
/// its elevation is the fill height.  `None` means the heap drained without
/// one: the raster cannot drain at all.
fn find_pour_height(
    filled: &mut ManagedRaster,
    pit_mask: &mut ManagedRaster,
    seed_x: i32,
    seed_y: i32,
    seed_height: f64,
    feature_id: i32,
) -> Result<Option<f64>> {
    let num_cols = filled.num_cols();
    let num_rows = filled.num_rows();
    let feature = feature_id as f64;

    let mut heap = BinaryHeap::new();
    heap.push(PixelRecord {
        value: seed_height,
        x: seed_x,
        y: seed_y,
        tiebreak: filled.block_index(seed_x, seed_y) as i64,
    });
    pit_mask.set(seed_x, seed_y, feature)?;

    while let Some(record) = heap.pop() {
        for direction in 0..8 {
            let nx = record.x + D8_DX[direction];
            let ny = record.y + D8_DY[direction];
            if nx < 0 || ny < 0 || nx >= num_cols || ny >= num_rows {
                return Ok(Some(record.value));
            }
            let neighbor = filled.get(nx, ny)?;
            if filled.is_nodata(neighbor) {
                return Ok(Some(record.value));
            }
            if neighbor < record.value {
                return Ok(Some(record.value));
            }
            if pit_mask.get(nx, ny)? != feature {
                pit_mask.set(nx, ny, feature)?;
                heap.push(PixelRecord {
                    value: neighbor,
                    x: nx,
                    y: ny,
                    tiebreak: filled.block_index(nx, ny) as i64,
                });
            }
        }
    }
    Ok(None)
}

/// Raises every pixel below `fill_height` connected to the seed to exactly
/// `fill_height`.  Pixels at or above it act as barriers, so the flood
/// cannot leak past the pour point.
fn raise_to(filled: &mut ManagedRaster, seed_x: i32, seed_y: i32, fill_height: f64) -> Result<()> {
    let num_cols = filled.num_cols();
    let num_rows = filled.num_rows();

    let mut queue = VecDeque::new();
    if filled.get(seed_x, seed_y)? < fill_height {
        filled.set(seed_x, seed_y, fill_height)?;
        queue.push_back((seed_x, seed_y));
    }
    while let Some((cx, cy)) = queue.pop_front() {
        for direction in 0..8 {
            let nx = cx + D8_DX[direction];
            let ny = cy + D8_DY[direction];
            if nx < 0 || ny < 0 || nx >= num_cols || ny >= num_rows {
                continue;
            }
            let neighbor = filled.get(nx, ny)?;
            if filled.is_nodata(neighbor) {
                continue;
            }
            if neighbor < fill_height {
                filled.set(nx, ny, fill_height)?;
                queue.push_back((nx, ny));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::test_util::{create_test_raster, read_band_f64, temp_raster_path, test_raster_info};

    #[rustfmt::skip]
    const SIMPLE_PIT: [f64; 25] = [
        9.0, 9.0, 9.0, 9.0, 9.0,
        9.0, 5.0, 5.0, 5.0, 9.0,
        9.0, 5.0, 1.0, 5.0, 9.0,
        9.0, 5.0, 5.0, 5.0, 9.0,
        9.0, 9.0, 9.0, 9.0, 9.0,
    ];

    #[test]
    fn test_simple_pit_fills_to_pour_height() {
        let info = test_raster_info(5, 5, GdalDataType::Float64, -9999.0);
        let dem_path = create_test_raster("pit_dem.tif", &info, &SIMPLE_PIT).unwrap();
        let filled_path = temp_raster_path("pit_filled.tif");

        fill_pits(BandRef::new(&dem_path, 1), &filled_path).unwrap();

        let mut expected = SIMPLE_PIT;
        expected[12] = 5.0;
        assert_eq!(expected.to_vec(), read_band_f64(&filled_path, 1).unwrap());

        std::fs::remove_file(&dem_path).unwrap();
        std::fs::remove_file(&filled_path).unwrap();
    }

    #[rustfmt::skip]
    const DRAINED_PIT: [f64; 25] = [
        3.0, 3.0, 3.0, 3.0, 3.0,
        3.0, 5.0, 5.0, 5.0, 3.0,
        3.0, 5.0, 1.0, 5.0, 3.0,
        3.0, 5.0, 5.0, 5.0, 3.0,
        3.0, 3.0, 3.0, 3.0, 3.0,
    ];

    #[test]
    fn test_fill_is_monotonic_and_idempotent() {
        let info = test_raster_info(5, 5, GdalDataType::Float64, -9999.0);
        let dem_path = create_test_raster("drained_dem.tif", &info, &DRAINED_PIT).unwrap();
        let once_path = temp_raster_path("drained_filled_once.tif");
        let twice_path = temp_raster_path("drained_filled_twice.tif");

        fill_pits(BandRef::new(&dem_path, 1), &once_path).unwrap();
        let once = read_band_f64(&once_path, 1).unwrap();
        for (filled, input) in once.iter().zip(DRAINED_PIT.iter()) {
            assert!(filled >= input);
        }
        assert_eq!(5.0, once[12]);

        fill_pits(BandRef::new(&once_path, 1), &twice_path).unwrap();
        assert_eq!(once, read_band_f64(&twice_path, 1).unwrap());

        std::fs::remove_file(&dem_path).unwrap();
        std::fs::remove_file(&once_path).unwrap();
        std::fs::remove_file(&twice_path).unwrap();
    }

    #[test]
    fn test_plateau_is_left_unchanged() {
        #[rustfmt::skip]
        let dem = [
            4.0, 4.0, 4.0,
            4.0, 4.0, 4.0,
            4.0, 4.0, 2.0,
        ];
        let info = test_raster_info(3, 3, GdalDataType::Float32, -9999.0);
        let dem_path = create_test_raster("plateau_dem.tif", &info, &dem).unwrap();
        let filled_path = temp_raster_path("plateau_filled.tif");

        fill_pits(BandRef::new(&dem_path, 1), &filled_path).unwrap();
        assert_eq!(dem.to_vec(), read_band_f64(&filled_path, 1).unwrap());

        std::fs::remove_file(&dem_path).unwrap();
        std::fs::remove_file(&filled_path).unwrap();
    }

    #[test]
    fn test_nodata_is_a_drain() {
        let nodata = -9999.0;
        #[rustfmt::skip]
        let dem = [
            7.0, 7.0, 7.0,
            7.0, 2.0, nodata,
            7.0, 7.0, 7.0,
        ];
        let info = test_raster_info(3, 3, GdalDataType::Float64, nodata);
        let dem_path = create_test_raster("nodata_dem.tif", &info, &dem).unwrap();
        let filled_path = temp_raster_path("nodata_filled.tif");

        fill_pits(BandRef::new(&dem_path, 1), &filled_path).unwrap();
        assert_eq!(dem.to_vec(), read_band_f64(&filled_path, 1).unwrap());

        std::fs::remove_file(&dem_path).unwrap();
        std::fs::remove_file(&filled_path).unwrap();
    }
}
