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
use std::path::Path;

use anyhow::Result;
use gdal::raster::GdalDataType;

use crate::raster::{BandRef, ManagedRaster, RasterInfo, RasterMode};
use crate::routing::{
    mfd_unpack, mfd_weight, mfd_weight_sum, FlowWalkFrame, ACCUM_NODATA, D8_DX, D8_DY, D8_NODATA,
    D8_REVERSE,
};
use crate::util::{BlockWindowIterator, ProgressLog};

/// Weighted D8 flow accumulation:
/// `accum(p) = w(p) + sum of accum(q)` over the neighbors `q` draining into
/// `p`.  Without a weight band every pixel weighs 1.  Output is float64,
/// nodata -1.
///
/// Roots are pixels whose outflow leaves the raster or lands on undefined
/// flow direction.  From each root an explicit stack walks the upstream
/// graph; a frame whose upstream neighbor is not yet computed is suspended
/// at that neighbor index and resumed later, so traversal depth is bounded
/// by heap, not the call stack.
pub fn flow_accumulation_d8(
    flow_dir: BandRef,
    target_path: &Path,
    weight: Option<BandRef>,
) -> Result<()> {
    flow_dir.validate()?;
    if let Some(w) = &weight {
        w.validate()?;
    }

    let info = RasterInfo::read(&flow_dir)?;
    info.create_raster(
        target_path,
        GdalDataType::Float64,
        ACCUM_NODATA,
        Some(ACCUM_NODATA),
    )?;

    let mut direction = ManagedRaster::open(flow_dir, RasterMode::Read)?;
    let mut accum = ManagedRaster::open(BandRef::new(target_path, 1), RasterMode::ReadWrite)?;
    let mut weight_raster = match weight {
        Some(w) => Some(ManagedRaster::open(w, RasterMode::Read)?),
        None => None,
    };

    let num_cols = info.num_cols as i32;
    let num_rows = info.num_rows as i32;
    let mut progress = ProgressLog::new();

    for window in BlockWindowIterator::new(
        info.num_cols,
        info.num_rows,
        direction.block_xsize(),
        direction.block_ysize(),
    ) {
        progress.tick(window.current_step, window.num_steps, "flow_accumulation_d8");
        for y in window.yoff..window.yoff + window.win_y {
            for x in window.xoff..window.xoff + window.win_x {
                let cell = direction.get(x, y)?;
                // covers the 128 nodata as well
                if !(0.0..8.0).contains(&cell) {
                    continue;
                }
                let outflow = cell as usize;
                let ox = x + D8_DX[outflow];
                let oy = y + D8_DY[outflow];
                let drains_out = ox < 0
                    || oy < 0
                    || ox >= num_cols
                    || oy >= num_rows
                    || direction.get(ox, oy)? == D8_NODATA;
                if !drains_out {
                    continue;
                }
                if accum.get(x, y)? != ACCUM_NODATA {
                    continue;
                }
                walk_upstream_d8(&mut direction, &mut accum, weight_raster.as_mut(), x, y)?;
            }
        }
    }

    direction.close()?;
    accum.close()?;
    if let Some(w) = weight_raster {
        w.close()?;
    }
    Ok(())
}

fn walk_upstream_d8(
    direction: &mut ManagedRaster,
    accum: &mut ManagedRaster,
    mut weight: Option<&mut ManagedRaster>,
    root_x: i32,
    root_y: i32,
) -> Result<()> {
    let num_cols = direction.num_cols();
    let num_rows = direction.num_rows();

    let root_weight = local_weight(weight.as_deref_mut(), root_x, root_y)?;
    let mut stack = vec![FlowWalkFrame {
        x: root_x,
        y: root_y,
        next_neighbor: 0,
        running: root_weight,
    }];

    while let Some(mut frame) = stack.pop() {
        let mut preempted = false;
        for neighbor_index in frame.next_neighbor..8 {
            let nx = frame.x + D8_DX[neighbor_index];
            let ny = frame.y + D8_DY[neighbor_index];
            if nx < 0 || ny < 0 || nx >= num_cols || ny >= num_rows {
                continue;
            }
            let neighbor_direction = direction.get(nx, ny)?;
            if neighbor_direction == D8_NODATA
                || neighbor_direction as u8 != D8_REVERSE[neighbor_index]
            {
                continue;
            }
            let upstream = accum.get(nx, ny)?;
            if upstream == ACCUM_NODATA {
                // suspend here; the neighbor's value is taken on resume
                frame.next_neighbor = neighbor_index;
                let neighbor_weight = local_weight(weight.as_deref_mut(), nx, ny)?;
                stack.push(frame);
                stack.push(FlowWalkFrame {
                    x: nx,
                    y: ny,
                    next_neighbor: 0,
                    running: neighbor_weight,
                });
                preempted = true;
                break;
            }
            frame.running += upstream;
        }
        if !preempted {
            accum.set(frame.x, frame.y, frame.running)?;
        }
    }
    Ok(())
}

/// MFD flow accumulation; each upstream contribution is scaled by the
/// fraction of the neighbor's outflow aimed at this pixel.
pub fn flow_accumulation_mfd(
    flow_dir: BandRef,
    target_path: &Path,
    weight: Option<BandRef>,
) -> Result<()> {
    flow_dir.validate()?;
    if let Some(w) = &weight {
        w.validate()?;
    }

    let info = RasterInfo::read(&flow_dir)?;
    info.create_raster(
        target_path,
        GdalDataType::Float64,
        ACCUM_NODATA,
        Some(ACCUM_NODATA),
    )?;

    let mut direction = ManagedRaster::open(flow_dir, RasterMode::Read)?;
    let mut accum = ManagedRaster::open(BandRef::new(target_path, 1), RasterMode::ReadWrite)?;
    let mut weight_raster = match weight {
        Some(w) => Some(ManagedRaster::open(w, RasterMode::Read)?),
        None => None,
    };

    let num_cols = info.num_cols as i32;
    let num_rows = info.num_rows as i32;
    let mut progress = ProgressLog::new();

    for window in BlockWindowIterator::new(
        info.num_cols,
        info.num_rows,
        direction.block_xsize(),
        direction.block_ysize(),
    ) {
        progress.tick(window.current_step, window.num_steps, "flow_accumulation_mfd");
        for y in window.yoff..window.yoff + window.win_y {
            for x in window.xoff..window.xoff + window.win_x {
                let packed = mfd_unpack(direction.get(x, y)?);
                if packed == 0 {
                    continue;
                }
                let mut drains_out = false;
                for outflow in 0..8 {
                    if mfd_weight(packed, outflow) == 0 {
                        continue;
                    }
                    let ox = x + D8_DX[outflow];
                    let oy = y + D8_DY[outflow];
                    if ox < 0
                        || oy < 0
                        || ox >= num_cols
                        || oy >= num_rows
                        || mfd_unpack(direction.get(ox, oy)?) == 0
                    {
                        drains_out = true;
                        break;
                    }
                }
                if !drains_out {
                    continue;
                }
                if accum.get(x, y)? != ACCUM_NODATA {
                    continue;
                }
                walk_upstream_mfd(&mut direction, &mut accum, weight_raster.as_mut(), x, y)?;
            }
        }
    }

    direction.close()?;
    accum.close()?;
    if let Some(w) = weight_raster {
        w.close()?;
    }
    Ok(())
}

fn walk_upstream_mfd(
    direction: &mut ManagedRaster,
    accum: &mut ManagedRaster,
    mut weight: Option<&mut ManagedRaster>,
    root_x: i32,
    root_y: i32,
) -> Result<()> {
    let num_cols = direction.num_cols();
    let num_rows = direction.num_rows();

    let root_weight = local_weight(weight.as_deref_mut(), root_x, root_y)?;
    let mut stack = vec![FlowWalkFrame {
        x: root_x,
        y: root_y,
        next_neighbor: 0,
        running: root_weight,
    }];

    while let Some(mut frame) = stack.pop() {
        let mut preempted = false;
        for neighbor_index in frame.next_neighbor..8 {
            let nx = frame.x + D8_DX[neighbor_index];
            let ny = frame.y + D8_DY[neighbor_index];
            if nx < 0 || ny < 0 || nx >= num_cols || ny >= num_rows {
                continue;
            }
            let neighbor_packed = mfd_unpack(direction.get(nx, ny)?);
            if neighbor_packed == 0 {
                continue;
            }
            let toward_me = mfd_weight(neighbor_packed, D8_REVERSE[neighbor_index] as usize);
            if toward_me == 0 {
                continue;
            }
            let upstream = accum.get(nx, ny)?;
            if upstream == ACCUM_NODATA {
                frame.next_neighbor = neighbor_index;
                let neighbor_weight = local_weight(weight.as_deref_mut(), nx, ny)?;
                stack.push(frame);
                stack.push(FlowWalkFrame {
                    x: nx,
                    y: ny,
                    next_neighbor: 0,
                    running: neighbor_weight,
                });
                preempted = true;
                break;
            }
            let fraction = toward_me as f64 / mfd_weight_sum(neighbor_packed) as f64;
            frame.running += upstream * fraction;
        }
        if !preempted {
            accum.set(frame.x, frame.y, frame.running)?;
        }
    }
    Ok(())
}

fn local_weight(weight: Option<&mut ManagedRaster>, x: i32, y: i32) -> Result<f64> {
    match weight {
        Some(raster) => {
            let value = raster.get(x, y)?;
            Ok(if raster.is_nodata(value) { 0.0 } else { value })
        }
        None => Ok(1.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::test_util::{
        create_test_raster, read_band_f64, temp_raster_path, test_raster_info,
    };
    use crate::routing::{flow_dir_d8, flow_dir_mfd};

    #[test]
    fn test_d8_ramp_accumulates_one_two_three() {
        let info = test_raster_info(3, 1, GdalDataType::Float64, -9999.0);
        let dem_path = create_test_raster("accum_ramp_dem.tif", &info, &[3.0, 2.0, 1.0]).unwrap();
        let dir_path = temp_raster_path("accum_ramp_d8.tif");
        let accum_path = temp_raster_path("accum_ramp.tif");

        flow_dir_d8(BandRef::new(&dem_path, 1), &dir_path).unwrap();
        flow_accumulation_d8(BandRef::new(&dir_path, 1), &accum_path, None).unwrap();

        assert_eq!(vec![1.0, 2.0, 3.0], read_band_f64(&accum_path, 1).unwrap());

        std::fs::remove_file(&dem_path).unwrap();
        std::fs::remove_file(&dir_path).unwrap();
        std::fs::remove_file(&accum_path).unwrap();
    }

    #[test]
    fn test_d8_upstream_sum_consistency() {
        // a bowl draining through the south-east corner
        #[rustfmt::skip]
        let dem = [
            9.0, 8.0, 7.0,
            8.0, 6.0, 4.0,
            7.0, 4.0, 1.0,
        ];
        let info = test_raster_info(3, 3, GdalDataType::Float64, -9999.0);
        let dem_path = create_test_raster("accum_bowl_dem.tif", &info, &dem).unwrap();
        let dir_path = temp_raster_path("accum_bowl_d8.tif");
        let accum_path = temp_raster_path("accum_bowl.tif");

        flow_dir_d8(BandRef::new(&dem_path, 1), &dir_path).unwrap();
        flow_accumulation_d8(BandRef::new(&dir_path, 1), &accum_path, None).unwrap();

        let directions = read_band_f64(&dir_path, 1).unwrap();
        let accum = read_band_f64(&accum_path, 1).unwrap();

        // accum(p) = 1 + sum of upstream accums, checked cell by cell
        for y in 0..3i32 {
            for x in 0..3i32 {
                let mut expected = 1.0;
                for direction in 0..8usize {
                    let nx = x + D8_DX[direction];
                    let ny = y + D8_DY[direction];
                    if nx < 0 || ny < 0 || nx >= 3 || ny >= 3 {
                        continue;
                    }
                    let neighbor_dir = directions[(ny * 3 + nx) as usize];
                    if neighbor_dir != D8_NODATA
                        && neighbor_dir as u8 == D8_REVERSE[direction]
                    {
                        expected += accum[(ny * 3 + nx) as usize];
                    }
                }
                assert_eq!(expected, accum[(y * 3 + x) as usize], "at ({}, {})", x, y);
            }
        }
        // everything lands in the outlet
        assert_eq!(9.0, accum[8]);

        std::fs::remove_file(&dem_path).unwrap();
        std::fs::remove_file(&dir_path).unwrap();
        std::fs::remove_file(&accum_path).unwrap();
    }

    #[test]
    fn test_d8_weight_band() {
        let info = test_raster_info(3, 1, GdalDataType::Float64, -9999.0);
        let dem_path = create_test_raster("accum_w_dem.tif", &info, &[3.0, 2.0, 1.0]).unwrap();
        let weight_info = test_raster_info(3, 1, GdalDataType::Float64, -1.0);
        let weight_path =
            create_test_raster("accum_w_weight.tif", &weight_info, &[2.0, 0.5, 4.0]).unwrap();
        let dir_path = temp_raster_path("accum_w_d8.tif");
        let accum_path = temp_raster_path("accum_w.tif");

        flow_dir_d8(BandRef::new(&dem_path, 1), &dir_path).unwrap();
        flow_accumulation_d8(
            BandRef::new(&dir_path, 1),
            &accum_path,
            Some(BandRef::new(&weight_path, 1)),
        )
        .unwrap();

        assert_eq!(vec![2.0, 2.5, 6.5], read_band_f64(&accum_path, 1).unwrap());

        std::fs::remove_file(&dem_path).unwrap();
        std::fs::remove_file(&weight_path).unwrap();
        std::fs::remove_file(&dir_path).unwrap();
        std::fs::remove_file(&accum_path).unwrap();
    }

    #[test]
    fn test_mfd_ramp_matches_d8_on_a_line() {
        let info = test_raster_info(3, 1, GdalDataType::Float64, -9999.0);
        let dem_path = create_test_raster("accum_mfd_dem.tif", &info, &[3.0, 2.0, 1.0]).unwrap();
        let dir_path = temp_raster_path("accum_mfd_dir.tif");
        let accum_path = temp_raster_path("accum_mfd.tif");

        flow_dir_mfd(BandRef::new(&dem_path, 1), &dir_path).unwrap();
        flow_accumulation_mfd(BandRef::new(&dir_path, 1), &accum_path, None).unwrap();

        assert_eq!(vec![1.0, 2.0, 3.0], read_band_f64(&accum_path, 1).unwrap());

        std::fs::remove_file(&dem_path).unwrap();
        std::fs::remove_file(&dir_path).unwrap();
        std::fs::remove_file(&accum_path).unwrap();
    }

    #[test]
    fn test_mfd_split_conserves_mass() {
        // the center splits over three downhill cells; whatever the split,
        // the bottom row catches all of it plus its own weight
        #[rustfmt::skip]
        let dem = [
            2.0, 2.0, 2.0,
            2.0, 1.0, 2.0,
            0.0, 0.0, 0.0,
        ];
        let info = test_raster_info(3, 3, GdalDataType::Float64, -9999.0);
        let dem_path = create_test_raster("accum_split_dem.tif", &info, &dem).unwrap();
        let dir_path = temp_raster_path("accum_split_dir.tif");
        let accum_path = temp_raster_path("accum_split.tif");

        flow_dir_mfd(BandRef::new(&dem_path, 1), &dir_path).unwrap();
        flow_accumulation_mfd(BandRef::new(&dir_path, 1), &accum_path, None).unwrap();

        let accum = read_band_f64(&accum_path, 1).unwrap();
        assert!(accum.iter().all(|a| *a != ACCUM_NODATA));
        let bottom: f64 = accum[6] + accum[7] + accum[8];
        let total: f64 = 9.0;
        // the bottom row is the only exit, so it drains every pixel
        assert!((bottom - total).abs() < 1e-9, "bottom row drains {}", bottom);

        std::fs::remove_file(&dem_path).unwrap();
        std::fs::remove_file(&dir_path).unwrap();
        std::fs::remove_file(&accum_path).unwrap();
    }
}
