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

use crate::errors::RoutingError;
use crate::raster::{BandRef, ManagedRaster, RasterInfo, RasterMode};
use crate::routing::{
    mfd_unpack, mfd_weight, mfd_weight_sum, step_cost, FlowWalkFrame, ACCUM_NODATA, D8_DX, D8_DY,
    D8_NODATA, D8_REVERSE,
};
use crate::util::{BlockWindowIterator, ProgressLog};

/// Downstream flow length to the nearest channel pixel over a D8 field.
/// Channel pixels are distance 0; pixels with no path to a channel stay at
/// nodata -1.  The per-step cost is the weight band's value at the upstream
/// pixel when given, otherwise 1 for cardinal and sqrt(2) for diagonal
/// steps.
pub fn distance_to_channel_d8(
    flow_dir: BandRef,
    channel: BandRef,
    target_path: &Path,
    weight: Option<BandRef>,
) -> Result<()> {
    flow_dir.validate()?;
    channel.validate()?;
    if let Some(w) = &weight {
        w.validate()?;
    }

    let info = RasterInfo::read(&flow_dir)?;
    check_same_shape(&info, &RasterInfo::read(&channel)?, channel.path)?;
    info.create_raster(
        target_path,
        GdalDataType::Float64,
        ACCUM_NODATA,
        Some(ACCUM_NODATA),
    )?;

    let mut direction = ManagedRaster::open(flow_dir, RasterMode::Read)?;
    let mut channel_mask = ManagedRaster::open(channel, RasterMode::Read)?;
    let mut distance = ManagedRaster::open(BandRef::new(target_path, 1), RasterMode::ReadWrite)?;
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
        progress.tick(
            window.current_step,
            window.num_steps,
            "distance_to_channel_d8",
        );
        for y in window.yoff..window.yoff + window.win_y {
            for x in window.xoff..window.xoff + window.win_x {
                if channel_mask.get(x, y)? != 1.0 {
                    continue;
                }
                if distance.get(x, y)? != ACCUM_NODATA {
                    continue;
                }

                // flood upstream from the channel pixel
                let mut stack = vec![(x, y, 0.0f64)];
                while let Some((cx, cy, length)) = stack.pop() {
                    distance.set(cx, cy, length)?;
                    for neighbor_index in 0..8 {
                        let nx = cx + D8_DX[neighbor_index];
                        let ny = cy + D8_DY[neighbor_index];
                        if nx < 0 || ny < 0 || nx >= num_cols || ny >= num_rows {
                            continue;
                        }
                        let neighbor_direction = direction.get(nx, ny)?;
                        if neighbor_direction == D8_NODATA
                            || neighbor_direction as u8 != D8_REVERSE[neighbor_index]
                        {
                            continue;
                        }
                        if channel_mask.get(nx, ny)? == 1.0 {
                            continue;
                        }
                        if distance.get(nx, ny)? != ACCUM_NODATA {
                            continue;
                        }
                        let cost = match weight_raster.as_mut() {
                            Some(raster) => {
                                let value = raster.get(nx, ny)?;
                                if raster.is_nodata(value) {
                                    0.0
                                } else {
                                    value
                                }
                            }
                            None => step_cost(neighbor_index),
                        };
                        stack.push((nx, ny, length + cost));
                    }
                }
            }
        }
    }

    direction.close()?;
    channel_mask.close()?;
    distance.close()?;
    if let Some(w) = weight_raster {
        w.close()?;
    }
    Ok(())
}

/// MFD variant: a pixel's distance is the outflow-fraction-weighted sum of
/// `cost + distance(downstream)` over its defined downstream neighbors.
/// Channels are 0; downstream terms that land off-raster or on undefined
/// flow contribute nothing, so a pixel draining nowhere defined gets 0.
pub fn distance_to_channel_mfd(
    flow_dir: BandRef,
    channel: BandRef,
    target_path: &Path,
    weight: Option<BandRef>,
) -> Result<()> {
    flow_dir.validate()?;
    channel.validate()?;
    if let Some(w) = &weight {
        w.validate()?;
    }

    let info = RasterInfo::read(&flow_dir)?;
    check_same_shape(&info, &RasterInfo::read(&channel)?, channel.path)?;
    info.create_raster(
        target_path,
        GdalDataType::Float64,
        ACCUM_NODATA,
        Some(ACCUM_NODATA),
    )?;

    let mut direction = ManagedRaster::open(flow_dir, RasterMode::Read)?;
    let mut channel_mask = ManagedRaster::open(channel, RasterMode::Read)?;
    let mut distance = ManagedRaster::open(BandRef::new(target_path, 1), RasterMode::ReadWrite)?;
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
        progress.tick(
            window.current_step,
            window.num_steps,
            "distance_to_channel_mfd",
        );
        for y in window.yoff..window.yoff + window.win_y {
            for x in window.xoff..window.xoff + window.win_x {
                if channel_mask.get(x, y)? == 1.0 {
                    if distance.get(x, y)? == ACCUM_NODATA {
                        distance.set(x, y, 0.0)?;
                    }
                    continue;
                }
                if mfd_unpack(direction.get(x, y)?) == 0 {
                    continue;
                }
                if distance.get(x, y)? != ACCUM_NODATA {
                    continue;
                }
                walk_downstream_mfd(
                    &mut direction,
                    &mut channel_mask,
                    &mut distance,
                    weight_raster.as_mut(),
                    x,
                    y,
                )?;
            }
        }
    }

    direction.close()?;
    channel_mask.close()?;
    distance.close()?;
    if let Some(w) = weight_raster {
        w.close()?;
    }
    Ok(())
}

fn walk_downstream_mfd(
    direction: &mut ManagedRaster,
    channel_mask: &mut ManagedRaster,
    distance: &mut ManagedRaster,
    mut weight: Option<&mut ManagedRaster>,
    start_x: i32,
    start_y: i32,
) -> Result<()> {
    let num_cols = direction.num_cols();
    let num_rows = direction.num_rows();

    let mut stack = vec![FlowWalkFrame {
        x: start_x,
        y: start_y,
        next_neighbor: 0,
        running: 0.0,
    }];

    while let Some(mut frame) = stack.pop() {
        let packed = mfd_unpack(direction.get(frame.x, frame.y)?);
        let weight_sum = mfd_weight_sum(packed) as f64;
        let mut preempted = false;

        for outflow in frame.next_neighbor..8 {
            let flow_weight = mfd_weight(packed, outflow);
            if flow_weight == 0 {
                continue;
            }
            let nx = frame.x + D8_DX[outflow];
            let ny = frame.y + D8_DY[outflow];
            if nx < 0 || ny < 0 || nx >= num_cols || ny >= num_rows {
                continue;
            }
            let fraction = flow_weight as f64 / weight_sum;
            let cost = match weight.as_deref_mut() {
                Some(raster) => {
                    let value = raster.get(nx, ny)?;
                    if raster.is_nodata(value) {
                        0.0
                    } else {
                        value
                    }
                }
                None => step_cost(outflow),
            };
            if channel_mask.get(nx, ny)? == 1.0 {
                frame.running += fraction * cost;
                continue;
            }
            if mfd_unpack(direction.get(nx, ny)?) == 0 {
                continue;
            }
            let downstream = distance.get(nx, ny)?;
            if downstream == ACCUM_NODATA {
                frame.next_neighbor = outflow;
                stack.push(frame);
                stack.push(FlowWalkFrame {
                    x: nx,
                    y: ny,
                    next_neighbor: 0,
                    running: 0.0,
                });
                preempted = true;
                break;
            }
            frame.running += fraction * (cost + downstream);
        }

        if !preempted {
            distance.set(frame.x, frame.y, frame.running)?;
        }
    }
    Ok(())
}

fn check_same_shape(a: &RasterInfo, b: &RasterInfo, path: &Path) -> Result<()> {
    if a.num_cols != b.num_cols || a.num_rows != b.num_rows {
        return Err(RoutingError::InvalidArgument(format!(
            "raster {:?} is {}x{}, expected {}x{}",
            path, b.num_cols, b.num_rows, a.num_cols, a.num_rows
        ))
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::test_util::{
        create_test_raster, read_band_f64, temp_raster_path, test_raster_info,
    };
    use crate::routing::{flow_dir_d8, flow_dir_mfd, SQRT2};

    #[test]
    fn test_d8_distance_up_a_ramp() {
        let info = test_raster_info(3, 1, GdalDataType::Float64, -9999.0);
        let dem_path = create_test_raster("dist_ramp_dem.tif", &info, &[3.0, 2.0, 1.0]).unwrap();
        let mask_info = test_raster_info(3, 1, GdalDataType::UInt8, 255.0);
        let mask_path =
            create_test_raster("dist_ramp_mask.tif", &mask_info, &[0.0, 0.0, 1.0]).unwrap();
        let dir_path = temp_raster_path("dist_ramp_d8.tif");
        let distance_path = temp_raster_path("dist_ramp.tif");

        flow_dir_d8(BandRef::new(&dem_path, 1), &dir_path).unwrap();
        distance_to_channel_d8(
            BandRef::new(&dir_path, 1),
            BandRef::new(&mask_path, 1),
            &distance_path,
            None,
        )
        .unwrap();

        assert_eq!(vec![2.0, 1.0, 0.0], read_band_f64(&distance_path, 1).unwrap());

        std::fs::remove_file(&dem_path).unwrap();
        std::fs::remove_file(&mask_path).unwrap();
        std::fs::remove_file(&dir_path).unwrap();
        std::fs::remove_file(&distance_path).unwrap();
    }

    #[test]
    fn test_d8_diagonal_steps_cost_sqrt2() {
        // flow runs down the diagonal into the channel at the corner
        #[rustfmt::skip]
        let dem = [
            9.0, 8.0, 7.0,
            8.0, 6.0, 4.0,
            7.0, 4.0, 1.0,
        ];
        let info = test_raster_info(3, 3, GdalDataType::Float64, -9999.0);
        let dem_path = create_test_raster("dist_diag_dem.tif", &info, &dem).unwrap();
        let mask_info = test_raster_info(3, 3, GdalDataType::UInt8, 255.0);
        #[rustfmt::skip]
        let mask = [
            0.0, 0.0, 0.0,
            0.0, 0.0, 0.0,
            0.0, 0.0, 1.0,
        ];
        let mask_path = create_test_raster("dist_diag_mask.tif", &mask_info, &mask).unwrap();
        let dir_path = temp_raster_path("dist_diag_d8.tif");
        let distance_path = temp_raster_path("dist_diag.tif");

        flow_dir_d8(BandRef::new(&dem_path, 1), &dir_path).unwrap();
        distance_to_channel_d8(
            BandRef::new(&dir_path, 1),
            BandRef::new(&mask_path, 1),
            &distance_path,
            None,
        )
        .unwrap();

        let result = read_band_f64(&distance_path, 1).unwrap();
        assert_eq!(0.0, result[8]);
        assert_eq!(SQRT2, result[4]);
        assert_eq!(2.0 * SQRT2, result[0]);
        assert_eq!(1.0, result[7]);
        assert_eq!(1.0, result[5]);
        // every pixel reaches the channel
        assert!(result.iter().all(|d| *d >= 0.0));

        std::fs::remove_file(&dem_path).unwrap();
        std::fs::remove_file(&mask_path).unwrap();
        std::fs::remove_file(&dir_path).unwrap();
        std::fs::remove_file(&distance_path).unwrap();
    }

    #[test]
    fn test_mfd_distance_along_a_line() {
        let info = test_raster_info(3, 1, GdalDataType::Float64, -9999.0);
        let dem_path = create_test_raster("dist_mfd_dem.tif", &info, &[3.0, 2.0, 1.0]).unwrap();
        let mask_info = test_raster_info(3, 1, GdalDataType::UInt8, 255.0);
        let mask_path =
            create_test_raster("dist_mfd_mask.tif", &mask_info, &[0.0, 0.0, 1.0]).unwrap();
        let dir_path = temp_raster_path("dist_mfd_dir.tif");
        let distance_path = temp_raster_path("dist_mfd.tif");

        flow_dir_mfd(BandRef::new(&dem_path, 1), &dir_path).unwrap();
        distance_to_channel_mfd(
            BandRef::new(&dir_path, 1),
            BandRef::new(&mask_path, 1),
            &distance_path,
            None,
        )
        .unwrap();

        // all 15 units of each cell point east along the line
        assert_eq!(vec![2.0, 1.0, 0.0], read_band_f64(&distance_path, 1).unwrap());

        std::fs::remove_file(&dem_path).unwrap();
        std::fs::remove_file(&mask_path).unwrap();
        std::fs::remove_file(&dir_path).unwrap();
        std::fs::remove_file(&distance_path).unwrap();
    }

    #[test]
    fn test_mfd_pixel_draining_nowhere_defined_gets_zero() {
        // an isolated low cell: its flow field points off-raster only
        let info = test_raster_info(2, 1, GdalDataType::Float64, -9999.0);
        let dem_path = create_test_raster("dist_mfd_sink_dem.tif", &info, &[2.0, 1.0]).unwrap();
        let mask_info = test_raster_info(2, 1, GdalDataType::UInt8, 255.0);
        let mask_path =
            create_test_raster("dist_mfd_sink_mask.tif", &mask_info, &[0.0, 0.0]).unwrap();
        let dir_path = temp_raster_path("dist_mfd_sink_dir.tif");
        let distance_path = temp_raster_path("dist_mfd_sink.tif");

        flow_dir_mfd(BandRef::new(&dem_path, 1), &dir_path).unwrap();
        distance_to_channel_mfd(
            BandRef::new(&dir_path, 1),
            BandRef::new(&mask_path, 1),
            &distance_path,
            None,
        )
        .unwrap();

        let result = read_band_f64(&distance_path, 1).unwrap();
        // (1,0) only drains off-raster: no defined term, distance 0
        assert_eq!(0.0, result[1]);

        std::fs::remove_file(&dem_path).unwrap();
        std::fs::remove_file(&mask_path).unwrap();
        std::fs::remove_file(&dir_path).unwrap();
        std::fs::remove_file(&distance_path).unwrap();
    }
}
