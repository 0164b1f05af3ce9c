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
use std::collections::VecDeque;
use std::fs::remove_dir_all;
use std::path::Path;

use anyhow::Result;
use gdal::raster::GdalDataType;

use crate::raster::{
    ensure_power_of_two_blocks, BandRef, ManagedRaster, RasterInfo, RasterMode,
};
use crate::routing::{
    mfd_distribute, mfd_pack, slope_scale, step_cost, D8_DX, D8_DY, D8_NODATA, D8_REVERSE,
    MFD_NODATA,
};
use crate::util::{scratch_dir, BlockWindowIterator, ProgressLog};

/// Assigns every defined DEM pixel its single steepest-descent direction.
/// Flat regions are resolved by a shortest-drain-distance sweep so that ties
/// across a plateau are broken deterministically.  The DEM must already be
/// pit filled; undrained interiors are left unset.
///
/// Output is uint8, nodata 128, directions 0..7 clockwise from east.
pub fn flow_dir_d8(dem: BandRef, target_path: &Path) -> Result<()> {
    dem.validate()?;
    let scratch = scratch_dir(target_path, "flow_dir_d8")?;
    let retiled = ensure_power_of_two_blocks(dem, &scratch)?;
    let source = match &retiled {
        Some(path) => BandRef::new(path, 1),
        None => dem,
    };

    let info = RasterInfo::read(&source)?;
    info.create_raster(target_path, GdalDataType::UInt8, D8_NODATA, Some(D8_NODATA))?;
    let distance_path = scratch.join("plateau_distance.tif");
    let mask_path = scratch.join("plateau_mask.tif");
    let sentinel = info.num_cols as f64 * info.num_rows as f64;
    info.create_raster(&distance_path, GdalDataType::Float64, -1.0, Some(sentinel))?;
    info.create_raster(&mask_path, GdalDataType::UInt8, 255.0, Some(0.0))?;

    let mut dem_raster = ManagedRaster::open(source, RasterMode::Read)?;
    let mut flow_dir = ManagedRaster::open(BandRef::new(target_path, 1), RasterMode::ReadWrite)?;
    let mut distance =
        ManagedRaster::open(BandRef::new(&distance_path, 1), RasterMode::ReadWrite)?;
    let mut mask = ManagedRaster::open(BandRef::new(&mask_path, 1), RasterMode::ReadWrite)?;

    let mut progress = ProgressLog::new();
    for window in BlockWindowIterator::new(
        info.num_cols,
        info.num_rows,
        dem_raster.block_xsize(),
        dem_raster.block_ysize(),
    ) {
        progress.tick(window.current_step, window.num_steps, "flow_dir_d8");
        for y in window.yoff..window.yoff + window.win_y {
            for x in window.xoff..window.xoff + window.win_x {
                let height = dem_raster.get(x, y)?;
                if dem_raster.is_nodata(height) {
                    continue;
                }
                if flow_dir.get(x, y)? != D8_NODATA || mask.get(x, y)? == 1.0 {
                    continue;
                }
                if let Some(direction) = steepest_descent(&mut dem_raster, x, y, height)? {
                    flow_dir.set(x, y, direction as f64)?;
                    continue;
                }
                resolve_flat_region_d8(
                    &mut dem_raster,
                    &mut flow_dir,
                    &mut distance,
                    &mut mask,
                    x,
                    y,
                    height,
                )?;
            }
        }
    }

    dem_raster.close()?;
    flow_dir.close()?;
    distance.close()?;
    mask.close()?;
    remove_dir_all(&scratch)?;
    Ok(())
}

/// Direction of the largest positive diagonal-corrected slope, scanning
/// E, NE, N, ... so equal slopes break toward the first direction.
fn steepest_descent(
    dem: &mut ManagedRaster,
    x: i32,
    y: i32,
    height: f64,
) -> Result<Option<usize>> {
    let num_cols = dem.num_cols();
    let num_rows = dem.num_rows();
    let mut best = None;
    let mut best_slope = 0.0;
    for direction in 0..8 {
        let nx = x + D8_DX[direction];
        let ny = y + D8_DY[direction];
        if nx < 0 || ny < 0 || nx >= num_cols || ny >= num_rows {
            continue;
        }
        let neighbor = dem.get(nx, ny)?;
        if dem.is_nodata(neighbor) {
            continue;
        }
        let slope = (height - neighbor) * slope_scale(direction);
        if slope > best_slope {
            best_slope = slope;
            best = Some(direction);
        }
    }
    Ok(best)
}

/// Sweeps the connected same-height region, wiring downhill drains directly
/// and everything else toward the nearest drain.
///
/// Cells with a downhill neighbor keep their steepest-descent direction and
/// seed the distance sweep at zero.  When the region has no downhill drain
/// at all, the cells that fall off the raster or into nodata are promoted to
/// drains with their fall-off direction.  Remaining cells get the direction
/// of the neighbor on the shortest same-height path to a drain.
fn resolve_flat_region_d8(
    dem: &mut ManagedRaster,
    flow_dir: &mut ManagedRaster,
    distance: &mut ManagedRaster,
    mask: &mut ManagedRaster,
    seed_x: i32,
    seed_y: i32,
    height: f64,
) -> Result<()> {
    let num_cols = dem.num_cols();
    let num_rows = dem.num_rows();

    let mut discover = VecDeque::new();
    discover.push_back((seed_x, seed_y));
    mask.set(seed_x, seed_y, 1.0)?;

    let mut drains: VecDeque<(i32, i32)> = VecDeque::new();
    let mut edge_drains: Vec<(i32, i32, usize)> = Vec::new();

    while let Some((cx, cy)) = discover.pop_front() {
        let mut best: Option<usize> = None;
        let mut best_slope = 0.0;
        let mut edge_direction: Option<usize> = None;
        for direction in 0..8 {
            let nx = cx + D8_DX[direction];
            let ny = cy + D8_DY[direction];
            if nx < 0 || ny < 0 || nx >= num_cols || ny >= num_rows {
                if edge_direction.is_none() {
                    edge_direction = Some(direction);
                }
                continue;
            }
            let neighbor = dem.get(nx, ny)?;
            if dem.is_nodata(neighbor) {
                if edge_direction.is_none() {
                    edge_direction = Some(direction);
                }
                continue;
            }
            if neighbor < height {
                let slope = (height - neighbor) * slope_scale(direction);
                if slope > best_slope {
                    best_slope = slope;
                    best = Some(direction);
                }
            } else if neighbor == height && mask.get(nx, ny)? == 0.0 {
                mask.set(nx, ny, 1.0)?;
                discover.push_back((nx, ny));
            }
        }

        if let Some(direction) = best {
            flow_dir.set(cx, cy, direction as f64)?;
            distance.set(cx, cy, 0.0)?;
            drains.push_back((cx, cy));
        } else if let Some(direction) = edge_direction {
            edge_drains.push((cx, cy, direction));
        }
    }

    if drains.is_empty() {
        for &(cx, cy, direction) in &edge_drains {
            flow_dir.set(cx, cy, direction as f64)?;
            distance.set(cx, cy, 0.0)?;
            drains.push_back((cx, cy));
        }
    }

    // shortest-path assignment over the flat, FIFO relaxation
    while let Some((cx, cy)) = drains.pop_front() {
        let current = distance.get(cx, cy)?;
        for direction in 0..8 {
            let nx = cx + D8_DX[direction];
            let ny = cy + D8_DY[direction];
            if nx < 0 || ny < 0 || nx >= num_cols || ny >= num_rows {
                continue;
            }
            let neighbor = dem.get(nx, ny)?;
            if dem.is_nodata(neighbor) || neighbor != height {
                continue;
            }
            let candidate = current + step_cost(direction);
            if distance.get(nx, ny)? > candidate {
                distance.set(nx, ny, candidate)?;
                flow_dir.set(nx, ny, D8_REVERSE[direction] as f64)?;
                drains.push_back((nx, ny));
            }
        }
    }

    Ok(())
}

/// Distributes every defined DEM pixel's outflow over its downhill
/// neighbors, weights proportional to the diagonal-corrected slopes and
/// packed as four-bit nibbles summing to 15.  Flat regions drain toward the
/// nearest drain the same way the D8 engine resolves them, but with the
/// whole distribution recomputed from the plateau distances.
///
/// Output is int32, nodata 0, nibble `i` at bit `4*i`.
pub fn flow_dir_mfd(dem: BandRef, target_path: &Path) -> Result<()> {
    dem.validate()?;
    let scratch = scratch_dir(target_path, "flow_dir_mfd")?;
    let retiled = ensure_power_of_two_blocks(dem, &scratch)?;
    let source = match &retiled {
        Some(path) => BandRef::new(path, 1),
        None => dem,
    };

    let info = RasterInfo::read(&source)?;
    info.create_raster(target_path, GdalDataType::Int32, MFD_NODATA, Some(MFD_NODATA))?;
    let distance_path = scratch.join("plateau_distance.tif");
    let mask_path = scratch.join("plateau_mask.tif");
    let sentinel = info.num_cols as f64 * info.num_rows as f64;
    info.create_raster(&distance_path, GdalDataType::Float64, -1.0, Some(sentinel))?;
    info.create_raster(&mask_path, GdalDataType::UInt8, 255.0, Some(0.0))?;

    let mut dem_raster = ManagedRaster::open(source, RasterMode::Read)?;
    let mut flow_dir = ManagedRaster::open(BandRef::new(target_path, 1), RasterMode::ReadWrite)?;
    let mut distance =
        ManagedRaster::open(BandRef::new(&distance_path, 1), RasterMode::ReadWrite)?;
    let mut mask = ManagedRaster::open(BandRef::new(&mask_path, 1), RasterMode::ReadWrite)?;

    let mut progress = ProgressLog::new();
    for window in BlockWindowIterator::new(
        info.num_cols,
        info.num_rows,
        dem_raster.block_xsize(),
        dem_raster.block_ysize(),
    ) {
        progress.tick(window.current_step, window.num_steps, "flow_dir_mfd");
        for y in window.yoff..window.yoff + window.win_y {
            for x in window.xoff..window.xoff + window.win_x {
                let height = dem_raster.get(x, y)?;
                if dem_raster.is_nodata(height) {
                    continue;
                }
                if flow_dir.get(x, y)? != MFD_NODATA || mask.get(x, y)? == 1.0 {
                    continue;
                }
                let packed = downhill_distribution(&mut dem_raster, x, y, height)?;
                if packed != 0 {
                    flow_dir.set(x, y, mfd_pack(packed))?;
                    continue;
                }
                resolve_flat_region_mfd(
                    &mut dem_raster,
                    &mut flow_dir,
                    &mut distance,
                    &mut mask,
                    x,
                    y,
                    height,
                )?;
            }
        }
    }

    dem_raster.close()?;
    flow_dir.close()?;
    distance.close()?;
    mask.close()?;
    remove_dir_all(&scratch)?;
    Ok(())
}

/// Slope-weighted nibble distribution over the strictly lower neighbors;
/// zero when there are none.
fn downhill_distribution(
    dem: &mut ManagedRaster,
    x: i32,
    y: i32,
    height: f64,
) -> Result<u32> {
    let num_cols = dem.num_cols();
    let num_rows = dem.num_rows();
    let mut shares = [0.0f64; 8];
    for direction in 0..8 {
        let nx = x + D8_DX[direction];
        let ny = y + D8_DY[direction];
        if nx < 0 || ny < 0 || nx >= num_cols || ny >= num_rows {
            continue;
        }
        let neighbor = dem.get(nx, ny)?;
        if dem.is_nodata(neighbor) {
            continue;
        }
        if neighbor < height {
            shares[direction] = (height - neighbor) * slope_scale(direction);
        }
    }
    Ok(mfd_distribute(&shares))
}

fn resolve_flat_region_mfd(
    dem: &mut ManagedRaster,
    flow_dir: &mut ManagedRaster,
    distance: &mut ManagedRaster,
    mask: &mut ManagedRaster,
    seed_x: i32,
    seed_y: i32,
    height: f64,
) -> Result<()> {
    let num_cols = dem.num_cols();
    let num_rows = dem.num_rows();

    let mut discover = VecDeque::new();
    discover.push_back((seed_x, seed_y));
    mask.set(seed_x, seed_y, 1.0)?;

    let mut drains: VecDeque<(i32, i32)> = VecDeque::new();
    let mut edge_drains: Vec<(i32, i32)> = Vec::new();
    let mut interior: Vec<(i32, i32)> = Vec::new();

    while let Some((cx, cy)) = discover.pop_front() {
        let mut downhill_shares = [0.0f64; 8];
        let mut edge_shares = [0.0f64; 8];
        let mut has_downhill = false;
        let mut has_edge = false;
        for direction in 0..8 {
            let nx = cx + D8_DX[direction];
            let ny = cy + D8_DY[direction];
            if nx < 0 || ny < 0 || nx >= num_cols || ny >= num_rows {
                edge_shares[direction] = slope_scale(direction);
                has_edge = true;
                continue;
            }
            let neighbor = dem.get(nx, ny)?;
            if dem.is_nodata(neighbor) {
                edge_shares[direction] = slope_scale(direction);
                has_edge = true;
                continue;
            }
            if neighbor < height {
                downhill_shares[direction] = (height - neighbor) * slope_scale(direction);
                has_downhill = true;
            } else if neighbor == height && mask.get(nx, ny)? == 0.0 {
                mask.set(nx, ny, 1.0)?;
                discover.push_back((nx, ny));
            }
        }

        if has_downhill {
            flow_dir.set(cx, cy, mfd_pack(mfd_distribute(&downhill_shares)))?;
            distance.set(cx, cy, 0.0)?;
            drains.push_back((cx, cy));
        } else if has_edge {
            flow_dir.set(cx, cy, mfd_pack(mfd_distribute(&edge_shares)))?;
            edge_drains.push((cx, cy));
        } else {
            interior.push((cx, cy));
        }
    }

    // no real drain anywhere: the fall-off cells seed the distance sweep
    if drains.is_empty() {
        for &(cx, cy) in &edge_drains {
            distance.set(cx, cy, 0.0)?;
            drains.push_back((cx, cy));
        }
    }

    while let Some((cx, cy)) = drains.pop_front() {
        let current = distance.get(cx, cy)?;
        for direction in 0..8 {
            let nx = cx + D8_DX[direction];
            let ny = cy + D8_DY[direction];
            if nx < 0 || ny < 0 || nx >= num_cols || ny >= num_rows {
                continue;
            }
            let neighbor = dem.get(nx, ny)?;
            if dem.is_nodata(neighbor) || neighbor != height {
                continue;
            }
            let candidate = current + step_cost(direction);
            if distance.get(nx, ny)? > candidate {
                distance.set(nx, ny, candidate)?;
                drains.push_back((nx, ny));
            }
        }
    }

    // interior cells drain toward every same-height neighbor strictly
    // closer to a drain, cardinal steps weighted 1 and diagonals 1/sqrt(2)
    for &(cx, cy) in &interior {
        let own_distance = distance.get(cx, cy)?;
        let mut shares = [0.0f64; 8];
        for direction in 0..8 {
            let nx = cx + D8_DX[direction];
            let ny = cy + D8_DY[direction];
            if nx < 0 || ny < 0 || nx >= num_cols || ny >= num_rows {
                continue;
            }
            let neighbor = dem.get(nx, ny)?;
            if dem.is_nodata(neighbor) || neighbor != height {
                continue;
            }
            if distance.get(nx, ny)? < own_distance {
                shares[direction] = slope_scale(direction);
            }
        }
        let packed = mfd_distribute(&shares);
        if packed != 0 {
            flow_dir.set(cx, cy, mfd_pack(packed))?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::test_util::{
        create_test_raster, read_band_f64, temp_raster_path, test_raster_info,
    };
    use crate::routing::{mfd_unpack, mfd_weight, mfd_weight_sum};

    #[test]
    fn test_d8_ramp_drains_east() {
        let info = test_raster_info(3, 1, GdalDataType::Float64, -9999.0);
        let dem_path = create_test_raster("ramp_dem.tif", &info, &[3.0, 2.0, 1.0]).unwrap();
        let dir_path = temp_raster_path("ramp_d8.tif");

        flow_dir_d8(BandRef::new(&dem_path, 1), &dir_path).unwrap();

        // the rightmost cell's only drain is off the raster edge; it is
        // promoted with its fall-off direction so accumulation can root there
        assert_eq!(vec![0.0, 0.0, 0.0], read_band_f64(&dir_path, 1).unwrap());

        std::fs::remove_file(&dem_path).unwrap();
        std::fs::remove_file(&dir_path).unwrap();
    }

    #[test]
    fn test_d8_nodata_stays_nodata() {
        let nodata = -9999.0;
        #[rustfmt::skip]
        let dem = [
            3.0, 2.0, 1.0,
            nodata, nodata, nodata,
        ];
        let info = test_raster_info(3, 2, GdalDataType::Float64, nodata);
        let dem_path = create_test_raster("nodata_dem_d8.tif", &info, &dem).unwrap();
        let dir_path = temp_raster_path("nodata_d8.tif");

        flow_dir_d8(BandRef::new(&dem_path, 1), &dir_path).unwrap();

        let directions = read_band_f64(&dir_path, 1).unwrap();
        assert_eq!(vec![0.0, 0.0, 0.0, 128.0, 128.0, 128.0], directions);

        std::fs::remove_file(&dem_path).unwrap();
        std::fs::remove_file(&dir_path).unwrap();
    }

    #[rustfmt::skip]
    const PLATEAU_DEM: [f64; 15] = [
        5.0, 5.0, 5.0, 5.0, 0.0,
        5.0, 5.0, 5.0, 5.0, 5.0,
        5.0, 5.0, 5.0, 5.0, 5.0,
    ];

    #[test]
    fn test_d8_plateau_shortest_drain() {
        let info = test_raster_info(5, 3, GdalDataType::Float64, -9999.0);
        let dem_path = create_test_raster("plateau_dem_d8.tif", &info, &PLATEAU_DEM).unwrap();
        let dir_path = temp_raster_path("plateau_d8.tif");

        flow_dir_d8(BandRef::new(&dem_path, 1), &dir_path).unwrap();

        let directions = read_band_f64(&dir_path, 1).unwrap();
        let at = |x: usize, y: usize| directions[y * 5 + x];

        // every cell drains
        assert!(directions.iter().all(|d| *d != D8_NODATA));
        // row 0 marches east toward the low cell
        assert_eq!(0.0, at(0, 0));
        assert_eq!(0.0, at(1, 0));
        assert_eq!(0.0, at(2, 0));
        assert_eq!(0.0, at(3, 0));
        // the drain cells under and beside the outlet point at it
        assert_eq!(1.0, at(3, 1));
        assert_eq!(2.0, at(4, 1));
        // the far corner of the flat routes north toward the drain row
        assert_eq!(2.0, at(3, 2));
        assert_eq!(2.0, at(4, 2));
        // interior cells head for the closest drain, not blindly east
        assert_eq!(0.0, at(2, 1));
        assert_eq!(1.0, at(2, 2));

        std::fs::remove_file(&dem_path).unwrap();
        std::fs::remove_file(&dir_path).unwrap();
    }

    #[test]
    fn test_d8_deterministic_across_runs() {
        let info = test_raster_info(5, 3, GdalDataType::Float64, -9999.0);
        let dem_path = create_test_raster("det_dem_d8.tif", &info, &PLATEAU_DEM).unwrap();
        let first_path = temp_raster_path("det_d8_a.tif");
        let second_path = temp_raster_path("det_d8_b.tif");

        flow_dir_d8(BandRef::new(&dem_path, 1), &first_path).unwrap();
        flow_dir_d8(BandRef::new(&dem_path, 1), &second_path).unwrap();
        assert_eq!(
            read_band_f64(&first_path, 1).unwrap(),
            read_band_f64(&second_path, 1).unwrap()
        );

        std::fs::remove_file(&dem_path).unwrap();
        std::fs::remove_file(&first_path).unwrap();
        std::fs::remove_file(&second_path).unwrap();
    }

    #[test]
    fn test_mfd_split_over_three_lower_neighbors() {
        #[rustfmt::skip]
        let dem = [
            2.0, 2.0, 2.0,
            2.0, 1.0, 2.0,
            0.0, 0.0, 0.0,
        ];
        let info = test_raster_info(3, 3, GdalDataType::Float64, -9999.0);
        let dem_path = create_test_raster("split_dem_mfd.tif", &info, &dem).unwrap();
        let dir_path = temp_raster_path("split_mfd.tif");

        flow_dir_mfd(BandRef::new(&dem_path, 1), &dir_path).unwrap();

        let packed = mfd_unpack(read_band_f64(&dir_path, 1).unwrap()[4]);
        assert_eq!(15, mfd_weight_sum(packed));
        for direction in 0..8 {
            let weight = mfd_weight(packed, direction);
            if direction == 5 || direction == 6 || direction == 7 {
                assert!(weight > 0, "direction {} should carry flow", direction);
            } else {
                assert_eq!(0, weight, "direction {} should be dry", direction);
            }
        }

        std::fs::remove_file(&dem_path).unwrap();
        std::fs::remove_file(&dir_path).unwrap();
    }

    #[test]
    fn test_mfd_weights_sum_to_fifteen_everywhere() {
        #[rustfmt::skip]
        let dem = [
            9.0, 8.0, 7.0, 6.0,
            8.0, 7.0, 6.0, 5.0,
            7.0, 6.0, 5.0, 5.0,
            6.0, 5.0, 5.0, 4.0,
        ];
        let info = test_raster_info(4, 4, GdalDataType::Float64, -9999.0);
        let dem_path = create_test_raster("sum_dem_mfd.tif", &info, &dem).unwrap();
        let dir_path = temp_raster_path("sum_mfd.tif");

        flow_dir_mfd(BandRef::new(&dem_path, 1), &dir_path).unwrap();

        for cell in read_band_f64(&dir_path, 1).unwrap() {
            let packed = mfd_unpack(cell);
            assert!(packed != 0, "every cell of this DEM drains somewhere");
            assert_eq!(15, mfd_weight_sum(packed));
        }

        std::fs::remove_file(&dem_path).unwrap();
        std::fs::remove_file(&dir_path).unwrap();
    }

    #[test]
    fn test_mfd_plateau_drains_through_outlet() {
        let info = test_raster_info(5, 3, GdalDataType::Float64, -9999.0);
        let dem_path = create_test_raster("plateau_dem_mfd.tif", &info, &PLATEAU_DEM).unwrap();
        let dir_path = temp_raster_path("plateau_mfd.tif");

        flow_dir_mfd(BandRef::new(&dem_path, 1), &dir_path).unwrap();

        let cells = read_band_f64(&dir_path, 1).unwrap();
        for (index, cell) in cells.iter().enumerate() {
            let packed = mfd_unpack(*cell);
            assert!(packed != 0, "cell {} has no outflow", index);
            assert_eq!(15, mfd_weight_sum(packed), "cell {}", index);
        }
        // the cell west of the outlet sends everything at it
        let toward_outlet = mfd_unpack(cells[3]);
        assert_eq!(15, mfd_weight(toward_outlet, 0));

        std::fs::remove_file(&dem_path).unwrap();
        std::fs::remove_file(&dir_path).unwrap();
    }
}
