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
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use anyhow::Result;
use gdal::raster::Buffer;
use gdal::Dataset;
use log::warn;

use crate::errors::RoutingError;
use crate::raster::{is_nodata_f64, open_for_update, BandRef, RasterInfo};

/// Number of blocks each managed raster keeps resident.
pub const CACHE_BLOCK_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RasterMode {
    Read,
    ReadWrite,
}

struct CacheSlot {
    data: Vec<f64>,
    last_used: u64,
}

/// Fixed-capacity block cache with least-recently-used eviction.  Recency is
/// a monotonic tick, so eviction order is deterministic and independent of
/// the allocator.  The cache never performs I/O: evicted buffers are handed
/// back to the owner, who must flush dirty ones.
pub struct BlockCache {
    capacity: usize,
    tick: u64,
    slots: HashMap<usize, CacheSlot>,
}

impl BlockCache {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0);
        BlockCache {
            capacity,
            tick: 0,
            slots: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn exists(&self, index: usize) -> bool {
        self.slots.contains_key(&index)
    }

    /// Returns the cached buffer, refreshing its recency.
    pub fn get(&mut self, index: usize) -> Option<&mut Vec<f64>> {
        self.tick += 1;
        let tick = self.tick;
        self.slots.get_mut(&index).map(|slot| {
            slot.last_used = tick;
            &mut slot.data
        })
    }

    /// Inserts a buffer and returns the displaced `(index, buffer)` entries,
    /// least recently used first.
    pub fn put(&mut self, index: usize, data: Vec<f64>) -> Vec<(usize, Vec<f64>)> {
        self.tick += 1;
        self.slots.insert(
            index,
            CacheSlot {
                data,
                last_used: self.tick,
            },
        );

        let mut evicted = Vec::new();
        while self.slots.len() > self.capacity {
            let oldest = self
                .slots
                .iter()
                .min_by_key(|(_, slot)| slot.last_used)
                .map(|(index, _)| *index)
                .expect("cache over capacity implies a resident block");
            let slot = self.slots.remove(&oldest).expect("oldest key just seen");
            evicted.push((oldest, slot.data));
        }
        evicted
    }

    /// Empties the cache, yielding every buffer least recently used first.
    pub fn drain(&mut self) -> Vec<(usize, Vec<f64>)> {
        let mut entries: Vec<(usize, Vec<f64>, u64)> = self
            .slots
            .drain()
            .map(|(index, slot)| (index, slot.data, slot.last_used))
            .collect();
        entries.sort_by_key(|&(_, _, last_used)| last_used);
        entries
            .into_iter()
            .map(|(index, data, _)| (index, data))
            .collect()
    }
}

/// Pixel-addressable view over a tiled raster band larger than memory.
///
/// Block dimensions must be powers of two so the containing block and the
/// in-block offset of a pixel reduce to shifts and masks.  Blocks are cached
/// whole; dirty blocks are written back when evicted and when the raster is
/// closed.  Callers bounds-check: coordinates outside the raster are never
/// passed in.
pub struct ManagedRaster {
    path: PathBuf,
    band_index: isize,
    mode: RasterMode,
    dataset: Dataset,
    info: RasterInfo,
    block_xsize: usize,
    block_ysize: usize,
    block_xbits: u32,
    block_ybits: u32,
    blocks_per_row: usize,
    cache: BlockCache,
    dirty: HashSet<usize>,
    closed: bool,
}

impl ManagedRaster {
    pub fn open(band_ref: BandRef, mode: RasterMode) -> Result<ManagedRaster> {
        band_ref.validate()?;

        let dataset = match mode {
            RasterMode::Read => Dataset::open(band_ref.path)?,
            RasterMode::ReadWrite => open_for_update(band_ref.path)?,
        };
        let info = RasterInfo::from_dataset(&dataset, band_ref.band)?;

        let (block_xsize, block_ysize) = {
            let band = dataset.rasterband(band_ref.band)?;
            band.block_size()
        };
        if !block_xsize.is_power_of_two() || !block_ysize.is_power_of_two() {
            return Err(RoutingError::BadBlockGeometry {
                block_x: block_xsize,
                block_y: block_ysize,
                path: band_ref.path.to_path_buf(),
            }
            .into());
        }

        let blocks_per_row = num::Integer::div_ceil(&info.num_cols, &block_xsize);

        Ok(ManagedRaster {
            path: band_ref.path.to_path_buf(),
            band_index: band_ref.band,
            mode,
            dataset,
            info,
            block_xsize,
            block_ysize,
            block_xbits: block_xsize.trailing_zeros(),
            block_ybits: block_ysize.trailing_zeros(),
            blocks_per_row,
            cache: BlockCache::new(CACHE_BLOCK_CAPACITY),
            dirty: HashSet::new(),
            closed: false,
        })
    }

    pub fn info(&self) -> &RasterInfo {
        &self.info
    }

    pub fn num_cols(&self) -> i32 {
        self.info.num_cols as i32
    }

    pub fn num_rows(&self) -> i32 {
        self.info.num_rows as i32
    }

    pub fn block_xsize(&self) -> usize {
        self.block_xsize
    }

    pub fn block_ysize(&self) -> usize {
        self.block_ysize
    }

    pub fn nodata(&self) -> f64 {
        self.info.no_data_value
    }

    pub fn is_nodata(&self, value: f64) -> bool {
        is_nodata_f64(value, self.info.no_data_value)
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        self.info.contains_pixel(x, y)
    }

    /// Index of the block containing `(x, y)`, also the heap tiebreak.
    pub fn block_index(&self, x: i32, y: i32) -> usize {
        let block_x = (x as usize) >> self.block_xbits;
        let block_y = (y as usize) >> self.block_ybits;
        block_y * self.blocks_per_row + block_x
    }

    fn block_offset(&self, x: i32, y: i32) -> usize {
        let local_x = (x as usize) & (self.block_xsize - 1);
        let local_y = (y as usize) & (self.block_ysize - 1);
        (local_y << self.block_xbits) | local_x
    }

    pub fn get(&mut self, x: i32, y: i32) -> Result<f64> {
        debug_assert!(self.contains(x, y), "pixel ({}, {}) out of bounds", x, y);
        let index = self.block_index(x, y);
        if !self.cache.exists(index) {
            self.load_block(index)?;
        }
        let offset = self.block_offset(x, y);
        Ok(self.cache.get(index).expect("block resident after load")[offset])
    }

    pub fn set(&mut self, x: i32, y: i32, value: f64) -> Result<()> {
        assert!(
            self.mode == RasterMode::ReadWrite,
            "set on read-only raster {:?}",
            self.path
        );
        debug_assert!(self.contains(x, y), "pixel ({}, {}) out of bounds", x, y);
        let index = self.block_index(x, y);
        if !self.cache.exists(index) {
            self.load_block(index)?;
        }
        let offset = self.block_offset(x, y);
        self.cache.get(index).expect("block resident after load")[offset] = value;
        self.dirty.insert(index);
        Ok(())
    }

    /// Flushes every dirty block and releases the cache.  The raster is
    /// consumed; `Drop` does the same for rasters abandoned on error paths.
    pub fn close(mut self) -> Result<()> {
        self.flush_all()?;
        self.closed = true;
        Ok(())
    }

    fn window_of(&self, index: usize) -> (usize, usize, usize, usize) {
        let block_x = index % self.blocks_per_row;
        let block_y = index / self.blocks_per_row;
        let xoff = block_x << self.block_xbits;
        let yoff = block_y << self.block_ybits;
        let win_x = self.block_xsize.min(self.info.num_cols - xoff);
        let win_y = self.block_ysize.min(self.info.num_rows - yoff);
        (xoff, yoff, win_x, win_y)
    }

    fn load_block(&mut self, index: usize) -> Result<()> {
        let (xoff, yoff, win_x, win_y) = self.window_of(index);

        let read = {
            let band = self.dataset.rasterband(self.band_index)?;
            band.read_as::<f64>(
                (xoff as isize, yoff as isize),
                (win_x, win_y),
                (win_x, win_y),
                None,
            )?
        };

        // Embed the clipped window into a full-size block buffer.  The
        // padding slots are never read back: callers bounds-check.
        let mut data = vec![0.0f64; self.block_xsize * self.block_ysize];
        for row in 0..win_y {
            let src = row * win_x;
            let dst = row << self.block_xbits;
            data[dst..dst + win_x].copy_from_slice(&read.data[src..src + win_x]);
        }

        let evicted = self.cache.put(index, data);
        for (evicted_index, buffer) in evicted {
            if self.dirty.remove(&evicted_index) {
                self.flush_block(evicted_index, &buffer)?;
            }
        }
        Ok(())
    }

    fn flush_block(&self, index: usize, data: &[f64]) -> Result<()> {
        let (xoff, yoff, win_x, win_y) = self.window_of(index);

        // Only the valid sub-rectangle goes back to disk.
        let mut staging = Vec::with_capacity(win_x * win_y);
        for row in 0..win_y {
            let src = row << self.block_xbits;
            staging.extend_from_slice(&data[src..src + win_x]);
        }

        let mut band = self.dataset.rasterband(self.band_index)?;
        band.write(
            (xoff as isize, yoff as isize),
            (win_x, win_y),
            &Buffer::new((win_x, win_y), staging),
        )?;
        Ok(())
    }

    fn flush_all(&mut self) -> Result<()> {
        for (index, buffer) in self.cache.drain() {
            if self.dirty.remove(&index) {
                self.flush_block(index, &buffer)?;
            }
        }
        if self.mode == RasterMode::ReadWrite {
            self.dataset.flush_cache();
        }
        Ok(())
    }

    #[cfg(test)]
    fn cache_len(&self) -> usize {
        self.cache.len()
    }

    #[cfg(test)]
    fn dirty_blocks_resident(&self) -> bool {
        self.dirty.iter().all(|index| self.cache.exists(*index))
    }
}

impl Drop for ManagedRaster {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.flush_all() {
                warn!("failed to flush {:?} while dropping: {}", self.path, e);
            }
        }
    }
}

#[cfg(test)]
mod block_cache_tests {
    use super::*;

    #[test]
    fn test_capacity_bound() {
        let mut cache = BlockCache::new(3);
        for index in 0..10 {
            let evicted = cache.put(index, vec![index as f64]);
            assert!(cache.len() <= 3);
            if index < 3 {
                assert!(evicted.is_empty());
            } else {
                assert_eq!(1, evicted.len());
            }
        }
    }

    #[test]
    fn test_least_recently_used_leaves_first() {
        let mut cache = BlockCache::new(2);
        assert!(cache.put(0, vec![0.0]).is_empty());
        assert!(cache.put(1, vec![1.0]).is_empty());

        // touch 0 so 1 becomes the eviction candidate
        assert!(cache.get(0).is_some());

        let evicted = cache.put(2, vec![2.0]);
        assert_eq!(vec![1], evicted.iter().map(|e| e.0).collect::<Vec<_>>());
        assert!(cache.exists(0));
        assert!(cache.exists(2));
    }

    #[test]
    fn test_drain_in_recency_order() {
        let mut cache = BlockCache::new(4);
        cache.put(7, vec![]);
        cache.put(3, vec![]);
        cache.put(5, vec![]);
        cache.get(7);

        let order: Vec<usize> = cache.drain().into_iter().map(|e| e.0).collect();
        assert_eq!(vec![3, 5, 7], order);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_get_missing() {
        let mut cache = BlockCache::new(2);
        assert!(cache.get(42).is_none());
        assert!(!cache.exists(42));
    }
}

#[cfg(test)]
mod managed_raster_tests {
    use super::*;
    use crate::raster::test_util::{create_test_raster, test_raster_info};
    use gdal::raster::GdalDataType;

    #[test]
    fn test_round_trip_across_blocks() {
        // 300x300 raster spans a 2x2 grid of 256-blocks
        let info = test_raster_info(300, 300, GdalDataType::Float64, -9999.0);
        let data = vec![1.5f64; 300 * 300];
        let path = create_test_raster("managed_round_trip.tif", &info, &data).unwrap();

        let edits = [
            (0, 0, 10.0),
            (255, 255, 11.0),
            (256, 0, 12.0),
            (0, 256, 13.0),
            (299, 299, 14.0),
            (128, 290, 15.0),
        ];

        {
            let mut raster =
                ManagedRaster::open(BandRef::new(&path, 1), RasterMode::ReadWrite).unwrap();
            for &(x, y, value) in &edits {
                raster.set(x, y, value).unwrap();
            }
            // reads see the uncommitted writes
            for &(x, y, value) in &edits {
                assert_eq!(value, raster.get(x, y).unwrap());
            }
            assert!(raster.dirty_blocks_resident());
            raster.close().unwrap();
        }

        let mut reopened = ManagedRaster::open(BandRef::new(&path, 1), RasterMode::Read).unwrap();
        for &(x, y, value) in &edits {
            assert_eq!(value, reopened.get(x, y).unwrap());
        }
        assert_eq!(1.5, reopened.get(100, 100).unwrap());
        reopened.close().unwrap();

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_cache_never_exceeds_capacity() {
        // 2304x2048 has 72 blocks of 256x256, more than the cache holds;
        // walking one pixel per block twice churns through eviction
        let info = test_raster_info(2304, 2048, GdalDataType::Float32, -1.0);
        let path = crate::raster::test_util::temp_raster_path("managed_cache.tif");
        info.create_raster(&path, info.gdal_type, info.no_data_value, Some(-1.0))
            .unwrap();

        let mut raster = ManagedRaster::open(BandRef::new(&path, 1), RasterMode::Read).unwrap();
        for pass in 0..2 {
            for block_y in 0..8 {
                for block_x in 0..9 {
                    let x = block_x * 256;
                    let y = block_y * 256;
                    assert_eq!(-1.0, raster.get(x, y).unwrap(), "pass {}", pass);
                    assert!(raster.cache_len() <= CACHE_BLOCK_CAPACITY);
                }
            }
        }
        raster.close().unwrap();
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_dirty_block_survives_eviction() {
        // 2304 columns = 9 block columns; writing then reading 70 blocks
        // forces the dirty block out through the eviction path
        let info = test_raster_info(2304, 2048, GdalDataType::Float64, -9999.0);
        let path = crate::raster::test_util::temp_raster_path("managed_evict.tif");
        info.create_raster(&path, info.gdal_type, info.no_data_value, Some(0.0))
            .unwrap();

        {
            let mut raster =
                ManagedRaster::open(BandRef::new(&path, 1), RasterMode::ReadWrite).unwrap();
            raster.set(5, 5, 77.0).unwrap();
            for block_y in 0..8 {
                for block_x in 0..9 {
                    let _ = raster.get(block_x * 256, block_y * 256).unwrap();
                }
            }
            // the written block was evicted and flushed along the way
            assert!(raster.cache_len() <= CACHE_BLOCK_CAPACITY);
            raster.close().unwrap();
        }

        let mut reopened = ManagedRaster::open(BandRef::new(&path, 1), RasterMode::Read).unwrap();
        assert_eq!(77.0, reopened.get(5, 5).unwrap());
        reopened.close().unwrap();
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_set_on_read_only_panics() {
        let info = test_raster_info(16, 16, GdalDataType::Float64, -1.0);
        let data = vec![0.0f64; 256];
        let path = create_test_raster("managed_readonly.tif", &info, &data).unwrap();

        let mut raster = ManagedRaster::open(BandRef::new(&path, 1), RasterMode::Read).unwrap();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = raster.set(0, 0, 1.0);
        }));
        assert!(result.is_err());
        drop(raster);
        std::fs::remove_file(&path).unwrap();
    }
}
