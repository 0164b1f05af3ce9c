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

/// Iterates the block-aligned windows of a raster in row-major block order.
/// Edge windows are clipped to the raster bound.
pub struct BlockWindowIterator {
    num_cols: usize,
    num_rows: usize,
    block_x: usize,
    block_y: usize,
    num_block_cols: usize,
    num_steps: usize,
    cur_step: usize,
}

#[derive(Debug)]
pub struct BlockWindow {
    //X, Y  or column, row order
    pub xoff: i32,
    pub yoff: i32,
    pub win_x: i32,
    pub win_y: i32,

    pub current_step: usize,
    pub num_steps: usize,
}

impl BlockWindowIterator {
    pub fn new(num_cols: usize, num_rows: usize, block_x: usize, block_y: usize) -> Self {
        assert!(num_cols > 0);
        assert!(num_rows > 0);
        assert!(block_x > 0);
        assert!(block_y > 0);

        let num_block_cols = num::Integer::div_ceil(&num_cols, &block_x);
        let num_block_rows = num::Integer::div_ceil(&num_rows, &block_y);

        Self {
            num_cols,
            num_rows,
            block_x,
            block_y,
            num_block_cols,
            num_steps: num_block_cols * num_block_rows,
            cur_step: 0,
        }
    }
}

impl Iterator for BlockWindowIterator {
    type Item = BlockWindow;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cur_step >= self.num_steps {
            return None;
        }

        let block_col = self.cur_step % self.num_block_cols;
        let block_row = self.cur_step / self.num_block_cols;

        let xoff = block_col * self.block_x;
        let yoff = block_row * self.block_y;
        let win_x = self.block_x.min(self.num_cols - xoff);
        let win_y = self.block_y.min(self.num_rows - yoff);

        let r = Some(BlockWindow {
            xoff: xoff as i32,
            yoff: yoff as i32,
            win_x: win_x as i32,
            win_y: win_y as i32,
            current_step: self.cur_step,
            num_steps: self.num_steps,
        });

        self.cur_step += 1;

        r
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let l = self.num_steps - self.cur_step;
        (l, Some(l))
    }
}

impl ExactSizeIterator for BlockWindowIterator {}
