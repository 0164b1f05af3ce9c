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
use std::fs::remove_file;
use std::path::PathBuf;

use anyhow::Result;
use hydro_routing::{distance_to_channel_d8, distance_to_channel_mfd, BandRef};
use structopt::StructOpt;

#[derive(StructOpt)]
pub struct DistanceArgs {
    #[structopt(long, parse(from_os_str))]
    pub flow_dir: PathBuf,

    #[structopt(long, default_value = "1")]
    pub flow_dir_band: isize,

    /// Byte mask raster, 1 on channel pixels
    #[structopt(long, parse(from_os_str))]
    pub channel: PathBuf,

    #[structopt(long, default_value = "1")]
    pub channel_band: isize,

    /// Optional per-step cost raster; geometric step lengths when omitted
    #[structopt(long, parse(from_os_str))]
    pub weight: Option<PathBuf>,

    #[structopt(long, default_value = "1")]
    pub weight_band: isize,

    #[structopt(long, parse(from_os_str))]
    pub output: PathBuf,

    #[structopt(long)]
    pub clean: bool,
}

impl DistanceArgs {
    fn prepare(&self) -> Result<bool> {
        if self.clean && self.output.exists() {
            remove_file(&self.output)?;
        }
        if self.output.exists() {
            println!(
                "{:?} already exists and --clean not passed, doing nothing",
                &self.output
            );
            return Ok(false);
        }
        Ok(true)
    }

    fn weight_ref(&self) -> Option<BandRef> {
        self.weight
            .as_ref()
            .map(|path| BandRef::new(path, self.weight_band))
    }
}

pub fn run_distance_d8(args: &DistanceArgs) -> Result<()> {
    if !args.prepare()? {
        return Ok(());
    }
    distance_to_channel_d8(
        BandRef::new(&args.flow_dir, args.flow_dir_band),
        BandRef::new(&args.channel, args.channel_band),
        &args.output,
        args.weight_ref(),
    )
}

pub fn run_distance_mfd(args: &DistanceArgs) -> Result<()> {
    if !args.prepare()? {
        return Ok(());
    }
    distance_to_channel_mfd(
        BandRef::new(&args.flow_dir, args.flow_dir_band),
        BandRef::new(&args.channel, args.channel_band),
        &args.output,
        args.weight_ref(),
    )
}
