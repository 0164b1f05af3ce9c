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
use anyhow::Result;
use log::LevelFilter;
use simple_logger::SimpleLogger;
use structopt::StructOpt;

use crate::cmd_distance::{run_distance_d8, run_distance_mfd, DistanceArgs};
use crate::cmd_fill_pits::{run_fill_pits, FillPitsArgs};
use crate::cmd_flow_accum::{run_flow_accum_d8, run_flow_accum_mfd, FlowAccumArgs};
use crate::cmd_flow_dir::{run_flow_dir_d8, run_flow_dir_mfd, FlowDirArgs};
use crate::cmd_watersheds::{run_watersheds, WatershedArgs};

mod cmd_distance;
mod cmd_fill_pits;
mod cmd_flow_accum;
mod cmd_flow_dir;
mod cmd_watersheds;

#[derive(StructOpt)]
struct Cli {
    #[structopt(long, default_value = "Info")]
    log_level: LevelFilter,

    #[structopt(subcommand)]
    cmd: Command,
}

#[derive(StructOpt)]
enum Command {
    #[structopt(help = "Raises every undrained depression of a DEM to its pour height")]
    FillPits(FillPitsArgs),

    #[structopt(help = "Single flow directions (D8) from a pit-filled DEM")]
    FlowDirD8(FlowDirArgs),
    #[structopt(help = "Multiple flow directions (MFD) from a pit-filled DEM")]
    FlowDirMfd(FlowDirArgs),

    #[structopt(help = "Weighted upstream accumulation over a D8 flow raster")]
    FlowAccumD8(FlowAccumArgs),
    #[structopt(help = "Weighted upstream accumulation over an MFD flow raster")]
    FlowAccumMfd(FlowAccumArgs),

    #[structopt(help = "Downstream flow length to a channel mask, D8")]
    DistanceToChannelD8(DistanceArgs),
    #[structopt(help = "Downstream flow length to a channel mask, MFD")]
    DistanceToChannelMfd(DistanceArgs),

    #[structopt(help = "Watershed fragment polygons for a set of outflow points")]
    DelineateWatersheds(WatershedArgs),
}

fn run() -> Result<()> {
    let args = Cli::from_args();

    SimpleLogger::new().with_level(args.log_level).init()?;

    match &args.cmd {
        Command::FillPits(r) => {
            run_fill_pits(r)?;
        }
        Command::FlowDirD8(r) => {
            run_flow_dir_d8(r)?;
        }
        Command::FlowDirMfd(r) => {
            run_flow_dir_mfd(r)?;
        }
        Command::FlowAccumD8(r) => {
            run_flow_accum_d8(r)?;
        }
        Command::FlowAccumMfd(r) => {
            run_flow_accum_mfd(r)?;
        }
        Command::DistanceToChannelD8(r) => {
            run_distance_d8(r)?;
        }
        Command::DistanceToChannelMfd(r) => {
            run_distance_mfd(r)?;
        }
        Command::DelineateWatersheds(r) => {
            run_watersheds(r)?;
        }
    }

    Ok(())
}

fn main() {
    run().unwrap();
}
