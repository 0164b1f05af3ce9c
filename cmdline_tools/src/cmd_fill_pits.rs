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
use hydro_routing::{fill_pits, BandRef};
use structopt::StructOpt;

#[derive(StructOpt)]
pub struct FillPitsArgs {
    #[structopt(long, parse(from_os_str))]
    pub dem: PathBuf,

    #[structopt(long, default_value = "1")]
    pub dem_band: isize,

    #[structopt(long, parse(from_os_str))]
    pub output: PathBuf,

    #[structopt(long)]
    pub clean: bool,
}

pub fn run_fill_pits(args: &FillPitsArgs) -> Result<()> {
    if args.clean && args.output.exists() {
        remove_file(&args.output)?;
    }

    if args.output.exists() {
        println!(
            "{:?} already exists and --clean not passed, doing nothing",
            &args.output
        );
        return Ok(());
    }

    fill_pits(BandRef::new(&args.dem, args.dem_band), &args.output)
}
