use anyhow::{bail, Result};
use clap::Parser;
use cli::AppOptions;
use human_panic::setup_panic;
use log::{debug, error};
use std::process::ExitCode;
use surfeltree_common::preprocess::descriptor::MIB;

mod cli;
mod commands;

fn run(args: AppOptions) -> Result<()> {
    let buffer_size = args.build.buffer_size.max(20) * MIB;
    let mut input = args.user_input;
    if args.merge {
        let [dir, input_type, output] = &input[..] else {
            bail!("Merge mode needs an input directory, an input type and an output file.");
        };
        let input_type = input_type.to_string_lossy();
        commands::merge::merge(dir, &input_type, output, buffer_size)
    } else if args.convert {
        let [source, target] = &input[..] else {
            bail!("Conversion mode needs an input and an output file.");
        };
        commands::convert::convert(source, target, buffer_size)
    } else {
        if input.len() != 1 {
            bail!("Build mode needs exactly one input file.");
        }
        commands::build::build(input.remove(0), args.build)
    }
}

fn main() -> ExitCode {
    setup_panic!();

    // arg parsing
    let args = AppOptions::parse();

    // logger
    simple_logger::init_with_level(args.log_level).unwrap();

    // run
    if let Err(e) = run(args) {
        error!("{e}");
        debug!("{e:?}");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
