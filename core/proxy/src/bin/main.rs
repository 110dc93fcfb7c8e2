// Copyright AGNTCY Contributors (https://github.com/agntcy)
// SPDX-License-Identifier: Apache-2.0

use clap::Parser;

use slim_grpc_proxy::args;
use slim_grpc_proxy::build_info;
use slim_grpc_proxy::runner;

fn main() {
    let args = args::Args::parse();

    // If the version flag is set, print the build info and exit
    if args.version() {
        println!("{}", build_info::BUILD_INFO);
        return;
    }

    let Some(config_file) = args.config() else {
        eprintln!("a configuration file is required (--config)");
        std::process::exit(2);
    };

    if let Err(e) = runner::run(config_file) {
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}
