//  Copyright 2020 Two Sigma Investments, LP.
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

use anyhow::Result;
use structopt::StructOpt;

use cedana::{
    consts::*,
    cli::{self, ExitCode, CLI},
};

fn main() {
    fn do_main() -> Result<()> {
        // START_TIME is used for logging purposes
        lazy_static::initialize(&START_TIME);

        let opts = cli::Opts::from_args();
        opts.init_logger()?;
        opts.run()
    }

    if let Err(e) = do_main() {
        log::error!("{:#}", e);
        std::process::exit(ExitCode::from_error(&e) as i32);
    }
}
