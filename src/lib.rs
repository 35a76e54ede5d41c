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

// We have both a lib.rs and main.rs to make writing integration tests possible.
// The integration tests compile to a separate program using this cedana library.

pub mod archive;
pub mod cli;
pub mod config;
pub mod consts;
pub mod container;
pub mod criu;
pub mod daemon;
pub mod docker;
pub mod dump;
pub mod error;
pub mod fds;
pub mod logger;
pub mod manifest;
pub mod metrics;
pub mod process;
pub mod restore;
pub mod runc;
pub mod service;
pub mod storage;
pub mod util;

#[macro_use]
extern crate anyhow;
#[macro_use]
extern crate log;
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate serde_json;
