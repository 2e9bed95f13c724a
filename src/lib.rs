/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

pub mod clap_args;
pub mod cluster;
pub mod config;
pub mod executor;
pub mod governor;
pub mod images;
pub mod orchestrator;
pub mod outcome;
pub mod platform;
pub mod report;
pub mod results;
pub mod runtime;
pub mod scenario;
pub mod slots;
