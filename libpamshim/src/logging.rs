// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::io;

use tracing_subscriber::EnvFilter;

use crate::config::ShimConfig;

/// Installs a `tracing_subscriber::fmt` subscriber writing to standard
/// error, unless the embedding application already set a global default.
///
/// The client library is linked into an arbitrary host application that
/// may have its own `tracing` stack; forcing ours on top of it would
/// either panic (double `set_global_default`) or silently steal its
/// output. `try_init` reports failure instead of panicking, and we ignore
/// that failure deliberately: a subscriber already being installed is the
/// expected, common case when we're linked as `libpam.so` into a larger
/// program.
pub fn init_subscriber(config: &ShimConfig) {
    let filter = EnvFilter::try_new(&config.log_filter)
        .unwrap_or_else(|_| EnvFilter::new(crate::consts::DEFAULT_LOG_FILTER));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}
