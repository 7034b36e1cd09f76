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

//! Entry point for the disposable per-session server. Never invoked
//! directly by a user; `libpamshim` forks and execs this binary, wiring
//! its stdin/stdout to the session's pipe pair.

use libpamshim::ShimConfig;

fn main() {
    let config = ShimConfig::from_env();
    libpamshim::init_subscriber(&config);

    let code = libpamshim::server::run();
    std::process::exit(code);
}
