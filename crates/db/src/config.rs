// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Page budget shared by every table heap and index file.
    pub cache_size_bytes: usize,
    /// Private page budget of the structure file.
    pub structure_cache_bytes: usize,
    /// Run scheduled rebuild/defragment passes as part of opening.
    pub repair_on_open: bool,
    /// Fraction of dead slots above which maintenance defragments a table heap.
    pub defragment_wasted_ratio: f64,
    /// Free-form build identifier stamped into the structure file.
    pub build_tag: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            cache_size_bytes: 16 * 1024 * 1024,
            structure_cache_bytes: 64 * 1024,
            repair_on_open: true,
            defragment_wasted_ratio: 0.3,
            build_tag: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
