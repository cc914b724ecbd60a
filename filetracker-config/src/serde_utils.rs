// Copyright 2022 The Turbo Cache Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! `serde(with = ...)` helpers that shell-expand string fields on
//! deserialization, so config files can use `$HOME` and friends.

use serde::{Deserialize, Deserializer};

pub fn convert_string_with_shellexpand<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    Ok(shellexpand::full(&raw)
        .map(|expanded| expanded.into_owned())
        .unwrap_or(raw))
}

pub fn convert_optional_string_with_shellexpand<'de, D>(
    deserializer: D,
) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.map(|raw| {
        shellexpand::full(&raw)
            .map(|expanded| expanded.into_owned())
            .unwrap_or(raw)
    }))
}
