// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Compute providers

use crate::typed_uuid::ProviderUuid;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Parameters for creating a new provider record.
#[derive(Clone, Debug)]
pub struct ProviderCreate {
    pub name: String,
    pub hostname: String,
    pub driver: String,
    pub driver_options: BTreeMap<String, String>,
}

/// A compute backend that hosts nodes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provider {
    pub id: ProviderUuid,
    pub name: String,
    /// Endpoint of the provider's container engine API.
    pub hostname: String,
    /// Machine driver used to create hosts (`generic`, `amazonec2`, ...).
    pub driver: String,
    /// Driver-specific `--<driver>-<key> <value>` options.
    #[serde(default)]
    pub driver_options: BTreeMap<String, String>,
    pub time_created: DateTime<Utc>,
}

impl Provider {
    pub fn new(params: ProviderCreate) -> Self {
        Provider {
            id: ProviderUuid::new_v4(),
            name: params.name,
            hostname: params.hostname,
            driver: params.driver,
            driver_options: params.driver_options,
            time_created: Utc::now(),
        }
    }

    /// Command-line arguments selecting this provider's machine driver.
    pub fn driver_args(&self) -> Vec<String> {
        let mut args = vec!["--driver".to_string(), self.driver.clone()];
        for (key, value) in &self.driver_options {
            args.push(format!("--{}-{}", self.driver, key));
            args.push(value.clone());
        }
        args
    }
}
