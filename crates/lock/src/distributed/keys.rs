// Copyright 2024 RustFS Team
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

/// Store key layout of the distributed locks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockKeys {
    prefix: String,
}

impl LockKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    pub fn mutex(&self, key: &str) -> String {
        format!("{}mutex:{}", self.prefix, key)
    }

    pub fn group_read(&self, group: &str) -> String {
        format!("{}read:{}", self.prefix, group)
    }

    pub fn group_write(&self, group: &str) -> String {
        format!("{}write:{}", self.prefix, group)
    }

    pub fn row_read(&self, group: &str, id: &str) -> String {
        format!("{}read:{}:{}", self.prefix, group, id)
    }

    pub fn row_write(&self, group: &str, id: &str) -> String {
        format!("{}write:{}:{}", self.prefix, group, id)
    }
}
