// Copyright 2024 MaidSafe.net limited.
//
// This SAFE Network Software is licensed to you under The General Public License (GPL), version 3.
// Unless required by applicable law or agreed to in writing, the SAFE Network Software distributed
// under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied. Please review the Licences for the specific language governing
// permissions and limitations relating to use of the SAFE Network Software.

//! Node assembly: the overlay engine plus the user-facing HTTP gateway.

#[macro_use]
extern crate tracing;

/// The HTTP gateway.
pub mod gateway;
/// Node identity persistence.
pub mod identity;
/// Builder and runner.
pub mod node;

pub use gateway::GatewayHandle;
pub use node::{NodeBuilder, RunningNode};
