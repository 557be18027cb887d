//
// Copyright 2024 The ImageGate Authors.
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

//! Image verification engine for Kubernetes admission policies.
//!
//! Given a [`policy::Policy`] and a workload resource under admission, the
//! engine inspects the container images the resource references, verifies
//! their signatures and attestations against the policy's trust
//! configurations through a pluggable [`registry::RegistryClient`], and
//! returns a structured verdict per rule. Rules that pin digests produce
//! JSON patches targeting each image's location in the resource.
//!
//! ```no_run
//! use imagegate::{verify_and_patch_images, PolicyContext};
//! use imagegate::policy::Policy;
//! use imagegate::resource::Resource;
//! # async fn run(client: &dyn imagegate::registry::RegistryClient, policy: Policy, resource: Resource) {
//! let cancel = tokio_util::sync::CancellationToken::new();
//! let mut ctx = PolicyContext::new(policy, resource, None);
//! let (response, metadata) = verify_and_patch_images(&cancel, client, &mut ctx).await;
//! if response.is_successful() {
//!     let patches = response.patches();
//!     let annotation_patches = metadata.annotation_patches(&ctx.new_resource);
//! }
//! # }
//! ```

pub mod context;
pub mod engine;
pub mod errors;
pub mod images;
pub mod policy;
pub mod registry;
pub mod resource;
pub mod variables;

mod mock_client;
mod wildcard;

pub use engine::{
    is_image_verified, verify_and_patch_images, EngineResponse, ImageVerificationMetadata,
    PolicyContext, RuleResponse, RuleStatus, RuleType, IMAGE_VERIFY_ANNOTATION,
};
pub use errors::{ImageGateError, Result};
