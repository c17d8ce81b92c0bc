//! Network policy reconciler
//!
//! The index compiles `NetworkPolicy` resources into membership sets and ACL
//! rules and keeps the backend consistent as policies, pods and namespaces
//! change. It watches the following cluster resources:
//!
//! - Each `Namespace` is a member of the `all-namespaces` list set and of a
//!   namespace label set for each of its labels.
//! - Each running `Pod` contributes its IP to its namespace's set, to a pod
//!   label set for each of its labels, and to a named port set for each of
//!   its named container ports.
//! - Each `NetworkPolicy` is compiled and merged with the other policies in
//!   its namespace that select the same pods. When a policy changes, the
//!   merged result is recompiled and only the difference is sent to the
//!   backend.
//!
//! ```text
//! [ Pod ] -> [ ns-*, podlabel-*, namedport:* ] <- [ AclRule ] <- [ NetworkPolicy ]
//!                         ^
//! [ Namespace ] -> [ all-namespaces, nslabel-* ]
//! ```
//!
//! Sets are created when first used, either by a member or by a rule, and are
//! deleted once they are neither populated nor referenced. Shared backend
//! infrastructure is installed with the first rule and removed when no policy
//! remains in any namespace.

#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

mod cluster_info;
mod compile;
mod index;
pub mod metrics;
mod namespace;
mod network_policy;
pub mod pod;
mod sets;


pub use self::{
    cluster_info::ClusterInfo,
    compile::{compile, CompileError},
    index::{Index, SharedIndex},
};
