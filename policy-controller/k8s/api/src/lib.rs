#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod labels;

pub use self::labels::{Selection, SelectorError};
pub use k8s_openapi::{
    api::{
        self,
        core::v1::{
            Container, ContainerPort, Namespace, NamespaceSpec, Pod, PodSpec, PodStatus,
        },
        networking::v1::{
            IPBlock, NetworkPolicy, NetworkPolicyEgressRule, NetworkPolicyIngressRule,
            NetworkPolicyPeer, NetworkPolicyPort, NetworkPolicySpec,
        },
    },
    apimachinery::pkg::{
        apis::meta::v1::{LabelSelector, LabelSelectorRequirement, ObjectMeta, Time},
        util::intstr::IntOrString,
    },
};
pub use kube::ResourceExt;
