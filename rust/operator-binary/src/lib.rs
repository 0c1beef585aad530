//! Declarative management of TLS certificates materialized as Kubernetes `Secret`s
//!
//! Other controllers declare the [`crd::Certificate`]s they need through a
//! [`controller::CertificateManagerHandle`], and the [`manager::CertificateManager`] keeps a
//! `Secret` of the same name holding matching key material.

pub mod context;
pub mod controller;
pub mod crd;
pub mod hosts;
pub mod manager;
pub mod material;
pub mod owner;
pub mod store;
pub mod utils;
pub mod validate;
pub mod watch;
