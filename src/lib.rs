//! A client for the [OCI Distribution Specification](https://github.com/opencontainers/distribution-spec):
//! push, pull, copy, and manage container images and arbitrary artifacts
//! against OCI-conformant registries, and against a local [OCI image
//! layout](https://github.com/opencontainers/image-spec/blob/main/image-layout.md)
//! directory.
//!
//! The crate is organized around three cooperating subsystems:
//!
//! - the content-addressable store model ([`manifest`]), built on digests
//!   ([`digest`]);
//! - the distribution protocol engine ([`client`], [`http`], [`secrets`],
//!   [`scope`], [`token_cache`]);
//! - the on-disk OCI image layout store ([`layout`]), which mirrors the same
//!   model and is both a source and a sink for [`client::Client::copy`].
//!
//! [`reference`] and [`registries`] round out the surface: reference parsing
//! and registries.conf-style configuration, respectively. [`archive`] packs
//! and unpacks tar+gzip layers against a plain directory tree.

pub mod archive;
pub mod client;
pub mod digest;
pub mod errors;
pub mod http;
pub mod layout;
pub mod manifest;
pub mod reference;
pub mod registries;
pub mod scope;
pub mod secrets;
mod token_cache;

pub use client::Client;
pub use errors::{NotFoundKind, OciDistributionError};
pub use http::{ClientConfig, ClientProtocol};
pub use layout::OciLayoutStore;
pub use manifest::{Config, Layer, OciDescriptor, OciIndex, OciManifest};
pub use reference::{ContainerRef, LayoutRef};
pub use registries::RegistriesConfig;
pub use secrets::{AuthProvider, RegistryAuth};
