//! # Network-Server Client Seam
//!
//! The orchestrator never speaks a network-server wire protocol itself. The
//! embedding service provides a [`ClientFactory`] that turns an [`Endpoint`]
//! into a live [`NetworkServerClient`]; everything else in this crate works
//! against the trait.
//!
//! ```text
//! Endpoint { server, certs } ──ClientFactory::connect──► Arc<dyn NetworkServerClient>
//! ```

use async_trait::async_trait;
use fuota_core::{DevEui, NetworkServer, NsMulticastGroup};
use std::sync::Arc;

use crate::error::NsResult;

/// CA certificate, client certificate and client key used for mutual TLS.
///
/// Empty strings mean "no TLS" for that part.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct CertificateTriple {
    pub ca_cert: String,
    pub tls_cert: String,
    pub tls_key: String,
}

impl CertificateTriple {
    pub fn is_tls(&self) -> bool {
        !self.ca_cert.is_empty() || !self.tls_cert.is_empty()
    }
}

/// Address and credentials of one network server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    /// `host:port` of the network-server API.
    pub server: String,
    pub certs: CertificateTriple,
}

impl From<&NetworkServer> for Endpoint {
    fn from(ns: &NetworkServer) -> Self {
        Endpoint {
            server: ns.server.clone(),
            certs: CertificateTriple {
                ca_cert: ns.ca_cert.clone(),
                tls_cert: ns.tls_cert.clone(),
                tls_key: ns.tls_key.clone(),
            },
        }
    }
}

/// Multicast-group operations exposed by a network server.
///
/// Implementations map remote "not found" answers to
/// [`NsError::RemoteNotFound`](crate::NsError::RemoteNotFound) and other
/// failures to [`NsError::Rpc`](crate::NsError::Rpc).
#[async_trait]
pub trait NetworkServerClient: Send + Sync {
    /// Creates the group and returns the id the server assigned.
    async fn create_multicast_group(&self, group: &NsMulticastGroup) -> NsResult<String>;

    async fn get_multicast_group(&self, id: &str) -> NsResult<NsMulticastGroup>;

    async fn update_multicast_group(&self, group: &NsMulticastGroup) -> NsResult<()>;

    async fn delete_multicast_group(&self, id: &str) -> NsResult<()>;

    async fn add_device_to_multicast_group(&self, group_id: &str, dev_eui: &DevEui)
        -> NsResult<()>;

    async fn remove_device_from_multicast_group(
        &self,
        group_id: &str,
        dev_eui: &DevEui,
    ) -> NsResult<()>;
}

/// Builds clients for endpoints.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> NsResult<Arc<dyn NetworkServerClient>>;
}
