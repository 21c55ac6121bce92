//! Optional monitoring collaborator interface.
//!
//! When metrics credentials are configured, the harness registers with a
//! remote scraper and refuses to start the timed workload until the scraper
//! has actually observed this process once. The registration protocol
//! itself is the client implementation's concern.

use async_trait::async_trait;

use crate::error::MetricsError;
use crate::key::{PublicKey, SecretKey};

/// Credentials and identity for the metrics client.
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Service name reported to the scraper.
    pub service_name: String,
    /// Alias distinguishing this process from others in the same service.
    pub alias: String,
    /// Shared secret authorizing registration.
    pub secret: SecretKey,
    /// Public key of the scraper to register with.
    pub scraper: PublicKey,
}

/// Client registering this process with a remote metrics scraper.
///
/// `ready` resolving means registered; it does not mean any scrape has
/// happened yet. `served` resolves only after the first successful scrape,
/// so callers that need a guaranteed external observation wait on both.
#[async_trait]
pub trait MetricsClient: Send + Sync {
    /// Resolves once the client is registered with the scraper.
    async fn ready(&self) -> Result<(), MetricsError>;

    /// Resolves once metrics have been served successfully at least once.
    async fn served(&self) -> Result<(), MetricsError>;

    /// Deregister and release the client.
    async fn close(&self) -> Result<(), MetricsError>;
}
