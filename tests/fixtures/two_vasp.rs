//! Two-VASP test fixture.
//!
//! Wires two connection managers to one in-process [`MemoryHub`] and
//! publishes each side's transport, signing, and message keys in a
//! shared [`StaticRegistry`], so tests can run the full
//! invite/accept/transfer flow without any network.

use openvasp_core::config::ProtocolConfig;
use openvasp_core::connection::{ConnectionManager, InboundMessage};
use openvasp_core::delivery::DeliveryFailure;
use openvasp_core::registry::{RegistryEntry, StaticRegistry};
use openvasp_core::transport::{MemoryHub, MemoryTransport};
use openvasp_core::types::VaspCode;
use openvasp_crypto::secp256k1::KeyPair;
use openvasp_crypto::SigningKey;
use rand_core::OsRng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

/// How long a test waits for an expected inbound message
const RECV_TIMEOUT: Duration = Duration::from_secs(3);

/// One VASP endpoint under test
pub struct VaspSide {
    /// Identity code
    pub code: VaspCode,
    /// The connection manager, with its background tasks running
    pub manager: Arc<ConnectionManager<MemoryTransport, StaticRegistry>>,
    /// Decrypted application payload stream
    pub inbound: mpsc::UnboundedReceiver<InboundMessage>,
    /// Delivery failure stream
    pub failures: mpsc::UnboundedReceiver<DeliveryFailure>,
    /// Registry message key pair (the secret half stays local)
    pub message_keys: KeyPair,
    signing_secret: [u8; 32],
}

impl VaspSide {
    /// A fresh handle to this side's signing key
    #[must_use]
    pub fn signing_key(&self) -> SigningKey {
        SigningKey::from_secret_bytes(&self.signing_secret)
            .expect("stored signing secret is valid")
    }

    /// Wait for the next inbound application payload.
    ///
    /// # Panics
    ///
    /// Panics if nothing arrives within the fixture timeout.
    pub async fn next_inbound(&mut self) -> InboundMessage {
        timeout(RECV_TIMEOUT, self.inbound.recv())
            .await
            .expect("timed out waiting for an inbound message")
            .expect("inbound channel closed")
    }

    /// Wait for the next delivery failure.
    ///
    /// # Panics
    ///
    /// Panics if nothing arrives within the fixture timeout.
    pub async fn next_failure(&mut self) -> DeliveryFailure {
        timeout(RECV_TIMEOUT, self.failures.recv())
            .await
            .expect("timed out waiting for a delivery failure")
            .expect("failure channel closed")
    }
}

/// A hub, a shared registry, and two fully wired VASP endpoints
pub struct TwoVaspFixture {
    /// The originator side
    pub originator: VaspSide,
    /// The beneficiary side
    pub beneficiary: VaspSide,
    /// The registry both managers consult
    pub registry: Arc<StaticRegistry>,
}

impl TwoVaspFixture {
    /// Build a fixture with fast test timings.
    ///
    /// Must be called inside a tokio runtime: the managers spawn their
    /// poll loops immediately.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(Self::fast_config())
    }

    /// Build a fixture with a custom protocol config
    #[must_use]
    pub fn with_config(config: ProtocolConfig) -> Self {
        crate::init_tracing();
        let hub = MemoryHub::new();
        let originator_code = VaspCode::from_bytes([0x0a, 0x0a, 0x0a, 0x0a, 0x00, 0x01]);
        let beneficiary_code = VaspCode::from_bytes([0x0b, 0x0b, 0x0b, 0x0b, 0x00, 0x02]);

        let mut registry = StaticRegistry::new();
        let originator_keys = SideKeys::generate();
        let beneficiary_keys = SideKeys::generate();
        registry.insert(originator_code, originator_keys.registry_entry());
        registry.insert(beneficiary_code, beneficiary_keys.registry_entry());
        let registry = Arc::new(registry);

        let originator = Self::side(
            originator_code,
            &hub,
            registry.clone(),
            config.clone(),
            originator_keys,
        );
        let beneficiary = Self::side(
            beneficiary_code,
            &hub,
            registry.clone(),
            config,
            beneficiary_keys,
        );

        Self {
            originator,
            beneficiary,
            registry,
        }
    }

    /// Polling and retry intervals suitable for tests
    #[must_use]
    pub fn fast_config() -> ProtocolConfig {
        ProtocolConfig {
            envelope_expiry: Duration::from_millis(100),
            max_envelope_resends: 3,
            tick_interval: Duration::from_millis(10),
            ..ProtocolConfig::default()
        }
    }

    fn side(
        code: VaspCode,
        hub: &Arc<MemoryHub>,
        registry: Arc<StaticRegistry>,
        config: ProtocolConfig,
        keys: SideKeys,
    ) -> VaspSide {
        let transport = Arc::new(MemoryTransport::new(hub.clone()));
        let (manager, inbound, failures) =
            ConnectionManager::start(code, transport, registry, config);
        VaspSide {
            code,
            manager,
            inbound,
            failures,
            message_keys: keys.message,
            signing_secret: keys.signing_secret,
        }
    }
}

impl Default for TwoVaspFixture {
    fn default() -> Self {
        Self::new()
    }
}

struct SideKeys {
    transport: KeyPair,
    message: KeyPair,
    signing_secret: [u8; 32],
}

impl SideKeys {
    fn generate() -> Self {
        // Keep the signing key as raw scalar bytes so tests can mint
        // fresh SigningKey handles on demand.
        let signing_secret = KeyPair::generate(&mut OsRng).to_secret_bytes();
        Self {
            transport: KeyPair::generate(&mut OsRng),
            message: KeyPair::generate(&mut OsRng),
            signing_secret,
        }
    }

    fn registry_entry(&self) -> RegistryEntry {
        let signing = SigningKey::from_secret_bytes(&self.signing_secret)
            .expect("generated secret is valid");
        RegistryEntry {
            transport_key: Some(hex::encode(self.transport.public_key().to_compressed())),
            signing_key: Some(hex::encode(signing.verifying_key().to_compressed())),
            message_key: Some(hex::encode(self.message.public_key().to_compressed())),
        }
    }
}
