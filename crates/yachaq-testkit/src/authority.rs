//! Policy authority simulator

use yachaq_consent::{DataRequest, PolicyStamp};
use yachaq_core::Effects;
use yachaq_crypto::{PublicKey, SigningIdentity};

/// Stamps requests the way the coordinator's policy service would
pub struct PolicyAuthority {
    identity: SigningIdentity,
    effects: Effects,
}

impl PolicyAuthority {
    /// Authority with a fresh key
    pub fn new(effects: &Effects) -> Self {
        Self {
            identity: SigningIdentity::generate(effects),
            effects: effects.clone(),
        }
    }

    /// Key the inbox must trust
    pub fn public_key(&self) -> PublicKey {
        self.identity.public_key()
    }

    /// Attach a stamp issued now
    pub fn stamp(&self, request: DataRequest) -> DataRequest {
        let stamp = PolicyStamp::issue(&self.identity, &request.body, self.effects.now_ms())
            .expect("issue policy stamp");
        request.with_stamp(stamp)
    }
}

impl std::fmt::Debug for PolicyAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyAuthority")
            .field("key", &self.public_key().fingerprint())
            .finish_non_exhaustive()
    }
}
