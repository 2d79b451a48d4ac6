use async_trait::async_trait;
use nostr::Event;

/// Signature check run before a message is admitted.
///
/// Async because the check may be delegated (hardware, worker, remote signer).
#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(&self, event: &Event) -> bool;
}

/// Recomputes the id hash and checks the Schnorr signature.
#[derive(Debug, Default, Clone, Copy)]
pub struct SchnorrVerifier;

#[async_trait]
impl Verifier for SchnorrVerifier {
    async fn verify(&self, event: &Event) -> bool {
        match event.verify() {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!(%e, id = %event.id, "signature check failed");
                false
            }
        }
    }
}

/// Accepts everything. Only for replaying a store this process wrote itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct TrustAll;

#[async_trait]
impl Verifier for TrustAll {
    async fn verify(&self, _event: &Event) -> bool {
        true
    }
}
