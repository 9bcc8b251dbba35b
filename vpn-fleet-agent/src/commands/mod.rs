pub mod claim_peer;
pub mod crds;
pub mod list_peers;
