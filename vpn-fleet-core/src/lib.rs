pub mod helpers;
pub mod ip;
pub mod kubernetes;
pub mod peers;
pub mod resources;
pub mod wireguard;

pub const CONTROLLER_FIELD_MANAGER: &str = "vpn-fleet-controller";
