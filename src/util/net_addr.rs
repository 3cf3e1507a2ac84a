use std::net::Ipv4Addr;

/// Addresses starting with 0 or 255 are never valid peer addresses.
pub fn is_valid_ipv4(ip: Ipv4Addr) -> bool {
    !matches!(ip.octets()[0], 0 | 255)
}

pub fn is_valid_port(port: u16) -> bool {
    port != 0
}

/// Addresses that are not routable on the public internet: private ranges, loopback, link
///  local and `0.0.0.0/8`
pub fn is_private_ipv4(ip: Ipv4Addr) -> bool {
    ip.is_private() || ip.is_loopback() || ip.is_link_local() || ip.octets()[0] == 0
}
