//! Parsers for scan and neighbor-table output.

use std::net::Ipv4Addr;

use crate::mac::HardwareAddress;

/// Find `target` in `arp-scan --plain` output (`ip<TAB>mac<TAB>vendor`).
#[must_use]
pub fn parse_arp_scan(output: &str, target: &HardwareAddress) -> Option<Ipv4Addr> {
    output.lines().find_map(|line| {
        let mut fields = line.split_whitespace();
        let ip = fields.next()?.parse::<Ipv4Addr>().ok()?;
        let mac = token_as_mac(fields.next()?)?;
        (mac == *target).then_some(ip)
    })
}

/// Find `target` in any neighbor-table listing.
///
/// Understands `/proc/net/arp`, `ip neigh show` and `arp -a` (BSD and Linux
/// flavours, including unpadded octets like `0:c:29:3e:5b:1`).
#[must_use]
pub fn parse_neighbor_table(output: &str, target: &HardwareAddress) -> Option<Ipv4Addr> {
    output.lines().find_map(|line| {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if !tokens.iter().any(|t| token_as_mac(t).as_ref() == Some(target)) {
            return None;
        }
        tokens.iter().find_map(|t| {
            t.trim_matches(|c| c == '(' || c == ')')
                .parse::<Ipv4Addr>()
                .ok()
        })
    })
}

fn token_as_mac(token: &str) -> Option<HardwareAddress> {
    if let Ok(mac) = HardwareAddress::parse(token) {
        return Some(mac);
    }
    // unpadded octets
    let parts: Vec<&str> = token.split(':').collect();
    if parts.len() != 6 || parts.iter().any(|p| p.is_empty() || p.len() > 2) {
        return None;
    }
    let padded: Vec<String> = parts.iter().map(|p| format!("{p:0>2}")).collect();
    HardwareAddress::parse(&padded.join(":")).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> HardwareAddress {
        HardwareAddress::parse("00:0C:29:3E:5B:01").unwrap()
    }

    #[test]
    fn test_arp_scan_plain_output() {
        let output = "192.168.1.1\t74:4d:28:aa:bb:cc\tRouterboard.com\n\
                      192.168.1.77\t00:0c:29:3e:5b:01\tVMware, Inc.\n";
        assert_eq!(
            parse_arp_scan(output, &target()),
            Some(Ipv4Addr::new(192, 168, 1, 77))
        );
        assert_eq!(parse_arp_scan("Interface: eth0\n", &target()), None);
    }

    #[test]
    fn test_proc_net_arp() {
        let output = "IP address       HW type     Flags       HW address            Mask     Device\n\
                      192.168.50.77    0x1         0x2         00:0c:29:3e:5b:01     *        eth0\n\
                      192.168.50.9     0x1         0x0         00:00:00:00:00:00     *        eth0\n";
        assert_eq!(
            parse_neighbor_table(output, &target()),
            Some(Ipv4Addr::new(192, 168, 50, 77))
        );
    }

    #[test]
    fn test_ip_neigh() {
        let output = "192.168.50.1 dev eth0 lladdr 74:4d:28:aa:bb:cc REACHABLE\n\
                      192.168.50.77 dev eth0 lladdr 00:0c:29:3e:5b:01 STALE\n\
                      fe80::1 dev eth0 lladdr 00:0c:29:3e:5b:01 router STALE\n";
        assert_eq!(
            parse_neighbor_table(output, &target()),
            Some(Ipv4Addr::new(192, 168, 50, 77))
        );
    }

    #[test]
    fn test_arp_a_flavours() {
        let linux = "? (192.168.50.77) at 00:0c:29:3e:5b:01 [ether] on eth0\n";
        let bsd = "? (192.168.50.78) at 0:c:29:3e:5b:1 on en0 ifscope [ethernet]\n";
        assert_eq!(
            parse_neighbor_table(linux, &target()),
            Some(Ipv4Addr::new(192, 168, 50, 77))
        );
        assert_eq!(
            parse_neighbor_table(bsd, &target()),
            Some(Ipv4Addr::new(192, 168, 50, 78))
        );
    }

    #[test]
    fn test_missing_device() {
        let output = "? (192.168.50.1) at 74:4d:28:aa:bb:cc [ether] on eth0\n";
        assert_eq!(parse_neighbor_table(output, &target()), None);
    }
}
