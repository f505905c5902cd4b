use std::net::Ipv4Addr;
use std::str::FromStr;

use ipnetwork::Ipv4Network;

use crate::error::{ResourceError, Result};

const VLAN_MAX: u32 = 4095;
const VXLAN_MAX: u32 = 65535;
const VXLAN_MAX_SPAN: u32 = 16000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagRange {
    pub min: u32,
    pub max: u32,
}

fn invalid(msg: String) -> ResourceError {
    ResourceError::InvalidConfig(msg)
}

/// Parses `"10-50,70-100"` style tag ranges. An empty string yields the
/// single `{0, 0}` range. VXLAN accepts only one range.
pub fn parse_tag_ranges(ranges: &str, tag_type: &str) -> Result<Vec<TagRange>> {
    if ranges.is_empty() {
        return Ok(vec![TagRange { min: 0, max: 0 }]);
    }
    if tag_type != "vlan" && tag_type != "vxlan" {
        return Err(invalid(format!("invalid tag type {tag_type}")));
    }

    let parts: Vec<&str> = ranges.split(',').collect();
    if parts.len() > 1 && tag_type == "vxlan" {
        return Err(invalid("do not support more than 2 vxlan tag ranges".into()));
    }

    let mut out = Vec::with_capacity(parts.len());
    for part in parts {
        let part = part.trim();
        let nums: Vec<&str> = part.split('-').map(str::trim).collect();
        if nums.len() > 2 {
            return Err(invalid(format!(
                "invalid tags {part}, correct '10-50,70-100'"
            )));
        }
        let parse = |s: &str| {
            s.parse::<u32>()
                .map_err(|e| invalid(format!("invalid integer '{s}' conversion error '{e}'")))
        };
        let min = parse(nums[0])?;
        let max = match nums.get(1) {
            Some(s) => parse(s)?,
            None => min,
        };

        if min > max {
            return Err(invalid(format!(
                "invalid range {part}, min is greater than max"
            )));
        }
        if min < 1 {
            return Err(invalid(format!("invalid range {part}, values less than 1")));
        }
        if tag_type == "vlan" && max > VLAN_MAX {
            return Err(invalid(format!(
                "invalid range {part}, vlan values exceed {VLAN_MAX} max allowed"
            )));
        }
        if tag_type == "vxlan" && max > VXLAN_MAX {
            return Err(invalid(format!(
                "invalid range {part}, vxlan values exceed {VXLAN_MAX} max allowed"
            )));
        }
        if tag_type == "vxlan" && max - min > VXLAN_MAX_SPAN {
            return Err(invalid(format!(
                "does not allow vxlan range to exceed {VXLAN_MAX_SPAN} range {part}"
            )));
        }
        out.push(TagRange { min, max });
    }
    Ok(out)
}

/// Splits `"a.b.c.d/len"` into address and prefix length.
pub fn parse_cidr(cidr: &str) -> Result<(Ipv4Addr, u32)> {
    if !cidr.contains('/') {
        return Err(invalid(format!("invalid cidr format {cidr:?}")));
    }
    let net = Ipv4Network::from_str(cidr)
        .map_err(|e| invalid(format!("invalid cidr {cidr:?}: {e}")))?;
    Ok((net.ip(), net.prefix() as u32))
}

fn check_lengths(subnet_len: u32, alloc_len: u32) -> Result<()> {
    if !(8..=32).contains(&subnet_len) {
        return Err(invalid(format!("subnet length {subnet_len} not supported")));
    }
    if subnet_len > alloc_len || alloc_len > 32 {
        return Err(invalid(format!(
            "subnet length {subnet_len} is bigger than subnet alloc len {alloc_len}"
        )));
    }
    Ok(())
}

fn capacity(subnet_len: u32, alloc_len: u32) -> u64 {
    1u64 << (alloc_len - subnet_len)
}

/// Address of the `host_id`-th block of size `/alloc_len` inside
/// `subnet_ip/subnet_len`. With `alloc_len == 32` this is a host address.
pub fn get_subnet_ip(
    subnet_ip: Ipv4Addr,
    subnet_len: u32,
    alloc_len: u32,
    host_id: u32,
) -> Result<Ipv4Addr> {
    check_lengths(subnet_len, alloc_len)?;
    let max = capacity(subnet_len, alloc_len);
    if host_id as u64 >= max {
        return Err(invalid(format!(
            "host id {host_id} is beyond subnet's capacity {max}"
        )));
    }
    let base = u32::from(subnet_ip) as u64;
    let addr = base + ((host_id as u64) << (32 - alloc_len));
    let addr = u32::try_from(addr)
        .map_err(|_| invalid(format!("host id {host_id} overflows subnet {subnet_ip}")))?;
    Ok(Ipv4Addr::from(addr))
}

/// Inverse of [`get_subnet_ip`].
pub fn get_ip_number(
    subnet_ip: Ipv4Addr,
    subnet_len: u32,
    alloc_len: u32,
    host_ip: Ipv4Addr,
) -> Result<u32> {
    check_lengths(subnet_len, alloc_len)?;
    let host = u32::from(host_ip);
    let base = u32::from(subnet_ip);
    let host_id = (host.wrapping_sub(base) as u64) >> (32 - alloc_len);
    let max = capacity(subnet_len, alloc_len);
    if host < base || host_id >= max {
        return Err(invalid(format!(
            "hostIP {host_ip} is exceeding beyond subnet {subnet_ip}/{subnet_len}, hostID {host_id}"
        )));
    }
    Ok(host_id as u32)
}

/// True when the two CIDR blocks share at least one address.
pub fn is_overlapping_subnet(a: &str, b: &str) -> bool {
    match (Ipv4Network::from_str(a), Ipv4Network::from_str(b)) {
        (Ok(a), Ok(b)) => {
            let (a_lo, a_hi) = (u32::from(a.network()), u32::from(a.broadcast()));
            let (b_lo, b_hi) = (u32::from(b.network()), u32::from(b.broadcast()));
            a_lo <= b_hi && b_lo <= a_hi
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_ranges() {
        assert_eq!(
            parse_tag_ranges("", "vlan").unwrap(),
            vec![TagRange { min: 0, max: 0 }]
        );
        assert_eq!(
            parse_tag_ranges("1-10, 20-30", "vlan").unwrap(),
            vec![TagRange { min: 1, max: 10 }, TagRange { min: 20, max: 30 }]
        );
        assert_eq!(
            parse_tag_ranges("5", "vlan").unwrap(),
            vec![TagRange { min: 5, max: 5 }]
        );
        assert!(parse_tag_ranges("10-1", "vlan").is_err());
        assert!(parse_tag_ranges("0-10", "vlan").is_err());
        assert!(parse_tag_ranges("1-4096", "vlan").is_err());
        assert!(parse_tag_ranges("1-10,20-30", "vxlan").is_err());
        assert!(parse_tag_ranges("1-20000", "vxlan").is_err());
        assert!(parse_tag_ranges("1-2-3", "vlan").is_err());
        assert!(parse_tag_ranges("1-10", "gre").is_err());
        assert!(parse_tag_ranges("10000-26000", "vxlan").is_ok());
    }

    #[test]
    fn subnet_math() {
        let pool: Ipv4Addr = "11.5.0.0".parse().unwrap();
        let ip = get_subnet_ip(pool, 16, 24, 3).unwrap();
        assert_eq!(ip, "11.5.3.0".parse::<Ipv4Addr>().unwrap());
        assert_eq!(get_ip_number(pool, 16, 24, ip).unwrap(), 3);
        assert!(get_subnet_ip(pool, 16, 24, 256).is_err());
        assert!(get_subnet_ip(pool, 24, 16, 0).is_err());

        let net: Ipv4Addr = "10.1.1.0".parse().unwrap();
        assert_eq!(
            get_subnet_ip(net, 24, 32, 254).unwrap(),
            "10.1.1.254".parse::<Ipv4Addr>().unwrap()
        );
        assert!(get_ip_number(net, 24, 32, "10.1.2.1".parse().unwrap()).is_err());
    }

    #[test]
    fn overlap() {
        assert!(is_overlapping_subnet("10.1.0.0/16", "10.1.5.0/24"));
        assert!(is_overlapping_subnet("10.1.5.0/24", "10.1.0.0/16"));
        assert!(!is_overlapping_subnet("10.1.0.0/24", "10.1.1.0/24"));
    }

    #[test]
    fn cidr() {
        let (ip, len) = parse_cidr("10.1.0.0/16").unwrap();
        assert_eq!(ip, Ipv4Addr::new(10, 1, 0, 0));
        assert_eq!(len, 16);
        assert!(parse_cidr("10.1.0.0").is_err());
        assert!(parse_cidr("garbage").is_err());
    }
}
