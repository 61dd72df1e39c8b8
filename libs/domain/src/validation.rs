//! Field validators used by the facade.

use std::net::Ipv4Addr;

/// A validation failure. Surfaced verbatim, never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("empty string for {0}")]
    Empty(&'static str),

    #[error("invalid IPv4 address {0}")]
    InvalidIp(String),

    #[error("invalid netmask {0}")]
    InvalidNetmask(String),

    #[error("not in valid port range: {0}")]
    InvalidPort(u32),

    #[error("{0}")]
    Violation(String),
}

pub fn not_empty(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::Empty(field));
    }
    Ok(())
}

pub fn is_ip_v4(value: &str) -> Result<Ipv4Addr, ValidationError> {
    value
        .parse::<Ipv4Addr>()
        .map_err(|_| ValidationError::InvalidIp(value.to_string()))
}

/// A netmask must be an IPv4 address whose bits are contiguous ones followed
/// by zeros (and not all-zero).
pub fn is_netmask(value: &str) -> Result<(), ValidationError> {
    let addr = value
        .parse::<Ipv4Addr>()
        .map_err(|_| ValidationError::InvalidNetmask(value.to_string()))?;
    let mask = u32::from(addr);
    if mask == 0 || mask.leading_ones() + mask.trailing_zeros() != 32 {
        return Err(ValidationError::InvalidNetmask(value.to_string()));
    }
    Ok(())
}

pub fn valid_port(port: u16) -> Result<(), ValidationError> {
    if port == 0 {
        return Err(ValidationError::InvalidPort(port as u32));
    }
    Ok(())
}
