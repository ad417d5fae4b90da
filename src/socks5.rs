//! SOCKS5 greeting and CONNECT request parsing.
//!
//! Pure byte-buffer functions, no I/O. Only NO-AUTH is selected and only
//! CMD=CONNECT is accepted; BIND and UDP ASSOCIATE are rejected.

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::error::TunnelError;

pub const SOCKS_VERSION: u8 = 5;

pub const AUTH_METHOD_NO_AUTH: u8 = 0x00;
pub const AUTH_METHOD_USERNAME_PASSWORD: u8 = 0x02;

pub const CMD_CONNECT: u8 = 0x01;

pub const ADDRESS_TYPE_IPV4: u8 = 1;
pub const ADDRESS_TYPE_DOMAIN: u8 = 3;
pub const ADDRESS_TYPE_IPV6: u8 = 4;

/// Outcome of feeding a (possibly partial) buffer to the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// The buffer does not yet hold a complete message.
    NeedMore,
    Done,
}

/// Per-connection SOCKS5 parser state.
///
/// Feed the greeting buffer until [`Progress::Done`], reply with
/// [`Socks5Parser::send_greeting`], then feed the request buffer the same
/// way. The parsed destination is available from
/// [`Socks5Parser::destination`] afterwards.
#[derive(Debug, Default)]
pub struct Socks5Parser {
    auth_methods: Vec<u8>,
    address_type: Option<u8>,
    dst_addr: Vec<u8>,
    dst_port: u16,
}

impl Socks5Parser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the client greeting `[ver, nmethods, methods...]`.
    ///
    /// Fails unless at least one of NO-AUTH or USERNAME/PASSWORD is offered
    /// (the reply always selects NO-AUTH either way).
    pub fn receive_greeting(&mut self, data: &[u8]) -> Result<Progress, TunnelError> {
        if data.len() < 2 {
            return Ok(Progress::NeedMore);
        }

        let version = data[0];
        let nmethods = data[1] as usize;

        if version != SOCKS_VERSION {
            return Err(TunnelError::Parse(format!(
                "unsupported socks version {version}"
            )));
        }
        if nmethods == 0 {
            return Err(TunnelError::Parse("greeting offers zero methods".into()));
        }
        if data.len() < 2 + nmethods {
            return Ok(Progress::NeedMore);
        }
        if data.len() > 2 + nmethods {
            return Err(TunnelError::Parse("trailing bytes after greeting".into()));
        }

        let methods = &data[2..2 + nmethods];
        if !methods.contains(&AUTH_METHOD_NO_AUTH)
            && !methods.contains(&AUTH_METHOD_USERNAME_PASSWORD)
        {
            return Err(TunnelError::Parse(
                "no supported auth method offered".into(),
            ));
        }

        self.auth_methods = methods.to_vec();
        Ok(Progress::Done)
    }

    /// Greeting reply: always select NO-AUTH.
    pub fn send_greeting(&self) -> [u8; 2] {
        [SOCKS_VERSION, AUTH_METHOD_NO_AUTH]
    }

    /// Parse the CONNECT request `[ver, cmd, rsv, atyp, addr..., port]`.
    pub fn receive_request(&mut self, data: &[u8]) -> Result<Progress, TunnelError> {
        if data.len() < 4 {
            return Ok(Progress::NeedMore);
        }

        let (version, cmd, address_type) = (data[0], data[1], data[3]);

        if version != SOCKS_VERSION {
            return Err(TunnelError::Parse(format!(
                "unsupported socks version {version}"
            )));
        }
        if cmd != CMD_CONNECT {
            return Err(TunnelError::Parse(format!("unsupported command {cmd}")));
        }

        let (dst_addr, dst_port): (&[u8], &[u8]) = match address_type {
            ADDRESS_TYPE_IPV4 => {
                if data.len() < 4 + 4 + 2 {
                    return Ok(Progress::NeedMore);
                }
                (&data[4..8], &data[8..10])
            }
            ADDRESS_TYPE_IPV6 => {
                if data.len() < 4 + 16 + 2 {
                    return Ok(Progress::NeedMore);
                }
                (&data[4..20], &data[20..22])
            }
            ADDRESS_TYPE_DOMAIN => {
                if data.len() < 4 + 1 {
                    return Ok(Progress::NeedMore);
                }
                let domain_len = data[4] as usize;
                if data.len() < 4 + 1 + domain_len + 2 {
                    return Ok(Progress::NeedMore);
                }
                (
                    &data[5..5 + domain_len],
                    &data[5 + domain_len..5 + domain_len + 2],
                )
            }
            other => {
                return Err(TunnelError::Parse(format!(
                    "unsupported address type {other}"
                )));
            }
        };

        self.address_type = Some(address_type);
        self.dst_addr = dst_addr.to_vec();
        self.dst_port = u16::from_be_bytes([dst_port[0], dst_port[1]]);
        Ok(Progress::Done)
    }

    /// Success reply with bound address 0.0.0.0:0.
    pub fn send_success_response(&self) -> [u8; 10] {
        [SOCKS_VERSION, 0, 0, ADDRESS_TYPE_IPV4, 0, 0, 0, 0, 0, 0]
    }

    /// Failure reply; `error_number` 1 is the generic failure code.
    pub fn send_failed_response(&self, error_number: u8) -> [u8; 10] {
        [
            SOCKS_VERSION,
            error_number,
            0,
            ADDRESS_TYPE_IPV4,
            0,
            0,
            0,
            0,
            0,
            0,
        ]
    }

    /// Destination recorded by a completed request, normalized to
    /// `(address_type, textual address, host-order port)`.
    pub fn destination(&self) -> Result<(u8, String, u16), TunnelError> {
        let address_type = self
            .address_type
            .ok_or_else(|| TunnelError::Parse("request not parsed yet".into()))?;

        let addr = match address_type {
            ADDRESS_TYPE_IPV4 => {
                let octets: [u8; 4] = self.dst_addr[..].try_into().map_err(|_| {
                    TunnelError::Parse("ipv4 address is not 4 bytes".into())
                })?;
                Ipv4Addr::from(octets).to_string()
            }
            ADDRESS_TYPE_IPV6 => {
                let octets: [u8; 16] = self.dst_addr[..].try_into().map_err(|_| {
                    TunnelError::Parse("ipv6 address is not 16 bytes".into())
                })?;
                Ipv6Addr::from(octets).to_string()
            }
            _ => String::from_utf8(self.dst_addr.clone())
                .map_err(|_| TunnelError::Parse("domain is not valid utf-8".into()))?,
        };

        Ok((address_type, addr, self.dst_port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_greeting_no_auth() {
        let mut parser = Socks5Parser::new();
        assert_eq!(
            parser.receive_greeting(&[5, 1, 0]).unwrap(),
            Progress::Done
        );
        assert_eq!(parser.send_greeting(), [5, 0]);
    }

    #[test]
    fn test_greeting_incremental() {
        let mut parser = Socks5Parser::new();
        assert_eq!(parser.receive_greeting(&[5]).unwrap(), Progress::NeedMore);
        assert_eq!(
            parser.receive_greeting(&[5, 2]).unwrap(),
            Progress::NeedMore
        );
        assert_eq!(
            parser.receive_greeting(&[5, 2, 0]).unwrap(),
            Progress::NeedMore
        );
        assert_eq!(
            parser.receive_greeting(&[5, 2, 0, 2]).unwrap(),
            Progress::Done
        );
    }

    #[test]
    fn test_greeting_rejects_bad_version() {
        let mut parser = Socks5Parser::new();
        assert!(parser.receive_greeting(&[4, 1, 0]).is_err());
    }

    #[test]
    fn test_greeting_rejects_unsupported_methods() {
        // GSSAPI only
        let mut parser = Socks5Parser::new();
        assert!(parser.receive_greeting(&[5, 1, 1]).is_err());
    }

    #[test]
    fn test_request_ipv4() {
        let mut parser = Socks5Parser::new();
        let buf = [5, 1, 0, 1, 1, 2, 3, 4, 0, 80];
        assert_eq!(parser.receive_request(&buf).unwrap(), Progress::Done);
        let (atyp, addr, port) = parser.destination().unwrap();
        assert_eq!(atyp, ADDRESS_TYPE_IPV4);
        assert_eq!(addr, "1.2.3.4");
        assert_eq!(port, 80);
    }

    #[test]
    fn test_request_domain() {
        let mut parser = Socks5Parser::new();
        let mut buf = vec![5, 1, 0, 3, 11];
        buf.extend_from_slice(b"example.com");
        buf.extend_from_slice(&443u16.to_be_bytes());

        // one byte short is still incomplete
        assert_eq!(
            parser.receive_request(&buf[..buf.len() - 1]).unwrap(),
            Progress::NeedMore
        );
        assert_eq!(parser.receive_request(&buf).unwrap(), Progress::Done);
        let (atyp, addr, port) = parser.destination().unwrap();
        assert_eq!(atyp, ADDRESS_TYPE_DOMAIN);
        assert_eq!(addr, "example.com");
        assert_eq!(port, 443);
    }

    #[test]
    fn test_request_ipv6() {
        let mut parser = Socks5Parser::new();
        let mut buf = vec![5, 1, 0, 4];
        let mut addr = [0u8; 16];
        addr[15] = 1;
        buf.extend_from_slice(&addr);
        buf.extend_from_slice(&8080u16.to_be_bytes());
        assert_eq!(parser.receive_request(&buf).unwrap(), Progress::Done);
        let (atyp, addr, port) = parser.destination().unwrap();
        assert_eq!(atyp, ADDRESS_TYPE_IPV6);
        assert_eq!(addr, "::1");
        assert_eq!(port, 8080);
    }

    #[test]
    fn test_request_rejects_bind_and_udp() {
        for cmd in [2u8, 3u8] {
            let mut parser = Socks5Parser::new();
            assert!(parser
                .receive_request(&[5, cmd, 0, 1, 1, 2, 3, 4, 0, 80])
                .is_err());
        }
    }

    #[test]
    fn test_replies() {
        let parser = Socks5Parser::new();
        assert_eq!(
            parser.send_success_response(),
            [5, 0, 0, 1, 0, 0, 0, 0, 0, 0]
        );
        assert_eq!(
            parser.send_failed_response(1),
            [5, 1, 0, 1, 0, 0, 0, 0, 0, 0]
        );
    }
}
