//! NBD URI support.
//!
//! `nbd[s][+unix|+vsock]://[user@][host[:port]][/export][?key=value&...]`
//!
//! The `nbds` schemes force TLS to `Require`; plain schemes follow the
//! handle's TLS mode. `+unix` requires a `socket=PATH` query; `+vsock`
//! takes a numeric CID as the host. Query parameters naming local files
//! are rejected unless the caller opted in with
//! [`Handle::set_uri_allow_local_file`].
//!
//! The grammar is small enough to parse directly; only the pieces the NBD
//! schemes use are implemented.

use nix::errno::Errno;

use crate::errors::{set_context, set_error, Result};
use crate::handle::{AllowTransport, Handle};
use crate::proto::TCP_PORT;
use crate::TlsMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UriTransport {
    Tcp,
    Unix,
    Vsock,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct NbdUri {
    transport: UriTransport,
    tls: bool,
    user: Option<String>,
    host: Option<String>,
    port: Option<String>,
    export: String,
    queries: Vec<(String, String)>,
}

fn percent_decode(s: &str) -> Option<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hi = bytes.get(i + 1).and_then(|b| (*b as char).to_digit(16))?;
                let lo = bytes.get(i + 2).and_then(|b| (*b as char).to_digit(16))?;
                out.push((hi * 16 + lo) as u8);
                i += 3;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out).ok()
}

fn parse_uri(raw: &str) -> std::result::Result<NbdUri, String> {
    let (scheme, rest) = raw
        .split_once("://")
        .ok_or_else(|| "URI does not have a scheme".to_string())?;

    let (base, suffix) = match scheme.split_once('+') {
        Some((base, suffix)) => (base, Some(suffix)),
        None => (scheme, None),
    };
    let tls = match base {
        "nbd" => false,
        "nbds" => true,
        _ => return Err(format!("unknown NBD URI scheme: {scheme}")),
    };
    let transport = match suffix {
        None => UriTransport::Tcp,
        Some("unix") => UriTransport::Unix,
        Some("vsock") => UriTransport::Vsock,
        Some(other) => return Err(format!("unknown NBD URI transport: +{other}")),
    };

    // Split off the query, then the path, leaving the authority.
    let (rest, query_raw) = match rest.split_once('?') {
        Some((rest, q)) => (rest, Some(q)),
        None => (rest, None),
    };
    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, ""),
    };

    let (user, hostport) = match authority.split_once('@') {
        Some((user, hostport)) => {
            let user = percent_decode(user).ok_or("bad percent-encoding in userinfo")?;
            (Some(user), hostport)
        }
        None => (None, authority),
    };

    // Literal IPv6 addresses are bracketed; the port comes after the
    // closing bracket.
    let (host, port) = if let Some(v6) = hostport.strip_prefix('[') {
        let (addr, after) = v6
            .split_once(']')
            .ok_or("unterminated [ in URI authority")?;
        let port = match after.strip_prefix(':') {
            Some(port) => Some(port.to_string()),
            None if after.is_empty() => None,
            None => return Err("garbage after ] in URI authority".to_string()),
        };
        (Some(addr.to_string()), port)
    } else {
        match hostport.split_once(':') {
            Some((host, port)) => (
                (!host.is_empty()).then(|| host.to_string()),
                Some(port.to_string()),
            ),
            None => ((!hostport.is_empty()).then(|| hostport.to_string()), None),
        }
    };

    let export = match path.strip_prefix('/') {
        Some(export) => percent_decode(export).ok_or("bad percent-encoding in export name")?,
        None => String::new(),
    };

    let mut queries = Vec::new();
    if let Some(query_raw) = query_raw {
        for part in query_raw.split(['&', ';']) {
            if part.is_empty() {
                continue;
            }
            match part.split_once('=') {
                Some(("", _)) => continue,
                Some((name, value)) => {
                    let name = percent_decode(name).ok_or("bad percent-encoding in query")?;
                    let value = percent_decode(value).ok_or("bad percent-encoding in query")?;
                    queries.push((name, value));
                }
                None => {
                    let name = percent_decode(part).ok_or("bad percent-encoding in query")?;
                    queries.push((name, String::new()));
                }
            }
        }
    }

    Ok(NbdUri {
        transport,
        tls,
        user,
        host,
        port,
        export,
        queries,
    })
}

impl Handle {
    /// Apply a URI to the handle configuration and start connecting.
    pub fn aio_connect_uri(&mut self, raw_uri: &str) -> Result<()> {
        set_context("nbd_aio_connect_uri");
        self.connect_uri_common(raw_uri)
    }

    /// Connect per the URI and finish the NBD handshake.
    pub fn connect_uri(&mut self, raw_uri: &str) -> Result<()> {
        set_context("nbd_connect_uri");
        self.connect_uri_common(raw_uri)?;
        self.wait_until_connected()
    }

    fn connect_uri_common(&mut self, raw_uri: &str) -> Result<()> {
        let uri = match parse_uri(raw_uri) {
            Ok(uri) => uri,
            Err(msg) => {
                return Err(set_error(Errno::EINVAL, format!("unable to parse URI: {msg}")))
            }
        };

        // Check the transport is allowed.
        let allowed = match uri.transport {
            UriTransport::Tcp => self.uri_allow_transports.contains(AllowTransport::TCP),
            UriTransport::Unix => self.uri_allow_transports.contains(AllowTransport::UNIX),
            UriTransport::Vsock => self.uri_allow_transports.contains(AllowTransport::VSOCK),
        };
        if !allowed {
            return Err(set_error(Errno::EPERM, "URI transport is not permitted"));
        }

        // Check TLS is allowed.
        if (uri.tls && self.uri_allow_tls == TlsMode::Disable)
            || (!uri.tls && self.uri_allow_tls == TlsMode::Require)
        {
            return Err(set_error(Errno::EPERM, "URI TLS setting is not permitted"));
        }

        let socket_param = uri
            .queries
            .iter()
            .find(|(name, _)| name == "socket")
            .map(|(_, value)| value.clone());
        match (uri.transport, &socket_param) {
            (UriTransport::Unix, None) => {
                return Err(set_error(
                    Errno::EINVAL,
                    "cannot parse socket parameter from NBD URI \
                     (did you mean \"nbd+unix:///?socket=...\"?)",
                ));
            }
            (UriTransport::Unix, Some(_)) => {}
            (_, Some(_)) => {
                return Err(set_error(
                    Errno::EINVAL,
                    "socket parameter is incompatible with this URI scheme \
                     (did you mean \"nbd+unix:///?socket=...\"?)",
                ));
            }
            (_, None) => {}
        }

        if uri.tls {
            self.set_tls(TlsMode::Require)?;
        }

        // Local-file queries are only honored after an explicit opt-in.
        for (name, value) in &uri.queries {
            match name.as_str() {
                "tls-certificates" => {
                    if !self.uri_allow_local_file {
                        return Err(set_error(
                            Errno::EPERM,
                            "local file access (tls-certificates) is not allowed, \
                             call nbd_set_uri_allow_local_file to enable this",
                        ));
                    }
                    self.set_tls_certificates(value.clone())?;
                }
                "tls-psk-file" => {
                    if !self.uri_allow_local_file {
                        return Err(set_error(
                            Errno::EPERM,
                            "local file access (tls-psk-file) is not allowed, \
                             call nbd_set_uri_allow_local_file to enable this",
                        ));
                    }
                    self.set_tls_psk_file(value.clone())?;
                }
                _ => {}
            }
        }

        if let Some(user) = &uri.user {
            self.set_tls_username(user)?;
        }

        self.set_export_name(&uri.export)?;

        match uri.transport {
            UriTransport::Tcp => {
                let host = uri.host.unwrap_or_else(|| "localhost".to_string());
                let port = uri.port.unwrap_or_else(|| TCP_PORT.to_string());
                self.aio_connect_tcp(&host, &port)
            }
            UriTransport::Unix => {
                self.aio_connect_unix(socket_param.expect("checked above"))
            }
            UriTransport::Vsock => {
                let cid = uri
                    .host
                    .as_deref()
                    .and_then(|h| h.parse::<u32>().ok())
                    .ok_or_else(|| {
                        set_error(Errno::EINVAL, "cannot parse vsock cid from NBD URI")
                    })?;
                let port = match uri.port.as_deref() {
                    Some(port) => port.parse::<u32>().map_err(|_| {
                        set_error(Errno::EINVAL, "cannot parse vsock port from NBD URI")
                    })?,
                    None => u32::from(TCP_PORT),
                };
                self.aio_connect_vsock(cid, port)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_tcp() {
        let uri = parse_uri("nbd://example.com").unwrap();
        assert_eq!(uri.transport, UriTransport::Tcp);
        assert!(!uri.tls);
        assert_eq!(uri.host.as_deref(), Some("example.com"));
        assert_eq!(uri.port, None);
        assert_eq!(uri.export, "");
    }

    #[test]
    fn tcp_with_port_and_export() {
        let uri = parse_uri("nbds://user@example.com:10810/disk0").unwrap();
        assert!(uri.tls);
        assert_eq!(uri.user.as_deref(), Some("user"));
        assert_eq!(uri.host.as_deref(), Some("example.com"));
        assert_eq!(uri.port.as_deref(), Some("10810"));
        assert_eq!(uri.export, "disk0");
    }

    #[test]
    fn ipv6_literal() {
        let uri = parse_uri("nbd://[::1]:10809/e").unwrap();
        assert_eq!(uri.host.as_deref(), Some("::1"));
        assert_eq!(uri.port.as_deref(), Some("10809"));
        assert_eq!(uri.export, "e");
        assert!(parse_uri("nbd://[::1").is_err());
        assert!(parse_uri("nbd://[::1]x").is_err());
    }

    #[test]
    fn unix_socket_query() {
        let uri = parse_uri("nbd+unix:///export?socket=/tmp/sock").unwrap();
        assert_eq!(uri.transport, UriTransport::Unix);
        assert_eq!(uri.export, "export");
        assert_eq!(
            uri.queries,
            vec![("socket".to_string(), "/tmp/sock".to_string())]
        );
    }

    #[test]
    fn vsock() {
        let uri = parse_uri("nbd+vsock://2:10809/").unwrap();
        assert_eq!(uri.transport, UriTransport::Vsock);
        assert_eq!(uri.host.as_deref(), Some("2"));
        assert_eq!(uri.port.as_deref(), Some("10809"));
    }

    #[test]
    fn percent_decoding() {
        let uri = parse_uri("nbd://localhost/with%20space?a=b%26c").unwrap();
        assert_eq!(uri.export, "with space");
        assert_eq!(uri.queries, vec![("a".to_string(), "b&c".to_string())]);
        assert!(parse_uri("nbd://localhost/bad%zz").is_err());
    }

    #[test]
    fn rejects() {
        assert!(parse_uri("http://example.com").is_err());
        assert!(parse_uri("nbd+carrier-pigeon://x").is_err());
        assert!(parse_uri("just-a-path").is_err());
    }

    #[test]
    fn uri_allow_lists() {
        let mut h = Handle::new();
        h.set_uri_allow_transports(AllowTransport::TCP).unwrap();
        let err = h.aio_connect_uri("nbd+unix:///?socket=/tmp/s").unwrap_err();
        assert_eq!(err.errno(), Some(Errno::EPERM));

        let mut h = Handle::new();
        h.set_uri_allow_tls(TlsMode::Disable).unwrap();
        let err = h.aio_connect_uri("nbds://localhost/").unwrap_err();
        assert_eq!(err.errno(), Some(Errno::EPERM));

        let mut h = Handle::new();
        h.set_uri_allow_tls(TlsMode::Require).unwrap();
        let err = h.aio_connect_uri("nbd://localhost/").unwrap_err();
        assert_eq!(err.errno(), Some(Errno::EPERM));
    }

    #[test]
    fn unix_requires_socket_param() {
        let mut h = Handle::new();
        let err = h.aio_connect_uri("nbd+unix:///export").unwrap_err();
        assert_eq!(err.errno(), Some(Errno::EINVAL));

        // socket= is only for +unix
        let mut h = Handle::new();
        let err = h
            .aio_connect_uri("nbd://localhost/?socket=/tmp/s")
            .unwrap_err();
        assert_eq!(err.errno(), Some(Errno::EINVAL));
    }

    #[test]
    fn local_file_queries_need_opt_in() {
        let mut h = Handle::new();
        let err = h
            .aio_connect_uri("nbds://localhost/?tls-certificates=/etc/pki")
            .unwrap_err();
        assert_eq!(err.errno(), Some(Errno::EPERM));

        let mut h = Handle::new();
        h.set_uri_allow_local_file(true).unwrap();
        // now the option is applied; the connect itself starts
        h.aio_connect_uri("nbds://localhost:0/?tls-certificates=/etc/pki")
            .ok();
        assert_eq!(h.get_tls(), TlsMode::Require);
    }
}
