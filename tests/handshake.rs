//! End-to-end negotiation scenarios against scripted servers.

mod common;

use common::*;

use color_eyre::Result;
use nbd_client::{Handle, TlsMode};

fn connect(h: &mut Handle, port: u16) -> nbd_client::Result<()> {
    init_logging();
    h.connect_tcp("localhost", &port.to_string())
}

#[test]
fn oldstyle_handshake() -> Result<()> {
    let (server, port) = serve(|mut s| {
        send_oldstyle_greeting(&mut s, 1048576, FLAG_HAS_FLAGS);
        // hold the connection open until the client drops it
        let _ = read_request(&mut s);
    });

    let mut h = Handle::new();
    connect(&mut h, port)?;

    assert!(h.aio_is_ready());
    assert_eq!(h.get_size()?, 1048576);
    assert!(!h.is_read_only()?);
    assert_eq!(h.get_protocol()?, "oldstyle");
    assert!(!h.get_structured_replies_negotiated());

    h.shutdown()?;
    server.join().unwrap();
    Ok(())
}

#[test]
fn newstyle_fixed_with_structured_replies() -> Result<()> {
    let (server, port) = serve(|mut s| {
        negotiate(&mut s, &ServerConfig::default());
        let req = read_request(&mut s);
        assert_eq!(req.typ, CMD_DISC);
    });

    let mut h = Handle::new();
    connect(&mut h, port)?;

    assert!(h.aio_is_ready());
    assert_eq!(h.get_protocol()?, "newstyle-fixed");
    assert!(h.get_structured_replies_negotiated());
    assert_eq!(h.get_size()?, 1 << 20);
    assert!(h.can_flush()?);
    assert!(!h.can_trim()?);

    h.shutdown()?;
    server.join().unwrap();
    Ok(())
}

#[test]
fn starttls_refused_with_tls_required() -> Result<()> {
    let (server, port) = serve(|mut s| {
        send_newstyle_greeting(&mut s, 0b11);
        let _cflags = read_client_flags(&mut s);
        let (option, _) = read_option(&mut s);
        assert_eq!(option, OPT_STARTTLS);
        send_opt_reply(&mut s, option, REP_ERR_POLICY, &[]);
    });

    let mut h = Handle::new();
    h.set_tls(TlsMode::Require)?;
    let err = connect(&mut h, port).unwrap_err();

    assert!(h.aio_is_dead());
    assert_eq!(err.errno(), Some(nix::errno::Errno::ENOTSUP));
    assert!(
        err.to_string().contains("handshake: server refused TLS"),
        "unexpected message: {err}"
    );
    server.join().unwrap();
    Ok(())
}

#[test]
fn starttls_refused_with_tls_allowed_continues_plaintext() -> Result<()> {
    let (server, port) = serve(|mut s| {
        // negotiate() answers STARTTLS with ERR_POLICY and carries on
        negotiate(&mut s, &ServerConfig::default());
        let req = read_request(&mut s);
        assert_eq!(req.typ, CMD_DISC);
    });

    let mut h = Handle::new();
    h.set_tls(TlsMode::Allow)?;
    connect(&mut h, port)?;

    assert!(h.aio_is_ready());
    assert!(!h.get_tls_negotiated());

    h.shutdown()?;
    server.join().unwrap();
    Ok(())
}

#[test]
fn go_unsup_falls_back_to_export_name() -> Result<()> {
    let (server, port) = serve(|mut s| {
        negotiate(
            &mut s,
            &ServerConfig {
                go_unsup: true,
                size: 4096,
                ..Default::default()
            },
        );
        let req = read_request(&mut s);
        assert_eq!(req.typ, CMD_DISC);
    });

    let mut h = Handle::new();
    connect(&mut h, port)?;

    assert!(h.aio_is_ready());
    assert_eq!(h.get_size()?, 4096);
    assert_eq!(h.get_protocol()?, "newstyle-fixed");

    h.shutdown()?;
    server.join().unwrap();
    Ok(())
}

#[test]
fn meta_context_negotiation() -> Result<()> {
    let (server, port) = serve(|mut s| {
        negotiate(
            &mut s,
            &ServerConfig {
                meta: vec![(5, "base:allocation".to_string())],
                ..Default::default()
            },
        );
        let req = read_request(&mut s);
        assert_eq!(req.typ, CMD_DISC);
    });

    let mut h = Handle::new();
    h.add_meta_context("base:allocation")?;
    connect(&mut h, port)?;

    assert!(h.can_meta_context("base:allocation")?);
    assert!(!h.can_meta_context("qemu:dirty-bitmap:bm0")?);

    h.shutdown()?;
    server.join().unwrap();
    Ok(())
}

#[test]
fn opt_mode_list_and_go() -> Result<()> {
    let (server, port) = serve(|mut s| {
        send_newstyle_greeting(&mut s, 0b11);
        let _cflags = read_client_flags(&mut s);
        loop {
            let (option, _payload) = read_option(&mut s);
            match option {
                OPT_LIST => {
                    for name in ["disk0", "disk1"] {
                        let mut payload = vec![];
                        payload.extend_from_slice(&(name.len() as u32).to_be_bytes());
                        payload.extend_from_slice(name.as_bytes());
                        send_opt_reply(&mut s, option, REP_SERVER, &payload);
                    }
                    send_opt_reply(&mut s, option, REP_ACK, &[]);
                }
                OPT_STRUCTURED_REPLY => send_opt_reply(&mut s, option, REP_ACK, &[]),
                OPT_GO => {
                    send_opt_reply(
                        &mut s,
                        option,
                        REP_INFO,
                        &export_info_payload(1 << 20, FLAG_HAS_FLAGS),
                    );
                    send_opt_reply(&mut s, option, REP_ACK, &[]);
                    break;
                }
                other => panic!("unexpected option {other}"),
            }
        }
        let req = read_request(&mut s);
        assert_eq!(req.typ, CMD_DISC);
    });

    let mut h = Handle::new();
    h.set_opt_mode(true)?;
    connect(&mut h, port)?;
    assert!(h.aio_is_negotiating());

    let exports = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = exports.clone();
    let count = h.opt_list(Box::new(move |name, _desc| {
        sink.lock().unwrap().push(name.to_string());
    }))?;
    assert_eq!(count, 2);
    assert_eq!(*exports.lock().unwrap(), vec!["disk0", "disk1"]);

    // structured replies can be negotiated by hand in option mode
    assert!(h.opt_structured_reply()?);

    h.set_export_name("disk0")?;
    h.opt_go()?;
    assert!(h.aio_is_ready());
    assert_eq!(h.get_size()?, 1 << 20);

    h.shutdown()?;
    server.join().unwrap();
    Ok(())
}

#[test]
fn connect_over_unix_socket() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("nbd.sock");
    let server = serve_unix(&path, |mut s| {
        negotiate(&mut s, &ServerConfig::default());
        let req = read_request(&mut s);
        assert_eq!(req.typ, CMD_DISC);
    });

    let mut h = Handle::new();
    h.connect_unix(&path)?;
    assert!(h.aio_is_ready());
    assert_eq!(h.get_size()?, 1 << 20);

    h.shutdown()?;
    server.join().unwrap();
    Ok(())
}

#[test]
fn opt_mode_abort() -> Result<()> {
    let (server, port) = serve(|mut s| {
        send_newstyle_greeting(&mut s, 0b11);
        let _cflags = read_client_flags(&mut s);
        let (option, _) = read_option(&mut s);
        assert_eq!(option, OPT_ABORT);
        send_opt_reply(&mut s, option, REP_ACK, &[]);
    });

    let mut h = Handle::new();
    h.set_opt_mode(true)?;
    connect(&mut h, port)?;
    assert!(h.aio_is_negotiating());

    h.opt_abort()?;
    assert!(h.aio_is_closed());
    server.join().unwrap();
    Ok(())
}
