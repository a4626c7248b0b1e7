//! End-to-end transmission-phase scenarios against scripted servers.

mod common;

use std::sync::{Arc, Mutex};

use common::*;

use color_eyre::Result;
use nbd_client::{ChunkKind, CmdFlags, CommandStatus, Handle};

fn connect(h: &mut Handle, port: u16) -> nbd_client::Result<()> {
    init_logging();
    h.connect_tcp("localhost", &port.to_string())
}

fn wait_cookie(h: &mut Handle, cookie: u64) -> nbd_client::Result<Vec<u8>> {
    loop {
        match h.aio_command_completed(cookie)? {
            CommandStatus::Complete(data) => return Ok(data),
            CommandStatus::Pending => {
                h.poll(-1)?;
            }
        }
    }
}

#[test]
fn simple_read_and_write() -> Result<()> {
    let (server, port) = serve(|mut s| {
        negotiate(
            &mut s,
            &ServerConfig {
                sr: false,
                ..Default::default()
            },
        );

        let req = read_request(&mut s);
        assert_eq!(req.typ, CMD_READ);
        assert_eq!(req.offset, 8192);
        assert_eq!(req.count, 512);
        send_simple_reply(&mut s, req.cookie, 0, &[7u8; 512]);

        let req = read_request(&mut s);
        assert_eq!(req.typ, CMD_WRITE);
        assert_eq!(req.offset, 4096);
        assert_eq!(req.data, vec![9u8; 1024]);
        send_simple_reply(&mut s, req.cookie, 0, &[]);

        let req = read_request(&mut s);
        assert_eq!(req.typ, CMD_FLUSH);
        send_simple_reply(&mut s, req.cookie, 0, &[]);

        let req = read_request(&mut s);
        assert_eq!(req.typ, CMD_DISC);
    });

    let mut h = Handle::new();
    connect(&mut h, port)?;
    assert!(!h.get_structured_replies_negotiated());

    let mut buf = vec![0u8; 512];
    h.pread(&mut buf, 8192, CmdFlags::empty())?;
    assert_eq!(buf, vec![7u8; 512]);

    h.pwrite(&[9u8; 1024], 4096, CmdFlags::empty())?;
    h.flush(CmdFlags::empty())?;

    h.shutdown()?;
    server.join().unwrap();
    Ok(())
}

#[test]
fn structured_read_split_hole_and_data() -> Result<()> {
    let (server, port) = serve(|mut s| {
        negotiate(&mut s, &ServerConfig::default());

        let req = read_request(&mut s);
        assert_eq!(req.typ, CMD_READ);
        assert_eq!(req.offset, 0);
        assert_eq!(req.count, 4096);
        send_chunk(
            &mut s,
            0,
            CHUNK_OFFSET_HOLE,
            req.cookie,
            &offset_hole_payload(0, 2048),
        );
        send_chunk(
            &mut s,
            CHUNK_DONE,
            CHUNK_OFFSET_DATA,
            req.cookie,
            &offset_data_payload(2048, &[b'A'; 2048]),
        );

        let req = read_request(&mut s);
        assert_eq!(req.typ, CMD_DISC);
    });

    let mut h = Handle::new();
    connect(&mut h, port)?;
    assert!(h.get_structured_replies_negotiated());

    let chunks = Arc::new(Mutex::new(Vec::new()));
    let sink = chunks.clone();
    let mut buf = vec![0xffu8; 4096];
    h.pread_structured(
        &mut buf,
        0,
        Box::new(move |payload, offset, kind| {
            sink.lock().unwrap().push((kind, offset, payload.len()));
            Ok(())
        }),
        CmdFlags::empty(),
    )?;

    assert_eq!(&buf[..2048], &[0u8; 2048][..]);
    assert_eq!(&buf[2048..], &[b'A'; 2048][..]);
    assert_eq!(
        *chunks.lock().unwrap(),
        vec![(ChunkKind::Hole, 0, 2048), (ChunkKind::Data, 2048, 2048)]
    );

    h.shutdown()?;
    server.join().unwrap();
    Ok(())
}

#[test]
fn block_status_extents() -> Result<()> {
    let (server, port) = serve(|mut s| {
        negotiate(
            &mut s,
            &ServerConfig {
                meta: vec![(5, "base:allocation".to_string())],
                ..Default::default()
            },
        );

        let req = read_request(&mut s);
        assert_eq!(req.typ, CMD_BLOCK_STATUS);
        assert_eq!(req.offset, 0);
        assert_eq!(req.count, 64 * 1024);
        send_chunk(
            &mut s,
            CHUNK_DONE,
            CHUNK_BLOCK_STATUS,
            req.cookie,
            &block_status_payload(5, &[(32768, 0x2), (32768, 0x0)]),
        );

        let req = read_request(&mut s);
        assert_eq!(req.typ, CMD_DISC);
    });

    let mut h = Handle::new();
    h.add_meta_context("base:allocation")?;
    connect(&mut h, port)?;

    let extents = Arc::new(Mutex::new(Vec::new()));
    let sink = extents.clone();
    h.block_status(
        64 * 1024,
        0,
        Box::new(move |name, offset, entries| {
            sink.lock()
                .unwrap()
                .push((name.to_string(), offset, entries.to_vec()));
            Ok(())
        }),
        CmdFlags::empty(),
    )?;

    let extents = extents.lock().unwrap();
    assert_eq!(extents.len(), 1);
    assert_eq!(
        extents[0],
        (
            "base:allocation".to_string(),
            0,
            vec![(32768, 0x2), (32768, 0x0)]
        )
    );

    h.shutdown()?;
    server.join().unwrap();
    Ok(())
}

#[test]
fn strict_bounds_rejected_before_the_wire() -> Result<()> {
    let (server, port) = serve(|mut s| {
        negotiate(&mut s, &ServerConfig::default());
        // the very next request must be the disconnect: the out-of-bounds
        // read must never reach the wire
        let req = read_request(&mut s);
        assert_eq!(req.typ, CMD_DISC);
    });

    let mut h = Handle::new();
    connect(&mut h, port)?;
    assert_eq!(h.get_size()?, 1 << 20);

    let mut buf = vec![0u8; 4096];
    let err = h.pread(&mut buf, 1048575, CmdFlags::empty()).unwrap_err();
    assert_eq!(err.errno(), Some(nix::errno::Errno::EINVAL));
    assert!(
        err.to_string().starts_with("nbd_pread: "),
        "unexpected message: {err}"
    );
    assert!(nbd_client::get_error().unwrap().starts_with("nbd_pread: "));

    h.shutdown()?;
    server.join().unwrap();
    Ok(())
}

#[test]
fn out_of_order_completions() -> Result<()> {
    let (server, port) = serve(|mut s| {
        negotiate(
            &mut s,
            &ServerConfig {
                sr: false,
                ..Default::default()
            },
        );

        let first = read_request(&mut s);
        let second = read_request(&mut s);
        // completions may arrive in any order; reply newest first
        send_simple_reply(&mut s, second.cookie, 0, &vec![2u8; second.count as usize]);
        send_simple_reply(&mut s, first.cookie, 0, &vec![1u8; first.count as usize]);

        let req = read_request(&mut s);
        assert_eq!(req.typ, CMD_DISC);
    });

    let mut h = Handle::new();
    connect(&mut h, port)?;

    let c1 = h.aio_pread(vec![0u8; 512], 0, CmdFlags::empty(), None)?;
    let c2 = h.aio_pread(vec![0u8; 512], 512, CmdFlags::empty(), None)?;
    assert_eq!(h.aio_in_flight(), 2);

    // drive until the first completion is available and check the done
    // queue preserves arrival order
    let peeked = loop {
        match h.aio_peek_command_completed()? {
            Some(cookie) => break cookie,
            None => {
                h.poll(-1)?;
            }
        }
    };
    assert_eq!(peeked, c2, "server replied to the second command first");

    let data2 = wait_cookie(&mut h, c2)?;
    assert_eq!(data2, vec![2u8; 512]);
    let data1 = wait_cookie(&mut h, c1)?;
    assert_eq!(data1, vec![1u8; 512]);
    assert_eq!(h.aio_in_flight(), 0);

    h.shutdown()?;
    server.join().unwrap();
    Ok(())
}

#[test]
fn error_chunk_with_offset() -> Result<()> {
    let (server, port) = serve(|mut s| {
        negotiate(&mut s, &ServerConfig::default());

        let req = read_request(&mut s);
        assert_eq!(req.typ, CMD_READ);
        send_chunk(
            &mut s,
            CHUNK_DONE,
            CHUNK_ERROR_OFFSET,
            req.cookie,
            &error_chunk_payload(5, "bad sector", Some(req.offset + 256)),
        );

        let req = read_request(&mut s);
        assert_eq!(req.typ, CMD_DISC);
    });

    let mut h = Handle::new();
    connect(&mut h, port)?;

    let chunks = Arc::new(Mutex::new(Vec::new()));
    let sink = chunks.clone();
    let mut buf = vec![0u8; 512];
    let err = h
        .pread_structured(
            &mut buf,
            0,
            Box::new(move |_payload, offset, kind| {
                sink.lock().unwrap().push((kind, offset));
                Ok(())
            }),
            CmdFlags::empty(),
        )
        .unwrap_err();

    // NBD_EIO maps to the local errno and the callback saw the failure
    // context
    assert_eq!(err.errno(), Some(nix::errno::Errno::EIO));
    assert_eq!(*chunks.lock().unwrap(), vec![(ChunkKind::Error, 256)]);

    h.shutdown()?;
    server.join().unwrap();
    Ok(())
}

#[test]
fn disconnect_rejects_new_commands() -> Result<()> {
    let (server, port) = serve(|mut s| {
        negotiate(&mut s, &ServerConfig::default());
        let req = read_request(&mut s);
        assert_eq!(req.typ, CMD_READ);
        let req = read_request(&mut s);
        assert_eq!(req.typ, CMD_DISC);
        // close without answering the read
    });

    let mut h = Handle::new();
    connect(&mut h, port)?;

    let pending = h.aio_pread(vec![0u8; 512], 0, CmdFlags::empty(), None)?;
    h.aio_disconnect()?;

    let err = h
        .aio_pread(vec![0u8; 512], 0, CmdFlags::empty(), None)
        .unwrap_err();
    assert_eq!(err.errno(), Some(nix::errno::Errno::EINVAL));
    assert!(
        err.to_string()
            .contains("cannot request more commands after NBD_CMD_DISC"),
        "unexpected message: {err}"
    );

    while !h.aio_is_closed() && !h.aio_is_dead() {
        h.poll(-1)?;
    }
    assert!(h.aio_is_closed());

    // the abandoned read completed with EIO
    let err = h.aio_command_completed(pending).unwrap_err();
    assert_eq!(err.errno(), Some(nix::errno::Errno::EIO));
    assert_eq!(h.aio_in_flight(), 0);

    server.join().unwrap();
    Ok(())
}

#[test]
fn zero_flags_validated_against_advertisement() -> Result<()> {
    let (server, port) = serve(|mut s| {
        negotiate(&mut s, &ServerConfig::default());
        let req = read_request(&mut s);
        assert_eq!(req.typ, CMD_DISC);
    });

    let mut h = Handle::new();
    connect(&mut h, port)?;

    // the scripted server only advertises flush
    let err = h.zero(4096, 0, CmdFlags::empty()).unwrap_err();
    assert_eq!(err.errno(), Some(nix::errno::Errno::EINVAL));
    let err = h.trim(4096, 0, CmdFlags::empty()).unwrap_err();
    assert_eq!(err.errno(), Some(nix::errno::Errno::EINVAL));
    let err = h
        .pwrite(&[0u8; 512], 0, CmdFlags::FUA)
        .unwrap_err();
    assert_eq!(err.errno(), Some(nix::errno::Errno::EINVAL));

    h.shutdown()?;
    server.join().unwrap();
    Ok(())
}
