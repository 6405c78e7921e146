use std::any::Any;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;

use nal::plugin::{BufShare, CompletionQueue, Plugin, PluginContext, Submission};
use nal::{
    Addr, CbInfo, CbPayload, Class, Context, Error, InitInfo, MemHandle, MemType, Offset, OpId,
    Segment, Tag, MEM_READWRITE, MEM_READ_ONLY,
};

// ============================================================
// Helpers
// ============================================================

fn pump_until<F: FnMut() -> bool>(class: &Class, ctx: &Context, mut done: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if done() {
            return true;
        }
        if Instant::now() >= deadline {
            return done();
        }
        let _ = class.progress(ctx, 50);
        let mut rets = [0i32; 16];
        let _ = ctx.trigger(0, &mut rets);
    }
}

fn listener() -> (Class, Context) {
    let class = Class::initialize("tcp://localhost:0", true).unwrap();
    let ctx = class.context_create().unwrap();
    (class, ctx)
}

fn client() -> (Class, Context) {
    let class = Class::initialize("tcp://", false).unwrap();
    let ctx = class.context_create().unwrap();
    (class, ctx)
}

/// Move the server's self address into the client class through the
/// serialized byte form, the way peers exchange addresses for real.
fn import_addr(server: &Class, client: &Class) -> nal::Addr {
    let self_addr = server.addr_self().unwrap();
    let size = server.addr_serialize(None, &self_addr).unwrap();
    let mut bytes = vec![0u8; size];
    server.addr_serialize(Some(&mut bytes), &self_addr).unwrap();
    client.addr_deserialize(&bytes).unwrap()
}

fn result_channel() -> (mpsc::Sender<CbInfo>, mpsc::Receiver<CbInfo>) {
    mpsc::channel()
}

// ============================================================
// Initialization and contexts
// ============================================================

#[test]
fn unknown_protocol_is_rejected() {
    match Class::initialize("verbs://localhost:0", true) {
        Err(Error::ProtoNoSupport(p)) => assert_eq!(p, "verbs"),
        other => panic!("unexpected result: {:?}", other.map(|_| ())),
    }
}

#[test]
fn class_reports_identity() {
    let (class, _ctx) = listener();
    assert_eq!(class.class_name(), "tcp");
    assert_eq!(class.protocol(), "tcp");
    assert!(class.is_listening());
}

#[test]
fn context_ids_are_bounded_and_unique() {
    let opts = InitInfo::default().with_max_contexts(2);
    let class = Class::initialize_opt("tcp://localhost:0", true, &opts).unwrap();

    let c0 = class.context_create_id(0).unwrap();
    let _c1 = class.context_create_id(1).unwrap();
    assert!(matches!(class.context_create_id(2), Err(Error::InvalidArg(_))));
    assert!(matches!(class.context_create_id(0), Err(Error::Exist)));

    // The slot opens up again after destroy.
    c0.destroy().unwrap();
    let _c0 = class.context_create_id(0).unwrap();
}

#[test]
fn finalize_refuses_while_contexts_live() {
    let (class, ctx) = listener();
    assert!(matches!(class.clone().finalize(), Err(Error::Busy)));
    ctx.destroy().unwrap();
    class.finalize().unwrap();
}

// ============================================================
// Addresses
// ============================================================

#[test]
fn addr_round_trip_preserves_identity() {
    let (class, _ctx) = listener();
    let self_addr = class.addr_self().unwrap();
    assert!(class.addr_is_self(&self_addr));

    let size = class.addr_serialize(None, &self_addr).unwrap();
    assert!(size > 0);
    let mut bytes = vec![0u8; size];
    class.addr_serialize(Some(&mut bytes), &self_addr).unwrap();

    let back = class.addr_deserialize(&bytes).unwrap();
    assert!(class.addr_cmp(&self_addr, &back));
    assert!(class.addr_is_self(&back));
    assert_eq!(
        class.addr_to_string(&self_addr).unwrap(),
        class.addr_to_string(&back).unwrap()
    );

    // An independent lookup of the same name also compares equal.
    let looked_up = class
        .addr_lookup(&class.addr_to_string(&self_addr).unwrap())
        .unwrap();
    assert!(class.addr_cmp(&self_addr, &looked_up));
}

#[test]
fn addr_serialize_obeys_two_call_sizing() {
    let (class, _ctx) = listener();
    let addr = class.addr_self().unwrap();

    let required = class.addr_serialize(None, &addr).unwrap();
    assert!(required > 1);

    let mut small = vec![0u8; required - 1];
    match class.addr_serialize(Some(&mut small), &addr) {
        Err(Error::Overflow { required: r }) => assert_eq!(r, required),
        other => panic!("expected overflow, got {:?}", other),
    }

    // An exactly-sized buffer is the minimum that succeeds.
    let mut exact = vec![0u8; required];
    assert_eq!(class.addr_serialize(Some(&mut exact), &addr).unwrap(), required);
}

#[test]
fn addr_dup_outlives_original() {
    let (class, _ctx) = listener();
    let addr = class.addr_self().unwrap();
    let copy = class.addr_dup(&addr).unwrap();
    class.addr_free(addr).unwrap();
    assert!(class.addr_is_self(&copy));
}

// ============================================================
// Messages
// ============================================================

#[test]
fn expected_message_exchange() {
    let (server, sctx) = listener();
    let (cli, cctx) = client();
    let server_addr = import_addr(&server, &cli);

    // The server learns the client's identity from an unexpected message.
    let (stx, srx) = result_channel();
    let recv_buf = server.msg_buf_alloc(256).unwrap();
    let rop = server.op_create();
    server
        .msg_recv_unexpected(
            &sctx,
            {
                let stx = stx.clone();
                move |info| {
                    stx.send(info.clone()).unwrap();
                    0
                }
            },
            &recv_buf,
            &rop,
        )
        .unwrap();

    let (ctx_tx, ctx_rx) = result_channel();
    let mut send_buf = cli.msg_buf_alloc(256).unwrap();
    cli.msg_init_unexpected(&mut send_buf).unwrap();
    send_buf.as_mut_slice()[..5].copy_from_slice(b"hello");
    let sop = cli.op_create();
    cli.msg_send_unexpected(
        &cctx,
        move |info| {
            ctx_tx.send(info.clone()).unwrap();
            0
        },
        &send_buf,
        5,
        &server_addr,
        0,
        7,
        &sop,
    )
    .unwrap();

    let mut send_done = None;
    assert!(pump_until(&cli, &cctx, || {
        if send_done.is_none() {
            send_done = ctx_rx.try_recv().ok();
        }
        send_done.is_some()
    }));
    send_done.unwrap().ret.unwrap();

    let mut first = None;
    assert!(pump_until(&server, &sctx, || {
        if first.is_none() {
            first = srx.try_recv().ok();
        }
        first.is_some()
    }));
    let first = first.unwrap();
    first.ret.clone().unwrap();
    let client_addr = match &first.info {
        CbPayload::RecvUnexpected {
            actual_buf_size,
            source,
            tag,
        } => {
            assert_eq!(*actual_buf_size, 5);
            assert_eq!(*tag, 7);
            assert_eq!(&recv_buf.as_slice()[..5], b"hello");
            server.addr_dup(source).unwrap()
        }
        other => panic!("unexpected payload: {:?}", other),
    };

    // Expected exchange: 64 bytes, tag 42, matched by source and tag.
    let (etx, erx) = result_channel();
    let exp_buf = server.msg_buf_alloc(1024).unwrap();
    let eop = server.op_create();
    server
        .msg_recv_expected(
            &sctx,
            move |info| {
                etx.send(info.clone()).unwrap();
                0
            },
            &exp_buf,
            &client_addr,
            cctx.id(),
            42,
            &eop,
        )
        .unwrap();

    let mut payload = cli.msg_buf_alloc(64).unwrap();
    cli.msg_init_expected(&mut payload).unwrap();
    for (i, b) in payload.as_mut_slice().iter_mut().enumerate() {
        *b = i as u8;
    }
    let (ftx, frx) = result_channel();
    let fop = cli.op_create();
    cli.msg_send_expected(
        &cctx,
        move |info| {
            ftx.send(info.clone()).unwrap();
            0
        },
        &payload,
        64,
        &import_addr(&server, &cli),
        sctx.id(),
        42,
        &fop,
    )
    .unwrap();

    assert!(pump_until(&cli, &cctx, || frx.try_recv().is_ok()));

    let mut got = None;
    assert!(pump_until(&server, &sctx, || {
        if got.is_none() {
            got = erx.try_recv().ok();
        }
        got.is_some()
    }));
    let info = got.unwrap();
    info.ret.clone().unwrap();
    match info.info {
        CbPayload::RecvExpected { actual_buf_size } => assert_eq!(actual_buf_size, 64),
        other => panic!("unexpected payload: {:?}", other),
    }
    for (i, b) in exp_buf.as_slice()[..64].iter().enumerate() {
        assert_eq!(*b, i as u8);
    }
}

#[test]
fn unexpected_send_completes_without_receiver() {
    let (server, sctx) = listener();
    let (cli, cctx) = client();
    let server_addr = import_addr(&server, &cli);

    let buf = cli.msg_buf_alloc(32).unwrap();
    let (tx, rx) = result_channel();
    let op = cli.op_create();
    cli.msg_send_unexpected(
        &cctx,
        move |info| {
            tx.send(info.clone()).unwrap();
            0
        },
        &buf,
        32,
        &server_addr,
        0,
        0,
        &op,
    )
    .unwrap();

    // Sender-side completion arrives even though nothing is posted.
    let mut done = None;
    assert!(pump_until(&cli, &cctx, || {
        if done.is_none() {
            done = rx.try_recv().ok();
        }
        done.is_some()
    }));
    done.unwrap().ret.unwrap();

    // The server drains its socket without delivering anything.
    let _ = server.progress(&sctx, 100);
    let mut rets = [0i32; 4];
    assert!(matches!(sctx.trigger(0, &mut rets), Err(Error::Timeout)));
}

#[test]
fn self_send_delivers_locally() {
    let (class, ctx) = listener();
    let self_addr = class.addr_self().unwrap();

    let (rtx, rrx) = result_channel();
    let recv_buf = class.msg_buf_alloc(128).unwrap();
    let rop = class.op_create();
    class
        .msg_recv_unexpected(
            &ctx,
            move |info| {
                rtx.send(info.clone()).unwrap();
                0
            },
            &recv_buf,
            &rop,
        )
        .unwrap();

    let mut send_buf = class.msg_buf_alloc(128).unwrap();
    send_buf.as_mut_slice()[..3].copy_from_slice(b"abc");
    let (stx2, srx2) = result_channel();
    let sop = class.op_create();
    class
        .msg_send_unexpected(
            &ctx,
            move |info| {
                stx2.send(info.clone()).unwrap();
                0
            },
            &send_buf,
            3,
            &self_addr,
            ctx.id(),
            9,
            &sop,
        )
        .unwrap();

    // No transport progress is required for loopback, only trigger.
    let mut rets = [0i32; 4];
    assert_eq!(ctx.trigger(1000, &mut rets).unwrap(), 2);

    srx2.try_recv().unwrap().ret.unwrap();
    let info = rrx.try_recv().unwrap();
    match info.info {
        CbPayload::RecvUnexpected {
            actual_buf_size,
            source,
            tag,
        } => {
            assert_eq!(actual_buf_size, 3);
            assert_eq!(tag, 9);
            assert!(class.addr_is_self(&source));
            assert_eq!(&recv_buf.as_slice()[..3], b"abc");
        }
        other => panic!("unexpected payload: {:?}", other),
    }
}

#[test]
fn oversized_message_is_rejected_at_submit() {
    let (class, ctx) = listener();
    let self_addr = class.addr_self().unwrap();
    let max = class.msg_get_max_unexpected_size();

    let buf = class.msg_buf_alloc(max + 1).unwrap();
    let op = class.op_create();
    match class.msg_send_unexpected(&ctx, |_| 0, &buf, max + 1, &self_addr, 0, 0, &op) {
        Err(Error::MsgSize { size, max: m }) => {
            assert_eq!(size, max + 1);
            assert_eq!(m, max);
        }
        other => panic!("expected MsgSize, got {:?}", other),
    }
    // The failed submit leaves the op reusable.
    assert!(!op.is_in_flight());
}

// ============================================================
// Operation IDs
// ============================================================

#[test]
fn op_id_rejects_concurrent_submissions() {
    let (class, ctx) = listener();
    let buf = class.msg_buf_alloc(64).unwrap();
    let op = class.op_create();

    class.msg_recv_unexpected(&ctx, |_| 0, &buf, &op).unwrap();
    let buf2 = class.msg_buf_alloc(64).unwrap();
    assert!(matches!(
        class.msg_recv_unexpected(&ctx, |_| 0, &buf2, &op),
        Err(Error::Busy)
    ));

    class.cancel(&ctx, &op).unwrap();
    let mut rets = [0i32; 1];
    ctx.trigger(1000, &mut rets).unwrap();
}

#[test]
fn op_id_is_reusable_after_each_completion() {
    let (class, ctx) = listener();
    let self_addr = class.addr_self().unwrap();
    let op = class.op_create();
    let buf = class.msg_buf_alloc(16).unwrap();

    for round in 0..3 {
        let (tx, rx) = result_channel();
        class
            .msg_send_unexpected(
                &ctx,
                move |info| {
                    tx.send(info.clone()).unwrap();
                    0
                },
                &buf,
                16,
                &self_addr,
                0,
                round,
                &op,
            )
            .unwrap();
        let mut rets = [0i32; 4];
        ctx.trigger(1000, &mut rets).unwrap();
        rx.try_recv().unwrap().ret.unwrap();
        assert!(!op.is_in_flight());
    }
}

#[test]
fn cancel_delivers_canceled_completion_exactly_once() {
    let (class, ctx) = listener();
    let buf = class.msg_buf_alloc(64).unwrap();
    let (tx, rx) = result_channel();
    let op = class.op_create();
    class
        .msg_recv_unexpected(
            &ctx,
            move |info| {
                tx.send(info.clone()).unwrap();
                0
            },
            &buf,
            &op,
        )
        .unwrap();

    class.cancel(&ctx, &op).unwrap();
    // Canceling twice is a no-op.
    class.cancel(&ctx, &op).unwrap();

    let mut rets = [0i32; 4];
    assert_eq!(ctx.trigger(1000, &mut rets).unwrap(), 1);
    let info = rx.try_recv().unwrap();
    assert!(matches!(info.ret, Err(Error::Canceled)));
    assert!(rx.try_recv().is_err());
    assert!(!op.is_in_flight());
}

// ============================================================
// Memory handles and one-sided transfers
// ============================================================

#[test]
fn mem_handle_serialize_obeys_two_call_sizing() {
    let (class, _ctx) = listener();
    let backing = vec![0u8; 4096];
    let handle = class
        .mem_handle_create(backing.as_ptr() as u64, backing.len(), MEM_READWRITE)
        .unwrap();

    // Unregistered handles cannot be serialized.
    assert!(class.mem_handle_serialize(None, &handle).is_err());

    class.mem_register(&handle).unwrap();
    let required = class.mem_handle_serialize(None, &handle).unwrap();
    assert!(required > 0);

    let mut small = vec![0u8; required - 1];
    match class.mem_handle_serialize(Some(&mut small), &handle) {
        Err(Error::Overflow { required: r }) => assert_eq!(r, required),
        other => panic!("expected overflow, got {:?}", other),
    }

    let mut exact = vec![0u8; required];
    class.mem_handle_serialize(Some(&mut exact), &handle).unwrap();

    let remote = class.mem_handle_deserialize(&exact).unwrap();
    assert!(remote.is_remote());
    assert!(remote.is_registered());
    assert_eq!(remote.len(), 4096);
    assert_eq!(remote.flags(), MEM_READWRITE);

    class.mem_deregister(&handle).unwrap();
    class.mem_handle_free(handle).unwrap();
}

#[test]
fn mem_register_rejects_bad_states() {
    let (class, _ctx) = listener();
    let backing = vec![0u8; 64];
    let handle = class
        .mem_handle_create(backing.as_ptr() as u64, backing.len(), MEM_READ_ONLY)
        .unwrap();

    class.mem_register(&handle).unwrap();
    assert!(matches!(class.mem_register(&handle), Err(Error::Exist)));
    class.mem_deregister(&handle).unwrap();
    // Deregistering an idle handle is a no-op.
    class.mem_deregister(&handle).unwrap();

    // Device memory requires opting in at initialization.
    class.mem_register(&handle).unwrap();
    let err = class.mem_register_device(&handle, nal::MemType::Cuda, 0);
    assert!(matches!(err, Err(Error::Exist) | Err(Error::OpNotSupported)));
}

#[test]
fn put_and_get_through_registered_regions() {
    let (server, sctx) = listener();
    let (cli, cctx) = client();
    let server_addr = import_addr(&server, &cli);

    // Server exposes a 4096-byte read-write region.
    let target = vec![0u8; 4096];
    let target_handle = server
        .mem_handle_create(target.as_ptr() as u64, target.len(), MEM_READWRITE)
        .unwrap();
    server.mem_register(&target_handle).unwrap();
    let size = server.mem_handle_serialize(None, &target_handle).unwrap();
    let mut handle_bytes = vec![0u8; size];
    server
        .mem_handle_serialize(Some(&mut handle_bytes), &target_handle)
        .unwrap();

    // Client maps it as a remote handle and pushes 1024 bytes at offset 512.
    let remote = cli.mem_handle_deserialize(&handle_bytes).unwrap();
    let mut rng = rand::thread_rng();
    let src: Vec<u8> = (0..1024).map(|_| rng.gen()).collect();
    let src_handle = cli
        .mem_handle_create(src.as_ptr() as u64, src.len(), MEM_READWRITE)
        .unwrap();
    cli.mem_register(&src_handle).unwrap();

    let (ptx, prx) = result_channel();
    let pop = cli.op_create();
    cli.put(
        &cctx,
        move |info| {
            ptx.send(info.clone()).unwrap();
            0
        },
        &src_handle,
        0,
        &remote,
        512,
        1024,
        &server_addr,
        0,
        &pop,
    )
    .unwrap();

    let mut put_done = None;
    assert!(pump_until(&cli, &cctx, || {
        if put_done.is_none() {
            put_done = prx.try_recv().ok();
        }
        put_done.is_some()
    }));
    put_done.unwrap().ret.unwrap();

    // The data lands in the server's backing memory once it progresses.
    assert!(pump_until(&server, &sctx, || target[512..1536] == src[..]));

    // Read the same bytes back through a get into a fresh region.
    let dst = vec![0u8; 1024];
    let dst_handle = cli
        .mem_handle_create(dst.as_ptr() as u64, dst.len(), MEM_READWRITE)
        .unwrap();
    cli.mem_register(&dst_handle).unwrap();

    let (gtx, grx) = result_channel();
    let gop = cli.op_create();
    cli.get(
        &cctx,
        move |info| {
            gtx.send(info.clone()).unwrap();
            0
        },
        &dst_handle,
        0,
        &remote,
        512,
        1024,
        &server_addr,
        0,
        &gop,
    )
    .unwrap();

    // Both sides must progress: the server serves the read, the client
    // completes it.
    let mut get_done = None;
    let deadline = Instant::now() + Duration::from_secs(5);
    while get_done.is_none() && Instant::now() < deadline {
        let _ = server.progress(&sctx, 10);
        let _ = cli.progress(&cctx, 10);
        let mut rets = [0i32; 4];
        let _ = cctx.trigger(0, &mut rets);
        get_done = grx.try_recv().ok();
    }
    get_done.expect("get did not complete").ret.unwrap();
    assert_eq!(&dst[..], &src[..]);
}

#[test]
fn get_fails_cleanly_when_peer_goes_away() {
    let (server, sctx) = listener();
    let (cli, cctx) = client();
    let server_addr = import_addr(&server, &cli);

    // Serialize a server-side region, then take the server down before it
    // can serve anything.
    let target = vec![0u8; 1024];
    let target_handle = server
        .mem_handle_create(target.as_ptr() as u64, target.len(), MEM_READWRITE)
        .unwrap();
    server.mem_register(&target_handle).unwrap();
    let size = server.mem_handle_serialize(None, &target_handle).unwrap();
    let mut handle_bytes = vec![0u8; size];
    server
        .mem_handle_serialize(Some(&mut handle_bytes), &target_handle)
        .unwrap();

    // Establish the connection while the server is still up.
    let hello = cli.msg_buf_alloc(8).unwrap();
    let hop = cli.op_create();
    cli.msg_send_unexpected(&cctx, |_| 0, &hello, 8, &server_addr, 0, 0, &hop)
        .unwrap();
    let mut rets = [0i32; 2];
    cctx.trigger(1000, &mut rets).unwrap();

    server.mem_deregister(&target_handle).unwrap();
    server.mem_handle_free(target_handle).unwrap();
    sctx.destroy().unwrap();
    server.finalize().unwrap();

    // The get rides the now-dead connection; it must still complete,
    // with an unreachable-host status rather than hanging forever.
    let remote = cli.mem_handle_deserialize(&handle_bytes).unwrap();
    let dst = vec![0u8; 1024];
    let dst_handle = cli
        .mem_handle_create(dst.as_ptr() as u64, dst.len(), MEM_READWRITE)
        .unwrap();
    cli.mem_register(&dst_handle).unwrap();

    let (gtx, grx) = result_channel();
    let gop = cli.op_create();
    cli.get(
        &cctx,
        move |info| {
            gtx.send(info.clone()).unwrap();
            0
        },
        &dst_handle,
        0,
        &remote,
        0,
        1024,
        &server_addr,
        0,
        &gop,
    )
    .unwrap();

    let mut done = None;
    assert!(pump_until(&cli, &cctx, || {
        if done.is_none() {
            done = grx.try_recv().ok();
        }
        done.is_some()
    }));
    assert!(matches!(done.unwrap().ret, Err(Error::HostUnreach)));
    assert!(!gop.is_in_flight());
}

#[test]
fn rma_permission_checks_fire_before_submit() {
    let (class, ctx) = listener();
    let self_addr = class.addr_self().unwrap();

    let a = vec![0u8; 256];
    let read_only = class
        .mem_handle_create(a.as_ptr() as u64, a.len(), MEM_READ_ONLY)
        .unwrap();
    class.mem_register(&read_only).unwrap();

    let b = vec![0u8; 256];
    let also_read_only = class
        .mem_handle_create(b.as_ptr() as u64, b.len(), MEM_READ_ONLY)
        .unwrap();
    class.mem_register(&also_read_only).unwrap();

    // put needs a writable remote region.
    let op = class.op_create();
    assert!(matches!(
        class.put(&ctx, |_| 0, &read_only, 0, &also_read_only, 0, 16, &self_addr, 0, &op),
        Err(Error::Permission)
    ));

    // Out-of-bounds ranges are rejected before anything is submitted.
    assert!(class
        .put(&ctx, |_| 0, &read_only, 128, &also_read_only, 0, 256, &self_addr, 0, &op)
        .is_err());
    assert!(!op.is_in_flight());
}

// ============================================================
// Progress and trigger
// ============================================================

#[test]
fn progress_times_out_when_idle() {
    let (class, ctx) = listener();
    let start = Instant::now();
    assert!(matches!(class.progress(&ctx, 50), Err(Error::Timeout)));
    assert!(start.elapsed() >= Duration::from_millis(40));
}

#[test]
fn progress_observes_completions_from_other_threads() {
    let (class, ctx) = listener();
    let self_addr = class.addr_self().unwrap();
    let buf = class.msg_buf_alloc(8).unwrap();
    let op = class.op_create();

    // A loopback send completes inline on the submitting thread; a
    // concurrent blocking progress call must notice it well before its
    // timeout instead of sleeping through it.
    std::thread::scope(|s| {
        let waiter = s.spawn(|| {
            let start = Instant::now();
            (class.progress(&ctx, 5000), start.elapsed())
        });
        std::thread::sleep(Duration::from_millis(150));
        class
            .msg_send_unexpected(&ctx, |_| 0, &buf, 8, &self_addr, ctx.id(), 0, &op)
            .unwrap();
        let (ret, elapsed) = waiter.join().unwrap();
        ret.unwrap();
        assert!(elapsed < Duration::from_secs(3));
    });

    let mut rets = [0i32; 2];
    assert_eq!(ctx.trigger(1000, &mut rets).unwrap(), 1);
}

#[test]
fn trigger_times_out_when_empty() {
    let (_class, ctx) = listener();
    let mut rets = [0i32; 2];
    assert!(matches!(ctx.trigger(10, &mut rets), Err(Error::Timeout)));
    assert_eq!(ctx.trigger(1000, &mut []).unwrap(), 0);
}

#[test]
fn trigger_drains_up_to_ret_capacity() {
    let (class, ctx) = listener();
    let self_addr = class.addr_self().unwrap();
    let buf = class.msg_buf_alloc(8).unwrap();

    let mut ops = Vec::new();
    for i in 0..3 {
        let op = class.op_create();
        class
            .msg_send_unexpected(&ctx, |_| 7, &buf, 8, &self_addr, 0, i, &op)
            .unwrap();
        ops.push(op);
    }

    let mut rets = [0i32; 2];
    assert_eq!(ctx.trigger(1000, &mut rets).unwrap(), 2);
    assert_eq!(rets, [7, 7]);
    assert_eq!(ctx.trigger(1000, &mut rets).unwrap(), 1);
}

// ============================================================
// External backends
// ============================================================

struct NullContext {
    id: u8,
}

impl PluginContext for NullContext {
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn id(&self) -> u8 {
        self.id
    }
}

/// Message-only backend written entirely against the public plugin
/// surface; every submission is resolved inline through
/// [`Submission::complete`].
struct NullBackend;

impl Plugin for NullBackend {
    fn finalize(&self) -> nal::Result<()> {
        Ok(())
    }

    fn context_create(
        &self,
        id: u8,
        _queue: Arc<CompletionQueue>,
    ) -> nal::Result<Box<dyn PluginContext>> {
        Ok(Box::new(NullContext { id }))
    }

    fn context_destroy(&self, _context: Box<dyn PluginContext>) -> nal::Result<()> {
        Ok(())
    }

    fn addr_lookup(&self, _name: &str) -> nal::Result<Addr> {
        Err(Error::OpNotSupported)
    }

    fn addr_self(&self) -> nal::Result<Addr> {
        Err(Error::OpNotSupported)
    }

    fn addr_cmp(&self, _a: &Addr, _b: &Addr) -> bool {
        false
    }

    fn addr_is_self(&self, _addr: &Addr) -> bool {
        false
    }

    fn addr_to_string(&self, _addr: &Addr) -> nal::Result<String> {
        Err(Error::OpNotSupported)
    }

    fn addr_serialize(&self, _buf: &mut [u8], _addr: &Addr) -> nal::Result<()> {
        Ok(())
    }

    fn addr_deserialize(&self, _buf: &[u8]) -> nal::Result<Addr> {
        Err(Error::OpNotSupported)
    }

    fn msg_max_unexpected_size(&self) -> usize {
        1024
    }

    fn msg_max_expected_size(&self) -> usize {
        1024
    }

    fn msg_max_tag(&self) -> Tag {
        Tag::MAX
    }

    fn msg_send_unexpected(
        &self,
        _context: &dyn PluginContext,
        sub: Submission,
        _buf: BufShare,
        _buf_size: usize,
        _dest: &Addr,
        _dest_id: u8,
        _tag: Tag,
    ) -> nal::Result<()> {
        sub.complete(Ok(()), CbPayload::None);
        Ok(())
    }

    fn msg_recv_unexpected(
        &self,
        _context: &dyn PluginContext,
        sub: Submission,
        _buf: BufShare,
    ) -> nal::Result<()> {
        sub.complete(Err(Error::Canceled), CbPayload::None);
        Ok(())
    }

    fn msg_send_expected(
        &self,
        _context: &dyn PluginContext,
        sub: Submission,
        _buf: BufShare,
        _buf_size: usize,
        _dest: &Addr,
        _dest_id: u8,
        _tag: Tag,
    ) -> nal::Result<()> {
        sub.complete(Ok(()), CbPayload::None);
        Ok(())
    }

    fn msg_recv_expected(
        &self,
        _context: &dyn PluginContext,
        sub: Submission,
        _buf: BufShare,
        _source: &Addr,
        _source_id: u8,
        _tag: Tag,
    ) -> nal::Result<()> {
        sub.complete(Err(Error::Canceled), CbPayload::None);
        Ok(())
    }

    fn mem_handle_create(&self, _segments: &[Segment], _flags: u32) -> nal::Result<MemHandle> {
        Err(Error::OpNotSupported)
    }

    fn mem_register(
        &self,
        _handle: &MemHandle,
        _mem_type: MemType,
        _device: u64,
    ) -> nal::Result<()> {
        Err(Error::OpNotSupported)
    }

    fn mem_deregister(&self, _handle: &MemHandle) -> nal::Result<()> {
        Err(Error::OpNotSupported)
    }

    fn mem_handle_serialize(&self, _buf: &mut [u8], _handle: &MemHandle) -> nal::Result<()> {
        Err(Error::OpNotSupported)
    }

    fn mem_handle_deserialize(&self, _buf: &[u8]) -> nal::Result<MemHandle> {
        Err(Error::OpNotSupported)
    }

    fn put(
        &self,
        _context: &dyn PluginContext,
        sub: Submission,
        _local: &MemHandle,
        _local_offset: Offset,
        _remote: &MemHandle,
        _remote_offset: Offset,
        _len: usize,
        _remote_addr: &Addr,
        _remote_id: u8,
    ) -> nal::Result<()> {
        sub.complete(Err(Error::OpNotSupported), CbPayload::None);
        Ok(())
    }

    fn get(
        &self,
        _context: &dyn PluginContext,
        sub: Submission,
        _local: &MemHandle,
        _local_offset: Offset,
        _remote: &MemHandle,
        _remote_offset: Offset,
        _len: usize,
        _remote_addr: &Addr,
        _remote_id: u8,
    ) -> nal::Result<()> {
        sub.complete(Err(Error::OpNotSupported), CbPayload::None);
        Ok(())
    }

    fn progress(&self, _context: &dyn PluginContext, _timeout_ms: u32) -> nal::Result<()> {
        Err(Error::Timeout)
    }

    fn cancel(&self, _context: &dyn PluginContext, _op: &OpId) -> nal::Result<()> {
        Ok(())
    }
}

#[test]
fn plugin_trait_is_implementable_externally() {
    let backend: &dyn Plugin = &NullBackend;
    let ctx = NullContext { id: 0 };

    // Capability defaults hold without overrides.
    assert_eq!(backend.msg_unexpected_header_size(), 0);
    assert_eq!(backend.msg_expected_header_size(), 0);
    assert_eq!(backend.mem_max_segments(), 1);
    assert!(backend.poll_get_fd(&ctx).is_none());
    assert!(backend.poll_try_wait(&ctx));

    // Default buffer allocation is usable as-is.
    let buf = backend.msg_buf_alloc(64).unwrap();
    assert!(buf.capacity() >= 64);
    backend.msg_buf_free(buf).unwrap();

    assert!(matches!(
        backend.addr_lookup("null://peer"),
        Err(Error::OpNotSupported)
    ));
    assert!(matches!(backend.progress(&ctx, 0), Err(Error::Timeout)));
}
