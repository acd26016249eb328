//! Several threads draining one PollQueue, the way the engine's worker
//! pool does.

use fleetio_core::{CompletionQueue, ConnId, ConnectionContext, Event, IoOp, OpKind};
use fleetio_module::{open_queue, Backend, QueueOptions};

use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[test]
fn every_waiter_gets_one_exit() {
    let q: Arc<dyn CompletionQueue> = Arc::from(open_queue(Backend::Poll, &QueueOptions::default()).unwrap());
    let exits = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let q = q.clone();
            let exits = exits.clone();
            thread::spawn(move || loop {
                match q.wait(Some(Duration::from_secs(10))) {
                    Ok(Event::Exit) => {
                        exits.fetch_add(1, Ordering::SeqCst);
                        return;
                    }
                    Ok(Event::Completion(_)) => {}
                    Err(e) => panic!("wait failed: {e}"),
                }
            })
        })
        .collect();

    thread::sleep(Duration::from_millis(50));
    for _ in 0..4 {
        q.post_exit().unwrap();
    }
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(exits.load(Ordering::SeqCst), 4);
}

#[test]
fn receives_are_spread_over_connections() {
    let q: Arc<dyn CompletionQueue> = Arc::from(open_queue(Backend::Poll, &QueueOptions::default()).unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();

    let mut clients = Vec::new();
    for i in 0..8u64 {
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, peer) = listener.accept().unwrap();
        let local = server.local_addr().unwrap();
        let ctx = Arc::new(ConnectionContext::new(ConnId(i + 1), server, peer, local));
        q.associate(&ctx).unwrap();
        q.post_recv(IoOp::recv(ctx.acquire_slot(OpKind::Receive, 32), ctx.clone()))
            .unwrap();
        clients.push((client, ctx));
    }

    for (i, (client, _)) in clients.iter_mut().enumerate() {
        write!(client, "msg-{i}").unwrap();
    }

    let mut seen = Vec::new();
    for _ in 0..clients.len() {
        match q.wait(Some(Duration::from_secs(5))).unwrap() {
            Event::Completion(c) => {
                let n = c.result.unwrap();
                let conn = c.op.conn.as_ref().unwrap().id();
                let body = String::from_utf8(c.op.slot.received(n).to_vec()).unwrap();
                assert_eq!(body, format!("msg-{}", conn.as_u64() - 1));
                seen.push(conn);
            }
            Event::Exit => panic!("unexpected exit"),
        }
    }
    seen.sort();
    seen.dedup();
    assert_eq!(seen.len(), 8);
}
