use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use flux_reactor::{Address, EventLoop, TcpClient, TcpServer};

fn loopback_any() -> Address {
    Address::new(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0))
}

/// A server that echoes whatever it reads, and a client that sends one
/// message on connect: end to end, the client should see its own bytes
/// come back.
#[test]
fn client_receives_its_own_message_echoed_back() {
    let (addr_tx, addr_rx) = mpsc::channel();
    let (server_quit_tx, server_quit_rx) = mpsc::channel::<()>();

    let server_thread = thread::spawn(move || {
        let event_loop = EventLoop::new().expect("server event loop");
        let handle = event_loop.handle();

        let mut server = TcpServer::new(handle.clone(), loopback_any(), "echo-server");
        server.set_message_callback(|conn, buf, _received_at| {
            let echoed = buf.retrieve_as_vec(buf.readable_bytes());
            conn.send(&echoed);
        });
        server.start().expect("server start");
        addr_tx.send(server.local_addr()).unwrap();

        let stop_handle = handle.clone();
        thread::spawn(move || {
            server_quit_rx.recv().ok();
            stop_handle.quit();
        });

        event_loop.run();
    });

    let server_addr = addr_rx.recv().expect("server never published its address");

    let received: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
    let received_for_cb = received.clone();
    let (got_it_tx, got_it_rx) = mpsc::channel::<()>();

    let client_thread = thread::spawn(move || {
        let event_loop = EventLoop::new().expect("client event loop");
        let handle = event_loop.handle();

        let client = TcpClient::new(handle.clone(), server_addr, "echo-client");
        client.set_connection_callback(|conn| {
            if conn.connected() {
                conn.send(b"ping");
            }
        });
        let got_it_tx_for_cb = got_it_tx.clone();
        client.set_message_callback(move |_conn, buf, _received_at| {
            received_for_cb.lock().unwrap().extend_from_slice(buf.peek());
            buf.retrieve_all();
            got_it_tx_for_cb.send(()).ok();
        });
        client.connect();

        let stop_handle = handle.clone();
        thread::spawn(move || {
            got_it_rx.recv_timeout(Duration::from_secs(5)).ok();
            stop_handle.quit();
        });

        event_loop.run();
        // Keep the client (and its connection) alive until the loop has
        // fully stopped so `Drop` doesn't race the loop's own teardown.
        client
    });

    let _client = client_thread.join().expect("client thread panicked");
    server_quit_tx.send(()).unwrap();
    server_thread.join().expect("server thread panicked");

    assert_eq!(&received.lock().unwrap()[..], b"ping");
}

/// With retry enabled, a `TcpClient` whose connection is severed by the
/// server reconnects on its own and the new connection works end to end.
#[test]
fn client_reconnects_after_server_closes_connection() {
    let (addr_tx, addr_rx) = mpsc::channel();
    let (server_quit_tx, server_quit_rx) = mpsc::channel::<()>();
    let accept_count = Arc::new(Mutex::new(0u32));
    let accept_count_for_server = accept_count.clone();

    let server_thread = thread::spawn(move || {
        let event_loop = EventLoop::new().expect("server event loop");
        let handle = event_loop.handle();

        let mut server = TcpServer::new(handle.clone(), loopback_any(), "flaky-server");
        server.set_connection_callback(move |conn| {
            if conn.connected() {
                let mut n = accept_count_for_server.lock().unwrap();
                *n += 1;
                // Drop the first connection immediately; keep the second.
                if *n == 1 {
                    conn.force_close();
                }
            }
        });
        server.start().expect("server start");
        addr_tx.send(server.local_addr()).unwrap();

        let stop_handle = handle.clone();
        thread::spawn(move || {
            server_quit_rx.recv().ok();
            stop_handle.quit();
        });

        event_loop.run();
    });

    let server_addr = addr_rx.recv().expect("server never published its address");

    let client_thread = thread::spawn(move || {
        let event_loop = EventLoop::new().expect("client event loop");
        let handle = event_loop.handle();

        let client = TcpClient::new(handle.clone(), server_addr, "flaky-client");
        client.enable_retry(true);
        client.connect();

        // Retry backoff starts at 500ms; give it a few rounds to land a
        // second, lasting connection.
        let stop_handle = handle.clone();
        handle.run_after(Duration::from_secs(3), move || stop_handle.quit());

        event_loop.run();
        client
    });

    let client = client_thread.join().expect("client thread panicked");
    server_quit_tx.send(()).unwrap();
    server_thread.join().expect("server thread panicked");

    assert!(*accept_count.lock().unwrap() >= 2, "server should have accepted at least two attempts");
    drop(client);
}
