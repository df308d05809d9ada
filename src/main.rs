//! Minimal loopback smoketest: dials a session against a listener bound on
//! the same process and prints what round-trips.

use std::io::{Read, Write};
use std::net::SocketAddr;

use rkcp::{Config, Listener, Session};

fn main() {
    env_logger::init();

    let config = Config::new().nodelay(true, 10, 2, true).stream(true);
    let listener = Listener::bind("127.0.0.1:0".parse().unwrap(), config.clone(), None).unwrap();
    let addr = listener.local_addr().unwrap();

    let server = std::thread::spawn(move || {
        let mut session = listener.accept().unwrap();
        let mut buf = [0u8; 1500];
        let n = session.read(&mut buf).unwrap();
        session.write_all(&buf[..n]).unwrap();
    });

    let peer = SocketAddr::new(addr.ip, addr.port);
    let mut client = Session::dial(peer, config, None).unwrap();
    client.write_all(b"hello over kcp").unwrap();

    let mut buf = [0u8; 1500];
    let n = client.read(&mut buf).unwrap();
    println!("{:?}", String::from_utf8_lossy(&buf[..n]));

    server.join().unwrap();
}
