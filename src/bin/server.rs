//! Echo server demo: accepts sessions on a UDP carrier and writes back
//! whatever each one sends.

use std::io::{Read, Write};
use std::net::SocketAddr;

use rkcp::{Config, Listener};

fn main() {
    env_logger::init();

    let addr: SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "0.0.0.0:9090".to_string())
        .parse()
        .expect("usage: server [bind-addr:port]");

    let config = Config::new().nodelay(true, 10, 2, true).stream(true);
    let listener = Listener::bind(addr, config, None).expect("failed to bind listener");

    println!(">>> listening on {}", listener.local_addr().unwrap());

    loop {
        let mut session = match listener.accept() {
            Ok(session) => session,
            Err(e) => {
                eprintln!(">>> accept failed: {e}");
                continue;
            }
        };

        std::thread::spawn(move || {
            println!(">>> accepted {}", session.peer_addr());
            let mut buf = [0u8; 4096];
            loop {
                let n = match session.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                if session.write_all(&buf[..n]).is_err() {
                    break;
                }
            }
            println!(">>> closed {}", session.peer_addr());
        });
    }
}
