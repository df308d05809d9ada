//! Echo client demo: dials a session, writes each line of stdin, and prints
//! whatever comes back.

use std::io::{self, BufRead, Read, Write};
use std::net::SocketAddr;

use rkcp::{Config, Session};

fn main() {
    env_logger::init();

    let addr: SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:9090".to_string())
        .parse()
        .expect("usage: client [server-addr:port]");

    let config = Config::new().nodelay(true, 10, 2, true).stream(true);
    let mut session = Session::dial(addr, config, None).expect("failed to dial");
    println!(">>> connected to {}", session.peer_addr());

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line.expect("failed to read stdin");
        if session.write_all(line.as_bytes()).is_err() {
            break;
        }

        let mut buf = [0u8; 4096];
        let n = match session.read(&mut buf) {
            Ok(n) => n,
            Err(e) => {
                eprintln!(">>> read failed: {e}");
                break;
            }
        };
        println!(">>> echo: {}", String::from_utf8_lossy(&buf[..n]));
    }
}
