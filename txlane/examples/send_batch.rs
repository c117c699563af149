//! Zero-copy batched send with completion polling over kernel sockets.
//!
//! Connects to a local TCP sink, registers a header and a payload buffer,
//! issues a batch-held header followed by a flushed payload, then polls the
//! socket's ring until both completions arrive.
//!
//! Run with: `cargo run --example send_batch`

use std::io::Read;
use std::net::TcpListener;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use txlane::{Config, DriverBuilder, MemoryRegion, OsAccelerator, PollMode, SendFlags};

fn main() -> Result<(), txlane::Error> {
    // A plain TCP sink stands in for the remote peer.
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let server_addr = listener.local_addr()?;
    let sink = thread::spawn(move || {
        let (mut conn, _) = listener.accept().unwrap();
        let mut buf = Vec::new();
        conn.read_to_end(&mut buf).unwrap();
        buf
    });

    let driver = DriverBuilder::new(Config::default()).build(Arc::new(OsAccelerator::new()))?;

    let sock = driver.socket()?;
    driver.set_userdata(sock, 0xdeadc0de)?;
    driver.connect(sock, server_addr)?;

    let mut header = *b"hello world\n";
    let mut payload = vec![b'a'; 4096];
    let header_key = driver.register(MemoryRegion {
        ptr: header.as_mut_ptr(),
        len: header.len(),
    })?;
    let payload_key = driver.register(MemoryRegion {
        ptr: payload.as_mut_ptr(),
        len: payload.len(),
    })?;

    driver.send(sock, header_key, 0, header.len() as u32, SendFlags::MORE, 0)?;
    driver.send(sock, payload_key, 0, 32, SendFlags::MORE, 0xdeadbeef)?;
    driver.flush(sock)?;

    let ring = driver.rings_for(sock)?[0];
    let mut seen = 0;
    while seen < 2 {
        for event in driver.poll_completions(ring, PollMode::Blocking(Duration::from_secs(1)))? {
            println!(
                "tx completion: sockdata={:#x} userdata={:#x} len={}",
                event.socket_userdata, event.tag, event.len
            );
            seen += 1;
        }
    }

    driver.close(sock)?;
    driver.deregister(header_key)?;
    driver.deregister(payload_key)?;

    let received = sink.join().unwrap();
    println!("peer received {} bytes", received.len());
    Ok(())
}
