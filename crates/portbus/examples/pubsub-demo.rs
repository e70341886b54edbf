//! Minimal pub/sub round — one server, two clients, a broadcast and a fan-out.
//!
//! Run with:
//!   cargo run --example pubsub-demo

use std::time::Duration;

use portbus::{Client, ClientEvents, NoEvents, PortNamespace, Server};

struct PrintEvents(&'static str);

impl ClientEvents for PrintEvents {
    fn on_message(&self, payload: &[u8]) {
        eprintln!("{}: got {:?}", self.0, payload);
    }

    fn on_connected(&self) {
        eprintln!("{}: connected", self.0);
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let ns = PortNamespace::new(
        std::env::temp_dir().join(format!("portbus-demo-{}", std::process::id())),
    );

    let server = Server::start(&ns, "demo", NoEvents)?;

    let c1 = Client::new(&ns, PrintEvents("c1"));
    let c2 = Client::new(&ns, PrintEvents("c2"));
    c1.connect("demo")?;
    c2.connect("demo")?;
    assert!(c1.wait_connected(Duration::from_secs(1)));
    assert!(c2.wait_connected(Duration::from_secs(1)));

    // c1's broadcast reaches c2 but not c1 itself.
    c1.send(&[1, 2, 3], true)?;

    // The server's fan-out reaches both.
    let delivered = server.push_to_all(&[9, 9])?;
    eprintln!("server delivered to {delivered} clients");

    std::thread::sleep(Duration::from_millis(200));
    c1.disconnect()?;
    c2.disconnect()?;

    let _ = std::fs::remove_dir_all(ns.root());
    Ok(())
}
