//! Detecting when the runtime is ready to serve.
//!
//! The runtime offers no handshake. Its stdout is scanned for a known phrase,
//! and the runtime port can be probed over loopback instead.

use std::net::Ipv4Addr;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::trace;

use super::output::strip_ansi;

/// Phrases the runtime prints once it accepts requests.
pub const READINESS_PHRASES: [&str; 3] = ["Ready on", "Listening on", "Local server ready"];

pub fn is_ready_line(line: &str) -> bool {
    let plain = strip_ansi(line);
    READINESS_PHRASES.iter().any(|phrase| plain.contains(phrase))
}

/// Resolves once a TCP connection to `127.0.0.1:port` succeeds.
pub async fn wait_for_port(port: u16, interval: Duration) {
    loop {
        match TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await {
            Ok(_) => return,
            Err(err) => trace!(port, error = %err, "runtime port not accepting yet"),
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn matches_known_phrases() {
        assert!(is_ready_line("[wrangler:inf] Ready on http://127.0.0.1:8788"));
        assert!(is_ready_line("Listening on 127.0.0.1:8788"));
        assert!(is_ready_line("⎔ Local server ready"));
        assert!(is_ready_line("\u{1b}[32m[wrangler:inf]\u{1b}[0m Ready on http://127.0.0.1:8788"));
    }

    #[test]
    fn ignores_other_output() {
        assert!(!is_ready_line("⎔ Starting local server..."));
        assert!(!is_ready_line("Reloading local server..."));
        assert!(!is_ready_line("ready on"));
    }

    #[tokio::test]
    async fn probe_resolves_once_port_listens() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::time::timeout(Duration::from_secs(5), wait_for_port(port, Duration::from_millis(10)))
            .await
            .expect("probe should see the listener");
    }
}
