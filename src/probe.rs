//! TCP connect latency probing for share links.

use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use crate::link::{endpoint_of, Endpoint};

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(2500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Latency(Duration),
    Timeout,
    Failed,
}

impl ProbeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ProbeOutcome::Latency(_))
    }

    /// Milliseconds, or `-1` for any kind of failure.
    pub fn as_millis_or_sentinel(&self) -> i64 {
        match self {
            ProbeOutcome::Latency(elapsed) => i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX),
            ProbeOutcome::Timeout | ProbeOutcome::Failed => -1,
        }
    }
}

/// Measures how long a TCP connect to the link's server takes. Never
/// retries and never blocks longer than `timeout`.
pub fn measure(link: &str, timeout: Duration) -> ProbeOutcome {
    let endpoint = match endpoint_of(link) {
        Ok(endpoint) => endpoint,
        Err(error) => {
            tracing::debug!(%error, "probe skipped unparsable link");
            return ProbeOutcome::Failed;
        }
    };
    measure_endpoint(endpoint, timeout)
}

pub fn measure_endpoint(endpoint: Endpoint, timeout: Duration) -> ProbeOutcome {
    let deadline = Instant::now() + timeout;
    let (tx, rx) = mpsc::channel();

    // Resolution can block past any socket timeout, so it runs off-thread too.
    thread::spawn(move || {
        let started = Instant::now();
        let outcome = connect_once(&endpoint, deadline).map(|()| started.elapsed());
        let _ = tx.send(outcome);
    });

    match rx.recv_timeout(timeout) {
        Ok(Some(elapsed)) => ProbeOutcome::Latency(elapsed),
        Ok(None) => {
            if Instant::now() >= deadline {
                ProbeOutcome::Timeout
            } else {
                ProbeOutcome::Failed
            }
        }
        Err(mpsc::RecvTimeoutError::Timeout) => ProbeOutcome::Timeout,
        Err(mpsc::RecvTimeoutError::Disconnected) => ProbeOutcome::Failed,
    }
}

fn connect_once(endpoint: &Endpoint, deadline: Instant) -> Option<()> {
    let addrs: Vec<SocketAddr> = (endpoint.host.as_str(), endpoint.port)
        .to_socket_addrs()
        .ok()?
        .collect();
    for addr in addrs {
        let remaining = deadline.checked_duration_since(Instant::now())?;
        if remaining.is_zero() {
            return None;
        }
        if TcpStream::connect_timeout(&addr, remaining).is_ok() {
            return Some(());
        }
    }
    None
}

/// Probes every link in parallel. Results keep the input order.
pub fn measure_all<S: AsRef<str>>(links: &[S], timeout: Duration) -> Vec<ProbeOutcome> {
    thread::scope(|scope| {
        let handles: Vec<_> = links
            .iter()
            .map(|link| {
                let link = link.as_ref();
                scope.spawn(move || measure(link, timeout))
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap_or(ProbeOutcome::Failed))
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn sentinel_only_for_failures() {
        assert_eq!(
            ProbeOutcome::Latency(Duration::from_millis(42)).as_millis_or_sentinel(),
            42
        );
        assert_eq!(ProbeOutcome::Timeout.as_millis_or_sentinel(), -1);
        assert_eq!(ProbeOutcome::Failed.as_millis_or_sentinel(), -1);
    }

    #[test]
    fn unparsable_link_fails_fast() {
        let started = Instant::now();
        assert_eq!(measure("not a link", DEFAULT_PROBE_TIMEOUT), ProbeOutcome::Failed);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn local_listener_reports_latency() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let link = format!("trojan://pw@127.0.0.1:{port}#local");
        let outcome = measure(&link, Duration::from_secs(2));
        assert!(outcome.is_success(), "{outcome:?}");
        assert!(outcome.as_millis_or_sentinel() >= 0);
    }

    #[test]
    fn closed_port_fails_within_bound() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let link = format!("trojan://pw@127.0.0.1:{port}");
        let timeout = Duration::from_millis(500);
        let started = Instant::now();
        let outcome = measure(&link, timeout);
        assert!(!outcome.is_success());
        assert!(started.elapsed() < timeout + Duration::from_millis(250));
    }

    #[test]
    fn exhausted_budget_is_a_timeout() {
        // Even a listening server cannot be reached once the deadline passed.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let endpoint = Endpoint {
            host: "127.0.0.1".to_string(),
            port: listener.local_addr().unwrap().port(),
        };
        let started = Instant::now();
        let outcome = measure_endpoint(endpoint, Duration::ZERO);
        assert_eq!(outcome, ProbeOutcome::Timeout);
        assert_eq!(outcome.as_millis_or_sentinel(), -1);
        assert!(!outcome.is_success());
        assert!(started.elapsed() < Duration::from_millis(250));
    }

    #[test]
    fn measure_all_keeps_order() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let links = vec![
            "bogus".to_string(),
            format!("trojan://pw@127.0.0.1:{port}"),
        ];
        let outcomes = measure_all(&links, Duration::from_secs(2));
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0], ProbeOutcome::Failed);
        assert!(outcomes[1].is_success());
    }
}
