use std::{io::ErrorKind, time::Duration};

use tokio::net::TcpListener;

/// Reports whether something on this host is currently bound to `port`.
///
/// Binds a throwaway listener on `127.0.0.1:port` and drops it right away.
/// Fails open: any bind error other than "address in use", and a probe that
/// does not answer within `timeout`, are reported as "not in use".
pub async fn is_port_in_use(port: u16, timeout: Duration) -> bool {
    let probe = async {
        match TcpListener::bind(("127.0.0.1", port)).await {
            Ok(listener) => {
                drop(listener);
                false
            }
            Err(e) if e.kind() == ErrorKind::AddrInUse => true,
            Err(e) => {
                tracing::debug!(port, error = %e, "port probe bind failed; treating port as free");
                false
            }
        }
    };

    match tokio::time::timeout(timeout, probe).await {
        Ok(in_use) => in_use,
        Err(_) => {
            tracing::warn!(
                port,
                timeout_ms = timeout.as_millis() as u64,
                "port probe did not answer in time; treating port as free"
            );
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reports_bound_port_as_in_use() {
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();

        assert!(is_port_in_use(port, Duration::from_secs(2)).await);

        drop(listener);
        assert!(!is_port_in_use(port, Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn free_port_answers_within_timeout() {
        let port = {
            let l = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
            l.local_addr().unwrap().port()
        };
        let timeout = Duration::from_millis(500);
        let started = tokio::time::Instant::now();
        assert!(!is_port_in_use(port, timeout).await);
        assert!(started.elapsed() <= timeout + Duration::from_millis(250));
    }
}
