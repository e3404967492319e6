//! Host port selection: bind-tests each candidate to avoid races between two
//! concurrent starts picking the same free-looking port (§5).

use tokio::net::TcpListener;

use crate::error::{OrchestratorError, Result};

const RANGE_START: u16 = 1024;
const RANGE_END: u16 = 65535;

pub async fn find_unused_port() -> Result<u16> {
    for port in RANGE_START..=RANGE_END {
        if TcpListener::bind(("127.0.0.1", port)).await.is_ok() {
            return Ok(port);
        }
    }
    Err(OrchestratorError::ResourceExhausted(
        "no unused host port available".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn finds_a_port_within_the_valid_range() {
        let port = find_unused_port().await.unwrap();
        assert!(port >= RANGE_START);
    }
}
