//! Position source implementations

use crate::location::provider::{Position, PositionRequest, PositionSource};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

/// gpsd JSON watch command
const WATCH_COMMAND: &[u8] = b"?WATCH={\"enable\":true,\"json\":true}\n";

/// Subset of a gpsd report we care about
#[derive(Deserialize, Debug)]
struct GpsdReport {
    class: String,
    #[serde(default)]
    mode: u8,
    lat: Option<f64>,
    lon: Option<f64>,
}

impl GpsdReport {
    /// Position of a TPV report carrying a 2D or 3D fix
    fn fix(&self) -> Option<Position> {
        if self.class != "TPV" || self.mode < 2 {
            return None;
        }
        Some(Position {
            latitude: self.lat?,
            longitude: self.lon?,
        })
    }
}

/// Reads fixes from a gpsd daemon over TCP
pub struct GpsdSource {
    address: String,
}

impl GpsdSource {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

#[async_trait]
impl PositionSource for GpsdSource {
    /// gpsd streams live reports, so every request gets a fresh fix
    async fn position(&self, _request: &PositionRequest) -> Result<Position> {
        let mut stream = TcpStream::connect(&self.address).await?;
        stream.write_all(WATCH_COMMAND).await?;

        let mut lines = BufReader::new(stream).lines();
        while let Some(line) = lines.next_line().await? {
            let report: GpsdReport = match serde_json::from_str(&line) {
                Ok(report) => report,
                Err(e) => {
                    debug!("[GEO] Skipping gpsd line: {}", e);
                    continue;
                }
            };
            if let Some(pos) = report.fix() {
                return Ok(pos);
            }
        }

        Err(anyhow!("gpsd at {} closed before reporting a fix", self.address))
    }

    fn name(&self) -> &'static str {
        "gpsd"
    }
}

/// A configured static coordinate
pub struct FixedSource {
    position: Position,
}

impl FixedSource {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            position: Position {
                latitude,
                longitude,
            },
        }
    }
}

#[async_trait]
impl PositionSource for FixedSource {
    async fn position(&self, _request: &PositionRequest) -> Result<Position> {
        Ok(self.position)
    }

    fn name(&self) -> &'static str {
        "Fixed"
    }
}

/// No positioning hardware available
pub struct UnavailableSource;

#[async_trait]
impl PositionSource for UnavailableSource {
    async fn position(&self, _request: &PositionRequest) -> Result<Position> {
        Err(anyhow!("Geolocation is not supported on this host"))
    }

    fn name(&self) -> &'static str {
        "Unavailable"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn request() -> PositionRequest {
        PositionRequest {
            high_accuracy: true,
            max_age: Duration::ZERO,
        }
    }

    /// Serve `lines` to the first client after it sends the watch command
    async fn fake_gpsd(lines: &'static [&'static str]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; WATCH_COMMAND.len()];
            socket.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf, WATCH_COMMAND);
            for line in lines {
                socket.write_all(line.as_bytes()).await.unwrap();
                socket.write_all(b"\n").await.unwrap();
            }
        });
        addr
    }

    #[test]
    fn test_report_without_fix() {
        let report: GpsdReport =
            serde_json::from_str(r#"{"class":"TPV","mode":1,"lat":1.0,"lon":2.0}"#).unwrap();
        assert!(report.fix().is_none());

        let report: GpsdReport = serde_json::from_str(r#"{"class":"SKY","mode":3}"#).unwrap();
        assert!(report.fix().is_none());
    }

    #[tokio::test]
    async fn test_gpsd_first_fix() {
        let addr = fake_gpsd(&[
            r#"{"class":"VERSION","release":"3.25"}"#,
            r#"{"class":"TPV","mode":1}"#,
            "not json",
            r#"{"class":"TPV","mode":3,"lat":37.5665,"lon":126.978,"alt":38.0}"#,
        ])
        .await;

        let pos = GpsdSource::new(addr).position(&request()).await.unwrap();
        assert_eq!(pos.latitude, 37.5665);
        assert_eq!(pos.longitude, 126.978);
    }

    #[tokio::test]
    async fn test_gpsd_closes_without_fix() {
        let addr = fake_gpsd(&[r#"{"class":"TPV","mode":1}"#]).await;
        assert!(GpsdSource::new(addr).position(&request()).await.is_err());
    }

    #[tokio::test]
    async fn test_unavailable_source() {
        assert!(UnavailableSource.position(&request()).await.is_err());
    }
}
