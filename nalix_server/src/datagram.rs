//! UDP packet endpoint.
//!
//! One full packet per datagram: a datagram whose `Length` field does not
//! exactly match the datagram size is dropped without a response, as is
//! anything with an unknown magic or an invalid header. Valid frames are
//! returned to the caller along with the source address; replies go back
//! with `send_to`, compressed above the UDP threshold. Inbound compressed
//! datagrams are inflated before they are handed out.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::UdpSocket;
use tracing::trace;

use nalix_shared::catalog::{Catalog, Transformer};
use nalix_shared::error::ProtocolError;
use nalix_shared::packet::{PacketHeader, RawPacket};

/// Bound UDP socket speaking the framed packet protocol.
pub struct DatagramEndpoint {
    socket: UdpSocket,
    catalog: Arc<Catalog>,
    max_packet_size: usize,
    compression_threshold: usize,
}

impl DatagramEndpoint {
    /// `compression_threshold` follows the UDP tuning range of the server
    /// config (600–1200 bytes).
    pub async fn bind(
        addr: SocketAddr,
        catalog: Arc<Catalog>,
        max_packet_size: usize,
        compression_threshold: usize,
    ) -> Result<Self, ProtocolError> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(DatagramEndpoint {
            socket,
            catalog,
            max_packet_size,
            compression_threshold,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ProtocolError> {
        Ok(self.socket.local_addr()?)
    }

    /// Receives the next valid packet, silently dropping malformed
    /// datagrams along the way.
    pub async fn recv(&self) -> Result<(SocketAddr, RawPacket), ProtocolError> {
        let mut buf = vec![0u8; self.max_packet_size];
        loop {
            let (n, from) = self.socket.recv_from(&mut buf).await?;
            let datagram = &buf[..n];

            let Some(length) = PacketHeader::peek_length(datagram) else {
                continue;
            };
            if length as usize != n {
                trace!(%from, declared = length, actual = n, "dropped datagram with length mismatch");
                continue;
            }
            match self.catalog.try_frame(Bytes::copy_from_slice(datagram)) {
                Some(Ok(mut packet)) => {
                    if packet.is_compressed() {
                        let transformer = self
                            .catalog
                            .transformer_for(packet.header.magic)
                            .unwrap_or(Transformer::STANDARD);
                        if let Err(e) =
                            (transformer.decompress)(&mut packet, self.max_packet_size)
                        {
                            trace!(%from, error = %e, "dropped datagram that failed to inflate");
                            continue;
                        }
                    }
                    return Ok((from, packet));
                }
                Some(Err(e)) => {
                    trace!(%from, error = %e, "dropped malformed datagram");
                }
                None => {
                    trace!(%from, "dropped datagram with unknown magic");
                }
            }
        }
    }

    /// Sends one packet as a single datagram, compressing payloads above
    /// the UDP threshold.
    pub async fn send_to(
        &self,
        packet: &RawPacket,
        addr: SocketAddr,
    ) -> Result<usize, ProtocolError> {
        let mut out = packet.clone();
        if out.payload.len() > self.compression_threshold {
            let transformer = self
                .catalog
                .transformer_for(out.header.magic)
                .unwrap_or(Transformer::STANDARD);
            (transformer.compress)(&mut out)?;
        }
        Ok(self.socket.send_to(&out.encode(), addr).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalix_shared::control::Text256;
    use nalix_shared::packet::{PacketBody, Priority, TransportProtocol};

    async fn pair() -> (DatagramEndpoint, DatagramEndpoint) {
        let catalog = Catalog::with_framework_packets();
        let a = DatagramEndpoint::bind(
            "127.0.0.1:0".parse().unwrap(),
            Arc::clone(&catalog),
            65535,
            900,
        )
        .await
        .unwrap();
        let b = DatagramEndpoint::bind("127.0.0.1:0".parse().unwrap(), catalog, 65535, 900)
            .await
            .unwrap();
        (a, b)
    }

    #[tokio::test]
    async fn roundtrip_one_packet_per_datagram() {
        let (a, b) = pair().await;
        let packet = Text256::new(7, "over udp")
            .unwrap()
            .to_raw(Priority::Normal, TransportProtocol::Udp)
            .unwrap();

        a.send_to(&packet, b.local_addr().unwrap()).await.unwrap();
        let (from, received) = b.recv().await.unwrap();
        assert_eq!(from, a.local_addr().unwrap());
        assert_eq!(Text256::decode(&received).unwrap().content, "over udp");
    }

    #[tokio::test]
    async fn large_payloads_compress_on_the_wire() {
        use nalix_shared::control::Text1024;

        let (a, b) = pair().await;
        let content = "u".repeat(1_000);
        let packet = Text1024::new(3, content.clone())
            .unwrap()
            .to_raw(Priority::Normal, TransportProtocol::Udp)
            .unwrap();

        // Above the 900-byte threshold: travels compressed, arrives plain.
        a.send_to(&packet, b.local_addr().unwrap()).await.unwrap();
        let (_, received) = b.recv().await.unwrap();
        assert!(!received.is_compressed());
        assert_eq!(Text1024::decode(&received).unwrap().content, content);
    }

    #[tokio::test]
    async fn length_mismatch_is_dropped() {
        let (a, b) = pair().await;
        let valid = Text256::new(1, "kept")
            .unwrap()
            .to_raw(Priority::Normal, TransportProtocol::Udp)
            .unwrap();

        // Frame followed by trailing garbage: datagram size no longer
        // matches the declared length.
        let mut bad = valid.encode().to_vec();
        bad.extend_from_slice(b"trailing");
        a.socket
            .send_to(&bad, b.local_addr().unwrap())
            .await
            .unwrap();
        a.send_to(&valid, b.local_addr().unwrap()).await.unwrap();

        let (_, received) = b.recv().await.unwrap();
        assert_eq!(Text256::decode(&received).unwrap().content, "kept");
    }
}
